//! Command replay driver.
//!
//! Reads one JSON command per line from stdin, applies it to a freshly
//! bootstrapped [`Sentinel`] and prints one JSON result per line. Time only
//! moves on `advance`, so a transcript replays identically.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use sentinelguard::clock::{Clock, ManualClock, SystemClock};
use sentinelguard::config::Config;
use sentinelguard::logging::{log, obj, v_str, Domain, Level};
use sentinelguard::record::{Identity, Role, SectorId, Severity};
use sentinelguard::reporter::{Report, Reporter};
use sentinelguard::sentinel::Sentinel;
use sentinelguard::verify::AssetSource;

// Amounts arrive as u64: internally tagged enums buffer through serde's
// content model, which has no 128-bit integers.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Command {
    Grant { caller: Identity, role: Role, account: Identity },
    Revoke { caller: Identity, role: Role, account: Identity },
    BindSector { caller: Identity, role: Role, sector: SectorId },
    Sector { caller: Identity, sector: SectorId, active: bool },
    Allowed { role: Role, account: Identity },
    Vote { guardian: Identity },
    Pause { caller: Identity, reason: String },
    Unhalt { caller: Identity },
    Lockdown { caller: Identity },
    Release { caller: Identity },
    Report {
        source: Identity,
        actor: Identity,
        severity: Severity,
        category: String,
        details: String,
        #[serde(default)]
        risk: u8,
        #[serde(default)]
        value: u64,
    },
    Logging { caller: Identity, active: bool },
    Assets { liability: u64, collateral: u64 },
    Solvency {
        liability: Option<u64>,
        collateral: Option<u64>,
    },
    Supply { expected: u64 },
    Advance { secs: u64 },
    Checkpoint { block_height: u64, checkpoint: String },
    Record { sequence_id: u64 },
    Status,
    Verify,
}

/// Balances fed in by `assets` commands.
#[derive(Default)]
struct AssetBook {
    totals: Mutex<(u128, u128)>,
}

impl AssetBook {
    fn set(&self, liability: u128, collateral: u128) {
        *self.totals.lock().unwrap_or_else(|p| p.into_inner()) = (liability, collateral);
    }
}

impl AssetSource for AssetBook {
    fn total_liability(&self) -> u128 {
        self.totals.lock().unwrap_or_else(|p| p.into_inner()).0
    }

    fn total_collateral_value(&self) -> u128 {
        self.totals.lock().unwrap_or_else(|p| p.into_inner()).1
    }
}

struct Driver {
    sentinel: Sentinel,
    clock: Arc<ManualClock>,
    assets: Arc<AssetBook>,
    reporters: HashMap<Identity, Reporter>,
}

fn outcome<T, E: std::fmt::Display>(result: Result<T, E>, ok: impl FnOnce(T) -> Value) -> Value {
    match result {
        Ok(v) => json!({ "ok": true, "result": ok(v) }),
        Err(err) => json!({ "ok": false, "error": err.to_string() }),
    }
}

fn parse_checkpoint(raw: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(raw.trim_start_matches("0x")).context("checkpoint is not hex")?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("checkpoint must be 32 bytes, got {}", b.len()))
}

impl Driver {
    fn apply(&mut self, cmd: Command) -> Value {
        let s = &self.sentinel;
        match cmd {
            Command::Grant { caller, role, account } => {
                outcome(s.registry.grant(&caller, role, account), |_| Value::Null)
            }
            Command::Revoke { caller, role, account } => {
                outcome(s.registry.revoke(&caller, &role, &account), |_| Value::Null)
            }
            Command::BindSector { caller, role, sector } => {
                outcome(s.coordinator.bind_role_sector(&caller, role, sector), |_| Value::Null)
            }
            Command::Sector { caller, sector, active } => {
                outcome(s.coordinator.set_sector_status(&caller, sector, active), |_| Value::Null)
            }
            Command::Allowed { role, account } => {
                json!({ "ok": true, "result": s.coordinator.is_operation_allowed(&role, &account) })
            }
            Command::Vote { guardian } => {
                let votes = s.coordinator.cast_guardian_vote(&guardian);
                outcome(votes, |n| json!({ "active_votes": n }))
            }
            Command::Pause { caller, reason } => {
                outcome(s.coordinator.trigger_emergency_pause(&caller, &reason), |_| Value::Null)
            }
            Command::Unhalt { caller } => outcome(s.coordinator.unhalt(&caller), |_| Value::Null),
            Command::Lockdown { caller } => {
                outcome(s.coordinator.trigger_global_lockdown(&caller), |_| Value::Null)
            }
            Command::Release { caller } => {
                outcome(s.coordinator.release_global_lockdown(&caller), |_| Value::Null)
            }
            Command::Report { source, actor, severity, category, details, risk, value } => {
                if !self.reporters.contains_key(&source) {
                    match s.reporter_for(source.clone()) {
                        Ok(r) => {
                            self.reporters.insert(source.clone(), r);
                        }
                        Err(err) => return json!({ "ok": false, "error": err.to_string() }),
                    }
                }
                let Some(reporter) = self.reporters.get(&source) else {
                    return json!({ "ok": false, "error": "reporter unavailable" });
                };
                let ctx = s.chain.context_for(&actor).with_value(value.into());
                let report = Report::new(severity, category, details).risk(risk);
                let seq = reporter.report(&ctx, report);
                json!({ "ok": seq.is_some(), "result": { "sequence_id": seq } })
            }
            Command::Logging { caller, active } => {
                outcome(s.ledger.set_logging_active(&caller, active), |_| Value::Null)
            }
            Command::Assets { liability, collateral } => {
                self.assets.set(liability.into(), collateral.into());
                let bps = s.monitor.health_ratio_bps().to_string();
                json!({ "ok": true, "result": { "health_ratio_bps": bps } })
            }
            Command::Solvency { liability, collateral } => {
                let result = match (liability, collateral) {
                    (Some(l), Some(c)) => s.monitor.check_solvency(l.into(), c.into()),
                    _ => s.monitor.check_solvency_now(),
                };
                let mut out = outcome(result, |_| Value::Null);
                out["halted"] = json!(s.coordinator.is_halted());
                out
            }
            Command::Supply { expected } => {
                outcome(s.monitor.check_supply_integrity(expected.into()), |_| Value::Null)
            }
            Command::Advance { secs } => {
                json!({ "ok": true, "result": { "now": self.clock.advance(secs) } })
            }
            Command::Checkpoint { block_height, checkpoint } => {
                outcome(parse_checkpoint(&checkpoint), |cp| {
                    s.chain.advance(block_height, cp);
                    json!({ "block_height": block_height })
                })
            }
            Command::Record { sequence_id } => match s.ledger.get_entry(sequence_id) {
                Some(entry) => json!({ "ok": true, "result": entry }),
                None => json!({ "ok": false, "error": format!("no record {}", sequence_id) }),
            },
            Command::Status => {
                let halt = s.gate.halt_state();
                json!({ "ok": true, "result": {
                    "state": s.coordinator.state().as_str(),
                    "halted_at": halt.halted_at,
                    "ready_at": halt.ready_at(),
                    "reason": halt.reason,
                    "active_votes": s.gate.active_votes(),
                    "records": s.ledger.get_record_count(),
                    "head_hash": s.ledger.head_hash(),
                    "logging_active": s.ledger.is_active(),
                    "now": self.clock.now(),
                }})
            }
            Command::Verify => {
                let broken = s.ledger.verify_chain();
                json!({ "ok": broken.is_none(), "result": { "broken_at": broken } })
            }
        }
    }
}

fn main() -> Result<()> {
    let cfg = Config::from_env();
    let admin = std::env::var("SENTINEL_ADMIN").unwrap_or_else(|_| "admin".to_string());
    let admin = Identity::new(admin);
    let start = std::env::var("CLOCK_START")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| SystemClock.now());
    let clock = Arc::new(ManualClock::new(start));
    let assets = Arc::new(AssetBook::default());
    let sentinel = Sentinel::bootstrap(&cfg, admin, clock.clone(), assets.clone())?;

    let mut driver = Driver {
        sentinel,
        clock,
        assets,
        reporters: HashMap::new(),
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut applied = 0u64;
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let cmd: Command = match serde_json::from_str(&line) {
            Ok(cmd) => cmd,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::System,
                    "bad_command",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                let reply = json!({ "ok": false, "error": format!("bad command: {}", err) });
                writeln!(out, "{}", reply)?;
                continue;
            }
        };
        let result = driver.apply(cmd);
        writeln!(out, "{}", result)?;
        applied += 1;
    }

    log(
        Level::Info,
        Domain::System,
        "replay_done",
        obj(&[
            ("commands", json!(applied)),
            ("records", json!(driver.sentinel.ledger.get_record_count())),
        ]),
    );
    Ok(())
}
