//! Wiring: builds every component from a [`Config`] and hands each one the
//! shared handles it needs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::json;

use crate::access::AccessRegistry;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::ReporterError;
use crate::coordinator::AccessCoordinator;
use crate::ledger::{ForensicSink, SequencerLedger};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::record::{ChainCursor, Identity, Role};
use crate::reliability::GuardianGate;
use crate::reporter::Reporter;
use crate::verify::{AssetSource, InvariantMonitor};

pub const GATE_ID: &str = "guardian-gate";
pub const COORDINATOR_ID: &str = "access-coordinator";
pub const MONITOR_ID: &str = "invariant-monitor";

pub struct Sentinel {
    pub registry: Arc<AccessRegistry>,
    pub ledger: Arc<SequencerLedger>,
    pub gate: Arc<GuardianGate>,
    pub coordinator: Arc<AccessCoordinator>,
    pub monitor: InvariantMonitor,
    pub chain: Arc<ChainCursor>,
    pub clock: Arc<dyn Clock>,
    key: Vec<u8>,
    // One reporter per source: two nonce counters for one source collide.
    wired: Mutex<HashSet<Identity>>,
}

impl Sentinel {
    pub fn bootstrap(
        cfg: &Config,
        admin: Identity,
        clock: Arc<dyn Clock>,
        assets: Arc<dyn AssetSource>,
    ) -> Result<Self> {
        let registry = Arc::new(AccessRegistry::new(admin.clone()));
        let ledger = Arc::new(match &cfg.ledger_path {
            Some(path) => {
                SequencerLedger::open(path, registry.clone(), clock.clone(), cfg.cooldown_secs)
                    .with_context(|| format!("open ledger at {}", path))?
            }
            None => SequencerLedger::in_memory(registry.clone(), clock.clone(), cfg.cooldown_secs),
        });
        let sink: Arc<dyn ForensicSink> = ledger.clone();
        let key = cfg.correlation_key.as_bytes().to_vec();
        let chain = Arc::new(ChainCursor::new(cfg.chain_id));

        let gate = Arc::new(GuardianGate::new(
            registry.clone(),
            Reporter::connected(Identity::from(GATE_ID), &key, clock.clone(), sink.clone()),
            chain.clone(),
            clock.clone(),
            cfg.guardian_threshold,
            cfg.min_dwell_secs,
        ));
        let coordinator = Arc::new(AccessCoordinator::new(
            registry.clone(),
            gate.clone(),
            Reporter::connected(Identity::from(COORDINATOR_ID), &key, clock.clone(), sink.clone()),
            chain.clone(),
        ));

        let monitor_id = Identity::from(MONITOR_ID);
        registry
            .grant(&admin, Role::sentinel(), monitor_id.clone())
            .context("grant sentinel role to invariant monitor")?;
        let monitor = InvariantMonitor::new(
            monitor_id.clone(),
            coordinator.clone(),
            assets,
            Reporter::connected(monitor_id, &key, clock.clone(), sink),
            chain.clone(),
            clock.clone(),
            cfg.invariant_interval_secs,
        );

        log(
            Level::Info,
            Domain::System,
            "bootstrap",
            obj(&[
                ("admin", v_str(admin.as_str())),
                ("threshold", json!(cfg.guardian_threshold)),
                ("min_dwell_secs", json!(cfg.min_dwell_secs)),
                ("cooldown_secs", json!(cfg.cooldown_secs)),
                ("records", json!(ledger.get_record_count())),
                ("durable", json!(cfg.ledger_path.is_some())),
            ]),
        );
        gate.announce();

        Ok(Self {
            registry,
            ledger,
            gate,
            coordinator,
            monitor,
            chain,
            clock,
            key,
            wired: Mutex::new(
                [GATE_ID, COORDINATOR_ID, MONITOR_ID]
                    .into_iter()
                    .map(Identity::from)
                    .collect(),
            ),
        })
    }

    /// Reporter for a collaborator module, already wired to the ledger.
    /// Each source gets at most one; share it behind an `Arc`.
    pub fn reporter_for(&self, source: Identity) -> Result<Reporter, ReporterError> {
        let mut wired = self.wired.lock().unwrap_or_else(|p| p.into_inner());
        if !wired.insert(source.clone()) {
            return Err(ReporterError::SourceInUse(source));
        }
        Ok(Reporter::connected(source, &self.key, self.clock.clone(), self.ledger.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    struct Flat;

    impl AssetSource for Flat {
        fn total_liability(&self) -> u128 {
            100
        }
        fn total_collateral_value(&self) -> u128 {
            100
        }
    }

    #[test]
    fn test_bootstrap_announces_gate() {
        let s = Sentinel::bootstrap(
            &Config::default(),
            Identity::from("admin"),
            Arc::new(ManualClock::new(1)),
            Arc::new(Flat),
        )
        .unwrap();
        assert_eq!(s.ledger.get_record_count(), 1);
        let rec = s.ledger.get_record(1).unwrap();
        assert_eq!(rec.source.as_str(), GATE_ID);
        assert_eq!(rec.risk_score, 0);
        assert!(s.registry.has_role(&Role::sentinel(), s.monitor.identity()));
        assert_eq!(s.monitor.health_ratio_bps(), 10_000);
    }

    #[test]
    fn test_reporter_for_refuses_wired_sources() {
        let s = Sentinel::bootstrap(
            &Config::default(),
            Identity::from("admin"),
            Arc::new(ManualClock::new(1)),
            Arc::new(Flat),
        )
        .unwrap();
        assert_eq!(
            s.reporter_for(Identity::from(GATE_ID)).err(),
            Some(ReporterError::SourceInUse(Identity::from(GATE_ID)))
        );
        assert!(s.reporter_for(Identity::from("treasury")).is_ok());
        assert!(s.reporter_for(Identity::from("treasury")).is_err());
    }
}
