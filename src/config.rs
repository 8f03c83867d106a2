use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct Config {
    /// Distinct guardian votes needed to halt.
    pub guardian_threshold: u32,
    /// Minimum seconds a halt must persist before an auditor may lift it.
    pub min_dwell_secs: u64,
    /// Per-caller cooldown for non-critical submissions.
    pub cooldown_secs: u64,
    /// SQLite file backing the ledger; `None` keeps records in memory.
    pub ledger_path: Option<String>,
    pub correlation_key: String,
    pub chain_id: u64,
    pub invariant_interval_secs: u64,
    pub notary_cursor: String,
    pub notary_snapshot_dir: String,
    pub notary_batch: u64,
    pub notary_tag: String,
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn string_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            guardian_threshold: parsed_or("GUARDIAN_THRESHOLD", d.guardian_threshold).max(1),
            min_dwell_secs: parsed_or("MIN_DWELL_SECS", d.min_dwell_secs),
            cooldown_secs: parsed_or("LOG_COOLDOWN_SECS", d.cooldown_secs),
            ledger_path: std::env::var("LEDGER_PATH").ok().filter(|v| !v.trim().is_empty()),
            correlation_key: string_or("CORRELATION_KEY", d.correlation_key),
            chain_id: parsed_or("CHAIN_ID", d.chain_id),
            invariant_interval_secs: parsed_or(
                "INVARIANT_INTERVAL_SECS",
                d.invariant_interval_secs,
            ),
            notary_cursor: string_or("NOTARY_CURSOR", d.notary_cursor),
            notary_snapshot_dir: string_or("NOTARY_SNAPSHOT_DIR", d.notary_snapshot_dir),
            notary_batch: parsed_or("NOTARY_BATCH", d.notary_batch).max(1),
            notary_tag: string_or("NOTARY_TAG", d.notary_tag),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            guardian_threshold: 3,
            min_dwell_secs: 3600,
            cooldown_secs: 1,
            ledger_path: None,
            correlation_key: "sentinel-correlation".to_string(),
            chain_id: 196,
            invariant_interval_secs: 60,
            notary_cursor: "./LAST_SEALED_SEQUENCE".to_string(),
            notary_snapshot_dir: "./snapshots".to_string(),
            notary_batch: 70,
            notary_tag: "SENTINEL-FORENSIC-NOTARY".to_string(),
        }
    }
}
