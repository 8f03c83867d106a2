//! Notary pass over a durable ledger.
//!
//! Seals every record after `NOTARY_CURSOR` into certificates of at most
//! `NOTARY_BATCH` records under `NOTARY_SNAPSHOT_DIR`. Run it from cron; a
//! pass with nothing new is a no-op.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;

use sentinelguard::access::AccessRegistry;
use sentinelguard::clock::SystemClock;
use sentinelguard::config::Config;
use sentinelguard::ledger::seal::seal_pending;
use sentinelguard::ledger::SequencerLedger;
use sentinelguard::logging::{log, obj, v_str, Domain, Level};
use sentinelguard::record::Identity;

fn main() -> Result<()> {
    let cfg = Config::from_env();
    let Some(path) = cfg.ledger_path.as_deref() else {
        bail!("LEDGER_PATH must point at a durable ledger");
    };

    // Read-only use: no role is ever checked, the admin is a placeholder.
    let registry = Arc::new(AccessRegistry::new(Identity::from("notary")));
    let ledger = SequencerLedger::open(path, registry, Arc::new(SystemClock), cfg.cooldown_secs)?;
    if let Some(bad) = ledger.verify_chain() {
        log(
            Level::Error,
            Domain::Notary,
            "chain_broken",
            obj(&[("ledger", v_str(path)), ("sequence_id", json!(bad))]),
        );
        bail!("hash chain broken at sequence {}", bad);
    }

    let written = seal_pending(
        &ledger,
        Path::new(&cfg.notary_cursor),
        Path::new(&cfg.notary_snapshot_dir),
        cfg.notary_batch,
        &cfg.notary_tag,
    )?;
    for path in &written {
        println!("{}", path.display());
    }
    Ok(())
}
