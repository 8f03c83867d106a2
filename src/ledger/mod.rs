//! Append-only forensic ledger: sequencing, cooldown admission, durable
//! storage and notary sealing.

pub mod limiter;
pub mod seal;
pub mod sequencer;
pub mod store;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AdmissionError;
use crate::record::{ForensicRecord, Identity};

pub use limiter::RateLimiter;
pub use sequencer::SequencerLedger;

/// Chain marker for the first entry: no predecessor.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// An accepted record plus its position in the hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub record: ForensicRecord,
    pub prev_hash: String,
    pub entry_hash: String,
}

pub fn chain_hash(prev_hash: &str, record: &ForensicRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(record.canonical_bytes());
    hex::encode(hasher.finalize())
}

/// Where reporters send their records. The ledger is the production sink;
/// tests swap in failing ones.
pub trait ForensicSink: Send + Sync {
    fn submit(&self, caller: &Identity, record: ForensicRecord) -> Result<u64, AdmissionError>;

    /// Highest nonce already accepted from `source`, so a reporter can resume
    /// after a restart without colliding with its own history.
    fn last_nonce(&self, _source: &Identity) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{sample_record, Severity};

    #[test]
    fn test_chain_hash_depends_on_predecessor() {
        let rec = sample_record("mint", 1, Severity::Info);
        let a = chain_hash(ZERO_HASH, &rec);
        let b = chain_hash(&a, &rec);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(a, chain_hash(ZERO_HASH, &rec));
    }
}
