//! Forensic record model shared by every component.
//!
//! A record is built by a [`crate::reporter::Reporter`], sequenced by the
//! [`crate::ledger::SequencerLedger`] and never touched again.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(pub String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn admin() -> Self {
        Self::new("ADMIN")
    }

    pub fn guardian() -> Self {
        Self::new("GUARDIAN")
    }

    /// Single authority allowed to pause immediately.
    pub fn responder() -> Self {
        Self::new("RESPONDER")
    }

    pub fn auditor() -> Self {
        Self::new("AUDITOR")
    }

    /// Automated monitors that force a halt on invariant failure.
    pub fn sentinel() -> Self {
        Self::new("SENTINEL")
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectorId(pub String);

impl From<&str> for SectorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordering is load-bearing: `severity >= Critical` gates escalation and
/// exempts a record from the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info = 0,
    Debug = 1,
    Warning = 2,
    Critical = 3,
    Emergency = 4,
}

impl Severity {
    pub fn is_critical(&self) -> bool {
        *self >= Severity::Critical
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
            Severity::Emergency => "EMERGENCY",
        }
    }
}

/// Execution context an embedding module hands to its reporter.
///
/// `checkpoint` stands in for a recent block hash; callers inject it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub actor: Identity,
    pub origin: Identity,
    pub chain_id: u64,
    pub block_height: u64,
    pub checkpoint: [u8; 32],
    pub gas_left: u64,
    pub value: u128,
}

impl CallContext {
    pub fn new(actor: Identity) -> Self {
        Self {
            origin: actor.clone(),
            actor,
            chain_id: 0,
            block_height: 0,
            checkpoint: [0u8; 32],
            gas_left: 0,
            value: 0,
        }
    }

    pub fn with_origin(mut self, origin: Identity) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_chain(mut self, chain_id: u64, block_height: u64, checkpoint: [u8; 32]) -> Self {
        self.chain_id = chain_id;
        self.block_height = block_height;
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_gas_left(mut self, gas_left: u64) -> Self {
        self.gas_left = gas_left;
        self
    }

    pub fn with_value(mut self, value: u128) -> Self {
        self.value = value;
        self
    }
}

/// Latest chain position seen by the core components, fed by whoever
/// observes blocks. Components without a caller-supplied context build
/// their record context from it.
#[derive(Debug)]
pub struct ChainCursor {
    chain_id: u64,
    head: RwLock<(u64, [u8; 32])>,
}

impl ChainCursor {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            head: RwLock::new((0, [0u8; 32])),
        }
    }

    pub fn advance(&self, block_height: u64, checkpoint: [u8; 32]) {
        if let Ok(mut head) = self.head.write() {
            *head = (block_height, checkpoint);
        }
    }

    pub fn head(&self) -> (u64, [u8; 32]) {
        self.head.read().map(|h| *h).unwrap_or((0, [0u8; 32]))
    }

    pub fn context_for(&self, actor: &Identity) -> CallContext {
        let (height, checkpoint) = self.head();
        CallContext::new(actor.clone()).with_chain(self.chain_id, height, checkpoint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForensicRecord {
    pub source: Identity,
    pub actor: Identity,
    pub origin: Identity,
    #[serde(default)]
    pub related: Option<Identity>,
    pub severity: Severity,
    pub category: String,
    pub details: String,
    pub risk_score: u8,
    pub nonce: u64,
    /// Zero until the ledger accepts the record.
    #[serde(default)]
    pub sequence_id: u64,
    pub correlation_id: String,
    pub timestamp: u64,
    pub chain_id: u64,
    pub block_height: u64,
    pub gas_left: u64,
    pub value: u128,
    pub action_required: bool,
    #[serde(default, with = "b64")]
    pub metadata: Vec<u8>,
    #[serde(default, with = "b64_opt")]
    pub proof: Option<Vec<u8>>,
}

impl ForensicRecord {
    pub const MAX_RISK_SCORE: u8 = 100;

    /// Bytes the ledger hashes into its chain: canonical JSON, fixed field order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|r| STANDARD.decode(r).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
pub(crate) fn sample_record(source: &str, nonce: u64, severity: Severity) -> ForensicRecord {
    ForensicRecord {
        source: Identity::from(source),
        actor: Identity::from("alice"),
        origin: Identity::from("alice"),
        related: None,
        severity,
        category: "test".to_string(),
        details: "sample".to_string(),
        risk_score: 10,
        nonce,
        sequence_id: 0,
        correlation_id: String::new(),
        timestamp: 0,
        chain_id: 196,
        block_height: 0,
        gas_left: 0,
        value: 0,
        action_required: false,
        metadata: Vec::new(),
        proof: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Debug);
        assert!(Severity::Debug < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
        assert!(Severity::Critical < Severity::Emergency);
        assert!(Severity::Emergency.is_critical());
        assert!(!Severity::Warning.is_critical());
    }

    #[test]
    fn test_metadata_survives_json() {
        let mut rec = sample_record("mint", 1, Severity::Info);
        rec.metadata = vec![0, 1, 2, 255];
        rec.proof = Some(vec![9, 9]);
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"metadata\":\"AAEC/w==\""));
        let back: ForensicRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_chain_cursor_feeds_context() {
        let cursor = ChainCursor::new(196);
        cursor.advance(42, [7u8; 32]);
        let ctx = cursor.context_for(&Identity::from("gate"));
        assert_eq!(ctx.chain_id, 196);
        assert_eq!(ctx.block_height, 42);
        assert_eq!(ctx.checkpoint, [7u8; 32]);
        assert_eq!(ctx.origin.as_str(), "gate");
    }

    #[test]
    fn test_canonical_bytes_stable() {
        let rec = sample_record("mint", 1, Severity::Info);
        assert_eq!(rec.canonical_bytes(), rec.clone().canonical_bytes());
    }
}
