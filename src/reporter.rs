//! Emission helper embedded in every privileged module.
//!
//! `report` never fails the embedding module's operation. The ledger's answer
//! is observed only as `Option<sequence_id>`; rejections are logged and
//! dropped here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use crate::clock::Clock;
use crate::error::ReporterError;
use crate::ledger::ForensicSink;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::record::{CallContext, ForensicRecord, Identity, Severity};

type HmacSha256 = Hmac<Sha256>;

/// Event a module wants on the record. Built with [`Report::new`] and the
/// chained setters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub severity: Severity,
    pub category: String,
    pub details: String,
    pub related: Option<Identity>,
    pub risk_score: u8,
    pub metadata: Vec<u8>,
    pub proof: Option<Vec<u8>>,
    pub action_required: Option<bool>,
}

impl Report {
    pub fn new(
        severity: Severity,
        category: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category: category.into(),
            details: details.into(),
            related: None,
            risk_score: 0,
            metadata: Vec::new(),
            proof: None,
            action_required: None,
        }
    }

    pub fn related(mut self, subject: Identity) -> Self {
        self.related = Some(subject);
        self
    }

    /// Clamped to 0..=100.
    pub fn risk(mut self, score: u8) -> Self {
        self.risk_score = score.min(ForensicRecord::MAX_RISK_SCORE);
        self
    }

    pub fn metadata(mut self, bytes: Vec<u8>) -> Self {
        self.metadata = bytes;
        self
    }

    pub fn proof(mut self, bytes: Vec<u8>) -> Self {
        self.proof = Some(bytes);
        self
    }

    /// Override the default, which demands escalation for Critical and above.
    pub fn action_required(mut self, required: bool) -> Self {
        self.action_required = Some(required);
        self
    }
}

pub struct Reporter {
    source: Identity,
    ledger: OnceLock<Arc<dyn ForensicSink>>,
    nonce: AtomicU64,
    // Held from nonce assignment through submission so nonces reach the
    // ledger in the order they were handed out.
    emit: Mutex<()>,
    key: Vec<u8>,
    clock: Arc<dyn Clock>,
}

impl Reporter {
    pub fn new(source: Identity, key: &[u8], clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            ledger: OnceLock::new(),
            nonce: AtomicU64::new(0),
            emit: Mutex::new(()),
            key: key.to_vec(),
            clock,
        }
    }

    /// Reporter already wired to `ledger`.
    pub fn connected(
        source: Identity,
        key: &[u8],
        clock: Arc<dyn Clock>,
        ledger: Arc<dyn ForensicSink>,
    ) -> Self {
        let reporter = Self::new(source, key, clock);
        let _ = reporter.set_ledger(ledger);
        reporter
    }

    pub fn source(&self) -> &Identity {
        &self.source
    }

    /// Wire the ledger. Settable exactly once.
    pub fn set_ledger(&self, ledger: Arc<dyn ForensicSink>) -> Result<(), ReporterError> {
        let resume = ledger.last_nonce(&self.source);
        self.ledger
            .set(ledger)
            .map_err(|_| ReporterError::AlreadyConfigured)?;
        if let Some(last) = resume {
            self.nonce.fetch_max(last, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.ledger.get().is_some()
    }

    /// Nonces handed out so far.
    pub fn last_nonce(&self) -> u64 {
        self.nonce.load(Ordering::SeqCst)
    }

    pub fn correlation_id(
        &self,
        timestamp: u64,
        caller: &Identity,
        nonce: u64,
        checkpoint: &[u8; 32],
    ) -> String {
        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            // HMAC accepts any key length; unreachable in practice
            Err(_) => return String::new(),
        };
        mac.update(&timestamp.to_be_bytes());
        mac.update(caller.as_str().as_bytes());
        mac.update(&nonce.to_be_bytes());
        mac.update(checkpoint);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Stamp a record with the next nonce. Callers that submit it themselves
    /// must keep submissions in nonce order; [`Reporter::report`] does.
    pub fn build(&self, ctx: &CallContext, report: Report) -> ForensicRecord {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp = self.clock.now();
        let correlation_id = self.correlation_id(timestamp, &ctx.actor, nonce, &ctx.checkpoint);
        ForensicRecord {
            source: self.source.clone(),
            actor: ctx.actor.clone(),
            origin: ctx.origin.clone(),
            related: report.related,
            severity: report.severity,
            category: report.category,
            details: report.details,
            risk_score: report.risk_score.min(ForensicRecord::MAX_RISK_SCORE),
            nonce,
            sequence_id: 0,
            correlation_id,
            timestamp,
            chain_id: ctx.chain_id,
            block_height: ctx.block_height,
            gas_left: ctx.gas_left,
            value: ctx.value,
            action_required: report
                .action_required
                .unwrap_or(report.severity.is_critical()),
            metadata: report.metadata,
            proof: report.proof,
        }
    }

    /// Build and submit. Returns the sequence id on success; every failure is
    /// swallowed so telemetry can never take the caller down with it.
    pub fn report(&self, ctx: &CallContext, report: Report) -> Option<u64> {
        let ledger = self.ledger.get()?;
        let _emit = self.emit.lock().unwrap_or_else(|p| p.into_inner());
        let record = self.build(ctx, report);
        let severity = record.severity;
        let nonce = record.nonce;
        match ledger.submit(&self.source, record) {
            Ok(seq) => Some(seq),
            Err(err) => {
                // fail-open: the caller never sees this
                log(
                    if severity.is_critical() { Level::Error } else { Level::Warn },
                    Domain::Reporter,
                    "submission_dropped",
                    obj(&[
                        ("source", v_str(self.source.as_str())),
                        ("severity", v_str(severity.as_str())),
                        ("nonce", json!(nonce)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                None
            }
        }
    }
}
