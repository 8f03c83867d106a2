use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use serde_json::json;

use super::limiter::RateLimiter;
use super::store::LedgerStore;
use super::{chain_hash, ForensicSink, LedgerEntry, ZERO_HASH};
use crate::access::AccessRegistry;
use crate::clock::Clock;
use crate::error::{AccessError, AdmissionError};
use crate::logging::{log, log_admission, obj, v_str, Domain, Level};
use crate::record::{ForensicRecord, Identity, Role};

struct LedgerInner {
    active: bool,
    entries: Vec<LedgerEntry>,
    last_nonce: HashMap<Identity, u64>,
    limiter: RateLimiter,
    store: Option<LedgerStore>,
}

impl LedgerInner {
    fn head_hash(&self) -> &str {
        self.entries
            .last()
            .map_or(ZERO_HASH, |e| e.entry_hash.as_str())
    }
}

/// First sequence id whose links or hash do not verify.
fn first_broken(entries: &[LedgerEntry]) -> Option<u64> {
    let mut prev = ZERO_HASH;
    for (i, entry) in entries.iter().enumerate() {
        let seq = i as u64 + 1;
        if entry.record.sequence_id != seq
            || entry.prev_hash != prev
            || chain_hash(prev, &entry.record) != entry.entry_hash
        {
            return Some(seq);
        }
        prev = entry.entry_hash.as_str();
    }
    None
}

fn log_chain_broken(seq: u64) {
    log(
        Level::Error,
        Domain::Audit,
        "chain_broken",
        obj(&[("sequence_id", json!(seq))]),
    );
}

/// Single source of truth for what happened and in what order.
///
/// Sequence ids start at 1 and are gapless. Assignment, persistence and the
/// cooldown update happen under one lock.
pub struct SequencerLedger {
    inner: Mutex<LedgerInner>,
    registry: Arc<AccessRegistry>,
    clock: Arc<dyn Clock>,
}

impl SequencerLedger {
    pub fn in_memory(
        registry: Arc<AccessRegistry>,
        clock: Arc<dyn Clock>,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                active: true,
                entries: Vec::new(),
                last_nonce: HashMap::new(),
                limiter: RateLimiter::new(cooldown_secs),
                store: None,
            }),
            registry,
            clock,
        }
    }

    /// Ledger backed by `store`; existing entries are replayed so sequence
    /// numbers and per-source nonces continue where they left off. Refuses
    /// storage whose hash chain does not verify.
    pub fn with_store(
        store: LedgerStore,
        registry: Arc<AccessRegistry>,
        clock: Arc<dyn Clock>,
        cooldown_secs: u64,
    ) -> Result<Self> {
        let entries = store.load_all()?;
        if let Some(seq) = first_broken(&entries) {
            log_chain_broken(seq);
            bail!("ledger hash chain broken at sequence {}", seq);
        }
        let mut last_nonce = HashMap::new();
        for entry in &entries {
            let n = last_nonce.entry(entry.record.source.clone()).or_insert(0);
            *n = (*n).max(entry.record.nonce);
        }
        log(
            Level::Info,
            Domain::Ledger,
            "ledger_recovered",
            obj(&[("entries", json!(entries.len()))]),
        );
        Ok(Self {
            inner: Mutex::new(LedgerInner {
                active: true,
                entries,
                last_nonce,
                limiter: RateLimiter::new(cooldown_secs),
                store: Some(store),
            }),
            registry,
            clock,
        })
    }

    pub fn open(
        path: &str,
        registry: Arc<AccessRegistry>,
        clock: Arc<dyn Clock>,
        cooldown_secs: u64,
    ) -> Result<Self> {
        Self::with_store(LedgerStore::open(path)?, registry, clock, cooldown_secs)
    }

    // A poisoned lock still holds a consistent ledger: every mutation below
    // completes before anything can panic.
    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn submit(
        &self,
        caller: &Identity,
        mut record: ForensicRecord,
    ) -> Result<u64, AdmissionError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        if !inner.active {
            log_admission(caller.as_str(), record.severity.as_str(), "logging_disabled", None);
            return Err(AdmissionError::LoggingDisabled);
        }
        if &record.source != caller {
            return Err(AdmissionError::InvalidRecord(format!(
                "source {} does not match caller {}",
                record.source, caller
            )));
        }
        if record.risk_score > ForensicRecord::MAX_RISK_SCORE {
            return Err(AdmissionError::InvalidRecord(format!(
                "risk score {} above {}",
                record.risk_score,
                ForensicRecord::MAX_RISK_SCORE
            )));
        }
        if let Some(&last) = inner.last_nonce.get(caller) {
            if record.nonce <= last {
                log_admission(caller.as_str(), record.severity.as_str(), "replayed_nonce", None);
                return Err(AdmissionError::ReplayedNonce {
                    source_id: caller.clone(),
                    nonce: record.nonce,
                    last,
                });
            }
        }
        if !inner.limiter.allowed(caller, record.severity, now) {
            log_admission(caller.as_str(), record.severity.as_str(), "cooldown_active", None);
            return Err(AdmissionError::CooldownActive {
                caller: caller.clone(),
                retry_at: inner.limiter.retry_at(caller),
            });
        }

        let sequence_id = inner.entries.len() as u64 + 1;
        record.sequence_id = sequence_id;
        let prev_hash = inner.head_hash().to_string();
        let entry_hash = chain_hash(&prev_hash, &record);
        let entry = LedgerEntry {
            record,
            prev_hash,
            entry_hash,
        };

        if let Some(store) = inner.store.as_mut() {
            if let Err(err) = store.append(&entry) {
                log(
                    Level::Error,
                    Domain::Ledger,
                    "persist_failed",
                    obj(&[
                        ("sequence_id", json!(sequence_id)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                return Err(AdmissionError::Storage(err.to_string()));
            }
        }

        inner.last_nonce.insert(caller.clone(), entry.record.nonce);
        inner.limiter.record(caller, now);
        log_admission(
            caller.as_str(),
            entry.record.severity.as_str(),
            "accepted",
            Some(sequence_id),
        );
        inner.entries.push(entry);
        Ok(sequence_id)
    }

    pub fn get_record(&self, sequence_id: u64) -> Option<ForensicRecord> {
        self.get_entry(sequence_id).map(|e| e.record)
    }

    pub fn get_entry(&self, sequence_id: u64) -> Option<LedgerEntry> {
        let index = usize::try_from(sequence_id.checked_sub(1)?).ok()?;
        self.lock().entries.get(index).cloned()
    }

    pub fn get_record_count(&self) -> u64 {
        self.lock().entries.len() as u64
    }

    /// Entries with `from <= sequence_id <= to`, clamped to what exists.
    pub fn entries_range(&self, from: u64, to: u64) -> Vec<LedgerEntry> {
        let inner = self.lock();
        let start = from.max(1);
        let end = to.min(inner.entries.len() as u64);
        if start > end {
            return Vec::new();
        }
        inner.entries[(start - 1) as usize..end as usize].to_vec()
    }

    pub fn records_range(&self, from: u64, to: u64) -> Vec<ForensicRecord> {
        self.entries_range(from, to).into_iter().map(|e| e.record).collect()
    }

    pub fn head_hash(&self) -> String {
        self.lock().head_hash().to_string()
    }

    pub fn last_nonce(&self, source: &Identity) -> Option<u64> {
        self.lock().last_nonce.get(source).copied()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Administrative on/off switch, independent of the protocol halt.
    pub fn set_logging_active(&self, caller: &Identity, active: bool) -> Result<(), AccessError> {
        self.registry.require(&Role::admin(), caller)?;
        self.lock().active = active;
        log(
            Level::Warn,
            Domain::Ledger,
            "logging_toggled",
            obj(&[("caller", v_str(caller.as_str())), ("active", json!(active))]),
        );
        Ok(())
    }

    /// Recompute the hash chain. Returns the first sequence id that does not
    /// verify, or `None` when the whole chain is intact.
    pub fn verify_chain(&self) -> Option<u64> {
        let broken = first_broken(&self.lock().entries);
        if let Some(seq) = broken {
            log_chain_broken(seq);
        }
        broken
    }
}

impl ForensicSink for SequencerLedger {
    fn submit(&self, caller: &Identity, record: ForensicRecord) -> Result<u64, AdmissionError> {
        SequencerLedger::submit(self, caller, record)
    }

    fn last_nonce(&self, source: &Identity) -> Option<u64> {
        SequencerLedger::last_nonce(self, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::record::{sample_record, Severity};

    fn setup(cooldown: u64) -> (SequencerLedger, Arc<ManualClock>, Identity) {
        let admin = Identity::from("admin");
        let clock = Arc::new(ManualClock::new(1_000));
        let ledger = SequencerLedger::in_memory(
            Arc::new(AccessRegistry::new(admin.clone())),
            clock.clone(),
            cooldown,
        );
        (ledger, clock, admin)
    }

    #[test]
    fn test_sequence_ids_gapless_from_one() {
        let (ledger, clock, _) = setup(1);
        let mint = Identity::from("mint");
        for n in 1..=5 {
            let seq = ledger
                .submit(&mint, sample_record("mint", n, Severity::Info))
                .unwrap();
            assert_eq!(seq, n);
            clock.advance(1);
        }
        assert_eq!(ledger.get_record_count(), 5);
        assert_eq!(ledger.get_record(3).unwrap().sequence_id, 3);
        assert!(ledger.get_record(0).is_none());
        assert!(ledger.get_record(6).is_none());

        let tail: Vec<u64> = ledger.records_range(4, 99).iter().map(|r| r.sequence_id).collect();
        assert_eq!(tail, vec![4, 5]);
        assert!(ledger.records_range(6, 9).is_empty());
    }

    #[test]
    fn test_cooldown_rejects_then_admits_at_boundary() {
        let (ledger, clock, _) = setup(5);
        let mint = Identity::from("mint");
        ledger
            .submit(&mint, sample_record("mint", 1, Severity::Info))
            .unwrap();
        clock.advance(4);
        let err = ledger
            .submit(&mint, sample_record("mint", 2, Severity::Warning))
            .unwrap_err();
        assert_eq!(
            err,
            AdmissionError::CooldownActive {
                caller: mint.clone(),
                retry_at: 1_005
            }
        );
        clock.advance(1);
        assert_eq!(
            ledger
                .submit(&mint, sample_record("mint", 2, Severity::Warning))
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_critical_bypasses_cooldown() {
        let (ledger, _, _) = setup(60);
        let mint = Identity::from("mint");
        ledger
            .submit(&mint, sample_record("mint", 1, Severity::Info))
            .unwrap();
        assert!(ledger
            .submit(&mint, sample_record("mint", 2, Severity::Critical))
            .is_ok());
        assert!(ledger
            .submit(&mint, sample_record("mint", 3, Severity::Emergency))
            .is_ok());
    }

    #[test]
    fn test_rejected_submission_leaves_no_gap() {
        let (ledger, clock, _) = setup(10);
        let mint = Identity::from("mint");
        ledger
            .submit(&mint, sample_record("mint", 1, Severity::Info))
            .unwrap();
        assert!(ledger
            .submit(&mint, sample_record("mint", 2, Severity::Info))
            .is_err());
        clock.advance(10);
        assert_eq!(
            ledger
                .submit(&mint, sample_record("mint", 3, Severity::Info))
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_replayed_nonce_rejected() {
        let (ledger, _, _) = setup(0);
        let mint = Identity::from("mint");
        ledger
            .submit(&mint, sample_record("mint", 4, Severity::Critical))
            .unwrap();
        let err = ledger
            .submit(&mint, sample_record("mint", 4, Severity::Critical))
            .unwrap_err();
        assert!(matches!(err, AdmissionError::ReplayedNonce { last: 4, .. }));
        // other emitters keep their own nonce space
        let burn = Identity::from("burn");
        assert!(ledger
            .submit(&burn, sample_record("burn", 1, Severity::Critical))
            .is_ok());
    }

    #[test]
    fn test_spoofed_source_and_bad_risk_rejected() {
        let (ledger, _, _) = setup(0);
        let err = ledger
            .submit(&Identity::from("mallory"), sample_record("mint", 1, Severity::Info))
            .unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidRecord(_)));

        let mut rec = sample_record("mint", 1, Severity::Info);
        rec.risk_score = 101;
        let err = ledger.submit(&Identity::from("mint"), rec).unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidRecord(_)));
        assert_eq!(ledger.get_record_count(), 0);
    }

    #[test]
    fn test_disabled_logging_rejects_everything() {
        let (ledger, _, admin) = setup(0);
        ledger.set_logging_active(&admin, false).unwrap();
        let err = ledger
            .submit(&Identity::from("mint"), sample_record("mint", 1, Severity::Emergency))
            .unwrap_err();
        assert_eq!(err, AdmissionError::LoggingDisabled);
        assert!(ledger
            .set_logging_active(&Identity::from("mint"), true)
            .is_err());
    }

    #[test]
    fn test_chain_verifies() {
        let (ledger, _, _) = setup(0);
        let mint = Identity::from("mint");
        for n in 1..=3 {
            ledger
                .submit(&mint, sample_record("mint", n, Severity::Critical))
                .unwrap();
        }
        assert!(ledger.verify_chain().is_none());
        let second = ledger.get_entry(2).unwrap();
        assert_eq!(second.prev_hash, ledger.get_entry(1).unwrap().entry_hash);
        assert_eq!(ledger.head_hash(), ledger.get_entry(3).unwrap().entry_hash);
    }

    #[test]
    fn test_concurrent_submissions_get_distinct_ids() {
        let (ledger, _, _) = setup(0);
        let ledger = Arc::new(ledger);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    let name = format!("module-{}", t);
                    let caller = Identity::new(name.clone());
                    (1..=25)
                        .map(|n| {
                            ledger
                                .submit(&caller, sample_record(&name, n, Severity::Critical))
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=200).collect::<Vec<_>>());
        assert!(ledger.verify_chain().is_none());
    }

    #[test]
    fn test_reopen_refuses_broken_chain() {
        let admin = Identity::from("admin");
        let registry = Arc::new(AccessRegistry::new(admin));
        let clock = Arc::new(ManualClock::new(1_000));

        let mut good = LedgerStore::in_memory().unwrap();
        let mut record = sample_record("mint", 1, Severity::Info);
        record.sequence_id = 1;
        let entry_hash = chain_hash(ZERO_HASH, &record);
        good.append(&LedgerEntry {
            record: record.clone(),
            prev_hash: ZERO_HASH.to_string(),
            entry_hash,
        })
        .unwrap();
        let ledger = SequencerLedger::with_store(good, registry.clone(), clock.clone(), 0).unwrap();
        assert_eq!(ledger.get_record_count(), 1);

        let mut forged = LedgerStore::in_memory().unwrap();
        forged
            .append(&LedgerEntry {
                record,
                prev_hash: ZERO_HASH.to_string(),
                entry_hash: "00".repeat(32),
            })
            .unwrap();
        let err = SequencerLedger::with_store(forged, registry, clock, 0).err().unwrap();
        assert!(err.to_string().contains("sequence 1"));
    }
}
