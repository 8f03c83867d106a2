//! Guardian consensus gate: the protocol-wide circuit breaker.
//!
//! ```text
//!            emergency_pause / threshold-th vote
//!   RUNNING ─────────────────────────────────────► HALTED
//!      ▲                                              │
//!      └──────── unhalt (auditor, after dwell) ───────┘
//! ```
//!
//! Each guardian votes at most once per halt cycle. Repeat votes, halting
//! while halted and early unhalts are rejected, not ignored.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::guard::{EntryGuard, EntryLatch};
use crate::access::AccessRegistry;
use crate::clock::Clock;
use crate::error::GateError;
use crate::logging::log_transition;
use crate::record::{ChainCursor, Identity, Role, Severity};
use crate::reporter::{Report, Reporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    Running,
    Halted,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Running => "RUNNING",
            GateState::Halted => "HALTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltState {
    pub halted: bool,
    pub halted_at: u64,
    pub min_dwell: u64,
    pub reason: Option<String>,
    pub halted_by: Option<Identity>,
}

impl HaltState {
    pub fn new(min_dwell: u64) -> Self {
        Self {
            halted: false,
            halted_at: 0,
            min_dwell,
            reason: None,
            halted_by: None,
        }
    }

    pub fn ready_at(&self) -> u64 {
        self.halted_at.saturating_add(self.min_dwell)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianVoteSet {
    voted: BTreeMap<Identity, bool>,
    active_votes: u32,
    threshold: u32,
}

impl GuardianVoteSet {
    pub fn new(threshold: u32) -> Self {
        Self {
            voted: BTreeMap::new(),
            active_votes: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record a vote; returns the new active count.
    pub fn cast(&mut self, guardian: &Identity) -> Result<u32, GateError> {
        if self.has_voted(guardian) {
            return Err(GateError::DuplicateVote(guardian.clone()));
        }
        self.voted.insert(guardian.clone(), true);
        self.active_votes += 1;
        Ok(self.active_votes)
    }

    pub fn has_voted(&self, guardian: &Identity) -> bool {
        self.voted.get(guardian).copied().unwrap_or(false)
    }

    pub fn reached(&self) -> bool {
        self.active_votes >= self.threshold
    }

    pub fn reset(&mut self) {
        self.voted.clear();
        self.active_votes = 0;
    }

    pub fn active_votes(&self) -> u32 {
        self.active_votes
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_consistent(&self) -> bool {
        self.active_votes as usize == self.voted.values().filter(|v| **v).count()
    }
}

struct GateInner {
    halt: HaltState,
    votes: GuardianVoteSet,
}

/// Owns `HaltState` and `GuardianVoteSet`; nothing else mutates them.
pub struct GuardianGate {
    inner: Mutex<GateInner>,
    entered: EntryLatch,
    registry: Arc<AccessRegistry>,
    reporter: Reporter,
    chain: Arc<ChainCursor>,
    clock: Arc<dyn Clock>,
}

impl GuardianGate {
    pub fn new(
        registry: Arc<AccessRegistry>,
        reporter: Reporter,
        chain: Arc<ChainCursor>,
        clock: Arc<dyn Clock>,
        threshold: u32,
        min_dwell: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                halt: HaltState::new(min_dwell),
                votes: GuardianVoteSet::new(threshold),
            }),
            entered: EntryLatch::new(),
            registry,
            reporter,
            chain,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self) -> Result<EntryGuard<'_>, GateError> {
        self.entered.try_enter().ok_or(GateError::Reentrant)
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn state(&self) -> GateState {
        if self.lock().halt.halted {
            GateState::Halted
        } else {
            GateState::Running
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state() == GateState::Halted
    }

    pub fn halt_state(&self) -> HaltState {
        self.lock().halt.clone()
    }

    pub fn votes(&self) -> GuardianVoteSet {
        self.lock().votes.clone()
    }

    pub fn active_votes(&self) -> u32 {
        self.lock().votes.active_votes()
    }

    /// Emit the idle-state record once the reporter is wired.
    pub fn announce(&self) -> Option<u64> {
        let (threshold, min_dwell) = {
            let inner = self.lock();
            (inner.votes.threshold(), inner.halt.min_dwell)
        };
        let ctx = self.chain.context_for(self.reporter.source());
        self.reporter.report(
            &ctx,
            Report::new(
                Severity::Critical,
                "guardian_gate",
                format!("initialized: threshold {} dwell {}s", threshold, min_dwell),
            )
            .risk(0)
            .action_required(false),
        )
    }

    /// Immediate single-authority halt.
    pub fn emergency_pause(&self, caller: &Identity, reason: &str) -> Result<(), GateError> {
        let _entry = self.enter()?;
        let allowed = [Role::responder(), Role::sentinel(), Role::admin()];
        if !self.registry.has_any_role(&allowed, caller) {
            return Err(GateError::Unauthorized {
                account: caller.clone(),
                role: Role::responder(),
            });
        }
        {
            let mut inner = self.lock();
            if inner.halt.halted {
                return Err(GateError::AlreadyHalted);
            }
            self.halt(&mut inner, caller, reason);
        }
        self.report_halt(caller, reason);
        Ok(())
    }

    /// One guardian, one vote per cycle. Returns the active vote count.
    pub fn cast_vote(&self, guardian: &Identity) -> Result<u32, GateError> {
        let _entry = self.enter()?;
        if !self.registry.has_role(&Role::guardian(), guardian) {
            return Err(GateError::Unauthorized {
                account: guardian.clone(),
                role: Role::guardian(),
            });
        }
        let (active, threshold, tripped) = {
            let mut inner = self.lock();
            if inner.halt.halted {
                return Err(GateError::AlreadyHalted);
            }
            let active = inner.votes.cast(guardian)?;
            let tripped = inner.votes.reached();
            if tripped {
                self.halt(&mut inner, guardian, "guardian quorum reached");
            }
            (active, inner.votes.threshold(), tripped)
        };

        let ctx = self.chain.context_for(guardian);
        let progress = (u64::from(active) * 100 / u64::from(threshold)).min(100) as u8;
        self.reporter.report(
            &ctx,
            Report::new(
                Severity::Critical,
                "guardian_vote",
                format!("vote {}/{}", active, threshold),
            )
            .related(guardian.clone())
            .risk(progress),
        );
        if tripped {
            self.report_halt(guardian, "guardian quorum reached");
        }
        Ok(active)
    }

    /// Lift the halt once the dwell time has passed; clears all votes.
    pub fn unhalt(&self, caller: &Identity) -> Result<(), GateError> {
        let _entry = self.enter()?;
        if !self.registry.has_role(&Role::auditor(), caller) {
            return Err(GateError::Unauthorized {
                account: caller.clone(),
                role: Role::auditor(),
            });
        }
        let now = self.clock.now();
        {
            let mut inner = self.lock();
            if !inner.halt.halted {
                return Err(GateError::NotHalted);
            }
            let ready_at = inner.halt.ready_at();
            if now < ready_at {
                return Err(GateError::DwellNotElapsed { ready_at });
            }
            inner.halt.halted = false;
            inner.halt.reason = None;
            inner.halt.halted_by = None;
            inner.votes.reset();
        }
        log_transition(
            GateState::Halted.as_str(),
            GateState::Running.as_str(),
            caller.as_str(),
            "auditor unhalt",
        );
        let ctx = self.chain.context_for(caller);
        self.reporter.report(
            &ctx,
            Report::new(Severity::Critical, "guardian_gate", "unhalted; votes reset")
                .risk(0)
                .action_required(false),
        );
        Ok(())
    }

    fn halt(&self, inner: &mut GateInner, caller: &Identity, reason: &str) {
        inner.halt.halted = true;
        inner.halt.halted_at = self.clock.now();
        inner.halt.reason = Some(reason.to_string());
        inner.halt.halted_by = Some(caller.clone());
        log_transition(
            GateState::Running.as_str(),
            GateState::Halted.as_str(),
            caller.as_str(),
            reason,
        );
    }

    fn report_halt(&self, caller: &Identity, reason: &str) {
        let ctx = self.chain.context_for(caller);
        self.reporter.report(
            &ctx,
            Report::new(Severity::Emergency, "guardian_gate", format!("halted: {}", reason))
                .related(caller.clone())
                .risk(100),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::SequencerLedger;

    struct Fixture {
        gate: GuardianGate,
        ledger: Arc<SequencerLedger>,
        clock: Arc<ManualClock>,
    }

    fn fixture(threshold: u32, dwell: u64) -> Fixture {
        let admin = Identity::from("admin");
        let registry = Arc::new(AccessRegistry::new(admin.clone()));
        for g in ["g1", "g2", "g3", "g4"] {
            registry.grant(&admin, Role::guardian(), Identity::from(g)).unwrap();
        }
        registry.grant(&admin, Role::responder(), Identity::from("ops")).unwrap();
        registry.grant(&admin, Role::auditor(), Identity::from("audit")).unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let ledger = Arc::new(SequencerLedger::in_memory(registry.clone(), clock.clone(), 1));
        let reporter =
            Reporter::connected(Identity::from("gate"), b"k", clock.clone(), ledger.clone());
        let gate = GuardianGate::new(
            registry,
            reporter,
            Arc::new(ChainCursor::new(196)),
            clock.clone(),
            threshold,
            dwell,
        );
        Fixture { gate, ledger, clock }
    }

    #[test]
    fn test_threshold_vote_halts_exactly_once() {
        let f = fixture(3, 60);
        assert_eq!(f.gate.cast_vote(&Identity::from("g1")).unwrap(), 1);
        assert_eq!(f.gate.cast_vote(&Identity::from("g2")).unwrap(), 2);
        assert!(!f.gate.is_halted());
        assert_eq!(f.gate.cast_vote(&Identity::from("g3")).unwrap(), 3);
        assert!(f.gate.is_halted());
        assert_eq!(
            f.gate.cast_vote(&Identity::from("g4")).unwrap_err(),
            GateError::AlreadyHalted
        );
        assert_eq!(f.gate.active_votes(), 3);
        assert!(f.gate.votes().is_consistent());
    }

    #[test]
    fn test_duplicate_vote_rejected() {
        let f = fixture(3, 60);
        f.gate.cast_vote(&Identity::from("g1")).unwrap();
        assert_eq!(
            f.gate.cast_vote(&Identity::from("g1")).unwrap_err(),
            GateError::DuplicateVote(Identity::from("g1"))
        );
        assert_eq!(f.gate.active_votes(), 1);
    }

    #[test]
    fn test_non_guardian_cannot_vote() {
        let f = fixture(3, 60);
        let err = f.gate.cast_vote(&Identity::from("ops")).unwrap_err();
        assert!(matches!(err, GateError::Unauthorized { .. }));
    }

    #[test]
    fn test_pause_while_halted_rejected() {
        let f = fixture(3, 60);
        let ops = Identity::from("ops");
        f.gate.emergency_pause(&ops, "oracle drift").unwrap();
        assert_eq!(f.gate.halt_state().reason.as_deref(), Some("oracle drift"));
        assert_eq!(
            f.gate.emergency_pause(&ops, "again").unwrap_err(),
            GateError::AlreadyHalted
        );
    }

    #[test]
    fn test_unhalt_respects_dwell_and_resets_votes() {
        let f = fixture(2, 300);
        f.gate.cast_vote(&Identity::from("g1")).unwrap();
        f.gate.cast_vote(&Identity::from("g2")).unwrap();
        assert!(f.gate.is_halted());

        let audit = Identity::from("audit");
        f.clock.advance(299);
        assert_eq!(
            f.gate.unhalt(&audit).unwrap_err(),
            GateError::DwellNotElapsed { ready_at: 10_300 }
        );
        f.clock.advance(1);
        f.gate.unhalt(&audit).unwrap();
        assert_eq!(f.gate.state(), GateState::Running);
        assert_eq!(f.gate.active_votes(), 0);
        assert!(!f.gate.votes().has_voted(&Identity::from("g1")));
        // a fresh cycle accepts the same guardian again
        assert_eq!(f.gate.cast_vote(&Identity::from("g1")).unwrap(), 1);
    }

    #[test]
    fn test_unhalt_requires_auditor_and_halt() {
        let f = fixture(3, 0);
        assert_eq!(
            f.gate.unhalt(&Identity::from("audit")).unwrap_err(),
            GateError::NotHalted
        );
        f.gate.emergency_pause(&Identity::from("ops"), "x").unwrap();
        assert!(matches!(
            f.gate.unhalt(&Identity::from("ops")).unwrap_err(),
            GateError::Unauthorized { .. }
        ));
    }

    #[test]
    fn test_transitions_are_recorded_critical_or_higher() {
        let f = fixture(1, 0);
        f.gate.announce();
        f.gate.cast_vote(&Identity::from("g1")).unwrap();
        f.gate.unhalt(&Identity::from("audit")).unwrap();
        let count = f.ledger.get_record_count();
        assert_eq!(count, 4);
        let records: Vec<_> =
            (1..=count).filter_map(|i| f.ledger.get_record(i)).collect();
        assert!(records.iter().all(|r| r.severity.is_critical()));
        assert_eq!(records[0].risk_score, 0);
        let halt = &records[2];
        assert_eq!(halt.severity, Severity::Emergency);
        assert_eq!(halt.risk_score, 100);
        assert_eq!(records[3].risk_score, 0);
    }

    #[test]
    fn test_reentrant_call_rejected() {
        let f = fixture(3, 0);
        let _held = f.gate.entered.try_enter().unwrap();
        assert_eq!(
            f.gate.cast_vote(&Identity::from("g1")).unwrap_err(),
            GateError::Reentrant
        );
        assert_eq!(f.gate.active_votes(), 0);
    }

    #[test]
    fn test_concurrent_distinct_guardians_all_counted() {
        let admin = Identity::from("admin");
        let registry = Arc::new(AccessRegistry::new(admin.clone()));
        let guardians: Vec<Identity> = (0..8).map(|i| Identity::new(format!("g{}", i))).collect();
        for g in &guardians {
            registry.grant(&admin, Role::guardian(), g.clone()).unwrap();
        }
        let clock = Arc::new(ManualClock::new(0));
        let ledger = Arc::new(SequencerLedger::in_memory(registry.clone(), clock.clone(), 1));
        let gate = Arc::new(GuardianGate::new(
            registry,
            Reporter::connected(Identity::from("gate"), b"k", clock.clone(), ledger),
            Arc::new(ChainCursor::new(196)),
            clock,
            100,
            0,
        ));

        let barrier = Arc::new(std::sync::Barrier::new(guardians.len()));
        let handles: Vec<_> = guardians
            .into_iter()
            .map(|g| {
                let (gate, barrier) = (gate.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    gate.cast_vote(&g)
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }
        assert_eq!(gate.active_votes(), 8);
        assert!(gate.votes().is_consistent());
    }
}
