use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::clock::Clock;
use crate::coordinator::AccessCoordinator;
use crate::error::InvariantError;
use crate::logging::log_invariant;
use crate::record::{ChainCursor, Identity, Severity};
use crate::reporter::{Report, Reporter};

pub const FULLY_BACKED_BPS: u128 = 10_000;

/// Authoritative protocol totals, owned by the accounting modules.
pub trait AssetSource: Send + Sync {
    fn total_liability(&self) -> u128;
    fn total_collateral_value(&self) -> u128;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetInvariantSnapshot {
    pub total_liability: u128,
    pub total_collateral_value: u128,
}

impl AssetInvariantSnapshot {
    pub fn take(source: &dyn AssetSource) -> Self {
        Self {
            total_liability: source.total_liability(),
            total_collateral_value: source.total_collateral_value(),
        }
    }

    pub fn health_ratio_bps(&self) -> u128 {
        health_ratio_bps(self.total_liability, self.total_collateral_value)
    }
}

/// `collateral * 10000 / liability`, truncating. Nothing owed counts as fully
/// backed.
pub fn health_ratio_bps(liability: u128, collateral: u128) -> u128 {
    if liability == 0 {
        return FULLY_BACKED_BPS;
    }
    match collateral.checked_mul(FULLY_BACKED_BPS) {
        Some(scaled) => scaled / liability,
        None => (collateral / liability)
            .saturating_mul(FULLY_BACKED_BPS)
            .saturating_add(mul_div_floor(collateral % liability, FULLY_BACKED_BPS, liability)),
    }
}

/// `a * b / d` rounded down, for `a < d`, without a wide intermediate.
/// Shift-and-add over the bits of `b`, keeping the remainder below `d`.
fn mul_div_floor(a: u128, b: u128, d: u128) -> u128 {
    let (mut q, mut r) = (0u128, 0u128);
    for bit in (0..u128::BITS - b.leading_zeros()).rev() {
        q <<= 1;
        if r >= d - r {
            r -= d - r;
            q += 1;
        } else {
            r += r;
        }
        if (b >> bit) & 1 == 1 {
            if r >= d - a {
                r -= d - a;
                q += 1;
            } else {
                r += a;
            }
        }
    }
    q
}

pub fn assert_solvent(liability: u128, collateral: u128) -> Result<(), InvariantError> {
    if collateral >= liability {
        Ok(())
    } else {
        Err(InvariantError::SolvencyBreach {
            liability,
            collateral,
        })
    }
}

pub fn assert_supply_matches(expected: u128, actual: u128) -> Result<(), InvariantError> {
    if expected == actual {
        Ok(())
    } else {
        Err(InvariantError::SupplyMismatch { expected, actual })
    }
}

/// Recomputes protocol invariants and forces a halt when solvency fails.
/// Read-only apart from that forced-halt path.
pub struct InvariantMonitor {
    identity: Identity,
    coordinator: Arc<AccessCoordinator>,
    assets: Arc<dyn AssetSource>,
    reporter: Reporter,
    chain: Arc<ChainCursor>,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
    last_run: Mutex<Option<u64>>,
}

impl InvariantMonitor {
    pub fn new(
        identity: Identity,
        coordinator: Arc<AccessCoordinator>,
        assets: Arc<dyn AssetSource>,
        reporter: Reporter,
        chain: Arc<ChainCursor>,
        clock: Arc<dyn Clock>,
        interval_secs: u64,
    ) -> Self {
        Self {
            identity,
            coordinator,
            assets,
            reporter,
            chain,
            clock,
            interval_secs,
            last_run: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn snapshot(&self) -> AssetInvariantSnapshot {
        AssetInvariantSnapshot::take(self.assets.as_ref())
    }

    pub fn health_ratio_bps(&self) -> u128 {
        self.snapshot().health_ratio_bps()
    }

    /// On breach: best-effort halt, an emergency record, then the breach
    /// error. The halt attempt can fail without hiding the breach.
    pub fn check_solvency(
        &self,
        total_liability: u128,
        total_collateral: u128,
    ) -> Result<(), InvariantError> {
        let result = assert_solvent(total_liability, total_collateral);
        let Err(breach) = result else {
            log_invariant("solvency", "pass", total_collateral, total_liability);
            return Ok(());
        };
        log_invariant("solvency", "breach", total_collateral, total_liability);

        let reason = format!(
            "solvency breach: liability {} > collateral {}",
            total_liability, total_collateral
        );
        // Discarded on purpose: already halted or unauthorized must not turn
        // the breach into a success. The gate logs its own rejection.
        let _ = self.coordinator.trigger_emergency_pause(&self.identity, &reason);

        let ctx = self.chain.context_for(&self.identity);
        self.reporter.report(
            &ctx,
            Report::new(Severity::Emergency, "solvency", reason)
                .risk(100)
                .metadata(
                    serde_json::to_vec(&json!({
                        "liability": total_liability.to_string(),
                        "collateral": total_collateral.to_string(),
                        "halted": self.coordinator.is_halted(),
                    }))
                    .unwrap_or_default(),
                ),
        );
        Err(breach)
    }

    pub fn check_solvency_now(&self) -> Result<(), InvariantError> {
        let snap = self.snapshot();
        self.check_solvency(snap.total_liability, snap.total_collateral_value)
    }

    /// Bookkeeping check: a mismatch is a hard failure but not a halt trigger.
    pub fn check_supply_integrity(&self, expected_total: u128) -> Result<(), InvariantError> {
        let actual = self.assets.total_liability();
        let result = assert_supply_matches(expected_total, actual);
        if result.is_err() {
            log_invariant("supply", "mismatch", expected_total, actual);
            let ctx = self.chain.context_for(&self.identity);
            self.reporter.report(
                &ctx,
                Report::new(
                    Severity::Critical,
                    "supply_integrity",
                    format!("expected {} authoritative {}", expected_total, actual),
                )
                .risk(70)
                .action_required(false),
            );
        } else {
            log_invariant("supply", "pass", expected_total, actual);
        }
        result
    }

    /// Run the snapshot solvency check if the interval has elapsed.
    /// `None` means the check was not due.
    pub fn poll(&self) -> Option<Result<(), InvariantError>> {
        let now = self.clock.now();
        {
            let mut last = self.last_run.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(prev) = *last {
                if now < prev.saturating_add(self.interval_secs) {
                    return None;
                }
            }
            *last = Some(now);
        }
        Some(self.check_solvency_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessRegistry;
    use crate::clock::ManualClock;
    use crate::record::Role;
    use crate::reliability::GuardianGate;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Book {
        liability: AtomicU64,
        collateral: AtomicU64,
    }

    impl AssetSource for Book {
        fn total_liability(&self) -> u128 {
            self.liability.load(Ordering::SeqCst) as u128
        }
        fn total_collateral_value(&self) -> u128 {
            self.collateral.load(Ordering::SeqCst) as u128
        }
    }

    fn monitor(authorized: bool) -> (InvariantMonitor, Arc<Book>, Arc<ManualClock>) {
        let admin = Identity::from("admin");
        let registry = Arc::new(AccessRegistry::new(admin.clone()));
        if authorized {
            registry.grant(&admin, Role::sentinel(), Identity::from("monitor")).unwrap();
        }
        let clock = Arc::new(ManualClock::new(0));
        let chain = Arc::new(ChainCursor::new(196));
        let gate = Arc::new(GuardianGate::new(
            registry.clone(),
            Reporter::new(Identity::from("gate"), b"k", clock.clone()),
            chain.clone(),
            clock.clone(),
            3,
            0,
        ));
        let coord = Arc::new(AccessCoordinator::new(
            registry,
            gate,
            Reporter::new(Identity::from("coordinator"), b"k", clock.clone()),
            chain.clone(),
        ));
        let book = Arc::new(Book::default());
        let m = InvariantMonitor::new(
            Identity::from("monitor"),
            coord,
            book.clone(),
            Reporter::new(Identity::from("monitor"), b"k", clock.clone()),
            chain,
            clock.clone(),
            60,
        );
        (m, book, clock)
    }

    #[test]
    fn test_health_ratio() {
        assert_eq!(health_ratio_bps(100, 100), 10_000);
        assert_eq!(health_ratio_bps(3, 2), 6_666);
        assert_eq!(health_ratio_bps(2, 3), 15_000);
        assert_eq!(health_ratio_bps(0, 0), 10_000);
        assert_eq!(health_ratio_bps(1, u128::MAX), u128::MAX);
    }

    #[test]
    fn test_health_ratio_truncates_past_u128_scaling() {
        // collateral * 10000 overflows in every case below
        assert_eq!(health_ratio_bps(u128::MAX, u128::MAX - 1), 9_999);
        assert_eq!(health_ratio_bps(u128::MAX / 2, u128::MAX / 4 * 3), 14_999);
        assert_eq!(health_ratio_bps(u128::MAX / 7, u128::MAX / 5 * 4), 56_000);
        assert_eq!(health_ratio_bps(u128::MAX / 3, u128::MAX), 30_000);
    }

    #[test]
    fn test_solvency_pass_and_breach() {
        let (m, _, _) = monitor(true);
        assert!(m.check_solvency(100, 100).is_ok());
        assert!(!m.coordinator.is_halted());
        assert_eq!(
            m.check_solvency(101, 100).unwrap_err(),
            InvariantError::SolvencyBreach {
                liability: 101,
                collateral: 100
            }
        );
        assert!(m.coordinator.is_halted());
    }

    #[test]
    fn test_breach_still_fails_when_halt_attempt_fails() {
        let (m, _, _) = monitor(false);
        assert!(m.check_solvency(101, 100).is_err());
        assert!(!m.coordinator.is_halted());
    }

    #[test]
    fn test_second_breach_while_halted_still_fails() {
        let (m, _, _) = monitor(true);
        assert!(m.check_solvency(2, 1).is_err());
        assert!(m.check_solvency(2, 1).is_err());
        assert!(m.coordinator.is_halted());
    }

    #[test]
    fn test_supply_mismatch_does_not_halt() {
        let (m, book, _) = monitor(true);
        book.liability.store(500, Ordering::SeqCst);
        assert!(m.check_supply_integrity(500).is_ok());
        assert_eq!(
            m.check_supply_integrity(499).unwrap_err(),
            InvariantError::SupplyMismatch {
                expected: 499,
                actual: 500
            }
        );
        assert!(!m.coordinator.is_halted());
    }

    #[test]
    fn test_poll_runs_on_interval() {
        let (m, book, clock) = monitor(true);
        book.liability.store(10, Ordering::SeqCst);
        book.collateral.store(20, Ordering::SeqCst);
        assert_eq!(m.health_ratio_bps(), 20_000);
        assert_eq!(m.poll(), Some(Ok(())));
        clock.advance(59);
        assert_eq!(m.poll(), None);
        clock.advance(1);
        book.collateral.store(5, Ordering::SeqCst);
        assert!(matches!(m.poll(), Some(Err(InvariantError::SolvencyBreach { .. }))));
        assert!(m.coordinator.is_halted());
    }
}
