use std::collections::HashMap;

use crate::record::{Identity, Severity};

/// Per-caller cooldown gate consulted by the ledger before admitting a
/// non-critical record. Lives inside the ledger lock so the check and the
/// timestamp update cannot be raced.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    cooldown_secs: u64,
    last_submission: HashMap<Identity, u64>,
}

impl RateLimiter {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            cooldown_secs,
            last_submission: HashMap::new(),
        }
    }

    pub fn cooldown_secs(&self) -> u64 {
        self.cooldown_secs
    }

    pub fn allowed(&self, caller: &Identity, severity: Severity, now: u64) -> bool {
        if severity.is_critical() {
            return true;
        }
        match self.last_submission.get(caller) {
            Some(last) => now >= last.saturating_add(self.cooldown_secs),
            None => true,
        }
    }

    /// Earliest time a non-critical submission from `caller` is admitted.
    pub fn retry_at(&self, caller: &Identity) -> u64 {
        self.last_submission
            .get(caller)
            .map_or(0, |last| last.saturating_add(self.cooldown_secs))
    }

    pub fn record(&mut self, caller: &Identity, now: u64) {
        self.last_submission.insert(caller.clone(), now);
    }

    pub fn last_submission(&self, caller: &Identity) -> Option<u64> {
        self.last_submission.get(caller).copied()
    }
}
