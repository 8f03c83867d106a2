use thiserror::Error;

use crate::record::{Identity, Role};

/// Ledger admission failures. Recoverable; callers may retry later.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("cooldown active for {caller}: retry at {retry_at}")]
    CooldownActive { caller: Identity, retry_at: u64 },

    #[error("forensic logging is disabled")]
    LoggingDisabled,

    #[error("nonce {nonce} from {source_id} does not exceed last accepted nonce {last}")]
    ReplayedNonce {
        source_id: Identity,
        nonce: u64,
        last: u64,
    },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("ledger storage failure: {0}")]
    Storage(String),
}

/// Policy violations raised by the guardian gate. Always surfaced, never tolerated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("{account} lacks role {role}")]
    Unauthorized { account: Identity, role: Role },

    #[error("protocol is already halted")]
    AlreadyHalted,

    #[error("protocol is not halted")]
    NotHalted,

    #[error("guardian {0} already voted this cycle")]
    DuplicateVote(Identity),

    #[error("halt dwell time not elapsed: unhalt allowed at {ready_at}")]
    DwellNotElapsed { ready_at: u64 },

    #[error("re-entrant gate call rejected")]
    Reentrant,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("{account} lacks role {role}")]
    Unauthorized { account: Identity, role: Role },

    #[error(transparent)]
    Gate(#[from] GateError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    #[error("solvency breach: liability {liability} exceeds collateral {collateral}")]
    SolvencyBreach { liability: u128, collateral: u128 },

    #[error("supply mismatch: expected {expected}, authoritative {actual}")]
    SupplyMismatch { expected: u128, actual: u128 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReporterError {
    #[error("reporter ledger already configured")]
    AlreadyConfigured,

    #[error("source {0} already has a reporter")]
    SourceInUse(Identity),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("empty seal range {from}-{to}")]
    EmptyRange { from: u64, to: u64 },

    #[error("sequence {0} missing from ledger")]
    Missing(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_error_converts_into_access_error() {
        let err: AccessError = GateError::AlreadyHalted.into();
        assert_eq!(err.to_string(), "protocol is already halted");
    }

    #[test]
    fn test_cooldown_display_names_caller() {
        let err = AdmissionError::CooldownActive {
            caller: Identity::from("mint"),
            retry_at: 42,
        };
        assert!(err.to_string().contains("mint"));
        assert!(err.to_string().contains("42"));
    }
}
