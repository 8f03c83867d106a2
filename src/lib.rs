//! Forensic accountability for privileged on-chain modules: an append-only
//! sequenced ledger, a guardian quorum circuit breaker, role and sector
//! access coordination, and solvency invariants that halt on breach.

pub mod access;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod record;
pub mod reliability;
pub mod reporter;
pub mod sentinel;
pub mod verify;
