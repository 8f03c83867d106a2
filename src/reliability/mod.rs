pub mod circuit;
pub mod guard;

pub use circuit::{GateState, GuardianGate, GuardianVoteSet, HaltState};
