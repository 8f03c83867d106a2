pub mod invariants;

pub use invariants::{health_ratio_bps, AssetInvariantSnapshot, AssetSource, InvariantMonitor};
