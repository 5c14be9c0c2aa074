//! Sandbox Lifecycle Controller (SPEC_FULL.md §4.4): pure decisions,
//! a re-armable per-session alarm, and the effect layer that drives
//! the provider port from those decisions.

pub mod alarm;
pub mod controller;
pub mod decisions;

pub use alarm::Alarm;
pub use controller::{LifecycleController, SpawnOutcome};
