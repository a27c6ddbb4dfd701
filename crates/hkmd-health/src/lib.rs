//! Health & watchdog: periodic stall diagnosis, recovery escalation, and
//! the drift guard over wall-clock/commit timestamps.
//!
//! The `ok -> degraded/recovering -> {ok, persistent_stall}` state
//! machine shape is grounded on the teacher's `mqk-integrity::ArmState` —
//! a small enum mutated only through named, explicit transitions, never
//! by direct field assignment from outside the module.

mod watchdog;

pub use watchdog::{
    drift_warning, HealthSnapshot, Watchdog, WatchdogAction, WatchdogConfig, WatchdogState,
};
