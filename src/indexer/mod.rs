//! Index lifecycle: full builds, incremental cycles and their timers.

pub mod builder;
pub mod incremental;
pub mod scheduler;

pub use builder::IndexBuilder;
pub use incremental::{apply_delta, plan_cycle, ChangeNotification, CycleOutcome, CyclePlan};
pub use scheduler::Scheduler;
