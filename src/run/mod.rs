//! Run control: the coordinator, its cycle pacing and per-cycle reports
//!
//! - [`Coordinator`] - Drives attach → plan → configure → initialize → start
//!   → watch → stop for every unit
//! - [`CycleReport`] - What one cycle observed, printed as a status frame
//! - [`CycleTimer`] - Keeps the loop at its cycle rate

pub mod coordinator;
pub mod rate_limiter;
pub mod status;

pub use coordinator::{Coordinator, RunContext, RunOutcome, RunSummary, UnitStop};
pub use rate_limiter::CycleTimer;
pub use status::{format_mss, CycleReport, Header, LinkStatus, UnitStatus};
