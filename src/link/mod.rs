//! Local links: health checks and data-mover processes

pub mod health;
pub mod stream;

pub use health::{
    AuditEntry, AuditReport, DownReason, LinkHealth, LinkHealthMonitor, ResetEntry, ResetOutcome,
};
pub use stream::{CheckerArgs, Stream, StreamCommand, CHECKER_LOG};
