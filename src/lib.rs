//! # hts-multistream: multi-unit high-throughput stream coordinator
//!
//! Coordinates continuous streaming from several networked acquisition
//! units into a host over AFHBA optical links. Each unit is configured over
//! its control network, each of its links gets a local data-mover process
//! writing to a ramdisk, and a single control loop watches every unit and
//! link until the streams finish, a duration runs out, or the run is
//! interrupted.
//!
//! ## Architecture
//!
//! - **Backend**: Trait seams for every external collaborator (remote units,
//!   the host link driver, process spawning, host resources, signal
//!   generators) plus in-memory mocks
//! - **Link**: Link health checks with optical reset recovery, and the
//!   data-mover lifecycle per link
//! - **Unit**: One acquisition unit; configure, initialize, start, stop
//! - **Planner**: Host memory checks and buffer sizing
//! - **Trigger**: One-shot trigger release once every unit is armed
//! - **Run**: The coordinator and its per-cycle status reports
//!
//! ## Example
//!
//! ```ignore
//! use hts_multistream::{backend::HostServices, config::RunConfig, run::Coordinator};
//!
//! let mut config = RunConfig::default();
//! config.units = vec!["acq2106_133".to_string(), "acq2106_176".to_string()];
//! config.stream.secs = 60;
//!
//! let services = HostServices::system(&config);
//! let summary = Coordinator::new(config, services)?.run()?;
//! println!("{}", summary);
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod link;
pub mod planner;
pub mod run;
pub mod trigger;
pub mod types;
pub mod unit;

// Re-export commonly used types
pub use backend::HostServices;
pub use config::RunConfig;
pub use error::{Result, StreamError};
pub use run::{Coordinator, RunOutcome, RunSummary};
pub use unit::Unit;
