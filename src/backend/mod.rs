//! Backend module: every collaborator the engine talks to
//!
//! The engine never touches sockets, driver files or processes directly. It
//! goes through the traits defined here, bundled in [`HostServices`]:
//!
//! - [`Connector`] / [`RemoteDevice`] - Attribute access to acquisition units
//! - [`LinkRegistry`] - Local link table, lane flags and data-mover job state
//! - [`ProcessLauncher`] - Detached data-mover spawn and forced kill
//! - [`HostSystem`] - Free memory, ramdisk detection, CPU usage
//! - [`SignalGenerator`] - External trigger instrument
//!
//! # Components
//!
//! - [`TcpDevice`] - Line-oriented TCP transport to a unit's site services
//! - [`DriverRegistry`] - Reads the AFHBA driver's control and job files
//! - [`ShellLauncher`] - `sh -c` with the child in its own process group
//! - [`LocalHost`] - `sysinfo` and `/proc/mounts` backed host queries
//! - [`mock`] - In-memory versions of all of the above
//!
//! # Example
//!
//! ```ignore
//! use hts_multistream::backend::HostServices;
//! use hts_multistream::config::RunConfig;
//!
//! let config = RunConfig::default();
//! let services = HostServices::system(&config);
//! let connections = services.registry.list_connections()?;
//! ```

pub mod device;
pub mod host;
pub mod launcher;
pub mod mock;
pub mod registry;
pub mod siggen;

pub use device::{Connector, Key, RemoteDevice, Scope, TcpConnector, TcpDevice};
pub use host::{HostSystem, LocalHost};
pub use launcher::{ProcessLauncher, ShellLauncher};
pub use registry::{DriverRegistry, LinkRegistry};
pub use siggen::{ScpiSignalGenerator, SignalGenerator};

use crate::config::RunConfig;
use std::sync::Arc;

/// Shared handles to every external collaborator
#[derive(Clone)]
pub struct HostServices {
    pub connector: Arc<dyn Connector>,
    pub registry: Arc<dyn LinkRegistry>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub host: Arc<dyn HostSystem>,
}

impl HostServices {
    /// Services backed by the real network, driver and host
    pub fn system(config: &RunConfig) -> Self {
        Self {
            connector: Arc::new(TcpConnector {
                port_base: config.host.site_port_base,
                timeout: config.timings.remote_timeout(),
            }),
            registry: Arc::new(DriverRegistry::new(&config.host.driver_root)),
            launcher: Arc::new(ShellLauncher::new(config.host.sudo)),
            host: Arc::new(LocalHost::new(&config.host.mounts_file, config.host.sudo)),
        }
    }
}
