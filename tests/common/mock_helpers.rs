//! Mock construction helpers

use super::builders::UnitSpec;
use hts_multistream::backend::mock::{
    MockConnector, MockDevice, MockHost, MockLauncher, MockRegistry,
};
use hts_multistream::backend::{HostServices, RemoteDevice};
use hts_multistream::types::RemotePort;
use std::sync::Arc;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// A host with simulated units cabled to it
pub struct MockSystem {
    pub services: HostServices,
    pub connector: Arc<MockConnector>,
    pub registry: Arc<MockRegistry>,
    pub launcher: Arc<MockLauncher>,
    pub host: Arc<MockHost>,
    pub devices: Vec<Arc<MockDevice>>,
}

impl MockSystem {
    pub fn new(units: &[UnitSpec]) -> Self {
        let registry = Arc::new(MockRegistry::default());
        let connector = Arc::new(MockConnector::new());
        let launcher = Arc::new(MockLauncher::new(registry.clone()));
        let host = Arc::new(MockHost::new(64 * GIB));

        let mut devices = Vec::new();
        for spec in units {
            for (port, link) in &spec.links {
                registry.connect(&spec.hostname, *port, *link);
            }
            let device = Arc::new(spec.device());
            connector.add(device.clone());
            devices.push(device);
        }

        Self {
            services: HostServices {
                connector: connector.clone(),
                registry: registry.clone(),
                launcher: launcher.clone(),
                host: host.clone(),
            },
            connector,
            registry,
            launcher,
            host,
            devices,
        }
    }

    pub fn device(&self, hostname: &str) -> Arc<MockDevice> {
        self.devices
            .iter()
            .find(|d| d.name() == hostname)
            .cloned()
            .unwrap_or_else(|| panic!("no mock device {}", hostname))
    }
}

/// Two units with one link each, the usual end-to-end layout
pub fn two_unit_system() -> MockSystem {
    MockSystem::new(&[
        UnitSpec::new("acq2106_001").link(RemotePort::A, 0),
        UnitSpec::new("acq2106_002").link(RemotePort::A, 1),
    ])
}
