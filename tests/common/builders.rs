//! Test data builders for creating test objects

use hts_multistream::backend::mock::MockDevice;
use hts_multistream::config::{RunConfig, Timings};
use hts_multistream::types::RemotePort;

/// Builder for one simulated unit and its cabling
#[derive(Clone)]
pub struct UnitSpec {
    pub hostname: String,
    pub sites: Vec<(u8, u32, bool)>,
    /// `(remote port, local link)`
    pub links: Vec<(RemotePort, u32)>,
    pub spad: Option<String>,
}

impl UnitSpec {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            sites: vec![(1, 32, false)],
            links: Vec::new(),
            spad: None,
        }
    }

    pub fn sites(mut self, sites: &[(u8, u32, bool)]) -> Self {
        self.sites = sites.to_vec();
        self
    }

    pub fn link(mut self, port: RemotePort, link: u32) -> Self {
        self.links.push((port, link));
        self
    }

    pub fn spad(mut self, spad: &str) -> Self {
        self.spad = Some(spad.to_string());
        self
    }

    pub fn device(&self) -> MockDevice {
        let device = MockDevice::new(&self.hostname).with_sites(&self.sites);
        match &self.spad {
            Some(spad) => device.with_spad(spad),
            None => device,
        }
    }
}

/// Builder for run configs with test timings
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    pub fn new(units: &[&str]) -> Self {
        let mut config = RunConfig::default();
        config.units = units.iter().map(|u| u.to_string()).collect();
        config.timings = Timings::fast();
        Self { config }
    }

    pub fn map(mut self, map: &str) -> Self {
        self.config.map = map.to_string();
        self
    }

    pub fn nbuffers(mut self, nbuffers: u64) -> Self {
        self.config.stream.nbuffers = nbuffers;
        self
    }

    pub fn secs(mut self, secs: u64) -> Self {
        self.config.stream.secs = secs;
        self
    }

    pub fn recycle(mut self, recycle: bool) -> Self {
        self.config.stream.recycle = recycle;
        self
    }

    pub fn cpu_usage(mut self) -> Self {
        self.config.stream.cpu_usage = true;
        self
    }

    pub fn sig_gen(mut self, name: &str) -> Self {
        self.config.trigger.sig_gen = Some(name.to_string());
        self
    }

    pub fn mtrg(mut self, source: &str) -> Self {
        self.config.trigger.mtrg = Some(source.to_string());
        self
    }

    pub fn timings(mut self, f: impl FnOnce(&mut Timings)) -> Self {
        f(&mut self.config.timings);
        self
    }

    pub fn build(self) -> RunConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_builder() {
        let config = RunConfigBuilder::new(&["acq2106_001"])
            .nbuffers(100)
            .sig_gen("sg0106")
            .build();

        assert_eq!(config.units, vec!["acq2106_001"]);
        assert_eq!(config.stream.nbuffers, 100);
        assert_eq!(config.trigger.sig_gen.as_deref(), Some("sg0106"));
        assert_eq!(config.timings.cycle_ms, Timings::fast().cycle_ms);
    }
}
