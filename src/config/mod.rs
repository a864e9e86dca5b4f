//! Configuration module for hts-multistream
//!
//! This module handles run configuration including:
//! - Capture parameters (buffer budget, duration, recycling, integrity checks)
//! - Acquisition parameters written to every unit during configure
//! - Trigger release options (mutually exclusive)
//! - Host paths (output ramdisk, data-mover binaries, link driver tree)
//! - Engine timings (settle delays, retry budgets, poll intervals)
//!
//! # Config Location
//!
//! A run configuration is read from the TOML file given with `--config`, or
//! from `hts-multistream/config.toml` under the platform config directory:
//! - **Linux**: `~/.config/hts-multistream/config.toml`
//! - **macOS**: `~/Library/Application Support/hts-multistream/config.toml`
//!
//! Command-line flags override whatever the file provides.
//!
//! # Example
//!
//! ```toml
//! units = ["acq2106_133", "acq2106_176"]
//! map = "133:A:1/133:B:2/ALL:BOTH:ALL"
//!
//! [stream]
//! nbuffers = 2000
//! recycle = false
//!
//! [acquisition]
//! spad = "1,8,1"
//! params = { "s1.trg" = "1,1,1" }
//!
//! [trigger]
//! sig_gen = "sg0106"
//! ```

pub mod placement;

pub use placement::{PlacementMap, SiteSelector, UnitSelector};

use crate::backend::Key;
use crate::error::{Result, StreamError};
use crate::trigger::TriggerSelection;
use crate::types::Spad;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "hts-multistream";

/// Config filename inside the app config directory
pub const CONFIG_FILE: &str = "config.toml";

/// Default placement: every port of every unit gets every site
pub const DEFAULT_MAP: &str = "ALL:BOTH:ALL";

/// Default capture budget in buffers
pub const DEFAULT_NBUFFERS: u64 = 5000;

/// Buffer count used when a duration, not a buffer budget, ends the run
pub const UNBOUNDED_NBUFFERS: u64 = 9_999_999_999;

/// Path of the default config file, if a config directory exists
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

// ==================== Run Config ====================

/// Complete configuration for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Unit hostnames to stream from
    #[serde(default)]
    pub units: Vec<String>,

    /// Placement map (`UNIT:PORT:SITES` joined by `/`)
    #[serde(default = "default_map")]
    pub map: String,

    /// Log per-unit attach and per-link command details
    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    pub trigger: TriggerOptions,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub timings: Timings,
}

fn default_map() -> String {
    DEFAULT_MAP.to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            units: Vec::new(),
            map: default_map(),
            verbose: false,
            stream: StreamConfig::default(),
            acquisition: AcquisitionConfig::default(),
            trigger: TriggerOptions::default(),
            host: HostConfig::default(),
            timings: Timings::default(),
        }
    }
}

impl RunConfig {
    /// Load a run config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StreamError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            StreamError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })
    }

    /// Load from an explicit path, else the default location, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading run config from {:?}", path);
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| StreamError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Parsed placement map
    pub fn placement(&self) -> Result<PlacementMap> {
        self.map.parse()
    }

    /// Parsed scratch-pad override, if one was given
    pub fn spad(&self) -> Result<Option<Spad>> {
        self.acquisition.spad.as_deref().map(str::parse).transpose()
    }

    /// Validate everything that can be checked without touching hardware
    pub fn validate(&self) -> Result<()> {
        if self.units.is_empty() {
            return Err(StreamError::Config("No units given".to_string()));
        }
        TriggerSelection::from_options(&self.trigger)?;
        self.placement()?;
        self.spad()?;
        for key in self.acquisition.params.keys() {
            Key::from_param(key)?;
        }
        Ok(())
    }
}

// ==================== Stream Config ====================

/// Capture and data-mover parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum capture length in buffers
    #[serde(default = "default_nbuffers")]
    pub nbuffers: u64,

    /// Maximum capture length in seconds (0 = no limit)
    #[serde(default)]
    pub secs: u64,

    /// Concatenate buffers (concat=2 means 3 buffers combined)
    #[serde(default)]
    pub concat: u32,

    /// Overwrite data (ring-buffer mode on the output area)
    #[serde(default = "default_true")]
    pub recycle: bool,

    /// Delete stale output before the run
    #[serde(default = "default_true")]
    pub delete: bool,

    /// Derive nbuffers from free memory (only with recycle off)
    #[serde(default)]
    pub auto_size: bool,

    /// Pipe each stream through the sequential ramp checker
    #[serde(default)]
    pub check_spad: bool,

    /// Log a hexdump command for the first buffer of each link
    #[serde(default)]
    pub hex_dump: bool,

    /// Report host CPU usage while running
    #[serde(default)]
    pub cpu_usage: bool,

    /// Configure units then exit without streaming
    #[serde(default)]
    pub dry_run: bool,
}

fn default_nbuffers() -> u64 {
    DEFAULT_NBUFFERS
}

fn default_true() -> bool {
    true
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            nbuffers: DEFAULT_NBUFFERS,
            secs: 0,
            concat: 0,
            recycle: true,
            delete: true,
            auto_size: false,
            check_spad: false,
            hex_dump: false,
            cpu_usage: false,
            dry_run: false,
        }
    }
}

impl StreamConfig {
    /// Duration limit, if one was requested
    pub fn duration(&self) -> Option<Duration> {
        (self.secs > 0).then(|| Duration::from_secs(self.secs))
    }
}

// ==================== Acquisition Config ====================

/// Parameters written to every unit during configure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Scratch-pad override, e.g. `1,16,0` (None = keep the unit's)
    #[serde(default)]
    pub spad: Option<String>,

    /// Decimation factor
    #[serde(default)]
    pub decimate: Option<u32>,

    /// Trigger d0 source
    #[serde(default)]
    pub sig_src_trg_0: Option<String>,

    /// Trigger d1 source
    #[serde(default)]
    pub sig_src_trg_1: Option<String>,

    /// Burst length written to site 1
    #[serde(default)]
    pub rtm_translen: Option<u32>,

    /// Free-form site-scoped knobs, `"s<site>.<knob>" = "<value>"`
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

// ==================== Trigger Options ====================

/// Trigger release options; at most one may be set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerOptions {
    /// Signal generator to trigger when all units are armed
    #[serde(default)]
    pub sig_gen: Option<String>,

    /// Command the first unit sends when all units are armed
    #[serde(default)]
    pub wrtd_txi: Option<String>,

    /// Master trigger source value (free-running master)
    #[serde(default)]
    pub mtrg: Option<String>,
}

// ==================== Host Config ====================

/// Host-side paths and privileges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Output root; must be a ramdisk
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Data-mover executable
    #[serde(default = "default_streamer")]
    pub streamer: String,

    /// Sequential ramp checker executable
    #[serde(default = "default_checker")]
    pub checker: String,

    /// Prefix privileged commands with sudo
    #[serde(default = "default_true")]
    pub sudo: bool,

    /// Root under which the link driver exposes `dev/`, `proc/` and `sys/`
    #[serde(default = "default_driver_root")]
    pub driver_root: PathBuf,

    /// Mount table used to verify the output root is volatile
    #[serde(default = "default_mounts_file")]
    pub mounts_file: PathBuf,

    /// Control port base of the unit site service
    #[serde(default = "default_site_port_base")]
    pub site_port_base: u16,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("/mnt")
}

fn default_streamer() -> String {
    "./STREAM/rtm-t-stream-disk".to_string()
}

fn default_checker() -> String {
    "./FUNCTIONAL_TESTS/isramp".to_string()
}

fn default_driver_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_mounts_file() -> PathBuf {
    PathBuf::from("/proc/mounts")
}

fn default_site_port_base() -> u16 {
    4220
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            streamer: default_streamer(),
            checker: default_checker(),
            sudo: true,
            driver_root: default_driver_root(),
            mounts_file: default_mounts_file(),
            site_port_base: default_site_port_base(),
        }
    }
}

// ==================== Timings ====================

/// Delays, timeouts and retry budgets used by the engine
///
/// All durations are in milliseconds in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// How long a spawned data-mover has to report a PID
    pub spawn_timeout_ms: u64,
    /// Interval between PID lookups while waiting for a spawn
    pub pid_poll_ms: u64,
    /// Re-checks after force-killing a stale data-mover
    pub kill_retries: u32,
    /// Interval between those re-checks
    pub kill_retry_ms: u64,
    /// Link reset attempts before giving up
    pub reset_attempts: u32,
    /// Settle time after each TX_DISABLE edge
    pub toggle_settle_ms: u64,
    /// Wait after stopping a unit that was not idle at start
    pub restart_settle_ms: u64,
    /// Checks for IDLE after issuing stop
    pub stop_wait_attempts: u32,
    /// Interval between those checks
    pub stop_wait_ms: u64,
    /// Interval of each unit's state poller
    pub state_poll_ms: u64,
    /// Minimum control loop cycle
    pub cycle_ms: u64,
    /// Extra time granted to a stop fan-out beyond the per-unit wait
    pub stop_grace_ms: u64,
    /// TCP connect and read timeout for remote units
    pub remote_timeout_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: 5000,
            pid_poll_ms: 500,
            kill_retries: 4,
            kill_retry_ms: 1000,
            reset_attempts: 5,
            toggle_settle_ms: 500,
            restart_settle_ms: 2000,
            stop_wait_attempts: 10,
            stop_wait_ms: 1000,
            state_poll_ms: 1000,
            cycle_ms: 500,
            stop_grace_ms: 2000,
            remote_timeout_ms: 5000,
        }
    }
}

impl Timings {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn pid_poll(&self) -> Duration {
        Duration::from_millis(self.pid_poll_ms)
    }

    pub fn kill_retry(&self) -> Duration {
        Duration::from_millis(self.kill_retry_ms)
    }

    pub fn toggle_settle(&self) -> Duration {
        Duration::from_millis(self.toggle_settle_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }

    pub fn state_poll(&self) -> Duration {
        Duration::from_millis(self.state_poll_ms)
    }

    pub fn cycle(&self) -> Duration {
        Duration::from_millis(self.cycle_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Upper bound on how long a single unit's stop can take
    pub fn stop_deadline(&self) -> Duration {
        self.stop_wait() * (self.stop_wait_attempts + 1) + Duration::from_millis(self.stop_grace_ms)
    }

    /// Near-zero timings for tests and simulations
    pub fn fast() -> Self {
        Self {
            spawn_timeout_ms: 200,
            pid_poll_ms: 5,
            kill_retries: 4,
            kill_retry_ms: 5,
            reset_attempts: 5,
            toggle_settle_ms: 0,
            restart_settle_ms: 5,
            stop_wait_attempts: 10,
            stop_wait_ms: 10,
            state_poll_ms: 5,
            cycle_ms: 5,
            stop_grace_ms: 500,
            remote_timeout_ms: 200,
        }
    }
}
