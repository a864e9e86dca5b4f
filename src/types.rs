//! Core data types for hts-multistream
//!
//! This module contains the value types that flow between the engine's
//! components: remote port designators, site/channel selections, observed
//! unit and link states, and the scratch-pad descriptor.
//!
//! # Main Types
//!
//! - [`RemotePort`] - Comms aggregator port on a unit (A, B, C)
//! - [`SiteList`] - Ordered site → active-channel-count selection
//! - [`UnitState`] - Remote lifecycle state as reported by the unit
//! - [`LinkState`] - Lane flags read from the host link driver
//! - [`StreamState`] - Data-mover progress read from the host link driver
//! - [`Connection`] - One entry of the host connection table
//! - [`Spad`] - Scratch-pad descriptor (`enabled,len,mode`)
//! - [`Lifecycle`] - Locally driven phase of a unit

use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status tag reported by a data-mover that has finished its buffer budget
pub const STOP_DONE: &str = "STOP_DONE";

/// Comms aggregator port on a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RemotePort {
    A,
    B,
    C,
}

impl RemotePort {
    /// Every port, in map order
    pub const ALL: [RemotePort; 3] = [RemotePort::A, RemotePort::B, RemotePort::C];

    /// Ports that carry an optical link and expose TX_DISABLE
    pub const OPTICAL: [RemotePort; 2] = [RemotePort::A, RemotePort::B];

    /// Single-letter designator
    pub fn letter(&self) -> char {
        match self {
            RemotePort::A => 'A',
            RemotePort::B => 'B',
            RemotePort::C => 'C',
        }
    }
}

impl fmt::Display for RemotePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for RemotePort {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(RemotePort::A),
            "B" => Ok(RemotePort::B),
            "C" => Ok(RemotePort::C),
            other => Err(StreamError::Config(format!("Invalid port: {}", other))),
        }
    }
}

/// One site and its active channel count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    /// Site number on the unit (1-based)
    pub site: u8,
    /// Active channels reported by the site
    pub channels: u32,
}

/// Ordered selection of sites, in the unit's aggregator order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteList(Vec<Site>);

impl SiteList {
    /// Create an empty selection
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a site, ignoring duplicates
    pub fn push(&mut self, site: u8, channels: u32) {
        if !self.contains(site) {
            self.0.push(Site { site, channels });
        }
    }

    /// Check whether a site is selected
    pub fn contains(&self, site: u8) -> bool {
        self.0.iter().any(|s| s.site == site)
    }

    /// Channel count for a site
    pub fn channels(&self, site: u8) -> Option<u32> {
        self.0.iter().find(|s| s.site == site).map(|s| s.channels)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Site> {
        self.0.iter()
    }

    /// Site numbers in order
    pub fn site_ids(&self) -> Vec<u8> {
        self.0.iter().map(|s| s.site).collect()
    }

    /// Split at the midpoint: (first half, second half)
    ///
    /// With an odd count the extra site lands in the second half.
    pub fn bisect(&self) -> (SiteList, SiteList) {
        let mid = self.0.len() / 2;
        (
            SiteList(self.0[..mid].to_vec()),
            SiteList(self.0[mid..].to_vec()),
        )
    }
}

impl FromIterator<Site> for SiteList {
    fn from_iter<I: IntoIterator<Item = Site>>(iter: I) -> Self {
        let mut list = SiteList::new();
        for site in iter {
            list.push(site.site, site.channels);
        }
        list
    }
}

/// Renders as a comma list (`1,2,3`), the form the aggregator expects
impl fmt::Display for SiteList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.0.iter().map(|s| s.site.to_string()).collect();
        write!(f, "{}", ids.join(","))
    }
}

/// Remote lifecycle state as reported by a unit
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnitState {
    /// Not yet polled
    #[default]
    Unknown,
    Idle,
    Arm,
    Run,
    /// Any other unit-specific state (STOP, CLEANUP, ...)
    Other(String),
}

impl UnitState {
    /// Parse a state report; the state is the last whitespace-separated token
    pub fn parse(report: &str) -> Self {
        match report.split_whitespace().last() {
            None => UnitState::Unknown,
            Some("IDLE") => UnitState::Idle,
            Some("ARM") => UnitState::Arm,
            Some("RUN") => UnitState::Run,
            Some(other) => UnitState::Other(other.to_string()),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, UnitState::Idle)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Unknown => write!(f, "None"),
            UnitState::Idle => write!(f, "IDLE"),
            UnitState::Arm => write!(f, "ARM"),
            UnitState::Run => write!(f, "RUN"),
            UnitState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Lane flags for one local link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkState {
    pub lane_up: bool,
    pub root_complex_init: bool,
}

impl LinkState {
    pub fn is_good(&self) -> bool {
        self.lane_up && self.root_complex_init
    }
}

/// Progress snapshot of one data-mover process
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamState {
    /// Buffers moved per second
    pub rx_rate: f64,
    /// Buffers moved in total
    pub rx: u64,
    /// Coarse status tag
    pub status: String,
}

impl StreamState {
    pub fn is_stop_done(&self) -> bool {
        self.status == STOP_DONE
    }
}

/// One entry of the host connection table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Hostname of the remote unit
    pub unit: String,
    /// Remote port the local link is cabled to
    pub port: RemotePort,
    /// Local link index (afhba.N)
    pub link: u32,
}

/// Scratch-pad descriptor: `enabled,len,mode` (e.g. `1,16,0`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spad {
    pub enabled: bool,
    /// Number of 32-bit scratch-pad columns appended to each sample
    pub len: u32,
    pub mode: u32,
}

impl FromStr for Spad {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().split(',').map(str::trim).collect();
        let parse = |i: usize| -> Result<u32> {
            fields
                .get(i)
                .ok_or_else(|| StreamError::Config(format!("Invalid spad: {}", s)))?
                .parse::<u32>()
                .map_err(|_| StreamError::Config(format!("Invalid spad: {}", s)))
        };
        let enabled = parse(0)? != 0;
        let len = parse(1)?;
        let mode = if fields.len() > 2 { parse(2)? } else { 0 };
        Ok(Spad { enabled, len, mode })
    }
}

impl fmt::Display for Spad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", u8::from(self.enabled), self.len, self.mode)
    }
}

/// Locally driven phase of a unit
///
/// ARM and RUN are not phases: they are observed through [`UnitState`]
/// once the unit has been started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Unconfigured,
    Configured,
    Initialized,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Unconfigured => "UNCONFIGURED",
            Lifecycle::Configured => "CONFIGURED",
            Lifecycle::Initialized => "INITIALIZED",
            Lifecycle::Started => "STARTED",
            Lifecycle::Stopping => "STOPPING",
            Lifecycle::Stopped => "STOPPED",
        };
        write!(f, "{}", name)
    }
}
