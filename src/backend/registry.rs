//! Host-side link registry
//!
//! The AFHBA link driver publishes one control directory per local link and
//! one job file per data-mover. [`LinkRegistry`] is the read-only view the
//! engine uses; [`DriverRegistry`] reads the driver's files.
//!
//! Files read, relative to the driver root:
//!
//! - `dev/rtm-t.N.ctrl/acq_ident` - hostname of the attached unit
//! - `dev/rtm-t.N.ctrl/acq_port` - remote port letter (A, B, C)
//! - `dev/rtm-t.N.ctrl/aurora` - lane flags (`LANE_UP`, `RPCIE_INIT`)
//! - `proc/driver/afhba/afhba.N/Job` - `PID=` `rx=` `rx_rate=` `STATUS=` tokens
//! - `sys/module/afhba/parameters/buffer_len` - buffer size in bytes

use crate::error::{Result, StreamError};
use crate::types::{Connection, LinkState, StreamState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Read-only view of local links and their data-movers
pub trait LinkRegistry: Send + Sync {
    /// Every local link with a unit attached, ordered by link index
    fn list_connections(&self) -> Result<Vec<Connection>>;

    /// Lane flags for a link
    fn link_state(&self, link: u32) -> Result<LinkState>;

    /// PID of the data-mover bound to a link, if one is running
    fn stream_pid(&self, link: u32) -> Result<Option<u32>>;

    /// Progress snapshot for a link's data-mover
    fn stream_state(&self, link: u32) -> Result<StreamState>;

    /// Buffer size in bytes
    fn buffer_length(&self, link: u32) -> Result<u64>;
}

/// Registry backed by the link driver's files
#[derive(Debug, Clone)]
pub struct DriverRegistry {
    root: PathBuf,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new("/")
    }
}

impl DriverRegistry {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn ctrl_dir(&self, link: u32) -> PathBuf {
        self.root.join("dev").join(format!("rtm-t.{}.ctrl", link))
    }

    fn job_file(&self, link: u32) -> PathBuf {
        self.root
            .join("proc/driver/afhba")
            .join(format!("afhba.{}", link))
            .join("Job")
    }

    fn read_knob(path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| StreamError::Registry(format!("{}: {}", path.display(), e)))
    }

    fn read_job(&self, link: u32) -> Result<HashMap<String, String>> {
        let text = Self::read_knob(&self.job_file(link))?;
        Ok(parse_tokens(&text))
    }
}

/// Collect `KEY=VALUE` tokens; bare tokens map to an empty value
fn parse_tokens(text: &str) -> HashMap<String, String> {
    text.split_whitespace()
        .map(|tok| match tok.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (tok.to_string(), String::new()),
        })
        .collect()
}

/// A flag is set when present bare, or present with a non-zero value
fn flag(tokens: &HashMap<String, String>, name: &str) -> bool {
    match tokens.get(name) {
        Some(v) => v != "0",
        None => false,
    }
}

impl LinkRegistry for DriverRegistry {
    fn list_connections(&self) -> Result<Vec<Connection>> {
        let dev = self.root.join("dev");
        let entries = match std::fs::read_dir(&dev) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StreamError::Registry(format!("{}: {}", dev.display(), e))),
        };

        let mut connections = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(link) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix("rtm-t."))
                .and_then(|n| n.strip_suffix(".ctrl"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let ctrl = entry.path();
            // Links without a unit attached have no ident
            let Ok(unit) = Self::read_knob(&ctrl.join("acq_ident")) else {
                continue;
            };
            if unit.is_empty() {
                continue;
            }
            let Ok(port) = Self::read_knob(&ctrl.join("acq_port")) else {
                continue;
            };
            match port.parse() {
                Ok(port) => connections.push(Connection { unit, port, link }),
                Err(_) => tracing::warn!("afhba.{}: unrecognised port {:?}", link, port),
            }
        }

        connections.sort_by_key(|c| c.link);
        Ok(connections)
    }

    fn link_state(&self, link: u32) -> Result<LinkState> {
        let text = Self::read_knob(&self.ctrl_dir(link).join("aurora"))?;
        let tokens = parse_tokens(&text);
        Ok(LinkState {
            lane_up: flag(&tokens, "LANE_UP"),
            root_complex_init: flag(&tokens, "RPCIE_INIT"),
        })
    }

    fn stream_pid(&self, link: u32) -> Result<Option<u32>> {
        let path = self.job_file(link);
        if !path.exists() {
            return Ok(None);
        }
        let job = self.read_job(link)?;
        Ok(job
            .get("PID")
            .and_then(|pid| pid.parse::<u32>().ok())
            .filter(|pid| *pid != 0))
    }

    fn stream_state(&self, link: u32) -> Result<StreamState> {
        let job = self.read_job(link)?;
        Ok(StreamState {
            rx_rate: job
                .get("rx_rate")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            rx: job.get("rx").and_then(|v| v.parse().ok()).unwrap_or(0),
            status: job.get("STATUS").cloned().unwrap_or_default(),
        })
    }

    fn buffer_length(&self, _link: u32) -> Result<u64> {
        let path = self.root.join("sys/module/afhba/parameters/buffer_len");
        let text = Self::read_knob(&path)?;
        text.parse()
            .map_err(|_| StreamError::Registry(format!("bad buffer_len {:?}", text)))
    }
}
