//! Per-cycle status snapshots
//!
//! Each control loop iteration produces one [`CycleReport`]. Nothing is kept
//! between cycles except what the loop carries itself.

use crate::types::{RemotePort, UnitState, STOP_DONE};
use crate::unit::Unit;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// `m:ss`
pub fn format_mss(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// One link's progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    pub link: u32,
    pub port: RemotePort,
    /// MB/s
    pub rate_mb: f64,
    /// MB moved so far
    pub total_mb: f64,
    pub status: String,
    /// First line of the checker log
    pub result: Option<String>,
}

impl LinkStatus {
    pub fn is_ended(&self) -> bool {
        self.status == STOP_DONE
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  afhba.{}:{} {:.1} MB/s, {:.0} MB {}",
            self.link, self.port, self.rate_mb, self.total_mb, self.status
        )?;
        if let Some(result) = &self.result {
            write!(f, " {}", result)?;
        }
        Ok(())
    }
}

/// One unit's cached state and its links
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub state: UnitState,
    pub links: Vec<LinkStatus>,
}

impl UnitStatus {
    /// Read the cached state and every link of a unit
    pub fn collect(unit: &Unit, buffer_mb: f64) -> Self {
        let links = unit
            .links()
            .map(|stream| {
                let state = stream.read_state().unwrap_or_else(|e| {
                    tracing::debug!("afhba.{}: {}", stream.link, e);
                    Default::default()
                });
                LinkStatus {
                    link: stream.link,
                    port: stream.port,
                    rate_mb: state.rx_rate * buffer_mb,
                    total_mb: state.rx as f64 * buffer_mb,
                    status: state.status,
                    result: stream.read_result(),
                }
            })
            .collect();

        Self {
            name: unit.name().to_string(),
            state: unit.state(),
            links,
        }
    }

    pub fn ended_links(&self) -> usize {
        self.links.iter().filter(|l| l.is_ended()).count()
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.state)?;
        for link in &self.links {
            write!(f, "\n{}", link)?;
        }
        Ok(())
    }
}

/// Run-wide header of a frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Header {
    pub elapsed: Duration,
    /// Time since every unit first ran, with the limit
    pub progress: Option<(Duration, Duration)>,
    pub max_mb: f64,
    pub buffer_mb: f64,
    pub cpu: Option<f32>,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.progress {
            Some((done, limit)) => write!(
                f,
                "Runtime: {} / {}",
                format_mss(done),
                format_mss(limit)
            )?,
            None => write!(f, "Runtime: {} secs", self.elapsed.as_secs())?,
        }
        write!(
            f,
            "\nMax: {:.0} MB  Buffer Length: {} MB",
            self.max_mb, self.buffer_mb
        )?;
        if let Some(cpu) = self.cpu {
            write!(f, "\nCPU: {:.1}%", cpu)?;
        }
        Ok(())
    }
}

/// Everything observed in one cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub header: Header,
    pub trigger: String,
    pub units: Vec<UnitStatus>,
}

impl CycleReport {
    /// Units whose cached state is RUN
    pub fn running(&self) -> usize {
        self.count(UnitState::Run)
    }

    pub fn armed(&self) -> usize {
        self.count(UnitState::Arm)
    }

    fn count(&self, state: UnitState) -> usize {
        self.units.iter().filter(|u| u.state == state).count()
    }

    /// Every unit is waiting for its trigger
    pub fn all_armed(&self) -> bool {
        !self.units.is_empty() && self.armed() == self.units.len()
    }

    pub fn all_running(&self) -> bool {
        !self.units.is_empty() && self.running() == self.units.len()
    }

    pub fn ended_streams(&self) -> usize {
        self.units.iter().map(UnitStatus::ended_links).sum()
    }

    pub fn total_streams(&self) -> usize {
        self.units.iter().map(|u| u.links.len()).sum()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)?;
        if !self.trigger.is_empty() {
            write!(f, "\n{}", self.trigger)?;
        }
        for unit in &self.units {
            write!(f, "\n{}", unit)?;
        }
        Ok(())
    }
}
