//! Data-mover process lifecycle for one local link
//!
//! Each [`Stream`] owns at most one data-mover bound to its local link id.
//! The process is started detached; its PID and progress are only ever
//! observed through the link registry.

use super::health::LinkHealth;
use crate::backend::{HostServices, LinkRegistry, ProcessLauncher};
use crate::config::{HostConfig, StreamConfig, Timings};
use crate::error::{Result, StreamError};
use crate::types::{RemotePort, SiteList, StreamState};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Name of the ramp checker's log inside a stream's output directory
pub const CHECKER_LOG: &str = "checker.log";

/// Ramp checker stage appended to a stream command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerArgs {
    pub checker: String,
    /// Data plus scratch-pad columns per row
    pub total_columns: u32,
    /// Data columns per row
    pub data_columns: u32,
    /// Expected ramp increment
    pub step: u32,
    pub logfile: PathBuf,
}

/// Shell command that starts a data-mover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCommand {
    pub sudo: bool,
    pub link: u32,
    pub nbuffers: u64,
    pub concat: u32,
    pub recycle: bool,
    pub outroot: PathBuf,
    pub streamer: String,
    pub checker: Option<CheckerArgs>,
}

impl fmt::Display for StreamCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sudo {
            write!(f, "sudo ")?;
        }
        write!(
            f,
            "RTM_DEVNUM={} NBUFS={} CONCAT={} RECYCLE={} OUTROOT={} {}",
            self.link,
            self.nbuffers,
            self.concat,
            u8::from(self.recycle),
            self.outroot.display(),
            self.streamer
        )?;
        if let Some(c) = &self.checker {
            write!(
                f,
                " | {} -N1 -m {} -c {} -s {} -i 1 -L {}",
                c.checker,
                c.total_columns,
                c.data_columns,
                c.step,
                c.logfile.display()
            )?;
        }
        Ok(())
    }
}

/// One local link and its data-mover
pub struct Stream {
    /// Local link id (afhba.N)
    pub link: u32,
    /// Remote port the link is cabled to
    pub port: RemotePort,
    /// Owning unit
    pub unit: String,
    /// Sites carried on this link
    pub sites: SiteList,
    outroot: PathBuf,
    logfile: PathBuf,
    checked: bool,
    pid: AtomicU32,
    health: Mutex<Option<LinkHealth>>,
    registry: Arc<dyn LinkRegistry>,
    launcher: Arc<dyn ProcessLauncher>,
    timings: Timings,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("link", &self.link)
            .field("port", &self.port)
            .field("unit", &self.unit)
            .field("sites", &self.sites.to_string())
            .field("pid", &self.pid())
            .finish()
    }
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        link: u32,
        port: RemotePort,
        unit: &str,
        sites: SiteList,
        output_root: &Path,
        checked: bool,
        services: &HostServices,
        timings: &Timings,
    ) -> Self {
        let outroot = output_root.join(format!("afhba.{}", link)).join(unit);
        let logfile = outroot.join(CHECKER_LOG);
        Self {
            link,
            port,
            unit: unit.to_string(),
            sites,
            outroot,
            logfile,
            checked,
            pid: AtomicU32::new(0),
            health: Mutex::new(None),
            registry: services.registry.clone(),
            launcher: services.launcher.clone(),
            timings: timings.clone(),
        }
    }

    pub fn outroot(&self) -> &Path {
        &self.outroot
    }

    pub fn logfile(&self) -> &Path {
        &self.logfile
    }

    /// PID recorded at spawn
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Result of the last health check
    pub fn health(&self) -> Option<LinkHealth> {
        self.health.lock().ok().and_then(|h| h.clone())
    }

    pub fn record_health(&self, health: LinkHealth) {
        if let Ok(mut slot) = self.health.lock() {
            *slot = Some(health);
        }
    }

    /// Build the data-mover command for this link
    ///
    /// `columns` is `(data, spad, step)` when integrity checking is requested.
    pub fn command(
        &self,
        stream: &StreamConfig,
        host: &HostConfig,
        columns: Option<(u32, u32, u32)>,
    ) -> StreamCommand {
        StreamCommand {
            sudo: host.sudo,
            link: self.link,
            nbuffers: stream.nbuffers,
            concat: stream.concat,
            recycle: stream.recycle,
            outroot: self.outroot.clone(),
            streamer: host.streamer.clone(),
            checker: columns.map(|(data_columns, spad_columns, step)| CheckerArgs {
                checker: host.checker.clone(),
                total_columns: data_columns + spad_columns,
                data_columns,
                step,
                logfile: self.logfile.clone(),
            }),
        }
    }

    /// `hexdump` invocation that prints the first buffer one row per line
    pub fn hexdump_command(&self, total_columns: u32) -> String {
        format!(
            "hexdump -e '{}/4 \"%08x,\" \"\\n\"' {}/000000/{}.00",
            total_columns,
            self.outroot.display(),
            self.link
        )
    }

    /// Create the output directory, and the checker log if checking
    pub fn prepare(&self) -> Result<()> {
        self.launcher.prepare_dir(&self.outroot)?;
        if self.checked {
            self.launcher.touch(&self.logfile)?;
        }
        Ok(())
    }

    /// Start the data-mover and wait for its PID to appear
    pub fn spawn(&self, command: &StreamCommand) -> Result<u32> {
        let command = command.to_string();
        tracing::debug!("afhba.{}: {}", self.link, command);
        self.launcher.spawn_detached(&command)?;

        let start = Instant::now();
        loop {
            if let Some(pid) = self.registry.stream_pid(self.link)? {
                tracing::info!("Started afhba.{} with PID {}", self.link, pid);
                self.pid.store(pid, Ordering::SeqCst);
                return Ok(pid);
            }
            if start.elapsed() > self.timings.spawn_timeout() {
                return Err(StreamError::Timeout {
                    message: format!("afhba.{} failed to start", self.link),
                    elapsed: start.elapsed(),
                });
            }
            std::thread::sleep(self.timings.pid_poll());
        }
    }

    pub fn read_state(&self) -> Result<StreamState> {
        self.registry.stream_state(self.link)
    }

    /// First line of the checker log, when checking
    pub fn read_result(&self) -> Option<String> {
        if !self.checked {
            return None;
        }
        let text = std::fs::read_to_string(&self.logfile).ok()?;
        let line = text.lines().next()?.trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    /// Kill any data-mover already bound to this link
    pub fn kill_if_active(&self) -> Result<()> {
        let Some(pid) = self.registry.stream_pid(self.link)? else {
            return Ok(());
        };
        tracing::warn!("Killing afhba.{} with pid: {}", self.link, pid);
        self.kill_and_wait(pid)
    }

    /// Kill the data-mover this stream spawned, if it is still bound
    ///
    /// A process that already exited, or a link now owned by another PID,
    /// is left alone.
    pub fn teardown(&self) -> Result<()> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        if self.registry.stream_pid(self.link)? != Some(pid) {
            self.pid.store(0, Ordering::SeqCst);
            return Ok(());
        }
        tracing::info!("Tearing down afhba.{} (pid {})", self.link, pid);
        self.kill_and_wait(pid)
    }

    fn kill_and_wait(&self, pid: u32) -> Result<()> {
        if let Err(e) = self.launcher.kill(pid) {
            tracing::warn!("kill {} failed: {}", pid, e);
        }
        for _ in 0..self.timings.kill_retries {
            std::thread::sleep(self.timings.kill_retry());
            if self.registry.stream_pid(self.link)?.is_none() {
                self.pid.store(0, Ordering::SeqCst);
                return Ok(());
            }
        }

        Err(StreamError::Process {
            link: self.link,
            message: format!("stream failed to die (pid {})", pid),
        })
    }
}
