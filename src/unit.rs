//! One acquisition unit and the links it streams on
//!
//! A [`Unit`] is attached once from its name, the placement map and the host
//! connection table. Its link set is fixed from then on. The control thread
//! drives configure → initialize → start → stop; a detached poller keeps
//! the cached remote state fresh in between.

use crate::backend::{HostServices, Key, RemoteDevice};
use crate::config::{placement, PlacementMap, RunConfig, StreamConfig};
use crate::error::{Result, ResultExt, StreamError};
use crate::link::{LinkHealth, LinkHealthMonitor, Stream};
use crate::types::{Connection, Lifecycle, SiteList, Spad, UnitState};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Hostnames must end in `_` and a three digit unit number
pub const HOSTNAME_PATTERN: &str = r"^.+_([0-9]{3})$";

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The unit reported IDLE
    Stopped,
    /// The unit did not reach IDLE in time
    TimedOut,
    /// Stop had already been issued
    AlreadyEnded,
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopOutcome::Stopped => write!(f, "stopped"),
            StopOutcome::TimedOut => write!(f, "timed out"),
            StopOutcome::AlreadyEnded => write!(f, "already ended"),
        }
    }
}

/// Validate a reported hostname and return `(name, id)`
pub fn parse_hostname(name: &str, hostname: &str) -> Result<(String, u16)> {
    let pattern =
        Regex::new(HOSTNAME_PATTERN).map_err(|e| StreamError::Internal(e.to_string()))?;
    let caps = pattern
        .captures(hostname.trim())
        .ok_or_else(|| StreamError::Config(format!("{} Hostname {} is invalid", name, hostname)))?;
    let id = placement::unit_id(&caps[1])?;
    Ok((caps[0].to_string(), id))
}

/// One acquisition unit
pub struct Unit {
    name: String,
    id: u16,
    device: Arc<dyn RemoteDevice>,
    links: BTreeMap<u32, Stream>,
    config: Arc<RunConfig>,
    monitor: LinkHealthMonitor,
    inter_unit_trigger: bool,
    spad: Mutex<Option<Spad>>,
    state: RwLock<UnitState>,
    lifecycle: Mutex<Lifecycle>,
    ended: AtomicBool,
    polling: AtomicBool,
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("links", &self.links.keys().collect::<Vec<_>>())
            .field("state", &self.state())
            .finish()
    }
}

impl Unit {
    /// Connect to a unit and build its links
    ///
    /// Fails if the unit is unreachable, its hostname is malformed, it has
    /// no host connections, or the map leaves it without sites.
    pub fn attach(
        name: &str,
        config: Arc<RunConfig>,
        placement: &PlacementMap,
        connections: &[Connection],
        services: &HostServices,
        inter_unit_trigger: bool,
    ) -> Result<Self> {
        let device = services.connector.connect(name).map_err(|e| match e {
            StreamError::Connectivity { .. } => e,
            other => StreamError::connectivity(name, other.to_string()),
        })?;

        let hostname = device.get(&Key::Hostname)?;
        let (name, id) = parse_hostname(name, &hostname)?;

        let own: Vec<&Connection> = connections.iter().filter(|c| c.unit == name).collect();
        if own.is_empty() {
            return Err(StreamError::Config(format!("{} has no connections", name)));
        }

        let mut available = SiteList::new();
        for site in device.aggregator_sites()? {
            let channels = device.get(&Key::ActiveChan(site))?;
            let channels = channels.trim().parse::<u32>().map_err(|_| {
                StreamError::connectivity(&name, format!("s{} active_chan {:?}", site, channels))
            })?;
            available.push(site, channels);
        }

        let ports = placement.resolve(&name, id, &available)?;
        let mut links = BTreeMap::new();
        for conn in own {
            if let Some(sites) = ports.get(&conn.port) {
                links.insert(
                    conn.link,
                    Stream::new(
                        conn.link,
                        conn.port,
                        &name,
                        sites.clone(),
                        &config.host.output_root,
                        config.stream.check_spad,
                        services,
                        &config.timings,
                    ),
                );
            }
        }
        if links.is_empty() {
            return Err(StreamError::Config(format!(
                "{} has no connected ports in its map",
                name
            )));
        }

        let unit = Self {
            monitor: LinkHealthMonitor::new(services.registry.clone(), &config.timings),
            name,
            id,
            device,
            links,
            config,
            inter_unit_trigger,
            spad: Mutex::new(None),
            state: RwLock::new(UnitState::Unknown),
            lifecycle: Mutex::new(Lifecycle::Unconfigured),
            ended: AtomicBool::new(false),
            polling: AtomicBool::new(false),
        };

        if unit.config.verbose {
            tracing::info!("UUT {}", unit.name);
            for stream in unit.links.values() {
                tracing::info!(
                    "[{}] <-- {}:{} {}",
                    stream.link,
                    stream.unit,
                    stream.port,
                    stream.sites
                );
            }
        }
        Ok(unit)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn device(&self) -> Arc<dyn RemoteDevice> {
        self.device.clone()
    }

    pub fn links(&self) -> impl Iterator<Item = &Stream> {
        self.links.values()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Scratch-pad in effect, once configured
    pub fn spad(&self) -> Option<Spad> {
        self.spad.lock().ok().and_then(|s| *s)
    }

    /// Last state seen by the poller
    pub fn state(&self) -> UnitState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or(UnitState::Unknown)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
            .lock()
            .map(|l| *l)
            .unwrap_or(Lifecycle::Unconfigured)
    }

    fn set_lifecycle(&self, phase: Lifecycle) {
        if let Ok(mut slot) = self.lifecycle.lock() {
            tracing::debug!("{}: {} -> {}", self.name, *slot, phase);
            *slot = phase;
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn set(&self, key: Key, value: impl AsRef<str>) -> Result<()> {
        self.device
            .set(&key, value.as_ref())
            .with_context(|| format!("{}: writing {}", self.name, key))
    }

    /// Write scratch-pad, acquisition parameters and aggregator wiring
    pub fn configure(&self) -> Result<()> {
        let acq = &self.config.acquisition;

        let spad = match self.config.spad()? {
            Some(spad) => {
                self.set(Key::Spad, spad.to_string())?;
                spad
            }
            None => self.device.get(&Key::Spad)?.parse::<Spad>()?,
        };
        if let Ok(mut slot) = self.spad.lock() {
            *slot = Some(spad);
        }

        if spad.enabled {
            for n in 1..=7u8 {
                let marker = n.to_string().repeat(8);
                self.set(Key::SpadMarker(n), marker)?;
            }
        }

        for (param, value) in &acq.params {
            self.set(Key::from_param(param)?, value)?;
        }

        let sites = self.device.get(&Key::Sites)?;
        self.set(Key::Run0, format!("{} {}", sites.trim(), spad))?;

        if let Some(decimate) = acq.decimate {
            self.set(Key::Decimate, decimate.to_string())?;
        }
        if let Some(source) = &acq.sig_src_trg_0 {
            self.set(Key::SigSrcTrg0, source)?;
        }
        if let Some(source) = &acq.sig_src_trg_1 {
            self.set(Key::SigSrcTrg1, source)?;
        }
        if self.inter_unit_trigger {
            self.set(Key::SigSrcTrg1, "WRTT1")?;
        }
        if let Some(translen) = acq.rtm_translen {
            self.set(Key::RtmTranslen, translen.to_string())?;
        }

        for stream in self.links.values() {
            self.set(
                Key::CommAggregator(stream.port),
                format!("sites={} on", stream.sites),
            )?;
            self.set(Key::CommSpad(stream.port), if spad.enabled { "1" } else { "0" })?;
            if let Some(decimate) = acq.decimate {
                self.set(Key::CommDecimate(stream.port), decimate.to_string())?;
            }
        }

        if self.config.verbose {
            let ssb = self.device.get(&Key::Ssb).unwrap_or_default();
            match acq.rtm_translen {
                Some(translen) => {
                    tracing::info!("Configuring {}: rtm_translen {} ssb {}", self.name, translen, ssb)
                }
                None => tracing::info!("Configuring {}: ssb {}", self.name, ssb),
            }
        }

        self.set_lifecycle(Lifecycle::Configured);
        Ok(())
    }

    /// 32-bit data columns per sample row on a link
    ///
    /// Sites in 16-bit mode pack two channels per column.
    pub fn data_columns(&self, stream: &Stream) -> Result<u32> {
        let mut columns = 0;
        for site in stream.sites.iter() {
            let data32 = self.device.get(&Key::Data32(site.site))?;
            let per_column = if data32.trim() == "1" { 1 } else { 2 };
            columns += site.channels / per_column;
        }
        Ok(columns)
    }

    /// Check every link, then start a data-mover on each
    ///
    /// `nbuffers` is the per-stream buffer count chosen by the planner.
    pub fn initialize(&self, nbuffers: u64) -> Result<()> {
        let spad = self
            .spad()
            .ok_or_else(|| StreamError::Internal(format!("{} initialized before configure", self.name)))?;
        let stream_cfg = StreamConfig {
            nbuffers,
            ..self.config.stream.clone()
        };
        if stream_cfg.check_spad && !spad.enabled {
            return Err(StreamError::Config(format!(
                "Cannot check spad if no spad: {}",
                spad
            )));
        }

        for stream in self.links.values() {
            let health = self
                .monitor
                .check(&self.name, self.device.as_ref(), stream.link, stream.port);
            stream.record_health(health.clone());
            if let LinkHealth::Down(reason) = health {
                return Err(StreamError::LinkDown {
                    unit: self.name.clone(),
                    port: stream.port.to_string(),
                    link: stream.link,
                    reason: reason.to_string(),
                });
            }

            let data_columns = self.data_columns(stream)?;
            if stream_cfg.hex_dump {
                tracing::info!(
                    "Hex Cmd: {}",
                    stream.hexdump_command(data_columns + spad.len)
                );
            }

            let checker = stream_cfg.check_spad.then(|| {
                let step = self.config.acquisition.decimate.unwrap_or(1);
                (data_columns, spad.len, step)
            });

            stream.kill_if_active()?;
            stream.prepare()?;
            let command = stream.command(&stream_cfg, &self.config.host, checker);
            if self.config.verbose {
                tracing::info!("Cmd: {}", command);
            }
            stream.spawn(&command)?;
        }

        self.set_lifecycle(Lifecycle::Initialized);
        Ok(())
    }

    /// Refresh the cached remote state
    pub fn poll_state(&self) -> Result<UnitState> {
        let report = self.device.get(&Key::ContinuousState)?;
        let state = UnitState::parse(&report);
        if let Ok(mut slot) = self.state.write() {
            *slot = state.clone();
        }
        Ok(state)
    }

    /// Start the detached state poller
    ///
    /// The poller runs until the process exits and is never joined.
    pub fn spawn_poller(self: &Arc<Self>) -> Result<()> {
        if self.polling.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let unit = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("poll-{}", self.name))
            .spawn(move || loop {
                if let Err(e) = unit.poll_state() {
                    tracing::debug!("{}: state poll failed: {}", unit.name, e);
                }
                std::thread::sleep(unit.config.timings.state_poll());
            })?;
        Ok(())
    }

    /// Ask the unit to start streaming
    ///
    /// A unit left running by an earlier session is stopped first. Does not
    /// wait for ARM; that is observed by polling.
    pub fn start(&self) -> Result<()> {
        if !self.poll_state()?.is_idle() {
            tracing::warn!("{} not idle, stopping first", self.name);
            self.set(Key::StreamToNowhere, "stop")?;
            std::thread::sleep(self.config.timings.restart_settle());
        }
        self.set(Key::StreamToNowhere, "start")?;
        self.set_lifecycle(Lifecycle::Started);
        Ok(())
    }

    /// Kill every data-mover this unit spawned
    ///
    /// Errors are logged; every link is attempted.
    pub fn teardown_links(&self) {
        for stream in self.links.values() {
            if let Err(e) = stream.teardown() {
                tracing::error!("{}: {}", self.name, e);
            }
        }
    }

    /// Stop the unit; only the first call issues the remote stop
    pub fn stop(&self) -> StopOutcome {
        if self
            .ended
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return StopOutcome::AlreadyEnded;
        }
        self.set_lifecycle(Lifecycle::Stopping);

        if let Err(e) = self.set(Key::StreamToNowhere, "stop") {
            tracing::warn!("{}: stop request failed: {}", self.name, e);
        }

        let timings = &self.config.timings;
        for attempt in 0..=timings.stop_wait_attempts {
            // Without a poller the cached state would never change
            let state = if self.polling.load(Ordering::SeqCst) {
                self.state()
            } else {
                self.poll_state().unwrap_or_default()
            };
            if state.is_idle() {
                tracing::debug!("{} has stopped", self.name);
                self.set_lifecycle(Lifecycle::Stopped);
                return StopOutcome::Stopped;
            }
            if attempt < timings.stop_wait_attempts {
                std::thread::sleep(timings.stop_wait());
            }
        }

        tracing::warn!("{} unable to stop, dropping out", self.name);
        StopOutcome::TimedOut
    }
}
