//! In-memory stand-ins for every external collaborator
//!
//! These let the whole engine run without hardware: a simulated unit that
//! walks IDLE → ARM → RUN when started, a link registry whose data-movers
//! finish after a set number of reads, a launcher that registers PIDs in
//! that registry, and a host with configurable memory.

use super::device::{Connector, Key, RemoteDevice, Scope};
use super::host::HostSystem;
use super::launcher::ProcessLauncher;
use super::registry::LinkRegistry;
use super::siggen::SignalGenerator;
use crate::error::{Result, StreamError};
use crate::types::{Connection, LinkState, RemotePort, StreamState, UnitState, STOP_DONE};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type SetHook = Box<dyn Fn(&Key, &str) + Send + Sync>;

// ==================== Mock Device ====================

/// Simulated acquisition unit
pub struct MockDevice {
    name: String,
    values: Mutex<HashMap<String, String>>,
    writes: Mutex<Vec<(String, String)>>,
    sent: Mutex<Vec<(String, String)>>,
    state: Mutex<UnitState>,
    arm_polls: AtomicU32,
    polls_in_arm: AtomicU32,
    hold_arm: AtomicBool,
    ignore_stop: AtomicBool,
    unreachable: AtomicBool,
    stop_requests: AtomicUsize,
    start_requests: AtomicUsize,
    set_hook: Mutex<Option<SetHook>>,
}

impl MockDevice {
    /// A reachable unit in IDLE with no sites
    pub fn new(hostname: &str) -> Self {
        let device = Self {
            name: hostname.to_string(),
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            state: Mutex::new(UnitState::Idle),
            arm_polls: AtomicU32::new(1),
            polls_in_arm: AtomicU32::new(0),
            hold_arm: AtomicBool::new(false),
            ignore_stop: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            stop_requests: AtomicUsize::new(0),
            start_requests: AtomicUsize::new(0),
            set_hook: Mutex::new(None),
        };
        device.put(&Key::Hostname, hostname);
        device.put(&Key::Spad, "0,0,0");
        device.put(&Key::Aggregator, "0 sites=none on");
        device.put(&Key::Sites, "");
        device.put(&Key::Ssb, "0");
        for port in RemotePort::OPTICAL {
            device.put(&Key::TxDisable(port), "0");
        }
        device
    }

    /// Add aggregated sites as `(site, active channels, data32)`
    pub fn with_sites(self, sites: &[(u8, u32, bool)]) -> Self {
        let ids: Vec<String> = sites.iter().map(|(s, _, _)| s.to_string()).collect();
        self.put(&Key::Aggregator, &format!("0 sites={} on", ids.join(",")));
        self.put(&Key::Sites, &ids.join(","));
        for (site, channels, data32) in sites {
            self.put(&Key::ActiveChan(*site), &channels.to_string());
            self.put(&Key::Data32(*site), if *data32 { "1" } else { "0" });
        }
        self
    }

    pub fn with_spad(self, spad: &str) -> Self {
        self.put(&Key::Spad, spad);
        self
    }

    pub fn with_state(self, state: UnitState) -> Self {
        *lock(&self.state) = state;
        self
    }

    /// Remove TX_DISABLE, as on old firmware
    pub fn without_tx_disable(self) -> Self {
        let mut values = lock(&self.values);
        for port in RemotePort::OPTICAL {
            values.remove(&Key::TxDisable(port).to_string());
        }
        drop(values);
        self
    }

    /// State polls spent in ARM before moving to RUN
    pub fn arm_polls(self, polls: u32) -> Self {
        self.arm_polls.store(polls, Ordering::SeqCst);
        self
    }

    /// Stay in ARM until told otherwise
    pub fn hold_arm(&self, hold: bool) {
        self.hold_arm.store(hold, Ordering::SeqCst);
    }

    /// Ignore stop requests (never returns to IDLE)
    pub fn ignore_stop(&self, ignore: bool) {
        self.ignore_stop.store(ignore, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Run `hook` after every successful write
    pub fn on_set(&self, hook: impl Fn(&Key, &str) + Send + Sync + 'static) {
        *lock(&self.set_hook) = Some(Box::new(hook));
    }

    /// Store a value without recording a write
    pub fn put(&self, key: &Key, value: &str) {
        lock(&self.values).insert(key.to_string(), value.to_string());
    }

    /// Current value of a key
    pub fn value(&self, key: &Key) -> Option<String> {
        lock(&self.values).get(&key.to_string()).cloned()
    }

    pub fn state(&self) -> UnitState {
        lock(&self.state).clone()
    }

    /// Every write as `(key, value)`, in order
    pub fn writes(&self) -> Vec<(String, String)> {
        lock(&self.writes).clone()
    }

    /// Number of writes to one key
    pub fn write_count(&self, key: &Key) -> usize {
        let key = key.to_string();
        lock(&self.writes).iter().filter(|(k, _)| *k == key).count()
    }

    /// Raw commands as `(scope, line)`
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }

    pub fn stop_requests(&self) -> usize {
        self.stop_requests.load(Ordering::SeqCst)
    }

    pub fn start_requests(&self) -> usize {
        self.start_requests.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StreamError::connectivity(&self.name, "No route to host"));
        }
        Ok(())
    }

    fn poll_state(&self) -> UnitState {
        let mut state = lock(&self.state);
        if *state == UnitState::Arm && !self.hold_arm.load(Ordering::SeqCst) {
            let polls = self.polls_in_arm.fetch_add(1, Ordering::SeqCst) + 1;
            if polls >= self.arm_polls.load(Ordering::SeqCst) {
                *state = UnitState::Run;
            }
        }
        state.clone()
    }
}

impl RemoteDevice for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &Key) -> Result<String> {
        self.check_reachable()?;
        if *key == Key::ContinuousState {
            return Ok(format!("CONTINUOUS:STATE {}", self.poll_state()));
        }
        self.value(key).ok_or_else(|| StreamError::UnknownKey {
            unit: self.name.clone(),
            key: key.to_string(),
        })
    }

    fn set(&self, key: &Key, value: &str) -> Result<()> {
        self.check_reachable()?;
        if matches!(key, Key::TxDisable(_)) && self.value(key).is_none() {
            return Err(StreamError::UnknownKey {
                unit: self.name.clone(),
                key: key.to_string(),
            });
        }

        if *key == Key::StreamToNowhere {
            match value {
                "start" => {
                    self.start_requests.fetch_add(1, Ordering::SeqCst);
                    self.polls_in_arm.store(0, Ordering::SeqCst);
                    *lock(&self.state) = UnitState::Arm;
                }
                "stop" => {
                    self.stop_requests.fetch_add(1, Ordering::SeqCst);
                    if !self.ignore_stop.load(Ordering::SeqCst) {
                        *lock(&self.state) = UnitState::Idle;
                    }
                }
                _ => {}
            }
        }

        self.put(key, value);
        lock(&self.writes).push((key.to_string(), value.to_string()));
        if let Some(hook) = lock(&self.set_hook).as_ref() {
            hook(key, value);
        }
        Ok(())
    }

    fn send(&self, scope: Scope, line: &str) -> Result<String> {
        self.check_reachable()?;
        lock(&self.sent).push((scope.to_string(), line.to_string()));
        Ok(String::new())
    }
}

/// Connector over a fixed set of mock devices
#[derive(Default)]
pub struct MockConnector {
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
    generators: Mutex<HashMap<String, Arc<MockSignalGenerator>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, device: Arc<MockDevice>) {
        lock(&self.devices).insert(device.name.clone(), device);
    }

    pub fn add_generator(&self, generator: Arc<MockSignalGenerator>) {
        lock(&self.generators).insert(generator.name.clone(), generator);
    }

    pub fn device(&self, name: &str) -> Option<Arc<MockDevice>> {
        lock(&self.devices).get(name).cloned()
    }
}

impl Connector for MockConnector {
    fn connect(&self, name: &str) -> Result<Arc<dyn RemoteDevice>> {
        match self.device(name) {
            Some(device) => {
                device.check_reachable()?;
                Ok(device)
            }
            None => Err(StreamError::connectivity(name, "No route to host")),
        }
    }

    fn signal_generator(&self, name: &str) -> Arc<dyn SignalGenerator> {
        let mut generators = lock(&self.generators);
        let generator = generators
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MockSignalGenerator::new(name)));
        generator.clone()
    }
}

// ==================== Mock Signal Generator ====================

/// Signal generator that counts triggers
pub struct MockSignalGenerator {
    name: String,
    fail: AtomicBool,
    triggers: AtomicUsize,
}

impl MockSignalGenerator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: AtomicBool::new(false),
            triggers: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str) -> Self {
        let generator = Self::new(name);
        generator.fail.store(true, Ordering::SeqCst);
        generator
    }

    pub fn triggers(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }
}

impl SignalGenerator for MockSignalGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn trigger(&self) -> Result<()> {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(StreamError::Trigger(format!("{}: no route to host", self.name)));
        }
        Ok(())
    }
}

// ==================== Mock Registry ====================

#[derive(Debug, Clone, Default)]
struct MockJob {
    pid: Option<u32>,
    reads: u32,
    rx: u64,
    /// Reads after which the job reports STOP_DONE (None = never)
    finish_after: Option<u32>,
}

/// Link registry held in memory
pub struct MockRegistry {
    connections: Mutex<Vec<Connection>>,
    hidden: Mutex<Vec<Connection>>,
    links: Mutex<HashMap<u32, LinkState>>,
    jobs: Mutex<HashMap<u32, MockJob>>,
    buffer_length: u64,
    finish_after: Mutex<Option<u32>>,
    enumerations: AtomicUsize,
    next_pid: AtomicU32,
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self::new(4 * 1024 * 1024)
    }
}

impl MockRegistry {
    pub fn new(buffer_length: u64) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            hidden: Mutex::new(Vec::new()),
            links: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            buffer_length,
            finish_after: Mutex::new(None),
            enumerations: AtomicUsize::new(0),
            next_pid: AtomicU32::new(1000),
        }
    }

    /// Attach a unit port to a local link with a healthy lane
    pub fn connect(&self, unit: &str, port: RemotePort, link: u32) {
        lock(&self.connections).push(Connection {
            unit: unit.to_string(),
            port,
            link,
        });
        lock(&self.connections).sort_by_key(|c| c.link);
        self.set_link_state(link, true, true);
    }

    pub fn set_link_state(&self, link: u32, lane_up: bool, root_complex_init: bool) {
        lock(&self.links).insert(
            link,
            LinkState {
                lane_up,
                root_complex_init,
            },
        );
    }

    /// Remove a unit from the connection table until [`Self::restore_unit`]
    pub fn hide_unit(&self, unit: &str) {
        let mut connections = lock(&self.connections);
        let (gone, kept): (Vec<_>, Vec<_>) =
            connections.drain(..).partition(|c| c.unit == unit);
        *connections = kept;
        lock(&self.hidden).extend(gone);
    }

    /// Bring a hidden unit back with its lanes healthy
    pub fn restore_unit(&self, unit: &str) {
        let mut hidden = lock(&self.hidden);
        let (back, kept): (Vec<_>, Vec<_>) = hidden.drain(..).partition(|c| c.unit == unit);
        *hidden = kept;
        drop(hidden);
        for conn in back {
            self.set_link_state(conn.link, true, true);
            lock(&self.connections).push(conn);
        }
        lock(&self.connections).sort_by_key(|c| c.link);
    }

    /// Make every job started from now on finish after `reads` state reads
    pub fn finish_streams_after(&self, reads: u32) {
        *lock(&self.finish_after) = Some(reads);
    }

    /// Register a live data-mover on a link and return its PID
    pub fn start_job(&self, link: u32) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let finish_after = *lock(&self.finish_after);
        lock(&self.jobs).insert(
            link,
            MockJob {
                pid: Some(pid),
                finish_after,
                ..Default::default()
            },
        );
        pid
    }

    pub fn end_job(&self, link: u32) {
        if let Some(job) = lock(&self.jobs).get_mut(&link) {
            job.pid = None;
        }
    }

    /// Link bound to a PID, if any
    pub fn link_for_pid(&self, pid: u32) -> Option<u32> {
        lock(&self.jobs)
            .iter()
            .find(|(_, job)| job.pid == Some(pid))
            .map(|(link, _)| *link)
    }

    /// Number of `list_connections` calls so far
    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

impl LinkRegistry for MockRegistry {
    fn list_connections(&self) -> Result<Vec<Connection>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.connections).clone())
    }

    fn link_state(&self, link: u32) -> Result<LinkState> {
        lock(&self.links)
            .get(&link)
            .copied()
            .ok_or_else(|| StreamError::Registry(format!("no link afhba.{}", link)))
    }

    fn stream_pid(&self, link: u32) -> Result<Option<u32>> {
        Ok(lock(&self.jobs).get(&link).and_then(|job| job.pid))
    }

    fn stream_state(&self, link: u32) -> Result<StreamState> {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(&link) else {
            return Ok(StreamState::default());
        };

        job.reads += 1;
        let finished = job.finish_after.is_some_and(|n| job.reads >= n);
        if finished {
            job.pid = None;
            return Ok(StreamState {
                rx_rate: 0.0,
                rx: job.rx,
                status: STOP_DONE.to_string(),
            });
        }
        job.rx += 10;
        Ok(StreamState {
            rx_rate: 10.0,
            rx: job.rx,
            status: "RUN".to_string(),
        })
    }

    fn buffer_length(&self, _link: u32) -> Result<u64> {
        Ok(self.buffer_length)
    }
}

// ==================== Mock Launcher ====================

/// Launcher that registers jobs in a [`MockRegistry`] instead of forking
pub struct MockLauncher {
    registry: Arc<MockRegistry>,
    spawned: Mutex<Vec<String>>,
    killed: Mutex<Vec<u32>>,
    dirs: Mutex<Vec<PathBuf>>,
    never_start: AtomicBool,
    unkillable: AtomicBool,
}

impl MockLauncher {
    pub fn new(registry: Arc<MockRegistry>) -> Self {
        Self {
            registry,
            spawned: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            dirs: Mutex::new(Vec::new()),
            never_start: AtomicBool::new(false),
            unkillable: AtomicBool::new(false),
        }
    }

    /// Spawned commands never produce a PID
    pub fn never_start(&self, never: bool) {
        self.never_start.store(never, Ordering::SeqCst);
    }

    /// Kills are accepted but the process survives
    pub fn unkillable(&self, unkillable: bool) {
        self.unkillable.store(unkillable, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> Vec<String> {
        lock(&self.spawned).clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        lock(&self.killed).clone()
    }

    pub fn dirs(&self) -> Vec<PathBuf> {
        lock(&self.dirs).clone()
    }
}

/// Device number from an `RTM_DEVNUM=<n>` assignment in a command
fn devnum(command: &str) -> Option<u32> {
    command
        .split_whitespace()
        .find_map(|tok| tok.strip_prefix("RTM_DEVNUM="))
        .and_then(|n| n.parse().ok())
}

impl ProcessLauncher for MockLauncher {
    fn spawn_detached(&self, command: &str) -> Result<()> {
        lock(&self.spawned).push(command.to_string());
        if self.never_start.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(link) = devnum(command) {
            self.registry.start_job(link);
        }
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        lock(&self.killed).push(pid);
        if !self.unkillable.load(Ordering::SeqCst) {
            if let Some(link) = self.registry.link_for_pid(pid) {
                self.registry.end_job(link);
            }
        }
        Ok(())
    }

    fn prepare_dir(&self, dir: &Path) -> Result<()> {
        lock(&self.dirs).push(dir.to_path_buf());
        Ok(())
    }

    fn touch(&self, _file: &Path) -> Result<()> {
        Ok(())
    }
}

// ==================== Mock Host ====================

/// Host with fixed resources
pub struct MockHost {
    free_memory: AtomicU64,
    volatile: AtomicBool,
    purges: AtomicUsize,
    cpu: f32,
}

impl MockHost {
    pub fn new(free_memory: u64) -> Self {
        Self {
            free_memory: AtomicU64::new(free_memory),
            volatile: AtomicBool::new(true),
            purges: AtomicUsize::new(0),
            cpu: 12.5,
        }
    }

    pub fn set_free_memory(&self, bytes: u64) {
        self.free_memory.store(bytes, Ordering::SeqCst);
    }

    pub fn set_volatile(&self, volatile: bool) {
        self.volatile.store(volatile, Ordering::SeqCst);
    }

    pub fn purges(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }
}

impl HostSystem for MockHost {
    fn free_memory(&self) -> Result<u64> {
        Ok(self.free_memory.load(Ordering::SeqCst))
    }

    fn is_volatile(&self, _path: &Path) -> Result<bool> {
        Ok(self.volatile.load(Ordering::SeqCst))
    }

    fn purge_outputs(&self, _root: &Path) -> Result<()> {
        self.purges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cpu_usage(&self) -> f32 {
        self.cpu
    }
}
