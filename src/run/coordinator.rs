//! The run: attach, plan, configure, start, watch, stop
//!
//! The coordinator owns no global state. Everything a cycle needs travels in
//! a [`RunContext`] and every cycle hands back a [`CycleReport`]. A fatal
//! error or panic at any point after units are touched ends in a
//! coordinated stop so no unit is left armed, and every data-mover spawned
//! so far is killed.

use super::rate_limiter::CycleTimer;
use super::status::{CycleReport, Header, UnitStatus};
use crate::backend::{HostServices, Scope};
use crate::config::RunConfig;
use crate::error::{Result, StreamError};
use crate::planner::{self, CapacityPlan};
use crate::trigger::{TriggerReleaser, TriggerSelection};
use crate::types::RemotePort;
use crate::unit::{StopOutcome, Unit};
use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every stream finished or the duration ran out
    Completed,
    /// Stopped by an interrupt
    Interrupted,
    /// The trigger could not be sent; units were stopped
    TriggerFailed,
    /// Units were configured, nothing streamed
    DryRun,
}

/// Final stop result for one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStop {
    pub unit: String,
    pub outcome: StopOutcome,
}

/// What a run did
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub cycles: u64,
    pub stops: Vec<UnitStop>,
    pub mean_cpu: Option<f32>,
    pub plan: Option<CapacityPlan>,
    /// Soft failure that ended the run early
    pub error: Option<String>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Run Done: {:?} started {} ran {:.1}s, {} cycles",
            self.outcome,
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.elapsed.as_secs_f64(),
            self.cycles
        )?;
        for stop in &self.stops {
            write!(f, "\n  {} {}", stop.unit, stop.outcome)?;
        }
        if let Some(cpu) = self.mean_cpu {
            write!(f, "\nMean CPU: {:.1}%", cpu)?;
        }
        if let Some(error) = &self.error {
            write!(f, "\n{}", error)?;
        }
        Ok(())
    }
}

type Reporter = Box<dyn Fn(&CycleReport) + Send + Sync>;

// ==================== Stop Fan-out ====================

/// Stop requests running on their own threads, collected through a channel
struct StopFanout {
    tx: Sender<UnitStop>,
    rx: Receiver<UnitStop>,
    launched: BTreeSet<String>,
    pending: BTreeSet<String>,
    done: Vec<UnitStop>,
}

impl StopFanout {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            launched: BTreeSet::new(),
            pending: BTreeSet::new(),
            done: Vec::new(),
        }
    }

    /// Issue stop on every unit that has not been stopped yet
    fn launch(&mut self, units: &[Arc<Unit>]) {
        for unit in units {
            if unit.is_ended() || !self.launched.insert(unit.name().to_string()) {
                continue;
            }
            self.pending.insert(unit.name().to_string());
            let unit = Arc::clone(unit);
            let tx = self.tx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("stop-{}", unit.name()))
                .spawn({
                    let unit = Arc::clone(&unit);
                    move || {
                        let outcome = unit.stop();
                        let _ = tx.send(UnitStop {
                            unit: unit.name().to_string(),
                            outcome,
                        });
                    }
                });
            if let Err(e) = spawned {
                tracing::warn!("{}: stop thread failed ({}), stopping inline", unit.name(), e);
                let outcome = unit.stop();
                self.record(UnitStop {
                    unit: unit.name().to_string(),
                    outcome,
                });
            }
        }
    }

    fn record(&mut self, stop: UnitStop) {
        self.pending.remove(&stop.unit);
        self.done.push(stop);
    }

    /// Non-blocking drain of finished stops
    fn poll(&mut self) {
        while let Ok(stop) = self.rx.try_recv() {
            self.record(stop);
        }
    }

    /// Wait for outstanding stops; units that miss the deadline time out
    fn collect(mut self, deadline: Instant) -> Vec<UnitStop> {
        while !self.pending.is_empty() {
            match self.rx.recv_deadline(deadline) {
                Ok(stop) => self.record(stop),
                Err(_) => break,
            }
        }
        for unit in std::mem::take(&mut self.pending) {
            tracing::warn!("{} did not stop before the deadline", unit);
            self.done.push(UnitStop {
                unit,
                outcome: StopOutcome::TimedOut,
            });
        }
        self.done
    }
}

// ==================== Run Context ====================

enum CycleStep {
    Continue(CycleReport),
    Done(CycleReport),
    TriggerFailed(StreamError),
}

/// Where setup stopped
enum Setup {
    Ready(TriggerReleaser),
    Interrupted,
}

/// State carried from one cycle to the next
pub struct RunContext {
    units: Vec<Arc<Unit>>,
    plan: CapacityPlan,
    releaser: TriggerReleaser,
    services: HostServices,
    cpu_usage: bool,
    started: Instant,
    /// When every unit was first seen running
    all_running_since: Option<Instant>,
    cycles: u64,
    all_armed: bool,
    all_running: bool,
    cpu_samples: Vec<f32>,
    stops: StopFanout,
}

impl RunContext {
    fn new(
        units: Vec<Arc<Unit>>,
        plan: CapacityPlan,
        releaser: TriggerReleaser,
        services: HostServices,
        cpu_usage: bool,
    ) -> Self {
        Self {
            units,
            plan,
            releaser,
            services,
            cpu_usage,
            started: Instant::now(),
            all_running_since: None,
            cycles: 0,
            all_armed: false,
            all_running: false,
            cpu_samples: Vec::new(),
            stops: StopFanout::new(),
        }
    }

    fn header(&mut self) -> Header {
        let progress = self
            .plan
            .duration
            .zip(self.all_running_since)
            .map(|(limit, since)| (since.elapsed(), limit));
        let cpu = (self.cpu_usage && self.all_running).then(|| {
            let sample = self.services.host.cpu_usage();
            self.cpu_samples.push(sample);
            sample
        });
        Header {
            elapsed: self.started.elapsed(),
            progress,
            max_mb: self.plan.max_mb(),
            buffer_mb: self.plan.buffer_mb(),
            cpu,
        }
    }

    /// One control cycle
    fn cycle(&mut self) -> Result<CycleStep> {
        self.cycles += 1;
        let header = self.header();

        let trigger = self.releaser.evaluate(self.all_armed);
        if let Some(error) = trigger.error {
            return Ok(CycleStep::TriggerFailed(error));
        }

        let buffer_mb = self.plan.buffer_mb();
        let units: Vec<UnitStatus> = self
            .units
            .iter()
            .map(|unit| UnitStatus::collect(unit, buffer_mb))
            .collect();
        let report = CycleReport {
            cycle: self.cycles,
            header,
            trigger: trigger.message,
            units,
        };

        self.all_armed = report.all_armed();
        self.all_running = report.all_running();
        if self.all_running && self.all_running_since.is_none() {
            tracing::info!("All units running");
            self.all_running_since = Some(Instant::now());
        }
        self.stops.poll();

        let time_up = self
            .plan
            .duration
            .zip(self.all_running_since)
            .is_some_and(|(limit, since)| since.elapsed() >= limit);
        let streams_done = report.ended_streams() == report.total_streams();

        if time_up || streams_done {
            if report.running() == 0 {
                return Ok(CycleStep::Done(report));
            }
            if time_up {
                tracing::debug!("Duration reached, stopping units");
            } else {
                tracing::debug!("All streams done, stopping units");
            }
            self.stops.launch(&self.units);
        }
        Ok(CycleStep::Continue(report))
    }

    fn mean_cpu(&self) -> Option<f32> {
        if self.cpu_samples.is_empty() {
            return None;
        }
        Some(self.cpu_samples.iter().sum::<f32>() / self.cpu_samples.len() as f32)
    }
}

// ==================== Coordinator ====================

/// Drives one multi-unit run
pub struct Coordinator {
    config: Arc<RunConfig>,
    services: HostServices,
    interrupt: Arc<AtomicBool>,
    reporter: Reporter,
}

impl Coordinator {
    /// Validate the config; nothing is touched yet
    pub fn new(config: RunConfig, services: HostServices) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            services,
            interrupt: Arc::new(AtomicBool::new(false)),
            reporter: Box::new(|report| println!("{}\n", report)),
        })
    }

    /// Share an interrupt flag, e.g. one set by a signal handler
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Replace the default stdout frame printer
    pub fn with_reporter(mut self, reporter: impl Fn(&CycleReport) + Send + Sync + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    fn stop_deadline(&self) -> Instant {
        Instant::now() + self.config.timings.stop_deadline()
    }

    /// Connect to every configured unit in order
    pub fn attach(&self, selection: &TriggerSelection) -> Result<Vec<Arc<Unit>>> {
        let placement = self.config.placement()?;
        let connections = self.services.registry.list_connections()?;
        self.config
            .units
            .iter()
            .map(|name| {
                Unit::attach(
                    name,
                    self.config.clone(),
                    &placement,
                    &connections,
                    &self.services,
                    selection.is_inter_unit(),
                )
                .map(Arc::new)
            })
            .collect()
    }

    /// Run `op` on every unit at once and wait for all of them
    fn fan_out<F>(&self, units: &[Arc<Unit>], what: &str, op: F) -> Result<()>
    where
        F: Fn(&Unit) -> Result<()> + Sync,
    {
        let mut errors: Vec<StreamError> = std::thread::scope(|scope| {
            let handles: Vec<_> = units
                .iter()
                .map(|unit| {
                    let op = &op;
                    scope.spawn(move || op(unit.as_ref()))
                })
                .collect();
            handles
                .into_iter()
                .zip(units)
                .filter_map(|(handle, unit)| match handle.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(StreamError::Internal(format!(
                        "{} panicked during {}",
                        unit.name(),
                        what
                    ))),
                })
                .collect()
        });

        for e in errors.iter().skip(1) {
            tracing::error!("{} failed: {}", what, e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.remove(0))
        }
    }

    fn shutdown(&self, units: &[Arc<Unit>], mut stops: StopFanout) -> Vec<UnitStop> {
        tracing::info!("Stopping all units");
        stops.launch(units);
        stops.collect(self.stop_deadline())
    }

    /// Stop every unit, then kill the data-movers they were given
    fn abort(&self, units: &[Arc<Unit>], stops: StopFanout) -> Vec<UnitStop> {
        let stops = self.shutdown(units, stops);
        for unit in units {
            unit.teardown_links();
        }
        stops
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Configure, initialize and start every unit
    ///
    /// The interrupt flag is honoured between phases so no unit is started
    /// after a Ctrl-C.
    fn setup(
        &self,
        units: &[Arc<Unit>],
        plan: &CapacityPlan,
        selection: &TriggerSelection,
    ) -> Result<Setup> {
        self.fan_out(units, "configure", |unit| unit.configure())?;
        if self.interrupted() {
            return Ok(Setup::Interrupted);
        }
        self.fan_out(units, "initialize", |unit| {
            unit.initialize(plan.buffer_count)
        })?;
        if self.interrupted() {
            return Ok(Setup::Interrupted);
        }

        let releaser = TriggerReleaser::new(
            selection,
            units.first().map(|u| u.device()),
            self.services.connector.as_ref(),
        )?;
        for unit in units {
            unit.spawn_poller()?;
        }
        if self.interrupted() {
            return Ok(Setup::Interrupted);
        }
        self.fan_out(units, "start", |unit| unit.start())?;
        Ok(Setup::Ready(releaser))
    }

    /// Execute the whole run
    pub fn run(&self) -> Result<RunSummary> {
        let started_at = Local::now();
        let started = Instant::now();
        let selection = TriggerSelection::from_options(&self.config.trigger)?;
        let units = self.attach(&selection)?;

        if self.config.stream.dry_run {
            return self.dry_run(&units, &selection, started_at, started);
        }

        let plan = planner::plan(&units, &self.config, &self.services)?;
        tracing::info!(
            "{} streams, {} buffers of {} MB each",
            plan.total_streams,
            plan.buffer_count,
            plan.buffer_mb()
        );

        let releaser = match self.setup(&units, &plan, &selection) {
            Ok(Setup::Ready(releaser)) => releaser,
            Ok(Setup::Interrupted) => {
                tracing::warn!("Interrupted during setup");
                let stops = self.abort(&units, StopFanout::new());
                let summary = RunSummary {
                    outcome: RunOutcome::Interrupted,
                    started_at,
                    elapsed: started.elapsed(),
                    cycles: 0,
                    stops,
                    mean_cpu: None,
                    plan: Some(plan),
                    error: None,
                };
                tracing::info!("{}", summary);
                return Ok(summary);
            }
            Err(e) => {
                tracing::error!("Setup failed: {}", e);
                self.abort(&units, StopFanout::new());
                return Err(e);
            }
        };

        let mut ctx = RunContext::new(
            units.clone(),
            plan,
            releaser,
            self.services.clone(),
            self.config.stream.cpu_usage,
        );
        let outcome = self.watch(&mut ctx);

        let mean_cpu = ctx.mean_cpu();
        let RunContext {
            stops,
            cycles,
            plan,
            ..
        } = ctx;
        let (outcome, error) = match outcome {
            Ok(ended) => ended,
            Err(e) => {
                self.abort(&units, stops);
                return Err(e);
            }
        };
        let stops = self.shutdown(&units, stops);
        let summary = RunSummary {
            outcome,
            started_at,
            elapsed: started.elapsed(),
            cycles,
            stops,
            mean_cpu,
            plan: Some(plan),
            error,
        };
        tracing::info!("{}", summary);
        Ok(summary)
    }

    /// The control loop; errors and panics end it
    ///
    /// A trigger failure ends the loop without an error and hands back its
    /// message.
    fn watch(&self, ctx: &mut RunContext) -> Result<(RunOutcome, Option<String>)> {
        let mut timer = CycleTimer::new(self.config.timings.cycle());
        loop {
            timer.begin();
            if self.interrupted() {
                tracing::warn!("Interrupted");
                return Ok((RunOutcome::Interrupted, None));
            }

            match panic::catch_unwind(AssertUnwindSafe(|| ctx.cycle())) {
                Ok(Ok(CycleStep::Continue(report))) => (self.reporter)(&report),
                Ok(Ok(CycleStep::Done(report))) => {
                    (self.reporter)(&report);
                    return Ok((RunOutcome::Completed, None));
                }
                Ok(Ok(CycleStep::TriggerFailed(e))) => {
                    tracing::error!("Could not trigger: {}", e);
                    return Ok((RunOutcome::TriggerFailed, Some(e.to_string())));
                }
                Ok(Err(e)) => {
                    tracing::error!("Run loop failed: {}", e);
                    return Err(e);
                }
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!("Run loop panicked: {}", message);
                    return Err(StreamError::Internal(format!("panic: {}", message)));
                }
            }

            timer.wait();
        }
    }

    fn dry_run(
        &self,
        units: &[Arc<Unit>],
        selection: &TriggerSelection,
        started_at: DateTime<Local>,
        started: Instant,
    ) -> Result<RunSummary> {
        self.fan_out(units, "configure", |unit| unit.configure())?;
        if let (TriggerSelection::InterUnit(command), Some(top)) = (selection, units.first()) {
            top.device().send(Scope::Comm(RemotePort::C), command)?;
            tracing::info!("Sent wrtd_txi to {}", top.name());
        }
        tracing::info!("Dry run complete");
        Ok(RunSummary {
            outcome: RunOutcome::DryRun,
            started_at,
            elapsed: started.elapsed(),
            cycles: 0,
            stops: Vec::new(),
            mean_cpu: None,
            plan: None,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockConnector, MockDevice, MockHost, MockLauncher, MockRegistry};
    use crate::backend::LinkRegistry;
    use crate::config::Timings;
    use crate::types::UnitState;

    struct Rig {
        services: HostServices,
        registry: Arc<MockRegistry>,
        devices: Vec<Arc<MockDevice>>,
        host: Arc<MockHost>,
    }

    fn rig(names: &[&str]) -> Rig {
        let registry = Arc::new(MockRegistry::default());
        let connector = Arc::new(MockConnector::new());
        let mut devices = Vec::new();
        for (link, name) in names.iter().enumerate() {
            registry.connect(name, RemotePort::A, link as u32);
            let device = Arc::new(MockDevice::new(name).with_sites(&[(1, 16, true)]));
            connector.add(device.clone());
            devices.push(device);
        }
        let host = Arc::new(MockHost::new(64 * planner::GIB));
        Rig {
            services: HostServices {
                connector,
                launcher: Arc::new(MockLauncher::new(registry.clone())),
                registry: registry.clone(),
                host: host.clone(),
            },
            registry,
            devices,
            host,
        }
    }

    fn config(names: &[&str]) -> RunConfig {
        let mut config = RunConfig::default();
        config.units = names.iter().map(|s| s.to_string()).collect();
        config.map = "ALL:A:ALL".to_string();
        config.stream.nbuffers = 100;
        config.timings = Timings::fast();
        config
    }

    fn quiet(coordinator: Coordinator) -> Coordinator {
        coordinator.with_reporter(|_| {})
    }

    #[test]
    fn test_fan_out_reports_first_error() {
        let names = ["acq2106_001", "acq2106_002"];
        let rig = rig(&names);
        let coordinator = quiet(Coordinator::new(config(&names), rig.services.clone()).unwrap());
        let units = coordinator.attach(&TriggerSelection::None).unwrap();

        let err = coordinator
            .fan_out(&units, "test", |unit| {
                if unit.id() == 2 {
                    Err(StreamError::Internal("boom".to_string()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_full_run_completes_on_stop_done() {
        let names = ["acq2106_001", "acq2106_002"];
        let rig = rig(&names);
        rig.registry.finish_streams_after(3);

        let coordinator = quiet(Coordinator::new(config(&names), rig.services.clone()).unwrap());
        let summary = coordinator.run().unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert!(summary.cycles >= 3);
        for device in &rig.devices {
            assert_eq!(device.start_requests(), 1);
            assert_eq!(device.stop_requests(), 1);
            assert_eq!(device.state(), UnitState::Idle);
        }
        assert_eq!(rig.host.purges(), 1);
    }

    #[test]
    fn test_interrupt_stops_every_unit() {
        let names = ["acq2106_001"];
        let rig = rig(&names);
        let coordinator = quiet(Coordinator::new(config(&names), rig.services.clone()).unwrap());
        coordinator.interrupt_handle().store(true, Ordering::SeqCst);

        let summary = coordinator.run().unwrap();
        assert_eq!(summary.outcome, RunOutcome::Interrupted);
        assert_eq!(
            summary.stops,
            vec![UnitStop {
                unit: "acq2106_001".to_string(),
                outcome: StopOutcome::Stopped
            }]
        );
        assert_eq!(rig.devices[0].stop_requests(), 1);
    }

    #[test]
    fn test_trigger_failure_shuts_down() {
        let names = ["acq2106_001"];
        let rig = rig(&names);
        rig.devices[0].hold_arm(true);
        let mut cfg = config(&names);
        cfg.trigger.wrtd_txi = Some("wrtd txi".to_string());

        // Fail the send by making the unit unreachable once it is armed
        let device = rig.devices[0].clone();
        let coordinator = quiet(Coordinator::new(cfg, rig.services.clone()).unwrap())
            .with_reporter(move |report| {
                if report.all_armed() {
                    device.set_unreachable(true);
                }
            });
        let summary = coordinator.run().unwrap();
        assert_eq!(summary.outcome, RunOutcome::TriggerFailed);
        let error = summary.error.as_deref().unwrap();
        assert!(error.starts_with("Trigger error"), "{}", error);
        assert_eq!(summary.stops.len(), 1);
    }

    #[test]
    fn test_setup_failure_tears_down_spawned_streams() {
        let names = ["acq2106_001", "acq2106_002"];
        let rig = rig(&names);
        rig.registry.set_link_state(1, false, false);
        let coordinator = quiet(Coordinator::new(config(&names), rig.services.clone()).unwrap());

        let err = coordinator.run().unwrap_err();
        assert!(matches!(err.root(), StreamError::LinkDown { link: 1, .. }));
        assert_eq!(rig.registry.stream_pid(0).unwrap(), None);
        assert_eq!(rig.registry.stream_pid(1).unwrap(), None);
        for device in &rig.devices {
            assert_eq!(device.start_requests(), 0);
        }
    }

    #[test]
    fn test_interrupt_during_setup_skips_start() {
        let names = ["acq2106_001", "acq2106_002"];
        let rig = rig(&names);
        let coordinator = quiet(Coordinator::new(config(&names), rig.services.clone()).unwrap());
        let interrupt = coordinator.interrupt_handle();
        rig.devices[1].on_set(move |key, _| {
            if *key == crate::backend::Key::Run0 {
                interrupt.store(true, Ordering::SeqCst);
            }
        });

        let summary = coordinator.run().unwrap();
        assert_eq!(summary.outcome, RunOutcome::Interrupted);
        assert_eq!(summary.cycles, 0);
        for device in &rig.devices {
            assert_eq!(device.start_requests(), 0);
        }
        assert_eq!(rig.registry.stream_pid(0).unwrap(), None);
        assert_eq!(rig.registry.stream_pid(1).unwrap(), None);
    }

    #[test]
    fn test_dry_run_configures_only() {
        let names = ["acq2106_001", "acq2106_002"];
        let rig = rig(&names);
        let mut cfg = config(&names);
        cfg.stream.dry_run = true;
        cfg.trigger.wrtd_txi = Some("wrtd txi".to_string());

        let summary = quiet(Coordinator::new(cfg, rig.services.clone()).unwrap())
            .run()
            .unwrap();
        assert_eq!(summary.outcome, RunOutcome::DryRun);
        assert_eq!(
            rig.devices[0].sent(),
            vec![("cC".to_string(), "wrtd txi".to_string())]
        );
        assert!(rig.devices[1].sent().is_empty());
        for device in &rig.devices {
            assert_eq!(device.start_requests(), 0);
            assert_eq!(device.value(&crate::backend::Key::SigSrcTrg1).as_deref(), Some("WRTT1"));
        }
        assert_eq!(rig.host.purges(), 0);
    }

    #[test]
    fn test_stop_fanout_deadline() {
        let names = ["acq2106_001"];
        let rig = rig(&names);
        rig.devices[0].ignore_stop(true);
        let mut cfg = config(&names);
        cfg.timings.stop_wait_ms = 200;
        let coordinator = quiet(Coordinator::new(cfg, rig.services.clone()).unwrap());
        let units = coordinator.attach(&TriggerSelection::None).unwrap();
        units[0].start().unwrap();

        let mut stops = StopFanout::new();
        stops.launch(&units);
        let outcomes = stops.collect(Instant::now() + Duration::from_millis(50));
        assert_eq!(outcomes[0].outcome, StopOutcome::TimedOut);
        assert!(units[0].is_ended());
    }
}
