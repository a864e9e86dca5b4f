//! hts-multistream - Main Entry Point
//!
//! Streams from one or more acquisition units over AFHBA links, or audits
//! the links without streaming.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use hts_multistream::{
    backend::HostServices,
    config::RunConfig,
    link::{LinkHealthMonitor, ResetOutcome},
    run::{Coordinator, RunOutcome},
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit status after an interrupt-driven shutdown
const EXIT_INTERRUPTED: u8 = 130;

static INTERRUPT: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_signal: libc::c_int) {
    if let Some(flag) = INTERRUPT.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

fn install_signal_handlers(flag: Arc<AtomicBool>) {
    let _ = INTERRUPT.set(flag);
    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }
}

#[derive(Parser)]
#[command(name = "hts-multistream", version, about)]
struct Cli {
    /// Run config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose unit and command logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream from the given units
    Stream(StreamArgs),
    /// Check, and if needed reset, every link
    CheckLinks {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Only these units (default: every connected unit)
        units: Vec<String>,
    },
}

#[derive(Args)]
struct StreamArgs {
    /// Unit hostnames
    #[arg(required = true)]
    units: Vec<String>,

    /// Maximum capture length in buffers
    #[arg(long)]
    nbuffers: Option<u64>,

    /// Maximum capture length in seconds
    #[arg(long)]
    secs: Option<u64>,

    /// Concatenate buffers (2 means 3 buffers combined)
    #[arg(long)]
    concat: Option<u32>,

    /// Placement map, e.g. 133:A:1,2/133:B:3
    #[arg(long)]
    map: Option<String>,

    /// Write each buffer once instead of overwriting
    #[arg(long)]
    no_recycle: bool,

    /// Keep output from earlier runs
    #[arg(long)]
    no_delete: bool,

    /// Size nbuffers from free memory (with --no-recycle)
    #[arg(long)]
    auto_size: bool,

    /// Pipe each stream through the ramp checker
    #[arg(long)]
    check_spad: bool,

    /// Log a hexdump command per link
    #[arg(long)]
    hex_dump: bool,

    /// Report host CPU usage
    #[arg(long)]
    cpu_usage: bool,

    /// Configure units and exit
    #[arg(long)]
    dry_run: bool,

    /// Output root (must be a ramdisk)
    #[arg(long)]
    outroot: Option<PathBuf>,

    /// Scratch-pad: enabled,len,mode
    #[arg(long)]
    spad: Option<String>,

    #[arg(long)]
    decimate: Option<u32>,

    /// Trigger source for d0
    #[arg(long)]
    sig_src_trg_0: Option<String>,

    /// Trigger source for d1
    #[arg(long)]
    sig_src_trg_1: Option<String>,

    /// Burst length
    #[arg(long)]
    rtm_translen: Option<u32>,

    /// Site knob: s1.trg=1,1,1 (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Signal generator to trigger once all units are armed
    #[arg(long)]
    sig_gen: Option<String>,

    /// Inter-unit trigger command sent by the first unit
    #[arg(long)]
    wrtd_txi: Option<String>,

    /// Trigger source set on the first unit once all are armed
    #[arg(long)]
    mtrg: Option<String>,
}

impl StreamArgs {
    /// Override the loaded config with explicit flags
    fn apply(self, config: &mut RunConfig) -> anyhow::Result<()> {
        config.units = self.units;
        if let Some(map) = self.map {
            config.map = map;
        }

        let stream = &mut config.stream;
        if let Some(nbuffers) = self.nbuffers {
            stream.nbuffers = nbuffers;
        }
        if let Some(secs) = self.secs {
            stream.secs = secs;
        }
        if let Some(concat) = self.concat {
            stream.concat = concat;
        }
        stream.recycle &= !self.no_recycle;
        stream.delete &= !self.no_delete;
        stream.auto_size |= self.auto_size;
        stream.check_spad |= self.check_spad;
        stream.hex_dump |= self.hex_dump;
        stream.cpu_usage |= self.cpu_usage;
        stream.dry_run |= self.dry_run;

        if let Some(outroot) = self.outroot {
            config.host.output_root = outroot;
        }

        let acq = &mut config.acquisition;
        acq.spad = self.spad.or(acq.spad.take());
        acq.decimate = self.decimate.or(acq.decimate);
        acq.sig_src_trg_0 = self.sig_src_trg_0.or(acq.sig_src_trg_0.take());
        acq.sig_src_trg_1 = self.sig_src_trg_1.or(acq.sig_src_trg_1.take());
        acq.rtm_translen = self.rtm_translen.or(acq.rtm_translen);
        for param in self.params {
            let (key, value) = param
                .split_once('=')
                .with_context(|| format!("--param {} is not KEY=VALUE", param))?;
            acq.params.insert(key.to_string(), value.to_string());
        }

        let trigger = &mut config.trigger;
        trigger.sig_gen = self.sig_gen.or(trigger.sig_gen.take());
        trigger.wrtd_txi = self.wrtd_txi.or(trigger.wrtd_txi.take());
        trigger.mtrg = self.mtrg.or(trigger.mtrg.take());
        Ok(())
    }
}

/// Install the subscriber; the guard keeps the file writer flushing
fn init_logging(cli: &Cli) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_filter = if cli.verbose {
        "info,hts_multistream=debug"
    } else {
        "info"
    };

    let (file_layer, guard) = match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .with_context(|| format!("log file {:?} has no file name", path))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!("{}\n{}", info, backtrace);
    }));
}

fn stream(cli_config: RunConfig, args: StreamArgs) -> anyhow::Result<ExitCode> {
    let mut config = cli_config;
    args.apply(&mut config)?;

    let services = HostServices::system(&config);
    let interrupt = Arc::new(AtomicBool::new(false));
    install_signal_handlers(interrupt.clone());

    let coordinator = Coordinator::new(config, services)?.with_interrupt(interrupt);
    let summary = coordinator.run()?;
    println!("{}", summary);

    // A failed trigger is soft: the units were still stopped in order
    Ok(match summary.outcome {
        RunOutcome::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
        RunOutcome::Completed | RunOutcome::DryRun | RunOutcome::TriggerFailed => {
            ExitCode::SUCCESS
        }
    })
}

fn check_links(config: RunConfig, json: bool, units: Vec<String>) -> anyhow::Result<ExitCode> {
    let services = HostServices::system(&config);
    let monitor = LinkHealthMonitor::new(services.registry.clone(), &config.timings);
    let report = monitor.audit(services.connector.as_ref(), &units)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for reset in &report.resets {
            match &reset.outcome {
                ResetOutcome::Reconnected { attempts } => {
                    println!("[{}] reconnected after {} attempt(s)", reset.unit, attempts)
                }
                other => println!("[{}] not connected: {:?}", reset.unit, other),
            }
        }
        for entry in &report.links {
            println!("{}", entry);
        }
    }

    Ok(if report.all_up() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = RunConfig::load_or_default(cli.config.as_deref())?;
    config.verbose |= cli.verbose;

    match cli.command {
        Command::Stream(args) => stream(config, args),
        Command::CheckLinks { json, units } => check_links(config, json, units),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = match init_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    install_panic_hook();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
