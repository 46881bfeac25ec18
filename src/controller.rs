//! Host controller
//!
//! Attaches the engine, pumps events from the source on a dedicated thread,
//! writes a report at every checkpoint and once at the end, then detaches.
//!
//! ```text
//!   pump thread                         controller thread
//!   -----------                         -----------------
//!   open source (ptrace is per-thread)
//!   attach engine ---- Arc<Engine> ---> checkpoint ticks: snapshot, report
//!   next_event -> dispatch              deadline / signal: set stop, wake
//!   detach source ---- PumpOutcome ---> final report
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::{after, bounded, never, tick, Sender};
use crossbeam::select;
use tracing::{debug, info, trace, warn};

use crate::cli::{Cli, OutputFormat};
use crate::csv_output::CsvOutput;
use crate::duration::{format_duration, sum_time_specs};
use crate::engine::{DiscardCategory, Engine, ProbeConfig, Verdict};
use crate::json_output::JsonOutput;
use crate::privileges::ReportPrivileges;
use crate::report::{render_text, DiscardTally, Report, Reporter, SortKey};
use crate::source::{EventSource, SourceError, SourceSpec};
use crate::{cpu, syscalls};

/// Report files are named `scbench.<seq>.<ext>`
pub const REPORT_PREFIX: &str = "scbench.";

const SIGNAL_POLL: Duration = Duration::from_millis(100);

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop_signal(_: libc::c_int) {
    SIGNALLED.store(true, Ordering::Relaxed);
}

/// Make SIGINT and SIGTERM end the session with a final report
pub fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(handle_stop_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("Failed to install {} handler", signal))?;
    }
    Ok(())
}

fn signal_received() -> bool {
    SIGNALLED.load(Ordering::Relaxed)
}

/// Sent to the pump thread to break it out of a blocking wait
const WAKE_SIGNAL: nix::sys::signal::Signal = nix::sys::signal::Signal::SIGURG;

extern "C" fn handle_wake_signal(_: libc::c_int) {}

/// Without SA_RESTART the handler makes a blocked `waitpid` return EINTR
fn install_wake_handler() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};

    let action = SigAction::new(
        SigHandler::Handler(handle_wake_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler does nothing
    unsafe { sigaction(WAKE_SIGNAL, &action) }
        .with_context(|| format!("Failed to install {} handler", WAKE_SIGNAL))?;
    Ok(())
}

fn wake(pump: &thread::JoinHandle<()>) {
    use nix::sys::pthread::pthread_kill;
    use std::os::unix::thread::JoinHandleExt;

    if let Err(e) = pthread_kill(pump.as_pthread_t(), WAKE_SIGNAL) {
        trace!("Failed to wake event pump: {}", e);
    }
}

/// Validated session settings
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub source: SourceSpec,
    pub follow: bool,
    /// `None` runs until the source ends or a stop signal arrives
    pub duration: Option<Duration>,
    pub checkpoint: Duration,
    pub clear: bool,
    pub outdir: Option<PathBuf>,
    pub overwrite: bool,
    pub tee: bool,
    pub sort: SortKey,
    pub show_sysnum: bool,
    pub format: OutputFormat,
    pub num_cpus: usize,
    pub tracked_capacity: usize,
}

impl BenchConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let source = match (cli.run, cli.pid, cli.replay) {
            (Some(command), None, None) => SourceSpec::Run(command),
            (None, Some(pid), None) => SourceSpec::Attach(pid),
            (None, target, Some(path)) => SourceSpec::Replay { path, target },
            (None, None, None) => {
                bail!("Must specify one of --run PROG, --pid PID or --replay FILE")
            }
            _ => bail!("--run, --pid and --replay cannot be combined that way"),
        };

        let has_root = !matches!(source, SourceSpec::Replay { target: None, .. });
        if cli.follow && !has_root {
            bail!("--follow needs a process to follow (--run or --pid)");
        }

        let duration = if cli.duration.is_empty() {
            None
        } else {
            let duration = sum_time_specs(&split_specs(&cli.duration))?;
            if duration.is_zero() {
                bail!("--duration must be positive");
            }
            Some(duration)
        };
        let checkpoint = sum_time_specs(&split_specs(&cli.checkpoint))?;
        if checkpoint.is_zero() {
            bail!("--checkpoint must be positive");
        }

        let num_cpus = match cli.cpus {
            Some(0) => bail!("--cpus must be positive"),
            Some(n) => n,
            None => cpu::num_possible_cpus(),
        };

        Ok(Self {
            source,
            follow: cli.follow,
            duration,
            checkpoint,
            clear: cli.clear,
            outdir: cli.outdir,
            overwrite: cli.overwrite,
            tee: cli.tee,
            sort: cli.sort,
            show_sysnum: cli.sysnum,
            format: cli.format,
            num_cpus,
            tracked_capacity: cli.max_tracked,
        })
    }
}

/// `["1m 30s", "5s"]` -> `["1m", "30s", "5s"]`
fn split_specs(values: &[String]) -> Vec<&str> {
    values.iter().flat_map(|v| v.split_whitespace()).collect()
}

/// Refuse to mix reports with an earlier run's unless `overwrite`
pub fn prepare_outdir(dir: &Path, overwrite: bool) -> Result<()> {
    let _privileges = ReportPrivileges::as_invoking_user();
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut existing = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(REPORT_PREFIX) {
            existing.push(entry.path());
        }
    }
    if existing.is_empty() {
        return Ok(());
    }
    if !overwrite {
        bail!(
            "Cannot overwrite reports in {} without --overwrite",
            dir.display()
        );
    }
    for path in existing {
        debug!("Removing old report {}", path.display());
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

pub fn report_path(dir: &Path, seq: u64, format: OutputFormat) -> PathBuf {
    dir.join(format!("{}{}.{}", REPORT_PREFIX, seq, format.extension()))
}

/// Renders reports and sends them where the user asked
#[derive(Debug)]
pub struct ReportWriter {
    outdir: Option<PathBuf>,
    tee: bool,
    format: OutputFormat,
    sort: SortKey,
    show_sysnum: bool,
    written: u64,
}

impl ReportWriter {
    pub fn new(config: &BenchConfig) -> Self {
        Self {
            outdir: config.outdir.clone(),
            tee: config.tee,
            format: config.format,
            sort: config.sort,
            show_sysnum: config.show_sysnum,
            written: 0,
        }
    }

    pub fn render(
        &self,
        report: &Report,
        probe: &ProbeConfig,
        exit_code: Option<i32>,
    ) -> Result<String> {
        Ok(match self.format {
            OutputFormat::Text => render_text(report, self.show_sysnum),
            OutputFormat::Json => {
                let mut output = JsonOutput::new(report, probe, self.sort);
                output.set_exit_code(exit_code);
                let mut json = output.to_json()?;
                json.push('\n');
                json
            }
            OutputFormat::Csv => CsvOutput::new(self.show_sysnum).to_csv(report),
        })
    }

    pub fn write(
        &mut self,
        report: &Report,
        probe: &ProbeConfig,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let rendered = self.render(report, probe, exit_code)?;
        match &self.outdir {
            Some(dir) => {
                let path = report_path(dir, report.seq, self.format);
                {
                    let _privileges = ReportPrivileges::as_invoking_user();
                    fs::write(&path, &rendered)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                }
                info!("Wrote checkpoint {} to {}", report.seq, path.display());
                if self.tee {
                    eprint!("{}", rendered);
                }
            }
            None => eprint!("{}", rendered),
        }
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Discard counts shared between the pump and the controller
#[derive(Debug, Default)]
struct DiscardCounters {
    by_category: [AtomicU64; 4],
}

impl DiscardCounters {
    const CATEGORIES: [DiscardCategory; 4] = [
        DiscardCategory::Policy,
        DiscardCategory::KernelRestart,
        DiscardCategory::MissingState,
        DiscardCategory::IdentityMismatch,
    ];

    fn record(&self, category: DiscardCategory) {
        let index = Self::CATEGORIES
            .iter()
            .position(|&c| c == category)
            .unwrap_or(0);
        self.by_category[index].fetch_add(1, Ordering::Relaxed);
    }

    fn tally(&self) -> DiscardTally {
        let mut tally = DiscardTally::default();
        for (category, count) in Self::CATEGORIES.iter().zip(&self.by_category) {
            let count = count.load(Ordering::Relaxed);
            if count > 0 {
                tally.categories.insert(*category, count);
            }
        }
        tally
    }
}

/// How the pump thread finished
#[derive(Debug, Default)]
struct PumpOutcome {
    exit_status: Option<i32>,
    events: u64,
    credited: u64,
    error: Option<anyhow::Error>,
}

/// What a finished session reports back to `main`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Exit status of the measured program when it was spawned
    pub exit_status: Option<i32>,
    pub reports: u64,
    pub events: u64,
    pub credited: u64,
}

/// Open the configured source and measure
pub fn run(config: BenchConfig) -> Result<SessionSummary> {
    let spec = config.source.clone();
    let follow = config.follow;
    run_with(config, move || spec.open(follow))
}

/// Measure events from the source built by `open`, which runs on the pump
/// thread
pub fn run_with<F>(config: BenchConfig, open: F) -> Result<SessionSummary>
where
    F: FnOnce() -> Result<Box<dyn EventSource>, SourceError> + Send + 'static,
{
    if let Some(dir) = &config.outdir {
        prepare_outdir(dir, config.overwrite)?;
    }

    let probe = ProbeConfig::new(std::process::id(), config.num_cpus)
        .with_num_syscalls(syscalls::NUM_SYSCALLS)
        .following(config.follow)
        .with_tracked_capacity(config.tracked_capacity);

    install_wake_handler()?;
    let stop = Arc::new(AtomicBool::new(false));
    let discards = Arc::new(DiscardCounters::default());
    let (engine_tx, engine_rx) = bounded(1);
    let (done_tx, done_rx) = bounded(1);

    let pump = {
        let stop = Arc::clone(&stop);
        let discards = Arc::clone(&discards);
        thread::Builder::new()
            .name("scbench-pump".to_string())
            .spawn(move || {
                let outcome = pump_events(open, probe, &engine_tx, &stop, &discards);
                let _ = done_tx.send(outcome);
            })
            .context("Failed to spawn event pump")?
    };

    let engine: Arc<Engine> = match engine_rx.recv() {
        Ok(Ok(engine)) => engine,
        Ok(Err(e)) => {
            let _ = pump.join();
            return Err(e);
        }
        Err(_) => {
            let _ = pump.join();
            bail!("Event pump exited before attaching");
        }
    };
    let probe = engine.config().clone();
    info!(
        "Measuring {} on {} CPUs, checkpoint every {}",
        probe
            .target_tgid
            .map_or_else(|| "the whole system".to_string(), |t| format!("process {}", t)),
        probe.num_cpus,
        format_duration(config.checkpoint)
    );

    let mut writer = ReportWriter::new(&config);
    let mut reporter = Reporter::new(config.sort);
    let checkpoints = tick(config.checkpoint);
    let deadline = config.duration.map_or_else(never, after);

    let outcome = loop {
        select! {
            recv(done_rx) -> outcome => {
                break outcome.unwrap_or_else(|_| PumpOutcome {
                    error: Some(anyhow!("Event pump panicked")),
                    ..PumpOutcome::default()
                });
            }
            recv(checkpoints) -> _ => {
                let snapshot = engine.counters().snapshot();
                let report =
                    reporter.checkpoint(&snapshot, config.clear, false, &discards.tally());
                if let Err(e) = writer.write(&report, &probe, None) {
                    stop.store(true, Ordering::Relaxed);
                    wake(&pump);
                    let _ = pump.join();
                    return Err(e);
                }
            }
            recv(deadline) -> _ => {
                info!(
                    "Duration of {} elapsed",
                    config.duration.map(format_duration).unwrap_or_default()
                );
                stop.store(true, Ordering::Relaxed);
                wake(&pump);
            }
            default(SIGNAL_POLL) => {
                if signal_received() && !stop.swap(true, Ordering::Relaxed) {
                    info!("Stop requested, writing final report");
                }
                // Repeat in case the pump was between its stop check and
                // the wait when the last wake arrived
                if stop.load(Ordering::Relaxed) {
                    wake(&pump);
                }
            }
        }
    };
    if pump.join().is_err() {
        warn!("Event pump panicked");
    }

    let snapshot = engine.counters().snapshot();
    let report = reporter.checkpoint(&snapshot, config.clear, true, &discards.tally());
    writer.write(&report, &probe, outcome.exit_status)?;

    match Arc::try_unwrap(engine) {
        Ok(engine) => drop(engine.detach()),
        Err(_) => warn!("Engine still shared at detach"),
    }

    if let Some(e) = outcome.error {
        return Err(e);
    }
    info!(
        "Processed {} events, credited {} calls",
        outcome.events, outcome.credited
    );
    Ok(SessionSummary {
        exit_status: outcome.exit_status,
        reports: writer.written(),
        events: outcome.events,
        credited: outcome.credited,
    })
}

fn pump_events<F>(
    open: F,
    probe: ProbeConfig,
    engine_tx: &Sender<Result<Arc<Engine>>>,
    stop: &AtomicBool,
    discards: &DiscardCounters,
) -> PumpOutcome
where
    F: FnOnce() -> Result<Box<dyn EventSource>, SourceError>,
{
    let mut source = match open() {
        Ok(source) => source,
        Err(e) => {
            let _ = engine_tx
                .send(Err(anyhow::Error::new(e).context("Failed to open event source")));
            return PumpOutcome::default();
        }
    };

    let probe = match source.root_tgid() {
        Some(root) => probe.with_target(root),
        None => probe,
    };
    let engine = match Engine::attach(probe) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            if let Err(detach) = source.detach() {
                warn!("Failed to release event source: {}", detach);
            }
            let _ = engine_tx.send(Err(anyhow::Error::new(e).context("Failed to attach")));
            return PumpOutcome::default();
        }
    };
    if engine_tx.send(Ok(Arc::clone(&engine))).is_err() {
        let _ = source.detach();
        return PumpOutcome::default();
    }

    let mut outcome = PumpOutcome::default();
    loop {
        match source.next_event(stop) {
            Ok(Some(event)) => {
                outcome.events += 1;
                match engine.dispatch(&event) {
                    Verdict::Credited { .. } => outcome.credited += 1,
                    Verdict::Tracked(tgid) => debug!("Following process {}", tgid),
                    Verdict::Untracked(tgid) => debug!("Process {} left the tree", tgid),
                    Verdict::Discarded(reason) if reason.loses_measurement() => {
                        discards.record(reason.category())
                    }
                    Verdict::Discarded(reason) => trace!("Ignored {:?}", reason),
                    Verdict::Recorded => {}
                }
            }
            Ok(None) => break,
            Err(e) => {
                outcome.error = Some(anyhow::Error::new(e).context("Event source failed"));
                break;
            }
        }
    }

    if let Err(e) = source.detach() {
        warn!("Failed to detach event source: {}", e);
    }
    outcome.exit_status = source.exit_status();
    outcome
}
