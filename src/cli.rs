use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use parking_lot::Mutex;
use tracing::{debug, info};

use hilti_runtime::version::VERSION;
use hilti_runtime::{
    CommandQueue, Continuation, Runtime, RuntimeConfig, RuntimeMetricsSnapshot, SinkId, Timer,
    TimerManager, Vid,
};

use crate::utils::logger;

#[derive(Parser, Debug)]
#[command(name = "hilti-rt", version = VERSION, about = "HILTI runtime driver")]
pub struct HiltiCli {
    #[arg(long, global = true)]
    /// Number of worker threads (overrides configuration and environment).
    workers: Option<usize>,

    #[arg(long, global = true)]
    /// Read runtime settings from a TOML file (requires the `toml-config` feature).
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    /// Emit debug-level runtime diagnostics.
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl HiltiCli {
    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Schedules cooperative jobs across many virtual threads and verifies ordering.
    Stress {
        #[arg(long, default_value_t = 64)]
        vids: usize,
        #[arg(long, default_value_t = 16)]
        jobs: usize,
        #[arg(long, default_value_t = 2)]
        yields: u32,
        /// Tear the pool down with KILL instead of draining it.
        #[arg(long)]
        kill: bool,
        /// Write one line per finished job through the command queue.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Drives a timer manager through a simulated logical clock.
    Timers {
        #[arg(long, default_value_t = 1000)]
        count: u64,
        #[arg(long, default_value_t = 100)]
        step: u64,
    },
}

pub fn run() -> Result<()> {
    let cli = HiltiCli::parse();
    logger::init_logging(cli.verbose);
    let config = load_config(&cli)?;
    debug!(?config, "runtime configuration");

    match &cli.command {
        Command::Stress {
            vids,
            jobs,
            yields,
            kill,
            output,
        } => handle_stress(config, *vids, *jobs, *yields, *kill, output.as_deref()),
        Command::Timers { count, step } => handle_timers(*count, *step),
    }
}

fn load_config(cli: &HiltiCli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => read_config_file(path)?,
        None => RuntimeConfig::from_env()?,
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "toml-config")]
fn read_config_file(path: &Path) -> Result<RuntimeConfig> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    Ok(RuntimeConfig::from_toml_str(&source)?)
}

#[cfg(not(feature = "toml-config"))]
fn read_config_file(path: &Path) -> Result<RuntimeConfig> {
    bail!(
        "cannot read {}: built without the `toml-config` feature",
        path.display()
    )
}

type StartLog = Arc<Mutex<HashMap<i64, Vec<usize>>>>;

#[derive(Clone)]
struct JobOutput {
    commands: CommandQueue,
    sink: SinkId,
}

fn handle_stress(
    config: RuntimeConfig,
    vids: usize,
    jobs: usize,
    yields: u32,
    kill: bool,
    output: Option<&Path>,
) -> Result<()> {
    if !config.threaded {
        bail!("stress workload needs a threaded runtime");
    }
    let runtime = Runtime::new(config)?;
    let workers = runtime.thread_manager()?.num_workers();
    let starts: StartLog = Arc::new(Mutex::new(HashMap::new()));

    let output = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let commands = runtime.commands().clone();
            let sink = commands.open_sink(Box::new(BufWriter::new(file)));
            Some(JobOutput { commands, sink })
        }
        None => None,
    };

    let started = Instant::now();
    for job in 0..jobs {
        for vid in 0..vids {
            let vid = Vid::new(vid as i64);
            runtime.schedule(
                vid,
                job_step(job, yields, true, Arc::clone(&starts), output.clone()),
            )?;
        }
    }

    // The sink stays open until the runtime shuts the command queue down,
    // which flushes it after every queued write.
    let metrics = runtime.metrics();
    runtime.shutdown(!kill)?;
    let elapsed = started.elapsed();

    let snapshot = metrics.snapshot();
    print_stress_summary(workers, &snapshot, elapsed);

    if snapshot.commands_failed > 0 {
        bail!("{} output command(s) failed", snapshot.commands_failed);
    }

    let (checked, violations) = verify_start_order(&starts.lock());
    if kill {
        println!(
            "{} {checked} vid(s) observed, {} job(s) discarded by KILL",
            "kill".yellow().bold(),
            snapshot.jobs_discarded
        );
    } else if violations.is_empty() && checked == vids {
        println!("{} per-vid order held for {checked} vid(s)", "ok".green().bold());
    } else {
        bail!(
            "ordering check failed: {checked} of {vids} vid(s) ran, out of order: {violations:?}"
        );
    }
    Ok(())
}

fn job_step(
    job: usize,
    remaining: u32,
    first: bool,
    starts: StartLog,
    output: Option<JobOutput>,
) -> Continuation {
    Continuation::new(move |ctx| {
        if first {
            starts.lock().entry(ctx.vid().raw()).or_default().push(job);
        }
        if remaining > 0 {
            ctx.yield_with(job_step(job, remaining - 1, false, starts, output));
        } else if let Some(output) = output {
            let line = format!("vid={} job={job} worker={}\n", ctx.vid(), ctx.worker());
            output.commands.write(output.sink, line);
        }
        Ok(())
    })
}

/// Returns how many vids ran at all and which of them started jobs out of
/// schedule order.
fn verify_start_order(starts: &HashMap<i64, Vec<usize>>) -> (usize, Vec<i64>) {
    let mut violations: Vec<i64> = starts
        .iter()
        .filter(|(_, jobs)| jobs.windows(2).any(|pair| pair[0] >= pair[1]))
        .map(|(vid, _)| *vid)
        .collect();
    violations.sort_unstable();
    (starts.len(), violations)
}

fn print_stress_summary(workers: usize, snapshot: &RuntimeMetricsSnapshot, elapsed: Duration) {
    println!("{}", "== Stress ==".bold());
    println!("  workers    {workers}");
    println!("  scheduled  {}", snapshot.jobs_scheduled);
    println!("  executed   {}", snapshot.jobs_executed);
    println!("  yields     {}", snapshot.yields);
    println!("  dropped    {}", snapshot.jobs_dropped);
    println!("  discarded  {}", snapshot.jobs_discarded);
    println!("  uncaught   {}", snapshot.uncaught_exceptions);
    println!("  commands   {}", snapshot.commands_executed);
    println!("  cmd errors {}", snapshot.commands_failed);
    println!("  elapsed    {:.2?}", elapsed);
}

/// Prime stride used to scramble timer expirations.
const TIMER_SPREAD: u64 = 7919;

fn handle_timers(count: u64, step: u64) -> Result<()> {
    if count == 0 || step == 0 {
        bail!("--count and --step must be positive");
    }

    if count.checked_mul(TIMER_SPREAD).is_none() {
        bail!("--count {count} is too large");
    }

    let manager = TimerManager::new();
    let horizon = count * 2;
    let timers: Vec<Timer> = (0..count).map(|_| Timer::function(|| {})).collect();
    for (index, timer) in (0_u64..).zip(&timers) {
        // Spread expirations over the horizon in a scrambled order.
        let expires = (index * TIMER_SPREAD) % horizon + 1;
        manager.schedule(expires, timer)?;
    }
    info!(pending = manager.len(), "timers scheduled");

    println!("{}", "== Timers ==".bold());
    let mut now = 0;
    let mut total = 0;
    while !manager.is_empty() {
        now += step;
        let fired = manager.advance(now);
        total += fired;
        println!("  t={now:<8} fired {fired}");
    }

    if total as u64 != count {
        bail!("expected {count} timers to fire, saw {total}");
    }
    println!("{} all {total} timers fired by t={now}", "ok".green().bold());
    Ok(())
}
