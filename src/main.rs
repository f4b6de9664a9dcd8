// LOADGEN v0.3.0 -- TRACE-DRIVEN PROCESS LOAD REPLAY
// REPLAYS A SERVERLESS-STYLE INVOCATION TRACE AS REAL PROCESSES ON A CHOSEN
// SET OF CORES UNDER A CHOSEN SCHEDULING POLICY, AND RECORDS PER-PROCESS
// REQUEST/RETURN TIMES FOR OFFLINE ANALYSIS.

mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::warn;

use loadgen::clock;
use loadgen::error::ReplayError;
use loadgen::launcher::LaunchSpec;
use loadgen::output::OutputPlan;
use loadgen::replay::{Replay, ReplayConfig, DEFAULT_LAUNCHERS, DEFAULT_QUEUE_DEPTH};
use loadgen::trace;

use cli::calibrate::CalibrateArgs;
use cli::check::CheckArgs;
use cli::probe::ProbeArgs;
use cli::PlacementArgs;

pub(crate) static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "loadgen", version)]
#[command(about = "LOADGEN -- TRACE-DRIVEN PROCESS LOAD REPLAY")]
struct Cli {
    // DEBUG-LEVEL ENGINE DIAGNOSTICS (RUST_LOG OVERRIDES)
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    // REPLAY A TRACE
    Run(RunArgs),
    // VERIFY PAYLOAD, CPUS, CGROUP AND SCHEDULER SUPPORT
    Check(CheckArgs),
    // MEASURE DEADLINE-WAIT OVERSHOOT TO TUNE THE GUARD BAND
    Probe(ProbeArgs),
    // TIME THE PAYLOAD PER ARGUMENT
    Calibrate(CalibrateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    // TRACE FILE: ONE "<inter-arrival seconds> <argument>" PER LINE
    trace: PathBuf,

    // PAYLOAD EXECUTABLE, CALLED AS `<payload> <argument>`
    #[arg(long)]
    payload: PathBuf,

    #[command(flatten)]
    placement: PlacementArgs,

    // LAUNCHER WORKER THREADS
    #[arg(long, default_value_t = DEFAULT_LAUNCHERS)]
    launchers: usize,

    // BOUNDED LAUNCH QUEUE CAPACITY
    #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,

    // PACER GUARD BAND IN MICROSECONDS (SLEEP UNTIL THIS CLOSE, THEN SPIN)
    #[arg(long, default_value_t = clock::DEFAULT_GUARD_NS / 1_000)]
    guard_us: u64,

    // OUTPUT DIRECTORY
    #[arg(long, default_value = "log")]
    log_dir: PathBuf,

    // OUTPUT FILE PREFIX (DEFAULTS TO THE TRACE FILE STEM)
    #[arg(long)]
    output: Option<String>,

    // SKIP THE TIMING TABLE AND TOTAL-TIME LOG
    #[arg(long)]
    no_timing: bool,

    // DO NOT CAPTURE OR LOG CHILD STDOUT
    #[arg(long)]
    no_output_log: bool,

    // WRITE ACTUAL-VS-TRACE INTER-ARRIVAL DEVIATIONS
    #[arg(long)]
    debug_iat: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(args: RunArgs) -> Result<()> {
    let items = trace::load_trace(&args.trace)?;
    let span = clock::ns_to_secs(trace::trace_span_ns(&items));

    let mut launch = LaunchSpec::new(&args.payload);
    launch.wrapper = args.placement.wrapper.clone();
    launch.capture_output = !args.no_output_log;
    launch.placement = args.placement.placement()?;

    let mut config = ReplayConfig::new(launch);
    config.launchers = args.launchers;
    config.queue_depth = args.queue_depth;
    config.guard_ns = args.guard_us * 1_000;
    config.main_cpu = args.placement.main_cpu;

    let label = match &args.output {
        Some(label) => label.clone(),
        None => args
            .trace
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "loadgen".to_string()),
    };

    let placement = &config.launch.placement;
    println!("LOADGEN v{}", env!("CARGO_PKG_VERSION"));
    println!("TRACE:           {} ({} items, {:.2}s span)", args.trace.display(), items.len(), span);
    println!("PAYLOAD:         {}", args.payload.display());
    if let Some(wrapper) = &config.launch.wrapper {
        println!("WRAPPER:         {}", wrapper.display());
    }
    println!(
        "CHILD CPUS:      {}",
        placement.affinity.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "inherit".to_string())
    );
    println!(
        "MAIN CPU:        {}",
        config.main_cpu.map(|c| c.to_string()).unwrap_or_else(|| "unpinned".to_string())
    );
    match placement.class {
        loadgen::placement::SchedClass::Fifo(prio) => println!("POLICY:          FIFO (priority {})", prio),
        class => println!("POLICY:          {}", class.label()),
    }
    if let Some(nice) = placement.niceness {
        println!("NICE:            {}", nice);
    }
    if let Some(cgroup) = &placement.cgroup {
        println!("CGROUP:          {}", cgroup.display());
    }
    println!("LAUNCHERS:       {} (queue depth {})", config.launchers, config.queue_depth);
    println!("GUARD:           {} us", args.guard_us);
    println!();

    let replay = Replay::new(config)?;

    println!("LOADGEN IS ACTIVE (CTRL+C TO ABORT)");
    let run = match replay.run(&items, &SHUTDOWN) {
        Ok(run) => run,
        Err(e @ ReplayError::IncompleteRun { .. }) if SHUTDOWN.load(Ordering::Relaxed) => {
            return Err(e).context("RUN ABORTED BY CTRL+C, NO OUTPUT WRITTEN");
        }
        Err(e) => return Err(e.into()),
    };

    run.results.summary().print();
    println!(
        "  PACER:             {} EMITTED, {:.1}ms BLOCKED ON QUEUE, WORST RELEASE {}us LATE",
        run.pacer.emitted,
        run.pacer.blocked_ns as f64 / 1_000_000.0,
        run.pacer.worst_release_late_ns / 1_000
    );
    println!(
        "  LAUNCHERS:         {} SPAWNED, MEAN SPAWN {}us, WORST {}us, PEAK LIVE {}",
        run.launchers.launched,
        run.launchers.mean_spawn_ns() / 1_000,
        run.launchers.spawn_ns_max / 1_000,
        run.peak_active
    );
    println!(
        "  REAPER:            {} REAPED ({} SWEPT), {} BACKOFFS",
        run.reaper.reaped, run.reaper.swept, run.reaper.backoffs
    );
    for (pid, status) in &run.reaper.unexpected {
        warn!("unregistered child exit left unreaped: pid {} status {}", pid, status);
    }
    println!();

    let mut plan = OutputPlan::new(&args.log_dir, label);
    plan.timing = !args.no_timing;
    plan.full_output = !args.no_output_log;
    plan.iat_diff = args.debug_iat;
    for path in plan.write(&run.results, &items)? {
        println!("WROTE {}", path.display());
    }

    println!("LOADGEN OUT.");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Check(args) => cli::check::run_check(args),
        Commands::Probe(args) => cli::probe::run_probe(args),
        Commands::Calibrate(args) => cli::calibrate::run_calibrate(args),
    }
}
