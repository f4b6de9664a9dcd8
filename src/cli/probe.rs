// DEADLINE-WAIT PROBE
// MEASURES HOW LATE A PURE SLEEP AND THE HYBRID SLEEP+SPIN WAIT RETURN FOR
// THE SAME TARGET. THE HYBRID NUMBERS ARE WHAT THE PACER WILL SEE; THE SLEEP
// NUMBERS TELL YOU HOW WIDE THE GUARD BAND MUST BE.

use std::sync::atomic::Ordering;

use anyhow::{bail, Result};
use clap::Args;

use loadgen::clock;
use loadgen::placement;
use loadgen::results::percentile;

use crate::SHUTDOWN;

#[derive(Args, Debug)]
pub struct ProbeArgs {
    // WAIT TARGET IN MICROSECONDS
    #[arg(long, default_value_t = 10_000)]
    pub target_us: u64,

    // SAMPLES PER MODE
    #[arg(long, default_value_t = 200)]
    pub samples: usize,

    // GUARD BAND FOR THE HYBRID WAIT IN MICROSECONDS
    #[arg(long, default_value_t = clock::DEFAULT_GUARD_NS / 1_000)]
    pub guard_us: u64,

    // PIN THE PROBE TO THIS CPU (USE THE PLANNED MAIN CPU)
    #[arg(long)]
    pub cpu: Option<usize>,

    // PRINT EVERY SAMPLE (ONE LINE, MICROSECONDS)
    #[arg(long)]
    pub raw: bool,
}

// RETURNS SORTED OVERSHOOTS IN MICROSECONDS. STOPS EARLY ON CTRL+C.
fn sample(args: &ProbeArgs, wait: impl Fn(u64) -> u64) -> Vec<f64> {
    let target_ns = args.target_us * 1_000;
    let mut late_us = Vec::with_capacity(args.samples);
    for _ in 0..args.samples {
        if SHUTDOWN.load(Ordering::Relaxed) {
            break;
        }
        let late = wait(clock::now_ns() + target_ns);
        if args.raw {
            println!("{}", late / 1_000);
        }
        late_us.push(late as f64 / 1_000.0);
    }
    late_us.sort_by(|a, b| a.total_cmp(b));
    late_us
}

fn report(label: &str, sorted: &[f64]) {
    println!(
        "  {:<8} N={:<5} MEDIAN {:>8.1}us  P99 {:>8.1}us  WORST {:>8.1}us",
        label,
        sorted.len(),
        percentile(sorted, 50.0),
        percentile(sorted, 99.0),
        sorted.last().copied().unwrap_or(0.0)
    );
}

pub fn run_probe(args: ProbeArgs) -> Result<()> {
    if args.samples == 0 || args.target_us == 0 {
        bail!("PROBE NEEDS A NON-ZERO TARGET AND SAMPLE COUNT");
    }
    if let Some(cpu) = args.cpu {
        placement::pin_current_thread(cpu)?;
    }

    let guard_ns = args.guard_us * 1_000;
    println!("LOADGEN DEADLINE PROBE");
    println!("TARGET:          {} us", args.target_us);
    println!("GUARD:           {} us", args.guard_us);
    println!("SAMPLES:         {}", args.samples);
    if let Some(cpu) = args.cpu {
        println!("PINNED:          cpu {}", cpu);
    }
    println!();

    let sleep = sample(&args, clock::sleep_until);
    let hybrid = sample(&args, |deadline| clock::wait_until(deadline, guard_ns));

    println!("OVERSHOOT:");
    report("SLEEP", &sleep);
    report("HYBRID", &hybrid);

    let sleep_p99 = percentile(&sleep, 99.0);
    if sleep_p99 * 1_000.0 > guard_ns as f64 {
        println!();
        println!(
            "  SLEEP P99 ({:.0}us) EXCEEDS THE GUARD BAND -- RAISE --guard-us TO AT LEAST {:.0}",
            sleep_p99,
            sleep_p99.ceil()
        );
    }
    Ok(())
}
