// PAYLOAD CALIBRATION
// RUNS THE PAYLOAD SEQUENTIALLY FOR EACH ARGUMENT IN A RANGE AND RECORDS THE
// MEAN WALL TIME PER ARGUMENT. THE TABLE MAPS TARGET DURATIONS TO ARGUMENTS
// WHEN BUILDING TRACES FOR A GIVEN HOST.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::Ordering;

use anyhow::{bail, Context, Result};
use clap::Args;
use log::warn;

use loadgen::clock;

use crate::SHUTDOWN;

#[derive(Args, Debug)]
pub struct CalibrateArgs {
    // PAYLOAD EXECUTABLE, CALLED AS `<payload> <argument>`
    #[arg(long)]
    pub payload: PathBuf,

    // FIRST ARGUMENT (INCLUSIVE)
    #[arg(long, default_value_t = 3)]
    pub from: u32,

    // LAST ARGUMENT (INCLUSIVE)
    #[arg(long, default_value_t = 40)]
    pub to: u32,

    // RUNS PER ARGUMENT
    #[arg(long, default_value_t = 100)]
    pub repeat: u32,

    // DIRECTORY FOR THE CALIBRATION LOGS
    #[arg(long, default_value = "log")]
    pub log_dir: PathBuf,
}

fn command_line(cmd: &mut Command) -> Option<String> {
    cmd.output().ok().and_then(|o| {
        if o.status.success() {
            Some(String::from_utf8_lossy(&o.stdout).trim().to_string())
        } else {
            None
        }
    })
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

fn today() -> String {
    command_line(Command::new("date").arg("+%Y-%m-%d")).unwrap_or_else(|| "unknown".to_string())
}

// MEAN WALL TIME OF `repeat` SEQUENTIAL RUNS, IN MILLISECONDS
fn time_argument(payload: &Path, arg: u32, repeat: u32) -> Result<(f64, u32)> {
    let mut failures = 0;
    let t0 = clock::now_ns();
    for _ in 0..repeat {
        let status = Command::new(payload)
            .arg(arg.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .with_context(|| format!("SPAWN {} FAILED", payload.display()))?;
        if !status.success() {
            failures += 1;
        }
    }
    let elapsed = clock::now_ns() - t0;
    Ok((elapsed as f64 / 1_000_000.0 / repeat as f64, failures))
}

pub fn run_calibrate(args: CalibrateArgs) -> Result<()> {
    if args.from > args.to || args.repeat == 0 {
        bail!("CALIBRATE NEEDS --from <= --to AND A NON-ZERO --repeat");
    }
    fs::create_dir_all(&args.log_dir)
        .with_context(|| format!("MKDIR {} FAILED", args.log_dir.display()))?;

    let host = hostname();
    let date = today();
    let log_path = args.log_dir.join(format!("calibrate_{}_{}.txt", host, date));
    let list_path = args.log_dir.join(format!("calibrate_list_{}_{}.txt", host, date));

    println!("LOADGEN PAYLOAD CALIBRATION");
    println!("PAYLOAD:         {}", args.payload.display());
    println!("ARGUMENTS:       {}..={}", args.from, args.to);
    println!("REPEAT:          {}", args.repeat);
    println!("HOST:            {}", host);
    println!();

    let mut log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("OPEN {} FAILED", log_path.display()))?;

    let mut durations = Vec::new();
    let mut arguments = Vec::new();
    for arg in args.from..=args.to {
        if SHUTDOWN.load(Ordering::Relaxed) {
            println!("INTERRUPTED AFTER ARGUMENT {}", arg.saturating_sub(1));
            break;
        }
        let (mean_ms, failures) = time_argument(&args.payload, arg, args.repeat)?;
        if failures > 0 {
            warn!("argument {}: {} of {} runs exited non-zero", arg, failures, args.repeat);
        }
        println!("  ARG {:<4} {:>12.3} ms", arg, mean_ms);
        writeln!(log_file, "Runtime for arg {} is {} ms", arg, mean_ms)
            .with_context(|| format!("WRITE {} FAILED", log_path.display()))?;
        durations.push(mean_ms.round() as u64);
        arguments.push(arg);
    }

    let list = format!("dur_list = {:?}\nargs = {:?}\n", durations, arguments);
    fs::write(&list_path, list).with_context(|| format!("WRITE {} FAILED", list_path.display()))?;

    println!();
    println!("WROTE {}", log_path.display());
    println!("WROTE {}", list_path.display());
    Ok(())
}
