use std::fs::OpenOptions;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;

use loadgen::placement::{self, SchedClass};

use super::PlacementArgs;

const SCX_OPS_PATH: &str = "/sys/kernel/sched_ext/root/ops";
const RT_RUNTIME_PATH: &str = "/proc/sys/kernel/sched_rt_runtime_us";

#[derive(Args, Debug)]
pub struct CheckArgs {
    // PAYLOAD EXECUTABLE TO VERIFY
    #[arg(long)]
    pub payload: PathBuf,

    #[command(flatten)]
    pub placement: PlacementArgs,
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz       NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz       UNREADABLE (SKIPPED)");
        return true;
    }
    let found = config.lines().any(|l| l.trim() == "CONFIG_SCHED_CLASS_EXT=y");
    if found {
        println!("  CONFIG_SCHED_CLASS_EXT OK");
    } else {
        println!("  CONFIG_SCHED_CLASS_EXT NOT FOUND -- SCHED_EXT CHILDREN WILL FAIL TO SPAWN");
    }
    found
}

fn check_sched_ext_active() -> bool {
    let path = Path::new(SCX_OPS_PATH);
    if !path.exists() {
        println!("  sched_ext             NOT AVAILABLE (sysfs path missing)");
        return false;
    }
    let active = std::fs::read_to_string(path).unwrap_or_default();
    let active = active.trim();
    if active.is_empty() {
        println!("  sched_ext             AVAILABLE (NO SCHEDULER LOADED)");
        false
    } else {
        println!("  sched_ext             ACTIVE ({})", active);
        true
    }
}

// -1 DISABLES THROTTLING. ANYTHING ELSE CAPS FIFO CHILDREN PER PERIOD.
fn report_rt_throttling() {
    match std::fs::read_to_string(RT_RUNTIME_PATH) {
        Ok(raw) => match raw.trim() {
            "-1" => println!("  RT THROTTLING         DISABLED"),
            v => println!("  RT THROTTLING         {} us/period (FIFO CHILDREN MAY BE THROTTLED)", v),
        },
        Err(_) => println!("  RT THROTTLING         UNKNOWN ({} UNREADABLE)", RT_RUNTIME_PATH),
    }
}

fn check_cpus(args: &PlacementArgs) -> Result<bool> {
    let online = placement::online_cpus()?;
    println!("  ONLINE CPUS           {}", online);
    let mut ok = true;

    if let Some(children) = args.child_set()? {
        if children.is_subset_of(&online) {
            println!("  CHILD CPUS            {} OK", children);
        } else {
            println!("  CHILD CPUS            {} NOT ALL ONLINE", children);
            ok = false;
        }
        if let Some(cpu) = args.main_cpu {
            if children.contains(cpu) {
                println!("  MAIN CPU              {} OVERLAPS CHILD CPUS", cpu);
                ok = false;
            }
        }
    }
    if let Some(cpu) = args.main_cpu {
        if online.contains(cpu) {
            println!("  MAIN CPU              {} OK", cpu);
        } else {
            println!("  MAIN CPU              {} OFFLINE", cpu);
            ok = false;
        }
    }
    Ok(ok)
}

pub fn run_check(args: CheckArgs) -> Result<()> {
    println!("LOADGEN ENVIRONMENT CHECK");
    println!();

    let mut ok = true;

    println!("PAYLOAD:");
    let wrapper = args.placement.wrapper.iter().map(|w| ("wrapper", w));
    for (what, path) in std::iter::once(("payload", &args.payload)).chain(wrapper) {
        if is_executable(path) {
            println!("  {:<22}OK ({})", what, path.display());
        } else {
            println!("  {:<22}MISSING OR NOT EXECUTABLE ({})", what, path.display());
            ok = false;
        }
    }
    println!();

    println!("CPUS:");
    if !check_cpus(&args.placement)? {
        ok = false;
    }
    println!();

    if let Some(dir) = &args.placement.cgroup {
        println!("CGROUP:");
        let procs = placement::cgroup_procs_path(dir);
        match OpenOptions::new().write(true).open(&procs) {
            Ok(_) => println!("  cgroup.procs          WRITABLE ({})", procs.display()),
            Err(e) => {
                println!("  cgroup.procs          NOT WRITABLE ({}: {})", procs.display(), e);
                ok = false;
            }
        }
        println!();
    }

    match args.placement.class() {
        SchedClass::Ext => {
            println!("SCHED_EXT:");
            if !check_kernel_config() {
                ok = false;
            }
            if !check_sched_ext_active() {
                ok = false;
            }
            println!();
        }
        SchedClass::Fifo(prio) => {
            println!("SCHED_FIFO (PRIORITY {}):", prio);
            if unsafe { libc::geteuid() } == 0 {
                println!("  PRIVILEGES            ROOT");
            } else {
                println!("  PRIVILEGES            NOT ROOT -- FIFO CHILDREN WILL FAIL TO SPAWN");
                ok = false;
            }
            report_rt_throttling();
            println!();
        }
        SchedClass::Normal => {}
    }

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        std::process::exit(1);
    }

    Ok(())
}
