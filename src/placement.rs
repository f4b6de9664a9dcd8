// LOADGEN PLACEMENT POLICY
// WHERE AND HOW EACH CHILD RUNS: CPU SET, NICENESS, SCHEDULING CLASS, CGROUP.
//
// POLICY IS INJECTED AT SPAWN TIME, NOT PART OF THE DISPATCH ALGORITHM.
// EVERYTHING THAT CAN FAIL FOR THE WHOLE RUN (OPENING cgroup.procs) HAPPENS
// ONCE IN prepare(). THE PER-CHILD HOOK ONLY ISSUES RAW SYSCALLS BETWEEN
// fork AND exec: NO ALLOCATION, NO LOCKS.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{ReplayError, Result};

// NOT EXPORTED BY EVERY libc VERSION (sched_ext, LINUX 6.12+)
pub const SCHED_EXT: libc::c_int = 7;

pub const ONLINE_CPUS_PATH: &str = "/sys/devices/system/cpu/online";

// ---------------------------------------------------------------------------
// CPU LISTS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CpuSet {
    cpus: Vec<usize>,
}

impl CpuSet {
    pub fn single(cpu: usize) -> Self {
        Self { cpus: vec![cpu] }
    }

    pub fn from_cpus(mut cpus: Vec<usize>) -> Self {
        cpus.sort_unstable();
        cpus.dedup();
        Self { cpus }
    }

    // KERNEL LIST SYNTAX: "1-23", "1,3,5", "0-3,8"
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ReplayError::Config("empty cpu list".to_string()));
        }
        let mut cpus = Vec::new();
        for range in raw.split(',') {
            let parts: Vec<&str> = range.trim().split('-').collect();
            let bad = || ReplayError::Config(format!("bad cpu range {:?} in {:?}", range, raw));
            match parts.len() {
                1 => cpus.push(parts[0].parse::<usize>().map_err(|_| bad())?),
                2 => {
                    let lo = parts[0].parse::<usize>().map_err(|_| bad())?;
                    let hi = parts[1].parse::<usize>().map_err(|_| bad())?;
                    if lo > hi {
                        return Err(bad());
                    }
                    cpus.extend(lo..=hi);
                }
                _ => return Err(bad()),
            }
        }
        let set = Self::from_cpus(cpus);
        if let Some(&max) = set.cpus.last() {
            if max >= libc::CPU_SETSIZE as usize {
                return Err(ReplayError::Config(format!(
                    "cpu {} exceeds CPU_SETSIZE {}", max, libc::CPU_SETSIZE
                )));
            }
        }
        Ok(set)
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.binary_search(&cpu).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.cpus.iter().all(|&c| other.contains(c))
    }

    pub fn to_raw(&self) -> libc::cpu_set_t {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for &cpu in &self.cpus {
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
        set
    }

    pub fn from_raw(set: &libc::cpu_set_t) -> Self {
        let cpus = (0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, set) })
            .collect();
        Self { cpus }
    }
}

// PRINTS BACK IN KERNEL LIST SYNTAX, COLLAPSING RUNS
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut i = 0;
        while i < self.cpus.len() {
            let lo = self.cpus[i];
            let mut hi = lo;
            while i + 1 < self.cpus.len() && self.cpus[i + 1] == hi + 1 {
                i += 1;
                hi = self.cpus[i];
            }
            if !first {
                write!(f, ",")?;
            }
            if lo == hi {
                write!(f, "{}", lo)?;
            } else {
                write!(f, "{}-{}", lo, hi)?;
            }
            first = false;
            i += 1;
        }
        Ok(())
    }
}

pub fn online_cpus() -> Result<CpuSet> {
    let raw = std::fs::read_to_string(ONLINE_CPUS_PATH)
        .map_err(|e| ReplayError::io(ONLINE_CPUS_PATH, e))?;
    CpuSet::parse(&raw)
}

// AFFINITY OF THE CALLING THREAD
pub fn current_affinity() -> Result<CpuSet> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set)
    };
    if ret != 0 {
        return Err(ReplayError::setup("sched_getaffinity", io::Error::last_os_error()));
    }
    Ok(CpuSet::from_raw(&set))
}

// PIN THE CALLING THREAD. THREADS SPAWNED AFTERWARDS INHERIT THE MASK, SO
// CALLING THIS BEFORE THE RUN STARTS PINS PACER, LAUNCHERS AND REAPER.
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    let set = CpuSet::single(cpu).to_raw();
    let ret = unsafe {
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        return Err(ReplayError::setup(
            format!("pin replay process to cpu {}", cpu),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SCHEDULING CLASS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedClass {
    #[default]
    Normal,
    // SCHED_FIFO AT THE GIVEN PRIORITY (1..=99)
    Fifo(u8),
    // SCHED_EXT: HAND THE CHILD TO THE LOADED BPF SCHEDULER
    Ext,
}

impl SchedClass {
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Fifo(_) => "FIFO",
            Self::Ext => "EXT",
        }
    }

    fn policy_and_priority(self) -> Option<(libc::c_int, libc::c_int)> {
        match self {
            Self::Normal => None,
            Self::Fifo(prio) => Some((libc::SCHED_FIFO, prio as libc::c_int)),
            Self::Ext => Some((SCHED_EXT, 0)),
        }
    }
}

// ---------------------------------------------------------------------------
// PLACEMENT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub affinity: Option<CpuSet>,
    pub niceness: Option<i32>,
    pub class: SchedClass,
    pub cgroup: Option<PathBuf>,
}

impl Placement {
    pub fn validate(&self) -> Result<()> {
        if let Some(set) = &self.affinity {
            if set.is_empty() {
                return Err(ReplayError::Config("child cpu set is empty".to_string()));
            }
        }
        if let Some(nice) = self.niceness {
            if !(-20..=19).contains(&nice) {
                return Err(ReplayError::Config(format!("niceness {} outside -20..=19", nice)));
            }
        }
        if let SchedClass::Fifo(prio) = self.class {
            if !(1..=99).contains(&prio) {
                return Err(ReplayError::Config(format!("fifo priority {} outside 1..=99", prio)));
            }
        }
        Ok(())
    }

    // OPEN EVERYTHING THE CHILD HOOK NEEDS. FAILURE HERE INVALIDATES THE
    // EXPERIMENT'S ISOLATION AND ABORTS BEFORE THE FIRST LAUNCH.
    pub fn prepare(&self) -> Result<PreparedPlacement> {
        self.validate()?;
        let cgroup = match &self.cgroup {
            Some(dir) => Some(open_cgroup_procs(dir)?),
            None => None,
        };
        Ok(PreparedPlacement {
            mask: self.affinity.as_ref().map(CpuSet::to_raw),
            niceness: self.niceness,
            class: self.class,
            cgroup,
        })
    }
}

pub fn cgroup_procs_path(dir: &Path) -> PathBuf {
    dir.join("cgroup.procs")
}

fn open_cgroup_procs(dir: &Path) -> Result<File> {
    let path = cgroup_procs_path(dir);
    OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| ReplayError::setup(format!("open {}", path.display()), e))
}

pub struct PreparedPlacement {
    mask: Option<libc::cpu_set_t>,
    niceness: Option<i32>,
    class: SchedClass,
    cgroup: Option<File>,
}

impl PreparedPlacement {
    pub fn is_noop(&self) -> bool {
        self.mask.is_none()
            && self.niceness.is_none()
            && self.class == SchedClass::Normal
            && self.cgroup.is_none()
    }

    // INSTALL THE CHILD-SIDE HOOK. A FAILING SYSCALL IN THE CHILD SURFACES AS
    // THE spawn() ERROR IN THE PARENT.
    pub fn apply_to(&self, cmd: &mut Command) {
        if self.is_noop() {
            return;
        }
        let mask = self.mask;
        let niceness = self.niceness;
        let class = self.class;
        let cgroup_fd = self.cgroup.as_ref().map(|f| f.as_raw_fd());
        unsafe {
            cmd.pre_exec(move || enter_placement(mask.as_ref(), niceness, class, cgroup_fd));
        }
    }
}

// RUNS IN THE CHILD BETWEEN fork AND exec
fn enter_placement(
    mask: Option<&libc::cpu_set_t>,
    niceness: Option<i32>,
    class: SchedClass,
    cgroup_fd: Option<RawFd>,
) -> io::Result<()> {
    unsafe {
        // "0" MOVES THE WRITING PROCESS
        if let Some(fd) = cgroup_fd {
            if libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if let Some(set) = mask {
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if let Some(nice) = niceness {
            if libc::setpriority(libc::PRIO_PROCESS, 0, nice) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if let Some((policy, priority)) = class.policy_and_priority() {
            let param = libc::sched_param { sched_priority: priority };
            if libc::sched_setscheduler(0, policy, &param) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range() {
        let set = CpuSet::parse("1-23").unwrap();
        assert_eq!(set.len(), 23);
        assert!(set.contains(1));
        assert!(set.contains(23));
        assert!(!set.contains(0));
    }

    #[test]
    fn parse_mixed_list() {
        let set = CpuSet::parse("8,0-3,2").unwrap();
        assert_eq!(set.cpus(), &[0, 1, 2, 3, 8]);
        assert_eq!(set.to_string(), "0-3,8");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(CpuSet::parse("").is_err());
        assert!(CpuSet::parse("a-b").is_err());
        assert!(CpuSet::parse("5-2").is_err());
        assert!(CpuSet::parse("1-2-3").is_err());
        assert!(CpuSet::parse("100000").is_err());
    }

    #[test]
    fn raw_mask_round_trip() {
        let set = CpuSet::parse("0,2,5-6").unwrap();
        assert_eq!(CpuSet::from_raw(&set.to_raw()), set);
    }

    #[test]
    fn display_single_and_runs() {
        assert_eq!(CpuSet::single(4).to_string(), "4");
        assert_eq!(CpuSet::from_cpus(vec![1, 2, 3, 7, 9, 10]).to_string(), "1-3,7,9-10");
    }

    #[test]
    fn validate_rejects_bad_priority_and_nice() {
        let p = Placement { class: SchedClass::Fifo(0), ..Default::default() };
        assert!(p.validate().is_err());
        let p = Placement { niceness: Some(20), ..Default::default() };
        assert!(p.validate().is_err());
        let p = Placement { class: SchedClass::Fifo(99), niceness: Some(-5), ..Default::default() };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn missing_cgroup_is_setup_error() {
        let p = Placement {
            cgroup: Some(PathBuf::from("/nonexistent/loadgen/workload")),
            ..Default::default()
        };
        match p.prepare() {
            Err(ReplayError::ResourceSetup { .. }) => {}
            Err(e) => panic!("expected ResourceSetup, got {}", e),
            Ok(_) => panic!("expected ResourceSetup, got Ok"),
        }
    }

    #[test]
    fn default_placement_is_noop() {
        assert!(Placement::default().prepare().unwrap().is_noop());
    }

    #[test]
    fn current_affinity_is_not_empty() {
        assert!(!current_affinity().unwrap().is_empty());
    }
}
