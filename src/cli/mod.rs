pub mod calibrate;
pub mod check;
pub mod probe;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;

use loadgen::placement::{CpuSet, Placement, SchedClass};

// WHERE AND HOW EACH CHILD RUNS. SHARED BY `run` AND `check`.
#[derive(Args, Debug, Clone)]
pub struct PlacementArgs {
    // CPUS THE CHILDREN MAY RUN ON ("1-23", "1,3,5", "0-3,8")
    #[arg(long)]
    pub child_cpus: Option<String>,

    // CPU RESERVED FOR THE PACER AND REAPER
    #[arg(long)]
    pub main_cpu: Option<usize>,

    // NICENESS FOR EVERY CHILD (-20..=19)
    #[arg(long, allow_hyphen_values = true)]
    pub nice: Option<i32>,

    // RUN CHILDREN UNDER SCHED_FIFO AT THIS PRIORITY (REQUIRES ROOT)
    #[arg(long, conflicts_with = "sched_ext")]
    pub fifo: Option<u8>,

    // RUN CHILDREN UNDER SCHED_EXT (REQUIRES A LOADED BPF SCHEDULER)
    #[arg(long)]
    pub sched_ext: bool,

    // CGROUP DIRECTORY EACH CHILD JOINS BEFORE exec
    #[arg(long)]
    pub cgroup: Option<PathBuf>,

    // EXPERIMENTAL-SCHEDULER WRAPPER, RUN AS `<wrapper> <payload> <argument>`
    #[arg(long)]
    pub wrapper: Option<PathBuf>,
}

impl PlacementArgs {
    pub fn child_set(&self) -> Result<Option<CpuSet>> {
        match &self.child_cpus {
            Some(raw) => Ok(Some(CpuSet::parse(raw)?)),
            None => Ok(None),
        }
    }

    pub fn class(&self) -> SchedClass {
        match (self.fifo, self.sched_ext) {
            (Some(prio), _) => SchedClass::Fifo(prio),
            (None, true) => SchedClass::Ext,
            (None, false) => SchedClass::Normal,
        }
    }

    pub fn placement(&self) -> Result<Placement> {
        let placement = Placement {
            affinity: self.child_set()?,
            niceness: self.nice,
            class: self.class(),
            cgroup: self.cgroup.clone(),
        };
        if let Err(e) = placement.validate() {
            bail!("INVALID PLACEMENT: {}", e);
        }
        Ok(placement)
    }
}
