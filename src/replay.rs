// LOADGEN REPLAY
// ONE RUN: PACER (CALLING THREAD) + N LAUNCHERS + ONE REAPER, ALL SCOPED TO
// THE RUN. THE ACTIVE-TASK TABLE IS OWNED HERE AND LENT TO THE LAUNCHERS AND
// THE REAPER; NOTHING OUTLIVES run().
//
// SHUTDOWN ORDER:
//   PACER EMITS ALL ITEMS -> N SENTINELS -> EACH WORKER EXITS ON ITS SENTINEL
//   -> JOIN WORKERS -> TELL THE REAPER HOW MANY REQUESTS WERE CONSUMED
//   -> REAPER RUNS UNTIL IT HAS THAT MANY RECORDS -> ASSEMBLE.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, error, info};

use crate::clock;
use crate::error::{ReplayError, Result};
use crate::launcher::{LaunchSpec, Launcher, LauncherPool, WorkerStats};
use crate::pacer::{Dispatch, Pacer, PacerReport};
use crate::placement;
use crate::reaper::{Backoff, Reaper, ReaperReport};
use crate::results::{RunResults, RunWindow};
use crate::table::TaskTable;
use crate::trace::WorkloadItem;

pub const DEFAULT_LAUNCHERS: usize = 4;
pub const DEFAULT_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_WORKER_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub launchers: usize,
    pub queue_depth: usize,
    pub guard_ns: u64,
    pub worker_poll: Duration,
    pub backoff: Backoff,
    // CORE RESERVED FOR PACER/REAPER. MUST NOT BE IN THE CHILD CPU SET.
    pub main_cpu: Option<usize>,
    pub launch: LaunchSpec,
}

impl ReplayConfig {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launchers: DEFAULT_LAUNCHERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            guard_ns: clock::DEFAULT_GUARD_NS,
            worker_poll: DEFAULT_WORKER_POLL,
            backoff: Backoff::default(),
            main_cpu: None,
            launch,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.launchers == 0 {
            return Err(ReplayError::Config("launcher pool size must be at least 1".to_string()));
        }
        if self.queue_depth == 0 {
            return Err(ReplayError::Config("launch queue depth must be at least 1".to_string()));
        }
        if self.worker_poll.is_zero() {
            return Err(ReplayError::Config("worker poll interval must be non-zero".to_string()));
        }
        if self.backoff.min.is_zero() || self.backoff.min > self.backoff.max {
            return Err(ReplayError::Config(format!(
                "reaper backoff {:?}..{:?} is not a valid range", self.backoff.min, self.backoff.max
            )));
        }
        if let (Some(cpu), Some(children)) = (self.main_cpu, &self.launch.placement.affinity) {
            if children.contains(cpu) {
                return Err(ReplayError::Config(format!(
                    "main cpu {} overlaps child cpus {}", cpu, children
                )));
            }
        }
        self.launch.placement.validate()
    }
}

// EVERYTHING A FINISHED RUN KNOWS ABOUT ITSELF
pub struct ReplayRun {
    pub results: RunResults,
    pub pacer: PacerReport,
    pub launchers: WorkerStats,
    pub reaper: ReaperStats,
    pub peak_active: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReaperStats {
    pub reaped: usize,
    pub spawn_failures: usize,
    pub swept: usize,
    pub backoffs: u64,
    pub unexpected: Vec<(i32, i32)>,
}

impl ReaperStats {
    fn from_report(report: &ReaperReport) -> Self {
        Self {
            reaped: report.reaped,
            spawn_failures: report.spawn_failures,
            swept: report.swept,
            backoffs: report.backoffs,
            unexpected: report.unexpected.clone(),
        }
    }
}

pub struct Replay {
    config: ReplayConfig,
    launcher: Launcher,
}

impl Replay {
    /// Validate the configuration and open every run-wide resource.
    ///
    /// All `ResourceSetup` and `Config` failures surface here, before a
    /// single item is dispatched.
    pub fn new(config: ReplayConfig) -> Result<Self> {
        config.validate()?;
        let launcher = Launcher::new(config.launch.clone())?;
        Ok(Self { config, launcher })
    }

    /// Replay `items` in real time. `shutdown` stops the Pacer early; the
    /// run then fails assembly with `IncompleteRun`.
    pub fn run(&self, items: &[WorkloadItem], shutdown: &AtomicBool) -> Result<ReplayRun> {
        if let Some(cpu) = self.config.main_cpu {
            placement::pin_current_thread(cpu)?;
            info!("replay pinned to cpu {}", cpu);
        }

        let n = self.config.launchers;
        let table = TaskTable::new();
        let expected = AtomicUsize::new(items.len());
        let (fail_tx, fail_rx) = crossbeam::channel::unbounded();
        let pool = LauncherPool::new(&self.launcher, &table, fail_tx, self.config.worker_poll, shutdown);
        let pacer = Pacer::new(self.config.guard_ns);

        let (mut window, pacer_report, launcher_stats, reaper_report) = std::thread::scope(|s| -> Result<_> {
            // CHANNEL LIVES INSIDE THE SCOPE: ANY EARLY RETURN DROPS THE SENDER
            // AND RELEASES THE WORKERS BEFORE THE SCOPE JOINS THEM.
            let (tx, rx) = crossbeam::channel::bounded::<Dispatch>(self.config.queue_depth);
            let workers = pool.start(s, n, &rx)?;
            drop(rx);

            let reaper = Reaper::new(&table, fail_rx, &expected, items.len(), self.config.backoff);
            let reaper_handle = match std::thread::Builder::new()
                .name("reaper".to_string())
                .spawn_scoped(s, move || reaper.run())
            {
                Ok(h) => h,
                // NOTHING DISPATCHED YET: RETURNING DROPS tx AND RELEASES THE WORKERS
                Err(e) => return Err(ReplayError::setup("start reaper thread", e)),
            };

            let window = RunWindow::open();
            let pacer_report = pacer.run(items, window.start_ns, &tx, n, shutdown);
            drop(tx);

            let mut stats = WorkerStats::default();
            for (id, handle) in workers.into_iter().enumerate() {
                match handle.join() {
                    Ok(st) => stats.merge(&st),
                    Err(_) => error!("launcher-{} panicked", id),
                }
            }
            let consumed = (stats.launched + stats.failed) as usize;
            expected.store(consumed, Ordering::Release);
            debug!("launchers done: {} requests consumed of {} emitted", consumed, pacer_report.emitted);

            let reaper_report = reaper_handle
                .join()
                .map_err(|_| ReplayError::Wait(std::io::Error::other("reaper thread panicked")))??;
            Ok((window, pacer_report, stats, reaper_report))
        })?;

        window.close();
        let reaper = ReaperStats::from_report(&reaper_report);
        let (_, _, peak_active) = table.counters();
        let results = RunResults::assemble(reaper_report.slots, window)?;

        Ok(ReplayRun {
            results,
            pacer: pacer_report,
            launchers: launcher_stats,
            reaper,
            peak_active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::CpuSet;

    #[test]
    fn defaults_validate() {
        assert!(ReplayConfig::new(LaunchSpec::new("/bin/true")).validate().is_ok());
    }

    #[test]
    fn rejects_empty_pool_and_queue() {
        let mut c = ReplayConfig::new(LaunchSpec::new("/bin/true"));
        c.launchers = 0;
        assert!(matches!(c.validate(), Err(ReplayError::Config(_))));

        let mut c = ReplayConfig::new(LaunchSpec::new("/bin/true"));
        c.queue_depth = 0;
        assert!(matches!(c.validate(), Err(ReplayError::Config(_))));
    }

    #[test]
    fn rejects_main_cpu_inside_child_set() {
        let mut c = ReplayConfig::new(LaunchSpec::new("/bin/true"));
        c.main_cpu = Some(2);
        c.launch.placement.affinity = Some(CpuSet::parse("1-3").unwrap());
        assert!(matches!(c.validate(), Err(ReplayError::Config(_))));

        c.main_cpu = Some(0);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_backoff() {
        let mut c = ReplayConfig::new(LaunchSpec::new("/bin/true"));
        c.backoff = Backoff { min: Duration::from_millis(10), max: Duration::from_millis(1) };
        assert!(c.validate().is_err());
    }
}
