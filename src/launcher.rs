// LOADGEN LAUNCHER POOL
// A SMALL FIXED SET OF WORKERS THAT PAY THE fork/exec COST OFF THE PACER'S
// CRITICAL PATH.
//
// EACH WORKER: DEQUEUE (BOUNDED WAIT) -> STAMP request_ns -> SPAWN WITH
// PLACEMENT -> REGISTER IN THE ACTIVE-TASK TABLE -> LOOP. NEVER WAITS FOR A
// CHILD TO EXIT. A FAILED SPAWN IS HANDED TO THE REAPER AS A PLACEHOLDER SO
// THE COMPLETION COUNT STAYS EXACT.
//
// POOL SIZE IS A BOUNDED-CONCURRENCY KNOB: TOO FEW WORKERS BACKS UP THE
// QUEUE (DISPATCH JITTER), TOO MANY CONTEND ON THE SPAWN PATH AND PERTURB
// THE MEASUREMENT THEMSELVES.

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{Scope, ScopedJoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};

use crate::clock;
use crate::error::{ReplayError, Result};
use crate::pacer::{Dispatch, DispatchRequest};
use crate::placement::{Placement, PreparedPlacement};
use crate::table::{ActiveTask, TaskTable};

// WHAT TO RUN FOR EACH ITEM
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub payload: PathBuf,
    // OPTIONAL EXPERIMENTAL-SCHEDULER WRAPPER: RUNS AS `wrapper payload argument`
    pub wrapper: Option<PathBuf>,
    // CAPTURE EACH CHILD'S STDOUT FOR THE COMPLETION RECORD
    pub capture_output: bool,
    pub placement: Placement,
}

impl LaunchSpec {
    pub fn new(payload: impl Into<PathBuf>) -> Self {
        Self {
            payload: payload.into(),
            wrapper: None,
            capture_output: true,
            placement: Placement::default(),
        }
    }
}

// A LAUNCH THAT NEVER PRODUCED A PROCESS
pub struct SpawnFailure {
    pub sequence_index: usize,
    pub argument: String,
    pub target_ns: u64,
    pub request_ns: u64,
    pub failed_ns: u64,
    pub error: ReplayError,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub launched: u64,
    pub failed: u64,
    pub spawn_ns_total: u64,
    pub spawn_ns_max: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.launched += other.launched;
        self.failed += other.failed;
        self.spawn_ns_total += other.spawn_ns_total;
        self.spawn_ns_max = self.spawn_ns_max.max(other.spawn_ns_max);
    }

    pub fn mean_spawn_ns(&self) -> u64 {
        let n = self.launched + self.failed;
        if n == 0 { 0 } else { self.spawn_ns_total / n }
    }
}

// SPEC + EVERYTHING OPENED ONCE FOR THE RUN (cgroup.procs FD)
pub struct Launcher {
    spec: LaunchSpec,
    placement: PreparedPlacement,
}

impl Launcher {
    pub fn new(spec: LaunchSpec) -> Result<Self> {
        let placement = spec.placement.prepare()?;
        Ok(Self { spec, placement })
    }

    fn command(&self, argument: &str) -> Command {
        let mut cmd = match &self.spec.wrapper {
            Some(wrapper) => {
                let mut c = Command::new(wrapper);
                c.arg(&self.spec.payload);
                c
            }
            None => Command::new(&self.spec.payload),
        };
        cmd.arg(argument).stdin(Stdio::null());
        self.placement.apply_to(&mut cmd);
        cmd
    }

    /// Spawn the child for one request without waiting for it.
    ///
    /// Returns the table entry to register. `request_ns` is stamped before
    /// any spawn work starts.
    pub fn launch(&self, req: DispatchRequest) -> std::result::Result<ActiveTask, SpawnFailure> {
        let request_ns = clock::now_ns();
        let fail = |req: DispatchRequest, source: io::Error| SpawnFailure {
            sequence_index: req.sequence_index,
            target_ns: req.target_ns,
            request_ns,
            failed_ns: clock::now_ns(),
            error: ReplayError::ProcessSpawn {
                index: req.sequence_index,
                argument: req.argument.clone(),
                source,
            },
            argument: req.argument,
        };

        let mut cmd = self.command(&req.argument);
        let output = if self.spec.capture_output {
            let capture = match capture_file().and_then(|f| Ok((f.try_clone()?, f))) {
                Ok(pair) => pair,
                Err(e) => return Err(fail(req, e)),
            };
            cmd.stdout(Stdio::from(capture.0));
            Some(capture.1)
        } else {
            cmd.stdout(Stdio::null());
            None
        };

        match cmd.spawn() {
            // DROPPING Child NEITHER WAITS NOR KILLS. THE REAPER OWNS THE EXIT.
            Ok(child) => Ok(ActiveTask {
                sequence_index: req.sequence_index,
                argument: req.argument,
                target_ns: req.target_ns,
                request_ns,
                pid: child.id() as i32,
                output,
            }),
            Err(e) => Err(fail(req, e)),
        }
    }
}

fn panicked(req: DispatchRequest, request_ns: u64) -> SpawnFailure {
    SpawnFailure {
        sequence_index: req.sequence_index,
        target_ns: req.target_ns,
        request_ns,
        failed_ns: clock::now_ns(),
        error: ReplayError::ProcessSpawn {
            index: req.sequence_index,
            argument: req.argument.clone(),
            source: io::Error::other("launcher panicked during spawn"),
        },
        argument: req.argument,
    }
}

// ANONYMOUS IN-MEMORY FILE. UNLIKE A PIPE IT NEVER FILLS UP AND BLOCKS THE
// CHILD, AND IT OUTLIVES THE CHILD FOR THE REAPER TO READ.
fn capture_file() -> io::Result<File> {
    let name = b"loadgen-out\0";
    let fd = unsafe { libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

// ---------------------------------------------------------------------------
// POOL
// ---------------------------------------------------------------------------

pub struct LauncherPool<'a> {
    launcher: &'a Launcher,
    table: &'a TaskTable,
    failures: Sender<SpawnFailure>,
    poll: Duration,
    abort: &'a AtomicBool,
}

impl<'a> LauncherPool<'a> {
    pub fn new(
        launcher: &'a Launcher,
        table: &'a TaskTable,
        failures: Sender<SpawnFailure>,
        poll: Duration,
        abort: &'a AtomicBool,
    ) -> Self {
        Self { launcher, table, failures, poll, abort }
    }

    /// Start `size` workers on `scope`, each draining `queue` until it
    /// receives its shutdown sentinel.
    pub fn start<'scope>(
        &'scope self,
        scope: &'scope Scope<'scope, '_>,
        size: usize,
        queue: &Receiver<Dispatch>,
    ) -> Result<Vec<ScopedJoinHandle<'scope, WorkerStats>>> {
        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let rx = queue.clone();
            let handle = std::thread::Builder::new()
                .name(format!("launcher-{}", id))
                .spawn_scoped(scope, move || self.work_loop(id, rx))
                .map_err(|e| ReplayError::setup(format!("start launcher thread {}", id), e))?;
            handles.push(handle);
        }
        Ok(handles)
    }

    fn work_loop(&self, id: usize, rx: Receiver<Dispatch>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        loop {
            let req = match rx.recv_timeout(self.poll) {
                Ok(Dispatch::Launch(req)) => req,
                Ok(Dispatch::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if self.abort.load(Ordering::Relaxed) {
                        debug!("launcher-{}: abort observed while idle", id);
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.handle(id, req, &mut stats);
        }
        debug!(
            "launcher-{}: exiting after {} launches, {} failures, mean spawn {} us",
            id, stats.launched, stats.failed, stats.mean_spawn_ns() / 1_000
        );
        stats
    }

    fn handle(&self, id: usize, req: DispatchRequest, stats: &mut WorkerStats) {
        let t0 = clock::now_ns();
        // A PANIC INSIDE spawn() STILL ACCOUNTS FOR ITS ITEM AS A FAILED SPAWN
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.launcher.launch(req.clone())))
            .unwrap_or_else(|_| Err(panicked(req, t0)));
        let spawn_ns = clock::now_ns() - t0;
        stats.spawn_ns_total += spawn_ns;
        stats.spawn_ns_max = stats.spawn_ns_max.max(spawn_ns);

        match result {
            Ok(task) => {
                stats.launched += 1;
                let pid = task.pid;
                if let Some(stale) = self.table.insert(task) {
                    error!(
                        "launcher-{}: pid {} still registered to item {} -- stale entry replaced",
                        id, pid, stale.sequence_index
                    );
                }
            }
            Err(failure) => {
                stats.failed += 1;
                warn!("launcher-{}: {}", id, failure.error);
                // THE REAPER OUTLIVES EVERY WORKER, SO THIS ONLY FAILS IF IT PANICKED
                if self.failures.send(failure).is_err() {
                    error!("launcher-{}: reaper gone, spawn failure dropped", id);
                }
            }
        }
    }
}
