// LOADGEN REAPER
// THE SINGLE POINT OF TRUTH FOR "A LAUNCHED PROCESS HAS FINISHED".
//
// PEEKS AT ANY EXITED CHILD WITH waitid(P_ALL, WNOWAIT), WHICH LEAVES IT A
// ZOMBIE. ONLY WHEN THE PID IS IN THE ACTIVE-TASK TABLE DOES THE REAPER TAKE
// THE ENTRY AND REAP THAT ONE PID WITH waitpid(pid). STAMPS return_ns, READS
// THE CAPTURED OUTPUT OUTSIDE THE LOCK AND WRITES THE RECORD INTO ITS SLOT.
// THE REAPER IS THE ONLY WRITER OF THE SLOT ARRAY AND HANDS IT BACK WHEN ITS
// THREAD ENDS.
//
// A CHILD THE TABLE DOES NOT KNOW IS NEVER REAPED HERE. IT IS EITHER NOT YET
// REGISTERED (ITS LAUNCHER IS BETWEEN spawn() AND insert), OR A FAILED SPAWN
// THAT std WAITS FOR ITSELF, OR SOMEONE ELSE'S CHILD. A ZOMBIE KEEPS ITS PID,
// SO NO REUSE CAN CONFUSE A LATER MATCH. WHILE AN UNKNOWN ZOMBIE SITS IN
// FRONT OF THE PEEK, REGISTERED PIDS ARE SWEPT WITH WNOHANG AND THE LOOP
// BACKS OFF.
//
// THE PEEK BLOCKS ONLY WHILE THE TABLE HOLDS A REGISTERED CHILD. WITH NONE,
// OR ON ECHILD ("NOTHING TO WAIT FOR", NORMAL BEFORE THE FIRST SPAWN AND
// ACROSS LONG TRACE GAPS), IT POLLS, BACKS OFF (EXPONENTIAL, CAPPED) AND
// RETRIES.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::channel::Receiver;
use log::{debug, error, warn};

use crate::clock;
use crate::error::{ReplayError, Result};
use crate::launcher::SpawnFailure;
use crate::results::{CompletionRecord, Outcome};
use crate::table::{ActiveTask, TaskTable};

pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_micros(100);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { min: DEFAULT_BACKOFF_MIN, max: DEFAULT_BACKOFF_MAX }
    }
}

enum Peeked {
    Exited(i32),
    Running,
    NoChildren,
    Interrupted,
}

// FIND SOME EXITED CHILD. THE CHILD STAYS WAITABLE. block=false RETURNS
// Running INSTEAD OF WAITING.
fn peek_any(block: bool) -> std::io::Result<Peeked> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let mut flags = libc::WEXITED | libc::WNOWAIT;
    if !block {
        flags |= libc::WNOHANG;
    }
    let rc = unsafe { libc::waitid(libc::P_ALL, 0, &mut info, flags) };
    if rc == 0 {
        return match unsafe { info.si_pid() } {
            0 => Ok(Peeked::Running),
            pid => Ok(Peeked::Exited(pid)),
        };
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ECHILD) => Ok(Peeked::NoChildren),
        Some(libc::EINTR) => Ok(Peeked::Interrupted),
        _ => Err(err),
    }
}

// RAW WAIT STATUS OF AN EXITED, UNREAPED pid WITHOUT REAPING IT. None WHEN
// THE PID IS GONE OR STILL RUNNING.
fn peek_pid(pid: i32) -> Option<i32> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(libc::P_PID, pid as libc::id_t, &mut info, libc::WEXITED | libc::WNOWAIT | libc::WNOHANG)
    };
    if rc != 0 || unsafe { info.si_pid() } != pid {
        return None;
    }
    Some(unsafe { info.si_status() })
}

// REAP ONE REGISTERED pid. block=false RETURNS None WHILE IT IS STILL RUNNING.
fn reap_pid(pid: i32, block: bool) -> std::io::Result<Option<i32>> {
    let flags = if block { 0 } else { libc::WNOHANG };
    loop {
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(pid, &mut status, flags) };
        if rc == pid {
            return Ok(Some(status));
        }
        if rc == 0 {
            return Ok(None);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

pub fn decode_status(status: i32) -> Outcome {
    let st = ExitStatus::from_raw(status);
    match (st.code(), st.signal()) {
        (Some(code), _) => Outcome::Exited(code),
        (None, Some(sig)) => Outcome::Signaled(sig),
        (None, None) => Outcome::Exited(-1),
    }
}

#[derive(Default)]
pub struct ReaperReport {
    pub slots: Vec<Option<CompletionRecord>>,
    pub reaped: usize,
    pub spawn_failures: usize,
    // EXITED CHILDREN NO LAUNCHER REGISTERED, STILL UNREAPED AT THE END (PID, si_status)
    pub unexpected: Vec<(i32, i32)>,
    pub backoffs: u64,
    // RECORDS COMPLETED BY THE WNOHANG SWEEP RATHER THAN THE PEEK
    pub swept: usize,
}

pub struct Reaper<'a> {
    table: &'a TaskTable,
    failures: Receiver<SpawnFailure>,
    // HOW MANY RECORDS TO COLLECT. STARTS AT THE TRACE LENGTH; THE
    // ORCHESTRATOR LOWERS IT TO THE NUMBER OF REQUESTS THE LAUNCHERS ACTUALLY
    // CONSUMED ONCE THE POOL HAS STOPPED.
    expected: &'a AtomicUsize,
    total: usize,
    backoff: Backoff,
}

impl<'a> Reaper<'a> {
    pub fn new(
        table: &'a TaskTable,
        failures: Receiver<SpawnFailure>,
        expected: &'a AtomicUsize,
        total: usize,
        backoff: Backoff,
    ) -> Self {
        Self { table, failures, expected, total, backoff }
    }

    pub fn run(self) -> Result<ReaperReport> {
        let mut report = ReaperReport {
            slots: (0..self.total).map(|_| None).collect(),
            ..Default::default()
        };
        let mut unknown: HashSet<i32> = HashSet::new();
        let mut delay = self.backoff.min;
        let mut done = 0usize;

        loop {
            for failure in self.failures.try_iter() {
                report.spawn_failures += 1;
                done += store(&mut report.slots, spawn_failed_record(failure));
            }

            if done >= self.expected.load(Ordering::Acquire) {
                break;
            }

            // BLOCK ONLY WHILE A REGISTERED CHILD IS LIVE. ITS EXIT IS THE WAKEUP.
            // OTHERWISE A PENDING SPAWN FAILURE COULD WAIT ON A STRANGER.
            match peek_any(!self.table.is_empty()) {
                Ok(Peeked::Exited(pid)) => {
                    let return_ns = clock::now_ns();
                    match self.table.take(pid) {
                        Some(task) => {
                            let status = reap_pid(pid, true)
                                .map_err(ReplayError::Wait)?
                                .unwrap_or_default();
                            unknown.remove(&pid);
                            delay = self.backoff.min;
                            report.reaped += 1;
                            done += store(&mut report.slots, complete(task, status, return_ns));
                        }
                        None => {
                            if unknown.insert(pid) {
                                debug!("reaper: pid {} exited unregistered, leaving it", pid);
                            }
                            let swept = self.sweep(&mut report.slots);
                            report.swept += swept.0;
                            report.reaped += swept.0;
                            done += swept.1;
                            if swept.0 == 0 {
                                report.backoffs += 1;
                                std::thread::sleep(delay);
                                delay = (delay * 2).min(self.backoff.max);
                            }
                        }
                    }
                }
                Ok(Peeked::NoChildren) | Ok(Peeked::Running) => {
                    report.backoffs += 1;
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(self.backoff.max);
                }
                Ok(Peeked::Interrupted) => continue,
                Err(e) => return Err(ReplayError::Wait(e)),
            }
        }

        // ONLY ZOMBIES NOBODY ELSE COLLECTED ARE WORTH REPORTING. THEY ARE
        // LEFT FOR THEIR OWNER.
        let mut leftover: Vec<i32> = unknown.into_iter().collect();
        leftover.sort_unstable();
        for pid in leftover {
            if let Some(status) = peek_pid(pid) {
                warn!("{}", ReplayError::Reaper { pid, status });
                report.unexpected.push((pid, status));
            }
        }
        debug!(
            "reaper: {} reaped ({} swept), {} spawn failures, {} backoffs",
            report.reaped, report.swept, report.spawn_failures, report.backoffs
        );
        Ok(report)
    }

    // REAP EVERY REGISTERED CHILD THAT HAS ALREADY EXITED. RETURNS
    // (CHILDREN REAPED, SLOTS FILLED).
    fn sweep(&self, slots: &mut [Option<CompletionRecord>]) -> (usize, usize) {
        let mut reaped = 0;
        let mut filled = 0;
        for pid in self.table.pids() {
            let status = match reap_pid(pid, false) {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    error!("reaper: sweep of pid {} failed: {}", pid, e);
                    continue;
                }
            };
            let return_ns = clock::now_ns();
            if let Some(task) = self.table.take(pid) {
                reaped += 1;
                filled += store(slots, complete(task, status, return_ns));
            }
        }
        (reaped, filled)
    }
}

// RETURNS HOW MANY NEW SLOTS WERE FILLED (0 OR 1)
fn store(slots: &mut [Option<CompletionRecord>], record: CompletionRecord) -> usize {
    let index = record.sequence_index;
    match slots.get_mut(index) {
        Some(slot @ None) => {
            *slot = Some(record);
            1
        }
        Some(Some(_)) => {
            error!("reaper: second completion for item {} dropped", index);
            0
        }
        None => {
            error!("reaper: completion for out-of-range item {} dropped", index);
            0
        }
    }
}

fn complete(task: ActiveTask, status: i32, return_ns: u64) -> CompletionRecord {
    let outcome = decode_status(status);
    if !outcome.is_success() {
        warn!(
            "item {} ({}) pid {} finished with {:?}",
            task.sequence_index, task.argument, task.pid, outcome
        );
    }
    let stdout = match task.output {
        Some(mut file) => read_capture(&mut file).unwrap_or_else(|e| {
            warn!("item {}: reading captured output failed: {}", task.sequence_index, e);
            String::new()
        }),
        None => String::new(),
    };
    CompletionRecord {
        sequence_index: task.sequence_index,
        argument: task.argument,
        pid: Some(task.pid),
        target_ns: task.target_ns,
        request_ns: task.request_ns,
        return_ns,
        outcome,
        stdout,
    }
}

fn read_capture(file: &mut std::fs::File) -> std::io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn spawn_failed_record(failure: SpawnFailure) -> CompletionRecord {
    CompletionRecord {
        sequence_index: failure.sequence_index,
        argument: failure.argument,
        pid: None,
        target_ns: failure.target_ns,
        request_ns: failure.request_ns,
        return_ns: failure.failed_ns,
        outcome: Outcome::SpawnFailed(failure.error.to_string()),
        stdout: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_exit_and_signal() {
        // WAIT STATUS ENCODING: EXIT CODE IN BITS 8..16, SIGNAL IN THE LOW 7 BITS
        assert_eq!(decode_status(0), Outcome::Exited(0));
        assert_eq!(decode_status(3 << 8), Outcome::Exited(3));
        assert_eq!(decode_status(libc::SIGKILL), Outcome::Signaled(libc::SIGKILL));
    }

    #[test]
    fn store_rejects_second_write() {
        let mut slots: Vec<Option<CompletionRecord>> = vec![None, None];
        let rec = CompletionRecord {
            sequence_index: 1,
            argument: "B".into(),
            pid: Some(9),
            target_ns: 0,
            request_ns: 0,
            return_ns: 0,
            outcome: Outcome::Exited(0),
            stdout: String::new(),
        };
        assert_eq!(store(&mut slots, rec.clone()), 1);
        assert_eq!(store(&mut slots, rec.clone()), 0);
        let mut out_of_range = rec;
        out_of_range.sequence_index = 5;
        assert_eq!(store(&mut slots, out_of_range), 0);
        assert!(slots[0].is_none());
    }

    #[test]
    fn spawn_failure_becomes_placeholder() {
        let failure = SpawnFailure {
            sequence_index: 0,
            argument: "A".into(),
            target_ns: 10,
            request_ns: 20,
            failed_ns: 30,
            error: ReplayError::ProcessSpawn {
                index: 0,
                argument: "A".into(),
                source: std::io::Error::from_raw_os_error(libc::ENOENT),
            },
        };
        let rec = spawn_failed_record(failure);
        assert_eq!(rec.pid, None);
        assert_eq!(rec.duration_ns(), 10);
        assert!(matches!(rec.outcome, Outcome::SpawnFailed(_)));
    }

    #[test]
    fn reap_pid_of_stranger_is_error() {
        // PID 1 IS NEVER OUR CHILD
        assert!(reap_pid(1, false).is_err());
        assert_eq!(peek_pid(1), None);
    }

    #[test]
    fn zero_expected_returns_immediately() {
        let table = TaskTable::new();
        let (_tx, rx) = crossbeam::channel::unbounded();
        let expected = AtomicUsize::new(0);
        let report = Reaper::new(&table, rx, &expected, 0, Backoff::default()).run().unwrap();
        assert_eq!(report.reaped, 0);
        assert!(report.slots.is_empty());
    }

    #[test]
    fn collects_spawn_failures_without_children() {
        let table = TaskTable::new();
        let (tx, rx) = crossbeam::channel::unbounded();
        for i in 0..3 {
            tx.send(SpawnFailure {
                sequence_index: i,
                argument: format!("{}", i),
                target_ns: 0,
                request_ns: 0,
                failed_ns: 0,
                error: ReplayError::ProcessSpawn {
                    index: i,
                    argument: format!("{}", i),
                    source: std::io::Error::from_raw_os_error(libc::EACCES),
                },
            })
            .unwrap();
        }
        let expected = AtomicUsize::new(3);
        let report = Reaper::new(&table, rx, &expected, 3, Backoff::default()).run().unwrap();
        assert_eq!(report.spawn_failures, 3);
        assert!(report.slots.iter().all(Option::is_some));
    }
}
