// LOADGEN ACTIVE-TASK TABLE
// LIVE CHILD PID -> LAUNCH METADATA. THE SINGLE SOURCE OF TRUTH BETWEEN
// SPAWN AND REAP.
//
// LAUNCHER WORKERS INSERT, THE REAPER REMOVES. ONE MUTEX, HELD ONLY FOR THE
// MAP OPERATION ITSELF: NEVER ACROSS spawn(), NEVER ACROSS I/O.
// LOOKUP AND REMOVE ARE ONE CRITICAL SECTION (take), SO A PID REUSED BY A
// LATER SPAWN CAN NEVER MATCH THE OLD ENTRY.

use std::collections::HashMap;
use std::fs::File;
use std::sync::{Mutex, MutexGuard};

pub struct ActiveTask {
    pub sequence_index: usize,
    pub argument: String,
    pub target_ns: u64,
    pub request_ns: u64,
    pub pid: i32,
    // UNLINKED FILE HOLDING THE CHILD'S STDOUT. None WHEN OUTPUT IS NOT CAPTURED.
    pub output: Option<File>,
}

#[derive(Default)]
struct Inner {
    live: HashMap<i32, ActiveTask>,
    inserted: u64,
    removed: u64,
    peak: usize,
}

#[derive(Default)]
pub struct TaskTable {
    inner: Mutex<Inner>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    // A POISONED LOCK ONLY MEANS ANOTHER ROLE PANICKED MID-OPERATION. THE MAP
    // ITSELF IS NEVER LEFT HALF-UPDATED, SO KEEP GOING.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // REGISTER A FRESHLY SPAWNED CHILD. RETURNS THE DISPLACED ENTRY IF THE PID
    // WAS ALREADY PRESENT (A STALE ENTRY: SHOULD NEVER HAPPEN).
    pub fn insert(&self, task: ActiveTask) -> Option<ActiveTask> {
        let mut inner = self.lock();
        inner.inserted += 1;
        let stale = inner.live.insert(task.pid, task);
        inner.peak = inner.peak.max(inner.live.len());
        stale
    }

    // ATOMIC LOOKUP + REMOVE
    pub fn take(&self, pid: i32) -> Option<ActiveTask> {
        let mut inner = self.lock();
        let task = inner.live.remove(&pid);
        if task.is_some() {
            inner.removed += 1;
        }
        task
    }

    // SNAPSHOT OF THE REGISTERED PIDS
    pub fn pids(&self) -> Vec<i32> {
        self.lock().live.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // (INSERTED, REMOVED, PEAK LIVE)
    pub fn counters(&self) -> (u64, u64, usize) {
        let inner = self.lock();
        (inner.inserted, inner.removed, inner.peak)
    }
}
