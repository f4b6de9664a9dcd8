// LOADGEN RESULT ASSEMBLY
// COMPLETION RECORDS, THE RUN WINDOW, AND THE FINAL ORDER-CHECKED SEQUENCE.
//
// THE REAPER FILLS ONE SLOT PER SEQUENCE INDEX IN WHATEVER ORDER CHILDREN
// EXIT. ASSEMBLY HAPPENS ONCE, AFTER THE REAPER HAS FINISHED: EVERY SLOT
// MUST BE POPULATED OR THE RUN IS REJECTED.

use std::sync::OnceLock;

use regex::Regex;

use crate::clock;
use crate::error::{ReplayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Exited(i32),
    Signaled(i32),
    // THE PROCESS NEVER EXISTED. CARRIES THE SPAWN ERROR TEXT.
    SpawnFailed(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    // SHELL CONVENTION: 128 + SIGNAL FOR SIGNALED CHILDREN, -1 FOR NO PROCESS
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(sig) => 128 + *sig,
            Self::SpawnFailed(_) => -1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub sequence_index: usize,
    pub argument: String,
    pub pid: Option<i32>,
    pub target_ns: u64,
    pub request_ns: u64,
    pub return_ns: u64,
    pub outcome: Outcome,
    pub stdout: String,
}

impl CompletionRecord {
    pub fn duration_ns(&self) -> u64 {
        self.return_ns.saturating_sub(self.request_ns)
    }

    // HOW LATE THE LAUNCHER PICKED THE ITEM UP RELATIVE TO ITS DEADLINE
    pub fn jitter_ns(&self) -> u64 {
        self.request_ns.saturating_sub(self.target_ns)
    }

    pub fn reported_pid(&self) -> Option<i32> {
        reported_pid(&self.stdout)
    }
}

// THE PAYLOAD PRINTS "pid: <N> ..." ON STDOUT
pub fn reported_pid(stdout: &str) -> Option<i32> {
    static PID_RE: OnceLock<Regex> = OnceLock::new();
    let re = PID_RE.get_or_init(|| Regex::new(r"pid:\s*(\d+)").expect("static pid pattern"));
    re.captures(stdout)?.get(1)?.as_str().parse().ok()
}

// ---------------------------------------------------------------------------
// RUN WINDOW
// ---------------------------------------------------------------------------

// MONOTONIC BOUNDS FOR THE ENGINE, EPOCH BOUNDS FOR THE EXTERNAL CPU SAMPLER
// (IT TRIMS ITS OWN PER-CORE SERIES TO [start_epoch, end_epoch]).
#[derive(Debug, Clone, Copy, Default)]
pub struct RunWindow {
    pub start_ns: u64,
    pub end_ns: u64,
    pub start_epoch: f64,
    pub end_epoch: f64,
}

impl RunWindow {
    pub fn open() -> Self {
        let start_ns = clock::now_ns();
        let start_epoch = clock::epoch_secs();
        Self { start_ns, end_ns: start_ns, start_epoch, end_epoch: start_epoch }
    }

    pub fn close(&mut self) {
        self.end_ns = clock::now_ns();
        self.end_epoch = clock::epoch_secs();
    }

    pub fn elapsed_secs(&self) -> f64 {
        clock::ns_to_secs(self.end_ns.saturating_sub(self.start_ns))
    }

    // SECONDS SINCE RUN START FOR A MONOTONIC TIMESTAMP
    pub fn offset_secs(&self, ts_ns: u64) -> f64 {
        clock::ns_to_secs(ts_ns.saturating_sub(self.start_ns))
    }
}

// ---------------------------------------------------------------------------
// ASSEMBLY
// ---------------------------------------------------------------------------

pub struct RunResults {
    records: Vec<CompletionRecord>,
    window: RunWindow,
}

impl RunResults {
    /// Collate the reaper's slots into the final ordered sequence.
    ///
    /// Fails with `IncompleteRun` listing every unfilled index.
    pub fn assemble(slots: Vec<Option<CompletionRecord>>, window: RunWindow) -> Result<Self> {
        let total = slots.len();
        let missing: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();
        if !missing.is_empty() {
            return Err(ReplayError::IncompleteRun { missing, total });
        }

        let records: Vec<CompletionRecord> = slots.into_iter().flatten().collect();
        // A SLOT HOLDING SOMEONE ELSE'S RECORD LEAVES ITS OWN INDEX UNACCOUNTED
        let misplaced: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(i, r)| r.sequence_index != *i)
            .map(|(i, _)| i)
            .collect();
        if !misplaced.is_empty() {
            return Err(ReplayError::IncompleteRun { missing: misplaced, total });
        }
        Ok(Self { records, window })
    }

    pub fn records(&self) -> &[CompletionRecord] {
        &self.records
    }

    pub fn window(&self) -> &RunWindow {
        &self.window
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn summary(&self) -> RunSummary {
        let mut s = RunSummary {
            items: self.records.len(),
            elapsed_secs: self.window.elapsed_secs(),
            start_epoch: self.window.start_epoch,
            end_epoch: self.window.end_epoch,
            ..Default::default()
        };

        let mut jitter_us: Vec<f64> = Vec::with_capacity(self.records.len());
        for r in &self.records {
            match &r.outcome {
                Outcome::Exited(0) => s.clean += 1,
                Outcome::Exited(_) => s.nonzero += 1,
                Outcome::Signaled(_) => s.signaled += 1,
                Outcome::SpawnFailed(_) => {
                    s.spawn_failed += 1;
                    continue;
                }
            }
            jitter_us.push(r.jitter_ns() as f64 / 1_000.0);
            if let (Some(pid), Some(reported)) = (r.pid, r.reported_pid()) {
                if pid != reported {
                    s.pid_mismatches += 1;
                }
            }
        }

        jitter_us.sort_by(|a, b| a.total_cmp(b));
        s.jitter_median_us = percentile(&jitter_us, 50.0);
        s.jitter_p99_us = percentile(&jitter_us, 99.0);
        s.jitter_worst_us = jitter_us.last().copied().unwrap_or(0.0);
        s
    }
}

// ---------------------------------------------------------------------------
// SUMMARY
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub items: usize,
    pub clean: usize,
    pub nonzero: usize,
    pub signaled: usize,
    pub spawn_failed: usize,
    pub pid_mismatches: usize,
    pub jitter_median_us: f64,
    pub jitter_p99_us: f64,
    pub jitter_worst_us: f64,
    pub elapsed_secs: f64,
    pub start_epoch: f64,
    pub end_epoch: f64,
}

impl RunSummary {
    pub fn print(&self) {
        println!("\n{}", "=".repeat(50));
        println!("LOADGEN SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  ITEMS:             {}", self.items);
        println!("  CLEAN EXITS:       {}", self.clean);
        println!("  NON-ZERO EXITS:    {}", self.nonzero);
        println!("  SIGNALED:          {}", self.signaled);
        println!("  SPAWN FAILURES:    {}", self.spawn_failed);
        println!(
            "  DISPATCH JITTER:   MEDIAN {:.0}us  P99 {:.0}us  WORST {:.0}us",
            self.jitter_median_us, self.jitter_p99_us, self.jitter_worst_us
        );
        if self.pid_mismatches > 0 {
            println!("  PID MISMATCHES:    {} (PAYLOAD REPORTED A DIFFERENT PID)", self.pid_mismatches);
        }
        println!("  ELAPSED:           {:.2}s", self.elapsed_secs);
        println!("  WINDOW (EPOCH):    {:.3} -> {:.3}", self.start_epoch, self.end_epoch);
    }
}

pub fn percentile(sorted_vals: &[f64], p: f64) -> f64 {
    if sorted_vals.is_empty() {
        return 0.0;
    }
    let idx = (sorted_vals.len() as f64 * p / 100.0) as usize;
    let idx = idx.min(sorted_vals.len() - 1);
    sorted_vals[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(i: usize, outcome: Outcome) -> CompletionRecord {
        CompletionRecord {
            sequence_index: i,
            argument: format!("a{}", i),
            pid: Some(1000 + i as i32),
            target_ns: 1_000,
            request_ns: 1_000 + (i as u64) * 1_000,
            return_ns: 50_000,
            outcome,
            stdout: format!("pid: {} fib(3): 3\n", 1000 + i),
        }
    }

    #[test]
    fn assemble_complete_run() {
        let slots = vec![Some(record(0, Outcome::Exited(0))), Some(record(1, Outcome::Exited(0)))];
        let results = RunResults::assemble(slots, RunWindow::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results.records()[1].argument, "a1");
    }

    #[test]
    fn assemble_rejects_holes() {
        let slots = vec![Some(record(0, Outcome::Exited(0))), None, None];
        match RunResults::assemble(slots, RunWindow::default()) {
            Err(ReplayError::IncompleteRun { missing, total }) => {
                assert_eq!(missing, vec![1, 2]);
                assert_eq!(total, 3);
            }
            _ => panic!("expected IncompleteRun"),
        }
    }

    #[test]
    fn assemble_rejects_misplaced_record() {
        let slots = vec![Some(record(1, Outcome::Exited(0)))];
        assert!(RunResults::assemble(slots, RunWindow::default()).is_err());
    }

    #[test]
    fn outcome_exit_codes() {
        assert_eq!(Outcome::Exited(3).exit_code(), 3);
        assert_eq!(Outcome::Signaled(9).exit_code(), 137);
        assert_eq!(Outcome::SpawnFailed("ENOENT".into()).exit_code(), -1);
        assert!(Outcome::Exited(0).is_success());
        assert!(!Outcome::Signaled(15).is_success());
    }

    #[test]
    fn reported_pid_parses_payload_line() {
        assert_eq!(reported_pid("pid: 3300 fib(36): 24157817"), Some(3300));
        assert_eq!(reported_pid("no token here"), None);
    }

    #[test]
    fn summary_counts_outcomes() {
        let slots = vec![
            Some(record(0, Outcome::Exited(0))),
            Some(record(1, Outcome::Exited(2))),
            Some(record(2, Outcome::Signaled(9))),
            Some(record(3, Outcome::SpawnFailed("ENOENT".into()))),
        ];
        let s = RunResults::assemble(slots, RunWindow::default()).unwrap().summary();
        assert_eq!(s.items, 4);
        assert_eq!(s.clean, 1);
        assert_eq!(s.nonzero, 1);
        assert_eq!(s.signaled, 1);
        assert_eq!(s.spawn_failed, 1);
        assert_eq!(s.pid_mismatches, 0);
        // JITTER OVER THE THREE REAL PROCESSES: 0, 1, 2 US
        assert_eq!(s.jitter_worst_us, 2.0);
        assert_eq!(s.jitter_median_us, 1.0);
    }

    #[test]
    fn percentile_edges() {
        assert_eq!(percentile(&[], 99.0), 0.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 100.0), 3.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 0.0), 1.0);
    }
}
