// LOADGEN PACER
// TURNS RELATIVE INTER-ARRIVAL TIMES INTO ABSOLUTE MONOTONIC DEADLINES AND
// RELEASES EACH ITEM AS CLOSE TO ITS DEADLINE AS POSSIBLE.
//
// THE PACER NEVER WAITS FOR A SPAWN OR AN EXIT. THE ONLY THING THAT CAN
// BLOCK IT BESIDES ITS OWN DEADLINE WAIT IS A FULL LAUNCH QUEUE: THAT IS
// BACK-PRESSURE AND SHOWS UP AS JITTER, NOT AS UNBOUNDED MEMORY.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::Sender;
use log::{debug, warn};

use crate::clock;
use crate::trace::WorkloadItem;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub sequence_index: usize,
    pub argument: String,
    pub target_ns: u64,
}

// WHAT TRAVELS OVER THE LAUNCH QUEUE. ONE Shutdown PER WORKER ENDS THE POOL.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Launch(DispatchRequest),
    Shutdown,
}

#[derive(Debug, Clone, Default)]
pub struct PacerReport {
    pub emitted: usize,
    pub stopped_early: bool,
    // TOTAL TIME SPENT BLOCKED ON A FULL QUEUE
    pub blocked_ns: u64,
    // WORST RELEASE LATENESS (RELEASE TIME - TARGET), INCLUDING BACK-PRESSURE
    pub worst_release_late_ns: u64,
    pub end_ns: u64,
}

pub struct Pacer {
    guard_ns: u64,
}

// ABSOLUTE DEADLINES: start + CUMULATIVE SUM OF IATS. NON-DECREASING BECAUSE
// EVERY IAT IS NON-NEGATIVE.
pub fn target_times(start_ns: u64, items: &[WorkloadItem]) -> Vec<u64> {
    let mut next = start_ns;
    items
        .iter()
        .map(|item| {
            next = next.saturating_add(item.inter_arrival_ns());
            next
        })
        .collect()
}

impl Pacer {
    pub fn new(guard_ns: u64) -> Self {
        Self { guard_ns }
    }

    /// Release every item onto `queue` at its deadline, then send
    /// `sentinels` shutdown markers.
    ///
    /// Stops emitting (but still sends the sentinels) when `shutdown` is set
    /// or every receiver is gone.
    pub fn run(
        &self,
        items: &[WorkloadItem],
        start_ns: u64,
        queue: &Sender<Dispatch>,
        sentinels: usize,
        shutdown: &AtomicBool,
    ) -> PacerReport {
        let mut report = PacerReport::default();
        let mut next_target = start_ns;

        for item in items {
            if shutdown.load(Ordering::Relaxed) {
                warn!("pacer: shutdown requested after {} of {} items", report.emitted, items.len());
                report.stopped_early = true;
                break;
            }

            next_target = next_target.saturating_add(item.inter_arrival_ns());
            clock::wait_until(next_target, self.guard_ns);

            let request = Dispatch::Launch(DispatchRequest {
                sequence_index: item.sequence_index,
                argument: item.argument.clone(),
                target_ns: next_target,
            });

            // FAST PATH FIRST SO THE BLOCKED-TIME ACCOUNTING ONLY COVERS REAL STALLS
            let sent = match queue.try_send(request) {
                Ok(()) => true,
                Err(crossbeam::channel::TrySendError::Full(request)) => {
                    let t0 = clock::now_ns();
                    let ok = queue.send(request).is_ok();
                    report.blocked_ns += clock::now_ns() - t0;
                    ok
                }
                Err(crossbeam::channel::TrySendError::Disconnected(_)) => false,
            };
            if !sent {
                warn!("pacer: launch queue disconnected after {} items", report.emitted);
                report.stopped_early = true;
                break;
            }

            let late = clock::now_ns().saturating_sub(next_target);
            report.worst_release_late_ns = report.worst_release_late_ns.max(late);
            report.emitted += 1;
        }

        for _ in 0..sentinels {
            if queue.send(Dispatch::Shutdown).is_err() {
                break;
            }
        }

        report.end_ns = clock::now_ns();
        debug!(
            "pacer: emitted {} items, blocked {} us on back-pressure, worst release {} us late",
            report.emitted,
            report.blocked_ns / 1_000,
            report.worst_release_late_ns / 1_000
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::parse_trace;

    #[test]
    fn targets_are_cumulative() {
        let items = parse_trace("0 A\n0.01 B\n0.02 C\n").unwrap();
        assert_eq!(target_times(1_000, &items), vec![1_000, 10_001_000, 30_001_000]);
    }

    #[test]
    fn targets_non_decreasing_with_zero_gaps() {
        let items = parse_trace("0 A\n0 B\n0.5 C\n0 D\n").unwrap();
        let t = target_times(0, &items);
        assert!(t.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn run_emits_in_order_then_sentinels() {
        let items = parse_trace("0 A\n0.001 B\n0.002 C\n").unwrap();
        let (tx, rx) = crossbeam::channel::bounded(16);
        let shutdown = AtomicBool::new(false);
        let start = clock::now_ns();

        let report = Pacer::new(clock::DEFAULT_GUARD_NS).run(&items, start, &tx, 2, &shutdown);
        assert_eq!(report.emitted, 3);
        assert!(!report.stopped_early);

        let got: Vec<Dispatch> = rx.try_iter().collect();
        assert_eq!(got.len(), 5);
        let targets = target_times(start, &items);
        for (i, d) in got[..3].iter().enumerate() {
            match d {
                Dispatch::Launch(r) => {
                    assert_eq!(r.sequence_index, i);
                    assert_eq!(r.target_ns, targets[i]);
                }
                Dispatch::Shutdown => panic!("sentinel before item {}", i),
            }
        }
        assert_eq!(got[3], Dispatch::Shutdown);
        assert_eq!(got[4], Dispatch::Shutdown);
    }

    #[test]
    fn shutdown_flag_stops_emission() {
        let items = parse_trace("0 A\n0 B\n").unwrap();
        let (tx, rx) = crossbeam::channel::bounded(16);
        let shutdown = AtomicBool::new(true);

        let report = Pacer::new(0).run(&items, clock::now_ns(), &tx, 1, &shutdown);
        assert_eq!(report.emitted, 0);
        assert!(report.stopped_early);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![Dispatch::Shutdown]);
    }

    #[test]
    fn disconnected_queue_stops_emission() {
        let items = parse_trace("0 A\n0 B\n").unwrap();
        let (tx, rx) = crossbeam::channel::bounded(16);
        drop(rx);
        let shutdown = AtomicBool::new(false);

        let report = Pacer::new(0).run(&items, clock::now_ns(), &tx, 4, &shutdown);
        assert_eq!(report.emitted, 0);
        assert!(report.stopped_early);
    }
}
