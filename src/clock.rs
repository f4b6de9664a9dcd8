// LOADGEN CLOCK
// MONOTONIC NANOSECOND TIMESTAMPS AND THE HYBRID DEADLINE WAIT.
//
// OS SLEEP OVERSHOOTS BY SCHEDULER-TICK GRANULARITY. SPINNING THE WHOLE
// WAIT BURNS THE PACER CORE. THE DEADLINE WAIT SLEEPS COARSELY UNTIL
// guard_ns BEFORE THE DEADLINE, THEN SPINS ON THE CLOCK FOR THE REST.

use std::time::Duration;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

// DEFAULT GUARD BAND: 1.5MS. ABOVE TYPICAL nanosleep OVERSHOOT ON AN IDLE CORE.
pub const DEFAULT_GUARD_NS: u64 = 1_500_000;

pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * NSEC_PER_SEC + (ts.tv_nsec as u64)
}

// SECONDS (NON-NEGATIVE, FINITE) TO WHOLE NANOSECONDS
pub fn secs_to_ns(secs: f64) -> u64 {
    (secs * NSEC_PER_SEC as f64).round() as u64
}

pub fn ns_to_secs(ns: u64) -> f64 {
    ns as f64 / NSEC_PER_SEC as f64
}

/// Block until the monotonic clock reads at least `deadline_ns`.
///
/// Sleeps for `remaining - guard_ns` when the remaining wait exceeds the
/// guard band, then busy-polls the clock. Never returns early. Returns how
/// late it returned, in nanoseconds.
pub fn wait_until(deadline_ns: u64, guard_ns: u64) -> u64 {
    let now = now_ns();
    if now >= deadline_ns {
        return now - deadline_ns;
    }

    let remaining = deadline_ns - now;
    if remaining > guard_ns {
        std::thread::sleep(Duration::from_nanos(remaining - guard_ns));
    }

    loop {
        let now = now_ns();
        if now >= deadline_ns {
            return now - deadline_ns;
        }
        std::hint::spin_loop();
    }
}

// PURE-SLEEP BASELINE FOR THE PROBE. MAY RETURN EARLY ONLY IF THE KERNEL
// DOES, WHICH nanosleep DOES NOT.
pub fn sleep_until(deadline_ns: u64) -> u64 {
    let now = now_ns();
    if now < deadline_ns {
        std::thread::sleep(Duration::from_nanos(deadline_ns - now));
    }
    now_ns().saturating_sub(deadline_ns)
}

// WALL-CLOCK SECONDS SINCE THE EPOCH. FOR THE EXTERNAL CPU SAMPLER ONLY;
// ALL SCHEDULING MATH IS MONOTONIC.
pub fn epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
