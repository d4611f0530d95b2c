//! System time and timeout predicates.
//!
//! The tick counter is advanced by the timer interrupt once the interrupt
//! controller is up. Early-boot code runs before that, so bounded waits use a
//! combined predicate: wall-clock milliseconds OR a spin count, whichever
//! trips first. With a stuck clock the spin bound still terminates the loop.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer tick counter in milliseconds.
static SYSTEM_TICKS_MS: AtomicU64 = AtomicU64::new(0);

/// Get the current system time in milliseconds.
pub fn system_time_ms() -> u64 {
    SYSTEM_TICKS_MS.load(Ordering::Relaxed)
}

/// Advance the tick counter. Called from the timer interrupt path.
pub fn tick(elapsed_ms: u64) {
    SYSTEM_TICKS_MS.fetch_add(elapsed_ms, Ordering::Relaxed);
}

/// Combined timeout predicate.
///
/// Returns `true` once `max_loops` iterations have elapsed OR the wall clock
/// advanced past `timeout_ms` since `start_ms`.
pub fn has_operation_timed_out(start_ms: u64, loop_count: u64, max_loops: u64, timeout_ms: u64) -> bool {
    has_operation_timed_out_at(system_time_ms(), start_ms, loop_count, max_loops, timeout_ms)
}

/// Timeout predicate against an explicit clock reading.
pub fn has_operation_timed_out_at(
    now_ms: u64,
    start_ms: u64,
    loop_count: u64,
    max_loops: u64,
    timeout_ms: u64,
) -> bool {
    if loop_count >= max_loops {
        return true;
    }

    now_ms.wrapping_sub(start_ms) >= timeout_ms && now_ms != start_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_bound_trips_with_stuck_clock() {
        // The clock has not advanced; only the loop bound can terminate.
        assert!(!has_operation_timed_out_at(0, 0, 0, 100, 200));
        assert!(!has_operation_timed_out_at(0, 0, 99, 100, 200));
        assert!(has_operation_timed_out_at(0, 0, 100, 100, 200));
        assert!(has_operation_timed_out_at(0, 0, u64::MAX, 100, 200));
    }

    #[test]
    fn wall_clock_bound_trips_when_time_advances() {
        assert!(has_operation_timed_out_at(250, 0, 0, u64::MAX, 200));
        assert!(!has_operation_timed_out_at(100, 0, 0, u64::MAX, 200));
        assert!(!has_operation_timed_out_at(250, 250, 0, u64::MAX, 200));
    }
}
