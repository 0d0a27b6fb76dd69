//! Test assertion helpers.
//!
//! Provides polling-based waits for multi-threaded test scenarios.

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

/// Default polling interval for [`wait_until`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls a condition until it returns true or the timeout expires.
///
/// Useful where another thread reaches a state at a non-deterministic time, such as a writer
/// queueing on the shared write broker. Avoids flaky tests built on fixed sleeps.
///
/// Returns `true` if the condition became true before the timeout.
///
/// # Example
///
/// ```no_run
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tunerdb_test_utils::wait_until;
///
/// let flag = Arc::new(AtomicBool::new(false));
/// let setter = Arc::clone(&flag);
/// std::thread::spawn(move || setter.store(true, Ordering::SeqCst));
///
/// assert!(wait_until(Duration::from_millis(200), || flag.load(Ordering::SeqCst)));
/// ```
pub fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL);
    }

    // Final check after timeout
    condition()
}
