//! Time collaborator and the bounded poll every wait site goes through.

use std::{
    fmt::Debug,
    time::{Duration, Instant},
};

use tracing::trace;

use crate::error::{Result, UfsError};

/// A microsecond-granularity delay primitive.
pub trait Delay: Debug + Send + Sync {
    /// Stall the caller for at least `duration` and return how long the
    /// stall actually took.
    fn stall(&self, duration: Duration) -> Duration;
}

/// [`Delay`] that puts the calling thread to sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn stall(&self, duration: Duration) -> Duration {
        let start = Instant::now();
        std::thread::sleep(duration);
        start.elapsed()
    }
}

/// Poll `ready` until it reports `true`, at most `timeout` long.
///
/// The predicate is evaluated once before the first stall, so a condition
/// that already holds never waits. Between evaluations the caller is stalled
/// for `interval`, and the time each stall really took counts against
/// `timeout`. Errors from the predicate end the poll immediately. On expiry
/// the result is [`UfsError::Timeout`] naming `what`.
pub fn poll_until<F>(
    delay: &dyn Delay,
    timeout: Duration,
    interval: Duration,
    what: &'static str,
    mut ready: F,
) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    // A zero interval would never advance the deadline.
    let interval = interval.max(Duration::from_micros(1));
    let mut waited = Duration::ZERO;

    loop {
        if ready()? {
            return Ok(());
        }
        if waited >= timeout {
            trace!("gave up waiting for {what} after {waited:?}");
            return Err(UfsError::Timeout(what));
        }
        waited += delay.stall(interval);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingDelay {
        micros: AtomicU64,
    }

    impl Delay for CountingDelay {
        fn stall(&self, duration: Duration) -> Duration {
            self.micros
                .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
            duration
        }
    }

    /// Reports every stall as ten times the requested length.
    #[derive(Debug, Default)]
    struct OversleepingDelay {
        stalls: AtomicU64,
    }

    impl Delay for OversleepingDelay {
        fn stall(&self, duration: Duration) -> Duration {
            self.stalls.fetch_add(1, Ordering::Relaxed);
            duration * 10
        }
    }

    #[test]
    fn ready_condition_does_not_stall() {
        let delay = CountingDelay::default();
        poll_until(
            &delay,
            Duration::from_millis(1),
            Duration::from_micros(1),
            "nothing",
            || Ok(true),
        )
        .unwrap();
        assert_eq!(delay.micros.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn condition_met_after_a_few_polls() {
        let delay = CountingDelay::default();
        let mut polls = 0;
        poll_until(
            &delay,
            Duration::from_millis(1),
            Duration::from_micros(10),
            "third poll",
            || {
                polls += 1;
                Ok(polls == 3)
            },
        )
        .unwrap();
        assert_eq!(polls, 3);
        assert_eq!(delay.micros.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn expiry_is_a_timeout_bounded_by_the_deadline() {
        let delay = CountingDelay::default();
        let result = poll_until(
            &delay,
            Duration::from_micros(100),
            Duration::from_micros(10),
            "never",
            || Ok(false),
        );
        assert_eq!(result, Err(UfsError::Timeout("never")));
        assert_eq!(delay.micros.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn timeout_counts_the_time_actually_stalled() {
        let delay = OversleepingDelay::default();
        let result = poll_until(
            &delay,
            Duration::from_micros(100),
            Duration::from_micros(10),
            "never",
            || Ok(false),
        );
        assert_eq!(result, Err(UfsError::Timeout("never")));
        assert_eq!(delay.stalls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn thread_delay_expires_on_wall_clock_time() {
        let start = Instant::now();
        let result = poll_until(
            &ThreadDelay,
            Duration::from_millis(20),
            Duration::from_micros(1),
            "wall clock",
            || Ok(false),
        );
        assert_eq!(result, Err(UfsError::Timeout("wall clock")));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[test]
    fn predicate_errors_end_the_poll() {
        let delay = CountingDelay::default();
        let result = poll_until(
            &delay,
            Duration::from_secs(1),
            Duration::from_micros(1),
            "broken",
            || Err(UfsError::NotFound("device")),
        );
        assert_eq!(result, Err(UfsError::NotFound("device")));
    }
}
