use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Why a stage or sensor poll gave up
#[derive(Debug)]
pub enum PollError<E> {
    Timeout,
    /// The check itself failed, usually a link error
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout => write!(f, "Polling deadline passed"),
            PollError::ConditionError(e) => write!(f, "Poll check failed: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

/// Time left of `timeout` since `start`, capped at one polling interval.
fn next_nap(start: Instant, timeout: Duration, poll_interval: Duration) -> Duration {
    timeout.saturating_sub(start.elapsed()).min(poll_interval)
}

/// Re-run `condition` until it reports `true`, such as a stage going idle.
///
/// The check is never started after `timeout` has elapsed, and the naps
/// in between never run past it either. A failing check ends polling at once.
pub fn poll_until<F, E>(
    mut condition: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let start = Instant::now();

    loop {
        if start.elapsed() >= timeout {
            return Err(PollError::Timeout);
        }

        match condition() {
            Ok(true) => return Ok(()),
            Ok(false) => std::thread::sleep(next_nap(start, timeout, poll_interval)),
            Err(e) => return Err(PollError::ConditionError(e)),
        }
    }
}

/// Like [`poll_until`] but the check yields a value, e.g. a position that
/// matches its target. Running out of time is `Ok(None)`.
pub fn poll_with_timeout<F, T, E>(
    mut operation: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<T>, PollError<E>>
where
    F: FnMut() -> Result<Option<T>, E>,
{
    let start = Instant::now();

    loop {
        if start.elapsed() >= timeout {
            return Ok(None);
        }

        match operation() {
            Ok(Some(result)) => return Ok(Some(result)),
            Ok(None) => std::thread::sleep(next_nap(start, timeout, poll_interval)),
            Err(e) => return Err(PollError::ConditionError(e)),
        }
    }
}

/// Retry schedule expressed as data: one delay between each pair of attempts.
///
/// A schedule of `[0.5s, 1s, 2s]` allows four attempts in total.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    delays: Vec<Duration>,
}

impl Backoff {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays_ms: &[u64]) -> Self {
        Self::new(delays_ms.iter().copied().map(Duration::from_millis).collect())
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    /// Number of retries after the first attempt
    pub fn retries(&self) -> usize {
        self.delays.len()
    }

    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Delay to wait after the given zero-based attempt, `None` after the last one
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_millis(&[500, 1000, 2000])
    }
}

/// Sleep in short slices, returning early with `false` once `interrupt` is raised
pub fn sleep_interruptible(duration: Duration, interrupt: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(20);
    let deadline = Instant::now() + duration;

    loop {
        if interrupt.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLICE));
    }
}

/// Fixed-rate pacing for periodic reads.
///
/// `wait` sleeps for whatever remains of the current period instead of
/// spinning, so a 10 Hz collection loop stays at 10 Hz even when reads are fast.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_tick: Option<Instant>,
}

impl RateLimiter {
    pub fn new(rate_hz: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / rate_hz.max(f64::EPSILON)),
            last_tick: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until the next period starts. Returns the time spent sleeping.
    pub fn wait(&mut self) -> Duration {
        let slept = match self.last_tick {
            Some(last) => {
                let elapsed = last.elapsed();
                if elapsed < self.interval {
                    let remaining = self.interval - elapsed;
                    std::thread::sleep(remaining);
                    remaining
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };
        self.last_tick = Some(Instant::now());
        slept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_poll_until_success() {
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = counter.clone();

        let result = poll_until(
            || {
                let mut count = counter_clone.lock().unwrap();
                *count += 1;
                Ok::<bool, &str>(*count >= 3)
            },
            Duration::from_millis(500),
            Duration::from_millis(10),
        );

        assert!(result.is_ok());
        assert!(*counter.lock().unwrap() >= 3);
    }

    #[test]
    fn test_poll_until_timeout() {
        let result = poll_until(
            || Ok::<bool, &str>(false),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );

        assert!(matches!(result, Err(PollError::Timeout)));
    }

    #[test]
    fn test_poll_until_error() {
        let result = poll_until(
            || Err::<bool, &str>("test error"),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );

        assert!(matches!(result, Err(PollError::ConditionError("test error"))));
    }

    #[test]
    fn test_poll_does_not_oversleep_its_timeout() {
        let start = Instant::now();
        let result = poll_until(
            || Ok::<bool, &str>(false),
            Duration::from_millis(40),
            Duration::from_secs(2),
        );

        assert!(matches!(result, Err(PollError::Timeout)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_poll_with_timeout_timeout() {
        let result = poll_with_timeout(
            || Ok::<Option<()>, &str>(None),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );

        assert_eq!(result.unwrap(), None);
    }

    #[test]
    fn test_backoff_schedule() {
        let backoff = Backoff::default();
        assert_eq!(backoff.retries(), 3);
        assert_eq!(backoff.attempts(), 4);
        assert_eq!(backoff.delay_after(0), Some(Duration::from_millis(500)));
        assert_eq!(backoff.delay_after(2), Some(Duration::from_secs(2)));
        assert_eq!(backoff.delay_after(3), None);
        assert_eq!(Backoff::none().attempts(), 1);
    }

    #[test]
    fn test_sleep_interruptible() {
        let flag = AtomicBool::new(false);
        assert!(sleep_interruptible(Duration::from_millis(30), &flag));

        flag.store(true, Ordering::SeqCst);
        let start = Instant::now();
        assert!(!sleep_interruptible(Duration::from_secs(5), &flag));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_rate_limiter_paces_calls() {
        let mut limiter = RateLimiter::new(50.0);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.wait();
        }
        // First tick is free, the next three each wait one 20 ms period
        assert!(start.elapsed() >= Duration::from_millis(55));
    }
}
