//! Exponential backoff

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry schedule: up to `max_retries` extra attempts, waiting
/// `initial_delay * factor^n` (capped at `max_delay`) before each one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Waits before each retry, in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max_delay = self.max_delay;
        let factor = self.factor;
        std::iter::successors(Some(self.initial_delay.min(max_delay)), move |delay| {
            // non-finite or out-of-range products saturate at the cap
            let next = Duration::try_from_secs_f64(delay.as_secs_f64() * factor).map_or(max_delay, |d| d.min(max_delay));
            Some(next)
        })
        .take(self.max_retries as usize)
    }

    /// Run `op` until it succeeds or retries are exhausted; the last error
    /// is returned.
    pub async fn run<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(op, |_| true).await
    }

    /// Like [`run`](Self::run), but errors rejected by `should_retry` are
    /// returned immediately.
    pub async fn run_if<F, Fut, T, E, P>(&self, mut op: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut delays = self.delays();
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !should_retry(&err) {
                        return Err(err);
                    }
                    let Some(delay) = delays.next() else {
                        return Err(err);
                    };
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
