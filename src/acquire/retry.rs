//! Bounded retry with a fixed delay (no backoff, no jitter)

use crate::core::interrupt::Interrupt;
use crate::core::output;
use crate::error::Result;
use std::time::{Duration, Instant};
use tracing::debug;

/// Granularity at which a retry sleep notices an interrupt
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// 100 attempts, 10 seconds apart.
    pub const NETWORK: Self = Self {
        max_attempts: 100,
        delay: Duration::from_secs(10),
    };

    /// Run once, never retry.
    pub const ONCE: Self = Self {
        max_attempts: 1,
        delay: Duration::ZERO,
    };

    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Invoke `op` until it succeeds, fails permanently, or the attempts run
    /// out. `op` receives the 1-based attempt number.
    pub fn run<T>(
        &self,
        label: &str,
        interrupt: &Interrupt,
        mut op: impl FnMut(u32) -> Result<T>,
    ) -> Result<T> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            interrupt.check()?;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && e.is_retryable() => {
                    debug!(label, attempt, error = %e, "attempt failed, retrying");
                    output::warning(&format!(
                        "{} failed (attempt {}/{}): {}; retrying in {}s",
                        label,
                        attempt,
                        max_attempts,
                        e,
                        self.delay.as_secs()
                    ));
                    sleep_interruptible(self.delay, interrupt)?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NETWORK
    }
}

fn sleep_interruptible(delay: Duration, interrupt: &Interrupt) -> Result<()> {
    let deadline = Instant::now() + delay;
    loop {
        interrupt.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
