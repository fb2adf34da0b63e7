//! Bounded retry with a fixed delay between attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::*;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Total time spent sleeping if every attempt fails.
    pub fn budget(&self) -> Duration {
        self.delay
            .checked_mul(self.max_attempts.saturating_sub(1))
            .unwrap_or(Duration::MAX)
    }

    /// A policy must allow at least one attempt.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            let msg = "retry policy allows no attempts".to_string();
            error!("{msg}");
            return Err(Error::InvalidConfiguration(msg));
        }
        Ok(())
    }

    /// Run `op` until it succeeds, aborts, or `max_attempts` is reached.
    ///
    /// Only the last failure is returned. The token is checked before every
    /// sleep, so a cancelled retry returns [`Error::Cancelled`] without
    /// waiting out the remaining budget. A policy with no attempts never
    /// calls `op`.
    pub fn run<T, F, C>(&self, clock: &C, token: &CancelToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T, Attempt>,
        C: Clock + ?Sized,
    {
        self.validate()?;
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(Attempt::Abort(e)) => return Err(e),
                Err(Attempt::Retry(e)) => {
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    trace!("Attempt {attempt}/{} failed: {e}", self.max_attempts);
                }
            }
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            clock.sleep(self.delay);
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;
        }
    }
}

/// Outcome of one failed attempt.
#[derive(Debug)]
pub enum Attempt {
    Retry(Error),
    Abort(Error),
}

pub trait Clock {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
