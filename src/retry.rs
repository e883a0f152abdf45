//! Retry profiles for the pipeline's retry loops.
//!
//! The scrape, fetch and promote loops all default to retrying forever: a
//! scheduled run would rather finish late than fail, and the scheduler's
//! wall-clock timeout is the outer bound. A [`RetryPolicy`] makes that
//! choice explicit and lets a deployment cap attempts or elapsed time.
//!
//! ```toml
//! [retry.fetch]
//! max_attempts = 50
//! max_elapsed_secs = 3600
//! ```

use serde::Deserialize;
use std::time::{Duration, Instant};

/// How long a retry loop may keep going. `None` on both limits means forever.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of failed attempts before giving up.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Maximum wall-clock time since the first attempt.
    #[serde(default)]
    pub max_elapsed_secs: Option<u64>,
}

impl RetryPolicy {
    /// Retry forever.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Give up after `n` failed attempts.
    pub fn max_attempts(n: u32) -> Self {
        Self {
            max_attempts: Some(n),
            max_elapsed_secs: None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts.is_none() && self.max_elapsed_secs.is_none()
    }

    /// Start tracking one retry loop under this policy.
    pub fn start(&self) -> RetryBudget {
        RetryBudget {
            policy: self.clone(),
            started: Instant::now(),
            failures: 0,
        }
    }
}

/// Per-loop state: failures so far and when the loop began.
#[derive(Debug)]
pub struct RetryBudget {
    policy: RetryPolicy,
    started: Instant,
    failures: u32,
}

impl RetryBudget {
    /// Records a failed attempt. Returns `Err` once the policy is exhausted.
    pub fn fail(&mut self) -> Result<(), Exhausted> {
        self.failures = self.failures.saturating_add(1);
        if let Some(max) = self.policy.max_attempts {
            if self.failures >= max {
                return Err(self.exhausted());
            }
        }
        if let Some(secs) = self.policy.max_elapsed_secs {
            if self.started.elapsed() >= Duration::from_secs(secs) {
                return Err(self.exhausted());
            }
        }
        Ok(())
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn exhausted(&self) -> Exhausted {
        Exhausted {
            attempts: self.failures,
            elapsed: self.started.elapsed(),
        }
    }
}

/// A retry loop ran out of budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    pub attempts: u32,
    pub elapsed: Duration,
}

impl std::fmt::Display for Exhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gave up after {} failed attempts ({:.1}s)",
            self.attempts,
            self.elapsed.as_secs_f64()
        )
    }
}

impl std::error::Error for Exhausted {}
