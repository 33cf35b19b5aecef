// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry of channel operations on transient errors.

use std::future::Future;
use std::time::Duration;

use crate::channel::ChannelError;
use crate::env;
use crate::macros::setters;

/// How often and how patiently a channel operation is retried.
///
/// Only transient errors (the pod or container not found yet) are retried;
/// everything else surfaces on the first attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(env::exec_retry_count())
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self { attempts, backoff: Duration::from_millis(200), max_backoff: Duration::from_secs(2) }
    }

    setters! {
        set { backoff: Duration, max_backoff: Duration }
    }

    /// Total attempts, including the first
    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Delay after the failed attempt `attempt` (zero-based)
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }

    pub(crate) async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, ChannelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(operation, attempt = attempt + 1, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
