// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access.

use std::time::Duration;

use kubejob_wire::DEFAULT_AGENT_PORT;

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Attempts per channel operation before a transient error is surfaced
pub fn exec_retry_count() -> u32 {
    parsed("KUBEJOB_EXEC_RETRY_COUNT").unwrap_or(3)
}

/// Port of the first agent-enabled container
pub fn agent_port() -> u16 {
    parsed("KUBEJOB_AGENT_PORT").unwrap_or(DEFAULT_AGENT_PORT)
}

/// Connection attempts while waiting for an agent to start listening
pub fn agent_ready_attempts() -> usize {
    parsed("KUBEJOB_AGENT_READY_ATTEMPTS").unwrap_or(60)
}

/// Delay between agent connection attempts
pub fn agent_ready_poll() -> Duration {
    parsed("KUBEJOB_AGENT_READY_POLL_MS").map(Duration::from_millis).unwrap_or(Duration::from_millis(500))
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
