// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exit-status handshake constants shared by the controller and the agent.

/// Sentinel file a wrapped container polls for; its contents become the
/// container's exit status.
pub const STATUS_PATH: &str = "/tmp/kubejob-status";

/// Environment variable carrying the per-run agent session token
pub const AGENT_TOKEN_ENV: &str = "KUBEJOB_AGENT_TOKEN";

/// Port the first agent-enabled container listens on
pub const DEFAULT_AGENT_PORT: u16 = 9820;

/// Map an exit code onto what a shell `exit` can reproduce.
///
/// Codes outside 1..=255 would wrap (256 becomes 0), so any non-zero code
/// that does not fit is reported as 1.
pub fn status_code(exit_code: i32) -> i32 {
    match exit_code {
        0 => 0,
        1..=255 => exit_code,
        _ => 1,
    }
}
