// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote-command stream protocol versions.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use thiserror::Error;

use crate::macros::simple_display;

/// Subprotocol spoken on an exec connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamProtocol {
    V1,
    V2,
    V3,
    V4,
}

simple_display! {
    StreamProtocol {
        V1 => "channel.k8s.io",
        V2 => "v2.channel.k8s.io",
        V3 => "v3.channel.k8s.io",
        V4 => "v4.channel.k8s.io",
    }
}

/// Reason attached to the status cause that carries an exit code
const EXIT_CODE_CAUSE: &str = "ExitCode";

/// The remote side reported an error that is not a command exit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote command error: {0}")]
pub struct RemoteError(pub String);

impl StreamProtocol {
    /// Client preference, most capable first
    pub const PREFERRED: [StreamProtocol; 4] =
        [StreamProtocol::V4, StreamProtocol::V3, StreamProtocol::V2, StreamProtocol::V1];

    /// First entry of `preferred` the server also supports. Servers that
    /// agree on nothing are spoken to with V1.
    pub fn negotiate(preferred: &[StreamProtocol], supported: &[StreamProtocol]) -> StreamProtocol {
        preferred.iter().copied().find(|p| supported.contains(p)).unwrap_or(StreamProtocol::V1)
    }

    /// Whether the error channel carries structured exit codes
    pub fn reports_exit_codes(self) -> bool {
        self == StreamProtocol::V4
    }

    /// Decode the final status of an exec stream into an exit code.
    ///
    /// A stream that closes without a status succeeded. Before V4 a failed
    /// command is only known to be non-zero, so it maps to 1.
    pub fn exit_code(self, status: Option<&Status>) -> Result<i32, RemoteError> {
        let Some(status) = status else {
            return Ok(0);
        };
        if status.status.as_deref() == Some("Success") {
            return Ok(0);
        }
        if !self.reports_exit_codes() {
            return Ok(1);
        }
        if status.reason.as_deref() != Some("NonZeroExitCode") {
            return Err(RemoteError(status.message.clone().unwrap_or_default()));
        }
        let code = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .into_iter()
            .flatten()
            .find(|c| c.reason.as_deref() == Some(EXIT_CODE_CAUSE))
            .and_then(|c| c.message.as_deref())
            .and_then(|m| m.trim().parse().ok())
            .unwrap_or(1);
        Ok(code)
    }
}

/// The status an API server sends for a command that exited with `code`
#[cfg(any(test, feature = "test-support"))]
pub(crate) fn exit_status(code: i32) -> Status {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    if code == 0 {
        return Status { status: Some("Success".into()), ..Status::default() };
    }
    Status {
        status: Some("Failure".into()),
        reason: Some("NonZeroExitCode".into()),
        message: Some(format!("command terminated with non-zero exit code: exit status {code}")),
        details: Some(StatusDetails {
            causes: Some(vec![StatusCause {
                reason: Some(EXIT_CODE_CAUSE.into()),
                message: Some(code.to_string()),
                field: None,
            }]),
            ..StatusDetails::default()
        }),
        ..Status::default()
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
