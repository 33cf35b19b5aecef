// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control messages exchanged with the in-container agent.

use serde::{Deserialize, Serialize};

/// Protocol version (from Cargo.toml)
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Request from the controller to an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    /// First message on every session
    Hello { token: String, version: String },

    /// Run a command; output follows on `Stdout`/`Stderr`, then `Exited`
    Exec { command: Vec<String> },

    /// Followed by `Data` frames holding a tar archive to extract at `dest`
    CopyToPod { dest: String },

    /// Agent replies with `Data` frames holding a tar archive of `src`
    CopyFromPod { src: String },

    /// Write the status sentinel so the container can exit
    Finish { exit_code: i32 },
}

/// Response from an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Response {
    Hello { version: String },

    /// Command finished
    Exited { exit_code: i32 },

    /// Generic success
    Done,

    Error { message: String },
}
