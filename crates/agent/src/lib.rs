// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-container agent serving exec, file transfer and status writes over
//! the framed session protocol.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod server;
mod session;

pub use server::{AgentServer, ServerConfig};
pub use session::SessionError;
