// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent session protocol.
//!
//! Wire format: 1-byte channel tag + 4-byte length prefix (big-endian) + payload.
//! Control frames carry JSON [`Request`]/[`Response`] messages; output and
//! archive bytes travel raw on their own channels.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod archive;
mod frame;
mod message;
mod status;

pub use archive::ArchiveError;
pub use frame::{
    read_frame, recv_data, send_data, write_frame, Channel, Frame, ProtocolError, CHUNK_SIZE,
    MAX_FRAME_LEN,
};
pub use message::{Request, Response, PROTOCOL_VERSION};
pub use status::{status_code, AGENT_TOKEN_ENV, DEFAULT_AGENT_PORT, STATUS_PATH};
