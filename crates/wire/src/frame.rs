// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channel-tagged, length-prefixed framing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in a single frame (16 MiB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Chunk size used when streaming archive bytes
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Errors from reading or writing frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unknown channel tag: {0}")]
    UnknownChannel(u8),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unexpected frame on {0:?} channel")]
    UnexpectedFrame(Channel),

    /// The local sink failed; the session itself is still in sync
    #[error("sink error: {0}")]
    Sink(std::io::Error),
}

/// Logical stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// JSON request or response
    Control,
    Stdout,
    Stderr,
    /// Archive bytes; an empty payload ends the archive
    Data,
}

impl Channel {
    fn tag(self) -> u8 {
        match self {
            Channel::Control => 0,
            Channel::Stdout => 1,
            Channel::Stderr => 2,
            Channel::Data => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Channel::Control),
            1 => Ok(Channel::Stdout),
            2 => Ok(Channel::Stderr),
            3 => Ok(Channel::Data),
            other => Err(ProtocolError::UnknownChannel(other)),
        }
    }
}

/// A single frame on an agent session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: Channel,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(channel: Channel, payload: Vec<u8>) -> Self {
        Self { channel, payload }
    }

    /// Encode a control message as JSON
    pub fn control<T: Serialize>(message: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(Channel::Control, serde_json::to_vec(message)?))
    }

    /// Terminator for a stream of `Data` frames
    pub fn end_of_data() -> Self {
        Self::new(Channel::Data, Vec::new())
    }

    pub fn is_end_of_data(&self) -> bool {
        self.channel == Channel::Data && self.payload.is_empty()
    }

    /// Decode the payload of a control frame
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        if self.channel != Channel::Control {
            return Err(ProtocolError::UnexpectedFrame(self.channel));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Read one frame. A clean EOF before the tag byte is `ConnectionClosed`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    };
    let channel = Channel::from_tag(tag)?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { size: len, max: MAX_FRAME_LEN });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { channel, payload })
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if frame.payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut header = [0u8; 5];
    header[0] = frame.channel.tag();
    header[1..].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Stream `source` as `Data` frames followed by the end-of-data marker.
///
/// Returns the number of payload bytes sent.
pub async fn send_data<R, W>(source: &mut R, writer: &mut W) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_frame(writer, &Frame::new(Channel::Data, buf[..n].to_vec())).await?;
        total += n as u64;
    }
    write_frame(writer, &Frame::end_of_data()).await?;
    Ok(total)
}

/// Receive `Data` frames into `sink` until the end-of-data marker.
///
/// The sink is shut down afterwards so a reader on the other side of a pipe
/// sees EOF. A failing sink does not stop the drain: remaining frames are
/// consumed so the session stays in sync, then `Sink` is returned. Any
/// non-data frame is a protocol violation.
pub async fn recv_data<R, W>(reader: &mut R, sink: &mut W) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut sink_error = None;
    loop {
        let frame = read_frame(reader).await?;
        if frame.channel != Channel::Data {
            return Err(ProtocolError::UnexpectedFrame(frame.channel));
        }
        if frame.is_end_of_data() {
            break;
        }
        if sink_error.is_none() {
            if let Err(e) = sink.write_all(&frame.payload).await {
                sink_error = Some(e);
            }
        }
        total += frame.payload.len() as u64;
    }
    if sink_error.is_none() {
        if let Err(e) = sink.shutdown().await {
            sink_error = Some(e);
        }
    }
    match sink_error {
        Some(e) => Err(ProtocolError::Sink(e)),
        None => Ok(total),
    }
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
