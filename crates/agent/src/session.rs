// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One controller session: Hello, then requests until the peer hangs up.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use kubejob_wire::{
    archive, read_frame, recv_data, send_data, status_code, write_frame, Channel, Frame,
    ProtocolError, Request, Response, CHUNK_SIZE, PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::server::ServerConfig;

/// Errors that end a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unauthorized")]
    Unauthorized,

    #[error("session must start with Hello")]
    MissingHello,
}

pub(crate) async fn handle(stream: TcpStream, config: &ServerConfig) -> Result<(), SessionError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    authenticate(&mut reader, &mut writer, config).await?;

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(ProtocolError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let request: Request = frame.decode()?;
        debug!(?request, "request");
        match request {
            Request::Exec { command } => exec(&command, &mut writer).await?,
            Request::CopyToPod { dest } => copy_to_pod(&dest, &mut reader, &mut writer).await?,
            Request::CopyFromPod { src } => copy_from_pod(&src, &mut writer).await?,
            Request::Finish { exit_code } => {
                let response = match write_status(&config.status_path, exit_code) {
                    Ok(()) => Response::Done,
                    Err(e) => failure(format!("failed to write status: {e}")),
                };
                respond(&mut writer, &response).await?;
            }
            Request::Hello { .. } => respond(&mut writer, &failure("already authenticated")).await?,
        }
    }
}

async fn authenticate<R, W>(reader: &mut R, writer: &mut W, config: &ServerConfig) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match read_frame(reader).await?.decode::<Request>()? {
        Request::Hello { token, .. } if token == config.token => {
            respond(writer, &Response::Hello { version: PROTOCOL_VERSION.to_string() }).await
        }
        Request::Hello { .. } => {
            let _ = respond(writer, &failure("unauthorized")).await;
            Err(SessionError::Unauthorized)
        }
        _ => {
            let _ = respond(writer, &failure("sessions must start with Hello")).await;
            Err(SessionError::MissingHello)
        }
    }
}

fn failure(message: impl Into<String>) -> Response {
    Response::Error { message: message.into() }
}

async fn respond<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<(), SessionError> {
    write_frame(writer, &Frame::control(response)?).await?;
    Ok(())
}

async fn exec<W: AsyncWrite + Unpin>(command: &[String], writer: &mut W) -> Result<(), SessionError> {
    let Some((program, args)) = command.split_first() else {
        return respond(writer, &failure("empty command")).await;
    };
    let spawned = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => return respond(writer, &failure(format!("failed to start {program}: {e}"))).await,
    };

    let (tx, mut rx) = mpsc::channel(16);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, Channel::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, Channel::Stderr, tx.clone()));
    }
    drop(tx);
    while let Some(frame) = rx.recv().await {
        write_frame(writer, &frame).await?;
    }

    let status = child.wait().await?;
    respond(writer, &Response::Exited { exit_code: exit_code(status) }).await
}

/// Forward one output pipe as frames until EOF
async fn pump<R: AsyncRead + Unpin>(mut source: R, channel: Channel, tx: mpsc::Sender<Frame>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(Frame::new(channel, buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

async fn copy_to_pod<R, W>(dest: &str, reader: &mut R, writer: &mut W) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut pipe, unpack) = archive::spawn_unpack(PathBuf::from(dest));
    let received = recv_data(reader, &mut pipe).await;
    drop(pipe);
    let unpacked = unpack.await;
    match received {
        Ok(_) | Err(ProtocolError::Sink(_)) => {}
        Err(e) => return Err(e.into()),
    }
    let response = match unpacked {
        Ok(Ok(path)) => {
            debug!(path = %path.display(), "unpacked archive");
            Response::Done
        }
        Ok(Err(e)) => failure(e.to_string()),
        Err(e) => failure(format!("unpack task failed: {e}")),
    };
    respond(writer, &response).await
}

async fn copy_from_pod<W: AsyncWrite + Unpin>(src: &str, writer: &mut W) -> Result<(), SessionError> {
    let (mut pipe, pack) = archive::spawn_pack(PathBuf::from(src));
    send_data(&mut pipe, writer).await?;
    let response = match pack.await {
        Ok(Ok(())) => Response::Done,
        Ok(Err(e)) => failure(e.to_string()),
        Err(e) => failure(format!("pack task failed: {e}")),
    };
    respond(writer, &response).await
}

/// Write the sentinel through a temporary file so readers never see a
/// partial value
fn write_status(path: &Path, exit_code: i32) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, format!("{}\n", status_code(exit_code)))?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
