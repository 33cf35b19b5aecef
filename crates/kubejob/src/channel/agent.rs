// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channel to a `kubejob-agent` running inside the container.
//!
//! The agent listens on the pod IP. Each session starts with a token
//! handshake and then serves requests one at a time; idle sessions are
//! pooled so concurrent callers each get their own connection.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use kubejob_wire::{
    archive, read_frame, recv_data, send_data, write_frame, Channel, Frame, ProtocolError, Request,
    Response, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{ChannelError, RemoteChannel};
use crate::cluster::ExecIo;
use crate::env;
use crate::error::JobError;
use crate::handshake::AgentLaunch;
use crate::macros::setters;

/// Which containers run an agent, and where it is installed.
///
/// Containers get consecutive ports starting at [`port`](Self::port), in
/// the order they appear in their container list.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    paths: HashMap<String, String>,
    port: u16,
    ready_attempts: usize,
    ready_poll: Duration,
}

impl AgentConfig {
    /// Map of container name to the absolute path of the agent binary
    /// inside that container's image.
    pub fn new<K, V>(paths: impl IntoIterator<Item = (K, V)>) -> Result<Self, JobError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut validated = HashMap::new();
        for (container, path) in paths {
            let (container, path) = (container.into(), path.into());
            if container.is_empty() {
                return Err(JobError::InvalidAgentConfig("container name is empty".into()));
            }
            if !path.starts_with('/') {
                return Err(JobError::InvalidAgentConfig(format!(
                    "agent path for {container} must be absolute, got {path:?}"
                )));
            }
            validated.insert(container, path);
        }
        Ok(Self {
            paths: validated,
            port: env::agent_port(),
            ready_attempts: env::agent_ready_attempts(),
            ready_poll: env::agent_ready_poll(),
        })
    }

    setters! {
        set { port: u16, ready_attempts: usize, ready_poll: Duration }
    }

    pub fn path_for(&self, container: &str) -> Option<&str> {
        self.paths.get(container).map(String::as_str)
    }

    /// Launch settings for the container at `index`, if it runs an agent
    pub(crate) fn launch(&self, container: &str, index: usize, token: &str) -> Option<AgentLaunch> {
        let path = self.path_for(container)?;
        let offset = u16::try_from(index).unwrap_or(u16::MAX);
        Some(AgentLaunch {
            path: path.to_string(),
            port: self.port.saturating_add(offset),
            token: token.to_string(),
        })
    }

    pub(crate) fn connect_to(&self, pod_ip: Option<&str>, launch: &AgentLaunch) -> AgentChannel {
        let addr = pod_ip
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .map(|ip| SocketAddr::new(ip, launch.port));
        AgentChannel {
            addr,
            token: launch.token.clone(),
            ready_attempts: self.ready_attempts.max(1),
            ready_poll: self.ready_poll,
            idle: Mutex::new(Vec::new()),
        }
    }
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Session {
    async fn send(&mut self, request: &Request) -> Result<(), ChannelError> {
        write_frame(&mut self.writer, &Frame::control(request)?).await?;
        Ok(())
    }

    async fn response(&mut self) -> Result<Response, ChannelError> {
        let frame = read_frame(&mut self.reader).await?;
        Ok(frame.decode()?)
    }

    async fn expect_done(&mut self) -> Result<(), ChannelError> {
        match self.response().await? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> ChannelError {
    match response {
        Response::Error { message } => ChannelError::Agent(message),
        other => ChannelError::Agent(format!("unexpected response: {other:?}")),
    }
}

pub(crate) struct AgentChannel {
    addr: Option<SocketAddr>,
    token: String,
    ready_attempts: usize,
    ready_poll: Duration,
    idle: Mutex<Vec<Session>>,
}

impl AgentChannel {
    async fn checkout(&self) -> Result<Session, ChannelError> {
        let idle = self.idle.lock().pop();
        match idle {
            Some(session) => Ok(session),
            None => self.connect().await,
        }
    }

    fn checkin(&self, session: Session) {
        self.idle.lock().push(session);
    }

    /// Return the session to the pool unless `result` left it out of sync
    fn release<T>(&self, session: Session, result: &Result<T, ChannelError>) {
        if matches!(result, Ok(_) | Err(ChannelError::Agent(_))) {
            self.checkin(session);
        }
    }

    async fn connect(&self) -> Result<Session, ChannelError> {
        let addr = self.addr.ok_or(ChannelError::NoPodIp)?;
        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt + 1 < self.ready_attempts => {
                    tracing::debug!(%addr, attempt, error = %e, "agent not ready");
                    attempt += 1;
                    tokio::time::sleep(self.ready_poll).await;
                }
                Err(_) => {
                    return Err(ChannelError::AgentUnavailable {
                        addr: addr.to_string(),
                        attempts: self.ready_attempts,
                    })
                }
            }
        };

        let (reader, writer) = stream.into_split();
        let mut session = Session { reader: BufReader::new(reader), writer };
        session
            .send(&Request::Hello { token: self.token.clone(), version: PROTOCOL_VERSION.to_string() })
            .await?;
        match session.response().await? {
            Response::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    tracing::warn!(%addr, agent = %version, client = PROTOCOL_VERSION, "agent version mismatch");
                }
                Ok(session)
            }
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl RemoteChannel for AgentChannel {
    async fn exec(&self, command: &[String], io: ExecIo<'_>) -> Result<i32, ChannelError> {
        let ExecIo { stdout, stderr, .. } = io;
        let mut session = self.checkout().await?;
        session.send(&Request::Exec { command: command.to_vec() }).await?;
        loop {
            let frame = read_frame(&mut session.reader).await?;
            match frame.channel {
                Channel::Stdout => stdout.write_all(&frame.payload).await?,
                Channel::Stderr => stderr.write_all(&frame.payload).await?,
                Channel::Control => {
                    let result = match frame.decode()? {
                        Response::Exited { exit_code } => Ok(exit_code),
                        other => Err(unexpected(other)),
                    };
                    self.release(session, &result);
                    return result;
                }
                Channel::Data => return Err(ProtocolError::UnexpectedFrame(Channel::Data).into()),
            }
        }
    }

    async fn finish(&self, exit_code: i32) -> Result<(), ChannelError> {
        let mut session = self.checkout().await?;
        session.send(&Request::Finish { exit_code }).await?;
        let done = session.expect_done().await;
        self.release(session, &done);
        done
    }

    async fn copy_to(&self, local: &Path, remote: &str) -> Result<(), ChannelError> {
        let mut session = self.checkout().await?;
        let (mut reader, pack) = archive::spawn_pack(local.to_path_buf());
        session.send(&Request::CopyToPod { dest: remote.to_string() }).await?;
        send_data(&mut reader, &mut session.writer).await?;
        let packed = pack.await?;
        let done = session.expect_done().await;
        self.release(session, &done);
        packed?;
        done
    }

    async fn copy_from(&self, remote: &str, local: &Path) -> Result<(), ChannelError> {
        let mut session = self.checkout().await?;
        session.send(&Request::CopyFromPod { src: remote.to_string() }).await?;
        let (mut writer, unpack) = archive::spawn_unpack(local.to_path_buf());
        let received = recv_data(&mut session.reader, &mut writer).await;
        drop(writer);
        let unpacked = unpack.await?;
        match received {
            Ok(_) | Err(ProtocolError::Sink(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let done = session.expect_done().await;
        self.release(session, &done);
        done?;
        unpacked?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
