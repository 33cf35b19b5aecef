// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Accept loop.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use kubejob_wire::{ProtocolError, STATUS_PATH};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::{self, SessionError};

/// Settings for one agent process
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Token every session must present in its Hello
    pub token: String,
    /// Sentinel file written by `Finish`
    pub status_path: PathBuf,
}

impl ServerConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into(), status_path: PathBuf::from(STATUS_PATH) }
    }

    pub fn status_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.status_path = path.into();
        self
    }
}

/// Agent listening for controller sessions
pub struct AgentServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl AgentServer {
    pub async fn bind(addr: &str, config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config: Arc::new(config) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve sessions until `shutdown` fires, one task per connection
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "agent listening");
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "session opened");
                    let config = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        if let Err(e) = session::handle(stream, &config).await {
                            log_session_error(e);
                        }
                    });
                }
                Err(e) => error!("accept error: {e}"),
            }
        }
    }
}

fn log_session_error(e: SessionError) {
    match e {
        SessionError::Protocol(ProtocolError::ConnectionClosed) => debug!("session closed"),
        SessionError::Unauthorized => warn!("rejected session with invalid token"),
        _ => error!("session error: {e}"),
    }
}
