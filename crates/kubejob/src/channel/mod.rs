// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution channels into a running job container.
//!
//! [`JobExecutor`] is what an execution handler receives, one per
//! container. It owns the handshake and retry policy; the transport
//! underneath is either the API server's exec endpoint or a sidecar agent.

mod agent;
mod direct;

pub use agent::AgentConfig;
pub(crate) use agent::AgentChannel;
pub(crate) use direct::DirectChannel;

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Pod};
use kubejob_wire::{ArchiveError, ProtocolError};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;

use crate::cluster::{ClusterError, ExecIo};
use crate::error::JobError;
use crate::failed::FailedJob;
use crate::handshake::shell_argv;
use crate::logs::{command_line, LogSink, Logger};
use crate::retry::RetryPolicy;

/// Errors from a single channel operation
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("agent protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("agent at {addr} not reachable after {attempts} attempts")]
    AgentUnavailable { addr: String, attempts: usize },

    #[error("pod has no usable IP address")]
    NoPodIp,

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("container has no command to run")]
    EmptyCommand,

    #[error("{operation} exited with status {code}: {stderr}")]
    CommandFailed { operation: &'static str, code: i32, stderr: String },

    #[error("transfer task failed: {0}")]
    Task(String),
}

impl ChannelError {
    /// Pod or container not found; worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Cluster(e) if e.is_not_found())
    }
}

impl From<tokio::task::JoinError> for ChannelError {
    fn from(err: tokio::task::JoinError) -> Self {
        ChannelError::Task(err.to_string())
    }
}

/// Transport for commands, status writes and file transfer
#[async_trait]
pub(crate) trait RemoteChannel: Send + Sync {
    /// Run `command`, streaming its output into `io`; returns the exit code
    async fn exec(&self, command: &[String], io: ExecIo<'_>) -> Result<i32, ChannelError>;

    /// Write the handshake sentinel
    async fn finish(&self, exit_code: i32) -> Result<(), ChannelError>;

    async fn copy_to(&self, local: &Path, remote: &str) -> Result<(), ChannelError>;

    async fn copy_from(&self, remote: &str, local: &Path) -> Result<(), ChannelError>;
}

/// Shared in-memory sink; clones append to the same buffer, so stdout and
/// stderr interleave in arrival order.
#[derive(Clone, Default)]
pub(crate) struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl AsyncWrite for OutputBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Batches of output lines in flight between a command and the log channel
const LINE_BATCHES: usize = 64;

/// One output stream of a command. Keeps every byte in the shared buffer
/// and hands complete lines to the forwarder as they arrive.
struct LineTee {
    buffer: OutputBuffer,
    partial: Vec<u8>,
    lines: Option<PollSender<Vec<String>>>,
}

impl LineTee {
    fn new(buffer: OutputBuffer, lines: Option<PollSender<Vec<String>>>) -> Self {
        Self { buffer, partial: Vec::new(), lines }
    }

    /// Text after the last newline, if any
    fn into_partial(self) -> Option<String> {
        (!self.partial.is_empty()).then(|| String::from_utf8_lossy(&self.partial).into_owned())
    }
}

impl AsyncWrite for LineTee {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let Some(lines) = this.lines.as_mut() else {
            this.buffer.0.lock().extend_from_slice(buf);
            return Poll::Ready(Ok(buf.len()));
        };
        if buf.contains(&b'\n') && ready!(lines.poll_reserve(cx)).is_err() {
            // Forwarder is gone; keep collecting output only
            this.lines = None;
            this.partial.clear();
            this.buffer.0.lock().extend_from_slice(buf);
            return Poll::Ready(Ok(buf.len()));
        }
        this.buffer.0.lock().extend_from_slice(buf);
        this.partial.extend_from_slice(buf);
        let complete = take_lines(&mut this.partial);
        if !complete.is_empty() {
            let _ = lines.send_item(complete);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Split off every complete line, leaving the unterminated tail in `partial`
fn take_lines(partial: &mut Vec<u8>) -> Vec<String> {
    let Some(end) = partial.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };
    let tail = partial.split_off(end + 1);
    let complete = std::mem::replace(partial, tail);
    String::from_utf8_lossy(&complete).lines().map(str::to_string).collect()
}

/// Settings shared by every executor of a run
#[derive(Clone)]
pub(crate) struct ExecutorContext {
    pub logger: Logger,
    pub retry: RetryPolicy,
    pub sink: Option<LogSink>,
    pub echo_command: bool,
    pub forward_output: bool,
}

/// Runs the deferred command of one container, and moves files in and out
/// of it.
///
/// Cloning is cheap; clones drive the same container.
#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    container: Arc<Container>,
    command: Vec<String>,
    pod: Arc<Pod>,
    channel: Box<dyn RemoteChannel>,
    context: ExecutorContext,
    stopped: AtomicBool,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl JobExecutor {
    /// `container` carries the original command; `command` is that command
    /// followed by its args.
    pub(crate) fn new(
        container: Container,
        command: Vec<String>,
        pod: Arc<Pod>,
        channel: Box<dyn RemoteChannel>,
        context: ExecutorContext,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                container: Arc::new(container),
                command,
                pod,
                channel,
                context,
                stopped: AtomicBool::new(false),
                background: Mutex::new(None),
            }),
        }
    }

    /// Container spec with its original command restored
    pub fn container(&self) -> &Container {
        &self.inner.container
    }

    pub fn container_name(&self) -> &str {
        &self.inner.container.name
    }

    /// The deferred command: original command followed by its args
    pub fn command(&self) -> &[String] {
        &self.inner.command
    }

    /// Pod snapshot taken when the container became ready
    pub fn pod(&self) -> &Pod {
        &self.inner.pod
    }

    /// Run the command, then let the container exit with its status.
    ///
    /// Returns the combined stdout and stderr. A non-zero exit or transport
    /// failure is a [`FailedJob`] naming this container.
    pub async fn exec(&self) -> Result<Vec<u8>, JobError> {
        let result = self.run_command().await;
        let code = match &result {
            Ok(_) => 0,
            Err(failed) => failed.exit_code().unwrap_or(1),
        };
        self.write_status(code).await;
        result.map_err(JobError::from)
    }

    /// Run the command without ending the container
    pub async fn exec_only(&self) -> Result<Vec<u8>, JobError> {
        self.run_command().await.map_err(JobError::from)
    }

    /// Run the command in the background.
    ///
    /// Failures are logged, not returned. The container exits with status 0
    /// when the command ends or when the run stops it.
    pub fn exec_async(&self) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(failed) = this.run_command().await {
                this.inner.context.logger.error(&format!(
                    "background command in {} failed: {failed}",
                    this.container_name()
                ));
            }
            if !this.inner.stopped.load(Ordering::Acquire) {
                this.write_status(0).await;
            }
        });
        if let Some(previous) = self.inner.background.lock().replace(handle) {
            previous.abort();
        }
    }

    /// End the container with status 0 without running its command
    pub async fn stop(&self) -> Result<(), JobError> {
        self.inner.stopped.store(true, Ordering::Release);
        self.finish(0).await.map_err(|source| self.channel_error(source))
    }

    /// Copy a local file or directory into the container (`cp -r` rules)
    pub async fn copy_to_pod(&self, local: impl AsRef<Path>, remote: &str) -> Result<(), JobError> {
        let local = local.as_ref();
        self.inner.context.logger.debug(&format!(
            "copy {} to {}:{remote}",
            local.display(),
            self.container_name()
        ));
        let channel = &self.inner.channel;
        self.inner
            .context
            .retry
            .run("copy_to_pod", || channel.copy_to(local, remote))
            .await
            .map_err(|source| self.channel_error(source))
    }

    /// Copy a file or directory out of the container (`cp -r` rules)
    pub async fn copy_from_pod(&self, remote: &str, local: impl AsRef<Path>) -> Result<(), JobError> {
        let local = local.as_ref();
        self.inner.context.logger.debug(&format!(
            "copy {}:{remote} to {}",
            self.container_name(),
            local.display()
        ));
        let channel = &self.inner.channel;
        self.inner
            .context
            .retry
            .run("copy_from_pod", || channel.copy_from(remote, local))
            .await
            .map_err(|source| self.channel_error(source))
    }

    /// Stop a background command still running after the handler returned
    pub(crate) async fn stop_background(&self) {
        let running = self.inner.background.lock().as_ref().is_some_and(|h| !h.is_finished());
        if !running {
            return;
        }
        if let Err(e) = self.stop().await {
            self.inner.context.logger.warn(&format!("failed to stop {}: {e}", self.container_name()));
        }
    }

    pub(crate) fn abort_background(&self) {
        if let Some(handle) = self.inner.background.lock().take() {
            handle.abort();
        }
    }

    async fn run_command(&self) -> Result<Vec<u8>, FailedJob> {
        let inner = &self.inner;
        if inner.command.is_empty() {
            return Err(self.failed(None, Vec::new(), Some(ChannelError::EmptyCommand.to_string())));
        }
        if inner.context.echo_command {
            if let Some(sink) = &inner.context.sink {
                sink.line(&inner.pod, &inner.container, command_line(&inner.command)).await;
            }
        }

        let argv = shell_argv(&inner.command);
        inner.context.logger.debug(&format!("exec in {}: {}", self.container_name(), command_line(&argv)));
        let argv = argv.as_slice();
        match inner.context.retry.run("exec", || self.exec_once(argv)).await {
            Ok((output, code)) => {
                if code == 0 {
                    Ok(output)
                } else {
                    Err(self.failed(Some(code), output, None))
                }
            }
            Err(e) => Err(self.failed(None, Vec::new(), Some(e.to_string()))),
        }
    }

    /// Run `argv` once, forwarding output lines to the log channel while the
    /// command runs.
    async fn exec_once(&self, argv: &[String]) -> Result<(Vec<u8>, i32), ChannelError> {
        let buffer = OutputBuffer::default();
        let (tx, mut rx) = mpsc::channel::<Vec<String>>(LINE_BATCHES);
        let forwarding = self.output_sink().is_some();
        let sender = || forwarding.then(|| PollSender::new(tx.clone()));
        let mut stdout = LineTee::new(buffer.clone(), sender());
        let mut stderr = LineTee::new(buffer.clone(), sender());
        drop(tx);

        let channel = &self.inner.channel;
        let run = async move {
            let io = ExecIo { stdin: None, stdout: &mut stdout, stderr: &mut stderr };
            let code = channel.exec(argv, io).await;
            (code, [stdout.into_partial(), stderr.into_partial()])
        };
        let forward = async {
            while let Some(lines) = rx.recv().await {
                self.forward_lines(lines).await;
            }
        };
        let ((code, partial), ()) = tokio::join!(run, forward);
        self.forward_lines(partial.into_iter().flatten()).await;
        Ok((buffer.take(), code?))
    }

    /// Log channel for command output, when forwarding is on
    fn output_sink(&self) -> Option<&LogSink> {
        let context = &self.inner.context;
        context.sink.as_ref().filter(|_| context.forward_output)
    }

    async fn forward_lines(&self, lines: impl IntoIterator<Item = String>) {
        let Some(sink) = self.output_sink() else {
            return;
        };
        for line in lines {
            sink.line(&self.inner.pod, &self.inner.container, line).await;
        }
    }

    async fn finish(&self, code: i32) -> Result<(), ChannelError> {
        let channel = &self.inner.channel;
        self.inner.context.retry.run("finish", || channel.finish(code)).await
    }

    /// Handshake write whose failure is only logged
    async fn write_status(&self, code: i32) {
        if let Err(e) = self.finish(code).await {
            self.inner.context.logger.warn(&format!(
                "failed to write exit status {code} to {}: {e}",
                self.container_name()
            ));
        }
    }

    fn failed(&self, exit_code: Option<i32>, output: Vec<u8>, cause: Option<String>) -> FailedJob {
        FailedJob::from_exec((*self.inner.pod).clone(), self.container_name(), exit_code, output, cause)
    }

    fn channel_error(&self, source: ChannelError) -> JobError {
        JobError::Channel { container: self.container_name().to_string(), source }
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
