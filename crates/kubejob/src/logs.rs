// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log multiplexing.
//!
//! Every container of the job pod gets a tailer that follows its log and
//! forwards lines onto one bounded channel. A single consumer hands them
//! to the container logger (or stderr). Each tailer emits exactly one
//! finished event, after all of its lines.

use std::sync::Arc;

use futures_util::future::try_join_all;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Container, Pod};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::error::JobError;
use crate::handshake::is_wrapped;
use crate::macros::simple_display;

/// Capacity of the log channel; producers wait when it is full
pub(crate) const LOG_BUFFER: usize = 1024;

/// One line of container output, or the end of a container's stream
#[derive(Debug, Clone)]
pub struct ContainerLog {
    pub pod: Arc<Pod>,
    pub container: Arc<Container>,
    pub log: String,
    pub is_finished: bool,
}

pub(crate) type ContainerLogger = Arc<dyn Fn(&ContainerLog) + Send + Sync>;
pub(crate) type PlainLogger = Arc<dyn Fn(&str) + Send + Sync>;

/// Verbosity of the library's own messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

simple_display! {
    LogLevel {
        None => "none",
        Error => "error",
        Warn => "warn",
        Info => "info",
        Debug => "debug",
    }
}

/// Library messages: always traced, and mirrored to the user's logger when
/// one is set and the level allows it.
#[derive(Clone, Default)]
pub(crate) struct Logger {
    sink: Option<PlainLogger>,
    level: LogLevel,
}

impl Logger {
    pub fn set_sink(&mut self, sink: PlainLogger) {
        self.sink = Some(sink);
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    pub fn error(&self, message: &str) {
        tracing::error!("{message}");
        self.emit(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!("{message}");
        self.emit(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!("{message}");
        self.emit(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!("{message}");
        self.emit(LogLevel::Debug, message);
    }

    fn emit(&self, level: LogLevel, message: &str) {
        if level > self.level {
            return;
        }
        if let Some(sink) = &self.sink {
            sink(message);
        }
    }
}

/// Which parts of container output reach the log channel
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogOptions {
    pub container_log: bool,
    pub command_log: bool,
    pub init_container_log: bool,
    pub init_command_log: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self { container_log: true, command_log: true, init_container_log: true, init_command_log: true }
    }
}

/// Producer handle for the log channel
#[derive(Clone)]
pub(crate) struct LogSink {
    tx: mpsc::Sender<ContainerLog>,
}

impl LogSink {
    pub fn channel() -> (Self, mpsc::Receiver<ContainerLog>) {
        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        (Self { tx }, rx)
    }

    pub async fn line(&self, pod: &Arc<Pod>, container: &Arc<Container>, log: String) {
        self.send(ContainerLog { pod: pod.clone(), container: container.clone(), log, is_finished: false })
            .await;
    }

    pub async fn finished(&self, pod: &Arc<Pod>, container: &Arc<Container>) {
        self.send(ContainerLog {
            pod: pod.clone(),
            container: container.clone(),
            log: String::new(),
            is_finished: true,
        })
        .await;
    }

    async fn send(&self, log: ContainerLog) {
        // The consumer outlives every producer; a closed channel means the
        // run is being torn down.
        let _ = self.tx.send(log).await;
    }
}

/// Deliver log events until every producer is gone
pub(crate) async fn drain(mut rx: mpsc::Receiver<ContainerLog>, logger: Option<ContainerLogger>) {
    while let Some(log) = rx.recv().await {
        match &logger {
            Some(logger) => logger(&log),
            None if !log.is_finished => eprintln!("{}", log.log),
            None => {}
        }
    }
}

/// Format a container command the way it is echoed into the log
pub(crate) fn command_line(command: &[String]) -> String {
    command.join(" ")
}

/// Per-group switches for one pod's tailers
#[derive(Debug, Clone, Copy)]
pub(crate) struct TailOptions {
    pub forward: bool,
    pub echo_command: bool,
}

/// Tail every container of `pod`: init containers one after another,
/// then main containers concurrently.
pub(crate) async fn stream_pod(
    cluster: Arc<dyn Cluster>,
    pod: Arc<Pod>,
    init: TailOptions,
    main: TailOptions,
    sink: LogSink,
    cancel: CancellationToken,
) -> Result<(), JobError> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(());
    };
    for container in spec.init_containers.iter().flatten() {
        let container = Arc::new(container.clone());
        tail_container(cluster.as_ref(), &pod, container, init, &sink, &cancel).await?;
    }
    let tailers = spec.containers.iter().map(|container| {
        tail_container(cluster.as_ref(), &pod, Arc::new(container.clone()), main, &sink, &cancel)
    });
    try_join_all(tailers).await?;
    Ok(())
}

async fn tail_container(
    cluster: &dyn Cluster,
    pod: &Arc<Pod>,
    container: Arc<Container>,
    options: TailOptions,
    sink: &LogSink,
    cancel: &CancellationToken,
) -> Result<(), JobError> {
    let result = forward_lines(cluster, pod, &container, options, sink, cancel).await;
    sink.finished(pod, &container).await;
    result.map_err(|source| JobError::Logs { container: container.name.clone(), source })
}

async fn forward_lines(
    cluster: &dyn Cluster,
    pod: &Arc<Pod>,
    container: &Arc<Container>,
    options: TailOptions,
    sink: &LogSink,
    cancel: &CancellationToken,
) -> Result<(), crate::cluster::ClusterError> {
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let mut lines = cluster.follow_logs(pod_name, &container.name).await?;
    if options.echo_command && !is_wrapped(container) {
        let mut command = container.command.clone().unwrap_or_default();
        command.extend(container.args.clone().unwrap_or_default());
        if !command.is_empty() {
            sink.line(pod, container, command_line(&command)).await;
        }
    }
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next() => line,
        };
        match line {
            Some(Ok(line)) if options.forward => sink.line(pod, container, line).await,
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "logs_tests.rs"]
mod tests;
