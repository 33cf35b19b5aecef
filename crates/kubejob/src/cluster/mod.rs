// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane operations a job run needs.

mod kubernetes;

#[cfg(any(test, feature = "test-support"))]
mod fake;

#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeCluster, FakeExecCall};
pub use kubernetes::KubeCluster;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::{RemoteError, StreamProtocol};

/// Errors from the Kubernetes API
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl ClusterError {
    /// The target pod or container is gone (or not there yet)
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// Pod snapshots from a watch, in event order
pub type PodStream = BoxStream<'static, Result<Pod, ClusterError>>;

/// Lines of a followed container log
pub type LineStream = BoxStream<'static, Result<String, ClusterError>>;

/// Byte streams wired to a remote command
pub struct ExecIo<'a> {
    pub stdin: Option<&'a mut (dyn AsyncRead + Send + Unpin)>,
    pub stdout: &'a mut (dyn AsyncWrite + Send + Unpin),
    pub stderr: &'a mut (dyn AsyncWrite + Send + Unpin),
}

/// How a remote command ended
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub protocol: StreamProtocol,
    pub status: Option<Status>,
}

impl ExecOutcome {
    pub fn exit_code(&self) -> Result<i32, ClusterError> {
        Ok(self.protocol.exit_code(self.status.as_ref())?)
    }
}

/// Adapter over the Kubernetes API, scoped to one namespace
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    fn namespace(&self) -> &str;

    /// Create `job`, returning the stored object (with its final name)
    async fn create_job(&self, job: &Job) -> Result<Job, ClusterError>;

    /// Delete a job, letting its pods be collected in the background
    async fn delete_job(&self, name: &str) -> Result<(), ClusterError>;

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;

    /// Watch pods matching `selector`. Current pods are delivered first.
    fn watch_pods(&self, selector: &str) -> PodStream;

    /// Follow the log of one container until it terminates
    async fn follow_logs(&self, pod: &str, container: &str) -> Result<LineStream, ClusterError>;

    /// Run `command` in a container, negotiating from `protocols` in order
    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        protocols: &[StreamProtocol],
        io: ExecIo<'_>,
    ) -> Result<ExecOutcome, ClusterError>;
}
