// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for a job run.

use std::fmt;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::cluster::ClusterError;
use crate::failed::FailedJob;

/// Errors returned by [`Job`](crate::Job) runs and [`JobExecutor`](crate::JobExecutor) calls
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("invalid agent config: {0}")]
    InvalidAgentConfig(String),

    #[error("failed to create job: {0}")]
    Create(#[source] ClusterError),

    #[error("failed to watch pods: {0}")]
    Watch(#[source] ClusterError),

    #[error("pod watch ended before the job finished")]
    WatchEnded,

    #[error("failed to stream logs for container {container}: {source}")]
    Logs {
        container: String,
        #[source]
        source: ClusterError,
    },

    #[error(transparent)]
    Failed(Box<FailedJob>),

    #[error("container {container}: {source}")]
    Channel {
        container: String,
        #[source]
        source: ChannelError,
    },

    #[error("execution handler failed: {0}")]
    Handler(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("{}", cleanup_message(primary.as_deref(), errors))]
    Cleanup {
        primary: Option<Box<JobError>>,
        errors: Vec<CleanupError>,
    },
}

impl JobError {
    /// Wrap an arbitrary error raised inside an execution handler
    pub fn handler(err: impl fmt::Display) -> Self {
        JobError::Handler(err.to_string())
    }

    /// The workload failure behind this error, looking through cleanup
    /// aggregation.
    pub fn as_failed(&self) -> Option<&FailedJob> {
        match self {
            JobError::Failed(failed) => Some(failed),
            JobError::Cleanup { primary: Some(primary), .. } => primary.as_failed(),
            _ => None,
        }
    }

    /// Attach cleanup failures to the outcome of a run.
    pub(crate) fn with_cleanup(
        result: Result<(), JobError>,
        errors: Vec<CleanupError>,
    ) -> Result<(), JobError> {
        if errors.is_empty() {
            return result;
        }
        Err(JobError::Cleanup { primary: result.err().map(Box::new), errors })
    }
}

impl From<FailedJob> for JobError {
    fn from(failed: FailedJob) -> Self {
        JobError::Failed(Box::new(failed))
    }
}

/// A resource the run could not remove
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to delete job {name}: {source}")]
    DeleteJob {
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to list pods for cleanup: {0}")]
    ListPods(#[source] ClusterError),

    #[error("failed to delete pod {name}: {source}")]
    DeletePod {
        name: String,
        #[source]
        source: ClusterError,
    },
}

fn cleanup_message(primary: Option<&JobError>, errors: &[CleanupError]) -> String {
    let mut message = String::new();
    if let Some(primary) = primary {
        message.push_str(&primary.to_string());
        message.push('\n');
    }
    message.push_str("cleanup failed:");
    for error in errors {
        message.push_str("\n  ");
        message.push_str(&error.to_string());
    }
    message
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
