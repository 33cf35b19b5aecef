// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Run batch workloads as Kubernetes Jobs and drive commands inside them.
//!
//! A [`Job`] creates the workload, watches its pod, streams container logs
//! and cleans up afterwards. With an execution handler, container commands
//! are held back by a status-file handshake and run on demand through
//! [`JobExecutor`]s, either over the API server's exec endpoint or through a
//! sidecar agent.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod macros;

mod builder;
mod channel;
pub mod cluster;
mod env;
mod error;
mod failed;
mod handshake;
mod job;
mod logs;
mod protocol;
mod retry;

pub use builder::JobBuilder;
pub use channel::{AgentConfig, ChannelError, JobExecutor};
pub use cluster::{Cluster, ClusterError, KubeCluster};
pub use error::{CleanupError, JobError};
pub use failed::FailedJob;
pub use job::{Job, PodPhase};
pub use logs::{ContainerLog, LogLevel};
pub use protocol::StreamProtocol;
pub use retry::RetryPolicy;

#[cfg(any(test, feature = "test-support"))]
pub use cluster::FakeCluster;
