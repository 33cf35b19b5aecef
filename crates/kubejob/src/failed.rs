// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workload failure reporting.

use std::fmt;

use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod};

/// Termination reason the kubelet records for a non-zero exit
const ERROR_REASON: &str = "Error";

/// A job whose workload failed: either the pod reached the `Failed` phase or
/// a command run through a [`JobExecutor`](crate::JobExecutor) did not
/// succeed.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pod: Pod,
    containers: Vec<String>,
    exit_code: Option<i32>,
    output: Vec<u8>,
    cause: Option<String>,
}

impl FailedJob {
    /// Failure of a pod that reached the `Failed` phase
    pub fn from_pod(pod: Pod) -> Self {
        let containers = errored_containers(&pod);
        Self { pod, containers, exit_code: None, output: Vec::new(), cause: None }
    }

    /// Failure of a command run in `container`
    pub(crate) fn from_exec(
        pod: Pod,
        container: &str,
        exit_code: Option<i32>,
        output: Vec<u8>,
        cause: Option<String>,
    ) -> Self {
        Self { pod, containers: vec![container.to_string()], exit_code, output, cause }
    }

    /// Pod snapshot at the time of failure
    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    /// Names of the failed containers, init containers first, each group in
    /// pod spec order.
    pub fn failed_container_names(&self) -> &[String] {
        &self.containers
    }

    /// Specs of the failed containers, in the same order as the names
    pub fn failed_containers(&self) -> Vec<Container> {
        let Some(spec) = self.pod.spec.as_ref() else {
            return Vec::new();
        };
        let all: Vec<&Container> =
            spec.init_containers.iter().flatten().chain(spec.containers.iter()).collect();
        self.containers
            .iter()
            .filter_map(|name| all.iter().find(|c| c.name == *name).map(|c| (*c).clone()))
            .collect()
    }

    /// Exit code of the failed command, when one was reported
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Combined stdout and stderr of the failed command
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Underlying transport or handler error, if the failure was not a
    /// plain non-zero exit
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }
}

impl fmt::Display for FailedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("job failed")?;
        if !self.containers.is_empty() {
            write!(f, " (containers: {})", self.containers.join(", "))?;
        }
        if let Some(code) = self.exit_code {
            write!(f, ": exit code {code}")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FailedJob {}

fn errored_containers(pod: &Pod) -> Vec<String> {
    let (Some(spec), Some(status)) = (pod.spec.as_ref(), pod.status.as_ref()) else {
        return Vec::new();
    };
    let init = errored_in(spec.init_containers.iter().flatten(), status.init_container_statuses.as_deref());
    let main = errored_in(spec.containers.iter(), status.container_statuses.as_deref());
    init.chain(main).collect()
}

fn errored_in<'a>(
    containers: impl Iterator<Item = &'a Container> + 'a,
    statuses: Option<&'a [ContainerStatus]>,
) -> impl Iterator<Item = String> + 'a {
    let statuses = statuses.unwrap_or_default();
    containers.filter_map(move |container| {
        let status = statuses.iter().find(|s| s.name == container.name)?;
        let terminated = status.state.as_ref()?.terminated.as_ref()?;
        (terminated.reason.as_deref() == Some(ERROR_REASON)).then(|| container.name.clone())
    })
}

#[cfg(test)]
#[path = "failed_tests.rs"]
mod tests;
