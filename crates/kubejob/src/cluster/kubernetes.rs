// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! [`Cluster`] backed by a kube-rs client.

use async_trait::async_trait;
use futures_util::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::client::UpgradeConnectionError;
use kube::Client;
use tokio::io::AsyncWriteExt;

use super::{Cluster, ClusterError, ExecIo, ExecOutcome, LineStream, PodStream};
use crate::protocol::StreamProtocol;

/// kube-rs upgrades exec connections with the v4 channel subprotocol
const SUPPORTED: &[StreamProtocol] = &[StreamProtocol::V4];

pub struct KubeCluster {
    namespace: String,
    jobs: Api<Job>,
    pods: Api<Pod>,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            jobs: Api::namespaced(client.clone(), &namespace),
            pods: Api::namespaced(client, &namespace),
            namespace,
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(resp.message),
            kube::Error::Api(resp) => ClusterError::Api { code: resp.code, message: resp.message },
            kube::Error::UpgradeConnection(UpgradeConnectionError::ProtocolSwitch(status))
                if status.as_u16() == 404 =>
            {
                ClusterError::NotFound(format!("exec upgrade rejected: {status}"))
            }
            other => ClusterError::Stream(other.to_string()),
        }
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_job(&self, job: &Job) -> Result<Job, ClusterError> {
        Ok(self.jobs.create(&PostParams::default(), job).await?)
    }

    async fn delete_job(&self, name: &str) -> Result<(), ClusterError> {
        self.jobs.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let list = self.pods.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        self.pods.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    fn watch_pods(&self, selector: &str) -> PodStream {
        let config = watcher::Config::default().labels(selector);
        watcher(self.pods.clone(), config)
            .default_backoff()
            .applied_objects()
            .map_err(|e| ClusterError::Stream(e.to_string()))
            .boxed()
    }

    async fn follow_logs(&self, pod: &str, container: &str) -> Result<LineStream, ClusterError> {
        let params = LogParams {
            follow: true,
            container: Some(container.to_string()),
            ..LogParams::default()
        };
        let reader = self.pods.log_stream(pod, &params).await?;
        Ok(reader.lines().map_err(ClusterError::from).boxed())
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        protocols: &[StreamProtocol],
        io: ExecIo<'_>,
    ) -> Result<ExecOutcome, ClusterError> {
        let protocol = StreamProtocol::negotiate(protocols, SUPPORTED);
        let params = AttachParams::default()
            .container(container)
            .stdin(io.stdin.is_some())
            .stdout(true)
            .stderr(true);
        tracing::debug!(pod, container, ?command, %protocol, "exec");

        let mut process = self.pods.exec(pod, command, &params).await?;
        let status = process.take_status();
        let remote_stdin = process.stdin();
        let remote_stdout = process.stdout();
        let remote_stderr = process.stderr();
        let ExecIo { stdin, stdout, stderr } = io;

        let feed = async {
            if let (Some(source), Some(mut sink)) = (stdin, remote_stdin) {
                tokio::io::copy(source, &mut sink).await?;
                sink.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let out = async {
            if let Some(mut source) = remote_stdout {
                tokio::io::copy(&mut source, stdout).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let err = async {
            if let Some(mut source) = remote_stderr {
                tokio::io::copy(&mut source, stderr).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        tokio::try_join!(feed, out, err)?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        process.join().await.map_err(|e| ClusterError::Stream(e.to_string()))?;
        Ok(ExecOutcome { protocol, status })
    }
}

#[cfg(test)]
#[path = "kubernetes_tests.rs"]
mod tests;
