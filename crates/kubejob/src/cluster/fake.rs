// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory [`Cluster`] that simulates a job's pod lifecycle.
//!
//! Creating a job creates one pod. Watching it drives the pod forward:
//! init containers run one at a time, then every main container starts.
//! Containers running the status-file wait loop stay running until a
//! status command is exec'd into them; any other container exits right
//! away with its scripted exit code. Other exec commands run on the local
//! host through `sh`, unless a scripted response matches.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateRunning, ContainerStateTerminated,
    ContainerStateWaiting, ContainerStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::{Cluster, ClusterError, ExecIo, ExecOutcome, LineStream, PodStream};
use crate::handshake::{is_wrapped, parse_status_command};
use crate::protocol::{exit_status, StreamProtocol};

/// A recorded exec call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeExecCall {
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    pub protocol: StreamProtocol,
}

#[derive(Debug, Clone)]
struct ScriptedExec {
    pattern: String,
    stdout: String,
    stderr: String,
    exit_code: i32,
}

struct FakeState {
    namespace: String,
    supported: Vec<StreamProtocol>,
    pod_ip: Option<String>,
    pod: Option<Pod>,
    watchers: Vec<mpsc::UnboundedSender<Result<Pod, ClusterError>>>,
    created: Vec<Job>,
    deleted_jobs: Vec<String>,
    deleted_pods: Vec<String>,
    exec_calls: Vec<FakeExecCall>,
    logs: HashMap<String, Vec<String>>,
    exit_codes: HashMap<String, i32>,
    scripted: Vec<ScriptedExec>,
    not_found_execs: u32,
    duplicate_running: usize,
    hold_pending: bool,
    fail_create: bool,
    fail_pod_delete: bool,
}

/// Fake cluster for tests; clones share state
#[derive(Clone)]
pub struct FakeCluster {
    inner: Arc<Mutex<FakeState>>,
    namespace: String,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new("default")
    }
}

impl FakeCluster {
    pub fn new(namespace: &str) -> Self {
        let state = FakeState {
            namespace: namespace.to_string(),
            supported: StreamProtocol::PREFERRED.to_vec(),
            pod_ip: Some("127.0.0.1".to_string()),
            pod: None,
            watchers: Vec::new(),
            created: Vec::new(),
            deleted_jobs: Vec::new(),
            deleted_pods: Vec::new(),
            exec_calls: Vec::new(),
            logs: HashMap::new(),
            exit_codes: HashMap::new(),
            scripted: Vec::new(),
            not_found_execs: 0,
            duplicate_running: 0,
            hold_pending: false,
            fail_create: false,
            fail_pod_delete: false,
        };
        Self { inner: Arc::new(Mutex::new(state)), namespace: namespace.to_string() }
    }

    /// Protocols the fake API server accepts for exec
    pub fn set_supported_protocols(&self, protocols: &[StreamProtocol]) {
        self.inner.lock().supported = protocols.to_vec();
    }

    /// End a held container as if its wait loop read `code`. Status writes
    /// made through an agent never reach the fake.
    pub fn finish_container(&self, container: &str, code: i32) {
        self.inner.lock().complete_handshake(container, code);
    }

    pub fn set_pod_ip(&self, ip: Option<&str>) {
        self.inner.lock().pod_ip = ip.map(str::to_string);
    }

    /// Log lines a container produces
    pub fn set_logs(&self, container: &str, lines: &[&str]) {
        self.inner
            .lock()
            .logs
            .insert(container.to_string(), lines.iter().map(|l| l.to_string()).collect());
    }

    /// Exit code of a container that is not waiting on the handshake
    pub fn set_exit_code(&self, container: &str, code: i32) {
        self.inner.lock().exit_codes.insert(container.to_string(), code);
    }

    /// Answer exec commands containing `pattern` without running them
    pub fn script_exec(&self, pattern: &str, stdout: &str, stderr: &str, exit_code: i32) {
        self.inner.lock().scripted.push(ScriptedExec {
            pattern: pattern.to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
        });
    }

    /// Fail the next `count` exec calls as if the pod were not found
    pub fn fail_execs_not_found(&self, count: u32) {
        self.inner.lock().not_found_execs = count;
    }

    /// Repeat the `Running` event `count` extra times
    pub fn duplicate_running_events(&self, count: usize) {
        self.inner.lock().duplicate_running = count;
    }

    /// Keep the pod `Pending` until [`release`](Self::release)
    pub fn hold_pending(&self) {
        self.inner.lock().hold_pending = true;
    }

    pub fn release(&self) {
        let mut state = self.inner.lock();
        state.hold_pending = false;
        state.advance();
    }

    pub fn fail_create(&self) {
        self.inner.lock().fail_create = true;
    }

    pub fn fail_pod_deletes(&self) {
        self.inner.lock().fail_pod_delete = true;
    }

    pub fn created_jobs(&self) -> Vec<Job> {
        self.inner.lock().created.clone()
    }

    pub fn deleted_jobs(&self) -> Vec<String> {
        self.inner.lock().deleted_jobs.clone()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.inner.lock().deleted_pods.clone()
    }

    pub fn exec_calls(&self) -> Vec<FakeExecCall> {
        self.inner.lock().exec_calls.clone()
    }

    /// Current pod snapshot
    pub fn pod(&self) -> Option<Pod> {
        self.inner.lock().pod.clone()
    }
}

fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    selector.split(',').filter(|s| !s.is_empty()).all(|pair| match pair.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(pair),
    })
}

fn waiting(name: &str) -> ContainerStatus {
    ContainerStatus {
        name: name.to_string(),
        state: Some(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("PodInitializing".into()),
                ..ContainerStateWaiting::default()
            }),
            ..ContainerState::default()
        }),
        ..ContainerStatus::default()
    }
}

fn set_running(status: &mut ContainerStatus) {
    status.ready = true;
    status.state = Some(ContainerState {
        running: Some(ContainerStateRunning::default()),
        ..ContainerState::default()
    });
}

fn set_terminated(status: &mut ContainerStatus, code: i32) {
    let reason = if code == 0 { "Completed" } else { "Error" };
    status.ready = false;
    status.state = Some(ContainerState {
        terminated: Some(ContainerStateTerminated {
            exit_code: code,
            reason: Some(reason.into()),
            ..ContainerStateTerminated::default()
        }),
        ..ContainerState::default()
    });
}

fn state_of(status: &ContainerStatus) -> (bool, Option<i32>) {
    let state = status.state.as_ref();
    let running = state.and_then(|s| s.running.as_ref()).is_some();
    let exit = state.and_then(|s| s.terminated.as_ref()).map(|t| t.exit_code);
    (running, exit)
}

impl FakeState {
    fn publish(&mut self) {
        let Some(pod) = self.pod.clone() else {
            return;
        };
        self.watchers.retain(|tx| tx.send(Ok(pod.clone())).is_ok());
    }

    fn exit_code_for(&self, container: &str) -> i32 {
        self.exit_codes.get(container).copied().unwrap_or(0)
    }

    /// Drive the pod forward until it waits on a handshake or finishes
    fn advance(&mut self) {
        if self.hold_pending {
            return;
        }
        loop {
            let Some(pod) = self.pod.as_ref() else {
                return;
            };
            let phase = pod.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_default();
            match phase.as_str() {
                "Pending" => {
                    if !self.step_init_containers() {
                        return;
                    }
                    self.start_main_containers();
                }
                "Running" => {
                    self.finish_plain_containers();
                    return;
                }
                _ => return,
            }
        }
    }

    /// Returns true once every init container has completed
    fn step_init_containers(&mut self) -> bool {
        let containers: Vec<Container> = self
            .pod
            .as_ref()
            .and_then(|p| p.spec.as_ref())
            .and_then(|s| s.init_containers.clone())
            .unwrap_or_default();
        for (index, container) in containers.iter().enumerate() {
            let Some(status) = self.init_status(index) else {
                return false;
            };
            match state_of(status) {
                (_, Some(0)) => continue,
                (_, Some(_)) => {
                    self.set_phase("Failed");
                    self.publish();
                    return false;
                }
                (true, None) => return false,
                (false, None) => {
                    if is_wrapped(container) {
                        if let Some(status) = self.init_status_mut(index) {
                            set_running(status);
                        }
                        self.publish();
                        return false;
                    }
                    let code = self.exit_code_for(&container.name);
                    if let Some(status) = self.init_status_mut(index) {
                        set_terminated(status, code);
                    }
                    self.publish();
                }
            }
        }
        true
    }

    fn start_main_containers(&mut self) {
        if let Some(status) = self.pod.as_mut().and_then(|p| p.status.as_mut()) {
            status.phase = Some("Running".into());
            for container in status.container_statuses.iter_mut().flatten() {
                set_running(container);
            }
        }
        for _ in 0..=self.duplicate_running {
            self.publish();
        }
    }

    fn finish_plain_containers(&mut self) {
        let containers: Vec<Container> = self
            .pod
            .as_ref()
            .and_then(|p| p.spec.as_ref())
            .map(|s| s.containers.clone())
            .unwrap_or_default();
        let mut changed = false;
        for container in containers.iter().filter(|c| !is_wrapped(c)) {
            let code = self.exit_code_for(&container.name);
            if let Some(status) = self.main_status_mut(&container.name) {
                if state_of(status).0 {
                    set_terminated(status, code);
                    changed = true;
                }
            }
        }
        if changed {
            self.publish();
        }
        self.settle();
    }

    /// Move a running pod to its terminal phase once all containers exited
    fn settle(&mut self) {
        let Some(statuses) =
            self.pod.as_ref().and_then(|p| p.status.as_ref()).and_then(|s| s.container_statuses.clone())
        else {
            return;
        };
        let exits: Vec<Option<i32>> = statuses.iter().map(|s| state_of(s).1).collect();
        if exits.iter().any(Option::is_none) {
            return;
        }
        let phase = if exits.iter().all(|c| *c == Some(0)) { "Succeeded" } else { "Failed" };
        self.set_phase(phase);
        self.publish();
    }

    fn set_phase(&mut self, phase: &str) {
        if let Some(status) = self.pod.as_mut().and_then(|p| p.status.as_mut()) {
            status.phase = Some(phase.to_string());
        }
    }

    fn init_status(&self, index: usize) -> Option<&ContainerStatus> {
        self.pod.as_ref()?.status.as_ref()?.init_container_statuses.as_ref()?.get(index)
    }

    fn init_status_mut(&mut self, index: usize) -> Option<&mut ContainerStatus> {
        self.pod.as_mut()?.status.as_mut()?.init_container_statuses.as_mut()?.get_mut(index)
    }

    fn main_status_mut(&mut self, name: &str) -> Option<&mut ContainerStatus> {
        self.pod
            .as_mut()?
            .status
            .as_mut()?
            .container_statuses
            .as_mut()?
            .iter_mut()
            .find(|s| s.name == name)
    }

    /// Status write into `container`: terminate it and move on
    fn complete_handshake(&mut self, container: &str, code: i32) {
        let Some(status) = self.pod.as_mut().and_then(|p| p.status.as_mut()) else {
            return;
        };
        let target = status
            .init_container_statuses
            .iter_mut()
            .flatten()
            .chain(status.container_statuses.iter_mut().flatten())
            .find(|s| s.name == container);
        if let Some(target) = target {
            set_terminated(target, code);
        }
        self.publish();
        let running = self
            .pod
            .as_ref()
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.phase.as_deref())
            == Some("Running");
        if running {
            self.settle();
        } else {
            self.advance();
        }
    }

    fn container_running(&self, pod: &str, container: &str) -> Result<(), ClusterError> {
        let current = self
            .pod
            .as_ref()
            .filter(|p| p.metadata.name.as_deref() == Some(pod))
            .ok_or_else(|| ClusterError::NotFound(format!("pods \"{pod}\" not found")))?;
        let status = current.status.as_ref();
        let running = status
            .into_iter()
            .flat_map(|s| {
                s.init_container_statuses.iter().flatten().chain(s.container_statuses.iter().flatten())
            })
            .find(|s| s.name == container)
            .map(|s| state_of(s).0)
            .unwrap_or(false);
        if running {
            Ok(())
        } else {
            Err(ClusterError::Api {
                code: 400,
                message: format!("container {container} is not running"),
            })
        }
    }
}

fn build_pod(job_name: &str, namespace: &str, job: &Job, pod_ip: Option<String>) -> Pod {
    let template = job.spec.as_ref().map(|s| s.template.clone()).unwrap_or_default();
    let spec = template.spec.unwrap_or_default();
    let init_statuses: Vec<ContainerStatus> =
        spec.init_containers.iter().flatten().map(|c| waiting(&c.name)).collect();
    let main_statuses: Vec<ContainerStatus> = spec.containers.iter().map(|c| waiting(&c.name)).collect();
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{job_name}-pod")),
            namespace: Some(namespace.to_string()),
            labels: template.metadata.and_then(|m| m.labels),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        status: Some(PodStatus {
            phase: Some("Pending".into()),
            pod_ip,
            init_container_statuses: Some(init_statuses),
            container_statuses: Some(main_statuses),
            ..PodStatus::default()
        }),
    }
}

async fn run_local(command: &[String], io: ExecIo<'_>) -> Result<i32, ClusterError> {
    let Some((program, args)) = command.split_first() else {
        return Err(ClusterError::Api { code: 400, message: "empty command".into() });
    };
    let ExecIo { stdin, stdout, stderr } = io;
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let child_stdin = child.stdin.take();
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();
    let feed = async {
        if let (Some(source), Some(mut sink)) = (stdin, child_stdin) {
            match tokio::io::copy(source, &mut sink).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
            let _ = sink.shutdown().await;
        }
        Ok(())
    };
    let out = async {
        if let Some(mut source) = child_stdout {
            tokio::io::copy(&mut source, stdout).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let err = async {
        if let Some(mut source) = child_stderr {
            tokio::io::copy(&mut source, stderr).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    tokio::try_join!(feed, out, err)?;
    let status = child.wait().await?;
    Ok(status.code().unwrap_or(1))
}

#[async_trait]
impl Cluster for FakeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_job(&self, job: &Job) -> Result<Job, ClusterError> {
        let mut state = self.inner.lock();
        if state.fail_create {
            return Err(ClusterError::Api { code: 403, message: "jobs is forbidden".into() });
        }
        let mut created = job.clone();
        let name = match (&job.metadata.name, &job.metadata.generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => format!("{prefix}fake"),
            (None, None) => {
                return Err(ClusterError::Api { code: 422, message: "name is required".into() })
            }
        };
        created.metadata.name = Some(name.clone());
        created.metadata.namespace = Some(state.namespace.clone());
        let pod = build_pod(&name, &state.namespace, job, state.pod_ip.clone());
        state.pod = Some(pod);
        state.created.push(created.clone());
        Ok(created)
    }

    async fn delete_job(&self, name: &str) -> Result<(), ClusterError> {
        self.inner.lock().deleted_jobs.push(name.to_string());
        Ok(())
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let state = self.inner.lock();
        Ok(state.pod.iter().filter(|p| matches_selector(p, selector)).cloned().collect())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.inner.lock();
        if state.fail_pod_delete {
            return Err(ClusterError::Api { code: 500, message: "etcd unavailable".into() });
        }
        state.deleted_pods.push(name.to_string());
        if state.pod.as_ref().and_then(|p| p.metadata.name.as_deref()) == Some(name) {
            state.pod = None;
        }
        Ok(())
    }

    fn watch_pods(&self, selector: &str) -> PodStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.lock();
            if let Some(pod) = state.pod.clone().filter(|p| matches_selector(p, selector)) {
                let _ = tx.send(Ok(pod));
            }
            state.watchers.push(tx);
            state.advance();
        }
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    async fn follow_logs(&self, pod: &str, container: &str) -> Result<LineStream, ClusterError> {
        let state = self.inner.lock();
        if state.pod.as_ref().and_then(|p| p.metadata.name.as_deref()) != Some(pod) {
            return Err(ClusterError::NotFound(format!("pods \"{pod}\" not found")));
        }
        let lines = state.logs.get(container).cloned().unwrap_or_default();
        Ok(stream::iter(lines.into_iter().map(Ok)).boxed())
    }

    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        protocols: &[StreamProtocol],
        io: ExecIo<'_>,
    ) -> Result<ExecOutcome, ClusterError> {
        let (protocol, scripted) = {
            let mut state = self.inner.lock();
            let protocol = StreamProtocol::negotiate(protocols, &state.supported);
            state.exec_calls.push(FakeExecCall {
                pod: pod.to_string(),
                container: container.to_string(),
                command: command.clone(),
                protocol,
            });
            if state.not_found_execs > 0 {
                state.not_found_execs -= 1;
                return Err(ClusterError::NotFound(format!("pods \"{pod}\" not found")));
            }
            state.container_running(pod, container)?;
            if let Some(code) = parse_status_command(&command) {
                state.complete_handshake(container, code);
                return Ok(ExecOutcome { protocol, status: Some(exit_status(0)) });
            }
            let joined = command.join(" ");
            let scripted = state.scripted.iter().find(|s| joined.contains(&s.pattern)).cloned();
            (protocol, scripted)
        };

        let code = match scripted {
            Some(scripted) => {
                io.stdout.write_all(scripted.stdout.as_bytes()).await?;
                io.stderr.write_all(scripted.stderr.as_bytes()).await?;
                scripted.exit_code
            }
            None => run_local(&command, io).await?,
        };
        Ok(ExecOutcome { protocol, status: Some(exit_status(code)) })
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
