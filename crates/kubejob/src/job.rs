// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pod lifecycle controller.
//!
//! A run creates the job, watches its single pod and reacts to phase
//! changes: log tailers start once the pod runs (or ends), execution
//! handlers fire once per container, and the job and its pods are deleted
//! however the run ends.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use k8s_openapi::api::batch::v1::Job as JobDescriptor;
use k8s_openapi::api::core::v1::{Container, Pod};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{AgentConfig, DirectChannel, ExecutorContext, JobExecutor, RemoteChannel};
use crate::cluster::Cluster;
use crate::error::{CleanupError, JobError};
use crate::failed::FailedJob;
use crate::handshake::{wrap_container, AgentLaunch};
use crate::logs::{
    self, ContainerLog, ContainerLogger, LogLevel, LogOptions, LogSink, Logger, TailOptions,
};
use crate::macros::simple_display;
use crate::retry::RetryPolicy;

/// How long a finished run waits for queued log lines to be delivered
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type HandlerFuture = BoxFuture<'static, Result<(), JobError>>;
type ExecutionHandler = Box<dyn FnOnce(Vec<JobExecutor>) -> HandlerFuture + Send>;
type InitHandler = Arc<dyn Fn(JobExecutor) -> HandlerFuture + Send + Sync>;

/// Phase of the job's pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

simple_display! {
    PodPhase {
        Pending => "Pending",
        Running => "Running",
        Succeeded => "Succeeded",
        Failed => "Failed",
        Unknown => "Unknown",
    }
}

impl PodPhase {
    pub fn from_pod(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// A batch job ready to run. Built by [`JobBuilder`](crate::JobBuilder).
pub struct Job {
    cluster: Arc<dyn Cluster>,
    descriptor: JobDescriptor,
    label: String,
    log_options: LogOptions,
    container_logger: Option<ContainerLogger>,
    logger: Logger,
    agent: Option<AgentConfig>,
    retry: RetryPolicy,
    init_handler: Option<InitHandler>,
    pre_init: Option<(Container, InitHandler)>,
}

impl Job {
    pub(crate) fn new(cluster: Arc<dyn Cluster>, descriptor: JobDescriptor, label: String) -> Self {
        Self {
            cluster,
            descriptor,
            label,
            log_options: LogOptions::default(),
            container_logger: None,
            logger: Logger::default(),
            agent: None,
            retry: RetryPolicy::default(),
            init_handler: None,
            pre_init: None,
        }
    }

    /// The normalized descriptor, before any container is wrapped
    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    /// Selector matching this job's pods
    pub fn label_selector(&self) -> String {
        format!("{}={}", self.label, self.label)
    }

    /// Receive container output instead of having it printed to stderr
    pub fn set_container_logger(
        mut self,
        logger: impl Fn(&ContainerLog) + Send + Sync + 'static,
    ) -> Self {
        self.container_logger = Some(Arc::new(logger));
        self
    }

    /// Receive the library's own messages
    pub fn set_logger(mut self, logger: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.logger.set_sink(Arc::new(logger));
        self
    }

    pub fn set_log_level(mut self, level: LogLevel) -> Self {
        self.logger.set_level(level);
        self
    }

    pub fn disable_container_log(mut self) -> Self {
        self.log_options.container_log = false;
        self
    }

    pub fn disable_command_log(mut self) -> Self {
        self.log_options.command_log = false;
        self
    }

    pub fn disable_init_container_log(mut self) -> Self {
        self.log_options.init_container_log = false;
        self
    }

    pub fn disable_init_command_log(mut self) -> Self {
        self.log_options.init_command_log = false;
        self
    }

    /// Drive the containers named in `config` through their agents
    pub fn use_agent(mut self, config: AgentConfig) -> Self {
        self.agent = Some(config);
        self
    }

    pub fn set_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Hold every init container and call `handler` for each while it runs,
    /// in spec order.
    pub fn set_init_container_execution_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(JobExecutor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.init_handler = Some(Arc::new(move |executor: JobExecutor| -> HandlerFuture {
            Box::pin(handler(executor))
        }));
        self
    }

    /// Run `container` before every other init container, driven by
    /// `handler`.
    pub fn pre_init<F, Fut>(mut self, mut container: Container, handler: F) -> Self
    where
        F: Fn(JobExecutor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        if container.name.is_empty() {
            container.name = format!("kubejob-container-{}", Uuid::new_v4().simple());
        }
        let handler: InitHandler =
            Arc::new(move |executor: JobExecutor| -> HandlerFuture { Box::pin(handler(executor)) });
        self.pre_init = Some((container, handler));
        self
    }

    /// Run the containers' own commands and stream their logs until the pod
    /// finishes.
    ///
    /// A pod that ends in `Failed` is a [`FailedJob`]. Cancelling `cancel`
    /// ends the run early with `Ok(())`.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), JobError> {
        self.execute(cancel, None).await
    }

    /// Hold every main container at the status handshake and call `handler`
    /// once the pod runs, with one executor per main container in spec
    /// order.
    pub async fn run_with_execution_handler<F, Fut>(
        self,
        cancel: CancellationToken,
        handler: F,
    ) -> Result<(), JobError>
    where
        F: FnOnce(Vec<JobExecutor>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let handler: ExecutionHandler = Box::new(move |executors: Vec<JobExecutor>| -> HandlerFuture {
            Box::pin(handler(executors))
        });
        self.execute(cancel, Some(handler)).await
    }

    async fn execute(
        self,
        cancel: CancellationToken,
        handler: Option<ExecutionHandler>,
    ) -> Result<(), JobError> {
        let plan = self.prepare(handler.is_some());
        let created = self.cluster.create_job(&plan.descriptor).await.map_err(JobError::Create)?;
        let name = created.metadata.name.clone().unwrap_or_default();
        let selector = self.label_selector();
        tracing::info!(job = %name, namespace = self.cluster.namespace(), %selector, "created job");
        self.logger.debug(&format!("created job {name}"));
        let guard = CleanupGuard::arm(self.cluster.clone(), name, selector);

        let (sink, rx) = LogSink::channel();
        let mut drain = tokio::spawn(logs::drain(rx, self.container_logger.clone()));

        let mut supervisor = Supervisor::new(&self, plan, handler, sink);
        let result = supervisor.supervise(&cancel).await;
        supervisor.shutdown().await;

        if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut drain).await.is_err() {
            self.logger.warn("log delivery did not finish, dropping remaining lines");
            drain.abort();
        }

        let errors = guard.run().await;
        for error in &errors {
            self.logger.warn(&error.to_string());
        }
        JobError::with_cleanup(result, errors)
    }

    /// Copy the descriptor and wrap the containers that a handler drives
    fn prepare(&self, handler_mode: bool) -> Plan {
        let token = Uuid::new_v4().simple().to_string();
        let mut plan =
            Plan { descriptor: self.descriptor.clone(), init: HashMap::new(), main: HashMap::new() };
        let Some(spec) = plan.descriptor.spec.as_mut().and_then(|s| s.template.spec.as_mut()) else {
            return plan;
        };

        let pre_init = self.pre_init.as_ref().map(|(container, _)| container);
        if let Some(container) = pre_init {
            spec.init_containers.get_or_insert_with(Vec::new).insert(0, container.clone());
        }
        for (index, container) in spec.init_containers.iter_mut().flatten().enumerate() {
            let is_pre_init = pre_init.is_some_and(|c| c.name == container.name);
            if is_pre_init || self.init_handler.is_some() {
                plan.init.insert(container.name.clone(), self.wrap(container, index, &token));
            }
        }
        if handler_mode {
            for (index, container) in spec.containers.iter_mut().enumerate() {
                plan.main.insert(container.name.clone(), self.wrap(container, index, &token));
            }
        }
        plan
    }

    fn wrap(&self, container: &mut Container, index: usize, token: &str) -> Wrapped {
        let original = container.clone();
        let launch =
            self.agent.as_ref().and_then(|agent| agent.launch(&container.name, index, token));
        let command = wrap_container(container, launch.as_ref());
        Wrapped { original, command, launch }
    }

    fn init_tail(&self) -> TailOptions {
        let options = self.log_options;
        TailOptions {
            forward: options.init_container_log,
            echo_command: options.init_container_log && options.init_command_log,
        }
    }

    fn main_tail(&self) -> TailOptions {
        let options = self.log_options;
        TailOptions {
            forward: options.container_log,
            echo_command: options.container_log && options.command_log,
        }
    }
}

/// A container whose command waits on the status handshake
struct Wrapped {
    original: Container,
    command: Vec<String>,
    launch: Option<AgentLaunch>,
}

/// The descriptor as submitted, and the containers it holds back
struct Plan {
    descriptor: JobDescriptor,
    init: HashMap<String, Wrapped>,
    main: HashMap<String, Wrapped>,
}

/// State of one run between creation and cleanup
struct Supervisor<'a> {
    job: &'a Job,
    plan: Plan,
    handler: Option<ExecutionHandler>,
    sink: LogSink,
    stop: CancellationToken,
    tasks: JoinSet<Result<(), JobError>>,
    executors: Vec<JobExecutor>,
    live: AtomicBool,
    logs_started: bool,
    init_fired: HashSet<String>,
}

impl<'a> Supervisor<'a> {
    fn new(job: &'a Job, plan: Plan, handler: Option<ExecutionHandler>, sink: LogSink) -> Self {
        Self {
            job,
            plan,
            handler,
            sink,
            stop: CancellationToken::new(),
            tasks: JoinSet::new(),
            executors: Vec::new(),
            live: AtomicBool::new(false),
            logs_started: false,
            init_fired: HashSet::new(),
        }
    }

    /// Follow pod events until the pod finishes and every task is done, a
    /// task fails, or the run is cancelled.
    async fn supervise(&mut self, cancel: &CancellationToken) -> Result<(), JobError> {
        let mut events = self.job.cluster.watch_pods(&self.job.label_selector());
        let mut phase = None;
        let mut terminal: Option<Arc<Pod>> = None;
        loop {
            if let Some(pod) = &terminal {
                if self.tasks.is_empty() {
                    return outcome(pod);
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.job.logger.info("run cancelled");
                    return terminal.as_deref().map_or(Ok(()), outcome);
                }
                Some(joined) = self.tasks.join_next() => task_result(joined)?,
                event = events.next(), if terminal.is_none() => {
                    let pod = match event {
                        Some(Ok(pod)) => Arc::new(pod),
                        Some(Err(e)) => return Err(JobError::Watch(e)),
                        None => return Err(JobError::WatchEnded),
                    };
                    self.fire_init_handlers(&pod);
                    let current = PodPhase::from_pod(&pod);
                    if phase != Some(current) {
                        phase = Some(current);
                        let name = pod.metadata.name.as_deref().unwrap_or_default();
                        tracing::debug!(pod = name, phase = %current, "pod phase changed");
                        self.job.logger.debug(&format!("pod {name} is {current}"));
                        if current == PodPhase::Running {
                            self.on_running(&pod);
                        } else if current.is_terminal() {
                            self.start_logs(&pod);
                            terminal = Some(pod);
                        }
                    }
                }
            }
        }
    }

    /// Single-use gate for the live transition
    fn open_gate(&self) -> bool {
        !self.live.swap(true, Ordering::AcqRel)
    }

    fn on_running(&mut self, pod: &Arc<Pod>) {
        if !self.open_gate() {
            return;
        }
        self.start_logs(pod);
        let Some(handler) = self.handler.take() else {
            return;
        };
        let main = self.job.main_tail();
        let executors: Vec<JobExecutor> = pod
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .filter_map(|container| self.plan.main.get(&container.name))
            .map(|wrapped| self.executor(pod, wrapped, main))
            .collect();
        self.job.logger.debug(&format!("pod is running with {} held containers", executors.len()));
        self.executors.extend(executors.iter().cloned());
        let stoppable = executors.clone();
        self.tasks.spawn(async move {
            let result = handler(executors).await;
            if result.is_ok() {
                for executor in &stoppable {
                    executor.stop_background().await;
                }
            }
            result
        });
    }

    /// Call the init handler for each held init container that is running
    fn fire_init_handlers(&mut self, pod: &Arc<Pod>) {
        let running: Vec<String> = pod
            .status
            .iter()
            .flat_map(|s| s.init_container_statuses.iter().flatten())
            .filter(|s| s.state.as_ref().is_some_and(|state| state.running.is_some()))
            .map(|s| s.name.clone())
            .collect();
        let init = self.job.init_tail();
        for name in running {
            let Some(wrapped) = self.plan.init.get(&name) else {
                continue;
            };
            if !self.init_fired.insert(name.clone()) {
                continue;
            }
            let pre_init = self.job.pre_init.as_ref().filter(|(container, _)| container.name == name);
            let handler = pre_init.map(|(_, h)| h).or(self.job.init_handler.as_ref()).cloned();
            let Some(handler) = handler else {
                continue;
            };
            let executor = self.executor(pod, wrapped, init);
            self.job.logger.debug(&format!("init container {name} is running"));
            self.executors.push(executor.clone());
            self.tasks.spawn(async move {
                let result = handler(executor.clone()).await;
                if result.is_ok() {
                    executor.stop_background().await;
                }
                result
            });
        }
    }

    fn executor(&self, pod: &Arc<Pod>, wrapped: &Wrapped, tail: TailOptions) -> JobExecutor {
        let container = &wrapped.original.name;
        let channel: Box<dyn RemoteChannel> = match (&self.job.agent, &wrapped.launch) {
            (Some(agent), Some(launch)) => {
                let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.as_deref());
                Box::new(agent.connect_to(pod_ip, launch))
            }
            _ => {
                let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
                Box::new(DirectChannel::new(self.job.cluster.clone(), pod_name, container))
            }
        };
        let context = ExecutorContext {
            logger: self.job.logger.clone(),
            retry: self.job.retry.clone(),
            sink: Some(self.sink.clone()),
            echo_command: tail.echo_command,
            forward_output: tail.forward,
        };
        let (container, command) = (wrapped.original.clone(), wrapped.command.clone());
        JobExecutor::new(container, command, pod.clone(), channel, context)
    }

    fn start_logs(&mut self, pod: &Arc<Pod>) {
        if std::mem::replace(&mut self.logs_started, true) {
            return;
        }
        let cluster = self.job.cluster.clone();
        let (init, main) = (self.job.init_tail(), self.job.main_tail());
        let sink = self.sink.clone();
        let stop = self.stop.clone();
        let pod = pod.clone();
        self.tasks.spawn(logs::stream_pod(cluster, pod, init, main, sink, stop));
    }

    /// Stop every task and release the log channel
    async fn shutdown(self) {
        let Supervisor { stop, mut tasks, executors, .. } = self;
        stop.cancel();
        for executor in &executors {
            executor.abort_background();
        }
        tasks.shutdown().await;
    }
}

fn outcome(pod: &Pod) -> Result<(), JobError> {
    match PodPhase::from_pod(pod) {
        PodPhase::Failed => Err(FailedJob::from_pod(pod.clone()).into()),
        _ => Ok(()),
    }
}

fn task_result(joined: Result<Result<(), JobError>, JoinError>) -> Result<(), JobError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(JobError::Panicked(e.to_string())),
    }
}

/// Deletes the job and its pods; a guard dropped while armed does so in
/// the background.
struct CleanupGuard {
    cluster: Arc<dyn Cluster>,
    job: String,
    selector: String,
    armed: bool,
}

impl CleanupGuard {
    fn arm(cluster: Arc<dyn Cluster>, job: String, selector: String) -> Self {
        Self { cluster, job, selector, armed: true }
    }

    async fn run(mut self) -> Vec<CleanupError> {
        self.armed = false;
        cleanup(self.cluster.as_ref(), &self.job, &self.selector).await
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(job = %self.job, "no runtime left to clean up job");
            return;
        };
        let cluster = self.cluster.clone();
        let job = std::mem::take(&mut self.job);
        let selector = std::mem::take(&mut self.selector);
        runtime.spawn(async move {
            for error in cleanup(cluster.as_ref(), &job, &selector).await {
                tracing::warn!(%job, %error, "background cleanup failed");
            }
        });
    }
}

/// Delete the job, then every pod it left behind. Resources already gone
/// are not errors.
async fn cleanup(cluster: &dyn Cluster, job: &str, selector: &str) -> Vec<CleanupError> {
    let mut errors = Vec::new();
    if let Err(source) = cluster.delete_job(job).await {
        if !source.is_not_found() {
            errors.push(CleanupError::DeleteJob { name: job.to_string(), source });
        }
    }
    match cluster.list_pods(selector).await {
        Ok(pods) => {
            for name in pods.into_iter().filter_map(|pod| pod.metadata.name) {
                tracing::debug!(pod = %name, "deleting pod");
                if let Err(source) = cluster.delete_pod(&name).await {
                    if !source.is_not_found() {
                        errors.push(CleanupError::DeletePod { name, source });
                    }
                }
            }
        }
        Err(source) => errors.push(CleanupError::ListPods(source)),
    }
    errors
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
