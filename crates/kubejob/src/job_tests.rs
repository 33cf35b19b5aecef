// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::AtomicUsize;

use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kubejob_agent::{AgentServer, ServerConfig};
use kubejob_wire::AGENT_TOKEN_ENV;
use parking_lot::Mutex;

use super::*;
use crate::builder::JobBuilder;
use crate::cluster::FakeCluster;
use crate::handshake::is_wrapped;

const POD: &str = "test-job-pod";

fn container(name: &str, command: &[&str]) -> Container {
    Container {
        name: name.to_string(),
        image: Some("alpine".to_string()),
        command: Some(command.iter().map(|s| s.to_string()).collect()),
        ..Container::default()
    }
}

fn descriptor(init: Vec<Container>, containers: Vec<Container>) -> JobDescriptor {
    JobDescriptor {
        metadata: ObjectMeta { name: Some("test-job".to_string()), ..ObjectMeta::default() },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    init_containers: (!init.is_empty()).then_some(init),
                    containers,
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..JobDescriptor::default()
    }
}

fn job(fake: &FakeCluster, init: Vec<Container>, containers: Vec<Container>) -> Job {
    JobBuilder::new(Arc::new(fake.clone()))
        .build_with_job(descriptor(init, containers))
        .unwrap()
        .set_retry_policy(RetryPolicy::new(3).backoff(Duration::from_millis(1)))
}

/// Container log events in delivery order
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<(String, String, bool)>>>);

impl Captured {
    fn attach(&self, job: Job) -> Job {
        let events = self.0.clone();
        job.set_container_logger(move |log| {
            events.lock().push((log.container.name.clone(), log.log.clone(), log.is_finished));
        })
    }

    fn lines(&self, container: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|(name, _, finished)| name == container && !finished)
            .map(|(_, log, _)| log.clone())
            .collect()
    }

    fn finished(&self, container: &str) -> usize {
        self.0.lock().iter().filter(|(name, _, finished)| name == container && *finished).count()
    }
}

#[tokio::test]
async fn plain_run_streams_logs_and_cleans_up() {
    let fake = FakeCluster::default();
    fake.set_logs("test", &["go version go1.22.0 linux/amd64"]);
    let captured = Captured::default();
    let job = captured.attach(job(&fake, vec![], vec![container("test", &["go", "version"])]));

    job.run(CancellationToken::new()).await.unwrap();

    assert_eq!(captured.lines("test"), vec!["go version", "go version go1.22.0 linux/amd64"]);
    assert_eq!(captured.finished("test"), 1);
    assert_eq!(fake.deleted_jobs(), vec!["test-job"]);
    assert_eq!(fake.deleted_pods(), vec![POD]);
}

#[tokio::test]
async fn plain_run_keeps_container_commands() {
    let fake = FakeCluster::default();
    job(&fake, vec![], vec![container("test", &["go", "version"])])
        .run(CancellationToken::new())
        .await
        .unwrap();

    let created = fake.created_jobs();
    let spec = created[0].spec.as_ref().unwrap().template.spec.as_ref().unwrap();
    assert_eq!(spec.containers[0].command.as_deref(), Some(&["go".to_string(), "version".to_string()][..]));
    assert!(fake.exec_calls().is_empty());
}

#[tokio::test]
async fn disabled_logs_still_finish_every_container() {
    let fake = FakeCluster::default();
    fake.set_logs("test", &["output"]);
    let captured = Captured::default();
    let job = captured
        .attach(job(&fake, vec![], vec![container("test", &["go", "version"])]))
        .disable_container_log();

    job.run(CancellationToken::new()).await.unwrap();

    assert!(captured.lines("test").is_empty());
    assert_eq!(captured.finished("test"), 1);
}

#[tokio::test]
async fn disabled_command_log_skips_the_echo() {
    let fake = FakeCluster::default();
    fake.set_logs("test", &["output"]);
    let captured = Captured::default();
    let job = captured
        .attach(job(&fake, vec![], vec![container("test", &["go", "version"])]))
        .disable_command_log();

    job.run(CancellationToken::new()).await.unwrap();

    assert_eq!(captured.lines("test"), vec!["output"]);
}

#[tokio::test]
async fn failed_pod_reports_errored_containers() {
    let fake = FakeCluster::default();
    fake.set_exit_code("test", 1);

    let err = job(&fake, vec![], vec![container("test", &["false"])])
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    let failed = err.as_failed().unwrap();
    assert_eq!(failed.failed_container_names(), ["test"]);
    assert_eq!(fake.deleted_pods(), vec![POD]);
}

#[tokio::test]
async fn missing_file_fails_with_the_command_output() {
    let fake = FakeCluster::default();
    let job = job(&fake, vec![], vec![container("test", &["cat", "missingfile"])]);

    let err = job
        .run_with_execution_handler(CancellationToken::new(), |executors| async move {
            for executor in &executors {
                executor.exec().await?;
            }
            Ok(())
        })
        .await
        .unwrap_err();

    let failed = err.as_failed().unwrap();
    assert_eq!(failed.failed_container_names(), ["test"]);
    assert_eq!(failed.exit_code(), Some(1));
    let output = String::from_utf8_lossy(failed.output()).to_string();
    assert!(output.contains("No such file or directory"), "output: {output}");
    assert_eq!(fake.deleted_jobs(), vec!["test-job"]);
}

#[tokio::test]
async fn handler_mode_runs_commands_through_the_handshake() {
    let fake = FakeCluster::default();
    let captured = Captured::default();
    let job = captured.attach(job(&fake, vec![], vec![container("test", &["echo", "hello"])]));
    let outputs = Arc::new(Mutex::new(Vec::new()));
    let seen = outputs.clone();

    job.run_with_execution_handler(CancellationToken::new(), move |executors| async move {
        for executor in &executors {
            assert_eq!(executor.command(), ["echo", "hello"]);
            let output = executor.exec().await?;
            seen.lock().push(output);
        }
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(*outputs.lock(), vec![b"hello\n".to_vec()]);
    assert_eq!(captured.lines("test"), vec!["echo hello", "hello"]);
    assert_eq!(captured.finished("test"), 1);

    let created = fake.created_jobs();
    let spec = created[0].spec.as_ref().unwrap().template.spec.as_ref().unwrap();
    assert!(is_wrapped(&spec.containers[0]));
    let status = fake.exec_calls().last().unwrap().command.clone();
    assert_eq!(crate::handshake::parse_status_command(&status), Some(0));
}

fn agent_token(descriptor: &JobDescriptor) -> String {
    let spec = descriptor.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
    let env = spec.containers[0].env.as_ref().unwrap();
    env.iter().find(|var| var.name == AGENT_TOKEN_ENV).and_then(|var| var.value.clone()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_drives_the_held_container() {
    let fake = FakeCluster::default();
    fake.set_pod_ip(Some("127.0.0.1"));
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();
    let status_path = dir.path().join("status");
    let agent = AgentConfig::new([("main", "/opt/kubejob/agent")])
        .unwrap()
        .port(port)
        .ready_attempts(100)
        .ready_poll(Duration::from_millis(10));
    let job = job(&fake, vec![], vec![container("main", &["echo", "hello"])]).use_agent(agent);
    let shutdown = CancellationToken::new();
    let outputs = Arc::new(Mutex::new(Vec::new()));

    let (cluster, seen, stop, status) =
        (fake.clone(), outputs.clone(), shutdown.clone(), status_path.clone());
    job.run_with_execution_handler(CancellationToken::new(), move |executors| async move {
        // the wrapped container starts its agent with the token it was given
        let token = agent_token(&cluster.created_jobs()[0]);
        let config = ServerConfig::new(token).status_path(&status);
        let server = AgentServer::bind(&format!("127.0.0.1:{port}"), config).await.unwrap();
        tokio::spawn(server.run(stop));

        let output = executors[0].exec().await?;
        seen.lock().push(output);
        let code = std::fs::read_to_string(&status).unwrap().trim().parse().unwrap();
        cluster.finish_container("main", code);
        Ok(())
    })
    .await
    .unwrap();
    shutdown.cancel();

    assert_eq!(*outputs.lock(), vec![b"hello\n".to_vec()]);
    assert_eq!(std::fs::read_to_string(&status_path).unwrap(), "0\n");
    assert!(fake.exec_calls().is_empty(), "{:?}", fake.exec_calls());

    let created = fake.created_jobs();
    let main = &created[0].spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
    let script = &main.args.as_ref().unwrap()[0];
    assert!(script.contains(&format!("'/opt/kubejob/agent' serve --listen 0.0.0.0:{port}")), "{script}");
    assert!(!agent_token(&created[0]).is_empty());
}

#[tokio::test]
async fn sidecar_failure_names_only_the_main_container() {
    let fake = FakeCluster::default();
    fake.script_exec("serve-forever", "", "", 0);
    let job = job(
        &fake,
        vec![],
        vec![container("main", &["cat", "missingfile"]), container("sidecar", &["serve-forever"])],
    );

    let err = job
        .run_with_execution_handler(CancellationToken::new(), |executors| async move {
            executors[1].exec_async();
            executors[0].exec().await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.as_failed().unwrap().failed_container_names(), ["main"]);
}

#[tokio::test]
async fn cancel_inside_handler_is_ok_and_cleans_up() {
    let fake = FakeCluster::default();
    let job = job(&fake, vec![], vec![container("test", &["sleep", "60"])]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    job.run_with_execution_handler(cancel, move |_executors| async move {
        trigger.cancel();
        std::future::pending::<()>().await;
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(fake.deleted_jobs(), vec!["test-job"]);
    assert_eq!(fake.deleted_pods(), vec![POD]);
}

#[tokio::test]
async fn cancel_while_pending_is_ok_and_cleans_up() {
    let fake = FakeCluster::default();
    fake.hold_pending();
    let job = job(&fake, vec![], vec![container("test", &["true"])]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    job.run(cancel).await.unwrap();

    assert_eq!(fake.deleted_jobs(), vec!["test-job"]);
}

#[tokio::test]
async fn duplicate_running_events_fire_the_handler_once() {
    let fake = FakeCluster::default();
    fake.duplicate_running_events(3);
    let job = job(&fake, vec![], vec![container("test", &["true"])]);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    job.run_with_execution_handler(CancellationToken::new(), move |executors| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        for executor in &executors {
            executor.exec().await?;
        }
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handler_error_is_returned_after_cleanup() {
    let fake = FakeCluster::default();
    let job = job(&fake, vec![], vec![container("test", &["true"])]);

    let err = job
        .run_with_execution_handler(CancellationToken::new(), |_executors| async move {
            Err(JobError::handler("deploy step failed"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Handler(ref message) if message == "deploy step failed"));
    assert_eq!(fake.deleted_pods(), vec![POD]);
}

#[tokio::test]
async fn transient_exec_failures_are_retried() {
    let fake = FakeCluster::default();
    fake.fail_execs_not_found(2);
    let job = job(&fake, vec![], vec![container("test", &["echo", "ok"])]);

    job.run_with_execution_handler(CancellationToken::new(), |executors| async move {
        let output = executors[0].exec().await?;
        assert_eq!(output, b"ok\n");
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(fake.exec_calls().len(), 4);
}

#[tokio::test]
async fn init_handler_fires_once_per_init_container() {
    let fake = FakeCluster::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let job = job(
        &fake,
        vec![container("setup", &["true"]), container("migrate", &["echo", "migrated"])],
        vec![container("test", &["true"])],
    )
    .set_init_container_execution_handler(move |executor| {
        let record = record.clone();
        async move {
            record.lock().push(executor.container_name().to_string());
            executor.exec().await?;
            Ok(())
        }
    });

    job.run(CancellationToken::new()).await.unwrap();

    assert_eq!(*seen.lock(), vec!["setup", "migrate"]);
}

#[tokio::test]
async fn pre_init_container_runs_first_and_alone_is_held() {
    let fake = FakeCluster::default();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let job = job(&fake, vec![container("setup", &["true"])], vec![container("test", &["true"])])
        .pre_init(container("fetch", &["echo", "fetched"]), move |executor| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                executor.exec().await?;
                Ok(())
            }
        });

    job.run(CancellationToken::new()).await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let created = fake.created_jobs();
    let init = created[0].spec.as_ref().unwrap().template.spec.as_ref().unwrap().init_containers.clone().unwrap();
    let names: Vec<&str> = init.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["fetch", "setup"]);
    assert!(is_wrapped(&init[0]));
    assert!(!is_wrapped(&init[1]));
}

#[tokio::test]
async fn cleanup_failures_are_aggregated() {
    let fake = FakeCluster::default();
    fake.fail_pod_deletes();

    let err = job(&fake, vec![], vec![container("test", &["true"])])
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        JobError::Cleanup { primary: None, errors } => {
            assert_eq!(errors.len(), 1);
            assert!(matches!(&errors[0], CleanupError::DeletePod { name, .. } if name == POD));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fake.deleted_jobs(), vec!["test-job"]);
}

#[tokio::test]
async fn cleanup_failures_keep_the_workload_failure() {
    let fake = FakeCluster::default();
    fake.fail_pod_deletes();
    fake.set_exit_code("test", 2);

    let err = job(&fake, vec![], vec![container("test", &["false"])])
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Cleanup { primary: Some(_), .. }));
    assert_eq!(err.as_failed().unwrap().failed_container_names(), ["test"]);
}

#[tokio::test]
async fn create_failure_skips_cleanup() {
    let fake = FakeCluster::default();
    fake.fail_create();

    let err = job(&fake, vec![], vec![container("test", &["true"])])
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Create(_)));
    assert!(fake.deleted_jobs().is_empty());
}

#[tokio::test]
async fn logger_receives_messages_at_or_above_its_level() {
    let fake = FakeCluster::default();
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    let job = job(&fake, vec![], vec![container("test", &["true"])])
        .set_logger(move |message| sink.lock().push(message.to_string()))
        .set_log_level(LogLevel::Debug);

    job.run(CancellationToken::new()).await.unwrap();

    let messages = messages.lock();
    assert!(messages.iter().any(|m| m == "created job test-job"), "{messages:?}");
    assert!(messages.iter().any(|m| m.contains("is Succeeded")), "{messages:?}");
}

#[test]
fn pod_phase_from_status() {
    let pod = |phase: Option<&str>| Pod {
        status: Some(k8s_openapi::api::core::v1::PodStatus {
            phase: phase.map(str::to_string),
            ..Default::default()
        }),
        ..Pod::default()
    };
    assert_eq!(PodPhase::from_pod(&pod(Some("Running"))), PodPhase::Running);
    assert_eq!(PodPhase::from_pod(&pod(Some("Failed"))), PodPhase::Failed);
    assert_eq!(PodPhase::from_pod(&pod(None)), PodPhase::Unknown);
    assert!(PodPhase::Succeeded.is_terminal());
    assert!(!PodPhase::Pending.is_terminal());
}
