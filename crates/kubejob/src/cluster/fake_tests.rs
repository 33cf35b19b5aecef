// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::handshake::{status_command, wrap_container};
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use std::collections::BTreeMap;

fn job(containers: Vec<Container>) -> Job {
    Job {
        metadata: ObjectMeta { name: Some("sample".into()), ..ObjectMeta::default() },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([("app".to_string(), "sample".to_string())])),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec { containers, ..PodSpec::default() }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

fn container(name: &str) -> Container {
    Container { name: name.into(), command: Some(vec!["true".into()]), ..Container::default() }
}

fn phase(pod: &Pod) -> String {
    pod.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_default()
}

async fn phases(stream: &mut PodStream, count: usize) -> Vec<String> {
    let mut seen = Vec::new();
    for _ in 0..count {
        let pod = stream.next().await.unwrap().unwrap();
        seen.push(phase(&pod));
    }
    seen
}

#[tokio::test]
async fn plain_pod_runs_to_success() {
    let fake = FakeCluster::default();
    fake.create_job(&job(vec![container("main")])).await.unwrap();

    let mut pods = fake.watch_pods("app=sample");
    assert_eq!(phases(&mut pods, 4).await, ["Pending", "Running", "Running", "Succeeded"]);
}

#[tokio::test]
async fn non_zero_exit_fails_pod() {
    let fake = FakeCluster::default();
    fake.set_exit_code("main", 3);
    fake.create_job(&job(vec![container("main")])).await.unwrap();

    let mut pods = fake.watch_pods("app=sample");
    let seen = phases(&mut pods, 4).await;
    assert_eq!(seen.last().map(String::as_str), Some("Failed"));
}

#[tokio::test]
async fn wrapped_container_waits_for_status_write() {
    let fake = FakeCluster::default();
    let mut main = container("main");
    wrap_container(&mut main, None);
    fake.create_job(&job(vec![main])).await.unwrap();

    let mut pods = fake.watch_pods("app=sample");
    assert_eq!(phases(&mut pods, 2).await, ["Pending", "Running"]);

    let mut out = Vec::new();
    let mut err = Vec::new();
    let io = ExecIo { stdin: None, stdout: &mut out, stderr: &mut err };
    fake.exec("sample-pod", "main", status_command(0), &StreamProtocol::PREFERRED, io)
        .await
        .unwrap();

    assert_eq!(phases(&mut pods, 2).await, ["Running", "Succeeded"]);
}

#[tokio::test]
async fn exec_runs_locally_and_reports_exit_code() {
    let fake = FakeCluster::default();
    let mut main = container("main");
    wrap_container(&mut main, None);
    fake.create_job(&job(vec![main])).await.unwrap();
    let _pods = fake.watch_pods("app=sample");

    let mut out = Vec::new();
    let mut err = Vec::new();
    let command = vec!["sh".into(), "-c".into(), "echo out; echo err >&2; exit 4".into()];
    let io = ExecIo { stdin: None, stdout: &mut out, stderr: &mut err };
    let outcome = fake.exec("sample-pod", "main", command, &StreamProtocol::PREFERRED, io).await.unwrap();

    assert_eq!(outcome.exit_code().unwrap(), 4);
    assert_eq!(out, b"out\n");
    assert_eq!(err, b"err\n");
}

#[tokio::test]
async fn injected_not_found_errors_are_consumed() {
    let fake = FakeCluster::default();
    let mut main = container("main");
    wrap_container(&mut main, None);
    fake.create_job(&job(vec![main])).await.unwrap();
    let _pods = fake.watch_pods("app=sample");
    fake.fail_execs_not_found(1);

    for expect_not_found in [true, false] {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let io = ExecIo { stdin: None, stdout: &mut out, stderr: &mut err };
        let result =
            fake.exec("sample-pod", "main", vec!["true".into()], &StreamProtocol::PREFERRED, io).await;
        assert_eq!(result.as_ref().err().map(ClusterError::is_not_found), expect_not_found.then_some(true));
    }
    assert_eq!(fake.exec_calls().len(), 2);
}

#[tokio::test]
async fn negotiated_protocol_is_recorded() {
    let fake = FakeCluster::default();
    fake.set_supported_protocols(&[StreamProtocol::V2, StreamProtocol::V1]);
    let mut main = container("main");
    wrap_container(&mut main, None);
    fake.create_job(&job(vec![main])).await.unwrap();
    let _pods = fake.watch_pods("app=sample");

    let mut out = Vec::new();
    let mut err = Vec::new();
    let io = ExecIo { stdin: None, stdout: &mut out, stderr: &mut err };
    let command = vec!["sh".into(), "-c".into(), "exit 9".into()];
    let outcome = fake.exec("sample-pod", "main", command, &StreamProtocol::PREFERRED, io).await.unwrap();

    assert_eq!(outcome.protocol, StreamProtocol::V2);
    assert_eq!(outcome.exit_code().unwrap(), 1);
}

#[tokio::test]
async fn selector_filters_pods() {
    let fake = FakeCluster::default();
    fake.create_job(&job(vec![container("main")])).await.unwrap();

    assert_eq!(fake.list_pods("app=sample").await.unwrap().len(), 1);
    assert!(fake.list_pods("app=other").await.unwrap().is_empty());
}
