// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::cluster::FakeCluster;
use crate::handshake::wrap_container;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::fs;
use yare::parameterized;

async fn running_channel(fake: &FakeCluster) -> DirectChannel {
    let mut main = Container { name: "main".into(), ..Container::default() };
    wrap_container(&mut main, None);
    let job = Job {
        metadata: ObjectMeta { name: Some("copy".into()), ..ObjectMeta::default() },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec { containers: vec![main], ..PodSpec::default() }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    };
    fake.create_job(&job).await.unwrap();
    drop(fake.watch_pods(""));
    DirectChannel::new(Arc::new(fake.clone()), "copy-pod", "main")
}

fn sample_tree(root: &Path) -> PathBuf {
    let src = root.join("artifacts");
    fs::create_dir_all(src.join("nested")).unwrap();
    fs::write(src.join("artifact.txt"), b"hello").unwrap();
    fs::write(src.join("nested/data.bin"), [0u8, 1, 2, 255]).unwrap();
    std::os::unix::fs::symlink("artifact.txt", src.join("link")).unwrap();
    src
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_round_trip_preserves_content_and_links() {
    let fake = FakeCluster::default();
    let channel = running_channel(&fake).await;
    let dir = tempfile::tempdir().unwrap();
    let src = sample_tree(dir.path());
    let remote = dir.path().join("remote/copied");

    channel.copy_to(&src, remote.to_str().unwrap()).await.unwrap();
    assert_eq!(fs::read(remote.join("artifact.txt")).unwrap(), b"hello");

    let back = dir.path().join("back");
    channel.copy_from(remote.to_str().unwrap(), &back).await.unwrap();

    assert_eq!(fs::read(back.join("artifact.txt")).unwrap(), b"hello");
    assert_eq!(fs::read(back.join("nested/data.bin")).unwrap(), [0u8, 1, 2, 255]);
    let link = back.join("link");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("artifact.txt"));
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_remote_directory_receives_root_by_name() {
    let fake = FakeCluster::default();
    let channel = running_channel(&fake).await;
    let dir = tempfile::tempdir().unwrap();
    let src = sample_tree(dir.path());
    let remote = dir.path().join("existing");
    fs::create_dir(&remote).unwrap();

    channel.copy_to(&src, remote.to_str().unwrap()).await.unwrap();
    assert_eq!(fs::read(remote.join("artifacts/artifact.txt")).unwrap(), b"hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_copies_to_new_name() {
    let fake = FakeCluster::default();
    let channel = running_channel(&fake).await;
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("report.txt");
    fs::write(&src, b"done").unwrap();
    let remote = dir.path().join("out/renamed.txt");

    channel.copy_to(&src, remote.to_str().unwrap()).await.unwrap();
    assert_eq!(fs::read(&remote).unwrap(), b"done");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_remote_source_reports_tar_stderr() {
    let fake = FakeCluster::default();
    let channel = running_channel(&fake).await;
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("missing");

    let err = channel.copy_from(remote.to_str().unwrap(), &dir.path().join("out")).await.unwrap_err();
    match err {
        ChannelError::CommandFailed { operation, code, stderr } => {
            assert_eq!(operation, "tar create");
            assert_ne!(code, 0);
            assert!(stderr.contains("missing"), "stderr: {stderr}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_local_source_fails_before_exec() {
    let fake = FakeCluster::default();
    let channel = running_channel(&fake).await;
    let dir = tempfile::tempdir().unwrap();

    let err = channel.copy_to(&dir.path().join("missing"), "/tmp/x").await.unwrap_err();
    assert!(matches!(err, ChannelError::Archive(ArchiveError::SourceNotFound(_))));
    assert!(fake.exec_calls().is_empty());
}

#[tokio::test]
async fn finish_goes_through_exec() {
    let fake = FakeCluster::default();
    let channel = running_channel(&fake).await;

    channel.finish(0).await.unwrap();
    let calls = fake.exec_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].command, status_command(0));
}

#[parameterized(
    nested = { "/var/data/out", "/var/data", "out" },
    trailing_slash = { "/var/data/", "/var", "data" },
    top_level = { "/out", "/", "out" },
    relative = { "out", ".", "out" },
)]
fn split_remote_paths(remote: &str, parent: &str, base: &str) {
    assert_eq!(split_remote(remote).unwrap(), (parent.to_string(), base.to_string()));
}

#[test]
fn split_remote_rejects_root() {
    assert!(matches!(split_remote("/"), Err(ChannelError::Archive(ArchiveError::NoBaseName(_)))));
}

#[test]
fn extract_script_quotes_paths() {
    let script = extract_script("/data/it's here", "root", 2048);
    assert!(script.contains(r"dest='/data/it'\''s here'"));
    assert!(script.contains("head -c 2048 | tar -xmf -"));
    assert!(script.contains(r#"mv -f "$tmp"/'root' "$dest""#));
}
