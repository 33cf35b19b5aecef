// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fs;
use std::path::PathBuf;

use kubejob_agent::{AgentServer, ServerConfig};
use tokio_util::sync::CancellationToken;
use yare::parameterized;

use super::*;

const AGENT_PATH: &str = "/usr/local/bin/kubejob-agent";

fn config(port: u16) -> AgentConfig {
    AgentConfig::new([("main", AGENT_PATH)])
        .unwrap()
        .port(port)
        .ready_attempts(3)
        .ready_poll(Duration::from_millis(10))
}

struct Agent {
    port: u16,
    status_path: PathBuf,
    _dir: tempfile::TempDir,
    shutdown: CancellationToken,
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_agent() -> Agent {
    let dir = tempfile::tempdir().unwrap();
    let status_path = dir.path().join("status");
    let server = AgentServer::bind("127.0.0.1:0", ServerConfig::new("secret").status_path(&status_path))
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    Agent { port, status_path, _dir: dir, shutdown }
}

fn channel(port: u16, token: &str) -> AgentChannel {
    let config = config(port);
    let launch = config.launch("main", 0, token).unwrap();
    config.connect_to(Some("127.0.0.1"), &launch)
}

async fn exec(channel: &AgentChannel, command: &[&str]) -> Result<(i32, Vec<u8>, Vec<u8>), ChannelError> {
    let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
    let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
    let io = ExecIo { stdin: None, stdout: &mut stdout, stderr: &mut stderr };
    let code = channel.exec(&command, io).await?;
    Ok((code, stdout, stderr))
}

#[parameterized(
    empty_name = { "", AGENT_PATH },
    relative_path = { "main", "bin/kubejob-agent" },
    empty_path = { "main", "" },
)]
fn invalid_agent_config_is_rejected(container: &str, path: &str) {
    let err = AgentConfig::new([(container, path)]).unwrap_err();
    assert!(matches!(err, JobError::InvalidAgentConfig(_)));
}

#[test]
fn agent_paths_are_looked_up_by_container() {
    let config = AgentConfig::new([("main", AGENT_PATH)]).unwrap();
    assert_eq!(config.path_for("main"), Some(AGENT_PATH));
    assert_eq!(config.path_for("sidecar"), None);
}

#[test]
fn containers_get_consecutive_ports() {
    let config = AgentConfig::new([("main", AGENT_PATH), ("sidecar", AGENT_PATH)]).unwrap().port(9000);

    let main = config.launch("main", 0, "token").unwrap();
    let sidecar = config.launch("sidecar", 1, "token").unwrap();

    assert_eq!((main.port, sidecar.port), (9000, 9001));
    assert_eq!(main.path, AGENT_PATH);
    assert_eq!(main.token, "token");
    assert!(config.launch("other", 2, "token").is_none());
}

#[parameterized(
    missing = { None },
    not_an_address = { Some("pending") },
)]
fn unusable_pod_ip_fails_before_connecting(ip: Option<&str>) {
    let config = config(9000);
    let launch = config.launch("main", 0, "secret").unwrap();
    let channel = config.connect_to(ip, &launch);

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let err = runtime.block_on(channel.finish(0)).unwrap_err();
    assert!(matches!(err, ChannelError::NoPodIp));
}

#[tokio::test]
async fn exec_streams_output_and_exit_code() {
    let agent = start_agent().await;
    let channel = channel(agent.port, "secret");

    let (code, stdout, stderr) =
        exec(&channel, &["sh", "-c", "echo out; echo err >&2; exit 3"]).await.unwrap();

    assert_eq!(code, 3);
    assert_eq!(stdout, b"out\n");
    assert_eq!(stderr, b"err\n");
}

#[tokio::test]
async fn sessions_are_reused() {
    let agent = start_agent().await;
    let channel = channel(agent.port, "secret");

    exec(&channel, &["true"]).await.unwrap();
    exec(&channel, &["true"]).await.unwrap();

    assert_eq!(channel.idle.lock().len(), 1);
}

#[tokio::test]
async fn finish_writes_the_status_file() {
    let agent = start_agent().await;
    let channel = channel(agent.port, "secret");

    channel.finish(5).await.unwrap();
    assert_eq!(fs::read_to_string(&agent.status_path).unwrap(), "5\n");

    channel.finish(300).await.unwrap();
    assert_eq!(fs::read_to_string(&agent.status_path).unwrap(), "1\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn copy_round_trip_through_the_agent() {
    let agent = start_agent().await;
    let channel = channel(agent.port, "secret");
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("artifacts");
    fs::create_dir_all(src.join("nested")).unwrap();
    fs::write(src.join("nested/result.txt"), b"42").unwrap();
    std::os::unix::fs::symlink("nested/result.txt", src.join("latest")).unwrap();
    let remote = dir.path().join("remote");

    channel.copy_to(&src, remote.to_str().unwrap()).await.unwrap();
    let back = dir.path().join("back");
    channel.copy_from(remote.to_str().unwrap(), &back).await.unwrap();

    assert_eq!(fs::read(back.join("nested/result.txt")).unwrap(), b"42");
    assert_eq!(fs::read_link(back.join("latest")).unwrap(), PathBuf::from("nested/result.txt"));
    assert_eq!(channel.idle.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_remote_source_is_an_agent_error() {
    let agent = start_agent().await;
    let channel = channel(agent.port, "secret");
    let dir = tempfile::tempdir().unwrap();

    let err = channel
        .copy_from(dir.path().join("missing").to_str().unwrap(), &dir.path().join("out"))
        .await
        .unwrap_err();

    assert!(matches!(err, ChannelError::Agent(_)), "{err}");
    exec(&channel, &["true"]).await.unwrap();
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let agent = start_agent().await;
    let channel = channel(agent.port, "wrong");

    let err = exec(&channel, &["true"]).await.unwrap_err();

    assert!(matches!(err, ChannelError::Agent(ref message) if message == "unauthorized"));
}

#[tokio::test]
async fn unreachable_agent_gives_up_after_ready_attempts() {
    let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let config = config(port).ready_attempts(2).ready_poll(Duration::from_millis(1));
    let launch = config.launch("main", 0, "secret").unwrap();
    let channel = config.connect_to(Some("127.0.0.1"), &launch);

    let err = channel.finish(0).await.unwrap_err();

    assert!(matches!(err, ChannelError::AgentUnavailable { attempts: 2, .. }));
}
