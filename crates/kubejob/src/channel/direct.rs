// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channel over the API server's exec endpoint.
//!
//! File transfer pipes a tar stream through a remote `tar`. Uploads are
//! length-prefixed with `head -c`, so the remote side never depends on
//! stdin being closed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kubejob_wire::archive::{self, ArchiveError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{ChannelError, OutputBuffer, RemoteChannel};
use crate::cluster::{Cluster, ExecIo};
use crate::handshake::{shell_quote, status_command};
use crate::protocol::StreamProtocol;

pub(crate) struct DirectChannel {
    cluster: Arc<dyn Cluster>,
    pod: String,
    container: String,
    protocols: Vec<StreamProtocol>,
}

impl DirectChannel {
    pub fn new(cluster: Arc<dyn Cluster>, pod: &str, container: &str) -> Self {
        Self {
            cluster,
            pod: pod.to_string(),
            container: container.to_string(),
            protocols: StreamProtocol::PREFERRED.to_vec(),
        }
    }

    /// Run `command`, failing with its stderr on a non-zero exit
    async fn run_checked(
        &self,
        operation: &'static str,
        command: Vec<String>,
        stdin: Option<&mut (dyn AsyncRead + Send + Unpin)>,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), ChannelError> {
        let stderr = OutputBuffer::default();
        let mut sink = stderr.clone();
        let stdin = stdin.map(|s| -> &mut (dyn AsyncRead + Send + Unpin) { s });
        let io = ExecIo { stdin, stdout: &mut *stdout, stderr: &mut sink };
        let code = self.exec(&command, io).await?;
        if code != 0 {
            let stderr = String::from_utf8_lossy(&stderr.take()).trim().to_string();
            return Err(ChannelError::CommandFailed { operation, code, stderr });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteChannel for DirectChannel {
    async fn exec(&self, command: &[String], io: ExecIo<'_>) -> Result<i32, ChannelError> {
        let outcome = self
            .cluster
            .exec(&self.pod, &self.container, command.to_vec(), &self.protocols, io)
            .await?;
        Ok(outcome.exit_code()?)
    }

    async fn finish(&self, exit_code: i32) -> Result<(), ChannelError> {
        self.run_checked("status write", status_command(exit_code), None, &mut tokio::io::sink()).await
    }

    async fn copy_to(&self, local: &Path, remote: &str) -> Result<(), ChannelError> {
        let src = local.to_path_buf();
        let (name, len) = tokio::task::spawn_blocking(move || {
            Ok::<_, ArchiveError>((archive::root_name(&src)?, archive::packed_len(&src)?))
        })
        .await??;

        let (mut reader, pack) = archive::spawn_pack(local.to_path_buf());
        let script = extract_script(remote, &name, len);
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        let stdin: &mut (dyn AsyncRead + Send + Unpin) = &mut reader;
        let result = self.run_checked("tar extract", command, Some(stdin), &mut tokio::io::sink()).await;
        drop(reader);

        let packed = pack.await?;
        result?;
        Ok(packed?)
    }

    async fn copy_from(&self, remote: &str, local: &Path) -> Result<(), ChannelError> {
        let (parent, base) = split_remote(remote)?;
        let command = ["tar", "-cf", "-", "-C", parent.as_str(), base.as_str()].map(str::to_string).to_vec();

        let (mut writer, unpack) = archive::spawn_unpack(local.to_path_buf());
        let result = self.run_checked("tar create", command, None, &mut writer).await;
        let closed = writer.shutdown().await;
        drop(writer);

        let unpacked = unpack.await?;
        result?;
        unpacked?;
        Ok(closed?)
    }
}

/// Remote script that extracts `len` archive bytes from stdin into `dest`.
///
/// An existing directory receives the archive root under its own name;
/// any other destination is replaced by the root.
fn extract_script(dest: &str, root: &str, len: u64) -> String {
    format!(
        "set -e
dest={dest}
if [ -d \"$dest\" ]; then
  head -c {len} | tar -xmf - -C \"$dest\"
else
  tmp=$(mktemp -d)
  trap 'rm -rf \"$tmp\"' EXIT
  head -c {len} | tar -xmf - -C \"$tmp\"
  mkdir -p \"$(dirname \"$dest\")\"
  mv -f \"$tmp\"/{root} \"$dest\"
fi
",
        dest = shell_quote(dest),
        root = shell_quote(root),
    )
}

/// Split a remote path into the directory `tar -C` runs in and the entry
/// to archive.
fn split_remote(remote: &str) -> Result<(String, String), ChannelError> {
    let path = Path::new(remote);
    let base = archive::root_name(path)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => PathBuf::from("/"),
    };
    Ok((parent.to_string_lossy().into_owned(), base))
}

#[cfg(test)]
#[path = "direct_tests.rs"]
mod tests;
