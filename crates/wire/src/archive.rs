// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tar archive format for file transfer.
//!
//! Every archive has a single root entry named after the source's base name.
//! Extraction follows `cp -r` destination rules: an existing directory
//! receives the root under its own name, any other path becomes the root.
//! Symbolic links are stored as links, never dereferenced.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

use crate::frame::CHUNK_SIZE;

/// Errors from packing or unpacking an archive
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("source has no base name: {0}")]
    NoBaseName(PathBuf),

    #[error("archive entry escapes destination: {0}")]
    PathTraversal(String),

    #[error("archive has more than one root: {0}")]
    MultipleRoots(String),

    #[error("archive is empty")]
    Empty,
}

/// Name of the archive root for `src` (its final path component).
pub fn root_name(src: &Path) -> Result<String, ArchiveError> {
    src.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ArchiveError::NoBaseName(src.to_path_buf()))
}

/// Write `src` (file, directory tree, or symlink) as a tar stream into `out`.
pub fn pack<W: Write>(src: &Path, out: W) -> Result<W, ArchiveError> {
    let meta =
        fs::symlink_metadata(src).map_err(|_| ArchiveError::SourceNotFound(src.to_path_buf()))?;
    let name = root_name(src)?;

    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);
    if meta.is_dir() {
        builder.append_dir_all(&name, src)?;
    } else {
        builder.append_path_with_name(src, &name)?;
    }
    Ok(builder.into_inner()?)
}

/// Extract a tar stream into `dest`, returning the path the root landed at.
pub fn unpack<R: Read>(input: R, dest: &Path) -> Result<PathBuf, ArchiveError> {
    let mut archive = tar::Archive::new(input);
    let mut root: Option<(String, PathBuf)> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let (first, rest) = split_root(&path)?;

        let local_root = match &root {
            Some((name, local)) if *name == first => local.clone(),
            Some(_) => return Err(ArchiveError::MultipleRoots(path.display().to_string())),
            None => {
                let local = if dest.is_dir() { dest.join(&first) } else { dest.to_path_buf() };
                root = Some((first, local.clone()));
                local
            }
        };

        let target = if rest.as_os_str().is_empty() {
            local_root
        } else {
            reject_symlink_parents(&local_root, &rest, &path)?;
            local_root.join(rest)
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }

    // Consume record padding so the writer never sees a closed pipe
    io::copy(&mut archive.into_inner(), &mut io::sink())?;
    root.map(|(_, local)| local).ok_or(ArchiveError::Empty)
}

/// Size in bytes of the archive `pack` would produce for `src`.
pub fn packed_len(src: &Path) -> Result<u64, ArchiveError> {
    Ok(pack(src, CountingWriter::default())?.0)
}

#[derive(Default)]
struct CountingWriter(u64);

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Pack `src` on a blocking thread, returning the read end of the stream.
///
/// Must be called from within a tokio runtime.
pub fn spawn_pack(src: PathBuf) -> (DuplexStream, JoinHandle<Result<(), ArchiveError>>) {
    let (reader, writer) = tokio::io::duplex(CHUNK_SIZE);
    let bridge = SyncIoBridge::new(writer);
    let task = tokio::task::spawn_blocking(move || {
        let mut bridge = pack(&src, bridge)?;
        bridge.flush()?;
        Ok(())
    });
    (reader, task)
}

/// Unpack into `dest` on a blocking thread, returning the write end of the
/// stream. Shut down or drop the writer to finish the archive.
///
/// Must be called from within a tokio runtime.
pub fn spawn_unpack(dest: PathBuf) -> (DuplexStream, JoinHandle<Result<PathBuf, ArchiveError>>) {
    let (reader, writer) = tokio::io::duplex(CHUNK_SIZE);
    let bridge = SyncIoBridge::new(reader);
    let task = tokio::task::spawn_blocking(move || unpack(bridge, &dest));
    (writer, task)
}

/// Split an entry path into its root name and the remainder, rejecting
/// anything that could climb out of the destination.
fn split_root(path: &Path) -> Result<(String, PathBuf), ArchiveError> {
    let mut root = None;
    let mut rest = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => continue,
            Component::Normal(part) if root.is_none() => {
                root = Some(part.to_string_lossy().into_owned());
            }
            Component::Normal(part) => rest.push(part),
            _ => return Err(ArchiveError::PathTraversal(path.display().to_string())),
        }
    }
    let root = root.ok_or_else(|| ArchiveError::PathTraversal(path.display().to_string()))?;
    Ok((root, rest))
}

/// Fail when a directory between `root` and `root/rest` is a symlink, so an
/// earlier entry cannot redirect later ones outside the destination.
fn reject_symlink_parents(root: &Path, rest: &Path, entry: &Path) -> Result<(), ArchiveError> {
    let mut dir = root.to_path_buf();
    let mut parents = rest.components();
    parents.next_back();
    loop {
        if fs::symlink_metadata(&dir).is_ok_and(|meta| meta.file_type().is_symlink()) {
            return Err(ArchiveError::PathTraversal(entry.display().to_string()));
        }
        match parents.next() {
            Some(part) => dir.push(part),
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "archive_tests.rs"]
mod tests;
