// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use async_trait::async_trait;
use log::{debug, trace, warn};
use ssh2::Sftp;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::fs::{Filesystem, FsError, RemoteHandle};
use crate::job::Job;
use crate::ssh::{SshError, SshPool};

/// Transfers job directories to a remote host over SFTP.
///
/// Jobs are staged under `entry`, one subdirectory per job id. Transfers
/// land in a hidden sibling first and are renamed into place so the paired
/// scheduler never observes a partial directory.
///
pub struct SftpFs {
    pool: Arc<SshPool>,
    entry: PathBuf,
}

impl SftpFs {
    pub fn new(pool: Arc<SshPool>, entry: PathBuf) -> Self {
        SftpFs { pool, entry }
    }

    fn final_path(&self, job: &Job) -> PathBuf {
        self.entry.join(job.id.to_string())
    }
}

#[async_trait]
impl Filesystem for SftpFs {
    async fn upload(&self, local_dir: &Path, job: &Job) -> Result<RemoteHandle, FsError> {
        let local = local_dir.to_path_buf();
        let staging = self
            .entry
            .join(format!(".staging-{}-{}", job.id, Uuid::new_v4()));
        let target = self.final_path(job);
        debug!(
            "Uploading job {} to '{}:{}'.",
            job.id,
            self.pool.host(),
            target.display()
        );

        let handle = self.staged_handle(local_dir, job);
        self.pool
            .with_session(move |session| {
                let sftp = session.sftp().map_err(op_error)?;
                upload_tree(&sftp, &local, &staging)?;

                // Clear the target of a previous interrupted attempt, then
                // move the complete tree into place.
                let _ = remove_tree(&sftp, &target);
                sftp.rename(&staging, &target, None).map_err(op_error)?;
                Ok(())
            })
            .await
            .map_err(FsError::from)?;

        Ok(handle)
    }

    async fn download(
        &self,
        handle: &RemoteHandle,
        local_dir: &Path,
        job: &Job,
    ) -> Result<(), FsError> {
        let remote = PathBuf::from(&handle.0);
        let local = local_dir.to_path_buf();
        debug!(
            "Downloading job {} from '{}:{}'.",
            job.id,
            self.pool.host(),
            remote.display()
        );

        self.pool
            .with_session(move |session| {
                let sftp = session.sftp().map_err(op_error)?;

                // A vanished remote tree is a partial result, not an error.
                if sftp.stat(&remote).is_err() {
                    trace!("Remote directory '{}' is gone.", remote.display());
                    return Ok(());
                }

                download_tree(&sftp, &remote, &local)
            })
            .await
            .map_err(FsError::from)
    }

    async fn teardown(&self, handle: &RemoteHandle) {
        let remote = PathBuf::from(&handle.0);
        let result = self
            .pool
            .with_session(move |session| {
                let sftp = session.sftp().map_err(op_error)?;
                remove_tree(&sftp, &remote)
            })
            .await;

        if let Err(error) = result {
            warn!("Unable to tear down '{}': {error}", handle.0);
        }
    }

    fn staged_handle(&self, _local_dir: &Path, job: &Job) -> RemoteHandle {
        RemoteHandle(self.final_path(job).to_string_lossy().into_owned())
    }
}

fn op_error(error: ssh2::Error) -> SshError {
    SshError::Op(error.to_string())
}

fn io_error(error: io::Error) -> SshError {
    SshError::Op(error.to_string())
}

/// Recursively copy a local directory to the remote side.
fn upload_tree(sftp: &Sftp, local: &Path, remote: &Path) -> Result<(), SshError> {
    sftp.mkdir(remote, 0o755).map_err(op_error)?;

    for entry in std::fs::read_dir(local).map_err(io_error)? {
        let entry = entry.map_err(io_error)?;
        let local_path = entry.path();
        let remote_path = remote.join(entry.file_name());

        if entry.file_type().map_err(io_error)?.is_dir() {
            upload_tree(sftp, &local_path, &remote_path)?;
        } else {
            let mut source = File::open(&local_path).map_err(io_error)?;
            let mut target = sftp.create(&remote_path).map_err(op_error)?;
            io::copy(&mut source, &mut target).map_err(io_error)?;
        }
    }

    Ok(())
}

/// Recursively copy a remote directory into a local one, merging over
/// whatever already exists.
fn download_tree(sftp: &Sftp, remote: &Path, local: &Path) -> Result<(), SshError> {
    std::fs::create_dir_all(local).map_err(io_error)?;

    for (remote_path, stat) in sftp.readdir(remote).map_err(op_error)? {
        let Some(name) = remote_path.file_name() else {
            continue;
        };
        let local_path = local.join(name);

        if stat.is_dir() {
            download_tree(sftp, &remote_path, &local_path)?;
        } else {
            let mut source = sftp.open(&remote_path).map_err(op_error)?;
            let mut target = File::create(&local_path).map_err(io_error)?;
            io::copy(&mut source, &mut target).map_err(io_error)?;
        }
    }

    Ok(())
}

/// Recursively delete a remote directory.
fn remove_tree(sftp: &Sftp, remote: &Path) -> Result<(), SshError> {
    let Ok(entries) = sftp.readdir(remote) else {
        return Ok(());
    };

    for (remote_path, stat) in entries {
        if stat.is_dir() {
            remove_tree(sftp, &remote_path)?;
        } else {
            sftp.unlink(&remote_path).map_err(op_error)?;
        }
    }

    sftp.rmdir(remote).map_err(op_error)
}
