// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use async_trait::async_trait;
use log::trace;
use std::path::Path;

use crate::fs::{Filesystem, FsError, RemoteHandle};
use crate::job::Job;

/// The execution site shares the service's local filesystem.
///
/// Staging is the identity: the scheduler executes directly in the job's
/// local directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        LocalFs
    }
}

#[async_trait]
impl Filesystem for LocalFs {
    async fn upload(&self, local_dir: &Path, job: &Job) -> Result<RemoteHandle, FsError> {
        trace!("Job {} stages in place at '{}'.", job.id, local_dir.display());
        Ok(self.staged_handle(local_dir, job))
    }

    async fn download(
        &self,
        _handle: &RemoteHandle,
        _local_dir: &Path,
        job: &Job,
    ) -> Result<(), FsError> {
        trace!("Job {} results are already local.", job.id);
        Ok(())
    }

    async fn teardown(&self, _handle: &RemoteHandle) {
        // The job directory is the staged directory. It outlives the job.
    }

    fn staged_handle(&self, local_dir: &Path, _job: &Job) -> RemoteHandle {
        RemoteHandle(local_dir.to_string_lossy().into_owned())
    }
}
