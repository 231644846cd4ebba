// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

pub mod grid;
pub mod local;
pub mod sftp;

use async_trait::async_trait;
use std::fmt;
use std::path::Path;

use crate::job::Job;
use crate::ssh::SshError;

/// Opaque handle to a job directory staged at an execution site.
///
/// The contents are filesystem-specific: a local path, a remote SFTP path,
/// or a grid LFN directory. Handles are deterministic per job so that a
/// restarted service can re-derive them.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteHandle(pub String);

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Staging failures, split by retriability.
///
/// The orchestrator retries `Transient` failures with exponential backoff;
/// `Permanent` failures (including authentication failures) are fatal for
/// the job.
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("Transient I/O failure: {0}")]
    Transient(String),

    #[error("Permanent I/O failure: {0}")]
    Permanent(String),
}

impl FsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Transient(_))
    }
}

impl From<SshError> for FsError {
    fn from(error: SshError) -> Self {
        if error.is_permanent() {
            FsError::Permanent(error.to_string())
        } else {
            FsError::Transient(error.to_string())
        }
    }
}

/// Makes job directories visible at an execution site and brings results
/// back.
///
/// Uploads must be atomic from the paired scheduler's viewpoint: the
/// scheduler polls the staged directory only after `upload` has returned
/// success, and implementations that transfer incrementally stage to a
/// sibling path and rename.
///
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Make `local_dir` visible at the execution site.
    async fn upload(&self, local_dir: &Path, job: &Job) -> Result<RemoteHandle, FsError>;

    /// Bring results back into `local_dir`.
    ///
    /// Missing optional output files are not errors; implementations
    /// mirror whatever part of the remote tree exists.
    async fn download(
        &self,
        handle: &RemoteHandle,
        local_dir: &Path,
        job: &Job,
    ) -> Result<(), FsError>;

    /// Best-effort cleanup of the staged directory. Failures are logged,
    /// not propagated.
    async fn teardown(&self, handle: &RemoteHandle);

    /// The handle `upload` returns for this job.
    ///
    /// Deterministic, so the orchestrator can resume stage-in after a
    /// restart without re-uploading.
    fn staged_handle(&self, local_dir: &Path, job: &Job) -> RemoteHandle;
}
