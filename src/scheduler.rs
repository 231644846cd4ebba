// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

pub mod grid;
pub mod memory;
pub mod queue;
pub mod slurm;

use async_trait::async_trait;
use log::trace;
use std::fs;
use std::path::Path;

use crate::fs::RemoteHandle;
use crate::job::JobDescription;
use crate::SCHEDULER_HANDLE_FILE_NAME;

/// The state a scheduler reports for one job.
///
/// No other states leak to the orchestrator; every scheduler maps its
/// native vocabulary onto these four.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Queued,
    Running,
    Ok {
        exit_code: i32,
    },
    Error {
        exit_code: Option<i32>,
        reason: String,
    },
}

impl SchedulerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerState::Ok { .. } | SchedulerState::Error { .. }
        )
    }
}

/// Errors from scheduler implementations.
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("Unable to submit job: {0}")]
    Submit(String),

    #[error("Unable to query job state: {0}")]
    State(String),

    #[error("Unable to cancel job: {0}")]
    Cancel(String),
}

/// Submits job descriptions to an execution back-end and reports on them.
///
/// `submit` must be idempotent with respect to crashes: a caller that did
/// not record the returned identifier and retries with an identical
/// description must not cause two executions. Implementations write the
/// identifier to a sentinel file inside the job directory before
/// returning, and read it back on retry.
///
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register the job for execution and return its scheduler-native
    /// identifier.
    ///
    /// `staged` is the handle the paired filesystem returned from
    /// stage-out; the execution site works inside it.
    async fn submit(
        &self,
        description: &JobDescription,
        staged: &RemoteHandle,
    ) -> Result<String, SchedulerError>;

    /// Report the current state of a submitted job.
    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError>;

    /// Best-effort, idempotent cancellation.
    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError>;

    /// Release pooled resources.
    async fn close(&self);

    /// Whether submitted jobs survive a restart of this service.
    fn survives_restart(&self) -> bool {
        true
    }
}

/// Read the submit-idempotency sentinel, if present.
pub fn read_handle_sentinel(job_dir: &Path) -> Option<String> {
    let sentinel = job_dir.join(SCHEDULER_HANDLE_FILE_NAME);
    match fs::read_to_string(&sentinel) {
        Ok(contents) => {
            let internal_id = contents.trim();
            if internal_id.is_empty() {
                None
            } else {
                trace!(
                    "Found scheduler handle '{internal_id}' in '{}'.",
                    sentinel.display()
                );
                Some(internal_id.to_string())
            }
        }
        Err(_) => None,
    }
}

/// Record the scheduler handle before `submit` returns.
pub fn write_handle_sentinel(job_dir: &Path, internal_id: &str) -> Result<(), SchedulerError> {
    let sentinel = job_dir.join(SCHEDULER_HANDLE_FILE_NAME);
    fs::write(&sentinel, format!("{internal_id}\n"))
        .map_err(|e| SchedulerError::Submit(format!("unable to write sentinel: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;
    use serial_test::parallel;

    #[test]
    #[parallel]
    fn sentinel_round_trip() {
        let temp = TempDir::new().unwrap();
        assert_eq!(read_handle_sentinel(temp.path()), None);

        write_handle_sentinel(temp.path(), "slurm-314").unwrap();
        assert_eq!(
            read_handle_sentinel(temp.path()).as_deref(),
            Some("slurm-314")
        );
    }

    #[test]
    #[parallel]
    fn empty_sentinel_reads_as_absent() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(SCHEDULER_HANDLE_FILE_NAME), "\n").unwrap();
        assert_eq!(read_handle_sentinel(temp.path()), None);
    }

    #[test]
    #[parallel]
    fn terminal_states() {
        assert!(!SchedulerState::Queued.is_terminal());
        assert!(!SchedulerState::Running.is_terminal());
        assert!(SchedulerState::Ok { exit_code: 0 }.is_terminal());
        assert!(SchedulerState::Error {
            exit_code: None,
            reason: "cancelled".to_string()
        }
        .is_terminal());
    }
}
