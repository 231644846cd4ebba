// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, trace};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::job::{Job, JobState};
use crate::Error;

/// Optional fields recorded atomically together with a state transition.
#[derive(Clone, Debug, Default)]
pub struct StateUpdate {
    /// The scheduler handle. Accepted only when entering `queued`.
    pub internal_id: Option<String>,

    /// The exit code of the command.
    pub exit_code: Option<i32>,

    /// A human-readable reason for an `error` state.
    pub reason: Option<String>,
}

impl StateUpdate {
    pub fn with_internal_id(internal_id: String) -> Self {
        StateUpdate {
            internal_id: Some(internal_id),
            ..StateUpdate::default()
        }
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        StateUpdate {
            reason: Some(reason.into()),
            ..StateUpdate::default()
        }
    }
}

/// The persistence contract for job metadata.
///
/// Implementations must make `set_state` atomic: the state, the optional
/// fields, and `updated_at` commit as a single record update. The job-id
/// sequence is owned by the store and must be monotonic across restarts of
/// the service (a relational store backs it with an auto-incrementing
/// column).
///
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job in state `new` and return its id.
    async fn create_job(
        &self,
        submitter: &str,
        application: &str,
        destination: &str,
        name: &str,
    ) -> Result<i64, Error>;

    /// Transition a job to `new_state`, recording `update` atomically.
    ///
    /// # Errors
    /// * `Error::JobNotFound` when no job has the given id.
    /// * `Error::InvalidTransition` when the state graph forbids the move.
    /// * `Error::InternalIdAlreadySet` when the handle was recorded before.
    async fn set_state(
        &self,
        job_id: i64,
        new_state: JobState,
        update: StateUpdate,
    ) -> Result<Job, Error>;

    /// Fetch one job.
    async fn get_job(&self, job_id: i64) -> Result<Job, Error>;

    /// List every job whose state is not terminal. Used at startup.
    async fn list_non_terminal(&self) -> Result<Vec<Job>, Error>;
}

/// An in-memory `JobStore`.
///
/// Backs the test suite and single-process deployments. Deployments that
/// must survive restarts plug a persistent implementation in at the
/// boundary.
///
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    next_id: i64,
    jobs: HashMap<i64, Job>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(
        &self,
        submitter: &str,
        application: &str,
        destination: &str,
        name: &str,
    ) -> Result<i64, Error> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;

        let now = Utc::now();
        let job = Job {
            id,
            name: name.to_string(),
            application: application.to_string(),
            submitter: submitter.to_string(),
            destination: destination.to_string(),
            state: JobState::New,
            internal_id: None,
            exit_code: None,
            reason: None,
            created_at: now,
            updated_at: now,
        };

        debug!("Created job {id} for '{submitter}' on '{destination}'.");
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn set_state(
        &self,
        job_id: i64,
        new_state: JobState,
        update: StateUpdate,
    ) -> Result<Job, Error> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;

        if !job.state.may_transition_to(new_state) {
            return Err(Error::InvalidTransition(job_id, job.state, new_state));
        }

        if update.internal_id.is_some() {
            if job.internal_id.is_some() {
                return Err(Error::InternalIdAlreadySet(job_id));
            }
            if new_state != JobState::Queued {
                return Err(Error::InvalidTransition(job_id, job.state, new_state));
            }
            job.internal_id = update.internal_id;
        }

        trace!("Job {job_id}: {} -> {new_state}.", job.state);
        job.state = new_state;
        if update.exit_code.is_some() {
            job.exit_code = update.exit_code;
        }
        if update.reason.is_some() {
            job.reason = update.reason;
        }
        job.updated_at = Utc::now();

        Ok(job.clone())
    }

    async fn get_job(&self, job_id: i64) -> Result<Job, Error> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(Error::JobNotFound(job_id))
    }

    async fn list_non_terminal(&self) -> Result<Vec<Job>, Error> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::parallel;

    async fn setup() -> (MemoryStore, i64) {
        let store = MemoryStore::new();
        let id = store
            .create_job("user", "wc", "local", "count words")
            .await
            .expect("job created");
        (store, id)
    }

    #[tokio::test]
    #[parallel]
    async fn ids_are_monotonic() {
        let (store, first) = setup().await;
        assert_eq!(first, 1);
        for expected in 2..5 {
            let id = store
                .create_job("user", "wc", "local", "another")
                .await
                .unwrap();
            assert_eq!(id, expected);
        }
    }

    #[tokio::test]
    #[parallel]
    async fn new_job_starts_new() {
        let (store, id) = setup().await;
        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.state, JobState::New);
        assert_eq!(job.internal_id, None);
        assert_eq!(job.exit_code, None);
    }

    #[tokio::test]
    #[parallel]
    async fn internal_id_set_exactly_once_on_queued() {
        let (store, id) = setup().await;
        store
            .set_state(id, JobState::StagingOut, StateUpdate::default())
            .await
            .unwrap();

        let job = store
            .set_state(
                id,
                JobState::Queued,
                StateUpdate::with_internal_id("slurm-123".into()),
            )
            .await
            .unwrap();
        assert_eq!(job.internal_id.as_deref(), Some("slurm-123"));

        // A second handle is rejected.
        let error = store
            .set_state(
                id,
                JobState::Running,
                StateUpdate::with_internal_id("slurm-456".into()),
            )
            .await;
        assert!(matches!(error, Err(Error::InternalIdAlreadySet(_))));
    }

    #[tokio::test]
    #[parallel]
    async fn internal_id_rejected_outside_queued() {
        let (store, id) = setup().await;
        let error = store
            .set_state(
                id,
                JobState::StagingOut,
                StateUpdate::with_internal_id("early".into()),
            )
            .await;
        assert!(matches!(
            error,
            Err(Error::InvalidTransition(_, JobState::New, JobState::StagingOut))
        ));
    }

    #[tokio::test]
    #[parallel]
    async fn invalid_transition_is_rejected() {
        let (store, id) = setup().await;
        let error = store
            .set_state(id, JobState::Running, StateUpdate::default())
            .await;
        assert!(matches!(error, Err(Error::InvalidTransition(_, _, _))));

        // The failed attempt must not have modified the record.
        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.state, JobState::New);
    }

    #[tokio::test]
    #[parallel]
    async fn terminal_states_keep_reason_and_exit_code() {
        let (store, id) = setup().await;
        let update = StateUpdate {
            exit_code: Some(1),
            reason: Some("command failed".into()),
            ..StateUpdate::default()
        };
        let job = store.set_state(id, JobState::Error, update).await.unwrap();
        assert_eq!(job.state, JobState::Error);
        assert_eq!(job.exit_code, Some(1));
        assert_eq!(job.reason.as_deref(), Some("command failed"));

        let error = store
            .set_state(id, JobState::Queued, StateUpdate::default())
            .await;
        assert!(matches!(error, Err(Error::InvalidTransition(_, _, _))));
    }

    #[tokio::test]
    #[parallel]
    async fn list_non_terminal_skips_finished_jobs() {
        let (store, first) = setup().await;
        let second = store
            .create_job("user", "wc", "local", "second")
            .await
            .unwrap();

        store
            .set_state(first, JobState::Error, StateUpdate::with_reason("gone"))
            .await
            .unwrap();

        let jobs = store.list_non_terminal().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, second);
    }
}
