// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use log::{debug, trace};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::fs::RemoteHandle;
use crate::job::{JobDescription, REASON_CANCELLED};
use crate::scheduler::{
    read_handle_sentinel, write_handle_sentinel, Scheduler, SchedulerError, SchedulerState,
};

/// Pushes jobs onto a named Redis queue consumed by external workers.
///
/// The service side only submits and observes. Workers pop ids from the
/// queue, execute inside the staged directory, and maintain the job record
/// this scheduler reads state from. Both sides share the same job-state
/// vocabulary.
///
pub struct QueueScheduler {
    client: redis::Client,
    manager: Mutex<Option<ConnectionManager>>,
    queue: String,
    max_jobs: usize,
    job_timeout: u64,
}

/// The broker-side job record, shared with the workers.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct QueueJobRecord {
    pub state: QueueJobState,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub cancel_requested: bool,
    /// Per-job timeout in seconds, enforced by the worker.
    pub job_timeout: u64,
    /// The directory the worker executes in.
    pub staged_dir: String,
    pub description: JobDescription,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueJobState {
    Queued,
    Running,
    Ok,
    Error,
}

impl QueueScheduler {
    pub fn new(
        redis_dsn: &str,
        queue: String,
        max_jobs: usize,
        job_timeout: u64,
    ) -> Result<Self, SchedulerError> {
        let client = redis::Client::open(redis_dsn)
            .map_err(|e| SchedulerError::Submit(format!("invalid redis DSN: {e}")))?;
        Ok(QueueScheduler {
            client,
            manager: Mutex::new(None),
            queue,
            max_jobs,
            job_timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, SchedulerError> {
        let mut manager = self.manager.lock().await;
        if let Some(manager) = manager.as_ref() {
            return Ok(manager.clone());
        }

        let new_manager = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| SchedulerError::State(format!("unable to reach broker: {e}")))?;
        *manager = Some(new_manager.clone());
        Ok(new_manager)
    }

    fn queue_key(&self) -> String {
        format!("porter:queue:{}", self.queue)
    }

    async fn load_record(&self, internal_id: &str) -> Result<Option<QueueJobRecord>, SchedulerError> {
        let mut connection = self.connection().await?;
        let raw: Option<String> = connection
            .get(record_key(internal_id))
            .await
            .map_err(|e| SchedulerError::State(e.to_string()))?;

        raw.map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| SchedulerError::State(format!("corrupt job record: {e}")))
        })
        .transpose()
    }

    async fn store_record(
        &self,
        internal_id: &str,
        record: &QueueJobRecord,
    ) -> Result<(), SchedulerError> {
        let raw = serde_json::to_string(record)
            .map_err(|e| SchedulerError::Submit(format!("unable to encode job record: {e}")))?;
        let mut connection = self.connection().await?;
        connection
            .set::<_, _, ()>(record_key(internal_id), raw)
            .await
            .map_err(|e| SchedulerError::Submit(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Scheduler for QueueScheduler {
    async fn submit(
        &self,
        description: &JobDescription,
        staged: &RemoteHandle,
    ) -> Result<String, SchedulerError> {
        if let Some(existing) = read_handle_sentinel(&description.job_dir) {
            trace!("Reusing scheduler handle '{existing}'.");
            return Ok(existing);
        }

        let mut connection = self.connection().await?;
        let backlog: usize = connection
            .llen(self.queue_key())
            .await
            .map_err(|e| SchedulerError::Submit(e.to_string()))?;
        if backlog >= self.max_jobs {
            return Err(SchedulerError::Submit(format!(
                "queue '{}' is full ({backlog} jobs waiting)",
                self.queue
            )));
        }

        let internal_id = format!("arq-{}", Uuid::new_v4());
        let record = QueueJobRecord {
            state: QueueJobState::Queued,
            exit_code: None,
            reason: None,
            cancel_requested: false,
            job_timeout: self.job_timeout,
            staged_dir: staged.0.clone(),
            description: description.clone(),
        };

        self.store_record(&internal_id, &record).await?;
        write_handle_sentinel(&description.job_dir, &internal_id)?;

        connection
            .rpush::<_, _, ()>(self.queue_key(), &internal_id)
            .await
            .map_err(|e| SchedulerError::Submit(e.to_string()))?;

        debug!("Queued '{internal_id}' on '{}'.", self.queue);
        Ok(internal_id)
    }

    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError> {
        match self.load_record(internal_id).await? {
            Some(record) => Ok(map_record(&record)),
            None => Err(SchedulerError::State(format!(
                "unknown job '{internal_id}'"
            ))),
        }
    }

    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError> {
        let Some(mut record) = self
            .load_record(internal_id)
            .await
            .map_err(|e| SchedulerError::Cancel(e.to_string()))?
        else {
            return Ok(());
        };

        match record.state {
            QueueJobState::Queued => {
                let mut connection = self
                    .connection()
                    .await
                    .map_err(|e| SchedulerError::Cancel(e.to_string()))?;
                connection
                    .lrem::<_, _, ()>(self.queue_key(), 0, internal_id)
                    .await
                    .map_err(|e| SchedulerError::Cancel(e.to_string()))?;

                record.state = QueueJobState::Error;
                record.reason = Some(REASON_CANCELLED.to_string());
                self.store_record(internal_id, &record)
                    .await
                    .map_err(|e| SchedulerError::Cancel(e.to_string()))?;
            }
            QueueJobState::Running => {
                // The worker owns the process; ask it to stop.
                record.cancel_requested = true;
                self.store_record(internal_id, &record)
                    .await
                    .map_err(|e| SchedulerError::Cancel(e.to_string()))?;
            }
            QueueJobState::Ok | QueueJobState::Error => {}
        }
        Ok(())
    }

    async fn close(&self) {
        self.manager.lock().await.take();
    }
}

fn record_key(internal_id: &str) -> String {
    format!("porter:job:{internal_id}")
}

fn map_record(record: &QueueJobRecord) -> SchedulerState {
    match record.state {
        QueueJobState::Queued => SchedulerState::Queued,
        QueueJobState::Running => SchedulerState::Running,
        QueueJobState::Ok => SchedulerState::Ok {
            exit_code: record.exit_code.unwrap_or(0),
        },
        QueueJobState::Error => SchedulerState::Error {
            exit_code: record.exit_code,
            reason: record
                .reason
                .clone()
                .unwrap_or_else(|| "worker reported failure".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::parallel;
    use std::path::PathBuf;

    fn record(state: QueueJobState) -> QueueJobRecord {
        QueueJobRecord {
            state,
            exit_code: None,
            reason: None,
            cancel_requested: false,
            job_timeout: 120,
            staged_dir: "/var/lib/porter/jobs/3".to_string(),
            description: JobDescription::new(
                "wc README.md".to_string(),
                PathBuf::from("/var/lib/porter/jobs/3"),
            ),
        }
    }

    #[test]
    #[parallel]
    fn record_round_trips_with_snake_case_states() {
        let raw = serde_json::to_string(&record(QueueJobState::Queued)).unwrap();
        assert!(raw.contains("\"state\":\"queued\""));
        assert!(raw.contains("\"job_timeout\":120"));

        let back: QueueJobRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, record(QueueJobState::Queued));
    }

    #[test]
    #[parallel]
    fn worker_states_map_to_scheduler_states() {
        assert_eq!(map_record(&record(QueueJobState::Queued)), SchedulerState::Queued);
        assert_eq!(
            map_record(&record(QueueJobState::Running)),
            SchedulerState::Running
        );

        let mut done = record(QueueJobState::Ok);
        done.exit_code = Some(0);
        assert_eq!(map_record(&done), SchedulerState::Ok { exit_code: 0 });

        let mut failed = record(QueueJobState::Error);
        failed.exit_code = Some(9);
        failed.reason = Some("killed by timeout".to_string());
        assert_eq!(
            map_record(&failed),
            SchedulerState::Error {
                exit_code: Some(9),
                reason: "killed by timeout".to_string()
            }
        );
    }

    #[test]
    #[parallel]
    fn keys_are_namespaced() {
        assert_eq!(record_key("arq-1"), "porter:job:arq-1");
        let scheduler =
            QueueScheduler::new("redis://localhost:6379/0", "fast".to_string(), 10, 60).unwrap();
        assert_eq!(scheduler.queue_key(), "porter:queue:fast");
    }

    #[test]
    #[parallel]
    fn invalid_dsn_is_rejected() {
        let error = QueueScheduler::new("not a dsn", "fast".to_string(), 10, 60);
        assert!(matches!(error, Err(SchedulerError::Submit(_))));
    }
}
