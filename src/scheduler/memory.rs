// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::fs::RemoteHandle;
use crate::job::JobDescription;
use crate::scheduler::{
    read_handle_sentinel, write_handle_sentinel, Scheduler, SchedulerError, SchedulerState,
};
use crate::{RETURNCODE_FILE_NAME, STDERR_FILE_NAME, STDOUT_FILE_NAME};

/// Executes jobs in-process on a bounded pool of worker fibers.
///
/// Jobs wait in a FIFO until one of the `slots` workers picks them up.
/// Nothing survives the process: the orchestrator marks jobs submitted
/// here as lost when the service restarts.
///
pub struct MemoryScheduler {
    queue: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    states: Arc<Mutex<HashMap<String, SchedulerState>>>,
    cancelled: Arc<Mutex<HashSet<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct WorkItem {
    internal_id: String,
    command: String,
    work_dir: PathBuf,
    cpu_time: Option<u64>,
}

impl MemoryScheduler {
    pub fn new(slots: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let states = Arc::new(Mutex::new(HashMap::new()));
        let cancelled = Arc::new(Mutex::new(HashSet::new()));

        let workers = (0..slots.max(1))
            .map(|index| {
                tokio::spawn(run_worker(
                    index,
                    Arc::clone(&receiver),
                    Arc::clone(&states),
                    Arc::clone(&cancelled),
                ))
            })
            .collect();

        MemoryScheduler {
            queue: Mutex::new(Some(sender)),
            states,
            cancelled,
            workers: Mutex::new(workers),
        }
    }

    fn set_state(&self, internal_id: &str, state: SchedulerState) {
        self.states
            .lock()
            .expect("unpoisoned states")
            .insert(internal_id.to_string(), state);
    }
}

#[async_trait::async_trait]
impl Scheduler for MemoryScheduler {
    async fn submit(
        &self,
        description: &JobDescription,
        staged: &RemoteHandle,
    ) -> Result<String, SchedulerError> {
        // A sentinel means this description was already accepted, either in
        // this process or in one that crashed. Never run it twice.
        if let Some(existing) = read_handle_sentinel(&description.job_dir) {
            trace!("Reusing scheduler handle '{existing}'.");
            return Ok(existing);
        }

        let internal_id = format!("mem-{}", Uuid::new_v4());
        self.set_state(&internal_id, SchedulerState::Queued);
        write_handle_sentinel(&description.job_dir, &internal_id)?;

        let item = WorkItem {
            internal_id: internal_id.clone(),
            command: description.command.clone(),
            work_dir: PathBuf::from(&staged.0),
            cpu_time: description.cpu_time,
        };

        let sent = self
            .queue
            .lock()
            .expect("unpoisoned queue")
            .as_ref()
            .map(|sender| sender.send(item));
        match sent {
            Some(Ok(())) => {
                debug!("Queued '{internal_id}' in memory.");
                Ok(internal_id)
            }
            _ => {
                self.states
                    .lock()
                    .expect("unpoisoned states")
                    .remove(&internal_id);
                Err(SchedulerError::Submit("scheduler is closed".to_string()))
            }
        }
    }

    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError> {
        self.states
            .lock()
            .expect("unpoisoned states")
            .get(internal_id)
            .cloned()
            .ok_or_else(|| SchedulerError::State(format!("unknown job '{internal_id}'")))
    }

    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError> {
        self.cancelled
            .lock()
            .expect("unpoisoned set")
            .insert(internal_id.to_string());

        let mut states = self.states.lock().expect("unpoisoned states");
        if let Some(state) = states.get_mut(internal_id) {
            if *state == SchedulerState::Queued {
                *state = cancelled_state();
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.queue.lock().expect("unpoisoned queue").take();
        let workers = std::mem::take(&mut *self.workers.lock().expect("unpoisoned workers"));
        for worker in workers {
            worker.abort();
        }
    }

    fn survives_restart(&self) -> bool {
        false
    }
}

fn cancelled_state() -> SchedulerState {
    SchedulerState::Error {
        exit_code: None,
        reason: crate::job::REASON_CANCELLED.to_string(),
    }
}

async fn run_worker(
    index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    states: Arc<Mutex<HashMap<String, SchedulerState>>>,
    cancelled: Arc<Mutex<HashSet<String>>>,
) {
    loop {
        let item = { receiver.lock().await.recv().await };
        let Some(item) = item else {
            trace!("Memory worker {index} stopping.");
            break;
        };

        if cancelled
            .lock()
            .expect("unpoisoned set")
            .contains(&item.internal_id)
        {
            states
                .lock()
                .expect("unpoisoned states")
                .insert(item.internal_id, cancelled_state());
            continue;
        }

        debug!("Memory worker {index} starts '{}'.", item.internal_id);
        states
            .lock()
            .expect("unpoisoned states")
            .insert(item.internal_id.clone(), SchedulerState::Running);

        let state = execute(&item).await;
        states
            .lock()
            .expect("unpoisoned states")
            .insert(item.internal_id, state);
    }
}

/// Run one command with stdout, stderr, and return code captured into the
/// staged directory.
///
/// The working directory is the unpacked archive (`input/`) when present,
/// so commands reference their uploads by bare name.
async fn execute(item: &WorkItem) -> SchedulerState {
    let stdout = match File::create(item.work_dir.join(STDOUT_FILE_NAME)) {
        Ok(file) => file,
        Err(error) => return spawn_failure(&error.to_string()),
    };
    let stderr = match File::create(item.work_dir.join(STDERR_FILE_NAME)) {
        Ok(file) => file,
        Err(error) => return spawn_failure(&error.to_string()),
    };

    let input_dir = item.work_dir.join(crate::INPUT_DIRECTORY_NAME);
    let work_dir = if input_dir.is_dir() {
        input_dir
    } else {
        item.work_dir.clone()
    };

    let child = Command::new("bash")
        .arg("-c")
        .arg(&item.command)
        .current_dir(&work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(error) => return spawn_failure(&error.to_string()),
    };

    let status = match item.cpu_time {
        Some(seconds) => match timeout(Duration::from_secs(seconds), child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                let _ = child.kill().await;
                return SchedulerState::Error {
                    exit_code: None,
                    reason: format!("timeout after {seconds} seconds"),
                };
            }
        },
        None => child.wait().await,
    };

    let status = match status {
        Ok(status) => status,
        Err(error) => return spawn_failure(&error.to_string()),
    };

    match status.code() {
        Some(code) => {
            let returncode = item.work_dir.join(RETURNCODE_FILE_NAME);
            if let Err(error) = std::fs::write(&returncode, format!("{code}\n")) {
                warn!("Unable to write '{}': {error}", returncode.display());
            }

            if code == 0 {
                SchedulerState::Ok { exit_code: 0 }
            } else {
                SchedulerState::Error {
                    exit_code: Some(code),
                    reason: format!("exit code {code}"),
                }
            }
        }
        None => SchedulerState::Error {
            exit_code: None,
            reason: "terminated by signal".to_string(),
        },
    }
}

fn spawn_failure(message: &str) -> SchedulerState {
    SchedulerState::Error {
        exit_code: None,
        reason: format!("unable to run command: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use serial_test::parallel;
    use std::path::Path;

    async fn wait_terminal(scheduler: &MemoryScheduler, internal_id: &str) -> SchedulerState {
        for _ in 0..200 {
            let state = scheduler.state(internal_id).await.expect("known job");
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job '{internal_id}' never reached a terminal state");
    }

    fn description(command: &str, dir: &Path) -> JobDescription {
        JobDescription::new(command.to_string(), dir.to_path_buf())
    }

    fn handle(dir: &Path) -> RemoteHandle {
        RemoteHandle(dir.to_string_lossy().into_owned())
    }

    #[tokio::test]
    #[parallel]
    async fn happy_path_writes_streams_and_returncode() {
        let temp = TempDir::new().unwrap();
        temp.child("README.md").write_str("hello\n").unwrap();

        let scheduler = MemoryScheduler::new(1);
        let description = description("wc README.md", temp.path());
        let id = scheduler
            .submit(&description, &handle(temp.path()))
            .await
            .unwrap();

        let state = wait_terminal(&scheduler, &id).await;
        assert_eq!(state, SchedulerState::Ok { exit_code: 0 });

        let stdout = std::fs::read_to_string(temp.path().join(STDOUT_FILE_NAME)).unwrap();
        let fields: Vec<&str> = stdout.split_whitespace().collect();
        assert_eq!(fields, ["1", "1", "6", "README.md"]);

        let returncode = std::fs::read_to_string(temp.path().join(RETURNCODE_FILE_NAME)).unwrap();
        assert_eq!(returncode.trim(), "0");

        scheduler.close().await;
    }

    #[tokio::test]
    #[parallel]
    async fn resubmission_reuses_the_sentinel() {
        let temp = TempDir::new().unwrap();

        let scheduler = MemoryScheduler::new(1);
        let description = description("echo ran >> log.txt", temp.path());

        let first = scheduler
            .submit(&description, &handle(temp.path()))
            .await
            .unwrap();
        wait_terminal(&scheduler, &first).await;

        let second = scheduler
            .submit(&description, &handle(temp.path()))
            .await
            .unwrap();
        assert_eq!(first, second);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let log = std::fs::read_to_string(temp.path().join("log.txt")).unwrap();
        assert_eq!(log.lines().count(), 1);

        scheduler.close().await;
    }

    #[tokio::test]
    #[parallel]
    async fn nonzero_exit_is_an_error_with_the_code() {
        let temp = TempDir::new().unwrap();

        let scheduler = MemoryScheduler::new(1);
        let id = scheduler
            .submit(&description("exit 3", temp.path()), &handle(temp.path()))
            .await
            .unwrap();

        let state = wait_terminal(&scheduler, &id).await;
        assert_eq!(
            state,
            SchedulerState::Error {
                exit_code: Some(3),
                reason: "exit code 3".to_string()
            }
        );

        let returncode = std::fs::read_to_string(temp.path().join(RETURNCODE_FILE_NAME)).unwrap();
        assert_eq!(returncode.trim(), "3");

        scheduler.close().await;
    }

    #[tokio::test]
    #[parallel]
    async fn queued_jobs_can_be_cancelled() {
        let busy = TempDir::new().unwrap();
        let waiting = TempDir::new().unwrap();

        let scheduler = MemoryScheduler::new(1);
        let _running = scheduler
            .submit(&description("sleep 30", busy.path()), &handle(busy.path()))
            .await
            .unwrap();
        let queued = scheduler
            .submit(&description("echo hi", waiting.path()), &handle(waiting.path()))
            .await
            .unwrap();

        scheduler.cancel(&queued).await.unwrap();
        // Cancelling twice is a no-op.
        scheduler.cancel(&queued).await.unwrap();

        let state = scheduler.state(&queued).await.unwrap();
        assert_eq!(state, cancelled_state());

        scheduler.close().await;
    }

    #[tokio::test]
    #[parallel]
    async fn cpu_time_limit_kills_the_command() {
        let temp = TempDir::new().unwrap();

        let scheduler = MemoryScheduler::new(1);
        let mut description = description("sleep 30", temp.path());
        description.cpu_time = Some(1);

        let id = scheduler
            .submit(&description, &handle(temp.path()))
            .await
            .unwrap();
        let state = wait_terminal(&scheduler, &id).await;
        assert!(matches!(
            state,
            SchedulerState::Error { exit_code: None, reason } if reason.contains("timeout")
        ));

        scheduler.close().await;
    }

    #[tokio::test]
    #[parallel]
    async fn unknown_job_is_a_state_error() {
        let scheduler = MemoryScheduler::new(1);
        let error = scheduler.state("mem-missing").await;
        assert!(matches!(error, Err(SchedulerError::State(_))));
        scheduler.close().await;
    }

    #[tokio::test]
    #[parallel]
    async fn memory_jobs_do_not_survive_restarts() {
        let scheduler = MemoryScheduler::new(1);
        assert!(!scheduler.survives_restart());
        scheduler.close().await;
    }
}
