// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use indexmap::IndexMap;
use log::{debug, error, info, trace, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::application::{ApplicationRegistry, Principal};
use crate::config::Configuration;
use crate::destination::{build_destinations, Destination, DestinationPicker, PickerRegistry};
use crate::fs::FsError;
use crate::job::{
    Job, JobDescription, JobState, REASON_LOST_TO_RESTART, REASON_SCHEDULER_UNREACHABLE,
};
use crate::scheduler::{read_handle_sentinel, SchedulerState};
use crate::store::{JobStore, StateUpdate};
use crate::{
    Error, INPUT_DIRECTORY_NAME, META_FILE_NAME, OUTPUT_DIRECTORY_NAME, RETURNCODE_FILE_NAME,
};

/// Per-job polling starts here and backs off multiplicatively while the
/// observed state does not change.
const POLL_INITIAL: Duration = Duration::from_secs(1);
const POLL_MAX: Duration = Duration::from_secs(60);
const POLL_FACTOR: f64 = 1.5;

/// At most this many scheduler polls run concurrently.
const MAX_CONCURRENT_POLLS: usize = 32;

/// Consecutive state-query failures tolerated before a job is marked
/// unreachable.
const MAX_STATE_ERRORS: u32 = 10;

/// Delays between stage-out/stage-in retries after a transient failure.
const STAGE_RETRY_DELAYS: [u64; 5] = [5, 10, 20, 40, 80];

/// How long shutdown waits for in-flight staging before abandoning it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A normalized submission, produced by the HTTP boundary.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    /// The user-provided job name.
    pub name: String,

    /// The application to run.
    pub application: String,

    /// Parameters to validate against the application's input schema.
    pub parameters: Value,

    /// Directory holding the unpacked archive. Its contents move into the
    /// job directory; the directory itself is left to the caller.
    pub upload_dir: PathBuf,

    /// Opaque token delivered to the job through the `meta` file.
    pub token: String,
}

/// In-memory polling state for one job.
struct JobTracker {
    /// Serializes every state transition for the job.
    lock: tokio::sync::Mutex<()>,
    poll: Mutex<PollState>,
    /// True while a poll task or the submission task owns the job.
    busy: AtomicBool,
    /// True while the initial submission runs in this process.
    submitting: AtomicBool,
    /// True only for jobs inherited from a previous process. A job whose
    /// submission runs (or ran) in this process must never be "recovered":
    /// a reconcile tick can land between `create_job` making the job
    /// visible and the submission task starting, and recovery would fail
    /// the healthy in-flight submission.
    inherited: AtomicBool,
    consecutive_state_errors: AtomicU32,
}

struct PollState {
    delay: Duration,
    due: Instant,
}

impl JobTracker {
    fn new() -> Self {
        JobTracker {
            lock: tokio::sync::Mutex::new(()),
            poll: Mutex::new(PollState {
                delay: POLL_INITIAL,
                due: Instant::now(),
            }),
            busy: AtomicBool::new(false),
            submitting: AtomicBool::new(false),
            inherited: AtomicBool::new(false),
            consecutive_state_errors: AtomicU32::new(0),
        }
    }

    fn is_due(&self) -> bool {
        self.poll.lock().expect("unpoisoned poll state").due <= Instant::now()
    }

    /// The observed state changed: poll again soon.
    fn observed_change(&self) {
        let mut poll = self.poll.lock().expect("unpoisoned poll state");
        poll.delay = POLL_INITIAL;
        poll.due = Instant::now() + poll.delay;
    }

    /// Nothing changed: back off.
    fn observed_no_change(&self) {
        let mut poll = self.poll.lock().expect("unpoisoned poll state");
        poll.delay = Duration::from_secs_f64((poll.delay.as_secs_f64() * POLL_FACTOR).min(POLL_MAX.as_secs_f64()));
        poll.due = Instant::now() + poll.delay;
    }

    fn claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Drives jobs through their lifecycle across destinations.
///
/// One orchestrator owns all destinations, the per-job polling state, and
/// the background reconcile loop. Every state transition for a given job is
/// linearised by that job's tracker lock; the store is read again under the
/// lock before each transition attempt.
///
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    registry: Arc<ApplicationRegistry>,
    destinations: IndexMap<String, Destination>,
    destination_names: Vec<String>,
    picker: Arc<dyn DestinationPicker>,
    picker_name: String,
    job_root: PathBuf,
    trackers: Mutex<HashMap<i64, Arc<JobTracker>>>,
    poll_permits: Arc<Semaphore>,
    tasks: TaskTracker,
    stop: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        configuration: &Configuration,
        registry: Arc<ApplicationRegistry>,
        store: Arc<dyn JobStore>,
        pickers: &PickerRegistry,
    ) -> Result<Arc<Self>, Error> {
        let destinations = build_destinations(configuration)?;
        let destination_names: Vec<String> = destinations.keys().cloned().collect();
        let picker = pickers.get(&configuration.destination_picker)?;

        Ok(Arc::new(Orchestrator {
            store,
            registry,
            destinations,
            destination_names,
            picker,
            picker_name: configuration.destination_picker.clone(),
            job_root: configuration.job_root_dir.clone(),
            trackers: Mutex::new(HashMap::new()),
            poll_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_POLLS)),
            tasks: TaskTracker::new(),
            stop: CancellationToken::new(),
        }))
    }

    pub fn job_root(&self) -> &Path {
        &self.job_root
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    fn tracker(&self, job_id: i64) -> Arc<JobTracker> {
        let mut trackers = self.trackers.lock().expect("unpoisoned trackers");
        Arc::clone(
            trackers
                .entry(job_id)
                .or_insert_with(|| Arc::new(JobTracker::new())),
        )
    }

    fn destination(&self, name: &str) -> Result<&Destination, Error> {
        self.destinations
            .get(name)
            .ok_or_else(|| Error::DestinationInvalid(name.to_string(), "not configured".into()))
    }

    /// Accept a submission: validate, pick a destination, record the job,
    /// and start staging in the background.
    ///
    /// Validation failures and an unknown destination from the picker leave
    /// no job behind.
    pub async fn submit(
        self: &Arc<Self>,
        principal: &Principal,
        request: SubmitRequest,
    ) -> Result<i64, Error> {
        let command = self.registry.prepare_command(
            &request.application,
            principal,
            &request.upload_dir,
            &request.parameters,
        )?;

        let destination_name = self.picker.pick(
            &request.upload_dir,
            &request.application,
            principal,
            &self.destination_names,
        );
        if !self.destinations.contains_key(&destination_name) {
            return Err(Error::UnknownDestination(
                self.picker_name.clone(),
                destination_name,
            ));
        }

        let job_id = self
            .store
            .create_job(
                &principal.user_id,
                &request.application,
                &destination_name,
                &request.name,
            )
            .await?;

        let job_dir = self.job_root.join(job_id.to_string());
        build_job_dir(&job_dir, &request.upload_dir, &request.token)?;

        info!(
            "Job {job_id}: '{}' for '{}' on '{destination_name}'.",
            request.application, principal.user_id
        );

        let tracker = self.tracker(job_id);
        tracker.submitting.store(true, Ordering::Release);

        let orchestrator = Arc::clone(self);
        self.tasks.spawn(async move {
            orchestrator.run_submission(job_id, command).await;
        });

        Ok(job_id)
    }

    async fn run_submission(self: Arc<Self>, job_id: i64, command: String) {
        let tracker = self.tracker(job_id);
        let _guard = tracker.lock.lock().await;

        if let Err(err) = self.try_submission(job_id, command).await {
            error!("Job {job_id}: submission failed: {err}");
            self.fail_job(job_id, None, err.to_string()).await;
        }

        tracker.submitting.store(false, Ordering::Release);
    }

    async fn try_submission(&self, job_id: i64, command: String) -> Result<(), Error> {
        let job = self.store.get_job(job_id).await?;
        let destination = self.destination(&job.destination)?;
        let job_dir = job.job_dir(&self.job_root);

        self.store
            .set_state(job_id, JobState::StagingOut, StateUpdate::default())
            .await?;

        let filesystem = Arc::clone(&destination.filesystem);
        let upload_dir = job_dir.clone();
        let upload_job = job.clone();
        let staged = retry_transient("stage-out", job_id, move || {
            let filesystem = Arc::clone(&filesystem);
            let dir = upload_dir.clone();
            let job = upload_job.clone();
            async move { filesystem.upload(&dir, &job).await }
        })
        .await?;

        let description = JobDescription::new(command, job_dir);
        let internal_id = destination.scheduler.submit(&description, &staged).await?;

        self.store
            .set_state(
                job_id,
                JobState::Queued,
                StateUpdate::with_internal_id(internal_id.clone()),
            )
            .await?;

        debug!("Job {job_id}: queued as '{internal_id}'.");
        self.tracker(job_id).observed_change();
        Ok(())
    }

    /// One reconcile pass: poll every non-terminal job whose backoff is
    /// due, bounded by the poll semaphore.
    pub async fn reconcile(self: &Arc<Self>) -> Result<(), Error> {
        let jobs = self.store.list_non_terminal().await?;
        trace!("Reconciling {} non-terminal job(s).", jobs.len());

        for job in jobs {
            if self.stop.is_cancelled() {
                break;
            }

            let tracker = self.tracker(job.id);
            if !tracker.is_due() || !tracker.claim() {
                continue;
            }

            let orchestrator = Arc::clone(self);
            let permits = Arc::clone(&self.poll_permits);
            self.tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("open semaphore");
                orchestrator.poll_job(job.id).await;
                orchestrator.tracker(job.id).release();
            });
        }

        Ok(())
    }

    async fn poll_job(self: &Arc<Self>, job_id: i64) {
        let tracker = self.tracker(job_id);
        let _guard = tracker.lock.lock().await;

        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(err) => {
                warn!("Job {job_id}: unable to read: {err}");
                return;
            }
        };

        if job.state.is_terminal() {
            return;
        }

        match job.state {
            JobState::New | JobState::StagingOut => {
                if tracker.submitting.load(Ordering::Acquire) {
                    // The submission task owns the job right now.
                } else if tracker.inherited.load(Ordering::Acquire) {
                    self.resume_submission(&job).await;
                } else {
                    // Recorded in this process; the submission task has not
                    // reached the tracker lock yet.
                    tracker.observed_no_change();
                }
            }
            JobState::Queued | JobState::Running => {
                self.poll_scheduler(&tracker, &job).await;
            }
            JobState::StagingIn => {
                // A previous run stopped mid stage-in; observe the terminal
                // state again and finish the download.
                self.poll_scheduler(&tracker, &job).await;
            }
            JobState::Ok | JobState::Error => {}
        }
    }

    /// Recover a job that a previous process left between acceptance and
    /// `queued`.
    ///
    /// Reached only for jobs marked inherited by `startup()`. The submit
    /// sentinel tells the two cases apart: with a sentinel, the scheduler
    /// accepted the job before the crash and polling can resume; without
    /// one, the command is gone and the job cannot continue.
    async fn resume_submission(&self, job: &Job) {
        let job_dir = job.job_dir(&self.job_root);
        match read_handle_sentinel(&job_dir) {
            Some(internal_id) => {
                info!(
                    "Job {}: recovered scheduler handle '{internal_id}' from the sentinel.",
                    job.id
                );
                if let Err(err) = self
                    .store
                    .set_state(
                        job.id,
                        JobState::Queued,
                        StateUpdate::with_internal_id(internal_id),
                    )
                    .await
                {
                    warn!("Job {}: unable to record recovery: {err}", job.id);
                }
                self.tracker(job.id).observed_change();
            }
            None => {
                self.fail_job(
                    job.id,
                    None,
                    "submission interrupted before the scheduler accepted the job".to_string(),
                )
                .await;
            }
        }
    }

    async fn poll_scheduler(&self, tracker: &JobTracker, job: &Job) {
        let destination = match self.destination(&job.destination) {
            Ok(destination) => destination,
            Err(err) => {
                self.fail_job(job.id, None, err.to_string()).await;
                return;
            }
        };

        let Some(internal_id) = &job.internal_id else {
            self.fail_job(job.id, None, "no scheduler handle recorded".to_string())
                .await;
            return;
        };

        match destination.scheduler.state(internal_id).await {
            Err(err) => {
                let failures = tracker
                    .consecutive_state_errors
                    .fetch_add(1, Ordering::AcqRel)
                    + 1;
                warn!(
                    "Job {}: state query failed ({failures}/{MAX_STATE_ERRORS}): {err}",
                    job.id
                );
                if failures > MAX_STATE_ERRORS {
                    self.fail_job(job.id, None, REASON_SCHEDULER_UNREACHABLE.to_string())
                        .await;
                } else {
                    tracker.observed_no_change();
                }
            }
            Ok(state) => {
                tracker.consecutive_state_errors.store(0, Ordering::Release);
                match state {
                    SchedulerState::Queued => tracker.observed_no_change(),
                    SchedulerState::Running => {
                        if job.state == JobState::Queued {
                            if let Err(err) = self
                                .store
                                .set_state(job.id, JobState::Running, StateUpdate::default())
                                .await
                            {
                                warn!("Job {}: {err}", job.id);
                            }
                            tracker.observed_change();
                        } else {
                            tracker.observed_no_change();
                        }
                    }
                    terminal => self.stage_in(tracker, job, destination, terminal).await,
                }
            }
        }
    }

    /// Bring results back and record the observed terminal state.
    async fn stage_in(
        &self,
        tracker: &JobTracker,
        job: &Job,
        destination: &Destination,
        observed: SchedulerState,
    ) {
        if job.state != JobState::StagingIn {
            if let Err(err) = self
                .store
                .set_state(job.id, JobState::StagingIn, StateUpdate::default())
                .await
            {
                warn!("Job {}: {err}", job.id);
                return;
            }
        }

        let job_dir = job.job_dir(&self.job_root);
        let handle = destination.filesystem.staged_handle(&job_dir, job);

        let filesystem = Arc::clone(&destination.filesystem);
        let download_handle = handle.clone();
        let download_dir = job_dir.clone();
        let download_job = job.clone();
        let downloaded = retry_transient("stage-in", job.id, move || {
            let filesystem = Arc::clone(&filesystem);
            let handle = download_handle.clone();
            let dir = download_dir.clone();
            let job = download_job.clone();
            async move { filesystem.download(&handle, &dir, &job).await }
        })
        .await;

        match downloaded {
            Ok(()) => {
                let (new_state, update) = match observed {
                    SchedulerState::Ok { exit_code } => (
                        JobState::Ok,
                        StateUpdate {
                            exit_code: Some(exit_code),
                            ..StateUpdate::default()
                        },
                    ),
                    SchedulerState::Error { exit_code, reason } => (
                        JobState::Error,
                        StateUpdate {
                            // Schedulers that only observe a coarse status
                            // (the grid WMS reports Failed with no number)
                            // leave the code to the staged returncode file.
                            exit_code: exit_code.or_else(|| read_returncode(&job_dir)),
                            reason: Some(reason),
                            ..StateUpdate::default()
                        },
                    ),
                    SchedulerState::Queued | SchedulerState::Running => unreachable!(),
                };

                match self.store.set_state(job.id, new_state, update).await {
                    Ok(job) => info!("Job {}: finished in state '{}'.", job.id, job.state),
                    Err(err) => warn!("Job {}: {err}", job.id),
                }
            }
            Err(err) => {
                self.fail_job(job.id, None, format!("stage-in failed: {err}"))
                    .await;
            }
        }

        destination.filesystem.teardown(&handle).await;
        tracker.observed_change();
    }

    /// Request cancellation.
    ///
    /// Terminal jobs are a successful no-op. The resulting terminal state
    /// is observed through normal polling.
    pub async fn cancel(self: &Arc<Self>, job_id: i64) -> Result<(), Error> {
        let job = self.store.get_job(job_id).await?;
        if job.state.is_terminal() {
            return Ok(());
        }

        let tracker = self.tracker(job_id);
        let _guard = tracker.lock.lock().await;

        // Reread: the submission or a poll may have advanced the job while
        // we waited for the lock.
        let job = self.store.get_job(job_id).await?;
        if job.state.is_terminal() {
            return Ok(());
        }

        match &job.internal_id {
            Some(internal_id) => {
                let destination = self.destination(&job.destination)?;
                destination.scheduler.cancel(internal_id).await?;
                info!("Job {job_id}: cancellation requested.");
                tracker.observed_change();
            }
            None => {
                // Not yet accepted by a scheduler; nothing to cancel there.
                self.fail_job(job_id, None, crate::job::REASON_CANCELLED.to_string())
                    .await;
            }
        }
        Ok(())
    }

    /// Reconcile state left over from a previous run.
    ///
    /// Jobs on schedulers that do not survive restarts are marked lost;
    /// everything else resumes polling from the recorded state.
    pub async fn startup(self: &Arc<Self>) -> Result<(), Error> {
        let jobs = self.store.list_non_terminal().await?;
        info!("Startup reconcile of {} job(s).", jobs.len());

        for job in &jobs {
            match self.destinations.get(&job.destination) {
                None => {
                    self.fail_job(
                        job.id,
                        None,
                        format!("destination '{}' is no longer configured", job.destination),
                    )
                    .await;
                }
                Some(destination) if !destination.scheduler.survives_restart() => {
                    self.fail_job(job.id, None, REASON_LOST_TO_RESTART.to_string())
                        .await;
                }
                Some(_) => {
                    // Ensure a tracker exists so the reconcile pass polls
                    // the job immediately, and allow interrupted
                    // submissions to be recovered.
                    let tracker = self.tracker(job.id);
                    tracker.inherited.store(true, Ordering::Release);
                }
            }
        }

        self.reconcile().await
    }

    /// Run reconcile passes until shutdown.
    pub async fn reconcile_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.reconcile().await {
                        warn!("Reconcile pass failed: {err}");
                    }
                }
            }
        }
        debug!("Reconcile loop stopped.");
    }

    /// Stop the reconcile loop and wait for in-flight staging.
    ///
    /// Tasks that outlive the grace period are abandoned; their jobs stay
    /// non-terminal and the next startup reconciles them.
    pub async fn shutdown(&self) {
        info!("Shutting down.");
        self.stop.cancel();
        self.tasks.close();

        if timeout(SHUTDOWN_GRACE, self.tasks.wait()).await.is_err() {
            warn!("Abandoning in-flight staging; the next startup will reconcile it.");
        }

        for destination in self.destinations.values() {
            destination.scheduler.close().await;
        }
    }

    async fn fail_job(&self, job_id: i64, exit_code: Option<i32>, reason: String) {
        warn!("Job {job_id}: error: {reason}");
        let update = StateUpdate {
            exit_code,
            reason: Some(reason),
            ..StateUpdate::default()
        };
        if let Err(err) = self.store.set_state(job_id, JobState::Error, update).await {
            warn!("Job {job_id}: unable to record failure: {err}");
        }
    }
}

/// Retry a staging operation on transient failures, with the fixed backoff
/// ladder. Permanent failures and an exhausted ladder propagate.
async fn retry_transient<T, F, Fut>(
    operation: &str,
    job_id: i64,
    mut attempt_fn: F,
) -> Result<T, FsError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, FsError>>,
{
    let mut attempts = 0;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempts < STAGE_RETRY_DELAYS.len() => {
                let delay = Duration::from_secs(STAGE_RETRY_DELAYS[attempts]);
                attempts += 1;
                warn!(
                    "Job {job_id}: {operation} attempt {attempts} failed: {err}. Retrying in {}s.",
                    delay.as_secs()
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Read the exit code the command wrote into the job directory, when the
/// file came back on stage-in.
fn read_returncode(job_dir: &Path) -> Option<i32> {
    fs::read_to_string(job_dir.join(RETURNCODE_FILE_NAME))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Lay out a fresh job directory: move the unpacked archive into `input/`,
/// create `output/`, and write the `meta` token file.
fn build_job_dir(job_dir: &Path, upload_dir: &Path, token: &str) -> Result<(), Error> {
    let input_dir = job_dir.join(INPUT_DIRECTORY_NAME);
    fs::create_dir_all(&input_dir).map_err(|e| Error::DirectoryCreate(input_dir.clone(), e))?;

    let output_dir = job_dir.join(OUTPUT_DIRECTORY_NAME);
    fs::create_dir_all(&output_dir).map_err(|e| Error::DirectoryCreate(output_dir, e))?;

    move_tree(upload_dir, &input_dir)?;

    let meta = job_dir.join(META_FILE_NAME);
    fs::write(&meta, format!("{token}\n")).map_err(|e| Error::FileWrite(meta, e))
}

/// Move the contents of `source` into `target`, falling back to a copy
/// when rename crosses filesystems.
fn move_tree(source: &Path, target: &Path) -> Result<(), Error> {
    for entry in fs::read_dir(source).map_err(|e| Error::DirectoryRead(source.to_path_buf(), e))? {
        let entry = entry.map_err(|e| Error::DirectoryRead(source.to_path_buf(), e))?;
        let from = entry.path();
        let to = target.join(entry.file_name());

        if fs::rename(&from, &to).is_err() {
            copy_tree(&from, &to)?;
            if let Err(err) = if from.is_dir() {
                fs::remove_dir_all(&from)
            } else {
                fs::remove_file(&from)
            } {
                warn!("Unable to remove '{}': {err}", from.display());
            }
        }
    }
    Ok(())
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), Error> {
    if source.is_dir() {
        fs::create_dir_all(target).map_err(|e| Error::DirectoryCreate(target.to_path_buf(), e))?;
        for entry in
            fs::read_dir(source).map_err(|e| Error::DirectoryRead(source.to_path_buf(), e))?
        {
            let entry = entry.map_err(|e| Error::DirectoryRead(source.to_path_buf(), e))?;
            copy_tree(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else {
        fs::copy(source, target).map_err(|e| Error::FileWrite(target.to_path_buf(), e))?;
    }
    Ok(())
}
