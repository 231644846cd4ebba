// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// The lifecycle state of a job.
///
/// States advance along the directed graph
/// `new → staging_out → queued → running → staging_in → (ok|error)` where
/// `staging_out` and `staging_in` are optional, and any non-terminal state
/// may fall directly to `error`.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    StagingOut,
    Queued,
    Running,
    StagingIn,
    Ok,
    Error,
}

impl JobState {
    /// `ok` and `error` are terminal; no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Ok | JobState::Error)
    }

    /// Test whether the state graph permits moving from `self` to `next`.
    pub fn may_transition_to(self, next: JobState) -> bool {
        if next == JobState::Error {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (JobState::New, JobState::StagingOut | JobState::Queued)
                | (JobState::StagingOut, JobState::Queued)
                | (JobState::Queued, JobState::Running | JobState::StagingIn)
                | (JobState::Running, JobState::StagingIn)
                | (JobState::StagingIn, JobState::Ok)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::New => "new",
            JobState::StagingOut => "staging_out",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::StagingIn => "staging_in",
            JobState::Ok => "ok",
            JobState::Error => "error",
        };
        write!(f, "{name}")
    }
}

// Reasons recorded with terminal `error` states.
pub const REASON_LOST_TO_RESTART: &str = "lost_to_restart";
pub const REASON_SCHEDULER_UNREACHABLE: &str = "scheduler_unreachable";
pub const REASON_CANCELLED: &str = "cancelled";

/// A user-submitted unit of work bound to one application and one
/// destination.
///
/// Jobs are created by the orchestrator on submission and mutated only by
/// the orchestrator, through the job store. The core never deletes them.
///
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Job {
    /// Monotonic identifier assigned by the job store.
    pub id: i64,

    /// The user-provided display name.
    pub name: String,

    /// The application this job runs.
    pub application: String,

    /// The user id of the submitter.
    pub submitter: String,

    /// The destination the job is bound to for its entire lifetime.
    pub destination: String,

    /// The current lifecycle state.
    pub state: JobState,

    /// The scheduler-native identifier, set exactly when entering `queued`.
    pub internal_id: Option<String>,

    /// The exit code of the command, when known at a terminal state.
    pub exit_code: Option<i32>,

    /// A human-readable reason recorded with the `error` state.
    pub reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The job's local directory under the configured job root.
    pub fn job_dir(&self, job_root: &Path) -> PathBuf {
        job_root.join(self.id.to_string())
    }
}

/// Everything a scheduler needs to execute one job.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobDescription {
    /// The final rendered command line.
    pub command: String,

    /// The job's local directory (absolute).
    pub job_dir: PathBuf,

    /// Maximum CPU time in seconds, when the application requests a limit.
    pub cpu_time: Option<u64>,

    /// Maximum resident memory in megabytes.
    pub memory_mb: Option<u64>,
}

impl JobDescription {
    pub fn new(command: String, job_dir: PathBuf) -> Self {
        JobDescription {
            command,
            job_dir,
            cpu_time: None,
            memory_mb: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::parallel;

    const ALL: [JobState; 7] = [
        JobState::New,
        JobState::StagingOut,
        JobState::Queued,
        JobState::Running,
        JobState::StagingIn,
        JobState::Ok,
        JobState::Error,
    ];

    #[test]
    #[parallel]
    fn terminal_states_are_absorbing() {
        for from in [JobState::Ok, JobState::Error] {
            for to in ALL {
                assert!(
                    !from.may_transition_to(to),
                    "{from} must not transition to {to}"
                );
            }
        }
    }

    #[test]
    #[parallel]
    fn any_non_terminal_state_may_fail() {
        for from in ALL {
            if !from.is_terminal() {
                assert!(from.may_transition_to(JobState::Error));
            }
        }
    }

    #[test]
    #[parallel]
    fn happy_paths() {
        // With and without the optional staging states.
        for path in [
            vec![
                JobState::New,
                JobState::StagingOut,
                JobState::Queued,
                JobState::Running,
                JobState::StagingIn,
                JobState::Ok,
            ],
            vec![
                JobState::New,
                JobState::Queued,
                JobState::Running,
                JobState::StagingIn,
                JobState::Ok,
            ],
            // A job that finished between polls.
            vec![
                JobState::New,
                JobState::StagingOut,
                JobState::Queued,
                JobState::StagingIn,
                JobState::Error,
            ],
        ] {
            for pair in path.windows(2) {
                assert!(
                    pair[0].may_transition_to(pair[1]),
                    "{} -> {} must be valid",
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    #[test]
    #[parallel]
    fn no_skipping_backwards() {
        assert!(!JobState::Running.may_transition_to(JobState::Queued));
        assert!(!JobState::Queued.may_transition_to(JobState::New));
        assert!(!JobState::StagingIn.may_transition_to(JobState::Running));
        assert!(!JobState::New.may_transition_to(JobState::Ok));
        assert!(!JobState::Running.may_transition_to(JobState::Ok));
    }

    #[test]
    #[parallel]
    fn state_names_round_trip() {
        for state in ALL {
            let text = serde_json::to_string(&state).expect("serializable state");
            assert_eq!(text, format!("\"{state}\""));
            let back: JobState = serde_json::from_str(&text).expect("parsable state");
            assert_eq!(back, state);
        }
    }
}
