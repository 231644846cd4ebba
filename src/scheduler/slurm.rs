// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use log::{debug, trace, warn};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::fs::RemoteHandle;
use crate::job::{JobDescription, REASON_CANCELLED};
use crate::scheduler::{
    read_handle_sentinel, write_handle_sentinel, Scheduler, SchedulerError, SchedulerState,
};
use crate::ssh::SshPool;

/// Accounting records propagate to `sacct` with a delay after submission.
/// Until this window passes, a missing record reads as `queued`.
const SACCT_GRACE: Duration = Duration::from_secs(60);

/// Submits jobs to Slurm with `sbatch` over SSH.
///
/// The internal id is the Slurm job id. State is read from `sacct`, which
/// also covers jobs that already left the queue.
///
pub struct SlurmScheduler {
    pool: Arc<SshPool>,
    partition: Option<String>,
    first_seen: Mutex<HashMap<String, Instant>>,
}

impl SlurmScheduler {
    pub fn new(pool: Arc<SshPool>, partition: Option<String>) -> Self {
        SlurmScheduler {
            pool,
            partition,
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Build the batch script submitted through `sbatch --parsable`.
    fn make_script(&self, description: &JobDescription, staged: &RemoteHandle) -> String {
        let job_name = description
            .job_dir
            .file_name()
            .map_or_else(|| "job".to_string(), |n| n.to_string_lossy().into_owned());

        let mut script = String::with_capacity(512);
        script.push_str("#!/bin/bash\n");
        let _ = writeln!(script, "#SBATCH --job-name=porter-{job_name}");
        let _ = writeln!(script, "#SBATCH --chdir={}", staged.0);
        let _ = writeln!(script, "#SBATCH --output=stdout.txt");
        let _ = writeln!(script, "#SBATCH --error=stderr.txt");

        if let Some(partition) = &self.partition {
            let _ = writeln!(script, "#SBATCH --partition={partition}");
        }
        if let Some(seconds) = description.cpu_time {
            // Slurm does not accept seconds; round up to the nearest minute.
            let minutes = (seconds + 59) / 60;
            let _ = writeln!(script, "#SBATCH --time={minutes}");
        }
        if let Some(memory_mb) = description.memory_mb {
            let _ = writeln!(script, "#SBATCH --mem={memory_mb}");
        }

        // The command runs inside the unpacked archive; the stream files
        // and return code stay at the staged root.
        script.push('\n');
        let _ = writeln!(script, "cd input");
        script.push_str(&description.command);
        script.push('\n');
        let _ = writeln!(script, "echo $? > ../returncode");
        script
    }
}

#[async_trait::async_trait]
impl Scheduler for SlurmScheduler {
    async fn submit(
        &self,
        description: &JobDescription,
        staged: &RemoteHandle,
    ) -> Result<String, SchedulerError> {
        if let Some(existing) = read_handle_sentinel(&description.job_dir) {
            trace!("Reusing scheduler handle '{existing}'.");
            return Ok(existing);
        }

        let script = self.make_script(description, staged);
        debug!("Submitting to Slurm on '{}'.", self.pool.host());

        let output = self
            .pool
            .exec("sbatch --parsable".to_string(), Some(script))
            .await
            .map_err(|e| SchedulerError::Submit(e.to_string()))?;

        if output.status != 0 {
            return Err(SchedulerError::Submit(format!(
                "sbatch exited with code {}: {}",
                output.status,
                output.stderr.trim()
            )));
        }

        let internal_id = parse_sbatch_output(&output.stdout)?;
        write_handle_sentinel(&description.job_dir, &internal_id)?;
        self.first_seen
            .lock()
            .expect("unpoisoned map")
            .insert(internal_id.clone(), Instant::now());

        Ok(internal_id)
    }

    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError> {
        let command =
            format!("sacct -j {internal_id} -X --noheader --parsable2 --format=State,ExitCode");
        let output = self
            .pool
            .exec(command, None)
            .await
            .map_err(|e| SchedulerError::State(e.to_string()))?;

        if output.status != 0 {
            return Err(SchedulerError::State(format!(
                "sacct exited with code {}: {}",
                output.status,
                output.stderr.trim()
            )));
        }

        match parse_sacct_output(&output.stdout) {
            Some(state) => {
                if state.is_terminal() {
                    self.first_seen
                        .lock()
                        .expect("unpoisoned map")
                        .remove(internal_id);
                }
                Ok(state)
            }
            None => {
                let mut first_seen = self.first_seen.lock().expect("unpoisoned map");
                let since = first_seen
                    .entry(internal_id.to_string())
                    .or_insert_with(Instant::now);
                if since.elapsed() <= SACCT_GRACE {
                    trace!("No accounting record for '{internal_id}' yet.");
                    Ok(SchedulerState::Queued)
                } else {
                    Err(SchedulerError::State(format!(
                        "no accounting record for '{internal_id}'"
                    )))
                }
            }
        }
    }

    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError> {
        let output = self
            .pool
            .exec(format!("scancel {internal_id}"), None)
            .await
            .map_err(|e| SchedulerError::Cancel(e.to_string()))?;

        if output.status != 0 {
            // Cancelling a finished job fails; that is the idempotent no-op.
            warn!(
                "scancel {internal_id} exited with code {}: {}",
                output.status,
                output.stderr.trim()
            );
        }
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Parse the job id from `sbatch --parsable` output (`id` or `id;cluster`).
fn parse_sbatch_output(stdout: &str) -> Result<String, SchedulerError> {
    let id = stdout
        .trim()
        .split(';')
        .next()
        .unwrap_or_default()
        .to_string();

    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(id)
    } else {
        Err(SchedulerError::Submit(format!(
            "unexpected sbatch output '{}'",
            stdout.trim()
        )))
    }
}

/// Parse the first record of `sacct --parsable2 --format=State,ExitCode`.
fn parse_sacct_output(stdout: &str) -> Option<SchedulerState> {
    let line = stdout.lines().find(|line| !line.trim().is_empty())?;
    let mut fields = line.trim().split('|');
    let state = fields.next()?;
    let exit = fields.next().unwrap_or("");
    Some(map_slurm_state(state, exit))
}

fn map_slurm_state(state: &str, exit: &str) -> SchedulerState {
    // States such as "CANCELLED by 1000" carry a suffix.
    let keyword = state.split_whitespace().next().unwrap_or(state);
    let exit_code = parse_exit_code(exit);

    match keyword {
        "PENDING" | "REQUEUED" => SchedulerState::Queued,
        "RUNNING" | "COMPLETING" | "SUSPENDED" => SchedulerState::Running,
        "COMPLETED" => match exit_code {
            Some(0) | None => SchedulerState::Ok { exit_code: 0 },
            Some(code) => SchedulerState::Error {
                exit_code: Some(code),
                reason: format!("exit code {code}"),
            },
        },
        "CANCELLED" => SchedulerState::Error {
            exit_code,
            reason: REASON_CANCELLED.to_string(),
        },
        other => SchedulerState::Error {
            exit_code,
            reason: other.to_lowercase(),
        },
    }
}

/// Slurm reports exit codes as `code:signal`.
fn parse_exit_code(exit: &str) -> Option<i32> {
    exit.split(':').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::parallel;
    use std::path::PathBuf;

    use crate::ssh::SshConfig;

    fn scheduler(partition: Option<&str>) -> SlurmScheduler {
        let config = SshConfig {
            host: "hpc.example.org".to_string(),
            port: 22,
            username: "svc".to_string(),
            key_file: None,
            max_sessions: 2,
        };
        SlurmScheduler::new(
            Arc::new(SshPool::new(config)),
            partition.map(ToString::to_string),
        )
    }

    fn description() -> JobDescription {
        JobDescription::new(
            "wc README.md".to_string(),
            PathBuf::from("/var/lib/porter/jobs/7"),
        )
    }

    fn staged() -> RemoteHandle {
        RemoteHandle("/scratch/porter/7".to_string())
    }

    #[test]
    #[parallel]
    fn script_contains_directives_and_command() {
        let script = scheduler(Some("short")).make_script(&description(), &staged());
        println!("{script}");

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=porter-7"));
        assert!(script.contains("#SBATCH --chdir=/scratch/porter/7"));
        assert!(script.contains("#SBATCH --output=stdout.txt"));
        assert!(script.contains("#SBATCH --error=stderr.txt"));
        assert!(script.contains("#SBATCH --partition=short"));
        assert!(script.contains("\ncd input\nwc README.md\n"));
        assert!(script.contains("echo $? > ../returncode"));
    }

    #[test]
    #[parallel]
    fn script_omits_unset_options() {
        let script = scheduler(None).make_script(&description(), &staged());
        assert!(!script.contains("--partition"));
        assert!(!script.contains("--time"));
        assert!(!script.contains("--mem"));
    }

    #[test]
    #[parallel]
    fn resource_hints_round_up() {
        let mut description = description();
        description.cpu_time = Some(90);
        description.memory_mb = Some(2048);

        let script = scheduler(None).make_script(&description, &staged());
        assert!(script.contains("#SBATCH --time=2"));
        assert!(script.contains("#SBATCH --mem=2048"));
    }

    #[test]
    #[parallel]
    fn sbatch_output_parsing() {
        assert_eq!(parse_sbatch_output("12345\n").unwrap(), "12345");
        assert_eq!(parse_sbatch_output("12345;cluster\n").unwrap(), "12345");
        assert!(parse_sbatch_output("submitted batch job oops\n").is_err());
        assert!(parse_sbatch_output("").is_err());
    }

    #[test]
    #[parallel]
    fn sacct_state_mapping() {
        assert_eq!(
            parse_sacct_output("PENDING|0:0\n"),
            Some(SchedulerState::Queued)
        );
        assert_eq!(
            parse_sacct_output("RUNNING|0:0\n"),
            Some(SchedulerState::Running)
        );
        assert_eq!(
            parse_sacct_output("COMPLETED|0:0\n"),
            Some(SchedulerState::Ok { exit_code: 0 })
        );
        assert_eq!(
            parse_sacct_output("FAILED|2:0\n"),
            Some(SchedulerState::Error {
                exit_code: Some(2),
                reason: "failed".to_string()
            })
        );
        assert_eq!(
            parse_sacct_output("CANCELLED by 1000|0:0\n"),
            Some(SchedulerState::Error {
                exit_code: Some(0),
                reason: REASON_CANCELLED.to_string()
            })
        );
        assert_eq!(
            parse_sacct_output("TIMEOUT|0:1\n"),
            Some(SchedulerState::Error {
                exit_code: Some(0),
                reason: "timeout".to_string()
            })
        );
        assert_eq!(parse_sacct_output("\n"), None);
        assert_eq!(parse_sacct_output(""), None);
    }
}
