// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use log::{debug, trace, warn};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::fs::RemoteHandle;
use crate::job::{JobDescription, REASON_CANCELLED};
use crate::scheduler::{
    read_handle_sentinel, write_handle_sentinel, Scheduler, SchedulerError, SchedulerState,
};

const WRAPPER_FILE_NAME: &str = "porter-job.sh";
const JDL_FILE_NAME: &str = "porter-job.jdl";

/// Submits jobs to a DIRAC grid workload management system.
///
/// The command is materialised inside a wrapper script shipped through the
/// input sandbox. The output sandbox carries only scheduler-internal files;
/// user outputs travel through the paired grid filesystem's storage
/// element. The wrapper exits with the command's return code so the grid
/// status reflects command failure.
///
pub struct GridScheduler {
    storage_element: String,
    proxy: PathBuf,
}

impl GridScheduler {
    pub fn new(storage_element: String, proxy: PathBuf) -> Self {
        GridScheduler {
            storage_element,
            proxy,
        }
    }

    async fn run_dirac(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<String, SchedulerError> {
        let mut command = Command::new(args[0]);
        command
            .args(&args[1..])
            .env("X509_USER_PROXY", &self.proxy)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        trace!("Running {args:?}.");
        let output = command
            .output()
            .await
            .map_err(|e| SchedulerError::Submit(format!("unable to spawn '{}': {e}", args[0])))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(SchedulerError::Submit(format!(
                "{} exited with code {:?}: {}",
                args[0],
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait::async_trait]
impl Scheduler for GridScheduler {
    async fn submit(
        &self,
        description: &JobDescription,
        staged: &RemoteHandle,
    ) -> Result<String, SchedulerError> {
        if let Some(existing) = read_handle_sentinel(&description.job_dir) {
            trace!("Reusing scheduler handle '{existing}'.");
            return Ok(existing);
        }

        let wrapper = make_wrapper(&description.command, &staged.0, &self.storage_element);
        std::fs::write(description.job_dir.join(WRAPPER_FILE_NAME), wrapper)
            .map_err(|e| SchedulerError::Submit(format!("unable to write wrapper: {e}")))?;

        let job_name = description
            .job_dir
            .file_name()
            .map_or_else(|| "job".to_string(), |n| n.to_string_lossy().into_owned());
        std::fs::write(description.job_dir.join(JDL_FILE_NAME), make_jdl(&job_name))
            .map_err(|e| SchedulerError::Submit(format!("unable to write JDL: {e}")))?;

        debug!("Submitting job '{job_name}' to the grid.");
        let output = self
            .run_dirac(
                &["dirac-wms-job-submit", JDL_FILE_NAME],
                Some(&description.job_dir),
            )
            .await?;

        let internal_id = parse_submit_output(&output)?;
        write_handle_sentinel(&description.job_dir, &internal_id)?;
        Ok(internal_id)
    }

    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError> {
        let output = self
            .run_dirac(&["dirac-wms-job-status", internal_id], None)
            .await
            .map_err(|e| SchedulerError::State(e.to_string()))?;

        parse_status_output(&output).ok_or_else(|| {
            SchedulerError::State(format!("unexpected status output '{}'", output.trim()))
        })
    }

    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError> {
        if let Err(error) = self
            .run_dirac(&["dirac-wms-job-kill", internal_id], None)
            .await
        {
            // Killing a finished job fails; that is the idempotent no-op.
            warn!("dirac-wms-job-kill {internal_id}: {error}");
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// Build the wrapper script executed on the worker node.
fn make_wrapper(command: &str, staged: &str, storage_element: &str) -> String {
    let mut script = String::with_capacity(1024);
    script.push_str("#!/bin/bash\n\n");

    // Fetch the staged inputs. dirac-dms-get-file writes base names into
    // the working directory, so descend into the nested directory first.
    let _ = writeln!(
        script,
        r#"dirac-dms-find-lfns Path={staged} | while IFS= read -r lfn; do
    rel="${{lfn#{staged}/}}"
    dir="$(dirname "$rel")"
    mkdir -p "$dir"
    (cd "$dir" && dirac-dms-get-file "$lfn")
done"#
    );

    script.push('\n');
    let _ = writeln!(script, "(cd input && {command}) > stdout.txt 2> stderr.txt");
    script.push_str("rc=$?\n");
    script.push_str("echo \"$rc\" > returncode\n\n");

    // Register results under the job's LFN directory, keeping nested paths.
    let _ = writeln!(
        script,
        r#"find output -type f -print0 2>/dev/null | while IFS= read -r -d '' f; do
    dirac-dms-add-file "{staged}/$f" "$f" "{storage_element}"
done
for f in stdout.txt stderr.txt returncode; do
    dirac-dms-add-file "{staged}/$f" "$f" "{storage_element}"
done"#
    );

    script.push('\n');
    script.push_str("exit \"$rc\"\n");
    script
}

fn make_jdl(job_name: &str) -> String {
    let mut jdl = String::with_capacity(256);
    jdl.push_str("[\n");
    let _ = writeln!(jdl, "    JobName = \"porter-{job_name}\";");
    let _ = writeln!(jdl, "    Executable = \"/bin/bash\";");
    let _ = writeln!(jdl, "    Arguments = \"{WRAPPER_FILE_NAME}\";");
    let _ = writeln!(jdl, "    InputSandbox = {{\"{WRAPPER_FILE_NAME}\"}};");
    let _ = writeln!(
        jdl,
        "    OutputSandbox = {{\"stdout.txt\", \"stderr.txt\", \"returncode\"}};"
    );
    jdl.push_str("]\n");
    jdl
}

/// Parse the job id from `dirac-wms-job-submit` output (`JobID = 123`).
fn parse_submit_output(stdout: &str) -> Result<String, SchedulerError> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("jobid"))
        .map(|(_, value)| value.trim().trim_matches(|c| c == '[' || c == ']').to_string())
        .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| {
            SchedulerError::Submit(format!("unexpected submit output '{}'", stdout.trim()))
        })
}

/// Parse `dirac-wms-job-status` output (`JobID=123 Status=Done; ...`).
///
/// The wrapper exits with the command's return code, so `Done` implies the
/// command returned zero. For failed jobs the WMS reports no number; the
/// orchestrator reads it from the `returncode` file once stage-in brings
/// it back from the storage element.
fn parse_status_output(stdout: &str) -> Option<SchedulerState> {
    let status = stdout
        .split_whitespace()
        .find_map(|field| field.strip_prefix("Status="))?
        .trim_end_matches(';');

    let state = match status {
        "Received" | "Submitted" | "Checking" | "Waiting" | "Matched" | "Rescheduled" => {
            SchedulerState::Queued
        }
        "Running" | "Completing" | "Completed" => SchedulerState::Running,
        "Done" => SchedulerState::Ok { exit_code: 0 },
        "Killed" | "Deleted" => SchedulerState::Error {
            exit_code: None,
            reason: REASON_CANCELLED.to_string(),
        },
        other => SchedulerState::Error {
            exit_code: None,
            reason: other.to_lowercase(),
        },
    };
    Some(state)
}
