// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, trace};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::application::ApplicationRegistry;
use crate::store::JobStore;
use crate::Error;

/// Captured output is capped at 1 MiB per stream.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// The outcome of an interactive command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InteractiveResult {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Executes interactive applications in the local directory of a completed
/// job.
///
/// Preconditions are enforced before anything runs: the job is `ok`, its
/// application matches the interactive application's restriction, and its
/// directory exists on this host. Files the command writes into the job
/// directory become part of the job's artifacts.
///
pub struct InteractiveRunner {
    registry: Arc<ApplicationRegistry>,
    store: Arc<dyn JobStore>,
    job_root: PathBuf,
}

impl InteractiveRunner {
    pub fn new(
        registry: Arc<ApplicationRegistry>,
        store: Arc<dyn JobStore>,
        job_root: PathBuf,
    ) -> Self {
        InteractiveRunner {
            registry,
            store,
            job_root,
        }
    }

    /// Run one interactive application against one job.
    pub async fn run(
        &self,
        application: &str,
        job_id: i64,
        parameters: &Value,
    ) -> Result<InteractiveResult, Error> {
        let app = self.registry.get_interactive(application)?;
        let job = self.store.get_job(job_id).await?;
        app.check_job(&job)?;

        let job_dir = job.job_dir(&self.job_root);
        if !job_dir.is_dir() {
            // Jobs that only ever lived remotely have nothing to run in.
            return Err(Error::JobDirectoryMissing(job_id));
        }

        let mut values = app.validate_input(parameters)?;

        // Base64 file parameters decode to temporary files; the template
        // substitution resolves to the file's path. The scratch directory
        // is removed when this function returns, success or not.
        let scratch = tempfile::tempdir()?;
        for property in app.base64_properties() {
            if let Some(encoded) = values.get(property) {
                let bytes = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|_| Error::InvalidBase64(property.clone()))?;
                let path = scratch.path().join(property);
                std::fs::write(&path, bytes).map_err(|e| Error::FileWrite(path.clone(), e))?;
                trace!("Decoded '{property}' to '{}'.", path.display());
                values.insert(property.clone(), path.to_string_lossy().into_owned());
            }
        }

        let command = self.registry.render_interactive(application, &values)?;
        debug!("Job {job_id}: interactive '{application}': {command}");

        run_command(&command, &job_dir, app.timeout).await
    }
}

async fn run_command(
    command: &str,
    job_dir: &Path,
    timeout_secs: u64,
) -> Result<InteractiveResult, Error> {
    let mut child = Command::new("bash")
        .arg("-c")
        .arg(command)
        .current_dir(job_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::SpawnProcess("bash".to_string(), e))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let stdout_task = tokio::spawn(read_capped(stdout));
    let stderr_task = tokio::spawn(read_capped(stderr));

    let waited = timeout(Duration::from_secs(timeout_secs), child.wait()).await;
    let timed_out = waited.is_err();
    if timed_out {
        let _ = child.kill().await;
    }

    let (stdout_bytes, stdout_overflow) = stdout_task.await.unwrap_or_default();
    let (stderr_bytes, stderr_overflow) = stderr_task.await.unwrap_or_default();

    if stdout_overflow {
        return Err(Error::InteractiveOutputCap(
            "stdout".to_string(),
            MAX_CAPTURE_BYTES,
        ));
    }
    if stderr_overflow {
        return Err(Error::InteractiveOutputCap(
            "stderr".to_string(),
            MAX_CAPTURE_BYTES,
        ));
    }
    if timed_out {
        return Err(Error::InteractiveTimeout(timeout_secs));
    }

    let status = waited.expect("not timed out").map_err(Error::IO)?;
    Ok(InteractiveResult {
        return_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
    })
}

/// Read at most one byte past the cap; the extra byte flags the overflow.
async fn read_capped<R: AsyncReadExt + Unpin>(reader: R) -> (Vec<u8>, bool) {
    let mut buffer = Vec::new();
    let mut limited = reader.take(MAX_CAPTURE_BYTES as u64 + 1);
    let _ = limited.read_to_end(&mut buffer).await;
    let overflow = buffer.len() > MAX_CAPTURE_BYTES;
    buffer.truncate(MAX_CAPTURE_BYTES);
    (buffer, overflow)
}
