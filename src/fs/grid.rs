// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use async_trait::async_trait;
use log::{debug, trace, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::fs::{Filesystem, FsError, RemoteHandle};
use crate::job::Job;

/// Upload-and-register to a DIRAC storage element.
///
/// Files are registered under `<lfn_root>/<job_id>/<relative_path>`, so the
/// logical namespace preserves the job directory layout. The download side
/// works around the flattening of `dirac-dms-get-file` (which always writes
/// the LFN's base name into the working directory) by fetching into a
/// scratch directory and renaming each file onto its nested relative path.
///
pub struct GridFs {
    lfn_root: String,
    storage_element: String,
    proxy: PathBuf,
}

impl GridFs {
    pub fn new(lfn_root: String, storage_element: String, proxy: PathBuf) -> Self {
        GridFs {
            lfn_root,
            storage_element,
            proxy,
        }
    }

    async fn run_dirac(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, FsError> {
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
            .map_err(|e| FsError::Permanent(format!("unable to spawn '{}': {e}", args[0])))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            Err(classify_dirac_failure(args[0], &stderr))
        }
    }

    /// List every LFN registered under `handle`.
    async fn list_lfns(&self, handle: &RemoteHandle) -> Result<Vec<String>, FsError> {
        let output = self
            .run_dirac(&["dirac-dms-find-lfns", &format!("Path={}", handle.0)], None)
            .await?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with(&handle.0))
            .map(ToString::to_string)
            .collect())
    }
}

#[async_trait]
impl Filesystem for GridFs {
    async fn upload(&self, local_dir: &Path, job: &Job) -> Result<RemoteHandle, FsError> {
        let handle = self.staged_handle(local_dir, job);
        debug!("Registering job {} under '{}'.", job.id, handle.0);

        for relative in walk_files(local_dir, local_dir)? {
            let lfn = format!("{}/{}", handle.0, relative.display());
            let local = local_dir.join(&relative);
            self.run_dirac(
                &[
                    "dirac-dms-add-file",
                    &lfn,
                    &local.to_string_lossy(),
                    &self.storage_element,
                ],
                None,
            )
            .await?;
        }

        Ok(handle)
    }

    async fn download(
        &self,
        handle: &RemoteHandle,
        local_dir: &Path,
        job: &Job,
    ) -> Result<(), FsError> {
        debug!("Fetching job {} results from '{}'.", job.id, handle.0);

        let lfns = self.list_lfns(handle).await?;
        let outputs = output_paths(&handle.0, &lfns);
        if outputs.is_empty() {
            trace!("Job {} produced no registered outputs.", job.id);
            return Ok(());
        }

        let scratch = tempfile::tempdir_in(local_dir)
            .map_err(|e| FsError::Permanent(format!("unable to create scratch dir: {e}")))?;

        for (lfn, relative) in outputs {
            self.run_dirac(&["dirac-dms-get-file", &lfn], Some(scratch.path()))
                .await?;

            // The grid layer flattened the file to its base name; restore
            // the nested path recorded in the LFN.
            let base = scratch.path().join(
                relative
                    .file_name()
                    .ok_or_else(|| FsError::Permanent(format!("bad LFN '{lfn}'")))?,
            );
            let target = local_dir.join(&relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| FsError::Transient(e.to_string()))?;
            }
            std::fs::rename(&base, &target).map_err(|e| FsError::Transient(e.to_string()))?;
        }

        Ok(())
    }

    async fn teardown(&self, handle: &RemoteHandle) {
        let lfns = match self.list_lfns(handle).await {
            Ok(lfns) => lfns,
            Err(error) => {
                warn!("Unable to enumerate '{}' for teardown: {error}", handle.0);
                return;
            }
        };

        for lfn in lfns {
            if let Err(error) = self.run_dirac(&["dirac-dms-remove-files", &lfn], None).await {
                warn!("Unable to remove '{lfn}': {error}");
            }
        }
    }

    fn staged_handle(&self, _local_dir: &Path, job: &Job) -> RemoteHandle {
        RemoteHandle(format!("{}/{}", self.lfn_root.trim_end_matches('/'), job.id))
    }
}

/// Authentication problems (an expired or missing proxy) are permanent;
/// everything else the tools report is assumed transient.
fn classify_dirac_failure(tool: &str, stderr: &str) -> FsError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("proxy") || lowered.contains("certificate") {
        FsError::Permanent(format!("{tool}: {}", stderr.trim()))
    } else {
        FsError::Transient(format!("{tool}: {}", stderr.trim()))
    }
}

/// Collect the relative paths of all regular files under `dir`.
fn walk_files(root: &Path, dir: &Path) -> Result<Vec<PathBuf>, FsError> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir).map_err(|e| FsError::Transient(e.to_string()))? {
        let entry = entry.map_err(|e| FsError::Transient(e.to_string()))?;
        let path = entry.path();
        if path.is_dir() {
            files.extend(walk_files(root, &path)?);
        } else {
            let relative = path
                .strip_prefix(root)
                .expect("children remain under the walk root");
            files.push(relative.to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

/// Pair each result LFN with the nested relative path it must land on.
///
/// Input files were registered by the upload side and are not results;
/// they are skipped.
fn output_paths(handle: &str, lfns: &[String]) -> Vec<(String, PathBuf)> {
    let prefix = format!("{handle}/");
    lfns.iter()
        .filter_map(|lfn| {
            let relative = lfn.strip_prefix(&prefix)?;
            if relative.is_empty() || relative.starts_with("input/") {
                None
            } else {
                Some((lfn.clone(), PathBuf::from(relative)))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use chrono::Utc;
    use serial_test::parallel;

    use crate::job::JobState;

    fn grid_fs() -> GridFs {
        GridFs::new(
            "/vo/porter/".to_string(),
            "DISK-01".to_string(),
            PathBuf::from("/etc/porter/proxy"),
        )
    }

    fn job(id: i64) -> Job {
        let now = Utc::now();
        Job {
            id,
            name: "j".to_string(),
            application: "wc".to_string(),
            submitter: "user".to_string(),
            destination: "grid".to_string(),
            state: JobState::New,
            internal_id: None,
            exit_code: None,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    #[parallel]
    fn staged_handle_strips_trailing_slash() {
        let fs = grid_fs();
        let handle = fs.staged_handle(Path::new("/jobs/9"), &job(9));
        assert_eq!(handle.0, "/vo/porter/9");
    }

    #[test]
    #[parallel]
    fn walk_files_is_recursive_and_relative() {
        let temp = TempDir::new().unwrap();
        temp.child("meta").write_str("token\n").unwrap();
        temp.child("input/README.md").write_str("hello\n").unwrap();
        temp.child("input/data/points.csv").write_str("1\n").unwrap();

        let files = walk_files(temp.path(), temp.path()).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("input/README.md"),
                PathBuf::from("input/data/points.csv"),
                PathBuf::from("meta"),
            ]
        );
    }

    #[test]
    #[parallel]
    fn nested_output_paths_are_preserved() {
        let lfns = vec![
            "/vo/porter/9/input/README.md".to_string(),
            "/vo/porter/9/output/result.txt".to_string(),
            "/vo/porter/9/output/plots/fit.png".to_string(),
            "/vo/porter/9/returncode".to_string(),
        ];

        let outputs = output_paths("/vo/porter/9", &lfns);
        assert_eq!(
            outputs,
            vec![
                (
                    "/vo/porter/9/output/result.txt".to_string(),
                    PathBuf::from("output/result.txt")
                ),
                (
                    "/vo/porter/9/output/plots/fit.png".to_string(),
                    PathBuf::from("output/plots/fit.png")
                ),
                ("/vo/porter/9/returncode".to_string(), PathBuf::from("returncode")),
            ]
        );
    }

    #[test]
    #[parallel]
    fn proxy_failures_are_permanent() {
        let error = classify_dirac_failure("dirac-dms-add-file", "No valid proxy found");
        assert!(!error.is_transient());

        let error = classify_dirac_failure("dirac-dms-add-file", "SE timeout");
        assert!(error.is_transient());
    }
}
