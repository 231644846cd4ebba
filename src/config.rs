// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use indexmap::IndexMap;
use log::{debug, info, trace};
use path_absolutize::Absolutize;
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ssh::SshConfig;
use crate::Error;

/// Environment variable that overrides `job_root_dir`.
pub const JOB_ROOT_ENV: &str = "JOB_ROOT_DIR";

/// The service configuration.
///
/// `Configuration` is the in-memory realization of the user provided
/// `config.yaml`.
///
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// The directory holding one subdirectory per job (absolute).
    pub job_root_dir: PathBuf,

    /// The named destination picker to use.
    #[serde(default = "default_picker")]
    pub destination_picker: String,

    /// The applications users may submit jobs for.
    #[serde(default)]
    pub applications: IndexMap<String, ApplicationConfig>,

    /// The interactive applications that run against completed jobs.
    #[serde(default)]
    pub interactive_applications: IndexMap<String, InteractiveApplicationConfig>,

    /// The destinations jobs may be dispatched to, in declaration order.
    #[serde(default)]
    pub destinations: IndexMap<String, DestinationConfig>,
}

fn default_picker() -> String {
    "first".to_string()
}

/// One configured application.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfig {
    /// The command template rendered per submission.
    pub command_template: String,

    /// File names that must exist in the uploaded archive.
    #[serde(default)]
    pub upload_needs: Vec<String>,

    /// JSON Schema (2020-12) for the submission parameters.
    pub input_schema: Option<Value>,

    /// Roles allowed to submit. Empty allows any authorized user.
    #[serde(default)]
    pub allowed_roles: Vec<String>,

    pub summary: Option<String>,
    pub description: Option<String>,
}

/// One configured interactive application.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InteractiveApplicationConfig {
    pub command_template: String,

    pub input_schema: Option<Value>,

    /// When set, restricts which submitted-job applications this may run on.
    pub job_application: Option<String>,

    pub description: Option<String>,

    /// Wall-clock timeout in seconds.
    #[serde(default = "default_interactive_timeout")]
    pub timeout: u64,
}

fn default_interactive_timeout() -> u64 {
    30
}

/// A named pairing of one scheduler and one filesystem.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub scheduler: SchedulerConfig,
    pub filesystem: FilesystemConfig,
}

/// Scheduler configuration, tagged by `type`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SchedulerConfig {
    /// Execute jobs in-process with a bounded worker pool.
    Memory {
        #[serde(default = "default_slots")]
        slots: usize,
    },

    /// Submit to Slurm with `sbatch` over SSH.
    Slurm {
        partition: Option<String>,
        ssh_config: SshConfig,
    },

    /// Push jobs onto a Redis queue consumed by external workers.
    Arq {
        redis_dsn: String,
        #[serde(default = "default_queue")]
        queue: String,
        #[serde(default = "default_max_jobs")]
        max_jobs: usize,
        /// Per-job timeout in seconds, enforced by the workers.
        #[serde(default = "default_job_timeout")]
        job_timeout: u64,
    },

    /// Submit to a DIRAC grid workload management system.
    Dirac {
        storage_element: String,
        proxy: PathBuf,
    },
}

fn default_slots() -> usize {
    1
}

fn default_queue() -> String {
    "porter".to_string()
}

fn default_max_jobs() -> usize {
    10
}

fn default_job_timeout() -> u64 {
    3600
}

/// Filesystem configuration, tagged by `type`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum FilesystemConfig {
    /// The execution site shares the service's local filesystem.
    Local,

    /// Transfer job directories over SFTP.
    Sftp {
        ssh_config: SshConfig,
        /// Remote directory that holds one subdirectory per job.
        entry: PathBuf,
    },

    /// Upload-and-register to a DIRAC storage element.
    Dirac {
        lfn_root: String,
        storage_element: String,
        proxy: PathBuf,
    },
}

impl Configuration {
    /// Open the configuration file.
    ///
    /// Applies the `JOB_ROOT_DIR` environment override and validates the
    /// result.
    ///
    /// # Errors
    /// Returns `Err(porter::Error)` when the file cannot be read, parsed,
    /// or validated.
    ///
    pub fn open(path: &Path) -> Result<Self, Error> {
        let text =
            fs::read_to_string(path).map_err(|e| Error::FileRead(path.to_path_buf(), e))?;

        trace!("Parsing '{}'.", path.display());
        let mut configuration = Self::parse_str(path, &text)?;

        if let Ok(job_root) = env::var(JOB_ROOT_ENV) {
            debug!("Overriding job_root_dir from {JOB_ROOT_ENV}.");
            configuration.job_root_dir = PathBuf::from(job_root);
        }

        configuration.job_root_dir = configuration
            .job_root_dir
            .absolutize()
            .map_err(|e| Error::FileRead(configuration.job_root_dir.clone(), e))?
            .to_path_buf();

        configuration.validate()?;
        info!(
            "Loaded {} application(s) and {} destination(s) from '{}'.",
            configuration.applications.len(),
            configuration.destinations.len(),
            path.display()
        );
        Ok(configuration)
    }

    /// Parse a `Configuration` from a YAML string.
    ///
    /// Does *NOT* apply the environment override nor validate.
    ///
    pub(crate) fn parse_str(path: &Path, yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| Error::YAMLParse(path.to_path_buf(), e))
    }

    /// Validate that the configuration is correct.
    pub fn validate(&self) -> Result<(), Error> {
        if self.destinations.is_empty() {
            return Err(Error::NoDestinations);
        }

        for (name, destination) in &self.destinations {
            match &destination.scheduler {
                SchedulerConfig::Memory { slots } if *slots == 0 => {
                    return Err(Error::DestinationInvalid(
                        name.clone(),
                        "'slots' must be at least 1".to_string(),
                    ));
                }
                SchedulerConfig::Arq { max_jobs, .. } if *max_jobs == 0 => {
                    return Err(Error::DestinationInvalid(
                        name.clone(),
                        "'max_jobs' must be at least 1".to_string(),
                    ));
                }
                _ => {}
            }
        }

        for (name, interactive) in &self.interactive_applications {
            if let Some(job_application) = &interactive.job_application {
                if !self.applications.contains_key(job_application) {
                    return Err(Error::UnknownJobApplication(
                        name.clone(),
                        job_application.clone(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// The destination names, in declaration order.
    pub fn destination_names(&self) -> Vec<String> {
        self.destinations.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::{parallel, serial};

    const SAMPLE: &str = r#"
job_root_dir: /var/lib/porter/jobs
destination_picker: rotate
applications:
  wc:
    command_template: "wc {{ file|q }}"
    upload_needs: [README.md]
    input_schema:
      type: object
      properties:
        file:
          type: string
    allowed_roles: [analyst]
    summary: Count words.
interactive_applications:
  head:
    command_template: "head {{ path|q }}"
    job_application: wc
destinations:
  local:
    scheduler:
      type: memory
      slots: 2
    filesystem:
      type: local
  cluster:
    scheduler:
      type: slurm
      partition: short
      ssh_config:
        host: hpc.example.org
        username: svc
    filesystem:
      type: sftp
      ssh_config:
        host: hpc.example.org
        username: svc
      entry: /scratch/porter
  workers:
    scheduler:
      type: arq
      redis_dsn: redis://broker:6379/0
      max_jobs: 4
      job_timeout: 120
    filesystem:
      type: local
  grid:
    scheduler:
      type: dirac
      storage_element: DISK-01
      proxy: /etc/porter/proxy
    filesystem:
      type: dirac
      lfn_root: /vo/porter
      storage_element: DISK-01
      proxy: /etc/porter/proxy
"#;

    fn setup() -> Configuration {
        let configuration =
            Configuration::parse_str(Path::new("config.yaml"), SAMPLE).expect("valid YAML");
        configuration.validate().expect("valid configuration");
        configuration
    }

    #[test]
    #[parallel]
    fn parse_all_destination_types() {
        let configuration = setup();

        assert_eq!(
            configuration.destination_names(),
            vec!["local", "cluster", "workers", "grid"]
        );
        assert_eq!(configuration.destination_picker, "rotate");

        let local = &configuration.destinations["local"];
        assert_eq!(local.scheduler, SchedulerConfig::Memory { slots: 2 });
        assert_eq!(local.filesystem, FilesystemConfig::Local);

        match &configuration.destinations["workers"].scheduler {
            SchedulerConfig::Arq {
                redis_dsn,
                queue,
                max_jobs,
                job_timeout,
            } => {
                assert_eq!(redis_dsn, "redis://broker:6379/0");
                assert_eq!(queue, "porter");
                assert_eq!(*max_jobs, 4);
                assert_eq!(*job_timeout, 120);
            }
            other => panic!("expected arq scheduler, got {other:?}"),
        }

        match &configuration.destinations["cluster"].filesystem {
            FilesystemConfig::Sftp { ssh_config, entry } => {
                assert_eq!(ssh_config.host, "hpc.example.org");
                assert_eq!(entry, &PathBuf::from("/scratch/porter"));
            }
            other => panic!("expected sftp filesystem, got {other:?}"),
        }
    }

    #[test]
    #[parallel]
    fn application_defaults() {
        let configuration = setup();
        let wc = &configuration.applications["wc"];
        assert_eq!(wc.upload_needs, vec!["README.md"]);
        assert_eq!(wc.allowed_roles, vec!["analyst"]);
        assert_eq!(wc.summary.as_deref(), Some("Count words."));
        assert_eq!(wc.description, None);

        let head = &configuration.interactive_applications["head"];
        assert_eq!(head.timeout, 30);
        assert_eq!(head.job_application.as_deref(), Some("wc"));
    }

    #[test]
    #[parallel]
    fn unknown_fields_are_rejected() {
        let error = Configuration::parse_str(
            Path::new("config.yaml"),
            r"
job_root_dir: /tmp/jobs
surprise: true
",
        );
        assert!(matches!(error, Err(Error::YAMLParse(_, _))));
    }

    #[test]
    #[parallel]
    fn no_destinations_is_rejected() {
        let configuration = Configuration::parse_str(
            Path::new("config.yaml"),
            "job_root_dir: /tmp/jobs\n",
        )
        .expect("parses");
        assert!(matches!(
            configuration.validate(),
            Err(Error::NoDestinations)
        ));
    }

    #[test]
    #[parallel]
    fn zero_slots_is_rejected() {
        let configuration = Configuration::parse_str(
            Path::new("config.yaml"),
            r"
job_root_dir: /tmp/jobs
destinations:
  local:
    scheduler:
      type: memory
      slots: 0
    filesystem:
      type: local
",
        )
        .expect("parses");
        assert!(matches!(
            configuration.validate(),
            Err(Error::DestinationInvalid(name, _)) if name == "local"
        ));
    }

    #[test]
    #[parallel]
    fn interactive_job_application_must_exist() {
        let configuration = Configuration::parse_str(
            Path::new("config.yaml"),
            r#"
job_root_dir: /tmp/jobs
interactive_applications:
  head:
    command_template: "head {{ p|q }}"
    job_application: missing
destinations:
  local:
    scheduler:
      type: memory
    filesystem:
      type: local
"#,
        )
        .expect("parses");
        assert!(matches!(
            configuration.validate(),
            Err(Error::UnknownJobApplication(_, app)) if app == "missing"
        ));
    }

    #[test]
    #[serial]
    fn job_root_environment_override() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config_file = temp.path().join("config.yaml");
        fs::write(
            &config_file,
            r"
job_root_dir: /var/lib/porter/jobs
destinations:
  local:
    scheduler:
      type: memory
    filesystem:
      type: local
",
        )
        .unwrap();

        env::set_var(JOB_ROOT_ENV, "/srv/override");
        let configuration = Configuration::open(&config_file).expect("valid configuration");
        env::remove_var(JOB_ROOT_ENV);

        assert_eq!(configuration.job_root_dir, PathBuf::from("/srv/override"));
    }
}
