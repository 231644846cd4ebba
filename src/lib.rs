// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod application;
pub mod config;
pub mod destination;
pub mod fs;
pub mod interactive;
pub mod job;
pub mod orchestrator;
pub mod scheduler;
pub mod ssh;
pub mod store;
pub mod template;

use std::io;
use std::path::PathBuf;

use crate::fs::FsError;
use crate::job::JobState;
use crate::scheduler::SchedulerError;

pub const INPUT_DIRECTORY_NAME: &str = "input";
pub const OUTPUT_DIRECTORY_NAME: &str = "output";
pub const META_FILE_NAME: &str = "meta";
pub const STDOUT_FILE_NAME: &str = "stdout.txt";
pub const STDERR_FILE_NAME: &str = "stderr.txt";
pub const RETURNCODE_FILE_NAME: &str = "returncode";
pub const SCHEDULER_HANDLE_FILE_NAME: &str = ".scheduler_handle";

/// Errors that may be encountered when using the porter crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // IO errors
    #[error("I/O error: {0}")]
    IO(#[from] io::Error),

    #[error("Unable to read '{0}': {1}")]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Unable to write '{0}': {1}")]
    FileWrite(PathBuf, #[source] io::Error),

    #[error("Unable to create directory '{0}': {1}")]
    DirectoryCreate(PathBuf, #[source] io::Error),

    #[error("Unable to read directory '{0}': {1}")]
    DirectoryRead(PathBuf, #[source] io::Error),

    #[error("Unable to spawn '{0}': {1}")]
    SpawnProcess(String, #[source] io::Error),

    // configuration errors
    #[error("Unable to parse '{0}'.\n{1}")]
    YAMLParse(PathBuf, #[source] serde_yaml::Error),

    #[error("The configuration defines no destinations.")]
    NoDestinations,

    #[error("Destination '{0}': {1}")]
    DestinationInvalid(String, String),

    #[error("Destination picker '{0}' is not registered.")]
    UnknownPickerName(String),

    #[error("Unable to parse the command template of '{0}'.\n{1}")]
    TemplateParse(String, #[source] minijinja::Error),

    #[error("The command template of '{0}' substitutes '{1}' without the 'q' filter.")]
    UnquotedSubstitution(String, String),

    #[error("Invalid input schema for '{0}': {1}")]
    SchemaCompile(String, String),

    #[error("The input schema of '{0}' must be an object with typed properties.")]
    SchemaNotObject(String),

    #[error("Property '{1}' of '{0}' must have type string, number, integer, or boolean.")]
    NonStringProperty(String, String),

    #[error("Interactive application '{0}' references unknown application '{1}'.")]
    UnknownJobApplication(String, String),

    #[error("Picker '{0}' selected unknown destination '{1}'.")]
    UnknownDestination(String, String),

    // validation errors, surfaced synchronously at the HTTP boundary
    #[error("Application '{0}' not found.")]
    ApplicationNotFound(String),

    #[error("Interactive application '{0}' not found.")]
    InteractiveApplicationNotFound(String),

    #[error("The archive for '{0}' is missing the required file '{1}'.")]
    MissingUpload(String, String),

    #[error("User '{0}' does not hold a role allowed to run '{1}'.")]
    RoleDenied(String, String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid base64 content in property '{0}'.")]
    InvalidBase64(String),

    #[error("Interactive application '{0}' runs on '{1}' jobs, job {2} ran '{3}'.")]
    WrongJobApplication(String, String, i64, String),

    #[error("Job {0} is in state '{1}', not 'ok'.")]
    JobNotDone(i64, JobState),

    #[error("The local directory of job {0} does not exist on this host.")]
    JobDirectoryMissing(i64),

    // job store errors
    #[error("Job {0} not found.")]
    JobNotFound(i64),

    #[error("Job {0} may not transition from '{1}' to '{2}'.")]
    InvalidTransition(i64, JobState, JobState),

    #[error("The scheduler handle of job {0} is already set.")]
    InternalIdAlreadySet(i64),

    // runtime errors
    #[error("Unable to render the command of '{0}'.\n{1}")]
    TemplateRender(String, #[source] minijinja::Error),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    // interactive errors
    #[error("Interactive command exceeded the {0} second timeout.")]
    InteractiveTimeout(u64),

    #[error("Interactive command produced more than {1} bytes on {0}.")]
    InteractiveOutputCap(String, usize),
}

impl Error {
    /// Test whether this error is caused by the request and maps to a 4xx
    /// response at the HTTP boundary.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::ApplicationNotFound(_)
                | Error::InteractiveApplicationNotFound(_)
                | Error::MissingUpload(_, _)
                | Error::RoleDenied(_, _)
                | Error::InvalidInput(_)
                | Error::InvalidBase64(_)
                | Error::WrongJobApplication(_, _, _, _)
                | Error::JobNotDone(_, _)
                | Error::JobNotFound(_)
        )
    }
}
