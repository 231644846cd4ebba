// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use log::{debug, trace};
use serde::Deserialize;
use ssh2::Session;
use std::io::prelude::*;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task;

/// SSH connection options for a remote scheduler or filesystem.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    /// The remote host name.
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    /// Private key file. When absent, the SSH agent is used.
    pub key_file: Option<PathBuf>,

    /// Maximum number of concurrently open sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_port() -> u16 {
    22
}

fn default_max_sessions() -> usize {
    4
}

/// Errors from the SSH layer.
///
/// Authentication failures are permanent; everything else is assumed to be
/// a transient network condition.
#[derive(thiserror::Error, Debug)]
pub enum SshError {
    #[error("Unable to connect to '{0}': {1}")]
    Connect(String, String),

    #[error("Authentication as '{0}' on '{1}' failed: {2}")]
    Auth(String, String, String),

    #[error("SSH operation failed: {0}")]
    Op(String),
}

impl SshError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SshError::Auth(_, _, _))
    }
}

/// Output of a remote command executed over SSH.
#[derive(Debug)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A pool of authenticated SSH sessions to one host.
///
/// Sessions are shared across jobs within one filesystem or scheduler
/// instance. `libssh2` is blocking, so every operation runs on the worker
/// thread pool; `max_sessions` bounds the number in flight.
///
pub struct SshPool {
    config: SshConfig,
    idle: Arc<Mutex<Vec<Session>>>,
    permits: Arc<Semaphore>,
}

impl SshPool {
    pub fn new(config: SshConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        SshPool {
            config,
            idle: Arc::new(Mutex::new(Vec::new())),
            permits,
        }
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Run `f` with a pooled session on the blocking thread pool.
    ///
    /// A session that returned an error is discarded rather than reused.
    pub async fn with_session<T, F>(&self, f: F) -> Result<T, SshError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, SshError> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("open semaphore");

        let config = self.config.clone();
        let idle = Arc::clone(&self.idle);

        let result = task::spawn_blocking(move || {
            let _permit = permit;
            let session = match idle.lock().expect("unpoisoned pool").pop() {
                Some(session) => session,
                None => connect(&config)?,
            };

            let result = f(&session);
            if result.is_ok() {
                idle.lock().expect("unpoisoned pool").push(session);
            }
            result
        })
        .await;

        match result {
            Ok(result) => result,
            Err(error) => Err(SshError::Op(format!("worker thread failed: {error}"))),
        }
    }

    /// Execute a command on the remote host, optionally feeding `stdin`.
    pub async fn exec(&self, command: String, stdin: Option<String>) -> Result<ExecOutput, SshError> {
        trace!("Executing '{command}' on '{}'.", self.config.host);

        self.with_session(move |session| {
            let mut channel = session
                .channel_session()
                .map_err(|e| SshError::Op(e.to_string()))?;
            channel
                .exec(&command)
                .map_err(|e| SshError::Op(e.to_string()))?;

            if let Some(input) = stdin {
                channel
                    .write_all(input.as_bytes())
                    .map_err(|e| SshError::Op(e.to_string()))?;
                channel
                    .send_eof()
                    .map_err(|e| SshError::Op(e.to_string()))?;
            }

            let mut stdout = String::new();
            channel
                .read_to_string(&mut stdout)
                .map_err(|e| SshError::Op(e.to_string()))?;

            let mut stderr = String::new();
            channel
                .stderr()
                .read_to_string(&mut stderr)
                .map_err(|e| SshError::Op(e.to_string()))?;

            channel
                .wait_close()
                .map_err(|e| SshError::Op(e.to_string()))?;
            let status = channel
                .exit_status()
                .map_err(|e| SshError::Op(e.to_string()))?;

            Ok(ExecOutput {
                status,
                stdout,
                stderr,
            })
        })
        .await
    }

    /// Drop all idle sessions.
    pub fn close(&self) {
        self.idle.lock().expect("unpoisoned pool").clear();
    }
}

fn connect(config: &SshConfig) -> Result<Session, SshError> {
    debug!("Opening SSH session to '{}'.", config.host);

    let address = (config.host.as_str(), config.port);
    let tcp = TcpStream::connect(address)
        .map_err(|e| SshError::Connect(config.host.clone(), e.to_string()))?;

    let mut session =
        Session::new().map_err(|e| SshError::Connect(config.host.clone(), e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(30_000);
    session
        .handshake()
        .map_err(|e| SshError::Connect(config.host.clone(), e.to_string()))?;

    let auth = match &config.key_file {
        Some(key_file) => session.userauth_pubkey_file(&config.username, None, key_file, None),
        None => session.userauth_agent(&config.username),
    };
    auth.map_err(|e| {
        SshError::Auth(
            config.username.clone(),
            config.host.clone(),
            e.to_string(),
        )
    })?;

    if !session.authenticated() {
        return Err(SshError::Auth(
            config.username.clone(),
            config.host.clone(),
            "authentication incomplete".to_string(),
        ));
    }

    Ok(session)
}
