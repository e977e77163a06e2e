//! Asynchronous command execution with timeouts.
//!
//! All spawned processes (`incus exec ...`, `nsenter ...`) go through the
//! `CommandRunner` seam so provisioning logic can be exercised without a host.
use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{KapsuleError, Result};

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit is not an error here; callers inspect `ExecOutput::success`.
    async fn run(&self, request: ExecRequest) -> Result<ExecOutput>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// `incus exec <container> -- <argv...>`
    pub fn incus_exec<I, S>(incus_bin: &str, container: &str, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(incus_bin)
            .args(["exec", container, "--"])
            .args(argv)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// Program followed by its arguments.
    pub fn command_line(&self) -> Vec<String> {
        let mut v = Vec::with_capacity(self.args.len() + 1);
        v.push(self.program.clone());
        v.extend(self.args.iter().cloned());
        v
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub code: Option<i32>,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stderr, falling back to the exit code when stderr is empty.
    pub fn failure_reason(&self) -> String {
        let s = self.stderr.trim();
        if !s.is_empty() {
            return s.to_string();
        }
        match self.code {
            Some(c) => format!("exit status {c}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs real processes with `tokio::process`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    default_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let child = cmd.spawn().map_err(|e| {
            KapsuleError::Io(io::Error::new(
                e.kind(),
                format!("failed to spawn {}: {}", request.program, e),
            ))
        })?;

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let output = if timeout.is_zero() {
            child.wait_with_output().await?
        } else {
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(out) => out?,
                Err(_) => {
                    return Err(KapsuleError::Command(format!(
                        "command {} timed out after {}",
                        request.program,
                        humantime::format_duration(timeout)
                    )))
                }
            }
        };

        let out = ExecOutput {
            code: output.status.code(),
            duration: started.elapsed(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(
            program = %request.program,
            code = ?out.code,
            elapsed_ms = out.duration.as_millis() as u64,
            "command finished"
        );
        Ok(out)
    }
}
