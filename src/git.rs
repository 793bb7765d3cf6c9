//! Git synchronization - brings one mirror to the tip of one tracked branch
//!
//! The update protocol is a fixed sequence of git invocations. Each step
//! carries its own failure policy: the network step (`pull`) is retried on a
//! fixed interval, every other step fails fast.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error, info, warn};

/// Opaque revision identifier (a commit SHA for git)
pub type Revision = String;

/// Failures of the update protocol
#[derive(Debug, Error)]
pub enum SyncError {
    /// A fail-fast step exited unsuccessfully
    #[error("`git {command}` failed in {} ({}): {}", .repo.display(), describe_status(.status), .stderr.trim())]
    GitCommand {
        repo: PathBuf,
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// A retryable step kept failing until the retry budget ran out
    #[error("`git {command}` in {} failed {attempts} times, giving up: {}", .repo.display(), .last_error.trim())]
    TooManyRetries {
        repo: PathBuf,
        command: String,
        attempts: u32,
        last_error: String,
    },

    /// Git could not be started at all
    #[error("failed to launch {}: {source}", .binary.display())]
    Launch {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// rev-parse succeeded but printed nothing
    #[error("could not resolve the current revision in {}", .repo.display())]
    EmptyRevision { repo: PathBuf },
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Captured result of one git invocation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Executes git invocations in an explicit working directory
#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Run `git <args>` inside `repo`. A non-zero exit is not an error here;
    /// only failing to start the process is.
    async fn run(&self, repo: &Path, args: &[String]) -> Result<GitOutput, SyncError>;
}

/// Runs the system git binary
#[derive(Debug, Clone)]
pub struct SystemGit {
    binary: PathBuf,
}

impl SystemGit {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl GitRunner for SystemGit {
    async fn run(&self, repo: &Path, args: &[String]) -> Result<GitOutput, SyncError> {
        // A spawn in a missing directory would read as a missing binary
        if !repo.is_dir() {
            return Ok(GitOutput {
                status: Some(128),
                stdout: String::new(),
                stderr: format!(
                    "fatal: cannot change to '{}': mirror directory does not exist",
                    repo.display()
                ),
            });
        }

        let output = AsyncCommand::new(&self.binary)
            .args(args)
            .current_dir(repo)
            .output()
            .await
            .map_err(|source| SyncError::Launch {
                binary: self.binary.clone(),
                source,
            })?;

        Ok(GitOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// How a failing step is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
    /// Abort the update on the first failure
    FailFast,
    /// Sleep and try again, within the retry budget
    Retry,
}

/// One step of the update protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Drop staged and unstaged changes
    ResetHard,
    /// Drop untracked files
    Clean,
    /// Switch to the tracked branch
    Checkout,
    /// Fetch and integrate upstream
    Pull,
    /// Read the revision at the branch tip
    ResolveRevision,
}

impl Step {
    /// Protocol order
    pub const SEQUENCE: [Step; 5] = [
        Step::ResetHard,
        Step::Clean,
        Step::Checkout,
        Step::Pull,
        Step::ResolveRevision,
    ];

    pub fn args(&self, branch: &str) -> Vec<String> {
        let args: &[&str] = match self {
            Step::ResetHard => &["reset", "--hard", "HEAD"],
            Step::Clean => &["clean", "-f"],
            Step::Checkout => &["checkout", branch],
            Step::Pull => &["pull"],
            Step::ResolveRevision => &["rev-parse", "HEAD"],
        };
        args.iter().map(|arg| arg.to_string()).collect()
    }

    pub fn policy(&self) -> StepPolicy {
        match self {
            Step::Pull => StepPolicy::Retry,
            _ => StepPolicy::FailFast,
        }
    }
}

/// Bounded fixed-interval retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between consecutive attempts
    pub interval: Duration,
    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_attempts: 1000,
        }
    }
}

/// Git update protocol driver
#[derive(Clone)]
pub struct GitSync {
    runner: Arc<dyn GitRunner>,
    retry: RetryPolicy,
}

impl GitSync {
    pub fn new(runner: Arc<dyn GitRunner>, retry: RetryPolicy) -> Self {
        Self { runner, retry }
    }

    /// Make the working copy at `repo_path` match the upstream tip of `branch`
    /// and return the resulting revision.
    ///
    /// On error the working copy is left as the failing step left it.
    pub async fn update_head(&self, repo_path: &Path, branch: &str) -> Result<Revision, SyncError> {
        debug!("Updating {} to branch {}", repo_path.display(), branch);

        let mut revision_output = None;
        for step in Step::SEQUENCE {
            let output = match step.policy() {
                StepPolicy::FailFast => self.run_once(repo_path, step, branch).await?,
                StepPolicy::Retry => self.run_with_retry(repo_path, step, branch).await?,
            };
            if step == Step::ResolveRevision {
                revision_output = Some(output);
            }
        }

        let revision = revision_output
            .map(|output| output.stdout.trim().to_string())
            .unwrap_or_default();

        if revision.is_empty() {
            return Err(SyncError::EmptyRevision {
                repo: repo_path.to_path_buf(),
            });
        }

        info!("{} at {} is now {}", repo_path.display(), branch, revision);
        Ok(revision)
    }

    async fn run_once(&self, repo: &Path, step: Step, branch: &str) -> Result<GitOutput, SyncError> {
        let args = step.args(branch);
        let output = self.runner.run(repo, &args).await?;

        if output.success() {
            return Ok(output);
        }

        log_failure(repo, &args, &output);
        Err(SyncError::GitCommand {
            repo: repo.to_path_buf(),
            command: args.join(" "),
            status: output.status,
            stderr: output.stderr,
        })
    }

    async fn run_with_retry(
        &self,
        repo: &Path,
        step: Step,
        branch: &str,
    ) -> Result<GitOutput, SyncError> {
        let args = step.args(branch);
        let mut attempts = 0u32;

        loop {
            let output = self.runner.run(repo, &args).await?;
            attempts += 1;

            if output.success() {
                if attempts > 1 {
                    info!(
                        "`git {}` in {} succeeded after {} attempts",
                        args.join(" "),
                        repo.display(),
                        attempts
                    );
                }
                return Ok(output);
            }

            log_failure(repo, &args, &output);

            if attempts >= self.retry.max_attempts {
                return Err(SyncError::TooManyRetries {
                    repo: repo.to_path_buf(),
                    command: args.join(" "),
                    attempts,
                    last_error: output.stderr,
                });
            }

            warn!(
                "Retrying `git {}` in {} in {:?} (attempt {}/{})",
                args.join(" "),
                repo.display(),
                self.retry.interval,
                attempts + 1,
                self.retry.max_attempts
            );
            tokio::time::sleep(self.retry.interval).await;
        }
    }
}

fn log_failure(repo: &Path, args: &[String], output: &GitOutput) {
    error!(
        repo = %repo.display(),
        command = %args.join(" "),
        status = %describe_status(&output.status),
        "git failed:\n{}",
        output.stderr.trim_end()
    );
}
