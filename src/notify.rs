//! Downstream notification - told about every newly observed revision
//!
//! Handlers are expected to be idempotent; the reconciler calls them once per
//! distinct change, but a crash between notifying and persisting state means
//! the same change can be delivered again after restart.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::config::Config;
use crate::registry::Head;

/// Receives `(head, revision)` for each processed change
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, head: &Head, revision: &str) -> Result<()>;

    /// Handler name for display/logging
    fn name(&self) -> &'static str;
}

/// Only logs the change
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, head: &Head, revision: &str) -> Result<()> {
        info!(
            repo = %head.repo,
            branch = %head.branch,
            revision = %revision,
            "Head changed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Runs an external program with repo, branch and revision appended
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: &[String]) -> Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            bail!("Notify command is empty");
        };

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, head: &Head, revision: &str) -> Result<()> {
        debug!("Running {} for {} at {}", self.program, head, revision);

        let output = AsyncCommand::new(&self.program)
            .args(&self.args)
            .args([head.repo.as_str(), head.branch.as_str(), revision])
            .output()
            .await
            .with_context(|| format!("Failed to execute notify command {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Notify command {} failed for {} ({}): {}",
                self.program,
                head,
                output.status,
                stderr.trim()
            );
        }

        info!("Notified {} of {} at {}", self.program, head, revision);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

/// Build the configured notifier
pub fn notifier_from_config(config: &Config) -> Result<Box<dyn Notifier>> {
    match &config.notify.command {
        Some(argv) => Ok(Box::new(CommandNotifier::new(argv)?)),
        None => Ok(Box::new(LogNotifier)),
    }
}
