//! Daemon Infrastructure - the long-running head tracking service
//!
//! Startup runs one forced reconciliation over every tracked head, then the
//! daemon polls the hint directory on a fixed interval and reconciles whatever
//! the detector reports. Everything runs on one task, one head at a time.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{EventBuilder, EventLog, EventType};
use crate::git::{GitSync, RetryPolicy, SystemGit};
use crate::hints::ChangeDetector;
use crate::notify::notifier_from_config;
use crate::reconcile::{PendingChange, Reconciler};
use crate::registry::Head;
use crate::state::StateStore;

/// Another instance already holds the PID file
#[derive(Debug, Error)]
#[error("headwatch is already running with pid {pid} (pid file {})", .pid_file.display())]
pub struct StartupConflict {
    pub pid: i32,
    pub pid_file: PathBuf,
}

/// Daemon state and control
pub struct Daemon {
    config: Arc<Config>,
    reconciler: Reconciler,
    detector: ChangeDetector,
    events: Option<EventLog>,
    poll_interval: Duration,
    shutdown_sender: broadcast::Sender<()>,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    /// Create a new daemon instance from configuration
    pub async fn new(config: Config) -> Result<Self> {
        let retry = RetryPolicy {
            interval: config.retry_interval()?,
            max_attempts: config.retry.max_attempts,
        };
        let git = GitSync::new(Arc::new(SystemGit::new(&config.git_binary)), retry);

        let store = StateStore::open(&config.state_dir, &config.repos)
            .context("Failed to open state store")?;
        let notifier = notifier_from_config(&config)?;
        let reconciler = Reconciler::new(
            config.repos.clone(),
            &config.repo_root,
            git,
            store,
            notifier,
        );

        let events = if config.events.enabled {
            match EventLog::open_at(std::path::Path::new(&config.events.database)) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!("Event log unavailable, continuing without it: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        Self::with_parts(config, reconciler, events)
    }

    /// Assemble a daemon from prebuilt components
    pub fn with_parts(
        config: Config,
        reconciler: Reconciler,
        events: Option<EventLog>,
    ) -> Result<Self> {
        let poll_interval = config.poll_interval()?;
        let detector = ChangeDetector::new(&config.hint_dir, config.repos.heads());
        let (shutdown_sender, _) = broadcast::channel(1);

        let pid_file_path = if config.daemon.pid_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&config.daemon.pid_file))
        };

        Ok(Self {
            config: Arc::new(config),
            reconciler,
            detector,
            events,
            poll_interval,
            shutdown_sender,
            pid_file_path,
        })
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Handle that stops `run` at its next await point
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    /// Run until a shutdown signal arrives or a pass fails
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Starting headwatch v{} with pid {}",
            env!("CARGO_PKG_VERSION"),
            std::process::id()
        );

        self.write_pid_file().context("Failed to write PID file")?;
        self.record(EventBuilder::new(EventType::Startup, "daemon started"));

        // Spawn shutdown signal handler
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        let shutdown_sender = self.shutdown_sender.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal().await {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
            info!("Shutdown signal received, stopping daemon...");
            let _ = shutdown_sender.send(());
        });

        let result = tokio::select! {
            _ = shutdown_receiver.recv() => Ok(()),
            result = self.serve() => result,
        };

        match &result {
            Ok(()) => self.record(EventBuilder::new(EventType::Shutdown, "daemon stopped")),
            Err(e) => {
                error!("Unhandled error, headwatch must terminate: {:?}", e);
                self.record(EventBuilder::new(EventType::SyncError, format!("{:#}", e)));
            }
        }

        self.cleanup().context("Failed to cleanup daemon")?;
        result
    }

    /// Startup pass followed by the polling loop
    async fn serve(&mut self) -> Result<()> {
        // Hints present now are covered by the startup pass
        self.detector.seed();
        self.startup_pass().await?;

        info!(
            "Polling {} every {:?}",
            self.detector.hint_dir().display(),
            self.poll_interval
        );

        loop {
            tokio::time::sleep(self.poll_interval).await;
            self.poll_once().await?;
        }
    }

    /// Reconcile every tracked head unconditionally
    pub async fn startup_pass(&mut self) -> Result<usize> {
        debug!("Updating all tracked heads...");
        let heads: Vec<Head> = self.reconciler.registry().heads().collect();
        self.pass(&heads, true).await
    }

    /// One polling tick: reconcile heads whose hint moved
    pub async fn poll_once(&mut self) -> Result<usize> {
        let changed = self.detector.scan();
        if changed.is_empty() {
            return Ok(0);
        }
        self.pass(&changed, false).await
    }

    async fn pass(&mut self, heads: &[Head], force_all: bool) -> Result<usize> {
        let changes = self.reconciler.reconcile(heads, force_all).await?;
        self.reconciler.commit(&changes).await?;
        self.record_processed(&changes);
        Ok(changes.len())
    }

    fn record_processed(&self, changes: &[PendingChange]) {
        for change in changes {
            self.record(
                EventBuilder::new(EventType::Processed, "new revision processed")
                    .head(change.head.key())
                    .revision(change.revision.as_str()),
            );
        }
    }

    fn record(&self, builder: EventBuilder) {
        if let Some(events) = &self.events {
            if let Err(e) = events.record(builder) {
                warn!("Failed to record event: {:#}", e);
            }
        }
    }

    /// Write PID file for daemon process management
    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    /// Remove PID file and prune old events
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        if let Some(events) = &self.events {
            match events.cleanup_old_events(self.config.events.retention_days) {
                Ok(0) => {}
                Ok(count) => debug!("Pruned {} old events", count),
                Err(e) => warn!("Failed to prune events: {:#}", e),
            }
        }

        info!("headwatch shutting down with pid {}", std::process::id());
        Ok(())
    }

    /// Detach from the terminal (Unix platforms). Must run before the async
    /// runtime is started.
    #[cfg(unix)]
    pub fn daemonize(config: &Config) -> Result<()> {
        use daemonize::Daemonize;

        let log_path = PathBuf::from(&config.daemon.log_file);
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        let mut daemonize = Daemonize::new()
            .working_directory(&config.daemon.working_directory)
            .umask(config.daemon.umask)
            .stdout(log_file.try_clone()?)
            .stderr(log_file);

        if !config.daemon.pid_file.is_empty() {
            daemonize = daemonize.pid_file(&config.daemon.pid_file).chown_pid_file(true);
        }
        if let Some(user) = &config.daemon.user {
            daemonize = daemonize.user(user.as_str());
        }
        if let Some(group) = &config.daemon.group {
            daemonize = daemonize.group(group.as_str());
        }

        daemonize.start().context("Failed to daemonize process")?;
        Ok(())
    }
}

/// Wait for SIGTERM, SIGHUP or Ctrl+C
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sigterm.recv() => debug!("SIGTERM received"),
        _ = sighup.recv() => debug!("SIGHUP received"),
        result = tokio::signal::ctrl_c() => {
            result?;
            debug!("Ctrl+C received");
        }
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    debug!("Ctrl+C received");
    Ok(())
}

/// Refuse to start if another live instance owns the PID file
pub fn ensure_single_instance(config: &Config) -> Result<()> {
    if let Some(pid) = running_pid(config)? {
        return Err(StartupConflict {
            pid,
            pid_file: PathBuf::from(&config.daemon.pid_file),
        }
        .into());
    }
    Ok(())
}

/// Check if daemon is currently running by checking PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    Ok(running_pid(config)?.is_some())
}

/// PID of the live instance, removing a stale PID file
pub fn running_pid(config: &Config) -> Result<Option<i32>> {
    if config.daemon.pid_file.is_empty() {
        return Ok(None);
    }

    let pid_file = PathBuf::from(&config.daemon.pid_file);
    if !pid_file.exists() {
        return Ok(None);
    }

    let pid_str = fs::read_to_string(&pid_file).context("Failed to read PID file")?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in PID file")?;

    // Check if process is actually running
    #[cfg(unix)]
    let running = {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid), None) {
            Ok(_) => true,
            Err(Errno::ESRCH) => {
                warn!("Removing stale PID file {} (pid {})", pid_file.display(), pid);
                let _ = fs::remove_file(&pid_file);
                false
            }
            Err(_) => true, // Assume running if we can't check
        }
    };

    #[cfg(not(unix))]
    let running = true;

    Ok(running.then_some(pid))
}

/// Send SIGTERM to the running instance
pub fn stop_daemon(config: &Config) -> Result<Option<i32>> {
    let Some(pid) = running_pid(config)? else {
        return Ok(None);
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
            .context("Failed to send SIGTERM to daemon process")?;
        info!("Shutdown signal sent to daemon process {}", pid);
    }

    #[cfg(not(unix))]
    {
        warn!("Daemon stop not implemented for this platform");
    }

    Ok(Some(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::{failed, ScriptedGit};
    use crate::notify::MockNotifier;
    use crate::registry::RepoRegistry;
    use filetime::{set_file_mtime, FileTime};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        temp_dir: TempDir,
        runner: Arc<ScriptedGit>,
        notified: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Harness {
        fn new() -> Self {
            let temp_dir = tempdir().unwrap();
            fs::create_dir_all(temp_dir.path().join("hints")).unwrap();
            Self {
                temp_dir,
                runner: Arc::new(ScriptedGit::new()),
                notified: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn config(&self) -> Config {
            let root = self.temp_dir.path();
            let mut config = Config::default();
            config.repo_root = root.join("git").to_string_lossy().into_owned();
            config.hint_dir = root.join("hints").to_string_lossy().into_owned();
            config.state_dir = root.join("state").to_string_lossy().into_owned();
            config.daemon.pid_file = root.join("headwatch.pid").to_string_lossy().into_owned();
            config.repos = RepoRegistry::new([("X", vec!["main"]), ("Y", vec!["dev"])]).unwrap();
            config
        }

        fn daemon(&self) -> Daemon {
            self.daemon_with(self.config())
        }

        fn daemon_with(&self, config: Config) -> Daemon {
            let store = StateStore::open(&config.state_dir, &config.repos).unwrap();

            let notified = self.notified.clone();
            let mut notifier = MockNotifier::new();
            notifier.expect_notify().returning(move |head, revision| {
                notified
                    .lock()
                    .unwrap()
                    .push((head.key(), revision.to_string()));
                Ok(())
            });
            notifier.expect_name().return_const("mock");

            let reconciler = Reconciler::new(
                config.repos.clone(),
                &config.repo_root,
                GitSync::new(self.runner.clone(), RetryPolicy::default()),
                store,
                Box::new(notifier),
            );
            Daemon::with_parts(config, reconciler, Some(EventLog::open_in_memory().unwrap()))
                .unwrap()
        }

        fn repo(&self, name: &str) -> PathBuf {
            self.temp_dir.path().join("git").join(name)
        }

        fn touch_hint(&self, key: &str, seconds: i64) {
            let path = self.temp_dir.path().join("hints").join(key);
            if !path.exists() {
                fs::write(&path, b"").unwrap();
            }
            set_file_mtime(&path, FileTime::from_unix_time(seconds, 0)).unwrap();
        }

        fn touch_hint_nested(&self, key: &str, seconds: i64) {
            let path = self.temp_dir.path().join("hints").join(key);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, b"").unwrap();
            set_file_mtime(&path, FileTime::from_unix_time(seconds, 0)).unwrap();
        }

        fn notified(&self) -> Vec<(String, String)> {
            self.notified.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_startup_pass_processes_every_head() {
        let harness = Harness::new();
        harness.runner.set_revision(harness.repo("X"), "abc123");
        harness.runner.set_revision(harness.repo("Y"), "fff000");

        let mut daemon = harness.daemon();
        assert_eq!(daemon.startup_pass().await.unwrap(), 2);

        assert_eq!(
            harness.notified(),
            vec![
                ("X:main".to_string(), "abc123".to_string()),
                ("Y:dev".to_string(), "fff000".to_string()),
            ]
        );

        let store = daemon.reconciler().store();
        assert_eq!(store.get(&Head::new("X", "main")), Some("abc123"));
        assert_eq!(store.get(&Head::new("Y", "dev")), Some("fff000"));
    }

    #[tokio::test]
    async fn test_poll_reconciles_only_hinted_heads() {
        let harness = Harness::new();
        harness.runner.set_revision(harness.repo("X"), "abc000");
        harness.runner.set_revision(harness.repo("Y"), "fff000");
        harness.touch_hint("X:main", 1_000);

        let mut daemon = harness.daemon();
        daemon.detector.seed();
        daemon.startup_pass().await.unwrap();
        let pulls_after_startup = harness.runner.count("pull");

        // Preexisting hint does not trigger a second pass
        assert_eq!(daemon.poll_once().await.unwrap(), 0);
        assert_eq!(harness.runner.count("pull"), pulls_after_startup);

        // Upstream moves, hint touched twice before the tick
        harness.runner.set_revision(harness.repo("X"), "abc123");
        harness.touch_hint("X:main", 1_001);
        harness.touch_hint("X:main", 1_002);

        assert_eq!(daemon.poll_once().await.unwrap(), 1);
        assert_eq!(harness.runner.count("pull"), pulls_after_startup + 1);
        assert_eq!(
            harness.notified().last(),
            Some(&("X:main".to_string(), "abc123".to_string()))
        );
        assert_eq!(
            daemon.reconciler().store().get(&Head::new("X", "main")),
            Some("abc123")
        );
    }

    #[tokio::test]
    async fn test_hint_without_upstream_change_is_silent() {
        let harness = Harness::new();
        harness.runner.set_revision(harness.repo("X"), "abc123");
        harness.runner.set_revision(harness.repo("Y"), "fff000");

        let mut daemon = harness.daemon();
        daemon.detector.seed();
        daemon.startup_pass().await.unwrap();
        let notified_after_startup = harness.notified().len();

        harness.touch_hint("Y:dev", 2_000);
        assert_eq!(daemon.poll_once().await.unwrap(), 0);
        assert_eq!(harness.notified().len(), notified_after_startup);
    }

    #[tokio::test]
    async fn test_startup_pass_with_nested_branch_name() {
        let harness = Harness::new();
        harness.runner.set_revision(harness.repo("LTM"), "abc123");

        let mut config = harness.config();
        config.repos = RepoRegistry::new([("LTM", vec!["feature/x"])]).unwrap();
        let mut daemon = harness.daemon_with(config);

        assert_eq!(daemon.startup_pass().await.unwrap(), 1);
        assert_eq!(
            harness.notified(),
            vec![("LTM:feature/x".to_string(), "abc123".to_string())]
        );
        assert!(harness
            .temp_dir
            .path()
            .join("state/LTM:feature/x")
            .is_file());

        // A second boot finds the stored revision and stays quiet
        let mut daemon = harness.daemon_with(daemon.config.as_ref().clone());
        assert_eq!(
            daemon.reconciler().store().get(&Head::new("LTM", "feature/x")),
            Some("abc123")
        );
        harness.touch_hint_nested("LTM:feature/x", 1_000);
        assert_eq!(daemon.poll_once().await.unwrap(), 0);
        assert_eq!(harness.runner.count("pull"), 2);
        assert_eq!(harness.notified().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_pass_is_fatal() {
        let harness = Harness::new();
        harness.runner.push("reset", failed(128, "fatal: not a git repository"));

        let mut daemon = harness.daemon();
        assert!(daemon.startup_pass().await.is_err());
        assert!(harness.notified().is_empty());
    }

    #[tokio::test]
    async fn test_processed_changes_are_recorded() {
        let harness = Harness::new();
        harness.runner.set_revision(harness.repo("X"), "abc123");
        harness.runner.set_revision(harness.repo("Y"), "fff000");

        let mut daemon = harness.daemon();
        daemon.startup_pass().await.unwrap();

        let events = daemon.events.as_ref().unwrap().recent(10).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == EventType::Processed));
        assert_eq!(events[0].head.as_deref(), Some("Y:dev"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_removes_pid_file() {
        let harness = Harness::new();
        harness.runner.set_revision(harness.repo("X"), "abc123");
        harness.runner.set_revision(harness.repo("Y"), "fff000");

        let mut daemon = harness.daemon();
        let shutdown = daemon.shutdown_handle();
        let pid_file = harness.temp_dir.path().join("headwatch.pid");

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = shutdown.send(());
        });

        daemon.run().await.unwrap();
        stopper.await.unwrap();

        assert!(!pid_file.exists());
        assert_eq!(harness.notified().len(), 2);
    }

    #[tokio::test]
    async fn test_run_records_fatal_error_and_removes_pid_file() {
        let harness = Harness::new();
        harness.runner.push("reset", failed(128, "fatal: not a git repository"));

        let mut daemon = harness.daemon();
        let pid_file = harness.temp_dir.path().join("headwatch.pid");

        let err = daemon.run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("not a git repository"));

        let events: Vec<EventType> = daemon
            .events
            .as_ref()
            .unwrap()
            .recent(10)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(events, vec![EventType::SyncError, EventType::Startup]);
        assert!(!pid_file.exists());
        assert!(harness.notified().is_empty());
    }

    #[test]
    fn test_no_pid_file_means_not_running() {
        let temp_dir = tempdir().unwrap();
        let mut config = Config::default();
        config.daemon.pid_file = temp_dir.path().join("test.pid").to_string_lossy().into_owned();

        assert!(!is_daemon_running(&config).unwrap());
        assert!(ensure_single_instance(&config).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_live_pid_is_a_startup_conflict() {
        let temp_dir = tempdir().unwrap();
        let pid_file = temp_dir.path().join("test.pid");
        fs::write(&pid_file, std::process::id().to_string()).unwrap();

        let mut config = Config::default();
        config.daemon.pid_file = pid_file.to_string_lossy().into_owned();

        assert!(is_daemon_running(&config).unwrap());
        let err = ensure_single_instance(&config).unwrap_err();
        let conflict = err.downcast_ref::<StartupConflict>().unwrap();
        assert_eq!(conflict.pid, std::process::id() as i32);
    }

    #[test]
    fn test_garbage_pid_file_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let pid_file = temp_dir.path().join("test.pid");
        fs::write(&pid_file, "not-a-pid").unwrap();

        let mut config = Config::default();
        config.daemon.pid_file = pid_file.to_string_lossy().into_owned();

        assert!(running_pid(&config).is_err());
        assert!(Path::new(&pid_file).exists());
    }
}
