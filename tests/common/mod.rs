//! Common test utilities and helpers for headwatch tests
#![allow(dead_code)]

use anyhow::Result;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use async_trait::async_trait;
use filetime::{set_file_mtime, FileTime};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use headwatch::{Head, Notifier};

/// Whether a usable git binary is on PATH
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Run git in `dir`, panicking with stderr on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=headwatch-test", "-c", "user.email=test@example.com"])
        .args(["-c", "init.defaultBranch=main", "-c", "advice.detachedHead=false"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to execute git");

    assert!(
        output.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );

    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// An upstream bare repository, a working clone to push from, and a mirror
/// root for the daemon to manage
pub struct GitFixture {
    pub temp_dir: TempDir,
    pub origin: PathBuf,
    pub work: PathBuf,
    pub repo_root: PathBuf,
    pub hint_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl GitFixture {
    /// Upstream `name` with branches `main` and `dev`, mirrored under repo_root
    pub fn new(name: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let origin = temp_dir.child("origin.git").to_path_buf();
        let work = temp_dir.child("work").to_path_buf();
        let repo_root = temp_dir.child("git").to_path_buf();
        let hint_dir = temp_dir.child("hints").to_path_buf();
        let state_dir = temp_dir.child("state").to_path_buf();

        for dir in [&origin, &work, &repo_root, &hint_dir] {
            std::fs::create_dir_all(dir).expect("Failed to create fixture dir");
        }

        git(&origin, &["init", "--bare"]);
        git(&work, &["init"]);
        std::fs::write(work.join("README"), "first\n").unwrap();
        git(&work, &["add", "README"]);
        git(&work, &["commit", "-m", "first"]);
        git(&work, &["branch", "-M", "main"]);
        git(&work, &["remote", "add", "origin", origin.to_str().unwrap()]);
        git(&work, &["push", "origin", "main"]);

        git(&work, &["checkout", "-b", "dev"]);
        std::fs::write(work.join("DEV"), "dev\n").unwrap();
        git(&work, &["add", "DEV"]);
        git(&work, &["commit", "-m", "dev work"]);
        git(&work, &["push", "origin", "dev"]);
        git(&work, &["checkout", "main"]);

        git(
            &repo_root,
            &["clone", "--branch", "main", origin.to_str().unwrap(), name],
        );

        Self {
            temp_dir,
            origin,
            work,
            repo_root,
            hint_dir,
            state_dir,
        }
    }

    /// Commit a change on `branch` upstream and return the new revision
    pub fn push_commit(&self, branch: &str, file: &str, content: &str) -> String {
        git(&self.work, &["checkout", branch]);
        std::fs::write(self.work.join(file), content).unwrap();
        git(&self.work, &["add", file]);
        git(&self.work, &["commit", "-m", content]);
        git(&self.work, &["push", "origin", branch]);
        self.upstream_revision(branch)
    }

    pub fn upstream_revision(&self, branch: &str) -> String {
        git(&self.origin, &["rev-parse", &format!("refs/heads/{}", branch)])
    }

    /// Set a hint file's mtime, creating it if needed
    pub fn touch_hint(&self, key: &str, seconds: i64) {
        let path = self.hint_dir.join(key);
        if !path.exists() {
            std::fs::write(&path, b"").unwrap();
        }
        set_file_mtime(&path, FileTime::from_unix_time(seconds, 0)).unwrap();
    }

    /// Minimal YAML config pointing at this fixture
    pub fn config_yaml(&self, repo: &str) -> String {
        format!(
            r#"
repo_root: "{}"
hint_dir: "{}"
state_dir: "{}"
poll_interval: 1s
retry:
  interval: 1s
  max_attempts: 2
daemon:
  pid_file: "{}"
events:
  enabled: false
repos:
  {}: [main, dev]
"#,
            self.repo_root.display(),
            self.hint_dir.display(),
            self.state_dir.display(),
            self.temp_dir.child("headwatch.pid").path().display(),
            repo
        )
    }
}

/// Notifier that remembers every call
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    calls: Arc<Mutex<Vec<(String, String, String)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, head: &Head, revision: &str) -> Result<()> {
        self.calls.lock().unwrap().push((
            head.repo.clone(),
            head.branch.clone(),
            revision.to_string(),
        ));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Write a config file into `dir` and return its path
pub fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("config.yml");
    std::fs::write(&path, content).expect("Failed to write test config");
    path
}
