//! Hint-file change detection
//!
//! An external webhook receiver touches `<hint_dir>/<repo>:<branch>` whenever
//! upstream activity is seen. Only existence and modification time matter.
//! The detector samples once per tick, so several touches between two ticks
//! are reported as one change.

use filetime::FileTime;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::registry::Head;

pub struct ChangeDetector {
    hint_dir: PathBuf,
    heads: Vec<Head>,
    last_seen: HashMap<Head, FileTime>,
}

impl ChangeDetector {
    pub fn new(hint_dir: impl Into<PathBuf>, heads: impl IntoIterator<Item = Head>) -> Self {
        Self {
            hint_dir: hint_dir.into(),
            heads: heads.into_iter().collect(),
            last_seen: HashMap::new(),
        }
    }

    /// Record current hint timestamps without reporting anything, so hints
    /// that predate startup are not treated as new
    pub fn seed(&mut self) {
        for head in &self.heads {
            if let Some(mtime) = self.modified(head) {
                self.last_seen.insert(head.clone(), mtime);
            }
        }
        debug!("Seeded {} hint timestamps", self.last_seen.len());
    }

    /// Heads whose hint appeared or moved forward since the previous call,
    /// in registry order
    pub fn scan(&mut self) -> Vec<Head> {
        let mut changed = Vec::new();

        for head in &self.heads {
            let Some(mtime) = self.modified(head) else {
                continue;
            };

            let is_new = match self.last_seen.get(head) {
                Some(previous) => mtime > *previous,
                None => true,
            };

            if is_new {
                debug!("Detected update from webhook: {}", head);
                self.last_seen.insert(head.clone(), mtime);
                changed.push(head.clone());
            }
        }

        changed
    }

    pub fn last_seen(&self, head: &Head) -> Option<FileTime> {
        self.last_seen.get(head).copied()
    }

    pub fn hint_path(&self, head: &Head) -> PathBuf {
        self.hint_dir.join(head.key())
    }

    pub fn hint_dir(&self) -> &Path {
        &self.hint_dir
    }

    fn modified(&self, head: &Head) -> Option<FileTime> {
        let path = self.hint_path(head);
        match fs::metadata(&path) {
            Ok(metadata) => Some(FileTime::from_last_modification_time(&metadata)),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Cannot read hint {}: {}", path.display(), e);
                None
            }
        }
    }
}
