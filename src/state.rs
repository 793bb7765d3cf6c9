//! Revision State - last processed revision per head
//!
//! One plain-text file per head, named by the head key, inside the state
//! directory. Files are replaced atomically (temp file + fsync + rename), so a
//! crash mid-write leaves either the old revision or the new one.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::git::Revision;
use crate::registry::{Head, RepoRegistry};

/// Durable mapping from head to last processed revision
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    revisions: HashMap<Head, Revision>,
}

impl StateStore {
    /// Open the store, creating the directory if needed, and load every
    /// persisted revision of the registry's heads
    pub fn open(dir: impl Into<PathBuf>, registry: &RepoRegistry) -> Result<Self> {
        let dir = dir.into();

        if !dir.exists() {
            debug!("State directory does not exist, creating: {}", dir.display());
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create state directory {}", dir.display()))?;
        }

        Self::inspect(dir, registry)
    }

    /// Load persisted revisions without touching the filesystem. A missing
    /// directory yields an empty store.
    pub fn inspect(dir: impl Into<PathBuf>, registry: &RepoRegistry) -> Result<Self> {
        let mut store = Self {
            dir: dir.into(),
            revisions: HashMap::new(),
        };
        store.load(registry)?;
        Ok(store)
    }

    /// Re-read persisted revisions. Heads without a state file are omitted.
    pub fn load(&mut self, registry: &RepoRegistry) -> Result<()> {
        self.revisions.clear();

        for head in registry.heads() {
            let path = self.path_for(&head);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to read state file {}", path.display())
                    })
                }
            };

            let revision = content.trim();
            if revision.is_empty() {
                warn!("Ignoring empty state file {}", path.display());
                continue;
            }

            self.revisions.insert(head, revision.to_string());
        }

        debug!("Loaded {} stored revisions", self.revisions.len());
        Ok(())
    }

    pub fn get(&self, head: &Head) -> Option<&str> {
        self.revisions.get(head).map(String::as_str)
    }

    /// Record and persist the revision of a head
    pub fn set(&mut self, head: &Head, revision: &str) -> Result<()> {
        let path = self.path_for(head);
        write_atomic(&path, revision)
            .with_context(|| format!("Failed to persist state for {}", head))?;

        self.revisions.insert(head.clone(), revision.to_string());
        debug!("Stored {} = {}", head, revision);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// State file of a head
    pub fn path_for(&self, head: &Head) -> PathBuf {
        self.dir.join(head.key())
    }
}

fn write_atomic(path: &Path, revision: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    // Branch names with slashes nest below the state directory
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        writeln!(file, "{}", revision)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", tmp.display()))?;

    Ok(())
}
