//! Reconciliation - turns candidate heads into genuine changes and commits them
//!
//! A pass syncs every candidate mirror, compares the resulting revision with
//! the stored one and yields only heads whose revision is new (or all of them
//! when forced). Committing notifies the downstream handler and then persists
//! the revision, one change at a time, in the order produced.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::git::{GitSync, Revision};
use crate::notify::Notifier;
use crate::registry::{Head, RepoRegistry};
use crate::state::StateStore;

/// A newly observed revision awaiting notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub head: Head,
    pub revision: Revision,
}

pub struct Reconciler {
    registry: RepoRegistry,
    repo_root: PathBuf,
    git: GitSync,
    store: StateStore,
    notifier: Box<dyn Notifier>,
}

impl Reconciler {
    pub fn new(
        registry: RepoRegistry,
        repo_root: impl Into<PathBuf>,
        git: GitSync,
        store: StateStore,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            repo_root: repo_root.into(),
            git,
            store,
            notifier,
        }
    }

    pub fn registry(&self) -> &RepoRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Mirror directory of a head's repository
    pub fn repo_path(&self, head: &Head) -> PathBuf {
        self.repo_root.join(&head.repo)
    }

    /// Sync each candidate and collect the heads whose revision differs from
    /// the stored one. Candidates are visited in registry order.
    ///
    /// The first sync failure aborts the pass.
    pub async fn reconcile(&self, heads: &[Head], force_all: bool) -> Result<Vec<PendingChange>> {
        for head in heads {
            if !self.registry.contains(head) {
                warn!("Ignoring untracked head {}", head);
            }
        }

        let mut pending = Vec::new();

        for head in self.registry.heads().filter(|head| heads.contains(head)) {
            let repo_path = self.repo_path(&head);
            let revision = self
                .git
                .update_head(&repo_path, &head.branch)
                .await
                .with_context(|| format!("Failed to update {}", head))?;

            match self.store.get(&head) {
                Some(stored) if stored == revision && !force_all => {
                    debug!("{} unchanged at {}", head, revision);
                }
                stored => {
                    debug!(
                        "{} changed: {} -> {}",
                        head,
                        stored.unwrap_or("(none)"),
                        revision
                    );
                    pending.push(PendingChange { head, revision });
                }
            }
        }

        Ok(pending)
    }

    /// Notify and persist each change in order. A failure stops the commit;
    /// changes already handled stay persisted.
    pub async fn commit(&mut self, changes: &[PendingChange]) -> Result<()> {
        for change in changes {
            self.notifier
                .notify(&change.head, &change.revision)
                .await
                .with_context(|| {
                    format!(
                        "{} handler failed for {} at {}",
                        self.notifier.name(),
                        change.head,
                        change.revision
                    )
                })?;

            self.store.set(&change.head, &change.revision)?;
            info!("Processed {} at {}", change.head, change.revision);
        }

        Ok(())
    }
}
