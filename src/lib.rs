//! headwatch - Branch-Tracking Git Mirror Daemon
//!
//! headwatch keeps a fixed set of local repository mirrors aligned with
//! specific tracked branches ("heads"). An external webhook receiver touches
//! one hint file per head; headwatch notices the new timestamp, brings the
//! mirror to the branch tip and notifies a downstream handler exactly once per
//! newly observed revision. Progress is persisted per head so restarts are
//! safe.
//!
//! ## Modules
//!
//! - [`registry`]: Tracked heads and their configuration order
//! - [`config`]: Configuration management and parsing
//! - [`git`]: The retrying mirror update protocol
//! - [`state`]: Last processed revision per head
//! - [`hints`]: Hint-file change detection
//! - [`notify`]: Downstream notification handlers
//! - [`reconcile`]: Change detection against stored state, and commit
//! - [`events`]: SQLite event history
//! - [`daemon`]: Startup pass, polling loop and process management

pub mod config;
pub mod daemon;
pub mod events;
pub mod git;
pub mod hints;
pub mod notify;
pub mod reconcile;
pub mod registry;
pub mod state;

pub use config::Config;
pub use daemon::{Daemon, StartupConflict};
pub use git::{GitRunner, GitSync, RetryPolicy, SyncError, SystemGit};
pub use hints::ChangeDetector;
pub use notify::{LogNotifier, Notifier};
pub use reconcile::{PendingChange, Reconciler};
pub use registry::{Head, RepoRegistry};
pub use state::StateStore;
