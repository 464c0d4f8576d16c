//! # driftwatch
//!
//! This crate watches heterogeneous file-bearing sources (a local
//! filesystem subtree, an object-store bucket, a cloud drive, a cloud file
//! store, a git repository) and emits a uniform stream of change
//! notifications for each logical file it observes.
//!
//! ## Features
//!
//! - **Uniform events**: every backend reports `Created` / `Changed` /
//!   `Deleted` / `MetadataChanged` with a typed backend record attached
//! - **Polling change detection**: a shared snapshot differ compares each
//!   fresh listing against the cached previous one
//! - **Hybrid local mode**: the local backend can use kernel notifications
//!   instead of polling
//! - **Bounded queues**: consumers drain events and errors from bounded
//!   channels; a full queue backpressures the poller instead of dropping
//!
//! ## Architecture
//!
//! ```text
//! Registry ──► Watcher ──► poll loop ──► enumerate ──► differ ──► Events
//!                 │                                                Errors
//!                 └── set_config / start / close
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use driftwatch::Watcher as _;
//!
//! # async fn run() -> driftwatch::Result<()> {
//! let mut watcher = driftwatch::new("local", "/tmp/watched", Duration::from_secs(5))?;
//! watcher.set_config(&Default::default())?;
//! let mut events = watcher.take_events().expect("events are taken once");
//! watcher.start().await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{} {}", event.kind, event.key);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dropbox;
pub mod error;
pub mod event;
pub mod gdrive;
pub mod git;
pub mod local;
pub mod registry;
pub mod s3;

mod diff;
mod poll;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use config::{Flag, Options};
pub use error::{Result, WatchError};
pub use event::{
    DriveRecord, Event, EventKind, LocalRecord, ObjectRecord, Record, RepoCommit, RepoFileRecord,
    RepoLogRecord,
};
pub use registry::{Factory, Registry};

/// A long-lived observer of one source.
///
/// Lifecycle: created idle by a [`Registry`] factory, configured through
/// [`set_config`](Watcher::set_config) (repeatable before start), started
/// once, and closed. After `start` all failures flow through the error
/// queue; `close` makes the background task shut both queues.
#[async_trait]
pub trait Watcher: Send {
    /// Bind and validate a configuration map. May be called repeatedly
    /// before `start`; each call replaces the previous configuration.
    fn set_config(&mut self, options: &Options) -> Result<()>;

    /// Validate readiness and spawn the background task.
    async fn start(&mut self) -> Result<()>;

    /// Signal the background task to stop. Safe to call before `start`
    /// and idempotent afterwards.
    fn close(&mut self);

    /// The event queue. Yields `None` once per watcher; events arrive on a
    /// bounded channel that the consumer must drain.
    fn take_events(&mut self) -> Option<mpsc::Receiver<Event>>;

    /// The error queue for non-fatal per-tick failures.
    fn take_errors(&mut self) -> Option<mpsc::Receiver<WatchError>>;
}

/// Create an idle watcher for `service` from the default registry.
///
/// Fails with [`WatchError::UnknownService`] when no backend is registered
/// under that name.
pub fn new(service: &str, dir: &str, interval: Duration) -> Result<Box<dyn Watcher>> {
    Registry::new().create(service, dir, interval)
}
