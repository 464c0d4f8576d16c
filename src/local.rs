//! Local filesystem watcher.
//!
//! Two modes share the record construction path: a polling mode that walks
//! the watched subtree every tick and diffs it against the cached listing,
//! and a kernel-notify mode (the default) that subscribes to every
//! subdirectory and translates primitive notification ops into events.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{self, Flag, Options};
use crate::diff::{Differ, Snapshot};
use crate::error::{Result, WatchError};
use crate::event::{Event, EventKind, LocalRecord, Record};
use crate::poll::{Sink, Synchronizer, WatcherBase};
use crate::Watcher;

/// Configuration for the local watcher. All keys are optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
    /// Verbose per-tick logging.
    #[serde(default)]
    pub debug: Flag,

    /// Poll instead of subscribing to kernel notifications.
    #[serde(default)]
    pub disable_fsnotify: Flag,
}

/// Watches a local directory subtree.
pub struct LocalWatcher {
    base: WatcherBase,
    config: LocalConfig,
}

impl LocalWatcher {
    /// Create an idle watcher for `dir`. Fails when the directory does not
    /// exist.
    pub fn new(dir: &str, interval: Duration) -> Result<Self> {
        if !Path::new(dir).exists() {
            return Err(WatchError::NotFound(format!("directory '{dir}'")));
        }
        Ok(Self {
            base: WatcherBase::new(dir, interval),
            config: LocalConfig::default(),
        })
    }

    pub(crate) fn factory(dir: &str, interval: Duration) -> Result<Box<dyn Watcher>> {
        Ok(Box::new(Self::new(dir, interval)?))
    }

    fn start_notify_mode(&mut self) -> Result<()> {
        let root = PathBuf::from(&self.base.watch_dir);
        let (sink, mut stop_rx) = self.base.prepare()?;

        // The notify callback runs on the backend's own thread; an
        // unbounded bridge keeps it from ever blocking there. The public
        // queues stay bounded.
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<notify::Event, notify::Error>| {
                let _ = raw_tx.send(result);
            },
            notify::Config::default(),
        )?;
        subscribe_tree(&mut watcher, &root)?;
        info!(dir = %root.display(), "local watcher started in notify mode");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = raw_rx.recv() => match received {
                        Some(Ok(event)) => dispatch_notify(&mut watcher, &event, &sink).await,
                        Some(Err(error)) => sink.error(error.into()).await,
                        None => break,
                    },
                    _ = stop_rx.recv() => {
                        unsubscribe_tree(&mut watcher, &root);
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Watcher for LocalWatcher {
    fn set_config(&mut self, options: &Options) -> Result<()> {
        self.config = config::bind(options)?;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if !Path::new(&self.base.watch_dir).exists() {
            return Err(WatchError::NotFound(format!(
                "directory '{}'",
                self.base.watch_dir
            )));
        }

        if self.config.disable_fsnotify.get() {
            let sync = LocalSync {
                watch_dir: PathBuf::from(&self.base.watch_dir),
                debug: self.config.debug.get(),
                differ: Differ::new(),
            };
            self.base.spawn_poll(sync)?;
            info!(dir = %self.base.watch_dir, "local watcher started in polling mode");
            Ok(())
        } else {
            self.start_notify_mode()
        }
    }

    fn close(&mut self) {
        self.base.close();
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.base.take_events()
    }

    fn take_errors(&mut self) -> Option<mpsc::Receiver<WatchError>> {
        self.base.take_errors()
    }
}

impl Snapshot for LocalRecord {
    fn identity(&self) -> &str {
        &self.key
    }

    fn event_key(&self) -> &str {
        &self.key
    }

    fn content_changed(&self, prior: &Self) -> bool {
        self.last_modified != prior.last_modified || self.size != prior.size
    }

    fn metadata_changed(&self, prior: &Self) -> bool {
        self.file_mode != prior.file_mode
    }
}

impl From<LocalRecord> for Record {
    fn from(record: LocalRecord) -> Self {
        Record::Local(record)
    }
}

struct LocalSync {
    watch_dir: PathBuf,
    debug: bool,
    differ: Differ<LocalRecord>,
}

#[async_trait]
impl Synchronizer for LocalSync {
    async fn sync(&mut self, first_sync: bool, sink: &Sink) {
        let observed = match enumerate(&self.watch_dir) {
            Ok(records) => records,
            Err(error) => {
                sink.error(error).await;
                return;
            }
        };
        if self.debug {
            debug!(dir = %self.watch_dir.display(), entries = observed.len(), "walked subtree");
        }

        if first_sync {
            self.differ.prime(observed);
            return;
        }
        for event in self.differ.diff(observed) {
            sink.event(event).await;
        }
    }
}

/// Walk the subtree and build one record per entry, skipping the root
/// itself.
fn enumerate(root: &Path) -> Result<Vec<LocalRecord>> {
    let mut records = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.path() == root {
            continue;
        }
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        records.push(record_for(entry.path(), &metadata)?);
    }
    Ok(records)
}

fn record_for(path: &Path, metadata: &std::fs::Metadata) -> Result<LocalRecord> {
    let last_modified: DateTime<Utc> = metadata.modified()?.into();
    Ok(LocalRecord {
        key: path.to_string_lossy().into_owned(),
        size: metadata.len(),
        last_modified,
        file_mode: file_mode(metadata),
    })
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Subscribe `root` and every subdirectory below it, one non-recursive
/// subscription each.
fn subscribe_tree(watcher: &mut RecommendedWatcher, root: &Path) -> Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_dir() {
            watcher.watch(entry.path(), RecursiveMode::NonRecursive)?;
        }
    }
    Ok(())
}

/// Best-effort removal of the subscriptions below `root`. Deleted
/// directories have already lost their kernel watch, so failures here are
/// expected.
fn unsubscribe_tree(watcher: &mut RecommendedWatcher, root: &Path) {
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() {
            let _ = watcher.unwatch(entry.path());
        }
    }
    let _ = watcher.unwatch(root);
}

fn classify(kind: &notify::EventKind) -> Option<EventKind> {
    use notify::event::ModifyKind;

    match kind {
        notify::EventKind::Create(_) => Some(EventKind::Created),
        notify::EventKind::Remove(_) => Some(EventKind::Deleted),
        notify::EventKind::Modify(ModifyKind::Metadata(_)) => Some(EventKind::MetadataChanged),
        // Renames arrive as paired Name events whose ordering is
        // platform-dependent; they are not translated.
        notify::EventKind::Modify(ModifyKind::Name(_)) => None,
        notify::EventKind::Modify(_) => Some(EventKind::Changed),
        _ => None,
    }
}

async fn dispatch_notify(watcher: &mut RecommendedWatcher, event: &notify::Event, sink: &Sink) {
    let Some(kind) = classify(&event.kind) else {
        return;
    };

    for path in &event.paths {
        match kind {
            EventKind::Deleted => {
                unsubscribe_tree(watcher, path);
                sink.event(Event::new(path.to_string_lossy(), kind, None)).await;
            }
            _ => {
                let metadata = match std::fs::metadata(path) {
                    Ok(metadata) => metadata,
                    Err(error) => {
                        sink.error(error.into()).await;
                        continue;
                    }
                };

                if kind == EventKind::Created && metadata.is_dir() {
                    if let Err(error) = subscribe_tree(watcher, path) {
                        sink.error(error).await;
                    }
                }

                match record_for(path, &metadata) {
                    Ok(record) => {
                        sink.event(Event::new(
                            record.key.clone(),
                            kind,
                            Some(Record::Local(record)),
                        ))
                        .await;
                    }
                    Err(error) => {
                        warn!(path = %path.display(), %error, "dropping event without stat data");
                        sink.error(error).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use tempfile::TempDir;

    fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_new_requires_existing_directory() {
        let result = LocalWatcher::new("/nonexistent/path/12345", Duration::from_secs(1));
        assert!(matches!(result, Err(WatchError::NotFound(_))));
    }

    #[test]
    fn test_enumerate_skips_root() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"one").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"two").unwrap();

        let records = enumerate(dir.path()).unwrap();
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();

        assert_eq!(records.len(), 3);
        assert!(!keys.contains(&dir.path().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_polling_sync_cycle() {
        let dir = TempDir::new().unwrap();
        let (sink, mut events_rx, _errors_rx) = Sink::for_tests();
        let mut sync = LocalSync {
            watch_dir: dir.path().to_path_buf(),
            debug: false,
            differ: Differ::new(),
        };

        fs::write(dir.path().join("seed.txt"), b"seed").unwrap();

        // First sync populates the cache silently.
        sync.sync(true, &sink).await;
        assert!(drain(&mut events_rx).is_empty());

        // A new file shows up as Created.
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        sync.sync(false, &sink).await;
        let events = drain(&mut events_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Created);
        assert!(events[0].key.ends_with("a.txt"));

        // Content growth is a Changed.
        fs::write(dir.path().join("a.txt"), b"hello, longer").unwrap();
        sync.sync(false, &sink).await;
        let events = drain(&mut events_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Changed);

        // Removal is a Deleted carrying the last-known record.
        fs::remove_file(dir.path().join("a.txt")).unwrap();
        sync.sync(false, &sink).await;
        let events = drain(&mut events_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Deleted);
        assert!(events[0].record.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_polling_detects_mode_change() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();

        let (sink, mut events_rx, _errors_rx) = Sink::for_tests();
        let mut sync = LocalSync {
            watch_dir: dir.path().to_path_buf(),
            debug: false,
            differ: Differ::new(),
        };
        sync.sync(true, &sink).await;

        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();
        sync.sync(false, &sink).await;

        let events = drain(&mut events_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MetadataChanged);
    }

    #[tokio::test]
    async fn test_enumeration_error_leaves_cache_untouched() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let (sink, mut events_rx, mut errors_rx) = Sink::for_tests();
        let mut sync = LocalSync {
            watch_dir: dir.path().to_path_buf(),
            debug: false,
            differ: Differ::new(),
        };
        sync.sync(true, &sink).await;

        // Point the walk at a missing directory: the tick aborts with an
        // error and no spurious deletes.
        sync.watch_dir = dir.path().join("gone");
        sync.sync(false, &sink).await;

        assert!(drain(&mut events_rx).is_empty());
        assert!(errors_rx.try_recv().is_ok());

        // Restore the path: the cached file is still known, not re-created.
        sync.watch_dir = dir.path().to_path_buf();
        sync.sync(false, &sink).await;
        assert!(drain(&mut events_rx).is_empty());
    }

    #[test]
    fn test_classify_ignores_access_and_rename() {
        use notify::event::{AccessKind, CreateKind, ModifyKind, RenameMode};

        assert_eq!(
            classify(&notify::EventKind::Create(CreateKind::File)),
            Some(EventKind::Created)
        );
        assert_eq!(
            classify(&notify::EventKind::Modify(ModifyKind::Name(RenameMode::Any))),
            None
        );
        assert_eq!(
            classify(&notify::EventKind::Access(AccessKind::Read)),
            None
        );
    }
}
