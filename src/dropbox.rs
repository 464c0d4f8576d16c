//! Cloud-file-store watcher (Dropbox API).
//!
//! Files are enumerated through the paged `files/list_folder` endpoint. A
//! path that turns out not to be a folder is recovered in place through a
//! metadata lookup for the same path instead of failing the tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{self, Flag, OAuthToken, Options};
use crate::diff::Differ;
use crate::error::{Result, WatchError};
use crate::event::{DriveRecord, Event};
use crate::poll::{Sink, Synchronizer, WatcherBase};
use crate::Watcher;

const API_BASE: &str = "https://api.dropboxapi.com/2";

/// Configuration for the cloud-file-store watcher.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DropboxConfig {
    /// Verbose per-tick logging.
    #[serde(default)]
    pub debug: Flag,

    /// Serialised OAuth token JSON. Required.
    #[serde(default)]
    pub token: String,

    /// OAuth client id.
    #[serde(default)]
    pub client_id: String,

    /// OAuth client secret.
    #[serde(default)]
    pub client_secret: String,
}

/// One file entry as returned by the listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub path_lower: Option<String>,
    #[serde(default)]
    pub path_display: Option<String>,
    pub server_modified: DateTime<Utc>,
    pub size: i64,
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl FileEntry {
    /// Logical path of the entry; some responses omit `path_display`.
    fn key(&self) -> String {
        match &self.path_display {
            Some(path) if !path.is_empty() => path.clone(),
            _ => format!(
                "{}/{}",
                self.path_lower.as_deref().unwrap_or_default(),
                self.name
            ),
        }
    }
}

/// The slice of the file-store API the watcher needs.
#[async_trait]
pub(crate) trait FolderLister: Send + Sync {
    /// All file entries below `path`, across every page.
    async fn list_folder(&self, path: &str) -> Result<Vec<FileEntry>>;
}

/// Watches a folder on a cloud file store.
pub struct DropboxWatcher {
    base: WatcherBase,
    config: Option<DropboxConfig>,
    access_token: Option<String>,
}

impl DropboxWatcher {
    /// Create an idle watcher for the given folder.
    pub fn new(dir: &str, interval: Duration) -> Self {
        Self {
            base: WatcherBase::new(dir, interval),
            config: None,
            access_token: None,
        }
    }

    pub(crate) fn factory(dir: &str, interval: Duration) -> Result<Box<dyn Watcher>> {
        Ok(Box::new(Self::new(dir, interval)))
    }
}

#[async_trait]
impl Watcher for DropboxWatcher {
    fn set_config(&mut self, options: &Options) -> Result<()> {
        let parsed: DropboxConfig = config::bind(options)?;
        if parsed.token.is_empty() {
            return Err(WatchError::BadConfig("token required".to_string()));
        }
        let token = OAuthToken::parse(&parsed.token)?;
        self.access_token = Some(token.access_token);
        self.config = Some(parsed);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let config = self.config.clone().ok_or(WatchError::NotConfigured)?;
        let access_token = self.access_token.clone().ok_or(WatchError::NotConfigured)?;

        let sync = DropboxSync {
            watch_dir: normalize_root(&self.base.watch_dir),
            debug: config.debug.get(),
            client: Arc::new(HttpFolderLister::new(access_token)),
            differ: Differ::new(),
        };
        self.base.spawn_poll(sync)?;
        info!(dir = %self.base.watch_dir, "file-store watcher started");
        Ok(())
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

/// The API addresses the root folder as the empty string.
fn normalize_root(dir: &str) -> String {
    if dir == "/" {
        String::new()
    } else {
        dir.trim_end_matches('/').to_string()
    }
}

pub(crate) struct DropboxSync {
    pub(crate) watch_dir: String,
    pub(crate) debug: bool,
    pub(crate) client: Arc<dyn FolderLister>,
    pub(crate) differ: Differ<DriveRecord>,
}

#[async_trait]
impl Synchronizer for DropboxSync {
    async fn sync(&mut self, _first_sync: bool, sink: &Sink) {
        let entries = match self.client.list_folder(&self.watch_dir).await {
            Ok(entries) => entries,
            Err(error) => {
                sink.error(error).await;
                return;
            }
        };
        if self.debug {
            debug!(dir = %self.watch_dir, entries = entries.len(), "listed folder");
        }

        let observed = entries
            .into_iter()
            .map(|entry| {
                let key = entry.key();
                DriveRecord {
                    id: key.clone(),
                    key,
                    size: entry.size,
                    last_modified: entry.server_modified,
                    hash: entry.content_hash.unwrap_or_default(),
                }
            })
            .collect();

        for event in self.differ.diff(observed) {
            sink.event(event).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderPage {
    entries: Vec<RawEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = ".tag")]
enum RawEntry {
    #[serde(rename = "file")]
    File(FileEntry),
    #[serde(other)]
    Other,
}

/// [`FolderLister`] over the HTTP API.
struct HttpFolderLister {
    http: reqwest::Client,
    access_token: String,
}

impl HttpFolderLister {
    fn new(access_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            access_token,
        }
    }

    async fn call(&self, endpoint: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(format!("{API_BASE}/{endpoint}"))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        Ok(response)
    }

    /// Fetch metadata for a single path; used to recover from listing a
    /// path that is a file.
    async fn file_metadata(&self, path: &str) -> Result<Vec<RawEntry>> {
        let response = self
            .call(
                "files/get_metadata",
                json!({ "path": path, "include_deleted": true }),
            )
            .await?;
        if !response.status().is_success() {
            return Err(WatchError::Backend(response.text().await?));
        }
        let entry: RawEntry = response.json().await?;
        Ok(vec![entry])
    }
}

#[async_trait]
impl FolderLister for HttpFolderLister {
    async fn list_folder(&self, path: &str) -> Result<Vec<FileEntry>> {
        let response = self
            .call(
                "files/list_folder",
                json!({ "path": path, "recursive": true }),
            )
            .await?;

        let mut raw_entries;
        if response.status().is_success() {
            let mut page: ListFolderPage = response.json().await?;
            raw_entries = page.entries;
            while page.has_more {
                let next = self
                    .call("files/list_folder/continue", json!({ "cursor": page.cursor }))
                    .await?;
                if !next.status().is_success() {
                    return Err(WatchError::Backend(next.text().await?));
                }
                page = next.json().await?;
                raw_entries.append(&mut page.entries);
            }
        } else {
            let body = response.text().await?;
            if body.contains("not_folder") {
                // The watched path is a single file; list it through a
                // metadata lookup instead.
                raw_entries = self.file_metadata(path).await?;
            } else {
                return Err(WatchError::Backend(body));
            }
        }

        Ok(raw_entries
            .into_iter()
            .filter_map(|entry| match entry {
                RawEntry::File(file) => Some(file),
                RawEntry::Other => None,
            })
            .collect())
    }
}
