//! Cloud-drive watcher (Google Drive API).
//!
//! The listing is flat: every file carries its parent ids, and a file may
//! sit under several parents at once. Full paths are reconstructed by
//! joining parent names through the id graph; the cache is keyed by the
//! provider id, so a file reachable through two paths stays one entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{self, Flag, OAuthToken, Options};
use crate::diff::{Differ, Snapshot};
use crate::error::{Result, WatchError};
use crate::event::{DriveRecord, Event, Record};
use crate::poll::{Sink, Synchronizer, WatcherBase};
use crate::Watcher;

const FILES_ENDPOINT: &str = "https://www.googleapis.com/drive/v3/files";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Parent chains deeper than this are treated as cycles and cut off.
const MAX_PARENT_DEPTH: usize = 64;

/// Configuration for the cloud-drive watcher.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GDriveConfig {
    /// Verbose per-tick logging.
    #[serde(default)]
    pub debug: Flag,

    /// Serialised OAuth token JSON.
    #[serde(default)]
    pub token: String,

    /// OAuth client id.
    #[serde(default)]
    pub client_id: String,

    /// OAuth client secret.
    #[serde(default)]
    pub client_secret: String,

    /// API key, accepted instead of a token.
    #[serde(default)]
    pub api_key: String,
}

/// One file as returned by the listing endpoint. `modified_time` stays raw
/// here; parsing happens per record so one bad timestamp cannot fail the
/// tick.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub modified_time: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub trashed: bool,
}

/// The slice of the drive API the watcher needs.
#[async_trait]
pub(crate) trait DriveApi: Send + Sync {
    /// Every file the account can see, merged across all pages. Folders
    /// are included so the parent graph can be resolved.
    async fn list_files(&self) -> Result<Vec<DriveFile>>;
}

/// Watches a folder subtree on a cloud drive.
pub struct GDriveWatcher {
    base: WatcherBase,
    config: Option<GDriveConfig>,
    auth: Option<DriveAuth>,
}

#[derive(Debug, Clone)]
enum DriveAuth {
    Bearer(String),
    ApiKey(String),
}

impl GDriveWatcher {
    /// Create an idle watcher for the given path prefix.
    pub fn new(dir: &str, interval: Duration) -> Self {
        Self {
            base: WatcherBase::new(dir, interval),
            config: None,
            auth: None,
        }
    }

    pub(crate) fn factory(dir: &str, interval: Duration) -> Result<Box<dyn Watcher>> {
        Ok(Box::new(Self::new(dir, interval)))
    }
}

#[async_trait]
impl Watcher for GDriveWatcher {
    fn set_config(&mut self, options: &Options) -> Result<()> {
        let parsed: GDriveConfig = config::bind(options)?;
        if parsed.token.is_empty() && parsed.api_key.is_empty() {
            return Err(WatchError::BadConfig(
                "either token or api_key required".to_string(),
            ));
        }

        self.auth = Some(if parsed.token.is_empty() {
            DriveAuth::ApiKey(parsed.api_key.clone())
        } else {
            DriveAuth::Bearer(OAuthToken::parse(&parsed.token)?.access_token)
        });
        self.config = Some(parsed);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let config = self.config.clone().ok_or(WatchError::NotConfigured)?;
        let auth = self.auth.clone().ok_or(WatchError::NotConfigured)?;

        let sync = GDriveSync {
            watch_dir: self.base.watch_dir.clone(),
            debug: config.debug.get(),
            client: Arc::new(HttpDriveApi::new(auth)),
            differ: Differ::new(),
        };
        self.base.spawn_poll(sync)?;
        info!(prefix = %self.base.watch_dir, "cloud-drive watcher started");
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

impl Snapshot for DriveRecord {
    fn identity(&self) -> &str {
        &self.id
    }

    fn event_key(&self) -> &str {
        &self.key
    }

    fn content_changed(&self, prior: &Self) -> bool {
        self.last_modified != prior.last_modified
            || self.hash != prior.hash
            || self.size != prior.size
    }
}

impl From<DriveRecord> for Record {
    fn from(record: DriveRecord) -> Self {
        Record::Drive(record)
    }
}

pub(crate) struct GDriveSync {
    pub(crate) watch_dir: String,
    pub(crate) debug: bool,
    pub(crate) client: Arc<dyn DriveApi>,
    pub(crate) differ: Differ<DriveRecord>,
}

#[async_trait]
impl Synchronizer for GDriveSync {
    async fn sync(&mut self, _first_sync: bool, sink: &Sink) {
        let files = match self.client.list_files().await {
            Ok(files) => files,
            Err(error) => {
                sink.error(error).await;
                return;
            }
        };
        if self.debug {
            debug!(files = files.len(), "listed drive");
        }

        let by_id: HashMap<&str, &DriveFile> =
            files.iter().map(|file| (file.id.as_str(), file)).collect();

        let mut observed = Vec::new();
        for file in &files {
            if file.mime_type == FOLDER_MIME_TYPE || file.trashed {
                continue;
            }

            let last_modified = match file.modified_time.parse::<DateTime<Utc>>() {
                Ok(time) => time,
                Err(error) => {
                    sink.error(WatchError::Parse(format!(
                        "modifiedTime '{}' of '{}': {error}",
                        file.modified_time, file.name
                    )))
                    .await;
                    continue;
                }
            };

            for path in full_paths(file, &by_id) {
                if !path.starts_with(&self.watch_dir) {
                    continue;
                }
                observed.push(DriveRecord {
                    id: file.id.clone(),
                    key: path,
                    size: file
                        .size
                        .as_deref()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                    last_modified,
                    hash: file.md5_checksum.clone().unwrap_or_default(),
                });
            }
        }

        for event in self.differ.diff(observed) {
            sink.event(event).await;
        }
    }
}

/// All full paths of `file`, reconstructed by joining parent names.
///
/// Parents missing from the listing terminate their chain, so a file just
/// below the (unlisted) root resolves to its bare name.
fn full_paths(file: &DriveFile, by_id: &HashMap<&str, &DriveFile>) -> Vec<String> {
    resolve_chains(file, by_id, 0)
        .into_iter()
        .map(|chain| chain.join("/"))
        .collect()
}

fn resolve_chains<'a>(
    file: &'a DriveFile,
    by_id: &HashMap<&str, &'a DriveFile>,
    depth: usize,
) -> Vec<Vec<&'a str>> {
    if depth >= MAX_PARENT_DEPTH {
        return vec![vec![file.name.as_str()]];
    }

    let mut chains = Vec::new();
    for parent_id in &file.parents {
        let Some(parent) = by_id.get(parent_id.as_str()) else {
            continue;
        };
        for mut chain in resolve_chains(parent, by_id, depth + 1) {
            chain.push(file.name.as_str());
            chains.push(chain);
        }
    }

    if chains.is_empty() {
        chains.push(vec![file.name.as_str()]);
    }
    chains
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListPage {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// [`DriveApi`] over the HTTP API.
struct HttpDriveApi {
    http: reqwest::Client,
    auth: DriveAuth,
}

impl HttpDriveApi {
    fn new(auth: DriveAuth) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth,
        }
    }
}

#[async_trait]
impl DriveApi for HttpDriveApi {
    async fn list_files(&self) -> Result<Vec<DriveFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.http.get(FILES_ENDPOINT).query(&[
                (
                    "fields",
                    "nextPageToken, files(id, name, mimeType, modifiedTime, parents, size, \
                     md5Checksum, trashed)",
                ),
                ("pageSize", "1000"),
            ]);
            request = match &self.auth {
                DriveAuth::Bearer(token) => request.bearer_auth(token),
                DriveAuth::ApiKey(key) => request.query(&[("key", key.as_str())]),
            };
            if let Some(token) = page_token.take() {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(WatchError::Backend(response.text().await?));
            }

            let mut page: FileListPage = response.json().await?;
            files.append(&mut page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }
}
