//! Object-store watcher (S3 and compatible endpoints).
//!
//! Objects are enumerated through paged listings under the watched prefix,
//! with a per-object tag fetch. The client sits behind [`ObjectStoreApi`] so
//! the whole watcher can be driven against a scripted store in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{self, Flag, Options};
use crate::diff::{Differ, Snapshot};
use crate::error::{Result, WatchError};
use crate::event::{Event, ObjectRecord, Record};
use crate::poll::{Sink, Synchronizer, WatcherBase};
use crate::Watcher;

/// Configuration for the object-store watcher.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Config {
    /// Bucket to watch. Required.
    #[serde(default)]
    pub bucket_name: String,

    /// Endpoint in `host:port` form. Required.
    #[serde(default)]
    pub endpoint: String,

    /// Static access key.
    #[serde(default)]
    pub access_key: String,

    /// Static secret key.
    #[serde(default)]
    pub secret_key: String,

    /// Optional session token.
    #[serde(default)]
    pub token: String,

    /// Region name.
    #[serde(default)]
    pub region: String,

    /// Use https towards the endpoint.
    #[serde(default)]
    pub ssl_enabled: Flag,
}

/// A listed object before tags are attached.
#[derive(Debug, Clone)]
pub(crate) struct ListedObject {
    pub key: String,
    pub etag: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

/// The slice of the object-store API the watcher needs.
#[async_trait]
pub(crate) trait ObjectStoreApi: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ListedObject>>;
    async fn object_tags(&self, bucket: &str, key: &str) -> Result<HashMap<String, String>>;
}

/// Watches one bucket prefix on an object store.
pub struct S3Watcher {
    base: WatcherBase,
    config: Option<S3Config>,
    client: Option<Arc<dyn ObjectStoreApi>>,
}

impl S3Watcher {
    /// Create an idle watcher for the given prefix.
    pub fn new(dir: &str, interval: Duration) -> Self {
        Self {
            base: WatcherBase::new(dir, interval),
            config: None,
            client: None,
        }
    }

    pub(crate) fn factory(dir: &str, interval: Duration) -> Result<Box<dyn Watcher>> {
        Ok(Box::new(Self::new(dir, interval)))
    }
}

#[async_trait]
impl Watcher for S3Watcher {
    fn set_config(&mut self, options: &Options) -> Result<()> {
        let parsed: S3Config = config::bind(options)?;
        if parsed.bucket_name.is_empty() {
            return Err(WatchError::BadConfig("bucket_name required".to_string()));
        }
        if parsed.endpoint.is_empty() {
            return Err(WatchError::BadConfig("endpoint required".to_string()));
        }

        // Each configuration replaces the whole client.
        self.client = Some(Arc::new(SdkObjectStore::connect(&parsed)));
        self.config = Some(parsed);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let config = self.config.clone().ok_or(WatchError::NotConfigured)?;
        let client = self.client.clone().ok_or(WatchError::NotConfigured)?;

        if !client.bucket_exists(&config.bucket_name).await? {
            return Err(WatchError::NotFound(format!(
                "bucket '{}'",
                config.bucket_name
            )));
        }

        let sync = S3Sync {
            watch_dir: self.base.watch_dir.clone(),
            bucket: config.bucket_name.clone(),
            client,
            differ: Differ::new(),
        };
        self.base.spawn_poll(sync)?;
        info!(bucket = %config.bucket_name, prefix = %self.base.watch_dir, "object-store watcher started");
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

impl Snapshot for ObjectRecord {
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
        self.tags != prior.tags
    }
}

impl From<ObjectRecord> for Record {
    fn from(record: ObjectRecord) -> Self {
        Record::Object(record)
    }
}

struct S3Sync {
    watch_dir: String,
    bucket: String,
    client: Arc<dyn ObjectStoreApi>,
    differ: Differ<ObjectRecord>,
}

#[async_trait]
impl Synchronizer for S3Sync {
    async fn sync(&mut self, _first_sync: bool, sink: &Sink) {
        // Readiness gate: a vanished bucket must not turn into a flood of
        // Deleted events.
        match self.client.bucket_exists(&self.bucket).await {
            Ok(true) => {}
            Ok(false) => {
                sink.error(WatchError::NotFound(format!("bucket '{}'", self.bucket)))
                    .await;
                return;
            }
            Err(error) => {
                sink.error(error).await;
                return;
            }
        }

        let listed = match self.client.list_objects(&self.bucket, &self.watch_dir).await {
            Ok(listed) => listed,
            Err(error) => {
                sink.error(error).await;
                return;
            }
        };
        debug!(bucket = %self.bucket, objects = listed.len(), "listed bucket");

        let mut observed = Vec::with_capacity(listed.len());
        for object in listed {
            // A failed tag fetch drops the object from this tick; transient
            // metadata errors must not look like object churn.
            match self.client.object_tags(&self.bucket, &object.key).await {
                Ok(tags) => observed.push(ObjectRecord {
                    etag: normalize_etag(&object.etag),
                    key: object.key,
                    size: object.size,
                    last_modified: object.last_modified,
                    tags,
                }),
                Err(error) => {
                    warn!(key = %object.key, %error, "skipping object without tags");
                }
            }
        }

        for event in self.differ.diff(observed) {
            sink.event(event).await;
        }
    }
}

/// ETags arrive quoted and in mixed case depending on the store.
fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_lowercase()
}

/// [`ObjectStoreApi`] backed by the AWS SDK client.
struct SdkObjectStore {
    client: aws_sdk_s3::Client,
}

impl SdkObjectStore {
    fn connect(config: &S3Config) -> Self {
        let scheme = if config.ssl_enabled.get() {
            "https"
        } else {
            "http"
        };
        let session = (!config.token.is_empty()).then(|| config.token.clone());
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            session,
            None,
            "static",
        );
        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(format!("{scheme}://{}", config.endpoint))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(sdk_config),
        }
    }
}

#[async_trait]
impl ObjectStoreApi for SdkObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(error) => {
                let service_error = error.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(WatchError::Backend(service_error.to_string()))
                }
            }
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ListedObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| WatchError::Backend(e.to_string()))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ListedObject {
                    key: key.to_string(),
                    etag: object.e_tag().unwrap_or_default().to_string(),
                    size: object.size().unwrap_or(0),
                    last_modified: object
                        .last_modified()
                        .and_then(|t| Utc.timestamp_opt(t.secs(), t.subsec_nanos()).single())
                        .unwrap_or_default(),
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn object_tags(&self, bucket: &str, key: &str) -> Result<HashMap<String, String>> {
        let output = self
            .client
            .get_object_tagging()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| WatchError::Backend(e.to_string()))?;

        Ok(output
            .tag_set()
            .iter()
            .map(|tag| (tag.key().to_string(), tag.value().to_string()))
            .collect())
    }
}
