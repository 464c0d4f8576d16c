//! Repository watcher.
//!
//! A local working copy is kept under `temp_dir` and refreshed from the
//! remote on every tick. Two monitor modes: `"file"` diffs the branch tip's
//! tree like the other file backends, `"repo"` walks the commit log per
//! branch down to the last seen commit and reports new tags.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use git2::{AutotagOption, BranchType, Cred, FetchOptions, RemoteCallbacks, Repository};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{self, Flag, Options};
use crate::diff::{Differ, Snapshot};
use crate::error::{Result, WatchError};
use crate::event::{Event, EventKind, Record, RepoCommit, RepoFileRecord, RepoLogRecord};
use crate::poll::{Sink, Synchronizer, WatcherBase};
use crate::Watcher;

const MONITOR_TYPES: [&str; 2] = ["repo", "file"];
const AUTH_TYPES: [&str; 5] = ["", "none", "ssh", "http_token", "http_user_pass"];

/// Configuration for the repository watcher.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitConfig {
    /// Verbose per-tick logging.
    #[serde(default)]
    pub debug: Flag,

    /// `"repo"` (commits and tags, the default) or `"file"` (tree
    /// contents).
    #[serde(default)]
    pub monitor_type: String,

    /// One of `"none"`, `"ssh"`, `"http_token"`, `"http_user_pass"`, or
    /// empty for anonymous access.
    #[serde(default)]
    pub auth_type: String,

    /// Path of the SSH private key.
    #[serde(default)]
    pub ssh_pkey: String,

    /// Passphrase of the SSH private key.
    #[serde(default)]
    pub ssh_pkey_password: String,

    /// Token for `http_token` auth.
    #[serde(default)]
    pub http_token: String,

    /// Username for HTTP auth.
    #[serde(default)]
    pub http_username: String,

    /// Password for `http_user_pass` auth.
    #[serde(default)]
    pub http_password: String,

    /// Remote URL. Required.
    #[serde(default)]
    pub repo_url: String,

    /// Branch to watch; empty means every branch in repo mode. Required in
    /// file mode.
    #[serde(default)]
    pub repo_branch: String,

    /// Assemble all new commits (or tags) of a tick into one event.
    #[serde(default)]
    pub assemble_events: Flag,

    /// Where the working copy lives; auto-generated when empty.
    #[serde(default)]
    pub temp_dir: String,
}

/// Watches commits, tags or tree contents of a remote repository.
pub struct GitWatcher {
    base: WatcherBase,
    config: Option<GitConfig>,
}

impl GitWatcher {
    /// Create an idle watcher for the given tree prefix.
    pub fn new(dir: &str, interval: Duration) -> Self {
        Self {
            base: WatcherBase::new(dir, interval),
            config: None,
        }
    }

    pub(crate) fn factory(dir: &str, interval: Duration) -> Result<Box<dyn Watcher>> {
        Ok(Box::new(Self::new(dir, interval)))
    }
}

#[async_trait]
impl Watcher for GitWatcher {
    fn set_config(&mut self, options: &Options) -> Result<()> {
        let mut parsed: GitConfig = config::bind(options)?;

        if parsed.monitor_type.is_empty() {
            parsed.monitor_type = "repo".to_string();
        } else if !MONITOR_TYPES.contains(&parsed.monitor_type.as_str()) {
            return Err(WatchError::BadConfig(format!(
                "unknown monitor_type '{}'",
                parsed.monitor_type
            )));
        }

        if !AUTH_TYPES.contains(&parsed.auth_type.as_str()) {
            return Err(WatchError::BadConfig(format!(
                "unknown auth_type '{}'",
                parsed.auth_type
            )));
        }
        if parsed.auth_type == "ssh" && !Path::new(&parsed.ssh_pkey).exists() {
            return Err(WatchError::BadConfig(format!(
                "cannot read private key '{}'",
                parsed.ssh_pkey
            )));
        }

        if parsed.repo_url.is_empty() {
            return Err(WatchError::BadConfig("repo_url required".to_string()));
        }
        if parsed.monitor_type == "file" && parsed.repo_branch.is_empty() {
            return Err(WatchError::BadConfig(
                "repo_branch required when monitoring files".to_string(),
            ));
        }

        if parsed.temp_dir.is_empty() {
            parsed.temp_dir = tempfile::Builder::new()
                .prefix("driftwatch-git-")
                .tempdir()?
                .into_path()
                .to_string_lossy()
                .into_owned();
        }

        self.config = Some(parsed);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let config = self.config.clone().ok_or(WatchError::NotConfigured)?;

        let sync = GitSync {
            watch_dir: self.base.watch_dir.clone(),
            config,
            repo: None,
            differ: Differ::new(),
            branch_cache: HashMap::new(),
            tag_cache: HashMap::new(),
        };
        self.base.spawn_poll(sync)?;
        info!(prefix = %self.base.watch_dir, "repository watcher started");
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

impl Snapshot for RepoFileRecord {
    fn identity(&self) -> &str {
        &self.key
    }

    fn event_key(&self) -> &str {
        &self.key
    }

    fn content_changed(&self, prior: &Self) -> bool {
        self.hash != prior.hash
    }

    fn metadata_changed(&self, prior: &Self) -> bool {
        self.hash == prior.hash && self.file_mode != prior.file_mode
    }
}

impl From<RepoFileRecord> for Record {
    fn from(record: RepoFileRecord) -> Self {
        Record::RepoFile(record)
    }
}

struct GitSync {
    watch_dir: String,
    config: GitConfig,
    repo: Option<Repository>,
    differ: Differ<RepoFileRecord>,
    branch_cache: HashMap<String, String>,
    tag_cache: HashMap<String, String>,
}

#[async_trait]
impl Synchronizer for GitSync {
    async fn sync(&mut self, first_sync: bool, sink: &Sink) {
        // The repository handle must not be held across a suspension
        // point, so the whole tick runs synchronously and the collected
        // output is published afterwards.
        let output = self.run_tick(first_sync);
        for error in output.errors {
            sink.error(error).await;
        }
        for event in output.events {
            sink.event(event).await;
        }
    }
}

#[derive(Default)]
struct TickOutput {
    events: Vec<Event>,
    errors: Vec<WatchError>,
}

impl GitSync {
    fn run_tick(&mut self, first_sync: bool) -> TickOutput {
        let mut output = TickOutput::default();
        if let Err(error) = self.ensure_repo() {
            output.errors.push(error);
            return output;
        }
        let Some(repo) = self.repo.as_ref() else {
            return output;
        };

        if self.config.monitor_type == "file" {
            match enumerate_tree(repo, &self.config.repo_branch, &self.watch_dir) {
                Ok(records) => {
                    if self.config.debug.get() {
                        debug!(blobs = records.len(), "walked branch tree");
                    }
                    if first_sync {
                        self.differ.prime(records);
                    } else {
                        output.events.extend(self.differ.diff(records));
                    }
                }
                Err(error) => output.errors.push(error),
            }
            return output;
        }

        let branches = if self.config.repo_branch.is_empty() {
            match remote_branches(repo) {
                Ok(branches) => branches,
                Err(error) => {
                    output.errors.push(error);
                    return output;
                }
            }
        } else {
            vec![self.config.repo_branch.clone()]
        };

        let assemble = self.config.assemble_events.get();
        for branch in branches {
            // A failing branch must not silence the others.
            match new_commits_on(repo, &mut self.branch_cache, &branch) {
                Ok(commits) => {
                    if !commits.is_empty() && !first_sync {
                        append_log_events(&mut output.events, "commit", commits, assemble);
                    }
                }
                Err(error) => output.errors.push(error),
            }
        }

        match new_tags(repo, &mut self.tag_cache) {
            Ok(tags) => {
                if !tags.is_empty() && !first_sync {
                    append_log_events(&mut output.events, "tag", tags, assemble);
                }
            }
            Err(error) => output.errors.push(error),
        }
        output
    }

    /// Make sure a working copy exists and is up to date with the remote.
    /// Re-clones when the directory vanished underneath us.
    fn ensure_repo(&mut self) -> Result<()> {
        let path = Path::new(&self.config.temp_dir);
        if !path.exists() {
            self.repo = None;
        }

        if self.repo.is_none() {
            let repo = match Repository::open(path) {
                Ok(repo) => repo,
                Err(_) => {
                    info!(url = %self.config.repo_url, "cloning repository");
                    let mut builder = git2::build::RepoBuilder::new();
                    builder.fetch_options(fetch_options(&self.config));
                    builder.clone(&self.config.repo_url, path)?
                }
            };
            self.repo = Some(repo);
        }

        if let Some(repo) = self.repo.as_ref() {
            let mut remote = repo.find_remote("origin")?;
            remote.fetch(
                &[] as &[&str],
                Some(&mut fetch_options(&self.config)),
                None,
            )?;
        }
        Ok(())
    }
}

fn fetch_options(config: &GitConfig) -> FetchOptions<'static> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(config));
    options.download_tags(AutotagOption::All);
    options
}

fn remote_callbacks(config: &GitConfig) -> RemoteCallbacks<'static> {
    let auth_type = config.auth_type.clone();
    let ssh_pkey = config.ssh_pkey.clone();
    let ssh_password = config.ssh_pkey_password.clone();
    let http_token = config.http_token.clone();
    let http_username = config.http_username.clone();
    let http_password = config.http_password.clone();

    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, _allowed| {
        match auth_type.as_str() {
            "ssh" => Cred::ssh_key(
                username_from_url.unwrap_or("git"),
                None,
                Path::new(&ssh_pkey),
                (!ssh_password.is_empty()).then_some(ssh_password.as_str()),
            ),
            // Token auth ignores the username but it cannot be empty.
            "http_token" => Cred::userpass_plaintext(
                if http_username.is_empty() {
                    "token"
                } else {
                    &http_username
                },
                &http_token,
            ),
            "http_user_pass" => Cred::userpass_plaintext(&http_username, &http_password),
            _ => Cred::default(),
        }
    });
    callbacks
}

/// Tip commit of `branch`, preferring the remote-tracking ref the fetch
/// just updated.
fn branch_tip<'r>(repo: &'r Repository, branch: &str) -> Result<git2::Commit<'r>> {
    let reference = repo
        .find_reference(&format!("refs/remotes/origin/{branch}"))
        .or_else(|_| repo.find_reference(&format!("refs/heads/{branch}")))?;
    Ok(reference.peel_to_commit()?)
}

/// One record per blob of the branch tip's tree, filtered by prefix.
fn enumerate_tree(
    repo: &Repository,
    branch: &str,
    prefix: &str,
) -> Result<Vec<RepoFileRecord>> {
    let commit = branch_tip(repo, branch)?;
    let tree = commit.tree()?;

    let mut records = Vec::new();
    tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(git2::ObjectType::Blob) {
            let key = format!("{root}{}", entry.name().unwrap_or_default());
            if prefix.is_empty() || key.starts_with(prefix) {
                let size = repo
                    .find_blob(entry.id())
                    .map(|blob| blob.size() as u64)
                    .unwrap_or(0);
                records.push(RepoFileRecord {
                    key,
                    size,
                    file_mode: entry.filemode() as u32,
                    hash: entry.id().to_string(),
                });
            }
        }
        git2::TreeWalkResult::Ok
    })?;
    Ok(records)
}

/// Short names of all remote-tracking branches.
fn remote_branches(repo: &Repository) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in repo.branches(Some(BranchType::Remote))? {
        let (branch, _) = entry?;
        if let Some(name) = branch.name()? {
            if let Some(short) = name.strip_prefix("origin/") {
                if short != "HEAD" {
                    names.push(short.to_string());
                }
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Commits on `branch` newer than the cached last-seen hash, newest first.
///
/// The first observation of a branch caches only the tip: its prior history
/// is of unknown provenance, so nothing is reported for it.
fn new_commits_on(
    repo: &Repository,
    branch_cache: &mut HashMap<String, String>,
    branch: &str,
) -> Result<Vec<RepoCommit>> {
    let tip = branch_tip(repo, branch)?;
    let tip_hash = tip.id().to_string();

    let Some(last_seen) = branch_cache.get(branch).cloned() else {
        branch_cache.insert(branch.to_string(), tip_hash);
        return Ok(Vec::new());
    };
    if last_seen == tip_hash {
        return Ok(Vec::new());
    }

    let mut walk = repo.revwalk()?;
    walk.push(tip.id())?;

    let mut commits = Vec::new();
    for oid in walk {
        let oid = oid?;
        if oid.to_string() == last_seen {
            break;
        }
        let commit = repo.find_commit(oid)?;
        commits.push(RepoCommit {
            hash: commit.id().to_string(),
            message: commit.message().unwrap_or_default().to_string(),
            branch: branch.to_string(),
            author_name: commit.author().name().unwrap_or_default().to_string(),
            author_email: commit.author().email().unwrap_or_default().to_string(),
            time: Utc.timestamp_opt(commit.time().seconds(), 0).single(),
        });
    }

    if let Some(newest) = commits.first() {
        branch_cache.insert(branch.to_string(), newest.hash.clone());
    }
    Ok(commits)
}

/// Tags whose names were not seen before. The cache fills on first sight,
/// so every tag is reported at most once per watcher lifetime.
fn new_tags(
    repo: &Repository,
    tag_cache: &mut HashMap<String, String>,
) -> Result<Vec<RepoCommit>> {
    let mut tags = Vec::new();
    for name in repo.tag_names(None)?.iter().flatten() {
        if tag_cache.contains_key(name) {
            continue;
        }
        let target = repo.revparse_single(&format!("refs/tags/{name}"))?.id();
        tag_cache.insert(name.to_string(), target.to_string());
        tags.push(RepoCommit {
            hash: target.to_string(),
            message: name.to_string(),
            branch: String::new(),
            author_name: String::new(),
            author_email: String::new(),
            time: None,
        });
    }
    Ok(tags)
}

fn append_log_events(events: &mut Vec<Event>, key: &str, entries: Vec<RepoCommit>, assemble: bool) {
    if assemble {
        events.push(Event::new(
            key,
            EventKind::Created,
            Some(Record::RepoLog(RepoLogRecord { commits: entries })),
        ));
    } else {
        for entry in entries {
            events.push(Event::new(
                key,
                EventKind::Created,
                Some(Record::RepoLog(RepoLogRecord {
                    commits: vec![entry],
                })),
            ));
        }
    }
}
