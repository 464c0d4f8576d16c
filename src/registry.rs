//! Backend registry.
//!
//! Maps service names to watcher factories. The built-ins are inserted by
//! the constructor, so there is no reliance on static initialisation order;
//! custom backends can be registered at runtime.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::dropbox::DropboxWatcher;
use crate::error::{Result, WatchError};
use crate::gdrive::GDriveWatcher;
use crate::git::GitWatcher;
use crate::local::LocalWatcher;
use crate::s3::S3Watcher;
use crate::Watcher;

/// Produces an idle watcher bound to a directory and polling interval.
/// Factories never touch the network.
pub type Factory = fn(&str, Duration) -> Result<Box<dyn Watcher>>;

/// Registry of watcher backends.
pub struct Registry {
    factories: HashMap<String, Factory>,
}

impl Registry {
    /// A registry with all built-in backends registered.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("local", LocalWatcher::factory);
        registry.register("s3", S3Watcher::factory);
        registry.register("dropbox", DropboxWatcher::factory);
        registry.register("gdrive", GDriveWatcher::factory);
        registry.register("git", GitWatcher::factory);
        registry
    }

    /// Register (or replace) a backend under `name`.
    pub fn register(&mut self, name: &str, factory: Factory) {
        debug!(service = name, "registered watcher backend");
        self.factories.insert(name.to_string(), factory);
    }

    /// Names of all registered backends, sorted.
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Create an idle watcher for `service`, bound to `dir` and polled
    /// every `interval`.
    pub fn create(
        &self,
        service: &str,
        dir: &str,
        interval: Duration,
    ) -> Result<Box<dyn Watcher>> {
        match self.factories.get(service) {
            Some(factory) => factory(dir, interval),
            None => Err(WatchError::UnknownService(service.to_string())),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
