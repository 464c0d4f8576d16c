//! Snapshot differ shared by the polling backends.
//!
//! Every tick a backend enumerates its source into a fresh listing; the
//! differ compares it against the cached previous listing and synthesises
//! the minimal set of events. After a successful tick the cache equals
//! exactly the set of records observed in that tick.

use std::collections::{HashMap, HashSet};

use crate::event::{Event, EventKind, Record};

/// A record the differ can compare across ticks.
pub(crate) trait Snapshot: Clone + Into<Record> {
    /// Cache identity. Backends that can reach one file through several
    /// paths key by provider id instead of path.
    fn identity(&self) -> &str;

    /// Key carried on emitted events.
    fn event_key(&self) -> &str;

    /// Whether content, size or modification time differs from `prior`.
    fn content_changed(&self, prior: &Self) -> bool;

    /// Whether backend metadata (tags, file mode) differs from `prior`.
    fn metadata_changed(&self, _prior: &Self) -> bool {
        false
    }
}

/// Compares fresh listings against the previous one.
#[derive(Debug)]
pub(crate) struct Differ<R> {
    cache: HashMap<String, R>,
}

impl<R: Snapshot> Differ<R> {
    pub(crate) fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    /// Replace the cache with `observed` without emitting anything.
    ///
    /// Used by backends whose first synchronisation must stay silent.
    pub(crate) fn prime(&mut self, observed: Vec<R>) {
        self.cache.clear();
        for record in observed {
            self.cache.insert(record.identity().to_string(), record);
        }
    }

    /// Diff `observed` against the cache and return the synthesised events.
    ///
    /// Creates, changes and metadata changes come first (in listing order),
    /// then one delete per cached identity missing from the listing. The
    /// cache afterwards holds exactly the observed records.
    pub(crate) fn diff(&mut self, observed: Vec<R>) -> Vec<Event> {
        let mut events = Vec::new();
        let mut seen: HashSet<String> = HashSet::with_capacity(observed.len());

        for record in observed {
            let id = record.identity().to_string();
            match self.cache.get(&id) {
                Some(prior) => {
                    if record.content_changed(prior) {
                        events.push(Event::new(
                            record.event_key(),
                            EventKind::Changed,
                            Some(record.clone().into()),
                        ));
                    }
                    if record.metadata_changed(prior) {
                        events.push(Event::new(
                            record.event_key(),
                            EventKind::MetadataChanged,
                            Some(record.clone().into()),
                        ));
                    }
                }
                None => {
                    events.push(Event::new(
                        record.event_key(),
                        EventKind::Created,
                        Some(record.clone().into()),
                    ));
                }
            }
            seen.insert(id.clone());
            self.cache.insert(id, record);
        }

        let gone: Vec<String> = self
            .cache
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(last_known) = self.cache.remove(&id) {
                let key = last_known.event_key().to_string();
                events.push(Event::new(key, EventKind::Deleted, Some(last_known.into())));
            }
        }

        events
    }

    /// Number of cached records.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::event::LocalRecord;

    fn record(key: &str, size: u64, secs: i64, mode: u32) -> LocalRecord {
        LocalRecord {
            key: key.to_string(),
            size,
            last_modified: Utc.timestamp_opt(secs, 0).unwrap(),
            file_mode: mode,
        }
    }

    #[test]
    fn test_first_diff_emits_creates() {
        let mut differ = Differ::new();
        let events = differ.diff(vec![record("/a", 1, 10, 0o644), record("/b", 2, 10, 0o644)]);

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Created));
        assert_eq!(differ.len(), 2);
    }

    #[test]
    fn test_prime_is_silent() {
        let mut differ = Differ::new();
        differ.prime(vec![record("/a", 1, 10, 0o644)]);
        assert_eq!(differ.len(), 1);

        // An unchanged listing after priming emits nothing.
        let events = differ.diff(vec![record("/a", 1, 10, 0o644)]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_content_change_emits_once_per_identity() {
        let mut differ = Differ::new();
        differ.prime(vec![record("/a", 1, 10, 0o644)]);

        // Both size and mtime moved; still a single Changed event.
        let events = differ.diff(vec![record("/a", 5, 20, 0o644)]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Changed);
        assert_eq!(events[0].key, "/a");
    }

    #[test]
    fn test_metadata_change_is_separate() {
        let mut differ = Differ::new();
        differ.prime(vec![record("/a", 1, 10, 0o644)]);

        let events = differ.diff(vec![record("/a", 1, 10, 0o600)]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MetadataChanged);

        // Content and metadata changing together produce one of each.
        let events = differ.diff(vec![record("/a", 9, 30, 0o644)]);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Changed, EventKind::MetadataChanged]);
    }

    #[test]
    fn test_missing_records_are_deleted() {
        let mut differ = Differ::new();
        differ.prime(vec![record("/a", 1, 10, 0o644), record("/b", 2, 10, 0o644)]);

        let events = differ.diff(vec![record("/b", 2, 10, 0o644)]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Deleted);
        assert_eq!(events[0].key, "/a");
        assert!(events[0].record.is_some());
        assert_eq!(differ.len(), 1);
    }

    #[test]
    fn test_empty_listing_deletes_everything() {
        let mut differ = Differ::new();
        differ.prime(vec![record("/a", 1, 10, 0o644), record("/b", 2, 10, 0o644)]);

        let events = differ.diff(Vec::new());
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Deleted));
        assert_eq!(differ.len(), 0);
    }

    #[test]
    fn test_cache_matches_observed_after_tick() {
        let mut differ = Differ::new();
        differ.diff(vec![record("/a", 1, 10, 0o644)]);
        differ.diff(vec![record("/b", 1, 10, 0o644), record("/c", 1, 10, 0o644)]);
        assert_eq!(differ.len(), 2);
    }

    #[test]
    fn test_duplicate_identities_compare_against_latest() {
        // Backends that reach one file through several paths may list the
        // same identity more than once per tick; only the first occurrence
        // can emit, later ones compare equal against the fresh cache entry.
        let mut differ = Differ::new();
        differ.prime(vec![record("/a", 1, 10, 0o644)]);

        let events = differ.diff(vec![record("/a", 5, 20, 0o644), record("/a", 5, 20, 0o644)]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Changed);
    }
}
