//! Client-side cache of attributes and directory listings.
//!
//! Entries are filled lazily from responses and evicted by pushed change
//! events. A fill only lands if nothing was invalidated while its request
//! was in flight: every eviction bumps a generation counter, and callers
//! pass the generation they read before sending the request.

use filebox_proto::{path, ChangeEvent, DirEntry, NodeAttr, Version};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Slot<T> {
    value: T,
    fetched_at: Instant,
}

#[derive(Debug)]
pub struct AttrCache {
    ttl: Duration,
    generation: u64,
    /// Highest event version applied; older answers are refused.
    floor: Version,
    /// `None` records a path known not to exist.
    attrs: HashMap<String, Slot<Option<NodeAttr>>>,
    listings: HashMap<String, Slot<Vec<DirEntry>>>,
}

impl AttrCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            generation: 0,
            floor: 0,
            attrs: HashMap::new(),
            listings: HashMap::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cached attributes of `path`.
    ///
    /// `Some(None)` means the path is cached as absent; `None` is a miss.
    pub fn attr(&self, path: &str) -> Option<Option<NodeAttr>> {
        self.attrs
            .get(path)
            .filter(|slot| slot.fetched_at.elapsed() < self.ttl)
            .map(|slot| slot.value.clone())
    }

    pub fn listing(&self, path: &str) -> Option<Vec<DirEntry>> {
        self.listings
            .get(path)
            .filter(|slot| slot.fetched_at.elapsed() < self.ttl)
            .map(|slot| slot.value.clone())
    }

    fn accepts(&self, as_of: Version, generation: u64) -> bool {
        generation == self.generation && as_of >= self.floor
    }

    /// Cache an answer read at `as_of`. Returns whether it was kept.
    pub fn insert_attr(
        &mut self,
        path: &str,
        attr: Option<NodeAttr>,
        as_of: Version,
        generation: u64,
    ) -> bool {
        if !self.accepts(as_of, generation) {
            return false;
        }
        self.attrs.insert(
            path.to_string(),
            Slot {
                value: attr,
                fetched_at: Instant::now(),
            },
        );
        true
    }

    /// Cache a listing, and the attributes of every entry in it.
    pub fn insert_listing(
        &mut self,
        path: &str,
        entries: &[DirEntry],
        as_of: Version,
        generation: u64,
    ) -> bool {
        if !self.accepts(as_of, generation) {
            return false;
        }
        let now = Instant::now();
        for entry in entries {
            self.attrs.insert(
                entry.attr.path.clone(),
                Slot {
                    value: Some(entry.attr.clone()),
                    fetched_at: now,
                },
            );
        }
        self.listings.insert(
            path.to_string(),
            Slot {
                value: entries.to_vec(),
                fetched_at: now,
            },
        );
        true
    }

    /// Evict the attributes and listing of `path`.
    pub fn invalidate(&mut self, path: &str) {
        self.generation += 1;
        self.attrs.remove(path);
        self.listings.remove(path);
    }

    /// Evict `path` and everything cached beneath it.
    pub fn invalidate_subtree(&mut self, root: &str) {
        self.generation += 1;
        self.attrs.retain(|p, _| !path::is_within(p, root));
        self.listings.retain(|p, _| !path::is_within(p, root));
    }

    /// Evict what a mutation leaves stale: its paths and their parents.
    pub fn invalidate_mutation(&mut self, paths: &[&str], subtree: bool) {
        for p in paths {
            if subtree {
                self.invalidate_subtree(p);
            } else {
                self.invalidate(p);
            }
            if let Some(parent) = path::parent(p) {
                self.invalidate(parent);
            }
        }
    }

    pub fn apply_event(&mut self, event: &ChangeEvent) {
        self.floor = self.floor.max(event.version);
        self.invalidate_mutation(&event.affected_paths(), event.affects_subtree());
        for stale in event.stale_paths() {
            self.invalidate(stale);
        }
    }

    /// Drop everything, e.g. after a reset or a reconnect.
    pub fn clear(&mut self, floor: Version) {
        self.generation += 1;
        self.floor = floor;
        self.attrs.clear();
        self.listings.clear();
    }

    pub fn len(&self) -> usize {
        self.attrs.len() + self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
