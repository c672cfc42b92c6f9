//! Shared server state: the namespace tree, the content store and the
//! published event stream.

use crate::store::{ContentStore, StoreError};
use crate::tree::{NamespaceTree, NodeId, NodeMeta};
use filebox_proto::{
    path, ChangeEvent, DirEntry, FsError, NodeAttr, NodeKind, Result, Resync, SessionId, Version,
};
use log::{debug, info};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Who caused a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Session(SessionId),
    Reconciler,
}

/// A committed event as seen by session forwarders.
#[derive(Debug, Clone)]
pub struct Published {
    pub event: Arc<ChangeEvent>,
    pub origin: Origin,
}

/// Bounded, version-ordered record of recent events.
#[derive(Debug)]
pub struct EventHistory {
    events: VecDeque<Arc<ChangeEvent>>,
    limit: usize,
}

impl EventHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(limit.min(1024)),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, event: Arc<ChangeEvent>) {
        if self.events.len() == self.limit {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events in `after + 1 ..= current`, or `None` when some of them were
    /// already dropped.
    pub fn since(&self, after: Version, current: Version) -> Option<Vec<ChangeEvent>> {
        if after >= current {
            return Some(Vec::new());
        }
        let oldest = self.events.front()?.version;
        if oldest > after + 1 {
            return None;
        }
        Some(
            self.events
                .iter()
                .filter(|e| e.version > after)
                .map(|e| (**e).clone())
                .collect(),
        )
    }
}

/// The authoritative namespace of one storage root.
pub struct Namespace {
    tree: RwLock<NamespaceTree>,
    store: ContentStore,
    history: Mutex<EventHistory>,
    events: broadcast::Sender<Published>,
}

impl Namespace {
    /// Build the tree from what is on disk. The loaded tree is version 0.
    pub fn load(
        store: ContentStore,
        history_limit: usize,
        event_buffer: usize,
    ) -> std::result::Result<Self, StoreError> {
        let root_meta = store
            .stat(path::ROOT)?
            .ok_or_else(|| StoreError::NotADirectory(store.base_dir().display().to_string()))?;
        let mut tree = NamespaceTree::new(root_meta.mode, root_meta.modified_at());

        let mut pending = vec![path::ROOT.to_string()];
        while let Some(dir) = pending.pop() {
            for (name, meta) in store.list(&dir)? {
                let kind = meta.kind;
                if let Err(err) = tree.seed(&dir, &name, kind, NodeMeta::from(meta)) {
                    debug!("Skipping {}/{}: {}", dir, name, err);
                    continue;
                }
                if kind == NodeKind::Directory {
                    pending.push(path::join(&dir, &name));
                }
            }
        }
        info!(
            "Loaded {} nodes from {}",
            tree.len(),
            store.base_dir().display()
        );

        let (events, _) = broadcast::channel(event_buffer.max(1));
        Ok(Self {
            tree: RwLock::new(tree),
            store,
            history: Mutex::new(EventHistory::new(history_limit)),
            events,
        })
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Shared read access to the tree.
    pub fn tree(&self) -> RwLockReadGuard<'_, NamespaceTree> {
        self.tree.read()
    }

    pub fn version(&self) -> Version {
        self.tree.read().version()
    }

    /// Attributes of `path` and the version they were read at.
    pub fn attributes(&self, path: &str) -> Result<(NodeAttr, Version)> {
        let tree = self.tree.read();
        Ok((tree.attr(path)?, tree.version()))
    }

    /// Directory listing and the version it was read at.
    pub fn list(&self, path: &str) -> Result<(Vec<DirEntry>, Version)> {
        let tree = self.tree.read();
        Ok((tree.list(path)?, tree.version()))
    }

    /// Read file bytes through a node id.
    pub fn read(&self, node: NodeId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let tree = self.tree.read();
        let path = tree
            .path_of(node)
            .ok_or_else(|| FsError::NotFound(format!("node {}", node)))?;
        if tree.lookup(path)?.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        match self.store.read_at(path, offset, len) {
            Ok(data) => Ok(data),
            Err(StoreError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FsError::NotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.events.subscribe()
    }

    /// Register a joining session.
    ///
    /// The subscription is taken under the tree lock, so every event after
    /// the returned version reaches the receiver and none before it needs to.
    pub fn join(
        &self,
        last_version: Option<Version>,
    ) -> (Version, Resync, broadcast::Receiver<Published>) {
        let tree = self.tree.read();
        let receiver = self.events.subscribe();
        let version = tree.version();

        let resync = match last_version {
            None => Resync::Current,
            Some(last) if last == version => Resync::Current,
            Some(last) if last > version => Resync::Snapshot(tree.snapshot()),
            Some(last) => match self.history.lock().since(last, version) {
                Some(events) => Resync::Replay(events),
                None => Resync::Snapshot(tree.snapshot()),
            },
        };
        (version, resync, receiver)
    }

    /// Apply one tree change under the write lock and publish its event.
    ///
    /// `apply` receives the version to assign. On error nothing is
    /// published and the version does not move.
    pub(crate) fn commit<F>(&self, origin: Origin, apply: F) -> Result<Arc<ChangeEvent>>
    where
        F: FnOnce(&mut NamespaceTree, Version) -> Result<ChangeEvent>,
    {
        let mut tree = self.tree.write();
        let version = tree.version() + 1;
        let event = Arc::new(apply(&mut *tree, version)?);
        debug_assert_eq!(event.version, version);

        debug!(
            "v{} {:?} {} ({:?})",
            event.version, event.kind, event.path, origin
        );
        self.history.lock().push(Arc::clone(&event));
        // No receivers just means no session is connected.
        let _ = self.events.send(Published {
            event: Arc::clone(&event),
            origin,
        });
        Ok(event)
    }

    /// Run `update` under the write lock without publishing anything.
    pub(crate) fn update_quietly<F>(&self, update: F)
    where
        F: FnOnce(&mut NamespaceTree),
    {
        let mut tree = self.tree.write();
        update(&mut *tree);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filebox_proto::ChangeKind;
    use tempfile::TempDir;

    fn event(version: Version) -> Arc<ChangeEvent> {
        Arc::new(ChangeEvent {
            version,
            kind: ChangeKind::Mkdir,
            path: format!("/d{}", version),
            old_path: None,
            attr: None,
        })
    }

    #[test]
    fn history_replays_only_when_covered() {
        let mut history = EventHistory::new(3);
        for v in 1..=5 {
            history.push(event(v));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.since(5, 5), Some(Vec::new()));
        let replay = history.since(2, 5).unwrap();
        assert_eq!(
            replay.iter().map(|e| e.version).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(history.since(1, 5), None);
    }

    #[test]
    fn load_walks_existing_files() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("mydir0/nested")).unwrap();
        std::fs::write(temp.path().join("mydir0/myfile0.txt"), b"Hello 0").unwrap();

        let store = ContentStore::open(temp.path()).unwrap();
        let namespace = Namespace::load(store, 16, 16).unwrap();
        assert_eq!(namespace.version(), 0);

        let (attr, as_of) = namespace.attributes("/mydir0/myfile0.txt").unwrap();
        assert_eq!(attr.size, 7);
        assert_eq!(attr.version, 0);
        assert_eq!(as_of, 0);
        assert!(namespace.attributes("/mydir0/nested").unwrap().0.is_dir());
    }

    #[test]
    fn load_skips_links() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"outside-root").unwrap();
        std::os::unix::fs::symlink(".", temp.path().join("loop")).unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).unwrap();
        std::fs::write(temp.path().join("kept.txt"), b"kept").unwrap();

        let store = ContentStore::open(temp.path()).unwrap();
        let namespace = Namespace::load(store, 16, 16).unwrap();
        let (entries, _) = namespace.list("/").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["kept.txt"]);
        assert!(matches!(
            namespace.attributes("/link/secret"),
            Err(FsError::NotFound(_))
        ));
        assert!(namespace.store().read_at("/link/secret", 0, 64).is_err());
    }

    #[test]
    fn join_chooses_resync_mode() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path()).unwrap();
        let namespace = Namespace::load(store, 2, 16).unwrap();

        for name in ["a", "b", "c"] {
            namespace
                .commit(Origin::Reconciler, |tree, version| {
                    let meta = NodeMeta {
                        size: 0,
                        modified_at: chrono::Utc::now(),
                        mode: 0o755,
                        stamp: None,
                        digest: None,
                    };
                    let attr = tree.insert("/", name, NodeKind::Directory, meta, version)?;
                    Ok(ChangeEvent {
                        version,
                        kind: ChangeKind::Mkdir,
                        path: attr.path.clone(),
                        old_path: None,
                        attr: Some(attr),
                    })
                })
                .unwrap();
        }

        let (version, resync, _rx) = namespace.join(None);
        assert_eq!(version, 3);
        assert_eq!(resync, Resync::Current);

        let (_, resync, _rx) = namespace.join(Some(2));
        match resync {
            Resync::Replay(events) => assert_eq!(events.len(), 1),
            other => panic!("expected replay, got {:?}", other),
        }

        let (_, resync, _rx) = namespace.join(Some(0));
        match resync {
            Resync::Snapshot(attrs) => assert_eq!(attrs.len(), 4),
            other => panic!("expected snapshot, got {:?}", other),
        }
    }
}
