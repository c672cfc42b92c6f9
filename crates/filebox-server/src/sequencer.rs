//! Mutation sequencer.
//!
//! Every namespace change, whether it comes from a session or from the disk
//! reconciler, is applied here one at a time. For each intent:
//!
//! 1. validate against the tree (structural errors return untouched),
//! 2. under the tree write lock, apply to the content store (an I/O failure
//!    aborts, no version bump) and then to the tree at `version + 1`,
//! 3. publish the change event and answer the requester.
//!
//! Readers hold the tree read lock across their disk access, so they see a
//! path either before or after a change, on disk and in the tree alike.
//!
//! The sequencer runs on its own thread and is reached through the cloneable
//! [`Sequencer`] handle.

use crate::namespace::{Namespace, Origin};
use crate::store::DiskMeta;
use crate::tree::{NodeId, NodeMeta};
use filebox_proto::{
    path, ChangeEvent, ChangeKind, FsError, NodeAttr, NodeKind, OpenFlags, Result, Version,
};
use log::{debug, warn};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

/// A requested namespace change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Open with create and/or truncate.
    Open {
        path: String,
        flags: OpenFlags,
        mode: u32,
    },
    Write {
        node: NodeId,
        offset: u64,
        data: Vec<u8>,
    },
    Truncate {
        path: String,
        size: u64,
    },
    /// Commit barrier for a node; publishes nothing.
    Flush {
        node: NodeId,
    },
    Delete {
        path: String,
    },
    CreateDirectory {
        path: String,
        mode: u32,
    },
    DeleteDirectory {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    /// Bring the tree in line with what is on disk at `path`.
    ///
    /// `deep` also walks every known descendant of a directory.
    Reconcile {
        path: String,
        deep: bool,
    },
}

/// Result of an applied intent.
#[derive(Debug, Clone)]
pub struct Commit {
    /// Version of the last published event, or the tree version when the
    /// intent published nothing.
    pub version: Version,
    pub events: Vec<Arc<ChangeEvent>>,
    /// Node the intent resolved to, for opens and writes.
    pub target: Option<(NodeId, NodeAttr)>,
}

impl Commit {
    fn quiet(version: Version) -> Self {
        Self {
            version,
            events: Vec::new(),
            target: None,
        }
    }

    fn published(events: Vec<Arc<ChangeEvent>>, fallback: Version) -> Self {
        let version = events.last().map_or(fallback, |e| e.version);
        Self {
            version,
            events,
            target: None,
        }
    }

    fn with_target(mut self, target: (NodeId, NodeAttr)) -> Self {
        self.target = Some(target);
        self
    }
}

struct Intent {
    mutation: Mutation,
    origin: Origin,
    reply: Option<oneshot::Sender<Result<Commit>>>,
}

/// Handle to the sequencer thread.
#[derive(Clone)]
pub struct Sequencer {
    tx: mpsc::Sender<Intent>,
}

impl Sequencer {
    /// Spawn the sequencer thread. It stops once every handle is dropped.
    pub fn start(namespace: Arc<Namespace>, queue_depth: usize) -> io::Result<(Self, JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::channel::<Intent>(queue_depth.max(1));
        let handle = std::thread::Builder::new()
            .name("filebox-sequencer".to_string())
            .spawn(move || {
                while let Some(intent) = rx.blocking_recv() {
                    let result = apply(&namespace, intent.mutation, intent.origin);
                    match intent.reply {
                        Some(reply) => {
                            // The requester may have timed out and left.
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(err) = result {
                                warn!("Intent from {:?} failed: {}", intent.origin, err);
                            }
                        }
                    }
                }
                debug!("Sequencer stopped");
            })?;
        Ok((Self { tx }, handle))
    }

    /// Submit a mutation and wait until it is committed and published.
    pub async fn submit(&self, mutation: Mutation, origin: Origin) -> Result<Commit> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Intent {
                mutation,
                origin,
                reply: Some(reply),
            })
            .await
            .map_err(|_| FsError::Disconnected)?;
        rx.await.map_err(|_| FsError::Disconnected)?
    }

    /// Queue a mutation without waiting for its outcome.
    pub async fn enqueue(&self, mutation: Mutation, origin: Origin) -> Result<()> {
        self.tx
            .send(Intent {
                mutation,
                origin,
                reply: None,
            })
            .await
            .map_err(|_| FsError::Disconnected)
    }
}

/// Apply one mutation. Only the sequencer thread (and tests) call this.
pub fn apply(namespace: &Namespace, mutation: Mutation, origin: Origin) -> Result<Commit> {
    match mutation {
        Mutation::Open { path, flags, mode } => open(namespace, &path, flags, mode, origin),
        Mutation::Write { node, offset, data } => write(namespace, node, offset, &data, origin),
        Mutation::Truncate { path, size } => truncate(namespace, &path, size, origin),
        Mutation::Flush { node } => flush(namespace, node),
        Mutation::Delete { path } => remove(namespace, &path, NodeKind::File, origin),
        Mutation::CreateDirectory { path, mode } => create_directory(namespace, &path, mode, origin),
        Mutation::DeleteDirectory { path } => remove(namespace, &path, NodeKind::Directory, origin),
        Mutation::Rename { from, to } => rename(namespace, &from, &to, origin),
        Mutation::Reconcile { path, deep } => {
            let mut events = Vec::new();
            reconcile(namespace, &path, deep, origin, &mut events)?;
            Ok(Commit::published(events, namespace.version()))
        }
    }
}

fn event(
    version: Version,
    kind: ChangeKind,
    path: &str,
    old_path: Option<&str>,
    attr: Option<NodeAttr>,
) -> ChangeEvent {
    ChangeEvent {
        version,
        kind,
        path: path.to_string(),
        old_path: old_path.map(str::to_string),
        attr,
    }
}

fn split(path: &str) -> Result<(&str, &str)> {
    let parent = path::parent(path).ok_or_else(|| FsError::InvalidPath(path.to_string()))?;
    Ok((parent, path::file_name(path)))
}

fn target_of(namespace: &Namespace, path: &str) -> Result<(NodeId, NodeAttr)> {
    let tree = namespace.tree();
    let node = tree.lookup(path)?;
    Ok((node.id, node.attr(path)))
}

fn resolve(namespace: &Namespace, node: NodeId) -> Result<String> {
    let tree = namespace.tree();
    let path = tree
        .path_of(node)
        .ok_or_else(|| FsError::NotFound(format!("node {}", node)))?;
    if tree.lookup(path)?.is_dir() {
        return Err(FsError::IsADirectory(path.to_string()));
    }
    Ok(path.to_string())
}

fn open(
    namespace: &Namespace,
    path: &str,
    flags: OpenFlags,
    mode: u32,
    origin: Origin,
) -> Result<Commit> {
    let existing = {
        let tree = namespace.tree();
        let size = match tree.lookup(path) {
            Ok(node) if node.is_dir() => return Err(FsError::IsADirectory(path.to_string())),
            Ok(node) => Some(node.size),
            Err(FsError::NotFound(_)) => {
                if !flags.create {
                    return Err(FsError::NotFound(path.to_string()));
                }
                let (parent, name) = split(path)?;
                tree.check_insert(parent, name)?;
                None
            }
            Err(err) => return Err(err),
        };
        size
    };

    match existing {
        Some(_) if flags.create && flags.exclusive => Err(FsError::AlreadyExists(path.to_string())),
        Some(size) if flags.truncate && size > 0 => {
            let published = namespace.commit(origin, |tree, version| {
                let meta = namespace.store().truncate(path, 0)?;
                let attr = tree.replace_content(path, meta, None, version)?;
                Ok(event(version, ChangeKind::Write, path, None, Some(attr)))
            })?;
            let target = target_of(namespace, path)?;
            Ok(Commit::published(vec![published], 0).with_target(target))
        }
        Some(_) => {
            let target = target_of(namespace, path)?;
            Ok(Commit::quiet(namespace.version()).with_target(target))
        }
        None => {
            let (parent, name) = split(path)?;
            let published = namespace.commit(origin, |tree, version| {
                let meta = namespace.store().create_file(path, mode, flags.truncate)?;
                let attr = tree.insert(parent, name, NodeKind::File, NodeMeta::from(meta), version)?;
                Ok(event(version, ChangeKind::Create, path, None, Some(attr)))
            })?;
            let target = target_of(namespace, path)?;
            Ok(Commit::published(vec![published], 0).with_target(target))
        }
    }
}

fn write(
    namespace: &Namespace,
    node: NodeId,
    offset: u64,
    data: &[u8],
    origin: Origin,
) -> Result<Commit> {
    let path = resolve(namespace, node)?;
    if data.is_empty() {
        let attr = namespace.tree().attr(&path)?;
        return Ok(Commit::quiet(namespace.version()).with_target((node, attr)));
    }

    let published = namespace.commit(origin, |tree, version| {
        let meta = namespace.store().write_at(&path, offset, data)?;
        tree.update_content(&path, offset, data, meta, version)?;
        let attr = tree.attr(&path)?;
        Ok(event(version, ChangeKind::Write, &path, None, Some(attr)))
    })?;
    let attr = published.attr.clone();
    let commit = Commit::published(vec![published], 0);
    Ok(match attr {
        Some(attr) => commit.with_target((node, attr)),
        None => commit,
    })
}

fn truncate(namespace: &Namespace, path: &str, size: u64, origin: Origin) -> Result<Commit> {
    {
        let tree = namespace.tree();
        if tree.lookup(path)?.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
    }
    let published = namespace.commit(origin, |tree, version| {
        let meta = namespace.store().truncate(path, size)?;
        let attr = tree.replace_content(path, meta, None, version)?;
        Ok(event(version, ChangeKind::Write, path, None, Some(attr)))
    })?;
    Ok(Commit::published(vec![published], 0))
}

fn flush(namespace: &Namespace, node: NodeId) -> Result<Commit> {
    let path = resolve(namespace, node)?;
    let meta = namespace.store().sync(&path)?;
    namespace.update_quietly(|tree| tree.refresh_stamp(&path, meta.stamp(), None));
    Ok(Commit::quiet(namespace.version()))
}

fn remove(namespace: &Namespace, path: &str, kind: NodeKind, origin: Origin) -> Result<Commit> {
    namespace.tree().check_remove(path, kind)?;
    let change = match kind {
        NodeKind::File => ChangeKind::Delete,
        NodeKind::Directory => ChangeKind::Rmdir,
    };
    let published = namespace.commit(origin, |tree, version| {
        match kind {
            NodeKind::File => namespace.store().remove_file(path)?,
            NodeKind::Directory => namespace.store().remove_dir(path)?,
        }
        tree.remove(path, version)?;
        Ok(event(version, change, path, None, None))
    })?;
    Ok(Commit::published(vec![published], 0))
}

fn create_directory(namespace: &Namespace, path: &str, mode: u32, origin: Origin) -> Result<Commit> {
    let (parent, name) = split(path)?;
    namespace.tree().check_insert(parent, name)?;
    let published = namespace.commit(origin, |tree, version| {
        let meta = namespace.store().create_dir(path, mode)?;
        let attr = tree.insert(parent, name, NodeKind::Directory, NodeMeta::from(meta), version)?;
        Ok(event(version, ChangeKind::Mkdir, path, None, Some(attr)))
    })?;
    Ok(Commit::published(vec![published], 0))
}

fn rename(namespace: &Namespace, from: &str, to: &str, origin: Origin) -> Result<Commit> {
    namespace.tree().check_rename(from, to)?;
    let published = namespace.commit(origin, |tree, version| {
        namespace.store().rename(from, to)?;
        let attr = tree.rename(from, to, version)?;
        Ok(event(version, ChangeKind::Rename, to, Some(from), Some(attr)))
    })?;
    Ok(Commit::published(vec![published], 0))
}

/// What the tree currently records at a path.
struct Known {
    kind: NodeKind,
    stamp: Option<crate::store::DiskStamp>,
    digest: Option<blake3::Hash>,
    children: Vec<String>,
}

fn known(namespace: &Namespace, path: &str) -> Option<Known> {
    let tree = namespace.tree();
    let node = tree.lookup(path).ok()?;
    Some(Known {
        kind: node.kind,
        stamp: node.stamp,
        digest: node.digest,
        children: node.children.iter().cloned().collect(),
    })
}

fn reconcile(
    namespace: &Namespace,
    path: &str,
    deep: bool,
    origin: Origin,
    events: &mut Vec<Arc<ChangeEvent>>,
) -> Result<()> {
    if let Some(parent) = path::parent(path) {
        let parent_is_dir = |ns: &Namespace| ns.tree().lookup(parent).map_or(false, |n| n.is_dir());
        if !parent_is_dir(namespace) {
            reconcile(namespace, parent, false, origin, events)?;
            if !parent_is_dir(namespace) {
                // The parent is gone from disk too; its removal covers us.
                return Ok(());
            }
        }
    }

    let disk = namespace.store().stat(path)?;
    match (disk, known(namespace, path)) {
        (None, None) => Ok(()),
        (None, Some(_)) => remove_subtree(namespace, path, origin, events),
        (Some(meta), None) => add(namespace, path, meta, origin, events),
        (Some(meta), Some(known)) if meta.kind != known.kind => {
            remove_subtree(namespace, path, origin, events)?;
            add(namespace, path, meta, origin, events)
        }
        (Some(meta), Some(known)) if known.kind == NodeKind::File => {
            refresh_file(namespace, path, meta, known, origin, events)
        }
        (Some(_), Some(known)) => {
            let on_disk = namespace.store().list(path)?;
            let mut names: Vec<String> = Vec::new();
            for (name, _) in &on_disk {
                if deep || !known.children.contains(name) {
                    names.push(name.clone());
                }
            }
            for name in &known.children {
                let present = on_disk.iter().any(|(n, _)| n == name);
                if deep || !present {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
            for name in names {
                reconcile(namespace, &path::join(path, &name), deep, origin, events)?;
            }
            Ok(())
        }
    }
}

fn add(
    namespace: &Namespace,
    path: &str,
    meta: DiskMeta,
    origin: Origin,
    events: &mut Vec<Arc<ChangeEvent>>,
) -> Result<()> {
    let (parent, name) = split(path)?;
    match meta.kind {
        NodeKind::Directory => {
            events.push(namespace.commit(origin, |tree, version| {
                let attr =
                    tree.insert(parent, name, NodeKind::Directory, NodeMeta::from(meta), version)?;
                Ok(event(version, ChangeKind::Mkdir, path, None, Some(attr)))
            })?);
            for (child, _) in namespace.store().list(path)? {
                reconcile(namespace, &path::join(path, &child), true, origin, events)?;
            }
            Ok(())
        }
        NodeKind::File => {
            let (digest, meta) = match namespace.store().digest(path) {
                Ok(found) => found,
                Err(err) => {
                    // Not readable yet; the next stable observation adds it.
                    debug!("Deferring {}: {}", path, err);
                    return Ok(());
                }
            };
            events.push(namespace.commit(origin, |tree, version| {
                let mut node_meta = NodeMeta::from(meta);
                node_meta.digest = Some(digest);
                let attr = tree.insert(parent, name, NodeKind::File, node_meta, version)?;
                Ok(event(version, ChangeKind::Create, path, None, Some(attr)))
            })?);
            Ok(())
        }
    }
}

fn refresh_file(
    namespace: &Namespace,
    path: &str,
    meta: DiskMeta,
    known: Known,
    origin: Origin,
    events: &mut Vec<Arc<ChangeEvent>>,
) -> Result<()> {
    if known.stamp == Some(meta.stamp()) {
        return Ok(());
    }
    match namespace.store().digest(path) {
        Ok((digest, meta)) if known.digest == Some(digest) => {
            namespace.update_quietly(|tree| tree.refresh_stamp(path, meta.stamp(), Some(digest)));
            Ok(())
        }
        Ok((digest, meta)) => {
            events.push(namespace.commit(origin, |tree, version| {
                let attr = tree.replace_content(path, meta, Some(digest), version)?;
                Ok(event(version, ChangeKind::Write, path, None, Some(attr)))
            })?);
            Ok(())
        }
        Err(err) => {
            debug!("{} is no longer readable: {}", path, err);
            remove_subtree(namespace, path, origin, events)
        }
    }
}

/// Drop `path` and everything under it from the tree, deepest first.
fn remove_subtree(
    namespace: &Namespace,
    path: &str,
    origin: Origin,
    events: &mut Vec<Arc<ChangeEvent>>,
) -> Result<()> {
    let mut doomed = namespace.tree().descendants_deepest_first(path);
    doomed.push(path.to_string());
    for victim in doomed {
        let Some(known) = known(namespace, &victim) else {
            continue;
        };
        let change = match known.kind {
            NodeKind::File => ChangeKind::Delete,
            NodeKind::Directory => ChangeKind::Rmdir,
        };
        events.push(namespace.commit(origin, |tree, version| {
            tree.remove(&victim, version)?;
            Ok(event(version, change, &victim, None, None))
        })?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ContentStore;
    use tempfile::TempDir;

    const ME: Origin = Origin::Session(1);

    fn namespace() -> (TempDir, Namespace) {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path()).unwrap();
        let namespace = Namespace::load(store, 64, 64).unwrap();
        (temp, namespace)
    }

    fn create(ns: &Namespace, path: &str) -> NodeId {
        let commit = apply(
            ns,
            Mutation::Open {
                path: path.to_string(),
                flags: OpenFlags {
                    create: true,
                    ..Default::default()
                },
                mode: 0o644,
            },
            ME,
        )
        .unwrap();
        commit.target.unwrap().0
    }

    fn mkdir(ns: &Namespace, path: &str) -> Result<Commit> {
        apply(
            ns,
            Mutation::CreateDirectory {
                path: path.to_string(),
                mode: 0o755,
            },
            ME,
        )
    }

    #[test]
    fn versions_increase_by_one_per_event() {
        let (_temp, ns) = namespace();
        let mut rx = ns.subscribe();

        assert_eq!(mkdir(&ns, "/mydir0").unwrap().version, 1);
        let node = create(&ns, "/mydir0/myfile0.txt");
        let commit = apply(
            &ns,
            Mutation::Write {
                node,
                offset: 0,
                data: b"Hello 0".to_vec(),
            },
            ME,
        )
        .unwrap();
        assert_eq!(commit.version, 3);
        assert_eq!(commit.target.unwrap().1.size, 7);

        let kinds: Vec<_> = (0..3)
            .map(|_| rx.try_recv().unwrap())
            .map(|p| (p.event.version, p.event.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (1, ChangeKind::Mkdir),
                (2, ChangeKind::Create),
                (3, ChangeKind::Write)
            ]
        );
        assert_eq!(ns.store().read_at("/mydir0/myfile0.txt", 0, 16).unwrap(), b"Hello 0");
    }

    #[test]
    fn structural_errors_leave_everything_untouched() {
        let (temp, ns) = namespace();
        mkdir(&ns, "/d").unwrap();
        create(&ns, "/d/f");
        let mut rx = ns.subscribe();

        assert_eq!(
            apply(&ns, Mutation::DeleteDirectory { path: "/d".into() }, ME).unwrap_err(),
            FsError::NotEmpty("/d".into())
        );
        assert_eq!(mkdir(&ns, "/d").unwrap_err(), FsError::AlreadyExists("/d".into()));
        assert_eq!(
            apply(&ns, Mutation::Delete { path: "/d".into() }, ME).unwrap_err(),
            FsError::IsADirectory("/d".into())
        );
        assert_eq!(ns.version(), 2);
        assert!(rx.try_recv().is_err());
        assert!(temp.path().join("d/f").exists());
    }

    #[test]
    fn io_failure_does_not_advance_version() {
        let (temp, ns) = namespace();
        let node = create(&ns, "/f");
        // Pull the file out from under the tree.
        std::fs::remove_file(temp.path().join("f")).unwrap();

        let err = apply(
            &ns,
            Mutation::Write {
                node,
                offset: 0,
                data: b"x".to_vec(),
            },
            ME,
        )
        .unwrap_err();
        assert!(matches!(err, FsError::IoFailure(_)));
        assert_eq!(ns.version(), 1);
    }

    #[test]
    fn exclusive_create_and_truncate() {
        let (_temp, ns) = namespace();
        let node = create(&ns, "/f");
        apply(
            &ns,
            Mutation::Write {
                node,
                offset: 0,
                data: b"data".to_vec(),
            },
            ME,
        )
        .unwrap();

        let exclusive = OpenFlags {
            create: true,
            exclusive: true,
            truncate: false,
        };
        let err = apply(
            &ns,
            Mutation::Open {
                path: "/f".into(),
                flags: exclusive,
                mode: 0o644,
            },
            ME,
        )
        .unwrap_err();
        assert_eq!(err, FsError::AlreadyExists("/f".into()));

        let commit = apply(
            &ns,
            Mutation::Open {
                path: "/f".into(),
                flags: OpenFlags {
                    truncate: true,
                    ..Default::default()
                },
                mode: 0o644,
            },
            ME,
        )
        .unwrap();
        assert_eq!(commit.events.len(), 1);
        assert_eq!(commit.events[0].kind, ChangeKind::Write);
        assert_eq!(commit.target.unwrap().1.size, 0);

        let missing = apply(
            &ns,
            Mutation::Open {
                path: "/nope".into(),
                flags: OpenFlags::default(),
                mode: 0o644,
            },
            ME,
        );
        assert_eq!(missing.unwrap_err(), FsError::NotFound("/nope".into()));
    }

    #[test]
    fn rename_keeps_node_identity() {
        let (_temp, ns) = namespace();
        mkdir(&ns, "/mydir0").unwrap();
        let node = create(&ns, "/mydir0/myfile0.txt");
        let commit = apply(
            &ns,
            Mutation::Rename {
                from: "/mydir0/myfile0.txt".into(),
                to: "/mydir0/myfile0.txt.new".into(),
            },
            ME,
        )
        .unwrap();
        let event = &commit.events[0];
        assert_eq!(event.kind, ChangeKind::Rename);
        assert_eq!(event.old_path.as_deref(), Some("/mydir0/myfile0.txt"));
        assert_eq!(ns.tree().path_of(node), Some("/mydir0/myfile0.txt.new"));

        // Writing through the old node id lands on the new path.
        apply(
            &ns,
            Mutation::Write {
                node,
                offset: 0,
                data: b"moved".to_vec(),
            },
            ME,
        )
        .unwrap();
        assert_eq!(
            ns.store().read_at("/mydir0/myfile0.txt.new", 0, 16).unwrap(),
            b"moved"
        );
    }

    #[test]
    fn handle_reads_never_miss_a_renamed_file() {
        let (_temp, ns) = namespace();
        let node = create(&ns, "/a");
        apply(
            &ns,
            Mutation::Write {
                node,
                offset: 0,
                data: b"steady".to_vec(),
            },
            ME,
        )
        .unwrap();

        let done = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let mut reads = 0;
                loop {
                    assert_eq!(ns.read(node, 0, 16).unwrap(), b"steady");
                    reads += 1;
                    if done.load(std::sync::atomic::Ordering::Acquire) {
                        break reads;
                    }
                }
            });
            for round in 0..500 {
                let (from, to) = if round % 2 == 0 { ("/a", "/b") } else { ("/b", "/a") };
                apply(
                    &ns,
                    Mutation::Rename {
                        from: from.into(),
                        to: to.into(),
                    },
                    ME,
                )
                .unwrap();
            }
            done.store(true, std::sync::atomic::Ordering::Release);
            assert!(reader.join().unwrap() > 0);
        });
        assert_eq!(ns.tree().path_of(node), Some("/a"));
    }

    #[test]
    fn flush_publishes_nothing() {
        let (_temp, ns) = namespace();
        let node = create(&ns, "/f");
        let mut rx = ns.subscribe();
        let commit = apply(&ns, Mutation::Flush { node }, ME).unwrap();
        assert!(commit.events.is_empty());
        assert_eq!(commit.version, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reconcile_picks_up_out_of_band_changes() {
        let (temp, ns) = namespace();
        std::fs::create_dir_all(temp.path().join("outside/nested")).unwrap();
        std::fs::write(temp.path().join("outside/nested/a.txt"), b"from disk").unwrap();

        let commit = apply(
            &ns,
            Mutation::Reconcile {
                path: "/outside/nested/a.txt".into(),
                deep: false,
            },
            Origin::Reconciler,
        )
        .unwrap();
        let created: Vec<_> = commit
            .events
            .iter()
            .map(|e| (e.kind, e.path.as_str()))
            .collect();
        assert_eq!(
            created,
            vec![
                (ChangeKind::Mkdir, "/outside"),
                (ChangeKind::Mkdir, "/outside/nested"),
                (ChangeKind::Create, "/outside/nested/a.txt"),
            ]
        );
        assert_eq!(ns.attributes("/outside/nested/a.txt").unwrap().0.size, 9);

        // Same content again: nothing new.
        let again = apply(
            &ns,
            Mutation::Reconcile {
                path: "/outside".into(),
                deep: true,
            },
            Origin::Reconciler,
        )
        .unwrap();
        assert!(again.events.is_empty());

        std::fs::remove_dir_all(temp.path().join("outside")).unwrap();
        let removed = apply(
            &ns,
            Mutation::Reconcile {
                path: "/outside".into(),
                deep: false,
            },
            Origin::Reconciler,
        )
        .unwrap();
        let gone: Vec<_> = removed
            .events
            .iter()
            .map(|e| (e.kind, e.path.as_str()))
            .collect();
        assert_eq!(
            gone,
            vec![
                (ChangeKind::Delete, "/outside/nested/a.txt"),
                (ChangeKind::Rmdir, "/outside/nested"),
                (ChangeKind::Rmdir, "/outside"),
            ]
        );
        assert_eq!(ns.version(), 6);
    }

    #[test]
    fn reconcile_ignores_echo_of_protocol_writes() {
        let (_temp, ns) = namespace();
        let node = create(&ns, "/f");
        apply(
            &ns,
            Mutation::Write {
                node,
                offset: 0,
                data: b"abc".to_vec(),
            },
            ME,
        )
        .unwrap();
        let commit = apply(
            &ns,
            Mutation::Reconcile {
                path: "/f".into(),
                deep: false,
            },
            Origin::Reconciler,
        )
        .unwrap();
        assert!(commit.events.is_empty());
        assert_eq!(commit.version, 2);
    }

    #[tokio::test]
    async fn sequencer_thread_answers_in_order() {
        let (_temp, ns) = namespace();
        let ns = Arc::new(ns);
        let (sequencer, thread) = Sequencer::start(Arc::clone(&ns), 8).unwrap();

        let first = sequencer
            .submit(
                Mutation::CreateDirectory {
                    path: "/a".into(),
                    mode: 0o755,
                },
                ME,
            )
            .await
            .unwrap();
        let second = sequencer
            .submit(
                Mutation::CreateDirectory {
                    path: "/a/b".into(),
                    mode: 0o755,
                },
                ME,
            )
            .await
            .unwrap();
        assert_eq!((first.version, second.version), (1, 2));

        drop(sequencer);
        thread.join().unwrap();
    }
}
