//! In-memory authoritative model of the directory hierarchy.
//!
//! The tree is keyed by normalized path. Every node also has a stable
//! [`NodeId`] so open handles keep pointing at the same file across a
//! rename. Only the sequencer mutates the tree; every mutating method takes
//! the version the sequencer assigned to the mutation.

use crate::store::{DiskMeta, DiskStamp};
use chrono::{DateTime, Utc};
use filebox_proto::{path, DirEntry, FsError, NodeAttr, NodeKind, Result, Version};
use indexmap::IndexSet;
use std::collections::HashMap;

/// Stable server-local identity of a node.
pub type NodeId = u64;

/// Id of the root directory.
pub const ROOT_ID: NodeId = 1;

/// One file or directory.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub mode: u32,
    pub version: Version,
    /// Child names in insertion order (directories only).
    pub children: IndexSet<String>,
    /// Disk length/mtime after the last change applied to this node.
    pub stamp: Option<DiskStamp>,
    /// Content digest, when known.
    pub digest: Option<blake3::Hash>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn attr(&self, path: &str) -> NodeAttr {
        NodeAttr {
            path: path.to_string(),
            kind: self.kind,
            size: self.size,
            modified_at: self.modified_at,
            mode: self.mode,
            version: self.version,
        }
    }
}

/// Attributes for a node about to be inserted.
#[derive(Debug, Clone, Copy)]
pub struct NodeMeta {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub mode: u32,
    pub stamp: Option<DiskStamp>,
    pub digest: Option<blake3::Hash>,
}

impl From<DiskMeta> for NodeMeta {
    fn from(meta: DiskMeta) -> Self {
        Self {
            size: meta.len,
            modified_at: meta.modified_at(),
            mode: meta.mode,
            stamp: (meta.kind == NodeKind::File).then(|| meta.stamp()),
            digest: None,
        }
    }
}

#[derive(Debug)]
pub struct NamespaceTree {
    nodes: HashMap<String, Node>,
    paths_by_id: HashMap<NodeId, String>,
    next_id: NodeId,
    version: Version,
}

impl NamespaceTree {
    /// Create a tree holding only the root directory, at version 0.
    pub fn new(root_mode: u32, modified_at: DateTime<Utc>) -> Self {
        let root = Node {
            id: ROOT_ID,
            kind: NodeKind::Directory,
            size: 0,
            modified_at,
            mode: root_mode,
            version: 0,
            children: IndexSet::new(),
            stamp: None,
            digest: None,
        };
        let mut nodes = HashMap::new();
        nodes.insert(path::ROOT.to_string(), root);
        let mut paths_by_id = HashMap::new();
        paths_by_id.insert(ROOT_ID, path::ROOT.to_string());
        Self {
            nodes,
            paths_by_id,
            next_id: ROOT_ID + 1,
            version: 0,
        }
    }

    /// Version of the most recently applied mutation.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, path: &str) -> Result<&Node> {
        self.nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn attr(&self, path: &str) -> Result<NodeAttr> {
        Ok(self.lookup(path)?.attr(path))
    }

    /// Current path of a node, if it still exists.
    pub fn path_of(&self, id: NodeId) -> Option<&str> {
        self.paths_by_id.get(&id).map(String::as_str)
    }

    /// Children of a directory, in insertion order.
    pub fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let node = self.lookup(dir)?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory(dir.to_string()));
        }
        node.children
            .iter()
            .map(|name| {
                let child_path = path::join(dir, name);
                let attr = self.attr(&child_path)?;
                Ok(DirEntry {
                    name: name.clone(),
                    attr,
                })
            })
            .collect()
    }

    /// Every node's attributes, parents before children.
    pub fn snapshot(&self) -> Vec<NodeAttr> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![path::ROOT.to_string()];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            out.push(node.attr(&current));
            for name in node.children.iter().rev() {
                stack.push(path::join(&current, name));
            }
        }
        out
    }

    /// Descendants of `dir` (excluding itself), deepest first.
    pub fn descendants_deepest_first(&self, dir: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut stack = vec![dir.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                for name in &node.children {
                    let child = path::join(&current, name);
                    order.push(child.clone());
                    stack.push(child);
                }
            }
        }
        order.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        order
    }

    /// Check that `name` can be inserted under `parent`.
    pub fn check_insert(&self, parent: &str, name: &str) -> Result<()> {
        path::validate_name(name)?;
        let parent_node = self.lookup(parent)?;
        if !parent_node.is_dir() {
            return Err(FsError::NotADirectory(parent.to_string()));
        }
        if parent_node.children.contains(name) {
            return Err(FsError::AlreadyExists(path::join(parent, name)));
        }
        Ok(())
    }

    /// Insert a new node under an existing directory.
    pub fn insert(
        &mut self,
        parent: &str,
        name: &str,
        kind: NodeKind,
        meta: NodeMeta,
        version: Version,
    ) -> Result<NodeAttr> {
        self.check_insert(parent, name)?;
        self.advance(version);
        Ok(self.link(parent, name, kind, meta, version))
    }

    /// Insert a node found while loading the store, without advancing the
    /// version.
    pub fn seed(
        &mut self,
        parent: &str,
        name: &str,
        kind: NodeKind,
        meta: NodeMeta,
    ) -> Result<NodeAttr> {
        self.check_insert(parent, name)?;
        let version = self.version;
        Ok(self.link(parent, name, kind, meta, version))
    }

    fn link(
        &mut self,
        parent: &str,
        name: &str,
        kind: NodeKind,
        meta: NodeMeta,
        version: Version,
    ) -> NodeAttr {
        let child_path = path::join(parent, name);
        let id = self.next_id;
        self.next_id += 1;

        let node = Node {
            id,
            kind,
            size: if kind == NodeKind::File { meta.size } else { 0 },
            modified_at: meta.modified_at,
            mode: meta.mode,
            version,
            children: IndexSet::new(),
            stamp: meta.stamp,
            digest: meta.digest,
        };
        let attr = node.attr(&child_path);
        self.nodes.insert(child_path.clone(), node);
        self.paths_by_id.insert(id, child_path);
        self.touch_parent(parent, name, true, meta.modified_at, version);
        attr
    }

    /// Check that `path` can be removed, expecting a node of `kind`.
    pub fn check_remove(&self, path: &str, kind: NodeKind) -> Result<()> {
        if path == path::ROOT {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        let node = self.lookup(path)?;
        match (kind, node.kind) {
            (NodeKind::File, NodeKind::Directory) => {
                return Err(FsError::IsADirectory(path.to_string()))
            }
            (NodeKind::Directory, NodeKind::File) => {
                return Err(FsError::NotADirectory(path.to_string()))
            }
            _ => {}
        }
        if !node.children.is_empty() {
            return Err(FsError::NotEmpty(path.to_string()));
        }
        Ok(())
    }

    /// Remove a file or an empty directory.
    pub fn remove(&mut self, path: &str, version: Version) -> Result<Node> {
        if path == path::ROOT {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        let node = self.lookup(path)?;
        if !node.children.is_empty() {
            return Err(FsError::NotEmpty(path.to_string()));
        }
        self.advance(version);

        let node = self
            .nodes
            .remove(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        self.paths_by_id.remove(&node.id);
        if let Some(parent) = path::parent(path) {
            self.touch_parent(parent, path::file_name(path), false, Utc::now(), version);
        }
        Ok(node)
    }

    /// Check that `from` can be moved to `to`.
    pub fn check_rename(&self, from: &str, to: &str) -> Result<()> {
        if from == path::ROOT || to == path::ROOT {
            return Err(FsError::InvalidPath(from.to_string()));
        }
        let source = self.lookup(from)?;
        if self.contains(to) {
            return Err(FsError::AlreadyExists(to.to_string()));
        }
        if source.is_dir() && path::is_within(to, from) {
            return Err(FsError::InvalidPath(to.to_string()));
        }
        let parent = path::parent(to).unwrap_or(path::ROOT);
        self.check_insert(parent, path::file_name(to))
    }

    /// Move a node, and its whole subtree for a directory.
    pub fn rename(&mut self, from: &str, to: &str, version: Version) -> Result<NodeAttr> {
        self.check_rename(from, to)?;
        self.advance(version);

        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| path::is_within(p, from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = self.nodes.remove(&old) {
                let new = path::rebase(&old, from, to);
                self.paths_by_id.insert(node.id, new.clone());
                self.nodes.insert(new, node);
            }
        }

        let now = Utc::now();
        let from_parent = path::parent(from).unwrap_or(path::ROOT);
        let to_parent = path::parent(to).unwrap_or(path::ROOT);
        self.touch_parent(from_parent, path::file_name(from), false, now, version);
        self.touch_parent(to_parent, path::file_name(to), true, now, version);

        let node = self
            .nodes
            .get_mut(to)
            .ok_or_else(|| FsError::NotFound(to.to_string()))?;
        node.version = version;
        Ok(node.attr(to))
    }

    /// Record `bytes` written at `offset`; returns the new size.
    pub fn update_content(
        &mut self,
        path: &str,
        offset: u64,
        bytes: &[u8],
        stamp: DiskMeta,
        version: Version,
    ) -> Result<u64> {
        let node = self.file_mut(path)?;
        let end = offset + bytes.len() as u64;
        let size = node.size.max(end).max(stamp.len);
        node.size = size;
        node.modified_at = stamp.modified_at();
        node.stamp = Some(stamp.stamp());
        node.digest = None;
        node.version = version;
        self.advance(version);
        Ok(size)
    }

    /// Replace a file's recorded content wholesale (truncate, reconcile).
    pub fn replace_content(
        &mut self,
        path: &str,
        meta: DiskMeta,
        digest: Option<blake3::Hash>,
        version: Version,
    ) -> Result<NodeAttr> {
        let node = self.file_mut(path)?;
        node.size = meta.len;
        node.modified_at = meta.modified_at();
        node.mode = meta.mode;
        node.stamp = Some(meta.stamp());
        node.digest = digest;
        node.version = version;
        let attr = node.attr(path);
        self.advance(version);
        Ok(attr)
    }

    /// Update the disk stamp (and digest) without a visible change.
    pub fn refresh_stamp(&mut self, path: &str, stamp: DiskStamp, digest: Option<blake3::Hash>) {
        if let Some(node) = self.nodes.get_mut(path) {
            node.stamp = Some(stamp);
            if digest.is_some() {
                node.digest = digest;
            }
        }
    }

    fn file_mut(&mut self, path: &str) -> Result<&mut Node> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if node.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        Ok(node)
    }

    fn touch_parent(
        &mut self,
        parent: &str,
        name: &str,
        added: bool,
        modified_at: DateTime<Utc>,
        version: Version,
    ) {
        if let Some(node) = self.nodes.get_mut(parent) {
            if added {
                node.children.insert(name.to_string());
            } else {
                node.children.shift_remove(name);
            }
            node.modified_at = modified_at;
            node.version = version;
        }
    }

    fn advance(&mut self, version: Version) {
        debug_assert!(version > self.version, "versions must strictly increase");
        self.version = version;
    }
}
