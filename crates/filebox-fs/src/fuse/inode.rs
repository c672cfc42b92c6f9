use filebox_proto::path;
use std::collections::{HashMap, HashSet};

/// Inode number of the mount root.
pub const ROOT_INODE: u64 = 1;

/// Two-way map between kernel inode numbers and namespace paths.
///
/// Inodes are handed out on first sight of a path and follow renames made
/// through this mount. An entry goes away when the kernel forgets its last
/// lookup, when the path turns out to be gone, or when a fresh listing of
/// its parent no longer has it.
#[derive(Debug)]
pub struct InodeMap {
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
    /// Kernel lookup references per inode.
    lookups: HashMap<u64, u64>,
    next: u64,
}

impl InodeMap {
    pub fn new() -> Self {
        let mut map = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            lookups: HashMap::new(),
            next: ROOT_INODE + 1,
        };
        map.paths.insert(ROOT_INODE, path::ROOT.to_string());
        map.inodes.insert(path::ROOT.to_string(), ROOT_INODE);
        map
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    /// Inode of `path`, allocating one if needed.
    pub fn inode(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.inodes.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, path.to_string());
        self.inodes.insert(path.to_string(), ino);
        ino
    }

    /// Inode of `path` with one more kernel reference.
    pub fn lookup(&mut self, path: &str) -> u64 {
        let ino = self.inode(path);
        *self.lookups.entry(ino).or_insert(0) += 1;
        ino
    }

    /// Drop `count` kernel references to `ino`.
    pub fn forget(&mut self, ino: u64, count: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let remaining = match self.lookups.get_mut(&ino) {
            Some(lookups) => {
                *lookups = lookups.saturating_sub(count);
                *lookups
            }
            None => 0,
        };
        if remaining == 0 {
            self.lookups.remove(&ino);
            if let Some(path) = self.paths.remove(&ino) {
                self.inodes.remove(&path);
            }
        }
    }

    /// Forget `root` and every path beneath it.
    pub fn remove(&mut self, root: &str) {
        let paths = &mut self.paths;
        let lookups = &mut self.lookups;
        self.inodes.retain(|p, ino| {
            let keep = !path::is_within(p, root) || *ino == ROOT_INODE;
            if !keep {
                paths.remove(ino);
                lookups.remove(ino);
            }
            keep
        });
    }

    /// Forget children of `dir` (and their subtrees) missing from `names`.
    pub fn retain_children<'a, I>(&mut self, dir: &str, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let names: HashSet<&str> = names.into_iter().collect();
        let gone: Vec<String> = self
            .inodes
            .keys()
            .filter(|p| {
                path::parent(p.as_str()) == Some(dir) && !names.contains(path::file_name(p.as_str()))
            })
            .cloned()
            .collect();
        for child in gone {
            self.remove(&child);
        }
    }

    /// Move `from` and its subtree to `to`, keeping inode numbers.
    pub fn rename(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        self.remove(to);
        let moved: Vec<(String, u64)> = self
            .inodes
            .iter()
            .filter(|(p, _)| path::is_within(p, from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old, ino) in moved {
            let new = path::rebase(&old, from, to);
            self.inodes.remove(&old);
            self.paths.insert(ino, new.clone());
            self.inodes.insert(new, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}
