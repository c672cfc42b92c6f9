//! Per-session table of open files.

use crate::tree::NodeId;
use filebox_proto::{AccessMode, FsError, HandleId, Result};
use std::collections::{BTreeSet, HashMap};

/// An open file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub id: HandleId,
    pub node: NodeId,
    pub mode: AccessMode,
    /// Position used by reads and writes that carry no explicit offset.
    pub offset: u64,
    /// Set once a write went through the handle since the last flush.
    pub dirty: bool,
}

/// Maps handle ids to open files for one session.
///
/// Ids start at 1 and the smallest released id is reused first.
#[derive(Debug)]
pub struct HandleTable {
    handles: HashMap<HandleId, Handle>,
    free: BTreeSet<HandleId>,
    next: HandleId,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            free: BTreeSet::new(),
            next: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Register an open file and return its id.
    pub fn open(&mut self, node: NodeId, mode: AccessMode) -> HandleId {
        let id = match self.free.pop_first() {
            Some(id) => id,
            None => {
                let id = self.next;
                self.next += 1;
                id
            }
        };
        self.handles.insert(
            id,
            Handle {
                id,
                node,
                mode,
                offset: 0,
                dirty: false,
            },
        );
        id
    }

    pub fn get(&self, id: HandleId) -> Result<&Handle> {
        self.handles.get(&id).ok_or(FsError::InvalidHandle(id))
    }

    pub fn get_mut(&mut self, id: HandleId) -> Result<&mut Handle> {
        self.handles.get_mut(&id).ok_or(FsError::InvalidHandle(id))
    }

    /// The handle, if it was opened for reading.
    pub fn for_read(&mut self, id: HandleId) -> Result<&mut Handle> {
        let handle = self.get_mut(id)?;
        if !handle.mode.can_read() {
            return Err(FsError::InvalidHandle(id));
        }
        Ok(handle)
    }

    /// The handle, if it was opened for writing.
    pub fn for_write(&mut self, id: HandleId) -> Result<&mut Handle> {
        let handle = self.get_mut(id)?;
        if !handle.mode.can_write() {
            return Err(FsError::InvalidHandle(id));
        }
        Ok(handle)
    }

    /// Release a handle. The id becomes available again.
    pub fn close(&mut self, id: HandleId) -> Result<Handle> {
        let handle = self.handles.remove(&id).ok_or(FsError::InvalidHandle(id))?;
        self.free.insert(id);
        Ok(handle)
    }

    /// Release every handle, e.g. when the session ends.
    pub fn drain(&mut self) -> Vec<Handle> {
        self.free.clear();
        self.next = 1;
        let mut handles: Vec<Handle> = self.handles.drain().map(|(_, h)| h).collect();
        handles.sort_by_key(|h| h.id);
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_are_reused() {
        let mut table = HandleTable::new();
        let a = table.open(10, AccessMode::Read);
        let b = table.open(11, AccessMode::Write);
        let c = table.open(12, AccessMode::ReadWrite);
        assert_eq!((a, b, c), (1, 2, 3));

        table.close(b).unwrap();
        table.close(a).unwrap();
        assert_eq!(table.open(13, AccessMode::Read), 1);
        assert_eq!(table.open(14, AccessMode::Read), 2);
        assert_eq!(table.open(15, AccessMode::Read), 4);
    }

    #[test]
    fn closed_handle_is_invalid() {
        let mut table = HandleTable::new();
        let id = table.open(7, AccessMode::Read);
        table.close(id).unwrap();
        assert_eq!(table.get(id).unwrap_err(), FsError::InvalidHandle(id));
        assert_eq!(table.close(id).unwrap_err(), FsError::InvalidHandle(id));
    }

    #[test]
    fn access_mode_is_enforced() {
        let mut table = HandleTable::new();
        let ro = table.open(1, AccessMode::Read);
        let wo = table.open(2, AccessMode::Write);
        assert!(table.for_read(ro).is_ok());
        assert_eq!(table.for_write(ro).unwrap_err(), FsError::InvalidHandle(ro));
        assert_eq!(table.for_read(wo).unwrap_err(), FsError::InvalidHandle(wo));
        assert!(table.for_write(wo).is_ok());
    }

    #[test]
    fn drain_releases_everything() {
        let mut table = HandleTable::new();
        table.open(1, AccessMode::Read);
        table.open(2, AccessMode::Write);
        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, 1);
        assert!(table.is_empty());
        assert_eq!(table.open(3, AccessMode::Read), 1);
    }
}
