use filebox_proto::{AccessMode, DirEntry, HandleId, NodeAttr, OpenFlags, Result};

/// An open file as seen by a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub handle: HandleId,
    pub attr: NodeAttr,
}

/// Path-based filesystem operations a mount forwards to its backend.
///
/// Paths are absolute and `/`-separated. Every call blocks the calling
/// thread until the backend answers.
pub trait FileSystemDriver: Send + Sync {
    fn get_attributes(&self, path: &str) -> Result<NodeAttr>;

    fn open(&self, path: &str, mode: AccessMode, flags: OpenFlags) -> Result<OpenFile>;

    fn read(&self, handle: HandleId, offset: u64, length: u32) -> Result<Vec<u8>>;

    /// Returns the number of bytes written.
    fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<u32>;

    /// Returns once every earlier write through `handle` is visible to
    /// other mounts.
    fn flush(&self, handle: HandleId) -> Result<()>;

    fn close(&self, handle: HandleId) -> Result<()>;

    fn truncate(&self, path: &str, size: u64) -> Result<()>;

    fn delete(&self, path: &str) -> Result<()>;

    fn create_directory(&self, path: &str) -> Result<()>;

    fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>>;

    fn delete_directory(&self, path: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;
}
