use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sequence number assigned by the server to each committed mutation.
pub type Version = u64;

/// Per-session identifier of an open file.
pub type HandleId = u64;

/// Identifier assigned to a session on connect.
pub type SessionId = u64;

/// Kind of a namespace node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// Attribute snapshot of one node, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    /// Absolute, normalized path.
    pub path: String,
    /// File or directory.
    pub kind: NodeKind,
    /// Length in bytes (always 0 for directories).
    pub size: u64,
    /// Last modification time.
    pub modified_at: DateTime<Utc>,
    /// Permission bits.
    pub mode: u32,
    /// Version of the mutation that last changed this node.
    pub version: Version,
}

impl NodeAttr {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Base name of the node.
    pub fn name(&self) -> &str {
        crate::path::file_name(&self.path)
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Child name (no separators).
    pub name: String,
    /// Child attributes.
    pub attr: NodeAttr,
}

/// Access mode requested when opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

/// Creation semantics for `Open`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Create the file when it does not exist.
    #[serde(default)]
    pub create: bool,
    /// Fail with `AlreadyExists` when the file exists (requires `create`).
    #[serde(default)]
    pub exclusive: bool,
    /// Truncate an existing file to zero length.
    #[serde(default)]
    pub truncate: bool,
}

impl OpenFlags {
    /// Whether an open with these flags can change the namespace.
    pub fn may_mutate(&self) -> bool {
        self.create || self.truncate
    }
}

/// Default permission bits for new files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default permission bits for new directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;
