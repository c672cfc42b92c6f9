//! Content store: file bytes and metadata on the server's local disk.
//!
//! Every method takes a normalized namespace path (`/a/b.txt`) and resolves
//! it beneath the storage root. The store knows nothing about versions or
//! sessions; ordering is the sequencer's job.
//!
//! Symbolic links are not part of the namespace: listings skip them and no
//! operation resolves a path through one.

use chrono::{DateTime, Utc};
use filebox_proto::{path as ns_path, FsError, NodeKind};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid relative path: {0}")]
    InvalidPath(String),
    #[error("storage root is not a directory: {0}")]
    NotADirectory(String),
    #[error("symbolic link in path: {0}")]
    Symlink(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPath(path) => FsError::InvalidPath(path),
            StoreError::NotADirectory(path) => FsError::NotADirectory(path),
            StoreError::Symlink(path) => FsError::InvalidPath(path),
            StoreError::Io(err) => FsError::IoFailure(err.to_string()),
        }
    }
}

/// Length and mtime of a file as last observed on disk.
///
/// Two equal stamps mean the reconciler has nothing new to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskStamp {
    pub len: u64,
    pub modified: SystemTime,
}

/// Metadata of one disk entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskMeta {
    pub kind: NodeKind,
    pub len: u64,
    pub modified: SystemTime,
    pub mode: u32,
}

impl DiskMeta {
    fn from_metadata(metadata: &fs::Metadata) -> Option<Self> {
        let kind = if metadata.is_dir() {
            NodeKind::Directory
        } else if metadata.is_file() {
            NodeKind::File
        } else {
            return None;
        };
        let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
        Some(Self {
            kind,
            len: if kind == NodeKind::File { metadata.len() } else { 0 },
            modified,
            mode: metadata.permissions().mode() & 0o7777,
        })
    }

    pub fn stamp(&self) -> DiskStamp {
        DiskStamp {
            len: self.len,
            modified: self.modified,
        }
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.modified)
    }
}

/// Disk-backed content store rooted at one directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    base_dir: PathBuf,
}

impl ContentStore {
    /// Open a store over an existing directory.
    pub fn open<P: Into<PathBuf>>(base_dir: P) -> StoreResult<Self> {
        let base_dir = base_dir.into();
        let metadata = fs::metadata(&base_dir)?;
        if !metadata.is_dir() {
            return Err(StoreError::NotADirectory(base_dir.display().to_string()));
        }
        let base_dir = base_dir.canonicalize()?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a namespace path to its location on disk.
    pub fn disk_path(&self, path: &str) -> StoreResult<PathBuf> {
        let rel = normalize_relative_path(path)?;
        Ok(self.base_dir.join(rel))
    }

    /// Resolve `path` for an operation, refusing any component that is a
    /// symbolic link. Components past the first missing one are not checked.
    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let rel = normalize_relative_path(path)?;
        let mut probe = self.base_dir.clone();
        for component in rel.components() {
            probe.push(component);
            match fs::symlink_metadata(&probe) {
                Ok(metadata) if metadata.file_type().is_symlink() => {
                    return Err(StoreError::Symlink(path.to_string()));
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(self.base_dir.join(rel))
    }

    /// Open a file without following a link at the leaf.
    fn open_file(&self, path: &str, options: &mut OpenOptions) -> StoreResult<File> {
        let disk_path = self.resolve(path)?;
        Ok(options.custom_flags(libc::O_NOFOLLOW).open(disk_path)?)
    }

    /// Map a location on disk back to its namespace path.
    ///
    /// Returns `None` for paths outside the root or with non-UTF-8 names.
    pub fn namespace_path(&self, disk_path: &Path) -> Option<String> {
        let rel = disk_path.strip_prefix(&self.base_dir).ok()?;
        let mut path = String::from(ns_path::ROOT);
        for component in rel.components() {
            match component {
                Component::Normal(name) => {
                    path = ns_path::join(&path, name.to_str()?);
                }
                _ => return None,
            }
        }
        Some(path)
    }

    /// Stat an entry; `Ok(None)` when it does not exist, is reached through
    /// a link or is neither a regular file nor a directory.
    pub fn stat(&self, path: &str) -> StoreResult<Option<DiskMeta>> {
        let disk_path = match self.resolve(path) {
            Ok(disk_path) => disk_path,
            Err(StoreError::Symlink(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        match fs::symlink_metadata(&disk_path) {
            Ok(metadata) => Ok(DiskMeta::from_metadata(&metadata)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Read up to `len` bytes at `offset`. Short reads happen only at EOF.
    pub fn read_at(&self, path: &str, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let file = self.open_file(path, OpenOptions::new().read(true))?;
        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match file.read_at(&mut buffer[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Write `data` at `offset` into an existing file.
    pub fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> StoreResult<DiskMeta> {
        let file = self.open_file(path, OpenOptions::new().write(true))?;
        file.write_all_at(data, offset)?;
        meta_of(&file)
    }

    /// Create a regular file if missing, optionally truncating it.
    pub fn create_file(&self, path: &str, mode: u32, truncate: bool) -> StoreResult<DiskMeta> {
        let file = self.open_file(
            path,
            OpenOptions::new().write(true).create(true).truncate(truncate),
        )?;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        meta_of(&file)
    }

    /// Set the length of an existing file.
    pub fn truncate(&self, path: &str, size: u64) -> StoreResult<DiskMeta> {
        let file = self.open_file(path, OpenOptions::new().write(true))?;
        file.set_len(size)?;
        meta_of(&file)
    }

    /// Flush a file's data to stable storage.
    pub fn sync(&self, path: &str) -> StoreResult<DiskMeta> {
        let file = self.open_file(path, OpenOptions::new().read(true))?;
        file.sync_all()?;
        meta_of(&file)
    }

    /// Create a directory. An existing directory at the path is accepted.
    pub fn create_dir(&self, path: &str, mode: u32) -> StoreResult<DiskMeta> {
        let disk_path = self.resolve(path)?;
        match fs::create_dir(&disk_path) {
            Ok(()) => {}
            Err(err)
                if err.kind() == io::ErrorKind::AlreadyExists
                    && fs::symlink_metadata(&disk_path).map_or(false, |m| m.is_dir()) => {}
            Err(err) => return Err(err.into()),
        }
        fs::set_permissions(&disk_path, fs::Permissions::from_mode(mode))?;
        let metadata = fs::symlink_metadata(&disk_path)?;
        DiskMeta::from_metadata(&metadata)
            .ok_or_else(|| StoreError::InvalidPath(disk_path.display().to_string()))
    }

    pub fn remove_file(&self, path: &str) -> StoreResult<()> {
        fs::remove_file(self.resolve(path)?)?;
        Ok(())
    }

    pub fn remove_dir(&self, path: &str) -> StoreResult<()> {
        fs::remove_dir(self.resolve(path)?)?;
        Ok(())
    }

    /// Move an entry. The destination must not exist.
    pub fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        if fs::symlink_metadata(&to).is_ok() {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists on disk", to.display()),
            )));
        }
        fs::rename(from, to)?;
        Ok(())
    }

    /// Hash a file's full content, returning the digest and the metadata
    /// observed once the read finished.
    pub fn digest(&self, path: &str) -> StoreResult<(blake3::Hash, DiskMeta)> {
        let mut file = self.open_file(path, OpenOptions::new().read(true))?;
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut file, &mut hasher)?;
        let meta = meta_of(&file)?;
        Ok((hasher.finalize(), meta))
    }

    /// List a directory: child names with their metadata.
    ///
    /// Non-UTF-8 names, links and special files are skipped.
    pub fn list(&self, path: &str) -> StoreResult<Vec<(String, DiskMeta)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path)?)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // Does not traverse links.
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // Removed between read_dir and stat.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if let Some(meta) = DiskMeta::from_metadata(&metadata) {
                entries.push((name, meta));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

fn meta_of(file: &File) -> StoreResult<DiskMeta> {
    let metadata = file.metadata()?;
    DiskMeta::from_metadata(&metadata)
        .ok_or_else(|| StoreError::InvalidPath("not a regular file".to_string()))
}

fn normalize_relative_path(path: &str) -> StoreResult<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let rel = Path::new(trimmed);
    for component in rel.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::InvalidPath(path.to_string()));
            }
            _ => {}
        }
    }

    Ok(rel.to_path_buf())
}
