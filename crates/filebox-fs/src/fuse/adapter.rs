//! `fuser::Filesystem` implementation over a [`FileSystemDriver`].

use super::inode::{InodeMap, ROOT_INODE};
use crate::driver::FileSystemDriver;
use crate::errno::errno;
use filebox_proto::{path, AccessMode, FsError, NodeAttr, NodeKind, OpenFlags};
use fuser::consts::FOPEN_DIRECT_IO;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use log::{debug, trace, warn};
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Kernel-side attribute and entry caching is off; the driver's cache is
/// the one kept coherent by change events.
const TTL: Duration = Duration::ZERO;

/// Block size for filesystem statistics.
const BLOCK_SIZE: u32 = 512;

const MAX_NAME_LEN: u32 = 255;

/// FUSE filesystem backed by a filebox driver.
pub struct FileboxFuse<D: FileSystemDriver> {
    driver: D,
    inodes: InodeMap,
    /// User ID for file ownership (defaults to current user).
    uid: u32,
    /// Group ID for file ownership (defaults to current group).
    gid: u32,
}

fn access_mode(flags: i32) -> AccessMode {
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => AccessMode::Write,
        libc::O_RDWR => AccessMode::ReadWrite,
        _ => AccessMode::Read,
    }
}

impl<D: FileSystemDriver> FileboxFuse<D> {
    pub fn new(driver: D) -> Self {
        // Get current user/group IDs
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        Self {
            driver,
            inodes: InodeMap::new(),
            uid,
            gid,
        }
    }

    fn file_attr(&self, ino: u64, attr: &NodeAttr) -> FileAttr {
        let modified = SystemTime::from(attr.modified_at);
        let (kind, nlink) = match attr.kind {
            NodeKind::Directory => (FileType::Directory, 2),
            NodeKind::File => (FileType::RegularFile, 1),
        };
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: modified,
            mtime: modified,
            ctime: modified,
            crtime: modified,
            kind,
            perm: (attr.mode & 0o7777) as u16,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, FsError> {
        self.inodes
            .path(ino)
            .map(str::to_string)
            .ok_or_else(|| FsError::NotFound(format!("inode {}", ino)))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, FsError> {
        let name = name
            .to_str()
            .ok_or_else(|| FsError::InvalidPath(name.to_string_lossy().into_owned()))?;
        path::validate_name(name)?;
        Ok(path::join(&self.path_of(parent)?, name))
    }

    /// Fetch the attributes of `path` and the inode they belong to.
    fn entry(&mut self, path: &str) -> Result<FileAttr, FsError> {
        let attr = match self.driver.get_attributes(path) {
            Ok(attr) => attr,
            Err(err) => {
                if matches!(err, FsError::NotFound(_)) {
                    self.inodes.remove(path);
                }
                return Err(err);
            }
        };
        let ino = self.inodes.inode(path);
        Ok(self.file_attr(ino, &attr))
    }

    /// Like [`entry`](Self::entry), for replies that hand the kernel a
    /// lookup reference.
    fn lookup_entry(&mut self, path: &str) -> Result<FileAttr, FsError> {
        let attr = self.entry(path)?;
        self.inodes.lookup(path);
        Ok(attr)
    }

    fn lookup_path(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr, FsError> {
        let path = self.child_path(parent, name)?;
        self.lookup_entry(&path)
    }

    fn truncate_ino(&mut self, ino: u64, size: u64) -> Result<FileAttr, FsError> {
        let path = self.path_of(ino)?;
        self.driver.truncate(&path, size)?;
        self.entry(&path)
    }

    fn list(&mut self, ino: u64) -> Result<Vec<(u64, FileType, String)>, FsError> {
        let dir = self.path_of(ino)?;
        let entries = self.driver.read_directory(&dir)?;
        self.inodes
            .retain_children(&dir, entries.iter().map(|e| e.name.as_str()));
        let parent_ino = match path::parent(&dir) {
            Some(parent) => self.inodes.inode(parent),
            None => ROOT_INODE,
        };
        let mut listing = Vec::with_capacity(entries.len() + 2);
        listing.push((ino, FileType::Directory, ".".to_string()));
        listing.push((parent_ino, FileType::Directory, "..".to_string()));
        for entry in entries {
            let kind = if entry.attr.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            listing.push((self.inodes.inode(&entry.attr.path), kind, entry.name));
        }
        Ok(listing)
    }
}

impl<D: FileSystemDriver> Filesystem for FileboxFuse<D> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!("lookup(parent={}, name={:?})", parent, name);
        match self.lookup_path(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!("forget(ino={}, nlookup={})", ino, nlookup);
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!("getattr(ino={})", ino);
        let result = self.path_of(ino).and_then(|path| self.entry(&path));
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(errno(&err)),
        }
    }

    /// Only size changes are forwarded; other attribute updates are
    /// accepted and ignored.
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!("setattr(ino={}, size={:?})", ino, size);
        let result = match size {
            Some(size) => self.truncate_ino(ino, size),
            None => self.path_of(ino).and_then(|path| self.entry(&path)),
        };
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?})", parent, name);
        let result = self.child_path(parent, name).and_then(|path| {
            self.driver.create_directory(&path)?;
            self.lookup_entry(&path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let result = self.child_path(parent, name).and_then(|path| {
            self.driver.delete(&path)?;
            self.inodes.remove(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let result = self.child_path(parent, name).and_then(|path| {
            self.driver.delete_directory(&path)?;
            self.inodes.remove(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        let result = self.child_path(parent, name).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            self.driver.rename(&from, &to)?;
            self.inodes.rename(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!("open(ino={}, flags={:#x})", ino, flags);
        let open_flags = OpenFlags {
            truncate: flags & libc::O_TRUNC != 0,
            ..Default::default()
        };
        let result = self
            .path_of(ino)
            .and_then(|path| self.driver.open(&path, access_mode(flags), open_flags));
        match result {
            Ok(file) => reply.opened(file.handle, FOPEN_DIRECT_IO),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?})", parent, name);
        let open_flags = OpenFlags {
            create: true,
            exclusive: flags & libc::O_EXCL != 0,
            truncate: flags & libc::O_TRUNC != 0,
        };
        let result = self.child_path(parent, name).and_then(|path| {
            let file = self.driver.open(&path, access_mode(flags), open_flags)?;
            let ino = self.inodes.lookup(&path);
            Ok((self.file_attr(ino, &file.attr), file.handle))
        });
        match result {
            Ok((attr, handle)) => reply.created(&TTL, &attr, 0, handle, FOPEN_DIRECT_IO),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.driver.read(fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.driver.write(fh, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock: u64, reply: ReplyEmpty) {
        trace!("flush(ino={}, fh={})", ino, fh);
        match self.driver.flush(fh) {
            // Deleted while open; close(2) still succeeds.
            Ok(()) | Err(FsError::NotFound(_)) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        trace!("fsync(ino={}, fh={})", ino, fh);
        match self.driver.flush(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!("release(ino={}, fh={})", ino, fh);
        match self.driver.close(fh) {
            Ok(()) => reply.ok(),
            Err(err) => {
                warn!("release of handle {} failed: {}", fh, err);
                reply.error(errno(&err));
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!("readdir(ino={}, offset={})", ino, offset);
        let listing = match self.list(ino) {
            Ok(listing) => listing,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        // Skip to offset and add entries until buffer is full
        for (i, (ino, kind, name)) in listing.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    /// Sizes are not tracked server-wide; report a large, empty volume.
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        trace!("statfs");
        let blocks = u64::from(u32::MAX);
        reply.statfs(
            blocks,
            blocks,
            blocks,
            self.inodes.len() as u64,
            u64::from(u32::MAX),
            BLOCK_SIZE,
            MAX_NAME_LEN,
            BLOCK_SIZE,
        );
    }
}

fn mount_options() -> Vec<MountOption> {
    vec![
        MountOption::RW,
        MountOption::FSName("filebox".to_string()),
        MountOption::Subtype("filebox".to_string()),
    ]
}

/// Mount `driver` at `mount_point`.
///
/// This function blocks until the filesystem is unmounted.
///
/// # Example
///
/// ```ignore
/// use filebox_fs::{fuse, ClientAdapter, ClientConfig};
///
/// let runtime = tokio::runtime::Runtime::new()?;
/// let adapter = ClientAdapter::connect(ClientConfig::default(), runtime.handle().clone())?;
/// fuse::mount(adapter, "/mnt/shared")?;
/// ```
pub fn mount<D, P>(driver: D, mount_point: P) -> io::Result<()>
where
    D: FileSystemDriver + 'static,
    P: AsRef<Path>,
{
    let mount_point = mount_point.as_ref();
    debug!("Mounting filebox at {}", mount_point.display());
    fuser::mount2(FileboxFuse::new(driver), mount_point, &mount_options())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("FUSE mount failed: {}", e)))
}

/// Mount `driver` in the background and return a session handle.
///
/// The filesystem will remain mounted until the returned `BackgroundSession`
/// is dropped or `join()` is called on it.
pub fn mount_background<D, P>(driver: D, mount_point: P) -> io::Result<fuser::BackgroundSession>
where
    D: FileSystemDriver + 'static,
    P: AsRef<Path>,
{
    let mount_point = mount_point.as_ref();
    debug!("Mounting filebox at {} (background)", mount_point.display());
    fuser::spawn_mount2(FileboxFuse::new(driver), mount_point, &mount_options())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("FUSE mount failed: {}", e)))
}
