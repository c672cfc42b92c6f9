//! FUSE mount for filebox.
//!
//! This module exposes any [`FileSystemDriver`](crate::FileSystemDriver) as a
//! kernel filesystem. Files are opened with direct I/O, so every read and
//! write goes to the server and other hosts see changes as soon as they are
//! committed.
//!
//! # Example
//!
//! ```ignore
//! use filebox_fs::{fuse, ClientAdapter, ClientConfig};
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let adapter = ClientAdapter::connect(ClientConfig::default(), runtime.handle().clone())?;
//! fuse::mount(adapter, "/mnt/shared")?;
//! ```

mod adapter;
mod inode;

pub use adapter::*;
pub use inode::{InodeMap, ROOT_INODE};
