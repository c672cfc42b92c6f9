//! # filebox-fs
//!
//! Client side of filebox: a blocking [`ClientAdapter`] that speaks the
//! filebox protocol and caches attributes and listings until the server
//! pushes a change that invalidates them, plus a FUSE mount built on it.
//!
//! ## Features
//!
//! - `fuse`: FUSE filesystem support via the [`fuse`] module
//! - `cli`: the `filebox-mount` binary
//!
//! ## Example
//!
//! ```ignore
//! use filebox_fs::{ClientAdapter, ClientConfig, FileSystemDriver};
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let adapter = ClientAdapter::connect(ClientConfig::default(), runtime.handle().clone())?;
//! for entry in adapter.read_directory("/")? {
//!     println!("{} ({} bytes)", entry.name, entry.attr.size);
//! }
//! ```

pub mod adapter;
pub mod cache;
pub mod config;
pub mod connection;
pub mod driver;
pub mod errno;

#[cfg(feature = "fuse")]
pub mod fuse;

pub use adapter::ClientAdapter;
pub use cache::AttrCache;
pub use config::{ClientConfig, ConfigError, DEFAULT_SERVER};
pub use connection::{Connection, Welcome};
pub use driver::{FileSystemDriver, OpenFile};
pub use errno::errno;
