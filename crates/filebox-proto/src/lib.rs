//! # filebox-proto
//!
//! Data model and wire protocol shared by the filebox server and mounts.
//!
//! This crate provides:
//! - Node attributes, directory entries and handle/access types
//! - [`ChangeEvent`], the ordered record of one committed mutation
//! - [`FsError`], the error taxonomy used on both ends of the wire
//! - Request/response and push frames, and their line-delimited JSON codec
//!
//! ## Example
//!
//! ```ignore
//! use filebox_proto::{codec, ClientFrame, Request};
//!
//! let frame = ClientFrame {
//!     id: 1,
//!     request: Request::GetAttributes { path: "/mydir0".into() },
//! };
//! codec::write_frame(&mut stream, &frame).await?;
//! ```

pub mod codec;
mod error;
mod event;
mod message;
pub mod path;
mod types;

pub use error::{FsError, Result};
pub use event::{ChangeEvent, ChangeKind};
pub use message::{
    ClientFrame, Request, Response, Resync, ServerFrame, MAX_READ_LENGTH, PROTOCOL_VERSION,
    UNCORRELATED_ID,
};
pub use types::{
    AccessMode, DirEntry, HandleId, NodeAttr, NodeKind, OpenFlags, SessionId, Version,
    DEFAULT_DIR_MODE, DEFAULT_FILE_MODE,
};
