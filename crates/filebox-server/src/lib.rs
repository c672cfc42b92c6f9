//! # filebox-server
//!
//! Authoritative server for a shared filebox namespace.
//!
//! This crate provides:
//! - A disk-backed content store under one storage root
//! - The in-memory namespace tree and its published event stream
//! - The mutation sequencer, the single point where changes are ordered
//! - A disk reconciler that folds direct edits of the storage root back in
//! - Sessions serving the line-delimited JSON protocol over TCP
//!
//! ## Example
//!
//! ```ignore
//! use filebox_server::{serve_background, ServerConfig};
//!
//! let config = ServerConfig {
//!     listen: "127.0.0.1:0".parse()?,
//!     root: "/srv/filebox".into(),
//!     ..Default::default()
//! };
//! let server = serve_background(config).await?;
//! println!("listening on {}", server.addr());
//! server.shutdown();
//! ```

pub mod config;
pub mod handles;
pub mod namespace;
pub mod reconciler;
pub mod sequencer;
pub mod server;
pub mod session;
pub mod store;
pub mod tree;

pub use config::{ConfigError, ReconcilerConfig, ServerConfig, DEFAULT_PORT};
pub use namespace::{Namespace, Origin};
pub use sequencer::{Commit, Mutation, Sequencer};
pub use server::{serve, serve_background, FileboxServer, ServerError};
pub use store::{ContentStore, StoreError};
