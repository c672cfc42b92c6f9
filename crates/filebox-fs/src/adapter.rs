//! Blocking client adapter with an event-invalidated cache.
//!
//! [`ClientAdapter`] turns filesystem calls into protocol requests. Calls
//! block the calling thread on a tokio runtime owned by the embedder, so
//! they must come from threads outside that runtime (FUSE worker threads,
//! or a plain test thread).
//!
//! A background task applies pushed change events to the cache and tracks
//! the highest version observed. After a lost connection the next call
//! reconnects, discards the cache and starts a new handle epoch: handles
//! from before the reconnect are rejected with `InvalidHandle`.

use crate::cache::AttrCache;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::driver::{FileSystemDriver, OpenFile};
use filebox_proto::{
    path, AccessMode, DirEntry, FsError, HandleId, NodeAttr, OpenFlags, Request, Response,
    Result, Resync, ServerFrame, Version, MAX_READ_LENGTH,
};
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

struct Link {
    connection: Arc<Connection>,
    epoch: u32,
}

/// State shared with the push-handling task.
struct Shared {
    cache: Mutex<AttrCache>,
    observed: Mutex<Version>,
    advanced: Condvar,
}

impl Shared {
    fn advance(&self, version: Version) {
        let mut observed = self.observed.lock();
        if version > *observed {
            *observed = version;
            self.advanced.notify_all();
        }
    }

    fn reset(&self, version: Version) {
        *self.observed.lock() = version;
        self.advanced.notify_all();
    }
}

pub struct ClientAdapter {
    config: ClientConfig,
    runtime: Handle,
    shared: Arc<Shared>,
    link: Mutex<Option<Link>>,
    /// Path each open handle was opened at.
    open_paths: Mutex<HashMap<HandleId, String>>,
}

fn encode_handle(epoch: u32, handle: HandleId) -> HandleId {
    (u64::from(epoch) << 32) | (handle & 0xFFFF_FFFF)
}

fn decode_handle(handle: HandleId) -> (u32, HandleId) {
    ((handle >> 32) as u32, handle & 0xFFFF_FFFF)
}

fn unexpected(op: &str, response: Response) -> FsError {
    FsError::Protocol(format!("unexpected response to {}: {:?}", op, response))
}

impl ClientAdapter {
    /// Connect to `config.server`, running network I/O on `runtime`.
    pub fn connect(config: ClientConfig, runtime: Handle) -> Result<Self> {
        let adapter = Self {
            shared: Arc::new(Shared {
                cache: Mutex::new(AttrCache::new(config.attr_ttl())),
                observed: Mutex::new(0),
                advanced: Condvar::new(),
            }),
            config,
            runtime,
            link: Mutex::new(None),
            open_paths: Mutex::new(HashMap::new()),
        };
        adapter.connection()?;
        Ok(adapter)
    }

    /// Highest version whose event has been applied locally.
    pub fn observed_version(&self) -> Version {
        *self.shared.observed.lock()
    }

    /// Block until `version` has been observed, or `budget` runs out.
    ///
    /// Returns whether the version was reached.
    pub fn wait_for_version(&self, version: Version, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        let mut observed = self.shared.observed.lock();
        while *observed < version {
            if self
                .shared
                .advanced
                .wait_until(&mut observed, deadline)
                .timed_out()
            {
                return *observed >= version;
            }
        }
        true
    }

    /// Session id of the current connection, if connected.
    pub fn session_id(&self) -> Option<u64> {
        self.link
            .lock()
            .as_ref()
            .filter(|link| !link.connection.is_closed())
            .map(|link| link.connection.session_id())
    }

    /// The live connection, reconnecting first if it was lost.
    fn connection(&self) -> Result<(Arc<Connection>, u32)> {
        let mut link = self.link.lock();
        if let Some(current) = link.as_ref() {
            if !current.connection.is_closed() {
                return Ok((Arc::clone(&current.connection), current.epoch));
            }
            if !self.config.reconnect {
                return Err(FsError::Disconnected);
            }
            info!("Reconnecting to {}", self.config.server);
        }

        let epoch = link.as_ref().map_or(1, |l| l.epoch.wrapping_add(1));
        let last_version = link.as_ref().map(|_| self.observed_version());
        let (pushed_tx, pushed_rx) = mpsc::unbounded_channel();
        let (connection, welcome) = self.runtime.block_on(Connection::connect(
            &self.config.server,
            last_version,
            pushed_tx,
            self.config.timeout(),
        ))?;

        match &welcome.resync {
            Resync::Current => {}
            Resync::Replay(events) => debug!("Missed {} events while away", events.len()),
            Resync::Snapshot(nodes) => debug!("Resynced from a snapshot of {} nodes", nodes.len()),
        }
        // The cache refills lazily whatever the resync mode was.
        self.shared.cache.lock().clear(welcome.version);
        self.shared.reset(welcome.version);
        self.open_paths.lock().clear();

        let connection = Arc::new(connection);
        self.runtime.spawn(handle_pushed(
            pushed_rx,
            Arc::clone(&self.shared),
            Arc::downgrade(&connection),
        ));
        info!(
            "Connected to {} (session {}, v{})",
            self.config.server, welcome.session_id, welcome.version
        );
        *link = Some(Link {
            connection: Arc::clone(&connection),
            epoch,
        });
        Ok((connection, epoch))
    }

    fn send(&self, connection: &Connection, request: Request) -> Result<Response> {
        self.runtime
            .block_on(connection.request(request, self.config.timeout()))
    }

    fn call(&self, request: Request) -> Result<Response> {
        let (connection, _) = self.connection()?;
        self.send(&connection, request)
    }

    /// Call on behalf of `handle`, rejecting handles from an earlier epoch.
    fn call_with_handle(
        &self,
        handle: HandleId,
        request: impl FnOnce(HandleId) -> Request,
    ) -> Result<Response> {
        let (epoch, server_handle) = decode_handle(handle);
        let (connection, current) = self.connection()?;
        if epoch != current {
            return Err(FsError::InvalidHandle(handle));
        }
        self.send(&connection, request(server_handle))
    }

    /// Send a mutation, then evict what it touched without waiting for the
    /// echo.
    fn mutate(&self, request: Request, paths: &[&str], subtree: bool) -> Result<Version> {
        let op = request.op_name();
        let result = self.call(request);
        self.shared.cache.lock().invalidate_mutation(paths, subtree);
        match result? {
            Response::Done { version } => {
                trace!("{} committed at v{}", op, version);
                Ok(version)
            }
            other => Err(unexpected(op, other)),
        }
    }

    fn evict_handle_path(&self, handle: HandleId) {
        if let Some(path) = self.open_paths.lock().get(&handle) {
            self.shared
                .cache
                .lock()
                .invalidate_mutation(&[path.as_str()], false);
        }
    }
}

impl FileSystemDriver for ClientAdapter {
    fn get_attributes(&self, path: &str) -> Result<NodeAttr> {
        let path = path::normalize(path)?;
        let (connection, _) = self.connection()?;
        let (cached, generation) = {
            let cache = self.shared.cache.lock();
            let cached = cache.attr(&path);
            (cached, cache.generation())
        };
        match cached {
            Some(Some(attr)) => return Ok(attr),
            Some(None) => return Err(FsError::NotFound(path)),
            None => {}
        }

        match self.send(
            &connection,
            Request::GetAttributes {
                path: path.clone(),
            },
        ) {
            Ok(Response::Attributes { attr, as_of }) => {
                self.shared
                    .cache
                    .lock()
                    .insert_attr(&path, Some(attr.clone()), as_of, generation);
                Ok(attr)
            }
            Ok(other) => Err(unexpected("get_attributes", other)),
            Err(FsError::NotFound(missing)) => {
                let as_of = self.observed_version();
                self.shared
                    .cache
                    .lock()
                    .insert_attr(&path, None, as_of, generation);
                Err(FsError::NotFound(missing))
            }
            Err(err) => Err(err),
        }
    }

    fn open(&self, path: &str, mode: AccessMode, flags: OpenFlags) -> Result<OpenFile> {
        let path = path::normalize(path)?;
        let (connection, epoch) = self.connection()?;
        let result = self.send(
            &connection,
            Request::Open {
                path: path.clone(),
                mode,
                flags,
            },
        );
        if flags.may_mutate() {
            self.shared
                .cache
                .lock()
                .invalidate_mutation(&[path.as_str()], false);
        }
        match result? {
            Response::Opened {
                handle,
                attr,
                committed,
            } => {
                if let Some(version) = committed {
                    trace!("open of {} committed at v{}", path, version);
                }
                let handle = encode_handle(epoch, handle);
                self.open_paths.lock().insert(handle, path);
                Ok(OpenFile { handle, attr })
            }
            other => Err(unexpected("open", other)),
        }
    }

    fn read(&self, handle: HandleId, offset: u64, length: u32) -> Result<Vec<u8>> {
        let length = length.min(MAX_READ_LENGTH);
        match self.call_with_handle(handle, |handle| Request::Read {
            handle,
            offset: Some(offset),
            length,
        })? {
            Response::Data { data } => Ok(data),
            other => Err(unexpected("read", other)),
        }
    }

    fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<u32> {
        let mut total: u32 = 0;
        let mut position = offset;
        for chunk in data.chunks(MAX_READ_LENGTH as usize) {
            let result = self.call_with_handle(handle, |handle| Request::Write {
                handle,
                offset: Some(position),
                data: chunk.to_vec(),
            });
            self.evict_handle_path(handle);
            match result? {
                Response::Written { written, .. } => {
                    total += written;
                    position += u64::from(written);
                    if (written as usize) < chunk.len() {
                        break;
                    }
                }
                other => return Err(unexpected("write", other)),
            }
        }
        Ok(total)
    }

    fn flush(&self, handle: HandleId) -> Result<()> {
        match self.call_with_handle(handle, |handle| Request::Flush { handle })? {
            Response::Done { .. } => Ok(()),
            other => Err(unexpected("flush", other)),
        }
    }

    fn close(&self, handle: HandleId) -> Result<()> {
        let result = self.call_with_handle(handle, |handle| Request::Close { handle });
        self.evict_handle_path(handle);
        self.open_paths.lock().remove(&handle);
        match result? {
            Response::Done { .. } => Ok(()),
            other => Err(unexpected("close", other)),
        }
    }

    fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let path = path::normalize(path)?;
        self.mutate(
            Request::Truncate {
                path: path.clone(),
                size,
            },
            &[path.as_str()],
            false,
        )
        .map(drop)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let path = path::normalize(path)?;
        self.mutate(
            Request::Delete { path: path.clone() },
            &[path.as_str()],
            false,
        )
        .map(drop)
    }

    fn create_directory(&self, path: &str) -> Result<()> {
        let path = path::normalize(path)?;
        self.mutate(
            Request::CreateDirectory {
                path: path.clone(),
                mode: None,
            },
            &[path.as_str()],
            false,
        )
        .map(drop)
    }

    fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = path::normalize(path)?;
        let (connection, _) = self.connection()?;
        let (cached, generation) = {
            let cache = self.shared.cache.lock();
            let cached = cache.listing(&path);
            (cached, cache.generation())
        };
        if let Some(entries) = cached {
            return Ok(entries);
        }

        match self.send(
            &connection,
            Request::ReadDirectory {
                path: path.clone(),
            },
        )? {
            Response::Entries { entries, as_of } => {
                self.shared
                    .cache
                    .lock()
                    .insert_listing(&path, &entries, as_of, generation);
                Ok(entries)
            }
            other => Err(unexpected("read_directory", other)),
        }
    }

    fn delete_directory(&self, path: &str) -> Result<()> {
        let path = path::normalize(path)?;
        self.mutate(
            Request::DeleteDirectory { path: path.clone() },
            &[path.as_str()],
            true,
        )
        .map(drop)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = path::normalize(from)?;
        let to = path::normalize(to)?;
        self.mutate(
            Request::Rename {
                from: from.clone(),
                to: to.clone(),
            },
            &[from.as_str(), to.as_str()],
            true,
        )
        .map(drop)
    }
}

/// Apply frames pushed by the server until the connection goes away.
async fn handle_pushed(
    mut pushed: mpsc::UnboundedReceiver<ServerFrame>,
    shared: Arc<Shared>,
    connection: Weak<Connection>,
) {
    while let Some(frame) = pushed.recv().await {
        match frame {
            ServerFrame::Event { event } => {
                trace!("Event v{} {:?} {}", event.version, event.kind, event.path);
                shared.cache.lock().apply_event(&event);
                shared.advance(event.version);
            }
            ServerFrame::Ping { version } => {
                let observed = *shared.observed.lock();
                trace!("Ping at v{} (observed v{})", version, observed);
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if let Err(err) = connection
                    .notify(Request::Ack { version: observed })
                    .await
                {
                    debug!("Failed to ack: {}", err);
                }
            }
            ServerFrame::Reset { version } => {
                warn!("Fell behind the server; discarding cache at v{}", version);
                shared.cache.lock().clear(version);
                shared.advance(version);
            }
            ServerFrame::Response { id, .. } => {
                debug!("Ignoring stray response {}", id);
            }
        }
    }
    debug!("Push handler stopped");
}
