//! Session manager: one connected mount.
//!
//! Each session runs three tasks:
//!
//! - the request loop (this task), which reads client frames in order,
//!   serves read-only queries directly and routes mutations through the
//!   sequencer,
//! - a forwarder, which turns published change events into push frames and
//!   sends liveness pings,
//! - a writer, which owns the socket's write half and serializes every
//!   outgoing frame.
//!
//! Responses and push frames share the socket but never a task, so an event
//! can reach the client while one of its own requests is in flight.

use crate::handles::HandleTable;
use crate::namespace::{Namespace, Origin, Published};
use crate::sequencer::{Mutation, Sequencer};
use chrono::{DateTime, Utc};
use filebox_proto::{
    codec, path, ClientFrame, FsError, Request, Response, Result, ServerFrame, SessionId, Version,
    DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, MAX_READ_LENGTH, PROTOCOL_VERSION,
};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

/// Capacity of a session's outgoing frame queue.
const OUTBOX_DEPTH: usize = 256;

/// What the server tracks about a connected session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    /// Highest version the client acknowledged.
    pub last_acked: Version,
    pub connected_at: DateTime<Utc>,
}

/// Every connected session.
#[derive(Debug)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, SessionInfo>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, peer: SocketAddr, joined_at: Version) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(
            id,
            SessionInfo {
                peer,
                last_acked: joined_at,
                connected_at: Utc::now(),
            },
        );
        id
    }

    pub fn acknowledge(&self, id: SessionId, version: Version) {
        if let Some(info) = self.sessions.lock().get_mut(&id) {
            info.last_acked = info.last_acked.max(version);
        }
    }

    pub fn remove(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.lock().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// Shared state every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub namespace: Arc<Namespace>,
    pub sequencer: Sequencer,
    pub registry: Arc<SessionRegistry>,
    pub ping_interval: Duration,
    pub push_to_originator: bool,
}

/// Serve one connection until the client leaves, a protocol error occurs or
/// `shutdown` flips.
pub async fn run_session<S>(
    stream: S,
    peer: SocketAddr,
    ctx: SessionContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let hello: ClientFrame = match codec::read_frame(&mut reader).await? {
        Some(frame) => frame,
        None => return Ok(()),
    };
    let last_version = match hello.request {
        Request::Hello {
            protocol,
            last_version,
        } if protocol == PROTOCOL_VERSION => last_version,
        other => {
            let err = FsError::Protocol(format!(
                "expected {} hello, got {}",
                PROTOCOL_VERSION,
                other.op_name()
            ));
            let reply = ServerFrame::Response {
                id: hello.id,
                result: Err(err.clone()),
            };
            let _ = codec::write_frame(&mut write_half, &reply).await;
            return Err(err);
        }
    };

    let (version, resync, events) = ctx.namespace.join(last_version);
    let session_id = ctx.registry.register(peer, version);
    info!("Session {} joined from {} at v{}", session_id, peer, version);

    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOX_DEPTH);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(err) = codec::write_frame(&mut write_half, &frame).await {
                debug!("Write failed: {}", err);
                break;
            }
        }
    });

    // The welcome goes out before the forwarder exists, so it precedes
    // every live event.
    let welcome = ServerFrame::Response {
        id: hello.id,
        result: Ok(Response::Welcome {
            session_id,
            version,
            resync,
        }),
    };
    let forwarder = if out_tx.send(welcome).await.is_ok() {
        Some(tokio::spawn(forward_events(
            events,
            out_tx.clone(),
            Arc::clone(&ctx.namespace),
            session_id,
            version,
            ctx.ping_interval,
            ctx.push_to_originator,
        )))
    } else {
        None
    };

    let mut handles = HandleTable::new();
    let outcome = loop {
        let frame = tokio::select! {
            frame = codec::read_frame::<_, ClientFrame>(&mut reader) => frame,
            _ = shutdown.changed() => break Ok(()),
        };
        let ClientFrame { id, request } = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(FsError::Disconnected) => break Ok(()),
            Err(err) => break Err(err),
        };

        if let Request::Ack { version } = request {
            trace!("Session {} acked v{}", session_id, version);
            ctx.registry.acknowledge(session_id, version);
            continue;
        }
        if let Request::Hello { .. } = request {
            let err = FsError::Protocol("duplicate hello".to_string());
            let _ = out_tx
                .send(ServerFrame::Response {
                    id,
                    result: Err(err.clone()),
                })
                .await;
            break Err(err);
        }

        trace!("Session {} request {} {}", session_id, id, request.op_name());
        let result = handle_request(&ctx, session_id, &mut handles, request).await;
        if let Err(err) = &result {
            trace!("Session {} request {} failed: {}", session_id, id, err);
        }
        if out_tx.send(ServerFrame::Response { id, result }).await.is_err() {
            break Ok(());
        }
    };

    let released = handles.drain();
    if !released.is_empty() {
        debug!(
            "Session {} released {} open handles",
            session_id,
            released.len()
        );
    }
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    ctx.registry.remove(session_id);

    match &outcome {
        Ok(()) => info!("Session {} closed", session_id),
        Err(err) => warn!("Session {} terminated: {}", session_id, err),
    }
    outcome
}

async fn forward_events(
    mut events: broadcast::Receiver<Published>,
    out: mpsc::Sender<ServerFrame>,
    namespace: Arc<Namespace>,
    session_id: SessionId,
    joined_at: Version,
    ping_interval: Duration,
    push_to_originator: bool,
) {
    let mut ping = time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            received = events.recv() => match received {
                Ok(published) => {
                    if published.event.version <= joined_at {
                        continue;
                    }
                    if !push_to_originator && published.origin == Origin::Session(session_id) {
                        continue;
                    }
                    ServerFrame::Event {
                        event: (*published.event).clone(),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Session {} lagged by {} events; resetting", session_id, skipped);
                    ServerFrame::Reset {
                        version: namespace.version(),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ping.tick() => ServerFrame::Ping {
                version: namespace.version(),
            },
        };
        if out.send(frame).await.is_err() {
            break;
        }
    }
}

async fn handle_request(
    ctx: &SessionContext,
    session_id: SessionId,
    handles: &mut HandleTable,
    request: Request,
) -> Result<Response> {
    let origin = Origin::Session(session_id);
    let namespace = &ctx.namespace;

    match request {
        Request::GetAttributes { path } => {
            let path = path::normalize(&path)?;
            let (attr, as_of) = namespace.attributes(&path)?;
            Ok(Response::Attributes { attr, as_of })
        }
        Request::ReadDirectory { path } => {
            let path = path::normalize(&path)?;
            let (entries, as_of) = namespace.list(&path)?;
            Ok(Response::Entries { entries, as_of })
        }
        Request::Open { path, mode, flags } => {
            let path = path::normalize(&path)?;
            let (node, attr, committed) = if flags.may_mutate() {
                let commit = ctx
                    .sequencer
                    .submit(
                        Mutation::Open {
                            path: path.clone(),
                            flags,
                            mode: DEFAULT_FILE_MODE,
                        },
                        origin,
                    )
                    .await?;
                let committed = (!commit.events.is_empty()).then_some(commit.version);
                let (node, attr) = commit.target.ok_or(FsError::NotFound(path))?;
                (node, attr, committed)
            } else {
                let tree = namespace.tree();
                let node = tree.lookup(&path)?;
                if node.is_dir() {
                    return Err(FsError::IsADirectory(path));
                }
                (node.id, node.attr(&path), None)
            };
            let handle = handles.open(node, mode);
            Ok(Response::Opened {
                handle,
                attr,
                committed,
            })
        }
        Request::Read {
            handle,
            offset,
            length,
        } => {
            let open = handles.for_read(handle)?;
            let position = offset.unwrap_or(open.offset);
            let length = length.min(MAX_READ_LENGTH) as usize;
            let data = namespace.read(open.node, position, length)?;
            open.offset = position + data.len() as u64;
            Ok(Response::Data { data })
        }
        Request::Write {
            handle,
            offset,
            data,
        } => {
            let (node, position) = {
                let open = handles.for_write(handle)?;
                (open.node, offset.unwrap_or(open.offset))
            };
            let written = data.len();
            let commit = ctx
                .sequencer
                .submit(
                    Mutation::Write {
                        node,
                        offset: position,
                        data,
                    },
                    origin,
                )
                .await?;
            if let Ok(open) = handles.get_mut(handle) {
                open.offset = position + written as u64;
                open.dirty = true;
            }
            let size = commit.target.map_or(position + written as u64, |(_, attr)| attr.size);
            Ok(Response::Written {
                written: u32::try_from(written).unwrap_or(u32::MAX),
                size,
                version: commit.version,
            })
        }
        Request::Flush { handle } => {
            let node = handles.get(handle)?.node;
            let commit = ctx.sequencer.submit(Mutation::Flush { node }, origin).await?;
            if let Ok(open) = handles.get_mut(handle) {
                open.dirty = false;
            }
            Ok(Response::Done {
                version: commit.version,
            })
        }
        Request::Close { handle } => {
            let closed = handles.close(handle)?;
            if !closed.dirty {
                return Ok(Response::Done {
                    version: namespace.version(),
                });
            }
            match ctx
                .sequencer
                .submit(Mutation::Flush { node: closed.node }, origin)
                .await
            {
                Ok(commit) => Ok(Response::Done {
                    version: commit.version,
                }),
                // Deleted while open; nothing left to flush.
                Err(FsError::NotFound(_)) => Ok(Response::Done {
                    version: namespace.version(),
                }),
                Err(err) => Err(err),
            }
        }
        Request::Truncate { path, size } => {
            let path = path::normalize(&path)?;
            mutate(ctx, Mutation::Truncate { path, size }, origin).await
        }
        Request::Delete { path } => {
            let path = path::normalize(&path)?;
            mutate(ctx, Mutation::Delete { path }, origin).await
        }
        Request::CreateDirectory { path, mode } => {
            let path = path::normalize(&path)?;
            let mode = mode.unwrap_or(DEFAULT_DIR_MODE);
            mutate(ctx, Mutation::CreateDirectory { path, mode }, origin).await
        }
        Request::DeleteDirectory { path } => {
            let path = path::normalize(&path)?;
            mutate(ctx, Mutation::DeleteDirectory { path }, origin).await
        }
        Request::Rename { from, to } => {
            let from = path::normalize(&from)?;
            let to = path::normalize(&to)?;
            mutate(ctx, Mutation::Rename { from, to }, origin).await
        }
        Request::Hello { .. } | Request::Ack { .. } => {
            Err(FsError::Protocol("unexpected control request".to_string()))
        }
    }
}

async fn mutate(ctx: &SessionContext, mutation: Mutation, origin: Origin) -> Result<Response> {
    let commit = ctx.sequencer.submit(mutation, origin).await?;
    Ok(Response::Done {
        version: commit.version,
    })
}
