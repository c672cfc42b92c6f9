//! One TCP session with a filebox server.
//!
//! Requests are correlated by id: each caller parks a oneshot sender in the
//! pending map and the reader task completes it when the matching response
//! arrives. Pushed frames (events, pings, resets) are handed to a separate
//! channel so that event handling never runs on the request path.

use filebox_proto::{
    codec, ClientFrame, FsError, Request, Response, Result, Resync, ServerFrame, SessionId,
    Version, PROTOCOL_VERSION, UNCORRELATED_ID,
};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const OUTBOX_DEPTH: usize = 256;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Response>>>>>;

/// The server's answer to `Hello`.
#[derive(Debug, Clone)]
pub struct Welcome {
    pub session_id: SessionId,
    pub version: Version,
    pub resync: Resync,
}

pub struct Connection {
    outbox: mpsc::Sender<ClientFrame>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    session_id: SessionId,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Connect, say hello, and start the reader and writer tasks.
    ///
    /// Frames pushed by the server after the welcome are sent to `pushed`.
    pub async fn connect(
        addr: &str,
        last_version: Option<Version>,
        pushed: mpsc::UnboundedSender<ServerFrame>,
        budget: Duration,
    ) -> Result<(Self, Welcome)> {
        let stream = timeout(budget, TcpStream::connect(addr))
            .await
            .map_err(|_| FsError::Timeout)??;
        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", err);
        }
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let hello = ClientFrame {
            id: 1,
            request: Request::Hello {
                protocol: PROTOCOL_VERSION.to_string(),
                last_version,
            },
        };
        codec::write_frame(&mut write_half, &hello).await?;
        let welcome = timeout(budget, read_welcome(&mut reader))
            .await
            .map_err(|_| FsError::Timeout)??;
        debug!(
            "Joined {} as session {} at v{}",
            addr, welcome.session_id, welcome.version
        );

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
            pushed,
        ));
        let writer = tokio::spawn(write_loop(write_half, outbox_rx, Arc::clone(&closed)));

        Ok((
            Self {
                outbox,
                pending,
                next_id: AtomicU64::new(2),
                closed,
                session_id: welcome.session_id,
                reader,
                writer,
            },
            welcome,
        ))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Whether the connection has been lost.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send `request` and wait up to `budget` for its response.
    pub async fn request(&self, request: Request, budget: Duration) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // The reader marks the connection closed before failing the pending
        // map, so a request registered after that sees the flag here.
        if self.is_closed() {
            self.pending.lock().remove(&id);
            return Err(FsError::Disconnected);
        }

        trace!("-> {} {}", id, request.op_name());
        if self.outbox.send(ClientFrame { id, request }).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(FsError::Disconnected);
        }

        match timeout(budget, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FsError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(FsError::Timeout)
            }
        }
    }

    /// Send a frame that gets no response, such as `Ack`.
    pub async fn notify(&self, request: Request) -> Result<()> {
        self.outbox
            .send(ClientFrame {
                id: UNCORRELATED_ID,
                request,
            })
            .await
            .map_err(|_| FsError::Disconnected)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_welcome(reader: &mut BufReader<ReadHalf<TcpStream>>) -> Result<Welcome> {
    let frame: ServerFrame = codec::read_frame(reader)
        .await?
        .ok_or(FsError::Disconnected)?;
    match frame {
        ServerFrame::Response {
            result:
                Ok(Response::Welcome {
                    session_id,
                    version,
                    resync,
                }),
            ..
        } => Ok(Welcome {
            session_id,
            version,
            resync,
        }),
        ServerFrame::Response { result: Err(err), .. } => Err(err),
        other => Err(FsError::Protocol(format!(
            "expected welcome, got {:?}",
            other
        ))),
    }
}

async fn read_loop(
    mut reader: BufReader<ReadHalf<TcpStream>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    pushed: mpsc::UnboundedSender<ServerFrame>,
) {
    loop {
        let frame = match codec::read_frame::<_, ServerFrame>(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Server closed the connection");
                break;
            }
            Err(err) => {
                warn!("Connection lost: {}", err);
                break;
            }
        };
        match frame {
            ServerFrame::Response { id, result } => {
                trace!("<- {}", id);
                match pending.lock().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("Dropping response {} nobody waits for", id),
                }
            }
            other => {
                if pushed.send(other).is_err() {
                    break;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    let waiters: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(FsError::Disconnected));
    }
}

async fn write_loop(
    mut writer: WriteHalf<TcpStream>,
    mut outbox: mpsc::Receiver<ClientFrame>,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = outbox.recv().await {
        if let Err(err) = codec::write_frame(&mut writer, &frame).await {
            warn!("Failed to send frame {}: {}", frame.id, err);
            closed.store(true, Ordering::SeqCst);
            break;
        }
    }
}
