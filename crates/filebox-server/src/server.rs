//! TCP server hosting a filebox namespace.
//!
//! This module wires the pieces together: it loads the namespace from the
//! storage root, starts the sequencer thread and the disk reconciler, and
//! runs one session per accepted connection.

use crate::config::{ConfigError, ServerConfig};
use crate::namespace::Namespace;
use crate::reconciler::{self, ReconcilerHandle};
use crate::sequencer::Sequencer;
use crate::session::{run_session, SessionContext, SessionRegistry};
use crate::store::{ContentStore, StoreError};
use filebox_proto::Version;
use log::{debug, error, info};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("storage root: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A server running in the background.
pub struct FileboxServer {
    /// Server address.
    addr: SocketAddr,
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    namespace: Arc<Namespace>,
    registry: Arc<SessionRegistry>,
}

impl FileboxServer {
    /// Get the server's listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current namespace version.
    pub fn version(&self) -> Version {
        self.namespace.version()
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting, end every session and stop the reconciler.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Like [`shutdown`](Self::shutdown), but waits until the accept loop
    /// has finished tearing down.
    pub async fn shutdown_and_wait(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct Running {
    listener: TcpListener,
    ctx: SessionContext,
    reconciler: Option<ReconcilerHandle>,
}

async fn start(config: &ServerConfig) -> Result<Running, ServerError> {
    config.validate()?;
    let store = ContentStore::open(&config.root)?;
    let namespace = Arc::new(Namespace::load(
        store,
        config.history_limit,
        config.event_buffer,
    )?);
    let (sequencer, _thread) = Sequencer::start(Arc::clone(&namespace), config.queue_depth)?;

    // Bind before watching so a port conflict leaves nothing running.
    let listener = TcpListener::bind(config.listen).await?;

    let reconciler = if config.reconciler.enabled {
        Some(reconciler::start(
            namespace.store(),
            sequencer.clone(),
            &config.reconciler,
        )?)
    } else {
        info!("Disk reconciler disabled");
        None
    };

    let ctx = SessionContext {
        namespace,
        sequencer,
        registry: Arc::new(SessionRegistry::new()),
        ping_interval: config.ping_interval(),
        push_to_originator: config.push_to_originator,
    };
    Ok(Running {
        listener,
        ctx,
        reconciler,
    })
}

async fn accept_loop<F>(running: Running, stop: F)
where
    F: Future<Output = ()>,
{
    let Running {
        listener,
        ctx,
        reconciler,
    } = running;
    let (sessions_tx, sessions_rx) = watch::channel(false);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("Connection from {}", peer);
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!("set_nodelay failed for {}: {}", peer, err);
                        }
                        let ctx = ctx.clone();
                        let shutdown = sessions_rx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = run_session(stream, peer, ctx, shutdown).await {
                                debug!("Session from {} ended with error: {}", peer, err);
                            }
                        });
                    }
                    Err(err) => {
                        error!("Accept error: {}", err);
                    }
                }
            }
        }
    }

    info!("Shutting down");
    let _ = sessions_tx.send(true);
    if let Some(reconciler) = reconciler {
        reconciler.shutdown().await;
    }
}

/// Start a server and block until Ctrl+C.
///
/// # Example
///
/// ```ignore
/// use filebox_server::{serve, ServerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let config = ServerConfig {
///         root: "/srv/filebox".into(),
///         ..Default::default()
///     };
///     serve(config).await.unwrap();
/// }
/// ```
pub async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let running = start(&config).await?;
    let local_addr = running.listener.local_addr()?;

    info!("Serving {} on {}", config.root.display(), local_addr);
    info!("Press Ctrl+C to stop the server");

    accept_loop(running, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    })
    .await;
    Ok(())
}

/// Start a server in the background.
///
/// Returns a handle that can be used to get the server address and shut it
/// down. Use port 0 in `config.listen` to let the OS pick one.
pub async fn serve_background(config: ServerConfig) -> Result<FileboxServer, ServerError> {
    let running = start(&config).await?;
    let addr = running.listener.local_addr()?;
    let namespace = Arc::clone(&running.ctx.namespace);
    let registry = Arc::clone(&running.ctx.registry);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    info!("Server started on {}", addr);

    let task = tokio::spawn(accept_loop(running, async move {
        let _ = shutdown_rx.await;
    }));

    Ok(FileboxServer {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
        namespace,
        registry,
    })
}
