//! Disk reconciler: turns changes made directly in the storage root into
//! sequencer intents.
//!
//! ```text
//!   notify callback ──try_send──▶ debounce task ──Reconcile{path}──▶ sequencer
//!                                      ▲
//!             startup / periodic rescan / overflow ──Reconcile{/, deep}
//! ```
//!
//! The reconciler never touches the tree itself. The sequencer compares disk
//! and tree when the intent is applied, so an echo of a protocol write is a
//! no-op there.

use crate::config::ReconcilerConfig;
use crate::namespace::Origin;
use crate::sequencer::{Mutation, Sequencer};
use crate::store::ContentStore;
use filebox_proto::path;
use log::{debug, info, trace, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Capacity of the watcher → debounce queue.
const WATCH_QUEUE: usize = 4096;

/// Running reconciler. Dropping it stops the watcher.
pub struct ReconcilerHandle {
    _watcher: RecommendedWatcher,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop the watcher and the debounce task.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

/// Start watching the store root. Must be called within a tokio runtime.
pub fn start(
    store: &ContentStore,
    sequencer: Sequencer,
    config: &ReconcilerConfig,
) -> io::Result<ReconcilerHandle> {
    let (tx, rx) = mpsc::channel::<String>(WATCH_QUEUE);
    let overflow = Arc::new(AtomicBool::new(false));

    let callback_store = store.clone();
    let callback_overflow = Arc::clone(&overflow);
    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| {
            let event = match result {
                Ok(event) => event,
                Err(err) => {
                    warn!("Watcher error: {}", err);
                    callback_overflow.store(true, Ordering::Release);
                    return;
                }
            };
            if event.need_rescan() {
                callback_overflow.store(true, Ordering::Release);
                return;
            }
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            for disk_path in &event.paths {
                let Some(path) = callback_store.namespace_path(disk_path) else {
                    continue;
                };
                if tx.try_send(path).is_err() {
                    callback_overflow.store(true, Ordering::Release);
                }
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    watcher
        .watch(store.base_dir(), RecursiveMode::Recursive)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(debounce_loop(
        rx,
        shutdown_rx,
        sequencer,
        overflow,
        config.clone(),
    ));

    info!("Watching {} for direct changes", store.base_dir().display());

    Ok(ReconcilerHandle {
        _watcher: watcher,
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

async fn debounce_loop(
    mut rx: mpsc::Receiver<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
    sequencer: Sequencer,
    overflow: Arc<AtomicBool>,
    config: ReconcilerConfig,
) {
    let mut pending: BTreeSet<String> = BTreeSet::new();
    let mut deadline: Option<Instant> = None;
    let mut rescan = config.rescan_interval().map(|period| {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    // Catch edits made between loading the tree and starting the watcher.
    if submit(&sequencer, path::ROOT.to_string(), true).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Reconciler shutting down");
                break;
            }
            Some(path) = rx.recv() => {
                trace!("Disk change at {}", path);
                pending.insert(path);
                if deadline.is_none() {
                    deadline = Some(Instant::now() + config.debounce());
                }
            }
            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                for path in std::mem::take(&mut pending) {
                    if submit(&sequencer, path, false).await.is_err() {
                        return;
                    }
                }
            }
            _ = tick(&mut rescan) => {
                overflow.store(true, Ordering::Release);
            }
        }

        if overflow.swap(false, Ordering::AcqRel) {
            debug!("Rescanning storage root");
            if submit(&sequencer, path::ROOT.to_string(), true).await.is_err() {
                return;
            }
        }
    }
}

async fn submit(sequencer: &Sequencer, path: String, deep: bool) -> Result<(), ()> {
    sequencer
        .enqueue(Mutation::Reconcile { path, deep }, Origin::Reconciler)
        .await
        .map_err(|_| {
            debug!("Sequencer gone; reconciler stopping");
        })
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn edits_before_the_watch_are_picked_up() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path()).unwrap();
        let namespace = Arc::new(Namespace::load(store, 16, 16).unwrap());
        let (sequencer, thread) = Sequencer::start(Arc::clone(&namespace), 8).unwrap();

        // Written after the load but before anything watches the root.
        std::fs::write(temp.path().join("early.txt"), b"early").unwrap();

        let config = ReconcilerConfig {
            enabled: true,
            debounce_ms: 10,
            rescan_interval_ms: 0,
        };
        let handle = start(namespace.store(), sequencer.clone(), &config).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok((attr, _)) = namespace.attributes("/early.txt") {
                assert_eq!(attr.size, 5);
                break;
            }
            assert!(Instant::now() < deadline, "early edit never reached the tree");
            time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(namespace.version(), 1);

        handle.shutdown().await;
        drop(sequencer);
        tokio::task::spawn_blocking(move || thread.join().unwrap())
            .await
            .unwrap();
    }
}
