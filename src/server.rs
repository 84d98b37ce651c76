//! TCP Server
//!
//! The server owns the listening socket and everything that runs beside it:
//! one task per client, the expiry sweeper, and the snapshot timer.
//!
//! ## Lifecycle
//!
//! ```text
//!   Created ──run()──► Running ──shutdown()──► ShuttingDown ──► Stopped
//! ```
//!
//! Shutdown closes the listener, lets every client finish the request it is
//! working on, waits for all client tasks, stops the background tasks and
//! writes a final snapshot.

use crate::commands::CommandHandler;
use crate::config::ServerConfig;
use crate::connection::{handle_connection, ConnectionStats};
use crate::persistence::{LoadOutcome, PersistenceResult, SnapshotManager};
use crate::storage::{ExpirySweeper, StorageEngine};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server was already started")]
    AlreadyStarted,
}

/// Requests shutdown of a running server from anywhere.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Asks the server to shut down; returns immediately.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

pub struct Server {
    config: ServerConfig,
    storage: Arc<StorageEngine>,
    snapshots: SnapshotManager,
    stats: Arc<ConnectionStats>,
    started: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    state_tx: watch::Sender<ServerState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Server {
    pub fn new(config: ServerConfig, storage: Arc<StorageEngine>) -> Self {
        let snapshots = SnapshotManager::new(config.snapshot_path.clone());
        let (state_tx, _) = watch::channel(ServerState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            storage,
            snapshots,
            stats: Arc::new(ConnectionStats::new()),
            started: AtomicBool::new(false),
            local_addr: OnceLock::new(),
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    pub fn state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    /// The bound address, once the server is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Restores the store from the configured snapshot file.
    pub fn load_snapshot(&self) -> PersistenceResult<LoadOutcome> {
        self.snapshots.load(&self.storage)
    }

    /// Waits until `run` has bound its socket and returns the address.
    ///
    /// Returns `None` if the server stopped without ever running, for
    /// example because the bind failed.
    pub async fn wait_until_running(&self) -> Option<SocketAddr> {
        let mut state_rx = self.state_tx.subscribe();
        state_rx
            .wait_for(|state| *state != ServerState::Created)
            .await
            .ok()?;
        self.local_addr()
    }

    /// Requests shutdown and waits until the server has stopped, including
    /// the final snapshot.
    pub async fn shutdown(&self) {
        self.shutdown_handle().shutdown();

        if !self.started.swap(true, Ordering::SeqCst) {
            // Never ran; nothing to drain or save
            self.set_state(ServerState::Stopped);
            return;
        }

        let mut state_rx = self.state_tx.subscribe();
        let _ = state_rx
            .wait_for(|state| *state == ServerState::Stopped)
            .await;
    }

    fn set_state(&self, state: ServerState) {
        self.state_tx.send_replace(state);
        info!(?state, "Server state changed");
    }

    /// Binds the listener and serves clients until shutdown is requested.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = self.config.bind_address();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.set_state(ServerState::Stopped);
                return Err(ServerError::Bind { addr, source });
            }
        };
        if let Ok(bound) = listener.local_addr() {
            let _ = self.local_addr.set(bound);
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.set_state(ServerState::Running);
        info!(address = %addr, "Listening for connections");

        let sweeper = ExpirySweeper::start(Arc::clone(&self.storage), self.config.expiry.clone());
        let mut snapshot_timer = self.snapshot_timer();
        let mut pending_dump: Option<JoinHandle<()>> = None;
        let mut workers = JoinSet::new();

        let mut stopping = *shutdown_rx.borrow_and_update();
        while !stopping {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, client)) => {
                        workers.spawn(handle_connection(
                            stream,
                            client,
                            CommandHandler::new(Arc::clone(&self.storage)),
                            Arc::clone(&self.stats),
                            self.shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = next_tick(&mut snapshot_timer) => {
                    if pending_dump.as_ref().is_some_and(|dump| !dump.is_finished()) {
                        warn!("Previous snapshot still in progress, skipping");
                    } else {
                        pending_dump = Some(self.spawn_dump());
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    stopping = changed.is_err() || *shutdown_rx.borrow();
                }
            }
        }

        self.set_state(ServerState::ShuttingDown);
        drop(listener);

        let draining = workers.len();
        if draining > 0 {
            info!(connections = draining, "Waiting for connections to finish");
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connection task failed");
            }
        }

        if let Some(dump) = pending_dump {
            let _ = dump.await;
        }
        drop(snapshot_timer);
        sweeper.stop();

        info!("Saving final snapshot");
        if let Err(e) = self.spawn_dump().await {
            error!(error = %e, "Final snapshot task failed");
        }

        self.set_state(ServerState::Stopped);
        info!(
            connections = self.stats.connections_accepted.load(Ordering::Relaxed),
            commands = self.stats.commands_processed.load(Ordering::Relaxed),
            "Server stopped"
        );
        Ok(())
    }

    fn snapshot_timer(&self) -> Option<Interval> {
        let period = self.config.snapshot_interval;
        if period.is_zero() {
            return None;
        }
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(timer)
    }

    /// Writes a snapshot on the blocking pool; failures are logged.
    fn spawn_dump(&self) -> JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let snapshots = self.snapshots.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = snapshots.dump(&storage) {
                error!(error = %e, "Snapshot failed");
            }
        })
    }
}

/// Resolves on the next tick, or never when periodic snapshots are off.
async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            port: 0,
            snapshot_path: dir.join("dump.my_rdb"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_state_machine() {
        let dir = tempdir().unwrap();
        let server = Arc::new(Server::new(
            test_config(dir.path()),
            Arc::new(StorageEngine::new()),
        ));
        assert_eq!(server.state(), ServerState::Created);

        let runner = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });

        let addr = server.wait_until_running().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.state(), ServerState::Running);
        assert!(matches!(server.run().await, Err(ServerError::AlreadyStarted)));

        server.shutdown().await;
        assert_eq!(server.state(), ServerState::Stopped);
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_writes_final_snapshot() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(StorageEngine::new());
        let server = Arc::new(Server::new(test_config(dir.path()), Arc::clone(&storage)));

        let runner = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });
        let addr = server.wait_until_running().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nsaved\r\n$3\r\nyes\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");

        // An idle client does not hold up shutdown
        server.shutdown_handle().shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(server.state(), ServerState::Stopped);

        let restored = StorageEngine::new();
        SnapshotManager::new(dir.path().join("dump.my_rdb"))
            .load(&restored)
            .unwrap();
        assert_eq!(restored.get(b"saved"), Some(Bytes::from("yes")));
    }

    #[tokio::test]
    async fn test_periodic_snapshots() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(StorageEngine::new());
        storage.set(Bytes::from("k"), Bytes::from("v"));

        let config = ServerConfig {
            snapshot_interval: Duration::from_millis(50),
            ..test_config(dir.path())
        };
        let server = Arc::new(Server::new(config, storage));
        let runner = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });
        server.wait_until_running().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(dir.path().join("dump.my_rdb").exists());

        server.shutdown().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_stops_server() {
        let dir = tempdir().unwrap();
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let config = ServerConfig {
            port: taken,
            ..test_config(dir.path())
        };
        let server = Server::new(config, Arc::new(StorageEngine::new()));

        assert!(matches!(server.run().await, Err(ServerError::Bind { .. })));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.wait_until_running().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let dir = tempdir().unwrap();
        let server = Server::new(test_config(dir.path()), Arc::new(StorageEngine::new()));

        server.shutdown().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(server.run().await, Err(ServerError::AlreadyStarted)));
        assert!(!dir.path().join("dump.my_rdb").exists());
    }
}
