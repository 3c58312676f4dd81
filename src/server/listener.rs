//! TCP listener for the protocol bridge

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::handler::handle_connection;
use super::session::AuthMode;
use super::ServerError;
use crate::engine::EngineHandle;

/// Default time in-flight connections get to finish after shutdown
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before accepting again after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

type Registry = Arc<RwLock<HashMap<u32, SocketAddr>>>;

/// Protocol bridge bound to a local port
pub struct Bridge {
    listener: TcpListener,
    engine: EngineHandle,
    auth_mode: AuthMode,
    drain_timeout: Duration,
}

impl Bridge {
    /// Bind a listener on `host:port`
    pub async fn listen(
        host: &str,
        port: u16,
        engine: EngineHandle,
        auth_mode: AuthMode,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self::from_listener(listener, engine, auth_mode))
    }

    /// Serve on an already bound listener
    pub fn from_listener(listener: TcpListener, engine: EngineHandle, auth_mode: AuthMode) -> Self {
        Self {
            listener,
            engine,
            auth_mode,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Start accepting connections in the background
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));

        let task = tokio::spawn(self.run(shutdown_rx, registry.clone()));

        Ok(ServerHandle {
            addr,
            shutdown_tx,
            task,
            registry,
        })
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>, registry: Registry) {
        let Bridge {
            listener,
            engine,
            auth_mode,
            drain_timeout,
        } = self;
        let mut connections = JoinSet::new();
        let mut next_conn_id: u32 = 1;

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, port = addr.port(), "Bridge listening");
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!(error = %e, "Accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let connection_id = next_conn_id;
                    next_conn_id = next_conn_id.wrapping_add(1).max(1);

                    registry.write().insert(connection_id, peer_addr);
                    let engine = engine.clone();
                    let registry = registry.clone();
                    let shutdown = shutdown_rx.clone();

                    connections.spawn(async move {
                        handle_connection(stream, peer_addr, connection_id, engine, auth_mode, shutdown)
                            .await;
                        registry.write().remove(&connection_id);
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    tracing::info!("Bridge shutting down");
                    break;
                }
            }
        }

        // Stop accepting before waiting on in-flight connections
        drop(listener);

        let drained = tokio::time::timeout(drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "Aborting connections after drain timeout"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        registry.write().clear();
        tracing::info!("Bridge stopped");
    }
}

/// Handle to a running bridge
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    registry: Registry,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of client connections currently open
    pub fn open_connections(&self) -> usize {
        self.registry.read().len()
    }

    /// Stop accepting, close connections and wait for the accept loop to exit
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.shutdown_tx.send_replace(true);
        self.task.await?;
        Ok(())
    }

    /// Stop the accept loop immediately; open connections are dropped with it
    pub fn abort(&self) {
        self.shutdown_tx.send_replace(true);
        self.task.abort();
    }
}
