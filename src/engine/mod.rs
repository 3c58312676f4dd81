//! Embedded database engine
//!
//! The engine is an in-memory SQLite database owned by a dedicated thread.
//! Everything else talks to it through a cloneable [`EngineHandle`], which
//! sends requests over a channel and awaits the reply:
//!
//! - protocol frames, executed in the caller's [`ContextId`]
//! - closures run directly against the connection (schema, seed, stubs)
//! - context release and shutdown
//!
//! Requests are served strictly one at a time, so frames from different
//! bridged connections never interleave inside a statement.
//!
//! Readiness is published on a watch channel. Callers that need the database
//! must await [`EngineHandle::ready`] first.

mod context;
mod error;
mod exec;
mod infer;
mod types;

pub use context::ContextId;
pub use error::{EngineError, EngineResult};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use exec::EngineState;

/// Lifecycle of the engine thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Starting,
    Ready,
    Failed(String),
    Stopped,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Enforce REFERENCES constraints
    pub foreign_keys: bool,
    /// Requests queued before senders wait
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            foreign_keys: true,
            channel_capacity: 256,
        }
    }
}

type Call = Box<dyn FnOnce(&Connection) + Send>;

enum Request {
    Frame {
        context: ContextId,
        frame: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Call(Call),
    Release {
        context: ContextId,
    },
    Shutdown {
        reply: oneshot::Sender<EngineResult<()>>,
    },
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Request>,
    status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Wait until the engine accepts work
    pub async fn ready(&self) -> EngineResult<()> {
        let mut status = self.status.clone();
        loop {
            match &*status.borrow_and_update() {
                EngineStatus::Ready => return Ok(()),
                EngineStatus::Failed(reason) => return Err(EngineError::Startup(reason.clone())),
                EngineStatus::Stopped => return Err(EngineError::Stopped),
                EngineStatus::Starting => {}
            }

            if status.changed().await.is_err() {
                // thread exited without publishing a final status
                return match &*status.borrow() {
                    EngineStatus::Ready => Ok(()),
                    EngineStatus::Failed(reason) => Err(EngineError::Startup(reason.clone())),
                    _ => Err(EngineError::Stopped),
                };
            }
        }
    }

    /// Execute one frontend frame in `context` and return the encoded reply
    pub async fn exec_protocol(&self, context: ContextId, frame: Vec<u8>) -> EngineResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Frame {
            context,
            frame,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Run a script of statements outside any client context
    pub async fn exec_batch(&self, sql: impl Into<String>) -> EngineResult<()> {
        let sql = sql.into();
        self.call(move |conn| conn.execute_batch(&sql).map_err(EngineError::from))
            .await
    }

    /// Run a closure on the engine thread with direct access to the connection
    ///
    /// A panicking closure fails with [`EngineError::Panicked`] and leaves
    /// the engine running.
    pub async fn call<R, F>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&Connection) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Call(Box::new(move |conn| {
            let result = catch_unwind(AssertUnwindSafe(|| f(conn)))
                .unwrap_or_else(|_| Err(EngineError::Panicked));
            let _ = reply.send(result);
        })))
        .await?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Discard the statements and portals of a closed connection
    pub async fn release(&self, context: ContextId) -> EngineResult<()> {
        self.send(Request::Release { context }).await
    }

    /// Close the database and stop the engine thread
    pub async fn shutdown(&self) -> EngineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Shutdown { reply }).await?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    async fn send(&self, request: Request) -> EngineResult<()> {
        self.tx.send(request).await.map_err(|_| EngineError::Stopped)
    }
}

/// Owner of the engine thread
pub struct EmbeddedEngine {
    handle: EngineHandle,
    thread: Option<JoinHandle<()>>,
}

impl EmbeddedEngine {
    /// Spawn the engine thread; readiness is reported asynchronously
    pub fn start(config: EngineConfig) -> EngineResult<Self> {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(EngineStatus::Starting);

        let thread = std::thread::Builder::new()
            .name("pgharness-engine".to_string())
            .spawn(move || run(config, rx, status_tx))
            .map_err(|e| EngineError::Startup(e.to_string()))?;

        Ok(Self {
            handle: EngineHandle {
                tx,
                status: status_rx,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub async fn ready(&self) -> EngineResult<()> {
        self.handle.ready().await
    }

    pub fn status(&self) -> EngineStatus {
        self.handle.status()
    }

    /// Stop the engine and wait for its thread to exit
    pub async fn shutdown(mut self) -> EngineResult<()> {
        let result = match self.handle.shutdown().await {
            Err(EngineError::Stopped) => Ok(()),
            other => other,
        };

        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|_| EngineError::Panicked)?;
            if joined.is_err() {
                return Err(EngineError::Panicked);
            }
        }
        result
    }
}

impl Drop for EmbeddedEngine {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Best effort; the thread also exits once every handle is gone
            let (reply, _) = oneshot::channel();
            let _ = self.handle.tx.try_send(Request::Shutdown { reply });
        }
    }
}

fn open(config: &EngineConfig) -> EngineResult<Connection> {
    let conn = Connection::open_in_memory()?;
    if config.foreign_keys {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
    }
    Ok(conn)
}

/// Publishes the final status however the engine thread exits
struct StatusGuard(watch::Sender<EngineStatus>);

impl StatusGuard {
    fn publish(&self, status: EngineStatus) {
        self.0.send_replace(status);
    }
}

impl Drop for StatusGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("Embedded engine thread panicked");
            self.publish(EngineStatus::Failed("engine thread panicked".to_string()));
            return;
        }
        self.0.send_if_modified(|status| match status {
            EngineStatus::Stopped | EngineStatus::Failed(_) => false,
            _ => {
                *status = EngineStatus::Stopped;
                true
            }
        });
    }
}

fn run(config: EngineConfig, mut rx: mpsc::Receiver<Request>, status: watch::Sender<EngineStatus>) {
    let status = StatusGuard(status);
    let conn = match open(&config) {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "Embedded engine failed to start");
            status.publish(EngineStatus::Failed(e.to_string()));
            return;
        }
    };

    let mut state = EngineState::new(conn);
    status.publish(EngineStatus::Ready);
    info!("Embedded engine ready");

    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Frame {
                context,
                frame,
                reply,
            } => {
                let tag = frame.first().copied();
                let out = catch_unwind(AssertUnwindSafe(|| state.handle_frame(context, frame)))
                    .unwrap_or_else(|_| {
                        error!(context, "Frame execution panicked, context reset");
                        state.recover(context, tag)
                    });
                if reply.send(out).is_err() {
                    debug!(context, "Frame reply dropped by caller");
                }
            }
            Request::Call(f) => f(state.connection()),
            Request::Release { context } => state.release(context),
            Request::Shutdown { reply } => {
                let open_contexts = state.context_count();
                let result = state.close();
                if let Err(e) = &result {
                    warn!(error = %e, "Engine closed with error");
                }
                status.publish(EngineStatus::Stopped);
                info!(open_contexts, "Embedded engine stopped");
                let _ = reply.send(result);
                return;
            }
        }
    }

    status.publish(EngineStatus::Stopped);
    info!("Embedded engine stopped, all handles dropped");
}
