// src/connection/pool.rs

//! A bounded, shared pool of reusable store connections.
//!
//! Callers never own a connection outright: `checkout()` lends one for the
//! duration of a single command, and the RAII guard returns it on drop. A
//! connection that failed a command is discarded rather than returned.

use crate::config::ConnectionDescriptor;
use crate::core::StoreError;
use crate::core::errors::StoreResult;
use crate::core::protocol::WireFrame;
use crate::connection::Conn;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

struct PoolState {
    idle: VecDeque<Conn>,
    /// Connections in existence, idle or checked out.
    total: usize,
    closed: bool,
}

struct PoolInner {
    descriptor: ConnectionDescriptor,
    state: Mutex<PoolState>,
}

/// Shared handle to the connection pool. Cloning is cheap.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("descriptor", &self.inner.descriptor)
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub(crate) fn new(descriptor: ConnectionDescriptor) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                descriptor,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Borrows a connection: an idle one when available (re-probed if it has
    /// sat unused past the health-check interval), otherwise a fresh dial
    /// while under the pool limit.
    pub(crate) async fn checkout(&self) -> StoreResult<PooledConn> {
        loop {
            let candidate = {
                let mut state = self.lock();
                if state.closed {
                    return Err(StoreError::PoolClosed);
                }
                state.idle.pop_front()
            };
            let Some(mut conn) = candidate else { break };

            if conn.idle_for() >= self.inner.descriptor.health_check_interval {
                if let Err(err) = conn.ping().await {
                    debug!(%err, "discarding stale idle connection");
                    self.release_slot();
                    conn.close().await;
                    continue;
                }
            }
            return Ok(PooledConn::new(self.inner.clone(), conn));
        }

        if !self.try_reserve() {
            return Err(StoreError::PoolExhausted(
                self.inner.descriptor.max_pool_size,
            ));
        }
        match Conn::open(&self.inner.descriptor).await {
            Ok(conn) => Ok(PooledConn::new(self.inner.clone(), conn)),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Opens a dedicated connection outside the pool's accounting, e.g. for
    /// a pub/sub subscription that takes the connection out of command mode.
    pub(crate) async fn dedicated(&self) -> StoreResult<Conn> {
        if self.lock().closed {
            return Err(StoreError::PoolClosed);
        }
        Conn::open(&self.inner.descriptor).await
    }

    /// Closes the pool: no further checkouts, and every idle connection is
    /// shut down before this returns. Connections still checked out are
    /// dropped (not returned) when their guards go out of scope.
    pub(crate) async fn close(&self) {
        let drained: Vec<Conn> = {
            let mut state = self.lock();
            state.closed = true;
            state.total = state.total.saturating_sub(state.idle.len());
            state.idle.drain(..).collect()
        };
        for conn in drained {
            conn.close().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().expect("pool mutex poisoned")
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.lock();
        if state.closed || state.total >= self.inner.descriptor.max_pool_size {
            return false;
        }
        state.total += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.lock();
        state.total = state.total.saturating_sub(1);
    }
}

/// RAII guard for a checked-out connection. Returned to the pool on drop
/// unless a command on it failed.
pub struct PooledConn {
    inner: Arc<PoolInner>,
    conn: Option<Conn>,
    healthy: bool,
}

impl PooledConn {
    fn new(inner: Arc<PoolInner>, conn: Conn) -> Self {
        PooledConn {
            inner,
            conn: Some(conn),
            healthy: true,
        }
    }

    /// Issues one command round-trip on the borrowed connection.
    pub(crate) async fn command(&mut self, parts: &[Bytes]) -> StoreResult<WireFrame> {
        let conn = self.conn.as_mut().expect("connection present until drop");
        let result = conn.command(parts).await;
        if result.is_err() {
            self.healthy = false;
        }
        result
    }

    /// Liveness probe on the borrowed connection.
    pub(crate) async fn ping(&mut self) -> StoreResult<()> {
        let conn = self.conn.as_mut().expect("connection present until drop");
        let result = conn.ping().await;
        if result.is_err() {
            self.healthy = false;
        }
        result
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        if self.healthy && !state.closed {
            state.idle.push_back(conn);
        } else {
            // Dropping the connection closes the transport.
            state.total = state.total.saturating_sub(1);
        }
    }
}
