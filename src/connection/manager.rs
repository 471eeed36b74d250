// src/connection/manager.rs

//! The process-wide connection manager: lazily builds the shared pool,
//! verifies liveness, and guarantees at most one concurrent initialization.
//!
//! Lifecycle: uninitialized -> initializing -> ready, with a probe failure
//! returning the state to uninitialized (fully cleared, never
//! half-populated) and `shutdown()` tearing a ready state back down. All
//! transitions happen under a single async mutex, so racing first callers
//! cannot each construct a pool; the ready check is repeated after the
//! guard is acquired.

use crate::config::ConnectionDescriptor;
use crate::core::errors::StoreResult;
use crate::connection::pool::Pool;
use rand::Rng;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Bounded exponential backoff applied around the whole
/// initialize-and-probe sequence. Injectable so tests can shrink it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Mutable singleton state, guarded by the manager's mutex.
struct ManagerState {
    /// Resolved once per process, on first initialization.
    descriptor: Option<ConnectionDescriptor>,
    pool: Option<Pool>,
    /// True only after a successful liveness probe.
    ready: bool,
}

/// Owns the process-wide connection state. Construct one per process (or
/// per test) and share it via `Arc`; there are no hidden globals.
pub struct ConnectionManager {
    /// Descriptor supplied at construction; `None` means resolve from the
    /// environment on first use.
    configured: Option<ConnectionDescriptor>,
    policy: RetryPolicy,
    state: Mutex<ManagerState>,
}

impl ConnectionManager {
    /// Manager that resolves its descriptor from `STORE_*` environment
    /// variables on first initialization.
    pub fn from_env() -> Self {
        Self::build(None, RetryPolicy::default())
    }

    /// Manager bound to an explicit descriptor.
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self::build(Some(descriptor), RetryPolicy::default())
    }

    pub fn with_policy(descriptor: ConnectionDescriptor, policy: RetryPolicy) -> Self {
        Self::build(Some(descriptor), policy)
    }

    fn build(configured: Option<ConnectionDescriptor>, policy: RetryPolicy) -> Self {
        ConnectionManager {
            configured,
            policy,
            state: Mutex::new(ManagerState {
                descriptor: None,
                pool: None,
                ready: false,
            }),
        }
    }

    /// Idempotent accessor: returns the ready pool, initializing it first
    /// if necessary. When the state is already ready this performs no I/O.
    pub async fn ensure_ready(&self) -> StoreResult<Pool> {
        let mut state = self.state.lock().await;

        // Double-check after acquiring the guard: a racing caller may have
        // finished initialization while we waited.
        if state.ready {
            if let Some(pool) = &state.pool {
                return Ok(pool.clone());
            }
        }

        let descriptor = match &state.descriptor {
            Some(d) => d.clone(),
            None => {
                let d = match &self.configured {
                    Some(d) => d.clone(),
                    None => ConnectionDescriptor::from_env()?,
                };
                state.descriptor = Some(d.clone());
                d
            }
        };

        info!(
            host = %descriptor.host,
            port = descriptor.port,
            max_pool_size = descriptor.max_pool_size,
            "initializing store connection"
        );

        let mut attempt = 1u32;
        let mut delay = self.policy.initial_delay;
        loop {
            match Self::initialize_and_probe(&descriptor).await {
                Ok(pool) => {
                    state.pool = Some(pool.clone());
                    state.ready = true;
                    info!("connected to store");
                    return Ok(pool);
                }
                Err(err) => {
                    error!(%err, attempt, "store connection attempt failed");
                    let retryable = err.is_retryable()
                        && (descriptor.retry_on_timeout || !err.is_timeout());
                    if !retryable || attempt >= self.policy.max_attempts {
                        return Err(err);
                    }
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    tokio::time::sleep(delay + jitter).await;
                    delay = (delay * 2).min(self.policy.max_delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Builds a fresh pool and runs the liveness probe. The pool is only
    /// handed back on probe success; on failure it is torn down before the
    /// error propagates, so no partially-ready state can escape.
    async fn initialize_and_probe(descriptor: &ConnectionDescriptor) -> StoreResult<Pool> {
        let pool = Pool::new(descriptor.clone());
        let probe = {
            let mut conn = pool.checkout().await?;
            conn.ping().await
        };
        match probe {
            Ok(()) => Ok(pool),
            Err(err) => {
                pool.close().await;
                Err(err)
            }
        }
    }

    /// Releases the pool and clears the ready flag. Idempotent, and all
    /// pooled transports are shut down before this returns.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(pool) = state.pool.take() {
            info!("closing store connection pool");
            pool.close().await;
            info!("store connection pool closed");
        }
        state.ready = false;
    }

    /// Whether the manager currently holds a verified, ready pool.
    pub async fn is_ready(&self) -> bool {
        let state = self.state.lock().await;
        state.ready && state.pool.is_some()
    }
}
