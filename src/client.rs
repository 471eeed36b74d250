// src/client.rs

//! The operation façade: typed async operations over the store.
//!
//! Every operation has the same shape: obtain a ready client from the
//! connection manager, issue exactly one command, and map the reply frame
//! to a typed result. No operation retries on its own; retry is solely the
//! connection manager's concern during initialization, and a command that
//! fails after a successful initialization is surfaced to the caller.

use crate::config::ConnectionDescriptor;
use crate::connection::{ConnectionManager, RetryPolicy, Subscription};
use crate::core::StoreError;
use crate::core::errors::StoreResult;
use crate::core::protocol::WireFrame;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Options for [`Store::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    ttl: Option<Duration>,
    if_absent: bool,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an expiry to the key.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Only set the key if it does not already exist.
    pub fn if_absent(mut self) -> Self {
        self.if_absent = true;
        self
    }
}

/// Typed client over the store. Cheap to clone; all clones share one
/// connection manager and therefore one pool.
#[derive(Clone)]
pub struct Store {
    manager: Arc<ConnectionManager>,
}

impl Store {
    /// Client configured from `STORE_*` environment variables, resolved on
    /// first use.
    pub fn from_env() -> Self {
        Self {
            manager: Arc::new(ConnectionManager::from_env()),
        }
    }

    /// Client bound to an explicit descriptor.
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            manager: Arc::new(ConnectionManager::new(descriptor)),
        }
    }

    pub fn with_policy(descriptor: ConnectionDescriptor, policy: RetryPolicy) -> Self {
        Self {
            manager: Arc::new(ConnectionManager::with_policy(descriptor, policy)),
        }
    }

    /// Client sharing an externally owned connection manager.
    pub fn with_manager(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Tears down the shared pool. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    /// Stores `value` under `key`. Returns whether the value was written
    /// (an `if_absent` set against an existing key yields `false`, not an
    /// error).
    pub async fn set(&self, key: &str, value: &str, opts: SetOptions) -> StoreResult<bool> {
        non_empty(key, "key")?;
        let mut parts = vec![
            Bytes::from_static(b"SET"),
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        ];
        if let Some(ttl) = opts.ttl {
            if ttl.is_zero() {
                return Err(StoreError::InvalidArgument(
                    "ttl must be greater than zero".to_string(),
                ));
            }
            if ttl.subsec_millis() == 0 {
                parts.push(Bytes::from_static(b"EX"));
                parts.push(Bytes::from(ttl.as_secs().to_string()));
            } else {
                parts.push(Bytes::from_static(b"PX"));
                parts.push(Bytes::from(ttl.as_millis().to_string()));
            }
        }
        if opts.if_absent {
            parts.push(Bytes::from_static(b"NX"));
        }

        match self.run("SET", parts).await? {
            WireFrame::Simple(s) if s.eq_ignore_ascii_case("OK") => Ok(true),
            // NX miss: the store acknowledges with a null reply.
            WireFrame::Bulk(None) | WireFrame::Array(None) => Ok(false),
            other => Err(unexpected("SET", other)),
        }
    }

    /// Fetches `key`. A missing key is a defined miss (`Ok(None)`), not a
    /// failure.
    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        non_empty(key, "key")?;
        let parts = vec![
            Bytes::from_static(b"GET"),
            Bytes::copy_from_slice(key.as_bytes()),
        ];
        match self.run("GET", parts).await? {
            WireFrame::Bulk(Some(value)) => Ok(Some(String::from_utf8_lossy(&value).to_string())),
            WireFrame::Bulk(None) => Ok(None),
            other => Err(unexpected("GET", other)),
        }
    }

    /// Fetches `key`, substituting `default` when the key is absent.
    pub async fn get_or(&self, key: &str, default: &str) -> StoreResult<String> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.to_string()))
    }

    /// Deletes `key`; returns the number of keys removed (0 or 1).
    pub async fn delete(&self, key: &str) -> StoreResult<u64> {
        non_empty(key, "key")?;
        let parts = vec![
            Bytes::from_static(b"DEL"),
            Bytes::copy_from_slice(key.as_bytes()),
        ];
        expect_count("DEL", self.run("DEL", parts).await?)
    }

    /// Publishes `message` on `channel`; returns the number of subscribers
    /// that received it.
    pub async fn publish(&self, channel: &str, message: &str) -> StoreResult<u64> {
        non_empty(channel, "channel")?;
        let parts = vec![
            Bytes::from_static(b"PUBLISH"),
            Bytes::copy_from_slice(channel.as_bytes()),
            Bytes::copy_from_slice(message.as_bytes()),
        ];
        expect_count("PUBLISH", self.run("PUBLISH", parts).await?)
    }

    /// Creates a live subscription object on a dedicated connection bound
    /// to the current client configuration.
    pub async fn create_subscription(&self) -> StoreResult<Subscription> {
        let pool = self.manager.ensure_ready().await?;
        let conn = pool.dedicated().await?;
        Ok(Subscription::new(conn))
    }

    /// Appends one or more values to the list at `key`; returns the new
    /// list length.
    pub async fn list_append(&self, key: &str, values: &[&str]) -> StoreResult<u64> {
        non_empty(key, "key")?;
        if values.is_empty() {
            return Err(StoreError::InvalidArgument(
                "list_append requires at least one value".to_string(),
            ));
        }
        let mut parts = vec![
            Bytes::from_static(b"RPUSH"),
            Bytes::copy_from_slice(key.as_bytes()),
        ];
        parts.extend(values.iter().map(|v| Bytes::copy_from_slice(v.as_bytes())));
        expect_count("RPUSH", self.run("RPUSH", parts).await?)
    }

    /// Returns the elements of the list at `key` between the inclusive
    /// bounds `start` and `stop`; negative indices count from the end.
    pub async fn list_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        non_empty(key, "key")?;
        let parts = vec![
            Bytes::from_static(b"LRANGE"),
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::from(start.to_string()),
            Bytes::from(stop.to_string()),
        ];
        expect_strings("LRANGE", self.run("LRANGE", parts).await?)
    }

    /// Returns the length of the list at `key` (0 when absent).
    pub async fn list_length(&self, key: &str) -> StoreResult<u64> {
        non_empty(key, "key")?;
        let parts = vec![
            Bytes::from_static(b"LLEN"),
            Bytes::copy_from_slice(key.as_bytes()),
        ];
        expect_count("LLEN", self.run("LLEN", parts).await?)
    }

    /// Sets a time-to-live on `key`; returns whether the key existed and
    /// the TTL was set. Sub-second durations are applied with millisecond
    /// precision; a zero TTL is rejected rather than deleting the key.
    pub async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        non_empty(key, "key")?;
        if ttl.is_zero() {
            return Err(StoreError::InvalidArgument(
                "ttl must be greater than zero".to_string(),
            ));
        }
        let (command, unit) = if ttl.subsec_millis() == 0 {
            ("EXPIRE", ttl.as_secs().to_string())
        } else {
            ("PEXPIRE", ttl.as_millis().to_string())
        };
        let parts = vec![
            Bytes::copy_from_slice(command.as_bytes()),
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::from(unit),
        ];
        Ok(expect_count(command, self.run(command, parts).await?)? == 1)
    }

    /// Returns all key names matching a glob-style pattern. The pattern is
    /// forwarded to the store verbatim; an empty pattern matches nothing.
    ///
    /// This walks the entire keyspace on the store side; avoid it on hot
    /// paths. No ordering is guaranteed.
    pub async fn keys_matching(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let parts = vec![
            Bytes::from_static(b"KEYS"),
            Bytes::copy_from_slice(pattern.as_bytes()),
        ];
        expect_strings("KEYS", self.run("KEYS", parts).await?)
    }

    /// The uniform operation path: ready client, one command, one reply.
    /// Error replies are annotated with the operation name before being
    /// surfaced.
    async fn run(&self, command: &'static str, parts: Vec<Bytes>) -> StoreResult<WireFrame> {
        let pool = self.manager.ensure_ready().await?;
        let mut conn = pool.checkout().await?;
        match conn.command(&parts).await? {
            WireFrame::Error(msg) => Err(StoreError::Server(format!("{command}: {msg}"))),
            frame => Ok(frame),
        }
    }
}

fn non_empty(value: &str, what: &'static str) -> StoreResult<()> {
    if value.is_empty() {
        Err(StoreError::InvalidArgument(format!(
            "{what} must be non-empty"
        )))
    } else {
        Ok(())
    }
}

fn unexpected(command: &'static str, frame: WireFrame) -> StoreError {
    StoreError::UnexpectedReply {
        command,
        reply: frame.describe(),
    }
}

fn expect_count(command: &'static str, frame: WireFrame) -> StoreResult<u64> {
    match frame {
        WireFrame::Integer(n) => u64::try_from(n)
            .map_err(|_| StoreError::Protocol(format!("{command} returned negative count {n}"))),
        other => Err(unexpected(command, other)),
    }
}

fn expect_strings(command: &'static str, frame: WireFrame) -> StoreResult<Vec<String>> {
    match frame {
        WireFrame::Array(Some(items)) => items
            .into_iter()
            .map(|item| match item {
                WireFrame::Bulk(Some(b)) => Ok(String::from_utf8_lossy(&b).to_string()),
                other => Err(unexpected(command, other)),
            })
            .collect(),
        WireFrame::Array(None) => Ok(Vec::new()),
        other => Err(unexpected(command, other)),
    }
}
