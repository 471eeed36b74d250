// src/connection/mod.rs

//! Connection plumbing: a single framed connection to the store, the shared
//! bounded pool, the process-wide connection manager, and the pub/sub
//! subscription object.

mod conn;
mod manager;
mod pool;
mod subscription;

pub use manager::{ConnectionManager, RetryPolicy};
pub use pool::{Pool, PooledConn};
pub use subscription::{Message, Subscription};

pub(crate) use conn::Conn;
