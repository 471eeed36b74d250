// src/lib.rs

pub mod client;
pub mod config;
pub mod connection;
pub mod core;

// Re-export
pub use crate::client::{SetOptions, Store};
pub use crate::config::ConnectionDescriptor;
pub use crate::connection::{ConnectionManager, Message, RetryPolicy, Subscription};
pub use crate::core::{STORE_KEY_TTL, StoreError};
