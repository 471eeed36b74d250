// src/core/mod.rs

//! Core building blocks shared by the connection layer and the client façade.

pub mod errors;
pub mod protocol;

pub use errors::StoreError;

use std::time::Duration;

/// Safety-net TTL (24 hours) for keys that are meant to be transient.
///
/// The façade never applies this automatically; callers opt in per key,
/// typically through [`crate::client::SetOptions`] or
/// [`crate::client::Store::expire`].
pub const STORE_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
