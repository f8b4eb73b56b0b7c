//! Client-side cache synchronization for AYON servers.
//!
//! [`cache::CacheLayer`] holds query results keyed by endpoint and arguments,
//! refetches them when their tags are invalidated, and applies optimistic
//! patches for mutations. [`ayon`] registers the AYON endpoints on it.

pub mod ayon;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod query;

pub use error::{SyncError, SyncResult};
