//! ipfetch Cache - TTL Store for Validated Content
//!
//! The store only ever holds content that passed validation; callers hand it
//! a [`ipfetch_core::Content`], never raw bytes. Backends are pluggable
//! through [`CacheBackend`]; [`MemoryBackend`] is the default.

pub mod backend;
pub mod memory;
pub mod store;

pub use backend::{BackendUsage, CacheBackend, CacheEntry, RetainFn};
pub use memory::MemoryBackend;
pub use store::{CacheStats, TtlCache};
