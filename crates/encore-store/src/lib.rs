//! Versioned response store for the Encore offline proxy.
//!
//! A [`CacheStorage`] holds named [`Generation`]s. Each generation is an
//! insertion-ordered map from [`RequestKey`] to [`CachedEntry`], optionally
//! limited by a byte quota. [`FifoBound`] caps a subset of a generation's
//! keys (audio files) and evicts oldest-first.

pub mod arena;
pub mod entry;
pub mod fifo;
pub mod generation;
pub mod key;
pub mod storage;

pub use entry::{CachedEntry, StoreError, StoreStats};
pub use fifo::{Admission, FifoBound};
pub use generation::Generation;
pub use key::{resolve_scope_path, RequestKey};
pub use storage::CacheStorage;
