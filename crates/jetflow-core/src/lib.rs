//! Core primitives shared across the jetflow workspace.
//!
//! - [`store`]: the shared key/value store boundary (checkpoint cursors and
//!   the distributed lock's backing slots live behind it)
//! - [`lock`]: keyed mutual exclusion, in-process and cross-process

pub mod error;
pub mod lock;
pub mod store;

pub use error::{Error, Result};
pub use lock::{KeyedLock, LocalLock, LockGuard, StoreLock};
pub use store::{FileStore, MemoryStore, SharedStore, SharedStoreRef};
