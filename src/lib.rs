//! A persistent, process-safe, filesystem-backed cache, meant to sit behind
//! a dogpile-style single-flight cache region.
//!
//! Values are stored as files under a base directory, one `.payload` +
//! `.metadata` pair per key. Writes stage temp files and rename them into
//! place under a per-key lock, so readers that take the same lock always see
//! a coherent pair. Every write also triggers an opportunistic prune pass
//! that enforces the configured TTL and a global LRU byte budget.
//!
//! The per-key lock is a byte-range `fcntl` lock at an offset derived from
//! the key, on one of two shared lock files. It is reentrant within a
//! thread, exclusive between threads and processes, and refuses to be used
//! from a process that did not create it (see [`RangedLock`]).
//!
//! [`RawFsBackend`] stores opaque byte streams; [`GenericFsBackend`] wraps
//! it to store any serde-serializable value.

mod backend;
mod error;
mod hash;
mod layout;
mod lock;
mod prelude;
mod registry;

#[cfg(test)]
mod test_util;

pub use backend::{CacheConfig, FileHit, FileValue, GenericFsBackend, RawFsBackend};
pub use error::CacheError;
pub use lock::{LockGuard, RangedLock};
