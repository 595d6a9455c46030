//! Trellis Storage - Backing object store for managed resources
//!
//! This crate provides:
//! - A key-value store abstraction with a redb backend and an in-memory backend
//! - Key encoding for objects and prior-state snapshots
//! - The typed [`ObjectStore`] that components and operators write through

pub mod encoding;
pub mod error;
pub mod kv;
pub mod memory;
pub mod objects;
pub mod redb_backend;
pub mod snapshot;

pub use encoding::KeyEncoder;
pub use error::{Result, StorageError};
pub use kv::{KVStore, Transaction};
pub use memory::MemoryBackend;
pub use objects::{KvObjectStore, ObjectStore};
pub use redb_backend::RedbBackend;
pub use snapshot::{PriorState, SnapshotStore};
