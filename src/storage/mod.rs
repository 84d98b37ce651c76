//! Storage Module
//!
//! The keyspace lives in one [`StorageEngine`]; a background
//! [`ExpirySweeper`] evicts expired keys nobody reads.
//!
//! ```text
//!   CommandHandler ──┐
//!   SnapshotManager ─┼──► StorageEngine (Mutex<Keyspace>)
//!   ExpirySweeper ───┘
//! ```
//!
//! ## Example
//!
//! ```
//! use snapkv::storage::{KeyType, StorageEngine, StorageError};
//! use bytes::Bytes;
//!
//! let engine = StorageEngine::new();
//!
//! engine.hset(Bytes::from("user:1"), Bytes::from("name"), Bytes::from("Ariz")).unwrap();
//! assert_eq!(engine.key_type(b"user:1"), Some(KeyType::Hash));
//!
//! // Type-specific operations refuse keys of another type
//! assert_eq!(engine.llen(b"user:1"), Err(StorageError::WrongType));
//! ```

pub mod engine;
pub mod expiry;

pub use engine::{
    KeyType, SnapshotRecord, StorageEngine, StorageError, StorageResult, StorageStats, Value,
    MAX_TTL,
};
pub use expiry::{ExpiryConfig, ExpirySweeper};
