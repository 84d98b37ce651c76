//! # SnapKV - An In-Memory Key-Value Server with Snapshots
//!
//! SnapKV serves string, list and hash values over a RESP-style wire
//! protocol. Keys can expire, and the whole keyspace is periodically saved
//! to a binary snapshot file that is loaded back at startup.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                              Server                               │
//! │                                                                   │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────┐           │
//! │  │ TcpListener │───>│ Connection  │───>│   Command    │           │
//! │  │ (accept)    │    │  Handler    │    │   Handler    │           │
//! │  └─────────────┘    └─────────────┘    └──────┬───────┘           │
//! │                       RespParser              │                   │
//! │                                               ▼                   │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────┐  │
//! │  │  Snapshot   │───>│              StorageEngine               │  │
//! │  │  Manager    │    │   Mutex<Keyspace> { entries, expires }   │  │
//! │  └─────────────┘    └──────────────────────────────────────────┘  │
//! │   (timer + final)                      ▲                          │
//! │                          ┌─────────────┴─────────────┐            │
//! │                          │       ExpirySweeper       │            │
//! │                          └───────────────────────────┘            │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use snapkv::{Server, ServerConfig, StorageEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Arc::new(Server::new(
//!         ServerConfig::default(),
//!         Arc::new(StorageEngine::new()),
//!     ));
//!     server.load_snapshot()?;
//!
//!     let handle = server.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         handle.shutdown();
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: request decoding and reply encoding
//! - [`storage`]: the keyspace and the background expiry sweeper
//! - [`commands`]: command dispatch
//! - [`connection`]: per-client workers
//! - [`persistence`]: binary snapshots
//! - [`server`]: listener, lifecycle and shutdown
//! - [`config`]: server settings and command-line parsing
//!
//! ## Expiry
//!
//! Expired keys disappear in two ways:
//! 1. **Lazy**: every access checks the key's deadline first
//! 2. **Active**: a background task periodically evicts everything due
//!
//! Both use the same test, `deadline <= now`, so a key never reads as live
//! to one path and expired to the other.

pub mod commands;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod storage;

pub use commands::CommandHandler;
pub use config::ServerConfig;
pub use connection::{handle_connection, ConnectionStats};
pub use persistence::{LoadOutcome, PersistenceError, SnapshotManager};
pub use protocol::{ParseError, RespParser, RespValue};
pub use server::{Server, ServerError, ServerState, ShutdownHandle};
pub use storage::{ExpiryConfig, ExpirySweeper, StorageEngine};

/// The default port SnapKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host SnapKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of SnapKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
