//! Client Connections
//!
//! The server spawns one task per accepted socket; each runs a
//! [`ConnectionHandler`] that decodes requests, dispatches them and writes
//! the replies back in order.
//!
//! ```text
//!                 Server (accept loop)
//!                        │ spawn per client
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!   ConnectionHandler  ...   ConnectionHandler
//!          │                           │
//!          └──────► CommandHandler ◄───┘
//!                         │
//!                         ▼
//!                   StorageEngine
//! ```
//!
//! Handlers share a [`ConnectionStats`] block and watch the server's
//! shutdown signal.

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
