//! Command Layer
//!
//! Turns a decoded request into a reply by calling the store.
//!
//! ```text
//!   tokens ──► CommandHandler::execute ──► StorageEngine
//!                      │
//!                      ▼
//!                  RespValue ──► serialize ──► bytes out
//! ```

pub mod handler;

pub use handler::CommandHandler;
