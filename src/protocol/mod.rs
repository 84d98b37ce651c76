//! Wire Protocol
//!
//! Requests arrive as RESP arrays of bulk strings or as whitespace-separated
//! plain lines; replies leave as simple strings, errors, integers, bulk
//! strings (including the null bulk) and flat arrays.
//!
//! - `parser`: turns request bytes into command tokens
//! - `types`: the [`RespValue`] reply type and its encoding
//!
//! ```
//! use snapkv::protocol::{decode, RespValue};
//! use bytes::Bytes;
//!
//! let tokens = decode(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
//! assert_eq!(tokens, vec!["GET", "name"]);
//!
//! let reply = RespValue::bulk_string(Bytes::from("Ariz"));
//! assert_eq!(reply.serialize(), b"$4\r\nAriz\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{decode, ParseError, ParseResult, RespParser};
pub use types::RespValue;
