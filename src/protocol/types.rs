//! Reply Values and Their Wire Encoding
//!
//! Every reply the server sends is one of five RESP shapes, each introduced
//! by a one-byte prefix and terminated by CRLF:
//!
//! | Shape         | Example                      |
//! |---------------|------------------------------|
//! | Simple string | `+OK\r\n`                    |
//! | Error         | `-ERR no such key\r\n`       |
//! | Integer       | `:42\r\n`                    |
//! | Bulk string   | `$3\r\nbar\r\n`              |
//! | Null bulk     | `$-1\r\n`                    |
//! | Array         | `*2\r\n$1\r\na\r\n$1\r\nb\r\n` |

use bytes::Bytes;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A reply produced by the command dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<string>\r\n`; must not contain CR or LF.
    SimpleString(String),

    /// `-<message>\r\n`
    Error(String),

    /// `:<integer>\r\n`
    Integer(i64),

    /// `$<length>\r\n<data>\r\n`, binary safe.
    BulkString(Bytes),

    /// The null bulk string, `$-1\r\n`.
    Null,

    /// `*<count>\r\n` followed by each element's encoding.
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Bulk string when present, null bulk otherwise.
    pub fn optional_bulk(data: Option<Bytes>) -> Self {
        match data {
            Some(data) => RespValue::BulkString(data),
            None => RespValue::Null,
        }
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// An array of bulk strings.
    pub fn bulk_array(items: impl IntoIterator<Item = Bytes>) -> Self {
        RespValue::Array(items.into_iter().map(RespValue::BulkString).collect())
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Encodes the reply into a fresh buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Appends the encoded reply to `buf`.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => write_text(buf, prefix::SIMPLE_STRING, s),
            RespValue::Error(s) => write_text(buf, prefix::ERROR, s),
            RespValue::Integer(n) => write_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => {
                write_line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => write_line(buf, prefix::BULK_STRING, b"-1"),
            RespValue::Array(values) => {
                write_line(buf, prefix::ARRAY, values.len().to_string().as_bytes());
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

/// Writes a one-line payload, replacing CR and LF with spaces so client
/// text echoed into a reply cannot end it early.
fn write_text(buf: &mut Vec<u8>, prefix: u8, text: &str) {
    buf.push(prefix);
    buf.extend(text.bytes().map(|b| match b {
        b'\r' | b'\n' => b' ',
        other => other,
    }));
    buf.extend_from_slice(CRLF);
}

#[inline]
fn write_line(buf: &mut Vec<u8>, prefix: u8, payload: &[u8]) {
    buf.push(prefix);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}
