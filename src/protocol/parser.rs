//! Request Decoding
//!
//! Clients send a command either as an array of bulk strings
//! (`*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n`) or, for simple line-based clients,
//! as a plain line whose words are separated by whitespace (`GET foo\n`).
//! Both shapes decode to the same thing: the list of tokens that make up
//! the command.
//!
//! Two entry points are provided:
//!
//! - [`RespParser::parse`] works on a growing connection buffer and tells
//!   "not enough bytes yet" (`Ok(None)`) apart from "these bytes can never be
//!   a valid command" (`Err`).
//! - [`decode`] treats its input as one complete command and is
//!   all-or-nothing: any defect yields an empty token list.

use crate::protocol::types::{prefix, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that make a buffered frame permanently undecodable.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// A length or count field is not a decimal integer
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Array elements must be bulk strings
    #[error("expected bulk string, found prefix {0:#04x}")]
    UnexpectedPrefix(u8),

    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of tokens in one array command
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// A decoded command and the number of buffer bytes it occupied.
pub type Frame = (Vec<Bytes>, usize);

/// Incremental command parser for connection buffers.
///
/// # Example
///
/// ```
/// use snapkv::protocol::RespParser;
///
/// let parser = RespParser::new();
/// let (tokens, consumed) = parser
///     .parse(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n")
///     .unwrap()
///     .unwrap();
/// assert_eq!(tokens, vec!["GET", "foo"]);
/// assert_eq!(consumed, 22);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        Self
    }

    /// Attempts to decode one command from the front of `buf`.
    ///
    /// - `Ok(Some((tokens, consumed)))` - a whole command was decoded
    /// - `Ok(None)` - the command is not complete yet
    /// - `Err(e)` - the buffered bytes are malformed
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<Frame>> {
        match buf.first() {
            None => Ok(None),
            Some(&prefix::ARRAY) => self.parse_array(buf),
            Some(_) => Ok(self.parse_inline(buf)),
        }
    }

    /// Parses `*<count>\r\n` followed by `count` bulk strings.
    fn parse_array(&self, buf: &[u8]) -> ParseResult<Option<Frame>> {
        debug_assert!(buf[0] == prefix::ARRAY);

        let count_end = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let count = parse_decimal(&buf[1..1 + count_end])?;
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }
        let count = count as usize;
        if count > MAX_ARRAY_LEN {
            return Err(ParseError::MessageTooLarge {
                size: count,
                max: MAX_ARRAY_LEN,
            });
        }

        let mut tokens = Vec::with_capacity(count.min(64));
        let mut consumed = 1 + count_end + 2;

        for _ in 0..count {
            match self.parse_bulk_string(&buf[consumed..])? {
                Some((token, used)) => {
                    tokens.push(token);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((tokens, consumed)))
    }

    /// Parses a bulk string: `$<length>\r\n<data>\r\n`
    fn parse_bulk_string(&self, buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
        match buf.first() {
            None => return Ok(None),
            Some(&prefix::BULK_STRING) => {}
            Some(&other) => return Err(ParseError::UnexpectedPrefix(other)),
        }

        let length_end = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let length = parse_decimal(&buf[1..1 + length_end])?;
        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }
        let length = length as usize;
        if length > MAX_BULK_SIZE {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: MAX_BULK_SIZE,
            });
        }

        let data_start = 1 + length_end + 2;
        let total_needed = data_start + length + 2;
        if buf.len() < total_needed {
            return Ok(None);
        }

        if &buf[data_start + length..total_needed] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
        Ok(Some((data, total_needed)))
    }

    /// Parses a newline-terminated plain line into whitespace-separated words.
    fn parse_inline(&self, buf: &[u8]) -> Option<Frame> {
        let newline = buf.iter().position(|&b| b == b'\n')?;
        Some((split_whitespace(&buf[..newline]), newline + 1))
    }
}

/// Decodes exactly one complete command, all-or-nothing.
///
/// Input that does not start with `*` is split on whitespace. Array input
/// must be a well-formed, complete array of bulk strings; a missing
/// delimiter, a non-numeric length, truncation, or a non-bulk element all
/// yield an empty list.
///
/// ```
/// use snapkv::protocol::decode;
///
/// assert_eq!(decode(b"SET foo bar"), vec!["SET", "foo", "bar"]);
/// assert!(decode(b"*1\r\n$4\r\nPI").is_empty());
/// ```
pub fn decode(buf: &[u8]) -> Vec<Bytes> {
    match buf.first() {
        Some(&prefix::ARRAY) => match RespParser::new().parse_array(buf) {
            Ok(Some((tokens, _))) => tokens,
            _ => Vec::new(),
        },
        Some(_) => split_whitespace(buf),
        None => Vec::new(),
    }
}

fn split_whitespace(line: &[u8]) -> Vec<Bytes> {
    line.split(|b| b.is_ascii_whitespace())
        .filter(|word| !word.is_empty())
        .map(Bytes::copy_from_slice)
        .collect()
}

fn parse_decimal(digits: &[u8]) -> ParseResult<i64> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| ParseError::InvalidInteger(String::from_utf8_lossy(digits).into_owned()))?;
    text.parse()
        .map_err(|_| ParseError::InvalidInteger(text.to_string()))
}

/// Returns the position of the first `\r\n` in `buf`.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}
