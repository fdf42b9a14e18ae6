//! RESP (REdis Serialization Protocol) support library
//!
//! Provides the protocol value type plus sync parsing/encoding (used by the
//! append-only file) and async parsing/encoding (used by client and
//! inter-node connections).

mod async_encoder;
mod async_parser;
mod encoder;
mod parser;

pub use async_encoder::AsyncRespEncoder;
pub use async_parser::{AsyncRespParser, DEFAULT_MAX_FRAME_SIZE};
pub use encoder::{encode, encode_to_vec};
pub use parser::RespParser;

use bytes::Bytes;
use std::io;

/// A command with its arguments, as a sequence of byte strings.
///
/// `["SET", "k", "v"]` on the wire is the multi-bulk array
/// `*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n`.
pub type CmdLine = Vec<Bytes>;

/// Build a [`CmdLine`] from anything byte-string-like.
pub fn to_cmd_line<I, T>(parts: I) -> CmdLine
where
    I: IntoIterator<Item = T>,
    T: Into<Bytes>,
{
    parts.into_iter().map(Into::into).collect()
}

/// RESP data type
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(Bytes),
    /// Error: -ERR message\r\n
    Error(Bytes),
    /// Integer: :123\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n
    BulkString(Bytes),
    /// Array: *2\r\n$3\r\nGET\r\n$3\r\nkey\r\n
    Array(Vec<RespValue>),
    /// Null bulk string: $-1\r\n
    Null,
}

impl RespValue {
    /// The `+OK` reply.
    pub fn ok() -> Self {
        RespValue::SimpleString(Bytes::from_static(b"OK"))
    }

    /// An `-ERR`-style error reply.
    pub fn error(msg: impl Into<String>) -> Self {
        RespValue::Error(Bytes::from(msg.into()))
    }

    /// A bulk string reply, `Null` when absent.
    pub fn bulk(value: Option<impl Into<Bytes>>) -> Self {
        match value {
            Some(v) => RespValue::BulkString(v.into()),
            None => RespValue::Null,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Interpret an array of bulk strings as a command line.
    ///
    /// Returns `None` for anything that is not a flat array of
    /// (simple or bulk) strings.
    pub fn as_cmd_line(&self) -> Option<CmdLine> {
        let RespValue::Array(items) = self else {
            return None;
        };
        let mut cmd = Vec::with_capacity(items.len());
        for item in items {
            match item {
                RespValue::BulkString(b) => cmd.push(b.clone()),
                RespValue::SimpleString(s) => cmd.push(s.clone()),
                _ => return None,
            }
        }
        Some(cmd)
    }

    /// Encode a command line as a RESP multi-bulk array.
    pub fn from_cmd_line(cmd: CmdLine) -> Self {
        RespValue::Array(cmd.into_iter().map(RespValue::BulkString).collect())
    }
}

/// RESP parsing error
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid RESP frame: {0}")]
    InvalidFormat(String),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("frame too large: {0} bytes (max: {1} bytes)")]
    FrameTooLarge(usize, usize),
    #[error("invalid RESP type byte: {0:#x}")]
    InvalidType(u8),
}
