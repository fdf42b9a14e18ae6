//! RESP protocol async parser

use crate::{RespError, RespValue};
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Default maximum frame size: 512MB (prevents memory overflow attacks)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// RESP protocol async parser
pub struct AsyncRespParser<R: AsyncRead + Unpin> {
    reader: BufReader<R>,
    max_bytes: usize,
    frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> AsyncRespParser<R> {
    /// Create a new async parser (using default max frame size)
    pub fn new(reader: R) -> Self {
        Self::with_max_bytes(reader, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new async parser with a frame size limit in bytes.
    pub fn with_max_bytes(reader: R, max_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_bytes,
            frame_bytes: 0,
        }
    }

    /// Parse the next RESP value.
    ///
    /// The frame size limit applies to each top-level frame independently, so
    /// a long-lived connection never trips it by volume alone.
    pub async fn parse(&mut self) -> Result<RespValue, RespError> {
        self.frame_bytes = 0;
        self.parse_value().await
    }

    async fn parse_value(&mut self) -> Result<RespValue, RespError> {
        let header = self.read_line().await?;
        let (type_byte, rest) = header
            .split_first()
            .ok_or_else(|| RespError::InvalidFormat("empty header line".to_string()))?;
        match type_byte {
            b'+' => Ok(RespValue::SimpleString(Bytes::copy_from_slice(rest))),
            b'-' => Ok(RespValue::Error(Bytes::copy_from_slice(rest))),
            b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
            b'$' => self.parse_bulk(parse_i64(rest)?).await,
            b'*' => self.parse_array(parse_i64(rest)?).await,
            other => Err(RespError::InvalidType(*other)),
        }
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, RespError> {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(RespError::UnexpectedEof);
        }
        self.grow_frame(n)?;
        if !line.ends_with(b"\r\n") {
            if line.ends_with(b"\n") {
                return Err(RespError::InvalidFormat(
                    "line not terminated by CRLF".to_string(),
                ));
            }
            return Err(RespError::UnexpectedEof);
        }
        line.truncate(line.len() - 2);
        Ok(line)
    }

    fn grow_frame(&mut self, additional: usize) -> Result<(), RespError> {
        self.frame_bytes = self.frame_bytes.saturating_add(additional);
        if self.frame_bytes > self.max_bytes {
            Err(RespError::FrameTooLarge(self.frame_bytes, self.max_bytes))
        } else {
            Ok(())
        }
    }

    async fn parse_bulk(&mut self, len: i64) -> Result<RespValue, RespError> {
        if len == -1 {
            return Ok(RespValue::Null);
        }
        let len = usize::try_from(len)
            .map_err(|_| RespError::InvalidFormat(format!("invalid bulk length: {}", len)))?;
        self.grow_frame(len + 2)?;
        let mut buf = vec![0u8; len + 2];
        self.reader.read_exact(&mut buf).await.map_err(map_eof)?;
        if !buf.ends_with(b"\r\n") {
            return Err(RespError::InvalidFormat(
                "bulk string not terminated by CRLF".to_string(),
            ));
        }
        buf.truncate(len);
        Ok(RespValue::BulkString(Bytes::from(buf)))
    }

    async fn parse_array(&mut self, count: i64) -> Result<RespValue, RespError> {
        if count == -1 {
            return Ok(RespValue::Null);
        }
        let count = usize::try_from(count)
            .map_err(|_| RespError::InvalidFormat(format!("invalid array length: {}", count)))?;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let item = Box::pin(self.parse_value()).await?;
            items.push(item);
        }
        Ok(RespValue::Array(items))
    }
}

fn parse_i64(digits: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            RespError::InvalidFormat(format!("invalid integer: {:?}", String::from_utf8_lossy(digits)))
        })
}

fn map_eof(e: io::Error) -> RespError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RespError::UnexpectedEof
    } else {
        RespError::Io(e)
    }
}
