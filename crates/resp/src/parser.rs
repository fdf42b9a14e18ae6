//! RESP protocol sync parser
//!
//! Used for replaying the append-only file, where frames are read from a
//! `BufRead` source (typically a `BufReader<Take<File>>`).

use crate::{RespError, RespValue};
use bytes::Bytes;
use std::io::{self, BufRead, Read};

/// RESP protocol sync parser
pub struct RespParser<R: BufRead> {
    reader: R,
}

impl<R: BufRead> RespParser<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Parse the next RESP value.
    ///
    /// [`RespError::UnexpectedEof`] before the first byte of a frame means
    /// the stream ended at a frame boundary; mid-frame it means the frame is
    /// truncated.
    pub fn parse(&mut self) -> Result<RespValue, RespError> {
        let header = self.read_line()?;
        let (type_byte, rest) = header
            .split_first()
            .ok_or_else(|| RespError::InvalidFormat("empty header line".to_string()))?;
        match type_byte {
            b'+' => Ok(RespValue::SimpleString(Bytes::copy_from_slice(rest))),
            b'-' => Ok(RespValue::Error(Bytes::copy_from_slice(rest))),
            b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
            b'$' => self.parse_bulk(parse_i64(rest)?),
            b'*' => self.parse_array(parse_i64(rest)?),
            other => Err(RespError::InvalidType(*other)),
        }
    }

    /// Read one CRLF-terminated line, without the terminator.
    fn read_line(&mut self) -> Result<Vec<u8>, RespError> {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Err(RespError::UnexpectedEof);
        }
        if !line.ends_with(b"\r\n") {
            if line.ends_with(b"\n") {
                return Err(RespError::InvalidFormat(
                    "line not terminated by CRLF".to_string(),
                ));
            }
            // stream ended mid-line
            return Err(RespError::UnexpectedEof);
        }
        line.truncate(line.len() - 2);
        Ok(line)
    }

    fn parse_bulk(&mut self, len: i64) -> Result<RespValue, RespError> {
        if len == -1 {
            return Ok(RespValue::Null);
        }
        let len = usize::try_from(len)
            .map_err(|_| RespError::InvalidFormat(format!("invalid bulk length: {}", len)))?;
        let mut buf = vec![0u8; len + 2];
        self.reader.read_exact(&mut buf).map_err(map_eof)?;
        if !buf.ends_with(b"\r\n") {
            return Err(RespError::InvalidFormat(
                "bulk string not terminated by CRLF".to_string(),
            ));
        }
        buf.truncate(len);
        Ok(RespValue::BulkString(Bytes::from(buf)))
    }

    fn parse_array(&mut self, count: i64) -> Result<RespValue, RespError> {
        if count == -1 {
            return Ok(RespValue::Null);
        }
        let count = usize::try_from(count)
            .map_err(|_| RespError::InvalidFormat(format!("invalid array length: {}", count)))?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.parse()?);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse_all(data: &[u8]) -> (Vec<RespValue>, RespError) {
        let mut parser = RespParser::new(Cursor::new(data.to_vec()));
        let mut values = Vec::new();
        loop {
            match parser.parse() {
                Ok(v) => values.push(v),
                Err(e) => return (values, e),
            }
        }
    }

    #[test]
    fn parses_multi_bulk_command() {
        let (values, err) = parse_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
        assert!(matches!(err, RespError::UnexpectedEof));
        assert_eq!(values.len(), 1);
        assert_eq!(
            values[0].as_cmd_line().unwrap(),
            crate::to_cmd_line(["SET", "k", "v"])
        );
    }

    #[test]
    fn parses_consecutive_frames() {
        let (values, _) = parse_all(b"+OK\r\n:42\r\n$-1\r\n");
        assert_eq!(
            values,
            vec![
                RespValue::SimpleString(Bytes::from("OK")),
                RespValue::Integer(42),
                RespValue::Null,
            ]
        );
    }

    #[test]
    fn truncated_bulk_is_eof() {
        let (values, err) = parse_all(b"*2\r\n$3\r\nGET\r\n$5\r\nhel");
        assert!(values.is_empty());
        assert!(matches!(err, RespError::UnexpectedEof));
    }

    #[test]
    fn bare_lf_is_rejected() {
        let (_, err) = parse_all(b"+OK\n");
        assert!(matches!(err, RespError::InvalidFormat(_)));
    }

    #[test]
    fn binary_safe_payload() {
        let (values, _) = parse_all(b"$4\r\na\r\nb\r\n");
        assert_eq!(
            values,
            vec![RespValue::BulkString(Bytes::from(b"a\r\nb".as_slice()))]
        );
    }
}
