//! RESP protocol sync encoder
//!
//! The append-only file is a concatenation of frames produced here.

use crate::RespValue;
use std::io::{self, Write};

/// Encode a RESP value into a writer.
pub fn encode<W: Write>(value: &RespValue, writer: &mut W) -> io::Result<()> {
    match value {
        RespValue::SimpleString(s) => {
            writer.write_all(b"+")?;
            writer.write_all(s)?;
            writer.write_all(b"\r\n")?;
        }
        RespValue::Error(e) => {
            writer.write_all(b"-")?;
            writer.write_all(e)?;
            writer.write_all(b"\r\n")?;
        }
        RespValue::Integer(i) => {
            write!(writer, ":{}\r\n", i)?;
        }
        RespValue::BulkString(b) => {
            write!(writer, "${}\r\n", b.len())?;
            writer.write_all(b)?;
            writer.write_all(b"\r\n")?;
        }
        RespValue::Null => {
            writer.write_all(b"$-1\r\n")?;
        }
        RespValue::Array(items) => {
            write!(writer, "*{}\r\n", items.len())?;
            for item in items {
                encode(item, writer)?;
            }
        }
    }
    Ok(())
}

/// Encode a RESP value into a byte vector.
pub fn encode_to_vec(value: &RespValue) -> Vec<u8> {
    let mut buf = Vec::new();
    // Vec<u8> writes cannot fail
    encode(value, &mut buf).expect("write to Vec");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn encodes_simple_string() {
        let value = RespValue::SimpleString(Bytes::from("OK"));
        assert_eq!(encode_to_vec(&value), b"+OK\r\n");
    }

    #[test]
    fn encodes_null() {
        assert_eq!(encode_to_vec(&RespValue::Null), b"$-1\r\n");
    }

    #[test]
    fn encodes_cmd_line_as_multi_bulk() {
        let value = RespValue::from_cmd_line(crate::to_cmd_line(["GET", "key"]));
        assert_eq!(encode_to_vec(&value), b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn encode_parse_round_trip() {
        let value = RespValue::Array(vec![
            RespValue::Integer(-3),
            RespValue::BulkString(Bytes::from(b"a\r\nb".as_slice())),
            RespValue::Null,
        ]);
        let bytes = encode_to_vec(&value);
        let mut parser = crate::RespParser::new(std::io::Cursor::new(bytes));
        assert_eq!(parser.parse().unwrap(), value);
    }
}
