use crate::error::{Error, Result};
use crate::protocol::command::Command;
use bytes::{Bytes, BytesMut};
use memchr::memchr;
use std::str;

/// Largest bulk payload accepted from the wire (Redis' own limit)
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Incremental RESP (REdis Serialization Protocol) decoder
pub struct RespParser {
    buffer: BytesMut,
    position: usize,
}

/// Raw response node. Lives only between decoding and projection.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }

    /// Short type name used in corruption messages
    pub fn kind(&self) -> &'static str {
        match self {
            RespValue::SimpleString(_) => "simple string",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::BulkString(_) => "bulk string",
            RespValue::Array(_) => "array",
        }
    }
}

impl RespParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            position: 0,
        }
    }

    /// Feed data into the parser
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// True while bytes of an unfinished frame are buffered
    pub fn has_partial(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Drop everything buffered, e.g. after a fault
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.position = 0;
    }

    /// Parse next complete RESP value
    pub fn parse_next(&mut self) -> Result<Option<RespValue>> {
        if self.position >= self.buffer.len() {
            return Ok(None);
        }

        let remaining = &self.buffer[self.position..];

        match parse_value(remaining)? {
            Some((value, consumed)) => {
                self.position += consumed;

                // Compact buffer if needed
                if self.position > self.buffer.len() / 2 {
                    let _ = self.buffer.split_to(self.position);
                    self.position = 0;
                }

                Ok(Some(value))
            }
            None => Ok(None), // Need more data
        }
    }
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode exactly one frame from a complete buffer.
///
/// A frame that ends before all announced bytes arrived is reported as
/// corrupt rather than waited on.
pub fn decode(buf: &[u8]) -> Result<RespValue> {
    match parse_value(buf)? {
        Some((value, _)) => Ok(value),
        None => Err(Error::corrupt("truncated frame")),
    }
}

/// Parse a RESP value from buffer
fn parse_value(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    match buf[0] {
        b'+' => parse_simple_string(buf),
        b'-' => parse_error(buf),
        b':' => parse_integer(buf),
        b'$' => parse_bulk_string(buf),
        b'*' => parse_array(buf),
        other => Err(Error::corrupt(format!(
            "invalid RESP type byte 0x{:02x}",
            other
        ))),
    }
}

/// Parse simple string: +OK\r\n
fn parse_simple_string(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
    if let Some(end) = find_crlf(buf)? {
        let data = Bytes::copy_from_slice(&buf[1..end]);
        Ok(Some((RespValue::SimpleString(data), end + 2)))
    } else {
        Ok(None)
    }
}

/// Parse error: -ERR message\r\n
fn parse_error(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
    if let Some(end) = find_crlf(buf)? {
        let msg = String::from_utf8_lossy(&buf[1..end]).into_owned();
        Ok(Some((RespValue::Error(msg), end + 2)))
    } else {
        Ok(None)
    }
}

/// Parse integer: :123\r\n
fn parse_integer(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
    if let Some(end) = find_crlf(buf)? {
        let num = parse_number(&buf[1..end], "integer")?;
        Ok(Some((RespValue::Integer(num), end + 2)))
    } else {
        Ok(None)
    }
}

/// Parse bulk string: $6\r\nfoobar\r\n or $-1\r\n (null)
fn parse_bulk_string(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
    let len_end = match find_crlf(buf)? {
        Some(pos) => pos,
        None => return Ok(None),
    };

    let len = parse_number(&buf[1..len_end], "bulk string length")?;

    if len < 0 {
        // Null bulk string
        return Ok(Some((RespValue::BulkString(None), len_end + 2)));
    }
    if len > MAX_BULK_LEN {
        return Err(Error::corrupt(format!("bulk string length {} too large", len)));
    }

    let len = len as usize;
    let data_start = len_end + 2;
    let data_end = data_start + len;

    if buf.len() < data_end + 2 {
        return Ok(None);
    }

    if buf[data_end] != b'\r' || buf[data_end + 1] != b'\n' {
        return Err(Error::corrupt("missing CRLF after bulk string"));
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_end]);
    Ok(Some((RespValue::BulkString(Some(data)), data_end + 2)))
}

/// Parse array: *2\r\n$3\r\nGET\r\n$3\r\nkey\r\n
fn parse_array(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
    let len_end = match find_crlf(buf)? {
        Some(pos) => pos,
        None => return Ok(None),
    };

    let len = parse_number(&buf[1..len_end], "array length")?;

    if len < 0 {
        // Null array, distinct from the empty array
        return Ok(Some((RespValue::Array(None), len_end + 2)));
    }

    let len = len as usize;
    let mut elements = Vec::with_capacity(len.min(1024));
    let mut pos = len_end + 2;

    for _ in 0..len {
        match parse_value(&buf[pos..])? {
            Some((value, consumed)) => {
                elements.push(value);
                pos += consumed;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((RespValue::Array(Some(elements)), pos)))
}

/// Position of the `\r` of the first line terminator. A bare `\n` is corrupt.
#[inline]
fn find_crlf(buf: &[u8]) -> Result<Option<usize>> {
    match memchr(b'\n', buf) {
        Some(lf) if lf > 0 && buf[lf - 1] == b'\r' => Ok(Some(lf - 1)),
        Some(_) => Err(Error::corrupt("line not terminated by CRLF")),
        None => Ok(None),
    }
}

fn parse_number(data: &[u8], what: &str) -> Result<i64> {
    str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::corrupt(format!(
                "invalid {}: {}",
                what,
                String::from_utf8_lossy(data)
            ))
        })
}

/// Append the request frame for `cmd` to `buf`.
///
/// `*<argc+1>\r\n$<len>\r\n<name>\r\n` followed by one bulk string per
/// argument; a null argument is written as `$-1\r\n`.
pub fn encode_command(cmd: &Command, buf: &mut Vec<u8>) {
    let mut num_buf = itoa::Buffer::new();

    buf.push(b'*');
    buf.extend_from_slice(num_buf.format(cmd.arguments().len() + 1).as_bytes());
    buf.extend_from_slice(b"\r\n");

    write_bulk(buf, cmd.name());
    for arg in cmd.arguments() {
        match arg {
            Some(arg) => write_bulk(buf, arg),
            None => buf.extend_from_slice(b"$-1\r\n"),
        }
    }
}

/// Encode one command into a fresh buffer
pub fn encode(cmd: &Command) -> Vec<u8> {
    let mut buf = Vec::with_capacity(estimate_command_size(cmd));
    encode_command(cmd, &mut buf);
    buf
}

#[inline]
fn write_bulk(buf: &mut Vec<u8>, data: &[u8]) {
    let mut num_buf = itoa::Buffer::new();
    buf.push(b'$');
    buf.extend_from_slice(num_buf.format(data.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

#[inline]
fn estimate_command_size(cmd: &Command) -> usize {
    let args: usize = cmd
        .arguments()
        .iter()
        .map(|a| a.as_ref().map(|a| a.len()).unwrap_or(0) + 16)
        .sum();
    cmd.name().len() + args + 32
}

/// Write RESP value directly to buffer
pub fn write_resp_value(buf: &mut Vec<u8>, value: &RespValue) {
    match value {
        RespValue::SimpleString(s) => {
            buf.push(b'+');
            buf.extend_from_slice(s);
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::Error(e) => {
            buf.push(b'-');
            buf.extend_from_slice(e.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(n) => {
            buf.push(b':');
            let mut num_buf = itoa::Buffer::new();
            buf.extend_from_slice(num_buf.format(*n).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(Some(s)) => write_bulk(buf, s),
        RespValue::BulkString(None) => {
            buf.extend_from_slice(b"$-1\r\n");
        }
        RespValue::Array(Some(arr)) => {
            buf.push(b'*');
            let mut num_buf = itoa::Buffer::new();
            buf.extend_from_slice(num_buf.format(arr.len()).as_bytes());
            buf.extend_from_slice(b"\r\n");
            for item in arr {
                write_resp_value(buf, item);
            }
        }
        RespValue::Array(None) => {
            buf.extend_from_slice(b"*-1\r\n");
        }
    }
}
