//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies one frame at a
//! time, so a pipelined stream of N replies is consumed by exactly N calls.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are framed and read by byte length.
//! 4. **Exact Consumption**: A parse never reads past the end of its reply.

use std::io::BufRead;

use itoa::Buffer;

use crate::error::{ClientError, ClientResult};

/// Largest bulk payload accepted from a server (matches the server-side default).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings, with None for `$-1`.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, with None for `*-1`.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Returns the payload of a status or present bulk reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Returns the value of an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// True for the absent bulk and absent array replies.
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Bulk(None) | RespValue::Array(None))
    }

    /// True for a server error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Splits a flat `field, value, field, value` array (HGETALL and friends)
    /// into ordered pairs.
    ///
    /// Returns `None` for non-arrays, odd lengths, or non-bulk elements.
    pub fn into_pairs(self) -> Option<Vec<(Vec<u8>, Vec<u8>)>> {
        let items = match self {
            RespValue::Array(Some(items)) => items,
            _ => return None,
        };
        if items.len() % 2 != 0 {
            return None;
        }

        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            match (field, value) {
                (RespValue::Bulk(Some(field)), RespValue::Bulk(Some(value))) => {
                    pairs.push((field, value))
                }
                _ => return None,
            }
        }
        Some(pairs)
    }
}

/// Encodes one RESP2 multi-bulk request into `out`.
///
/// The command name is the first element and is uppercased; arguments are
/// framed by their exact byte length.
pub fn encode_command<A: AsRef<[u8]>>(name: &[u8], args: &[A], out: &mut Vec<u8>) {
    let mut digits = Buffer::new();

    out.push(b'*');
    out.extend_from_slice(digits.format(args.len() + 1).as_bytes());
    out.extend_from_slice(b"\r\n");

    out.push(b'$');
    out.extend_from_slice(digits.format(name.len()).as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend(name.iter().map(u8::to_ascii_uppercase));
    out.extend_from_slice(b"\r\n");

    for arg in args {
        let arg = arg.as_ref();
        out.push(b'$');
        out.extend_from_slice(digits.format(arg.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
///
/// End of stream surfaces as an `UnexpectedEof` I/O error. A malformed
/// single-line frame surfaces as `ClientError::Protocol` once its line is
/// consumed, leaving the stream at the next reply. A malformed bulk or array,
/// whose remaining bytes cannot be located, surfaces as `ClientError::Desync`.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol("empty reply line"));
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])
                .map_err(|_| ClientError::Desync("invalid bulk length"))?;
            read_bulk(reader, len)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])
                .map_err(|_| ClientError::Desync("invalid array length"))?;
            read_array(reader, len, line_buf)
        }
        _ => Err(ClientError::Protocol("unknown reply type")),
    }
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64) -> ClientResult<RespValue> {
    match len {
        -1 => return Ok(RespValue::Bulk(None)),
        len if len < -1 || len > MAX_BULK_LEN => {
            return Err(ClientError::Desync("invalid bulk length"))
        }
        _ => {}
    }

    let len = len as usize;
    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data)?;
    if data[len..] != *b"\r\n" {
        // The declared length was wrong, so the real end of the payload is unknown.
        return Err(ClientError::Desync("bulk payload not terminated by CRLF"));
    }
    data.truncate(len);
    Ok(RespValue::Bulk(Some(data)))
}

fn read_array<R: BufRead>(reader: &mut R, len: i64, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    if len == -1 {
        return Ok(RespValue::Array(None));
    }
    if len < -1 {
        return Err(ClientError::Desync("invalid array length"));
    }

    let mut items = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        // A bad element leaves its siblings unread on the stream.
        let item = read_response(reader, line_buf).map_err(|err| match err {
            ClientError::Protocol(reason) => ClientError::Desync(reason),
            other => other,
        })?;
        items.push(item);
    }
    Ok(RespValue::Array(Some(items)))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    reader.read_until(b'\n', buf)?;
    // Zero bytes, or a line cut off before its '\n', both mean the peer hung up.
    if buf.last() != Some(&b'\n') {
        return Err(ClientError::closed_by_peer());
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol("line not terminated by CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(ClientError::Protocol("invalid integer"))
}
