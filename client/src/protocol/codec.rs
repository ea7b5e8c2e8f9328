/*
 * Created on Tue Mar 12 2024
 *
 * This file is a part of the iproto driver
 * The iproto driver is a free and open-source asynchronous client, written
 * by Sayan Nandan ("the Author"), for databases speaking the MessagePack
 * based iproto protocol, with the vision to provide a safe, reliable and
 * performant driver for the Rust ecosystem.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The framed codec: request records in, length-prefixed byte frames out, and
//! the reverse for responses. The codec is pure; it owns no socket and keeps
//! no state between packets.

use {
    super::{
        value::{ScanError, Scanner, Value},
        Opcode, Response, CODE_ERROR_MARKER, KEY_REQUEST_TYPE, KEY_SCHEMA_ID, KEY_SYNC,
    },
    rmp::encode,
};

/// Frames past this limit are either a caller mistake (encode side) or an
/// untrustworthy stream (decode side)
pub(crate) const MAX_PACKET: usize = 64 * 1024 * 1024;

/// How a frame operation can fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameError {
    /// the stream holds bytes that are not a well-formed packet. Fatal to the
    /// connection
    Malformed(&'static str),
    /// the packet exceeds [`MAX_PACKET`]. Surfaced to the caller; the
    /// connection survives
    Oversize(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed packet: {msg}"),
            Self::Oversize(size) => {
                write!(f, "packet of {size} bytes exceeds the {MAX_PACKET} byte limit")
            }
        }
    }
}

impl From<FrameError> for crate::error::Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Malformed(_) => crate::error::Error::comm(e),
            FrameError::Oversize(_) => crate::error::Error::usage(e),
        }
    }
}

impl From<ScanError> for FrameError {
    fn from(e: ScanError) -> Self {
        match e {
            // the caller only decodes complete frames, so running off the end
            // of one means the frame itself is bad
            ScanError::Eof => FrameError::Malformed("truncated packet"),
            ScanError::Malformed(msg) => FrameError::Malformed(msg),
        }
    }
}

/// Encode one request packet: length prefix, header map, body map
pub(crate) fn encode_request(
    op: Opcode,
    sync: u64,
    schema_id: u64,
    body: &[(u8, Value)],
) -> Result<Vec<u8>, FrameError> {
    let mut payload = Vec::with_capacity(64);
    let header_fields = if schema_id == 0 { 2 } else { 3 };
    // the payload writers only fail on I/O errors, which a Vec can't produce
    encode::write_map_len(&mut payload, header_fields).expect("infallible write");
    encode::write_uint(&mut payload, KEY_REQUEST_TYPE as u64).expect("infallible write");
    encode::write_uint(&mut payload, op.code()).expect("infallible write");
    encode::write_uint(&mut payload, KEY_SYNC as u64).expect("infallible write");
    encode::write_uint(&mut payload, sync).expect("infallible write");
    if schema_id != 0 {
        encode::write_uint(&mut payload, KEY_SCHEMA_ID as u64).expect("infallible write");
        encode::write_uint(&mut payload, schema_id).expect("infallible write");
    }
    encode::write_map_len(&mut payload, body.len() as u32).expect("infallible write");
    for (key, value) in body {
        encode::write_uint(&mut payload, *key as u64).expect("infallible write");
        value.encode(&mut payload).expect("infallible write");
    }
    if payload.len() > MAX_PACKET {
        return Err(FrameError::Oversize(payload.len()));
    }
    // fixed-width length prefix so the frame size is known before encoding
    let mut frame = Vec::with_capacity(5 + payload.len());
    encode::write_u32(&mut frame, payload.len() as u32).expect("infallible write");
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Try to decode one packet off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame
/// (read more and retry), or `Ok(Some((packet, advance)))` where `advance`
/// bytes of `buf` have been consumed. Both responses and requests decode
/// through this routine: for a request, `code` is the opcode
pub(crate) fn try_decode(buf: &[u8]) -> Result<Option<(Response, usize)>, FrameError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut scanner = Scanner::new(buf);
    let len = match scanner.next_uint() {
        Ok(len) => len as usize,
        Err(ScanError::Eof) => return Ok(None),
        Err(ScanError::Malformed(_)) => {
            return Err(FrameError::Malformed("bad length prefix"));
        }
    };
    if len > MAX_PACKET {
        return Err(FrameError::Malformed("length prefix out of bounds"));
    }
    let total = scanner.position() + len;
    if buf.len() < total {
        return Ok(None);
    }
    let mut scanner = Scanner::new(&buf[scanner.position()..total]);
    let packet = decode_packet(&mut scanner)?;
    Ok(Some((packet, total)))
}

fn decode_packet(scanner: &mut Scanner<'_>) -> Result<Response, FrameError> {
    let mut code = 0;
    let mut sync = 0;
    let mut schema_id = 0;
    let header_fields = match Value::decode(scanner)? {
        Value::Map(pairs) => pairs,
        _ => return Err(FrameError::Malformed("header is not a map")),
    };
    for (key, value) in header_fields {
        let (key, value) = match (key.as_u64(), value.as_u64()) {
            (Some(k), Some(v)) => (k, v),
            _ => return Err(FrameError::Malformed("non-integer header field")),
        };
        match key as u8 {
            KEY_REQUEST_TYPE => code = value as u32,
            KEY_SYNC => sync = value,
            KEY_SCHEMA_ID => schema_id = value,
            _ => {}
        }
    }
    if code & CODE_ERROR_MARKER != 0 {
        code &= !CODE_ERROR_MARKER;
    }
    let mut body = Vec::new();
    if scanner.remaining() != 0 {
        let pairs = match Value::decode(scanner)? {
            Value::Map(pairs) => pairs,
            _ => return Err(FrameError::Malformed("body is not a map")),
        };
        for (key, value) in pairs {
            match key.as_u64() {
                Some(k) => body.push((k as u8, value)),
                None => return Err(FrameError::Malformed("non-integer body key")),
            }
        }
    }
    Ok(Response {
        code,
        sync,
        schema_id,
        body,
    })
}
