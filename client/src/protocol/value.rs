/*
 * Created on Mon Mar 11 2024
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

//! A compact dynamic MessagePack value.
//!
//! Tuples travelling over the wire are heterogeneous, so the codec needs a
//! value type that can hold any well-formed MessagePack term. Encoding goes
//! through `rmp`'s primitive writers; decoding walks the buffer with a
//! [`Scanner`] and dispatches on `rmp`'s marker taxonomy.

use {
    rmp::{encode, Marker},
    std::io,
};

/// Nesting beyond this is assumed to be a hostile or corrupt stream
const MAX_DEPTH: usize = 32;

fn emap(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    /// signed integer (any negative integer on the wire)
    Int(i64),
    /// unsigned integer (any non-negative integer on the wire)
    Uint(u64),
    Float(f32),
    Double(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Uint(v) if *v <= i64::MAX as u64 => Some(*v as i64),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
    /// Encode this value into the given writer
    pub fn encode(&self, wrt: &mut impl io::Write) -> io::Result<()> {
        match self {
            Value::Nil => encode::write_nil(wrt)?,
            Value::Bool(b) => encode::write_bool(wrt, *b)?,
            Value::Int(v) => {
                encode::write_sint(wrt, *v).map_err(emap)?;
            }
            Value::Uint(v) => {
                encode::write_uint(wrt, *v).map_err(emap)?;
            }
            Value::Float(v) => encode::write_f32(wrt, *v).map_err(emap)?,
            Value::Double(v) => encode::write_f64(wrt, *v).map_err(emap)?,
            Value::Str(s) => encode::write_str(wrt, s).map_err(emap)?,
            Value::Bin(b) => encode::write_bin(wrt, b).map_err(emap)?,
            Value::Array(items) => {
                encode::write_array_len(wrt, items.len() as u32).map_err(emap)?;
                for item in items {
                    item.encode(wrt)?;
                }
            }
            Value::Map(pairs) => {
                encode::write_map_len(wrt, pairs.len() as u32).map_err(emap)?;
                for (k, v) in pairs {
                    k.encode(wrt)?;
                    v.encode(wrt)?;
                }
            }
        }
        Ok(())
    }
    /// Decode one value off the scanner
    pub(crate) fn decode(scanner: &mut Scanner<'_>) -> Result<Value, ScanError> {
        Self::decode_depth(scanner, 0)
    }
    fn decode_depth(scanner: &mut Scanner<'_>, depth: usize) -> Result<Value, ScanError> {
        if depth > MAX_DEPTH {
            return Err(ScanError::Malformed("nesting too deep"));
        }
        let marker = Marker::from_u8(scanner.next_byte()?);
        let value = match marker {
            Marker::Null => Value::Nil,
            Marker::True => Value::Bool(true),
            Marker::False => Value::Bool(false),
            Marker::FixPos(v) => Value::Uint(v as u64),
            Marker::FixNeg(v) => Value::Int(v as i64),
            Marker::U8 => Value::Uint(scanner.next_byte()? as u64),
            Marker::U16 => Value::Uint(scanner.next_u16()? as u64),
            Marker::U32 => Value::Uint(scanner.next_u32()? as u64),
            Marker::U64 => Value::Uint(scanner.next_u64()?),
            Marker::I8 => Value::Int(scanner.next_byte()? as i8 as i64),
            Marker::I16 => Value::Int(scanner.next_u16()? as i16 as i64),
            Marker::I32 => Value::Int(scanner.next_u32()? as i32 as i64),
            Marker::I64 => Value::Int(scanner.next_u64()? as i64),
            Marker::F32 => Value::Float(f32::from_bits(scanner.next_u32()?)),
            Marker::F64 => Value::Double(f64::from_bits(scanner.next_u64()?)),
            Marker::FixStr(len) => Self::decode_str(scanner, len as usize)?,
            Marker::Str8 => {
                let len = scanner.next_byte()? as usize;
                Self::decode_str(scanner, len)?
            }
            Marker::Str16 => {
                let len = scanner.next_u16()? as usize;
                Self::decode_str(scanner, len)?
            }
            Marker::Str32 => {
                let len = scanner.next_u32()? as usize;
                Self::decode_str(scanner, len)?
            }
            Marker::Bin8 => {
                let len = scanner.next_byte()? as usize;
                Value::Bin(scanner.next_chunk(len)?.to_vec())
            }
            Marker::Bin16 => {
                let len = scanner.next_u16()? as usize;
                Value::Bin(scanner.next_chunk(len)?.to_vec())
            }
            Marker::Bin32 => {
                let len = scanner.next_u32()? as usize;
                Value::Bin(scanner.next_chunk(len)?.to_vec())
            }
            Marker::FixArray(len) => Self::decode_array(scanner, len as usize, depth)?,
            Marker::Array16 => {
                let len = scanner.next_u16()? as usize;
                Self::decode_array(scanner, len, depth)?
            }
            Marker::Array32 => {
                let len = scanner.next_u32()? as usize;
                Self::decode_array(scanner, len, depth)?
            }
            Marker::FixMap(len) => Self::decode_map(scanner, len as usize, depth)?,
            Marker::Map16 => {
                let len = scanner.next_u16()? as usize;
                Self::decode_map(scanner, len, depth)?
            }
            Marker::Map32 => {
                let len = scanner.next_u32()? as usize;
                Self::decode_map(scanner, len, depth)?
            }
            _ => return Err(ScanError::Malformed("unsupported marker")),
        };
        Ok(value)
    }
    fn decode_str(scanner: &mut Scanner<'_>, len: usize) -> Result<Value, ScanError> {
        let raw = scanner.next_chunk(len)?;
        match std::str::from_utf8(raw) {
            Ok(s) => Ok(Value::Str(s.to_owned())),
            Err(_) => Err(ScanError::Malformed("string cell is not valid UTF-8")),
        }
    }
    fn decode_array(
        scanner: &mut Scanner<'_>,
        len: usize,
        depth: usize,
    ) -> Result<Value, ScanError> {
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(Self::decode_depth(scanner, depth + 1)?);
        }
        Ok(Value::Array(items))
    }
    fn decode_map(scanner: &mut Scanner<'_>, len: usize, depth: usize) -> Result<Value, ScanError> {
        let mut pairs = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            let k = Self::decode_depth(scanner, depth + 1)?;
            let v = Self::decode_depth(scanner, depth + 1)?;
            pairs.push((k, v));
        }
        Ok(Value::Map(pairs))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        if v >= 0 {
            Value::Uint(v as u64)
        } else {
            Value::Int(v)
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

/// What went wrong while walking a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanError {
    /// ran off the end of the buffer
    Eof,
    /// the buffer holds something that isn't well-formed MessagePack
    Malformed(&'static str),
}

/// A cursor over a byte slice. The scanner never reads past the end; all
/// accessors report [`ScanError::Eof`] instead
#[derive(Debug)]
pub(crate) struct Scanner<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Scanner<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }
    pub fn position(&self) -> usize {
        self.at
    }
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.at
    }
    pub fn has_left(&self, count: usize) -> bool {
        self.remaining() >= count
    }
    pub fn next_byte(&mut self) -> Result<u8, ScanError> {
        if self.has_left(1) {
            let byte = self.buf[self.at];
            self.at += 1;
            Ok(byte)
        } else {
            Err(ScanError::Eof)
        }
    }
    pub fn next_chunk(&mut self, len: usize) -> Result<&'a [u8], ScanError> {
        if self.has_left(len) {
            let chunk = &self.buf[self.at..self.at + len];
            self.at += len;
            Ok(chunk)
        } else {
            Err(ScanError::Eof)
        }
    }
    pub fn next_u16(&mut self) -> Result<u16, ScanError> {
        Ok(u16::from_be_bytes(self.next_chunk(2)?.try_into().unwrap()))
    }
    pub fn next_u32(&mut self) -> Result<u32, ScanError> {
        Ok(u32::from_be_bytes(self.next_chunk(4)?.try_into().unwrap()))
    }
    pub fn next_u64(&mut self) -> Result<u64, ScanError> {
        Ok(u64::from_be_bytes(self.next_chunk(8)?.try_into().unwrap()))
    }
    /// Read one MessagePack unsigned integer (any width)
    pub fn next_uint(&mut self) -> Result<u64, ScanError> {
        match Value::decode(self)? {
            Value::Uint(v) => Ok(v),
            _ => Err(ScanError::Malformed("expected an unsigned integer")),
        }
    }
}
