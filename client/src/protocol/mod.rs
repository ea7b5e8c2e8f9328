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

//! # The iproto wire protocol
//!
//! An iproto packet is a length prefix (one MessagePack unsigned integer)
//! followed by two MessagePack maps: the header (request type/response code,
//! sync id, schema id) and an opcode-specific body. This module defines the
//! wire constants, the [`Request`] model that the engine dispatches, and the
//! [`Response`] that comes back.

pub mod codec;
pub mod greeting;
pub mod value;
#[cfg(test)]
mod tests;

use {
    crate::{
        error::{ClientResult, Error},
        schema::SchemaCache,
        util,
    },
    self::value::Value,
};

consts! {
    // header keys
    pub(crate) KEY_REQUEST_TYPE: u8 = 0x00;
    pub(crate) KEY_SYNC: u8 = 0x01;
    pub(crate) KEY_SCHEMA_ID: u8 = 0x05;
    // body keys
    pub(crate) KEY_SPACE_ID: u8 = 0x10;
    pub(crate) KEY_INDEX_ID: u8 = 0x11;
    pub(crate) KEY_LIMIT: u8 = 0x12;
    pub(crate) KEY_OFFSET: u8 = 0x13;
    pub(crate) KEY_ITERATOR: u8 = 0x14;
    pub(crate) KEY_KEY: u8 = 0x20;
    pub(crate) KEY_TUPLE: u8 = 0x21;
    pub(crate) KEY_FUNCTION_NAME: u8 = 0x22;
    pub(crate) KEY_USER_NAME: u8 = 0x23;
    pub(crate) KEY_EXPRESSION: u8 = 0x27;
    pub(crate) KEY_OPS: u8 = 0x28;
    pub(crate) KEY_DATA: u8 = 0x30;
    pub(crate) KEY_ERROR: u8 = 0x31;
    pub(crate) KEY_METADATA: u8 = 0x32;
    pub(crate) KEY_SQL_TEXT: u8 = 0x40;
    pub(crate) KEY_SQL_BIND: u8 = 0x41;
    pub(crate) KEY_SQL_INFO: u8 = 0x42;
    // keys nested inside METADATA / SQL_INFO
    pub(crate) KEY_FIELD_NAME: u64 = 0x00;
    pub(crate) KEY_SQL_ROW_COUNT: u64 = 0x00;
    // the high bit pattern marking an error response code
    pub(crate) CODE_ERROR_MARKER: u32 = 0x8000;
    /// the distinguished code the server uses to reject a request carrying a
    /// stale schema id
    pub(crate) ER_WRONG_SCHEMA_VERSION: u32 = 109;
    // server codes flagged transient (replica is read-only / still loading)
    pub(crate) ER_READONLY: u32 = 7;
    pub(crate) ER_LOADING: u32 = 116;
}

/// Is this (already unmasked) server code worth a retry elsewhere?
pub(crate) fn is_transient_code(code: u32) -> bool {
    code == ER_READONLY || code == ER_LOADING
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// Request opcodes
pub(crate) enum Opcode {
    Select = 1,
    Insert = 2,
    Replace = 3,
    Update = 4,
    Delete = 5,
    /// the legacy call opcode, kept for servers predating the modern calling
    /// convention
    OldCall = 6,
    Auth = 7,
    Eval = 8,
    Upsert = 9,
    Call = 10,
    Execute = 11,
    Ping = 64,
}

impl Opcode {
    pub const fn code(self) -> u64 {
        self as u64
    }
    /// Opcodes whose response body is a single result row rather than a list
    /// of rows
    pub const fn single_row(self) -> bool {
        matches!(self, Self::Eval | Self::Call | Self::OldCall)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// Index iteration order for SELECT
pub enum Iter {
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
}

/// A space or index reference: by numeric id, or by name (resolved against
/// the schema cache at dispatch time)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    Id(u32),
    Name(String),
}

impl From<u32> for Ref {
    fn from(id: u32) -> Self {
        Ref::Id(id)
    }
}

impl From<&str> for Ref {
    fn from(name: &str) -> Self {
        Ref::Name(name.to_owned())
    }
}

impl From<String> for Ref {
    fn from(name: String) -> Self {
        Ref::Name(name)
    }
}

/// One body cell: either immediately serializable, or a deferred lookup that
/// cannot be encoded until the schema cache knows the referenced name
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    Value(Value),
    /// space id, by name
    Space(String),
    /// index id, by name, within the space this request addresses
    Index(String),
}

/// One logical request: an opcode plus its body cells.
///
/// Construct through the associated functions and hand to
/// [`Client::exec`](crate::Client::exec), or use the typed convenience
/// methods on the client
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub(crate) op: Opcode,
    pub(crate) body: Vec<(u8, Arg)>,
}

impl Request {
    fn new(op: Opcode, body: Vec<(u8, Arg)>) -> Self {
        Self { op, body }
    }
    fn space_arg(space: Ref) -> (u8, Arg) {
        match space {
            Ref::Id(id) => (KEY_SPACE_ID, Arg::Value(Value::Uint(id as u64))),
            Ref::Name(name) => (KEY_SPACE_ID, Arg::Space(name)),
        }
    }
    fn index_arg(index: Ref) -> (u8, Arg) {
        match index {
            Ref::Id(id) => (KEY_INDEX_ID, Arg::Value(Value::Uint(id as u64))),
            Ref::Name(name) => (KEY_INDEX_ID, Arg::Index(name)),
        }
    }
    pub fn ping() -> Self {
        Self::new(Opcode::Ping, vec![])
    }
    pub fn select(
        space: impl Into<Ref>,
        index: impl Into<Ref>,
        key: Vec<Value>,
        offset: u32,
        limit: u32,
        iterator: Iter,
    ) -> Self {
        Self::new(
            Opcode::Select,
            vec![
                Self::space_arg(space.into()),
                Self::index_arg(index.into()),
                (KEY_KEY, Arg::Value(Value::Array(key))),
                (KEY_OFFSET, Arg::Value(Value::Uint(offset as u64))),
                (KEY_LIMIT, Arg::Value(Value::Uint(limit as u64))),
                (KEY_ITERATOR, Arg::Value(Value::Uint(iterator as u64))),
            ],
        )
    }
    pub fn insert(space: impl Into<Ref>, tuple: Vec<Value>) -> Self {
        Self::new(
            Opcode::Insert,
            vec![
                Self::space_arg(space.into()),
                (KEY_TUPLE, Arg::Value(Value::Array(tuple))),
            ],
        )
    }
    pub fn replace(space: impl Into<Ref>, tuple: Vec<Value>) -> Self {
        Self::new(
            Opcode::Replace,
            vec![
                Self::space_arg(space.into()),
                (KEY_TUPLE, Arg::Value(Value::Array(tuple))),
            ],
        )
    }
    pub fn update(
        space: impl Into<Ref>,
        index: impl Into<Ref>,
        key: Vec<Value>,
        ops: Vec<Value>,
    ) -> Self {
        Self::new(
            Opcode::Update,
            vec![
                Self::space_arg(space.into()),
                Self::index_arg(index.into()),
                (KEY_KEY, Arg::Value(Value::Array(key))),
                (KEY_TUPLE, Arg::Value(Value::Array(ops))),
            ],
        )
    }
    pub fn upsert(space: impl Into<Ref>, tuple: Vec<Value>, ops: Vec<Value>) -> Self {
        Self::new(
            Opcode::Upsert,
            vec![
                Self::space_arg(space.into()),
                (KEY_TUPLE, Arg::Value(Value::Array(tuple))),
                (KEY_OPS, Arg::Value(Value::Array(ops))),
            ],
        )
    }
    pub fn delete(space: impl Into<Ref>, key: Vec<Value>) -> Self {
        Self::new(
            Opcode::Delete,
            vec![
                Self::space_arg(space.into()),
                (KEY_KEY, Arg::Value(Value::Array(key))),
            ],
        )
    }
    /// `use_new_call` selects the modern CALL opcode; the legacy one differs
    /// in how the server shapes the result rows
    pub fn call(function: impl ToString, args: Vec<Value>, use_new_call: bool) -> Self {
        let op = if use_new_call {
            Opcode::Call
        } else {
            Opcode::OldCall
        };
        Self::new(
            op,
            vec![
                (
                    KEY_FUNCTION_NAME,
                    Arg::Value(Value::Str(function.to_string())),
                ),
                (KEY_TUPLE, Arg::Value(Value::Array(args))),
            ],
        )
    }
    pub fn eval(expression: impl ToString, args: Vec<Value>) -> Self {
        Self::new(
            Opcode::Eval,
            vec![
                (KEY_EXPRESSION, Arg::Value(Value::Str(expression.to_string()))),
                (KEY_TUPLE, Arg::Value(Value::Array(args))),
            ],
        )
    }
    pub fn execute(sql: impl ToString, bind: Vec<Value>) -> Self {
        Self::new(
            Opcode::Execute,
            vec![
                (KEY_SQL_TEXT, Arg::Value(Value::Str(sql.to_string()))),
                (KEY_SQL_BIND, Arg::Value(Value::Array(bind))),
            ],
        )
    }
    pub(crate) fn auth(username: &str, scramble: Vec<u8>) -> Self {
        Self::new(
            Opcode::Auth,
            vec![
                (KEY_USER_NAME, Arg::Value(Value::Str(username.to_owned()))),
                (
                    KEY_TUPLE,
                    Arg::Value(Value::Array(vec![
                        Value::Str("chap-sha1".to_owned()),
                        Value::Bin(scramble),
                    ])),
                ),
            ],
        )
    }
    /// Can every cell be encoded without consulting the schema? A fold over
    /// the cells: deferred lookups make the request not-ready
    pub(crate) fn is_ready(&self) -> bool {
        self.body.iter().all(|(_, arg)| matches!(arg, Arg::Value(_)))
    }
    /// Resolve every cell against the schema cache, producing an encodable
    /// body. Fails with a client-use error when a referenced name is unknown
    pub(crate) fn resolve(&self, schema: &dyn SchemaCache) -> ClientResult<Vec<(u8, Value)>> {
        // the space must be known before any index cell can be resolved
        let mut space_id = None;
        for (key, arg) in &self.body {
            if *key == KEY_SPACE_ID {
                space_id = match arg {
                    Arg::Value(v) => v.as_u64().map(|v| v as u32),
                    Arg::Space(name) => Some(self.lookup_space(schema, name)?),
                    Arg::Index(_) => None,
                };
            }
        }
        let mut out = Vec::with_capacity(self.body.len());
        for (key, arg) in &self.body {
            let value = match arg {
                Arg::Value(v) => v.clone(),
                Arg::Space(name) => Value::Uint(self.lookup_space(schema, name)? as u64),
                Arg::Index(name) => {
                    let space = match space_id {
                        Some(id) => id,
                        None => {
                            return util::err(Error::usage(
                                "an index can only be referenced by name within a known space",
                            ))
                        }
                    };
                    match schema.resolve_index(space, name) {
                        Some(id) => Value::Uint(id as u64),
                        None => {
                            return util::err(Error::usage(format!(
                                "unknown index '{name}' in space {space}"
                            )))
                        }
                    }
                }
            };
            out.push((*key, value));
        }
        Ok(out)
    }
    fn lookup_space(&self, schema: &dyn SchemaCache, name: &str) -> ClientResult<u32> {
        match schema.resolve_space(name) {
            Some(id) => Ok(id),
            None => util::err(Error::usage(format!("unknown space '{name}'"))),
        }
    }
}

/// A decoded response packet
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub(crate) code: u32,
    pub(crate) sync: u64,
    pub(crate) schema_id: u64,
    pub(crate) body: Vec<(u8, Value)>,
}

impl Response {
    /// `0` on success; the server error code otherwise (the wire-level error
    /// marker bit is already stripped)
    pub fn code(&self) -> u32 {
        self.code
    }
    pub fn sync(&self) -> u64 {
        self.sync
    }
    /// The schema version the server held when it answered
    pub fn schema_id(&self) -> u64 {
        self.schema_id
    }
    pub(crate) fn field(&self, key: u8) -> Option<&Value> {
        self.body
            .iter()
            .find_map(|(k, v)| if *k == key { Some(v) } else { None })
    }
    /// The DATA field of the body, if any
    pub fn data(&self) -> Option<&Value> {
        self.field(KEY_DATA)
    }
    pub(crate) fn error_message(&self) -> String {
        match self.field(KEY_ERROR) {
            Some(Value::Str(msg)) => msg.clone(),
            _ => "unknown error".to_owned(),
        }
    }
}
