/*
 * Created on Sun May 05 2024
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

//! # The in-memory row view
//!
//! Results are fully materialized: a [`RowSet`] over tuple [`Row`]s for the
//! data operations, and a [`SqlResult`] for SQL execution. Row accessors
//! convert between numeric widths; a conversion that cannot represent the
//! stored value is a client-use error. `NIL` cells read as zero through the
//! numeric accessors and as `None` through the reference ones.
//!
//! SELECT responses carry a list of rows; the call/eval family carries a
//! single result row as the body data itself; the constructors replicate
//! that distinction.

use crate::{
    error::{ClientResult, Error},
    protocol::{value::Value, Response, KEY_FIELD_NAME, KEY_METADATA, KEY_SQL_INFO, KEY_SQL_ROW_COUNT},
    util,
};

fn out_of_range(idx: usize, ty: &str) -> Error {
    Error::usage(format!("cell {idx} does not fit into {ty}"))
}

fn not_numeric(idx: usize) -> Error {
    Error::usage(format!("cell {idx} is not numeric"))
}

macro_rules! int_accessors {
    ($($fname:ident: $ty:ty),* $(,)?) => {
        $(
        /// Numeric accessor; `NIL` reads as zero, and a stored value outside
        /// the target range is a client-use error
        pub fn $fname(&self, idx: usize) -> ClientResult<$ty> {
            match self.cell(idx)? {
                Value::Nil => Ok(0),
                Value::Uint(v) => (*v)
                    .try_into()
                    .map_err(|_| out_of_range(idx, stringify!($ty))),
                Value::Int(v) => (*v)
                    .try_into()
                    .map_err(|_| out_of_range(idx, stringify!($ty))),
                _ => util::err(not_numeric(idx)),
            }
        }
        )*
    };
}

/// One tuple, positionally addressed
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    cells: Vec<Value>,
}

impl Row {
    pub(crate) fn new(cells: Vec<Value>) -> Self {
        Self { cells }
    }
    pub fn len(&self) -> usize {
        self.cells.len()
    }
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
    /// The raw cell, if the index is in bounds
    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.cells.get(idx)
    }
    fn cell(&self, idx: usize) -> ClientResult<&Value> {
        self.cells
            .get(idx)
            .ok_or_else(|| Error::usage(format!("row has no cell {idx}")))
    }
    int_accessors! {
        get_i8: i8,
        get_i16: i16,
        get_i32: i32,
        get_i64: i64,
        get_u8: u8,
        get_u16: u16,
        get_u32: u32,
        get_u64: u64,
    }
    pub fn get_f32(&self, idx: usize) -> ClientResult<f32> {
        match self.cell(idx)? {
            Value::Nil => Ok(0.0),
            Value::Float(v) => Ok(*v),
            _ => util::err(not_numeric(idx)),
        }
    }
    pub fn get_f64(&self, idx: usize) -> ClientResult<f64> {
        match self.cell(idx)? {
            Value::Nil => Ok(0.0),
            Value::Float(v) => Ok(*v as f64),
            Value::Double(v) => Ok(*v),
            Value::Uint(v) => Ok(*v as f64),
            Value::Int(v) => Ok(*v as f64),
            _ => util::err(not_numeric(idx)),
        }
    }
    pub fn get_bool(&self, idx: usize) -> ClientResult<bool> {
        match self.cell(idx)? {
            Value::Nil => Ok(false),
            Value::Bool(v) => Ok(*v),
            _ => util::err(Error::usage(format!("cell {idx} is not a boolean"))),
        }
    }
    /// Reference accessor; `NIL` reads as `None`
    pub fn get_str(&self, idx: usize) -> ClientResult<Option<&str>> {
        match self.cell(idx)? {
            Value::Nil => Ok(None),
            Value::Str(s) => Ok(Some(s)),
            _ => util::err(Error::usage(format!("cell {idx} is not a string"))),
        }
    }
    /// Reference accessor; `NIL` reads as `None`
    pub fn get_bytes(&self, idx: usize) -> ClientResult<Option<&[u8]>> {
        match self.cell(idx)? {
            Value::Nil => Ok(None),
            Value::Bin(b) => Ok(Some(b)),
            _ => util::err(Error::usage(format!("cell {idx} is not binary"))),
        }
    }
}

/// A fully materialized result set
#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    rows: Vec<Row>,
}

impl RowSet {
    /// Build the view over a response body. `single_row` replicates the
    /// opcode distinction: the call/eval family answers with one row (the
    /// body data itself); everything else answers with a list of rows
    pub(crate) fn from_response(response: &Response, single_row: bool) -> ClientResult<Self> {
        let data = match response.data() {
            Some(data) => data,
            None => return Ok(Self { rows: vec![] }),
        };
        let items = match data.as_array() {
            Some(items) => items,
            None => return util::err(Error::comm("response data is not a tuple list")),
        };
        let rows = if single_row {
            vec![Row::new(items.to_vec())]
        } else {
            items
                .iter()
                .map(|item| match item {
                    Value::Array(cells) => Row::new(cells.clone()),
                    // a scalar element is a one-cell row
                    other => Row::new(vec![other.clone()]),
                })
                .collect()
        };
        Ok(Self { rows })
    }
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
    pub fn get(&self, idx: usize) -> Option<&Row> {
        self.rows.get(idx)
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// What SQL execution produced: an affected-row count for DML/DDL, or named
/// rows for queries
#[derive(Debug, Clone, PartialEq)]
pub enum SqlResult {
    RowCount(u64),
    Rows { columns: Vec<String>, rows: Vec<Row> },
}

impl SqlResult {
    pub(crate) fn from_response(response: &Response) -> ClientResult<Self> {
        if let Some(info) = response.field(KEY_SQL_INFO) {
            let count = match info {
                Value::Map(pairs) => pairs.iter().find_map(|(k, v)| {
                    (k.as_u64() == Some(KEY_SQL_ROW_COUNT)).then(|| v.as_u64()).flatten()
                }),
                _ => None,
            };
            return match count {
                Some(count) => Ok(Self::RowCount(count)),
                None => util::err(Error::comm("sql info carries no row count")),
            };
        }
        let metadata = match response.field(KEY_METADATA).and_then(Value::as_array) {
            Some(metadata) => metadata,
            None => return util::err(Error::comm("sql response carries no metadata")),
        };
        let mut columns = Vec::with_capacity(metadata.len());
        for column in metadata {
            let name = match column {
                Value::Map(pairs) => pairs.iter().find_map(|(k, v)| {
                    if k.as_u64() == Some(KEY_FIELD_NAME) {
                        v.as_str()
                    } else {
                        None
                    }
                }),
                _ => None,
            };
            match name {
                Some(name) => columns.push(name.to_owned()),
                None => return util::err(Error::comm("sql metadata carries an unnamed column")),
            }
        }
        let rows = RowSet::from_response(response, false)?.into_rows();
        Ok(Self::Rows { columns, rows })
    }
    /// The affected-row count, if this result is one
    pub fn row_count(&self) -> Option<u64> {
        match self {
            Self::RowCount(count) => Some(*count),
            Self::Rows { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Row, RowSet, SqlResult};
    use crate::protocol::{value::Value, Response, KEY_DATA, KEY_METADATA, KEY_SQL_INFO};

    fn row(cells: Vec<Value>) -> Row {
        Row::new(cells)
    }

    #[test]
    fn numeric_widths_convert() {
        let r = row(vec![Value::Uint(300), Value::Int(-5), Value::Uint(7)]);
        assert_eq!(r.get_u16(0).unwrap(), 300);
        assert_eq!(r.get_i64(0).unwrap(), 300);
        assert_eq!(r.get_i8(1).unwrap(), -5);
        assert_eq!(r.get_u8(2).unwrap(), 7);
    }

    #[test]
    fn out_of_range_is_a_client_use_error() {
        let r = row(vec![Value::Uint(300), Value::Int(-1)]);
        assert!(matches!(
            r.get_u8(0),
            Err(crate::error::Error::ClientUse(_))
        ));
        assert!(matches!(
            r.get_u64(1),
            Err(crate::error::Error::ClientUse(_))
        ));
    }

    #[test]
    fn nil_reads_as_zero_for_numerics_and_none_for_references() {
        let r = row(vec![Value::Nil]);
        assert_eq!(r.get_i32(0).unwrap(), 0);
        assert_eq!(r.get_u64(0).unwrap(), 0);
        assert_eq!(r.get_f64(0).unwrap(), 0.0);
        assert!(!r.get_bool(0).unwrap());
        assert_eq!(r.get_str(0).unwrap(), None);
        assert_eq!(r.get_bytes(0).unwrap(), None);
    }

    #[test]
    fn non_numeric_cells_refuse_numeric_reads() {
        let r = row(vec![Value::Str("x".to_owned())]);
        assert!(r.get_i64(0).is_err());
        assert!(r.get_str(1).is_err()); // out of bounds
    }

    fn response_with(body: Vec<(u8, Value)>) -> Response {
        Response {
            code: 0,
            sync: 1,
            schema_id: 1,
            body,
        }
    }

    #[test]
    fn select_shapes_to_many_rows() {
        let resp = response_with(vec![(
            KEY_DATA,
            Value::Array(vec![
                Value::Array(vec![Value::Uint(1), Value::Str("a".to_owned())]),
                Value::Array(vec![Value::Uint(2), Value::Str("b".to_owned())]),
            ]),
        )]);
        let rows = RowSet::from_response(&resp, false).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.get(1).unwrap().get_str(1).unwrap(), Some("b"));
    }

    #[test]
    fn eval_shapes_to_a_single_row() {
        let resp = response_with(vec![(
            KEY_DATA,
            Value::Array(vec![Value::Uint(1), Value::Uint(2)]),
        )]);
        let rows = RowSet::from_response(&resp, true).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get(0).unwrap().get_u64(1).unwrap(), 2);
    }

    #[test]
    fn sql_row_count() {
        let resp = response_with(vec![(
            KEY_SQL_INFO,
            Value::Map(vec![(Value::Uint(0), Value::Uint(3))]),
        )]);
        assert_eq!(
            SqlResult::from_response(&resp).unwrap().row_count(),
            Some(3)
        );
    }

    #[test]
    fn sql_named_rows() {
        let resp = response_with(vec![
            (
                KEY_METADATA,
                Value::Array(vec![Value::Map(vec![(
                    Value::Uint(0),
                    Value::Str("id".to_owned()),
                )])]),
            ),
            (
                KEY_DATA,
                Value::Array(vec![Value::Array(vec![Value::Uint(10)])]),
            ),
        ]);
        match SqlResult::from_response(&resp).unwrap() {
            SqlResult::Rows { columns, rows } => {
                assert_eq!(columns, vec!["id".to_owned()]);
                assert_eq!(rows[0].get_u64(0).unwrap(), 10);
            }
            other => panic!("unexpected sql result: {other:?}"),
        }
    }
}
