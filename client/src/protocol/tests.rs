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

use {
    super::{
        codec::{self, FrameError, MAX_PACKET},
        value::{Scanner, Value},
        Arg, Iter, Opcode, Request, KEY_INDEX_ID, KEY_SPACE_ID,
    },
    crate::schema::StaticSchema,
    rand::Rng,
};

fn roundtrip(value: &Value) -> Value {
    let mut buf = Vec::new();
    value.encode(&mut buf).unwrap();
    let mut scanner = Scanner::new(&buf);
    let decoded = Value::decode(&mut scanner).unwrap();
    assert_eq!(scanner.remaining(), 0);
    decoded
}

#[test]
fn value_roundtrip() {
    let samples = [
        Value::Nil,
        Value::Bool(true),
        Value::Bool(false),
        Value::Uint(0),
        Value::Uint(127),
        Value::Uint(u64::MAX),
        Value::Int(-1),
        Value::Int(i64::MIN),
        Value::Double(3.25),
        Value::Str("hello".to_owned()),
        Value::Str(String::new()),
        Value::Bin(vec![0, 1, 2, 255]),
        Value::Array(vec![Value::Uint(1), Value::Str("two".to_owned()), Value::Nil]),
        Value::Map(vec![(Value::Uint(1), Value::Array(vec![Value::Bool(true)]))]),
    ];
    for value in samples {
        assert_eq!(roundtrip(&value), value);
    }
}

#[test]
fn value_roundtrip_random_ints() {
    let mut rng = rand::thread_rng();
    for _ in 0..512 {
        let v: i64 = rng.gen();
        let value = if v < 0 { Value::Int(v) } else { Value::Uint(v as u64) };
        assert_eq!(roundtrip(&value), value);
    }
}

#[test]
fn value_rejects_deep_nesting() {
    let mut buf = Vec::new();
    for _ in 0..64 {
        // fixarray of length 1, nested
        buf.push(0x91);
    }
    buf.push(0xc0); // nil
    let mut scanner = Scanner::new(&buf);
    assert!(Value::decode(&mut scanner).is_err());
}

#[test]
fn packet_roundtrip() {
    let body = vec![
        (super::KEY_SPACE_ID, Value::Uint(512)),
        (
            super::KEY_TUPLE,
            Value::Array(vec![Value::Uint(1), Value::Str("k".to_owned())]),
        ),
    ];
    let frame = codec::encode_request(Opcode::Insert, 77, 9, &body).unwrap();
    let (packet, advance) = codec::try_decode(&frame).unwrap().unwrap();
    assert_eq!(advance, frame.len());
    assert_eq!(packet.code, Opcode::Insert.code() as u32);
    assert_eq!(packet.sync, 77);
    assert_eq!(packet.schema_id, 9);
    assert_eq!(packet.body, body);
}

#[test]
fn packet_decode_is_incremental() {
    let frame = codec::encode_request(Opcode::Ping, 1, 0, &[]).unwrap();
    // every strict prefix needs more data
    for cut in 0..frame.len() {
        assert_eq!(codec::try_decode(&frame[..cut]).unwrap(), None);
    }
    assert!(codec::try_decode(&frame).unwrap().is_some());
    // trailing bytes of the next frame are left alone
    let mut two = frame.clone();
    two.extend_from_slice(&frame);
    let (_, advance) = codec::try_decode(&two).unwrap().unwrap();
    assert_eq!(advance, frame.len());
}

#[test]
fn packet_error_code_unmasked() {
    // craft a response with the error marker set
    let mut payload = Vec::new();
    rmp::encode::write_map_len(&mut payload, 2).unwrap();
    rmp::encode::write_uint(&mut payload, super::KEY_REQUEST_TYPE as u64).unwrap();
    rmp::encode::write_uint(&mut payload, (super::CODE_ERROR_MARKER | 109) as u64).unwrap();
    rmp::encode::write_uint(&mut payload, super::KEY_SYNC as u64).unwrap();
    rmp::encode::write_uint(&mut payload, 5).unwrap();
    let mut frame = Vec::new();
    rmp::encode::write_u32(&mut frame, payload.len() as u32).unwrap();
    frame.extend_from_slice(&payload);
    let (packet, _) = codec::try_decode(&frame).unwrap().unwrap();
    assert_eq!(packet.code, 109);
    assert_eq!(packet.sync, 5);
}

#[test]
fn malformed_header_is_fatal() {
    // a frame whose "header" is a string, not a map
    let mut payload = Vec::new();
    rmp::encode::write_str(&mut payload, "junk").unwrap();
    let mut frame = Vec::new();
    rmp::encode::write_u32(&mut frame, payload.len() as u32).unwrap();
    frame.extend_from_slice(&payload);
    assert!(matches!(
        codec::try_decode(&frame),
        Err(FrameError::Malformed(_))
    ));
}

#[test]
fn insane_length_prefix_is_fatal() {
    let mut frame = Vec::new();
    rmp::encode::write_u32(&mut frame, (MAX_PACKET + 1) as u32).unwrap();
    assert!(matches!(
        codec::try_decode(&frame),
        Err(FrameError::Malformed(_))
    ));
}

#[test]
fn request_readiness_is_a_fold_over_cells() {
    assert!(Request::ping().is_ready());
    assert!(Request::insert(512u32, vec![Value::Uint(1)]).is_ready());
    assert!(!Request::insert("accounts", vec![Value::Uint(1)]).is_ready());
    assert!(!Request::select("accounts", "primary", vec![], 0, 1, Iter::Eq).is_ready());
}

#[test]
fn request_resolution() {
    let schema = StaticSchema::new(10);
    schema.put_space("accounts", 512);
    schema.put_index(512, "primary", 0);
    let req = Request::select("accounts", "primary", vec![Value::Uint(7)], 0, 1, Iter::Eq);
    let body = req.resolve(&schema).unwrap();
    let space = body.iter().find(|(k, _)| *k == KEY_SPACE_ID).unwrap();
    let index = body.iter().find(|(k, _)| *k == KEY_INDEX_ID).unwrap();
    assert_eq!(space.1, Value::Uint(512));
    assert_eq!(index.1, Value::Uint(0));
}

#[test]
fn request_resolution_unknown_space() {
    let schema = StaticSchema::new(10);
    let req = Request::insert("ghost", vec![Value::Uint(1)]);
    assert!(req.resolve(&schema).is_err());
    // and an index name never resolves through an unknown space
    let req = Request::select("ghost", "primary", vec![], 0, 1, Iter::Eq);
    assert!(req.resolve(&schema).is_err());
}

#[test]
fn index_by_name_with_space_by_id() {
    let schema = StaticSchema::new(10);
    schema.put_index(512, "primary", 3);
    let req = Request::select(512u32, "primary", vec![], 0, 1, Iter::All);
    let body = req.resolve(&schema).unwrap();
    let index = body.iter().find(|(k, _)| *k == KEY_INDEX_ID).unwrap();
    assert_eq!(index.1, Value::Uint(3));
}

#[test]
fn call_opcode_selection() {
    assert_eq!(Request::call("f", vec![], true).op, Opcode::Call);
    assert_eq!(Request::call("f", vec![], false).op, Opcode::OldCall);
    assert!(Opcode::OldCall.single_row());
    assert!(Opcode::Call.single_row());
    assert!(Opcode::Eval.single_row());
    assert!(!Opcode::Select.single_row());
}

#[test]
fn auth_request_shape() {
    let req = Request::auth("admin", vec![1, 2, 3]);
    assert_eq!(req.op, Opcode::Auth);
    assert!(req.is_ready());
    match &req.body[1].1 {
        Arg::Value(Value::Array(items)) => {
            assert_eq!(items[0], Value::Str("chap-sha1".to_owned()));
            assert_eq!(items[1], Value::Bin(vec![1, 2, 3]));
        }
        other => panic!("unexpected auth tuple: {other:?}"),
    }
}
