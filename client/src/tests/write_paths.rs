/*
 * Created on Tue Jul 16 2024
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

//! Write path selection and backpressure, exercised on a bare engine with
//! no writer task draining the staging buffer

use {
    crate::{
        config::Config,
        error::Error,
        net::{provider::SingleAddressProvider, writer, Conn},
        schema::StaticSchema,
    },
    std::sync::{atomic::Ordering, Arc},
    tokio::time::{Duration, Instant},
};

fn bare_conn(cfg: Config) -> Arc<Conn> {
    let provider = Arc::new(SingleAddressProvider::new(
        ([127, 0, 0, 1], 1).into(),
        None,
    ));
    Conn::new(cfg, provider, Arc::new(StaticSchema::new(1)), None)
}

#[tokio::test]
async fn capacity_sized_packet_takes_the_shared_path() {
    // with a factor of 1.0, a packet of exactly the buffer capacity is not
    // strictly above the threshold: it is staged, not written directly
    let conn = bare_conn(Config {
        shared_buffer_size: 4096,
        direct_write_factor: 1.0,
        write_timeout: Duration::from_millis(50),
        ..Config::default()
    });
    writer::send(&conn, vec![0u8; 4096]).await.unwrap();
    assert_eq!(conn.buffers.buf.lock().await.len(), 4096);
    assert_eq!(conn.pending.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn threshold_sized_packet_takes_the_direct_path() {
    // 0.3 * 4096 = 1228.8: the smallest integer size past the threshold is
    // ceil(f * cap) = 1229, and it must bypass the buffer. With no socket
    // attached the direct path reports a communication error
    let conn = bare_conn(Config {
        shared_buffer_size: 4096,
        direct_write_factor: 0.3,
        write_timeout: Duration::from_millis(50),
        ..Config::default()
    });
    match writer::send(&conn, vec![0u8; 1229]).await {
        Err(Error::Communication(_)) => {}
        other => panic!("expected the direct path, got {other:?}"),
    }
    // one byte less stays on the shared path
    writer::send(&conn, vec![0u8; 1228]).await.unwrap();
    assert_eq!(conn.buffers.buf.lock().await.len(), 1228);
}

#[tokio::test]
async fn backpressure_times_out_without_touching_earlier_writes() {
    let conn = bare_conn(Config {
        shared_buffer_size: 4096,
        direct_write_factor: 1.0,
        write_timeout: Duration::from_millis(50),
        ..Config::default()
    });
    // fill the buffer; nobody drains it
    writer::send(&conn, vec![7u8; 4096]).await.unwrap();
    let start = Instant::now();
    let result = writer::send(&conn, vec![9u8; 3072]).await;
    assert_eq!(result, Err(Error::TimedWrite));
    assert!(start.elapsed() >= Duration::from_millis(50));
    // the earlier caller's bytes are untouched
    let staged = conn.buffers.buf.lock().await;
    assert_eq!(staged.len(), 4096);
    assert!(staged.iter().all(|b| *b == 7));
    assert_eq!(conn.pending.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn zero_write_timeout_fails_immediately_on_a_full_buffer() {
    let conn = bare_conn(Config {
        shared_buffer_size: 1024,
        direct_write_factor: 1.0,
        write_timeout: Duration::ZERO,
        ..Config::default()
    });
    writer::send(&conn, vec![0u8; 1024]).await.unwrap();
    let start = Instant::now();
    assert_eq!(
        writer::send(&conn, vec![0u8; 512]).await,
        Err(Error::TimedWrite)
    );
    assert!(start.elapsed() < Duration::from_millis(20));
}

#[tokio::test]
async fn staged_bytes_keep_deposit_order() {
    let conn = bare_conn(Config {
        shared_buffer_size: 1024,
        direct_write_factor: 1.0,
        ..Config::default()
    });
    writer::send(&conn, vec![1u8; 8]).await.unwrap();
    writer::send(&conn, vec![2u8; 8]).await.unwrap();
    let staged = conn.buffers.buf.lock().await;
    assert_eq!(&staged[..8], &[1u8; 8]);
    assert_eq!(&staged[8..16], &[2u8; 8]);
}
