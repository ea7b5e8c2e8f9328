/*
 * Created on Mon Apr 08 2024
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

//! # The write path
//!
//! Two ways onto the wire:
//! - **shared write**: small packets are staged in a fixed-capacity shared
//!   buffer; the writer task ping-pongs the staged bytes into its own drain
//!   buffer and feeds the socket. Callers staging bytes never block on socket
//!   I/O, and the socket write never holds the buffer lock
//! - **direct write**: a packet strictly larger than `direct_write_factor ×
//!   shared_buffer_size` takes the write lock and goes to the socket whole
//!
//! Bytes staged under the buffer lock reach the socket in FIFO order of the
//! lock acquisitions. Both paths bump the pending-responses counter at the
//! moment the bytes are accepted

use {
    super::{state::WRITING, Conn},
    crate::error::{ClientResult, Error},
    bytes::BytesMut,
    log::debug,
    std::{mem, sync::atomic::Ordering},
    tokio::{
        io::AsyncWriteExt,
        sync::{watch, Mutex, Notify},
        time::{timeout_at, Instant},
    },
};

/// The shared staging buffer and its wakeups
pub(crate) struct SharedBuf {
    pub(crate) cap: usize,
    pub(crate) buf: Mutex<BytesMut>,
    /// raised (one permit) whenever bytes are staged
    pub(crate) not_empty: Notify,
    /// broadcast whenever the writer task empties the buffer
    pub(crate) empty: Notify,
}

impl SharedBuf {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Mutex::new(BytesMut::with_capacity(cap)),
            not_empty: Notify::new(),
            empty: Notify::new(),
        }
    }
    /// Drop staged bytes and wake anyone waiting for room (teardown and
    /// reconnect both start from an empty buffer)
    pub async fn reset(&self) {
        self.buf.lock().await.clear();
        self.empty.notify_waiters();
    }
}

/// Hand one encoded frame to the write path appropriate for its size
pub(crate) async fn send(conn: &Conn, frame: Vec<u8>) -> ClientResult<()> {
    if frame.len() as f64 > conn.cfg.direct_write_threshold() {
        direct_write(conn, frame).await
    } else {
        shared_write(conn, frame).await
    }
}

/// Take the write lock and push the whole packet to the socket
async fn direct_write(conn: &Conn, frame: Vec<u8>) -> ClientResult<()> {
    let deadline = Instant::now() + conn.cfg.write_timeout;
    let mut stop = conn.epoch_stop();
    let mut guard = match timeout_at(deadline, conn.write_half.lock()).await {
        Ok(guard) => guard,
        Err(_) => return Err(Error::TimedWrite),
    };
    let sock = match guard.as_mut() {
        Some(sock) => sock,
        None => return Err(conn.last_cause()),
    };
    let result = match stop.as_mut() {
        // watch the epoch stop signal so teardown never leaves us wedged on
        // a dead socket
        Some(stop) => {
            if *stop.borrow() {
                Err(conn.last_cause())
            } else {
                tokio::select! {
                    r = async {
                        sock.write_all(&frame).await?;
                        sock.flush().await
                    } => r.map_err(Error::from),
                    _ = stop.changed() => Err(conn.last_cause()),
                }
            }
        }
        None => async {
            sock.write_all(&frame).await?;
            sock.flush().await
        }
        .await
        .map_err(Error::from),
    };
    drop(guard);
    match result {
        Ok(()) => {
            conn.pending.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
        Err(e @ Error::Communication(_)) => {
            // a socket failure on the direct path is as fatal as one seen by
            // the I/O tasks
            super::die(conn, e.clone()).await;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Stage the packet in the shared buffer, waiting for room up to the write
/// timeout
async fn shared_write(conn: &Conn, frame: Vec<u8>) -> ClientResult<()> {
    let deadline = Instant::now() + conn.cfg.write_timeout;
    loop {
        let mut shared = match timeout_at(deadline, conn.buffers.buf.lock()).await {
            Ok(guard) => guard,
            Err(_) => return Err(Error::TimedWrite),
        };
        if conn.thumbstone.lock().is_some() {
            // the connection died while we were waiting
            return Err(conn.last_cause());
        }
        if conn.buffers.cap - shared.len() >= frame.len() {
            shared.extend_from_slice(&frame);
            conn.pending.fetch_add(1, Ordering::AcqRel);
            conn.buffers.not_empty.notify_one();
            return Ok(());
        }
        // no room: register for the next drain before releasing the lock,
        // then wait out the remaining budget
        let wakeup = conn.buffers.empty.notified();
        tokio::pin!(wakeup);
        wakeup.as_mut().enable();
        drop(shared);
        if timeout_at(deadline, wakeup).await.is_err() {
            return Err(Error::TimedWrite);
        }
    }
}

/// The writer task: flip the shared buffer into the drain buffer, then feed
/// the socket without holding the buffer lock
pub(crate) async fn run(conn: std::sync::Arc<Conn>, mut stop: watch::Receiver<bool>) {
    if !super::begin_io(&conn, WRITING) {
        return;
    }
    let mut drain = BytesMut::with_capacity(conn.buffers.cap);
    let outcome: ClientResult<()> = 'task: loop {
        // wait until something is staged
        loop {
            {
                let mut shared = conn.buffers.buf.lock().await;
                if !shared.is_empty() {
                    mem::swap(&mut *shared, &mut drain);
                    break;
                }
            }
            tokio::select! {
                _ = conn.buffers.not_empty.notified() => {}
                _ = stop.changed() => break 'task Ok(()),
            }
        }
        conn.buffers.empty.notify_waiters();
        // drain to the socket under the write lock
        let write = async {
            let mut guard = conn.write_half.lock().await;
            let sock = guard
                .as_mut()
                .ok_or_else(|| Error::comm("socket is gone"))?;
            sock.write_all(&drain).await?;
            sock.flush().await?;
            Ok::<_, Error>(())
        };
        tokio::select! {
            r = write => {
                if let Err(e) = r {
                    break 'task Err(e);
                }
            }
            _ = stop.changed() => break 'task Ok(()),
        }
        drain.clear();
    };
    if let Err(e) = outcome {
        super::die(&conn, e).await;
    }
    super::end_io(&conn, WRITING);
    debug!("writer task has exited");
}
