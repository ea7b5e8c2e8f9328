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

//! The reader task: pull framed packets off the socket, correlate them by
//! sync id and run completion. Any I/O or framing error tears the
//! connection down

use {
    super::{state::READING, Conn},
    crate::{
        error::{ClientResult, Error},
        protocol::codec,
        schema,
    },
    bytes::{Buf, BytesMut},
    log::debug,
    std::sync::{atomic::Ordering, Arc},
    tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf, sync::watch},
};

const READ_BUF_CAP: usize = 16 * 1024;

pub(crate) async fn run(conn: Arc<Conn>, mut sock: OwnedReadHalf, mut stop: watch::Receiver<bool>) {
    if !super::begin_io(&conn, READING) {
        return;
    }
    let mut buf = BytesMut::with_capacity(READ_BUF_CAP);
    let outcome: ClientResult<()> = 'task: loop {
        // dispatch every complete frame we have
        loop {
            match codec::try_decode(&buf) {
                Ok(Some((packet, advance))) => {
                    buf.advance(advance);
                    // one accepted request got its answer, whether or not
                    // anyone still waits for it
                    let _ = conn
                        .pending
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
                    schema::complete(&conn, packet).await;
                }
                Ok(None) => break,
                Err(e) => break 'task Err(Error::comm(e)),
            }
        }
        tokio::select! {
            read = sock.read_buf(&mut buf) => match read {
                Ok(0) => break 'task Err(Error::comm("connection reset by peer")),
                Ok(_) => {}
                Err(e) => break 'task Err(e.into()),
            },
            _ = stop.changed() => break 'task Ok(()),
        }
    };
    // closing our half closes the socket for reading
    drop(sock);
    if let Err(e) = outcome {
        super::die(&conn, e).await;
    }
    super::end_io(&conn, READING);
    debug!("reader task has exited");
}
