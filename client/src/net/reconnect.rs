/*
 * Created on Tue Apr 09 2024
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

//! # The supervisor
//!
//! One long-running task per client. It builds the socket, runs the
//! handshake, hands the halves to a fresh reader/writer epoch, then parks
//! until that epoch dies and RECONNECT is raised. Transient address-provider
//! failures keep the loop going; a non-transient one closes the client for
//! good

use {
    super::{reader, writer, Conn, IoEpoch},
    crate::{
        error::{ClientResult, Error},
        protocol::{
            codec,
            greeting::{Greeting, GREETING_SIZE},
            Request,
        },
    },
    bytes::BytesMut,
    log::{error, info, warn},
    std::{net::SocketAddr, sync::Arc},
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{
            tcp::{OwnedReadHalf, OwnedWriteHalf},
            TcpStream,
        },
        sync::watch,
        time::{sleep, timeout, Duration},
    },
};

/// Pause between consecutive failed attempts so a dead peer doesn't turn
/// this loop into a busy one
const RETRY_PAUSE: Duration = Duration::from_millis(100);

pub(crate) async fn run(conn: Arc<Conn>) {
    let mut shutdown = conn.shutdown.subscribe();
    let mut retry = 0u32;
    let mut last_error: Option<Error> = None;
    while !conn.state.is_closed() {
        let addr = match conn.provider.get(retry, last_error.as_ref()) {
            Ok(addr) => addr,
            Err(e) if e.is_transient() => {
                retry += 1;
                last_error = Some(e);
                tokio::select! {
                    _ = sleep(RETRY_PAUSE) => continue,
                    _ = shutdown.recv() => break,
                }
            }
            Err(e) => {
                error!("no peer address available, closing the client: {e}");
                super::close(&conn, e).await;
                break;
            }
        };
        // any teardown in flight must finish before the next epoch starts
        drop(conn.teardown.lock().await);
        match establish(&conn, addr).await {
            Ok((read_half, write_half, greeting)) => {
                info!("connected to {addr} ({})", greeting.version);
                retry = 0;
                last_error = None;
                // a fresh epoch starts with clean buffers and no thumbstone
                conn.buffers.reset().await;
                *conn.write_half.lock().await = Some(write_half);
                *conn.thumbstone.lock() = None;
                *conn.active_addr.lock() = Some(addr);
                conn.state.clear_reconnect();
                let (stop, stop_rx) = watch::channel(false);
                let reader = tokio::spawn(reader::run(conn.clone(), read_half, stop_rx.clone()));
                let writer = tokio::spawn(writer::run(conn.clone(), stop_rx));
                *conn.io.lock() = Some(IoEpoch {
                    stop,
                    reader,
                    writer,
                });
                // park until this epoch dies (or the client closes)
                tokio::select! {
                    _ = conn.state.await_reconnect() => {}
                    _ = shutdown.recv() => break,
                }
            }
            Err(e) => {
                warn!("connection attempt to {addr} failed: {e}");
                retry += 1;
                last_error = Some(e);
                tokio::select! {
                    _ = sleep(RETRY_PAUSE) => {}
                    _ = shutdown.recv() => break,
                }
            }
        }
    }
    info!("reconnector has exited");
}

/// Connect and run the protocol handshake: read the fixed-size greeting,
/// then, with credentials configured, exchange the AUTH request
/// synchronously on the channel before multiplexed traffic starts. Any
/// failure drops the candidate socket
async fn establish(
    conn: &Conn,
    addr: SocketAddr,
) -> ClientResult<(OwnedReadHalf, OwnedWriteHalf, Greeting)> {
    let stream = timeout(conn.cfg.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::comm(format!("connect to {addr} timed out")))??;
    stream.set_nodelay(true)?;
    let handshake = async {
        let (mut read_half, mut write_half) = stream.into_split();
        let mut block = [0u8; GREETING_SIZE];
        read_half.read_exact(&mut block).await?;
        let greeting = Greeting::parse(&block)?;
        if let Some(creds) = &conn.cfg.credentials {
            let scramble = greeting.scramble(&creds.password);
            let auth = Request::auth(&creds.username, scramble);
            // no deferred cells in an auth request, so any cache state works
            let body = auth.resolve(conn.schema.as_ref())?;
            let sync = conn.registry.next_sync();
            let frame = codec::encode_request(auth.op, sync, 0, &body).map_err(Error::from)?;
            write_half.write_all(&frame).await?;
            write_half.flush().await?;
            let response = read_one_packet(&mut read_half).await?;
            if response.code() != 0 {
                return Err(Error::comm(format!(
                    "authentication failed: {}",
                    response.error_message()
                )));
            }
        }
        Ok((read_half, write_half, greeting))
    };
    timeout(conn.cfg.connect_timeout, handshake)
        .await
        .map_err(|_| Error::comm(format!("handshake with {addr} timed out")))?
}

/// Read exactly one framed packet, pre-multiplexing
async fn read_one_packet(read_half: &mut OwnedReadHalf) -> ClientResult<crate::protocol::Response> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some((packet, _)) = codec::try_decode(&buf).map_err(Error::from)? {
            return Ok(packet);
        }
        if read_half.read_buf(&mut buf).await? == 0 {
            return Err(Error::comm("connection reset during handshake"));
        }
    }
}
