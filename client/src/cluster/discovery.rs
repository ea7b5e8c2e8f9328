/*
 * Created on Sun Jun 09 2024
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

//! The periodic discovery task. Consults the pluggable discoverer, swaps the
//! provider's address set when membership changes. When the peer we
//! are connected to drops out of the set and nothing is in flight, it stops
//! I/O so the supervisor reconnects to a surviving member

use {
    super::ClusterDiscoverer,
    crate::{error::Error, net::Conn},
    log::{info, warn},
    std::sync::{atomic::Ordering, Arc},
    tokio::time::{sleep, Duration},
};

pub(crate) async fn run(conn: Arc<Conn>, discoverer: Arc<dyn ClusterDiscoverer>, delay: Duration) {
    let mut shutdown = conn.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.recv() => break,
        }
        if conn.state.is_closed() {
            break;
        }
        let members = match discoverer.discover().await {
            Ok(members) => members,
            Err(e) => {
                warn!("cluster discovery failed: {e}");
                continue;
            }
        };
        if members.is_empty() {
            // an empty answer is always treated as a discovery glitch
            warn!("cluster discovery returned no members, keeping current set");
            continue;
        }
        let mut current = conn.provider.snapshot();
        let mut sorted = members.clone();
        sorted.sort_unstable();
        current.sort_unstable();
        if sorted != current {
            info!("cluster membership changed: {members:?}");
            conn.provider.refresh(members.clone());
        }
        let active = *conn.active_addr.lock();
        let active_evicted = match active {
            Some(addr) => !members.contains(&addr),
            None => false,
        };
        if active_evicted && conn.pending.load(Ordering::Acquire) == 0 {
            // the write lock is only a try: if dispatch is busy we just come
            // back on the next tick
            let Some(cluster) = &conn.cluster else { break };
            if let Ok(_guard) = cluster.discovery_lock.try_write() {
                info!("active peer left the cluster, reconnecting to a member");
                crate::net::die(&conn, Error::comm("active peer left the cluster")).await;
            }
        }
    }
    info!("cluster discovery has exited");
}
