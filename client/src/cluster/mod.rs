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

//! # The cluster overlay
//!
//! [`ClusterClient`] is the same engine with three behaviors layered on:
//! - dispatch runs under a discovery read lock, so an address refresh never
//!   races a request onto a peer being retired
//! - a request that fails *transiently* (torn connection, read-only or
//!   still-loading peer) is parked in a retry map instead of failing its
//!   future, and is re-dispatched when the connection comes back
//! - a periodic discovery task keeps the address set current and forces a
//!   graceful fail-over when the active peer leaves the member set

pub(crate) mod discovery;

use {
    crate::{
        client::Client,
        config::Config,
        error::{ClientResult, Error},
        net::{self, provider::RoundRobinAddressProvider, ClusterExt, Conn},
        schema::SchemaCache,
    },
    log::info,
    std::{future::Future, net::SocketAddr, ops::Deref, pin::Pin, sync::Arc},
    tokio::time::Duration,
};

/// How a cluster client learns the current member set
pub trait ClusterDiscoverer: Send + Sync + 'static {
    fn discover(&self) -> Pin<Box<dyn Future<Output = ClientResult<Vec<SocketAddr>>> + Send + '_>>;
}

def! {
    /// Cluster overlay configuration
    #[derive(Debug, Clone)]
    pub struct ClusterConfig {
        /// how often the discovery task consults the discoverer
        pub discovery_delay: Duration = Duration::from_secs(60),
    }
}

/// A client that fails over across a set of peers
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    /// Connect to the first reachable seed. `discoverer` keeps the member
    /// set current from then on
    pub async fn connect(
        cfg: Config,
        cluster_cfg: ClusterConfig,
        seeds: Vec<SocketAddr>,
        discoverer: Arc<dyn ClusterDiscoverer>,
        schema: Arc<dyn SchemaCache>,
    ) -> ClientResult<Self> {
        if seeds.is_empty() {
            return Err(Error::usage("at least one seed address is required"));
        }
        let provider = Arc::new(RoundRobinAddressProvider::new(seeds, cfg.retry_count));
        let client = Client::start(cfg, provider, schema, Some(ClusterExt::new())).await?;
        let discovery = tokio::spawn(discovery::run(
            client.conn().clone(),
            discoverer,
            cluster_cfg.discovery_delay,
        ));
        client.conn().tasks.lock().push(discovery);
        Ok(Self { client })
    }
}

// the overlay adds behavior, not surface: everything on `Client` applies
impl Deref for ClusterClient {
    type Target = Client;
    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Re-dispatch every parked request on the fresh connection, oldest sync id
/// first. Runs off the on-alive path
pub(crate) fn drain_retries(conn: &Arc<Conn>) {
    let Some(cluster) = &conn.cluster else { return };
    let mut parked: Vec<_> = cluster
        .retry
        .lock()
        .drain()
        .map(|(_, rec)| rec)
        .collect();
    if parked.is_empty() {
        return;
    }
    parked.sort_unstable_by_key(|rec| rec.sync);
    info!("re-dispatching {} requests after fail-over", parked.len());
    let conn = conn.clone();
    tokio::spawn(async move {
        for rec in parked {
            if rec.abandoned() || rec.expired() {
                continue;
            }
            net::redispatch(&conn, rec).await;
        }
    });
}
