/*
 * Created on Sat May 04 2024
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

//! # The schema reconciler
//!
//! The server stamps every response with its schema version. Whenever that
//! version runs ahead of the local catalog cache, a refresh is scheduled
//! behind a one-shot guard; once the cache catches up, the delayed queue is
//! drained and every still-pending request is re-issued at the new version.
//!
//! The catalog itself is a collaborator behind [`SchemaCache`], not part of
//! the engine: the engine only reads version/initialization state and asks
//! it to resolve names and refresh itself.

use {
    crate::{
        error::{ClientResult, Error},
        net::{self, state::SCHEMA_UPDATING, Conn},
        protocol::{Response, ER_WRONG_SCHEMA_VERSION},
    },
    log::{debug, trace, warn},
    parking_lot::RwLock,
    std::{collections::HashMap, future::Future, pin::Pin, sync::Arc},
    tokio::time::{sleep, Duration},
};

/// How long a failed catalog refresh waits before trying again
const REFRESH_RETRY_PAUSE: Duration = Duration::from_millis(300);

/// The pluggable schema catalog cache.
///
/// The engine reads it under the schema read lock and refreshes it under the
/// write lock; implementations only need to be internally consistent
pub trait SchemaCache: Send + Sync + 'static {
    /// Has the catalog ever been loaded? Requests referencing the schema are
    /// delayed until this turns true
    fn is_initialized(&self) -> bool;
    /// The cached schema version
    fn version(&self) -> u64;
    fn resolve_space(&self, name: &str) -> Option<u32>;
    fn resolve_index(&self, space: u32, name: &str) -> Option<u32>;
    /// Bring the catalog up to date with its source of truth, returning the
    /// new version
    fn refresh(&self) -> Pin<Box<dyn Future<Output = ClientResult<u64>> + Send + '_>>;
}

/// Run completion for one response packet
pub(crate) async fn complete(conn: &Arc<Conn>, packet: Response) {
    let response_schema = packet.schema_id();
    match conn.registry.remove(packet.sync()) {
        None => {
            // timed out (or otherwise discarded) before the server answered
            trace!("discarding response for sync {}", packet.sync());
        }
        Some(rec) => {
            if packet.code() == 0 {
                match rec.probe_of {
                    // an internal sync-probe: nobody owns its future; what
                    // matters is what it proves about the cache
                    Some(dependent) => probe_success(conn, dependent, response_schema).await,
                    None => rec.complete(Ok(packet)),
                }
            } else if packet.code() == ER_WRONG_SCHEMA_VERSION {
                if response_schema > conn.schema.version() {
                    // the server is ahead: park until the refresh drains us
                    conn.registry.delay(rec);
                } else {
                    // the cache already caught up: turn the request around
                    // immediately at the current version
                    net::redispatch(conn, rec).await;
                }
            } else {
                net::fail_record(
                    conn,
                    rec,
                    Error::Server {
                        code: packet.code(),
                        message: packet.error_message(),
                    },
                );
            }
        }
    }
    if response_schema > conn.schema.version() {
        update_schema(conn).await;
    }
}

/// A sync-probe came back clean. If the probe saw a *newer* server schema,
/// the regular upgrade path is already queued and will re-evaluate the
/// dependent; otherwise the local cache is provably current, so the
/// dependent either resolves now or fails with its original resolution
/// error. A dependent that already timed out is simply gone and is ignored
async fn probe_success(conn: &Arc<Conn>, dependent: u64, probe_schema: u64) {
    if probe_schema > conn.schema.version() {
        return;
    }
    if let Some(rec) = conn.registry.take_delayed(dependent) {
        net::redispatch(conn, rec).await;
    }
}

/// Schedule a catalog refresh behind the SCHEMA_UPDATING guard. The guard
/// acquisition happens under the schema write lock; if another refresh is
/// already in flight this is a no-op
pub(crate) async fn update_schema(conn: &Arc<Conn>) {
    let acquired = {
        let _guard = conn.schema_lock.write().await;
        conn.state.acquire(SCHEMA_UPDATING).is_some()
    };
    if acquired {
        tokio::spawn(refresh_task(conn.clone()));
    }
}

/// Fire-and-forget wrapper for contexts that cannot await (the on-alive
/// hook)
pub(crate) fn spawn_refresh(conn: &Arc<Conn>) {
    let conn = conn.clone();
    tokio::spawn(async move { update_schema(&conn).await });
}

/// The refresh job: retry the external cache's refresh until it works, then
/// take the delayed queue under the schema write lock and re-issue every
/// still-pending request, oldest sync id first, with no schema lock held
/// across the sends
async fn refresh_task(conn: Arc<Conn>) {
    let mut shutdown = conn.shutdown.subscribe();
    loop {
        if conn.state.is_closed() {
            conn.state.release(SCHEMA_UPDATING);
            return;
        }
        match conn.schema.refresh().await {
            Ok(version) => {
                debug!("schema cache refreshed to version {version}");
                break;
            }
            Err(e) => {
                warn!("schema refresh failed: {e}, retrying shortly");
                tokio::select! {
                    _ = sleep(REFRESH_RETRY_PAUSE) => {}
                    _ = shutdown.recv() => {
                        conn.state.release(SCHEMA_UPDATING);
                        return;
                    }
                }
            }
        }
    }
    // the write-lock section only takes the queue; the sends below can wait
    // out the write timeout and must not hold any schema lock
    let drained = {
        let _guard = conn.schema_lock.write().await;
        conn.registry.drain_delayed()
    };
    for rec in drained {
        if rec.expired() || rec.abandoned() {
            rec.fail(Error::Timeout);
            continue;
        }
        net::redispatch(&conn, rec).await;
    }
    conn.state.release(SCHEMA_UPDATING);
}

/// A caller-populated [`SchemaCache`] for fixed deployments and tests.
///
/// The live catalog maps names to ids at some version. `refresh` installs
/// the oldest staged generation if any have been staged with
/// [`StaticSchema::stage_catalog`], and otherwise just marks the cache
/// initialized
pub struct StaticSchema {
    live: RwLock<Catalog>,
    staged: parking_lot::Mutex<std::collections::VecDeque<Catalog>>,
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    initialized: bool,
    version: u64,
    spaces: HashMap<String, u32>,
    indexes: HashMap<(u32, String), u32>,
}

impl StaticSchema {
    /// An initialized cache at the given version
    pub fn new(version: u64) -> Self {
        Self {
            live: RwLock::new(Catalog {
                initialized: true,
                version,
                ..Catalog::default()
            }),
            staged: parking_lot::Mutex::new(std::collections::VecDeque::new()),
        }
    }
    /// An empty, uninitialized cache: everything is delayed until the first
    /// refresh
    pub fn uninitialized() -> Self {
        Self {
            live: RwLock::new(Catalog::default()),
            staged: parking_lot::Mutex::new(std::collections::VecDeque::new()),
        }
    }
    pub fn put_space(&self, name: impl ToString, id: u32) {
        self.live.write().spaces.insert(name.to_string(), id);
    }
    pub fn put_index(&self, space: u32, name: impl ToString, id: u32) {
        self.live
            .write()
            .indexes
            .insert((space, name.to_string()), id);
    }
    /// Stage a complete catalog generation for the next refresh to install
    pub fn stage_catalog(
        &self,
        version: u64,
        spaces: &[(&str, u32)],
        indexes: &[(u32, &str, u32)],
    ) {
        let catalog = Catalog {
            initialized: true,
            version,
            spaces: spaces
                .iter()
                .map(|(name, id)| (name.to_string(), *id))
                .collect(),
            indexes: indexes
                .iter()
                .map(|(space, name, id)| ((*space, name.to_string()), *id))
                .collect(),
        };
        self.staged.lock().push_back(catalog);
    }
}

impl SchemaCache for StaticSchema {
    fn is_initialized(&self) -> bool {
        self.live.read().initialized
    }
    fn version(&self) -> u64 {
        self.live.read().version
    }
    fn resolve_space(&self, name: &str) -> Option<u32> {
        self.live.read().spaces.get(name).copied()
    }
    fn resolve_index(&self, space: u32, name: &str) -> Option<u32> {
        self.live
            .read()
            .indexes
            .get(&(space, name.to_owned()))
            .copied()
    }
    fn refresh(&self) -> Pin<Box<dyn Future<Output = ClientResult<u64>> + Send + '_>> {
        Box::pin(async move {
            let staged = self.staged.lock().pop_front();
            let mut live = self.live.write();
            if let Some(catalog) = staged {
                *live = catalog;
            }
            live.initialized = true;
            Ok(live.version)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{SchemaCache, StaticSchema};

    #[tokio::test]
    async fn static_schema_refresh_installs_staged_generations() {
        let schema = StaticSchema::uninitialized();
        assert!(!schema.is_initialized());
        schema.stage_catalog(7, &[("t", 512)], &[(512, "primary", 0)]);
        assert_eq!(schema.refresh().await.unwrap(), 7);
        assert!(schema.is_initialized());
        assert_eq!(schema.resolve_space("t"), Some(512));
        assert_eq!(schema.resolve_index(512, "primary"), Some(0));
        // a refresh with nothing staged keeps the catalog
        assert_eq!(schema.refresh().await.unwrap(), 7);
    }
}
