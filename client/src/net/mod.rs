/*
 * Created on Sat Mar 16 2024
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

//! # The multiplexing engine
//!
//! One [`Conn`] owns everything a client instance needs: the state machine,
//! the request registry, the shared write buffer, the socket halves and the
//! background tasks. There is no process-wide state.
//!
//! Lock order, where several are taken: schema lock, then the discovery lock
//! (cluster only), then the buffer lock **or** the write lock (never both)

pub(crate) mod reader;
pub(crate) mod reconnect;
pub(crate) mod registry;
pub(crate) mod state;
pub(crate) mod writer;

pub mod provider;

use {
    crate::{
        cluster,
        config::Config,
        error::{ClientResult, Error},
        protocol::{codec, Request, Response},
        schema::SchemaCache,
        util,
    },
    log::{trace, warn},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
    tokio::{
        net::tcp::OwnedWriteHalf,
        sync::{broadcast, oneshot, watch, RwLock},
        task::JoinHandle,
        time::{timeout_at, Duration, Instant},
    },
    self::{
        provider::AddressProvider,
        registry::{Record, Registry},
        state::{ConnState, ALIVE},
        writer::SharedBuf,
    },
};

pub(crate) type ReconnectHook = Box<dyn Fn() + Send + Sync>;

/// One reader/writer generation. Reconnecting tears the old epoch down and
/// starts a new one
pub(crate) struct IoEpoch {
    pub stop: watch::Sender<bool>,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// Cluster overlay state: the discovery lock serializes address refresh
/// against dispatch, and the retry map parks transiently failed requests
/// until the next reconnect
pub(crate) struct ClusterExt {
    pub discovery_lock: RwLock<()>,
    pub retry: Mutex<HashMap<u64, Record>>,
}

impl ClusterExt {
    pub fn new() -> Self {
        Self {
            discovery_lock: RwLock::new(()),
            retry: Mutex::new(HashMap::new()),
        }
    }
}

/// The engine. A client instance fully owns one of these
pub(crate) struct Conn {
    pub cfg: Config,
    pub state: ConnState,
    pub schema: Arc<dyn SchemaCache>,
    /// serializes dispatch decisions (read) against catalog refresh (write)
    pub schema_lock: RwLock<()>,
    pub registry: Registry,
    pub buffers: SharedBuf,
    /// the write lock *is* this mutex
    pub write_half: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// requests whose bytes were accepted but whose responses haven't arrived
    pub pending: AtomicU64,
    /// sticky cause of the current failure episode; cleared on reconnect
    pub thumbstone: Mutex<Option<Error>>,
    pub provider: Arc<dyn AddressProvider>,
    pub on_reconnect: Mutex<Option<ReconnectHook>>,
    pub cluster: Option<ClusterExt>,
    pub io: Mutex<Option<IoEpoch>>,
    /// serializes a teardown against the supervisor installing the next
    /// epoch
    pub teardown: tokio::sync::Mutex<()>,
    /// stops the supervisor and every background job on close
    pub shutdown: broadcast::Sender<()>,
    /// supervisor + long-running background jobs, aborted on drop
    pub tasks: Mutex<Vec<JoinHandle<()>>>,
    pub active_addr: Mutex<Option<SocketAddr>>,
}

impl Conn {
    pub fn new(
        cfg: Config,
        provider: Arc<dyn AddressProvider>,
        schema: Arc<dyn SchemaCache>,
        cluster: Option<ClusterExt>,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let registry = Registry::new(cfg.predicted_futures);
        let buffers = SharedBuf::new(cfg.shared_buffer_size);
        Arc::new(Self {
            cfg,
            state: ConnState::new(),
            schema,
            schema_lock: RwLock::new(()),
            registry,
            buffers,
            write_half: tokio::sync::Mutex::new(None),
            pending: AtomicU64::new(0),
            thumbstone: Mutex::new(None),
            provider,
            on_reconnect: Mutex::new(None),
            cluster,
            io: Mutex::new(None),
            teardown: tokio::sync::Mutex::new(()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            active_addr: Mutex::new(None),
        })
    }
    /// The error a caller should see for a connection that is not usable
    /// right now
    pub fn last_cause(&self) -> Error {
        if let Some(cause) = self.thumbstone.lock().clone() {
            return cause;
        }
        if self.state.is_closed() {
            Error::Closed
        } else {
            Error::comm("connection is not established")
        }
    }
    /// A stop receiver for the current I/O epoch, if one is running
    pub fn epoch_stop(&self) -> Option<watch::Receiver<bool>> {
        self.io.lock().as_ref().map(|epoch| epoch.stop.subscribe())
    }
    /// Drop a request wherever it currently lives (caller-side timeout)
    pub fn discard(&self, sync: u64) {
        self.registry.discard(sync);
        if let Some(cluster) = &self.cluster {
            cluster.retry.lock().remove(&sync);
        }
    }
}

/// Called by an I/O task once it starts: take the task's state bit, and if
/// that acquisition completed ALIVE, run the on-alive work
pub(crate) fn begin_io(conn: &Arc<Conn>, bit: u8) -> bool {
    let prev = match conn.state.acquire(bit) {
        Some(prev) => prev,
        // closed (or torn down) before we got going
        None => return false,
    };
    if (prev | bit) & ALIVE == ALIVE && prev & ALIVE != ALIVE {
        on_alive(conn);
    }
    true
}

/// Called by an I/O task on exit: drop the bit, and raise RECONNECT if we
/// were the last one out
pub(crate) fn end_io(conn: &Arc<Conn>, bit: u8) {
    conn.state.release(bit);
    conn.state.try_signal_reconnect();
}

/// The connection just reached ALIVE
fn on_alive(conn: &Arc<Conn>) {
    if let Some(hook) = &*conn.on_reconnect.lock() {
        hook();
    }
    // parked cluster retries get a new life on the fresh connection
    if conn.cluster.is_some() {
        cluster::drain_retries(conn);
    }
    // and the schema catalog is brought up to date
    crate::schema::spawn_refresh(conn);
}

/// Dispatch one request and wait for its result, bounded by `ttl` (the
/// configured operation expiry when `None`)
pub(crate) async fn exec(
    conn: &Arc<Conn>,
    req: Request,
    ttl: Option<Duration>,
) -> ClientResult<Response> {
    if conn.state.is_closed() {
        return util::err(Error::Closed);
    }
    if let Some(cause) = conn.thumbstone.lock().clone() {
        // dead or mid-reconnect: fail fast with the shared cause
        return Err(cause);
    }
    let deadline = Instant::now() + ttl.unwrap_or(conn.cfg.operation_timeout);
    let (sync, rx) = dispatch(conn, req, deadline).await?;
    match timeout_at(deadline, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => {
            // the sender vanished without completing; the connection was
            // torn down in a way that skipped this record
            Err(conn.last_cause())
        }
        Err(_) => {
            conn.discard(sync);
            util::err(Error::Timeout)
        }
    }
}

type PendingResult = oneshot::Receiver<ClientResult<Response>>;

/// The dispatch decision, taken under the schema read lock (and the
/// discovery read lock for cluster clients):
/// 1. a request whose names cannot be resolved against an *initialized*
///    cache is delayed, and an optimistic sync-probe PING is sent in its
///    stead
/// 2. any request is delayed while the cache is uninitialized
/// 3. otherwise the request is registered and written out
///
/// The schema lock is only held long enough to pick the branch, resolve the
/// body and stamp the version; the write path (which may wait out the write
/// timeout) runs after both guards are gone
async fn dispatch(
    conn: &Arc<Conn>,
    req: Request,
    deadline: Instant,
) -> ClientResult<(u64, PendingResult)> {
    let (tx, rx) = oneshot::channel();
    let (rec, body, schema_id, caller_sync) = {
        let _schema_guard = conn.schema_lock.read().await;
        let _discovery_guard = match &conn.cluster {
            Some(cluster) => Some(cluster.discovery_lock.read().await),
            None => None,
        };
        let sync = conn.registry.next_sync();
        let mut rec = Record {
            sync,
            req,
            tx,
            started_schema: 0,
            deadline,
            probe_of: None,
            resolution_error: None,
        };
        if !conn.schema.is_initialized() {
            conn.registry.delay(rec);
            return Ok((sync, rx));
        }
        match rec.req.resolve(conn.schema.as_ref()) {
            Ok(body) => {
                let version = conn.schema.version();
                (rec, body, version, sync)
            }
            Err(resolution_error) => {
                // the cache claims to be current and still doesn't know
                // these names. Don't refresh eagerly: park the request and
                // send a probe; the probe's response tells us whether the
                // server has moved past our cached version
                rec.resolution_error = Some(resolution_error);
                conn.registry.delay(rec);
                let probe = Record {
                    sync: conn.registry.next_sync(),
                    req: Request::ping(),
                    tx: oneshot::channel().0,
                    started_schema: 0,
                    deadline,
                    probe_of: Some(sync),
                    resolution_error: None,
                };
                (probe, vec![], conn.schema.version(), sync)
            }
        }
    };
    register_and_send(conn, rec, body, schema_id).await;
    Ok((caller_sync, rx))
}

/// Encode at the schema version the caller resolved against, enter the
/// registry, hand the bytes to the write path. Takes no schema lock: the
/// body and version were fixed under it by the caller. A write failure
/// removes the record and fails its future; the caller observes the error
/// through the future
pub(crate) async fn register_and_send(
    conn: &Arc<Conn>,
    mut rec: Record,
    body: Vec<(u8, crate::protocol::value::Value)>,
    schema_id: u64,
) {
    rec.started_schema = schema_id;
    let sync = rec.sync;
    let frame = match codec::encode_request(rec.req.op, sync, schema_id, &body) {
        Ok(frame) => frame,
        Err(e) => {
            // an oversize packet is the caller's problem, not the socket's
            rec.fail(e.into());
            return;
        }
    };
    conn.registry.insert(rec);
    if let Err(e) = writer::send(conn, frame).await {
        if let Some(rec) = conn.registry.remove(sync) {
            fail_record(conn, rec, e);
        }
    }
}

/// Re-issue a request that already holds a sync id: after a schema refresh,
/// after an immediate WRONG_SCHEMA_VERSION turnaround, after a probe
/// confirmed the cache is usable, or when the cluster overlay replays a
/// parked request. The schema read lock is dropped before the bytes go to
/// the write path
pub(crate) async fn redispatch(conn: &Arc<Conn>, rec: Record) {
    let resolved = {
        let _guard = conn.schema_lock.read().await;
        rec.req
            .resolve(conn.schema.as_ref())
            .map(|body| (body, conn.schema.version()))
    };
    match resolved {
        Ok((body, schema_id)) => register_and_send(conn, rec, body, schema_id).await,
        Err(e) => {
            // report the resolution failure the caller originally ran into,
            // if there was one
            let cause = rec.resolution_error.clone().unwrap_or(e);
            rec.fail(cause);
        }
    }
}

/// Fail one record, letting the cluster overlay park transient failures in
/// its retry map instead
pub(crate) fn fail_record(conn: &Conn, rec: Record, e: Error) {
    if let Some(cluster) = &conn.cluster {
        if e.is_transient() && rec.probe_of.is_none() && !rec.abandoned() {
            trace!("parking request {} for retry after reconnect", rec.sync);
            cluster.retry.lock().insert(rec.sync, rec);
            return;
        }
    }
    rec.fail(e);
}

/// Tear the connection down after a fatal error. Idempotent; every in-flight
/// and delayed future fails with one shared cause, the pending counter goes
/// to zero and the staging buffer is cleared. The I/O tasks observe the stop
/// signal, release their state bits on exit, and the last one out raises
/// RECONNECT for the supervisor
pub(crate) async fn die(conn: &Conn, cause: Error) {
    // hold off the supervisor: the next epoch must not start while this
    // teardown is mid-flight
    let _teardown = conn.teardown.lock().await;
    let cause = {
        let mut slot = conn.thumbstone.lock();
        if slot.is_none() {
            warn!("connection died: {cause}");
            *slot = Some(cause);
        }
        slot.clone().unwrap_or(Error::Closed)
    };
    if let Some(epoch) = &*conn.io.lock() {
        epoch.stop.send_replace(true);
    }
    // wake callers parked on buffer room; they observe the thumbstone
    conn.buffers.reset().await;
    // no iteration order is promised here
    for rec in conn.registry.drain_all() {
        fail_record(conn, rec, cause.clone());
    }
    conn.pending.store(0, Ordering::Release);
}

/// User-initiated terminal close
pub(crate) async fn close(conn: &Conn, cause: Error) {
    if !conn.state.close() {
        return;
    }
    let _ = conn.shutdown.send(());
    die(conn, cause).await;
}
