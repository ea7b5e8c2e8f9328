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

//! The public client surface. One [`Client`] owns one multiplexed socket;
//! every method is safe to call from any number of tasks concurrently.
//!
//! All dispatch funnels through [`Client::exec`], which returns the result
//! future. The capability façades are thin consumers of that same future:
//! awaiting it is the composable form, [`Client::exec_detached`] drops it for
//! fire-and-forget use, and a blocking caller can hand it to
//! `tokio::runtime::Runtime::block_on`

use {
    crate::{
        config::Config,
        error::{ClientResult, Error},
        net::{
            self,
            provider::{AddressProvider, SingleAddressProvider},
            ClusterExt, Conn,
        },
        protocol::{value::Value, Iter, Ref, Request, Response},
        row::{RowSet, SqlResult},
        schema::SchemaCache,
    },
    std::{net::SocketAddr, sync::Arc},
    tokio::time::Duration,
};

pub struct Client {
    conn: Arc<Conn>,
}

impl Client {
    /// Connect to the single peer `addr` with the default address provider
    pub async fn connect_to(
        cfg: Config,
        addr: SocketAddr,
        schema: Arc<dyn SchemaCache>,
    ) -> ClientResult<Self> {
        let retry_limit = cfg.retry_count;
        let provider = Arc::new(SingleAddressProvider::new(addr, retry_limit));
        Self::connect(cfg, provider, schema).await
    }
    /// Connect through a custom [`AddressProvider`]
    pub async fn connect(
        cfg: Config,
        provider: Arc<dyn AddressProvider>,
        schema: Arc<dyn SchemaCache>,
    ) -> ClientResult<Self> {
        Self::start(cfg, provider, schema, None).await
    }
    /// Shared bootstrap for the plain and cluster clients: spin up the
    /// engine and its supervisor, then wait out the initial connection
    pub(crate) async fn start(
        cfg: Config,
        provider: Arc<dyn AddressProvider>,
        schema: Arc<dyn SchemaCache>,
        cluster: Option<ClusterExt>,
    ) -> ClientResult<Self> {
        let init_timeout = cfg.init_timeout;
        let conn = Conn::new(cfg, provider, schema, cluster);
        let supervisor = tokio::spawn(net::reconnect::run(conn.clone()));
        conn.tasks.lock().push(supervisor);
        let client = Self { conn };
        if !client.conn.state.wait_alive(init_timeout).await {
            let cause = client.conn.last_cause();
            client.close().await;
            return Err(match cause {
                Error::Closed => Error::comm("could not establish the initial connection"),
                cause => cause,
            });
        }
        Ok(client)
    }
    pub(crate) fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }
    /// Dispatch a request and await its result, under the configured
    /// operation expiry
    pub async fn exec(&self, request: Request) -> ClientResult<Response> {
        net::exec(&self.conn, request, None).await
    }
    /// As [`Client::exec`], with a per-request deadline
    pub async fn exec_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> ClientResult<Response> {
        net::exec(&self.conn, request, Some(timeout)).await
    }
    /// Fire-and-forget: dispatch and discard the result future
    pub fn exec_detached(&self, request: Request) {
        let conn = self.conn.clone();
        tokio::spawn(async move {
            let _ = net::exec(&conn, request, None).await;
        });
    }
    pub async fn ping(&self) -> ClientResult<()> {
        self.exec(Request::ping()).await.map(|_| ())
    }
    pub async fn select(
        &self,
        space: impl Into<Ref>,
        index: impl Into<Ref>,
        key: Vec<Value>,
        offset: u32,
        limit: u32,
        iterator: Iter,
    ) -> ClientResult<RowSet> {
        let response = self
            .exec(Request::select(space, index, key, offset, limit, iterator))
            .await?;
        RowSet::from_response(&response, false)
    }
    pub async fn insert(&self, space: impl Into<Ref>, tuple: Vec<Value>) -> ClientResult<RowSet> {
        let response = self.exec(Request::insert(space, tuple)).await?;
        RowSet::from_response(&response, false)
    }
    pub async fn replace(&self, space: impl Into<Ref>, tuple: Vec<Value>) -> ClientResult<RowSet> {
        let response = self.exec(Request::replace(space, tuple)).await?;
        RowSet::from_response(&response, false)
    }
    pub async fn update(
        &self,
        space: impl Into<Ref>,
        index: impl Into<Ref>,
        key: Vec<Value>,
        ops: Vec<Value>,
    ) -> ClientResult<RowSet> {
        let response = self.exec(Request::update(space, index, key, ops)).await?;
        RowSet::from_response(&response, false)
    }
    pub async fn upsert(
        &self,
        space: impl Into<Ref>,
        tuple: Vec<Value>,
        ops: Vec<Value>,
    ) -> ClientResult<RowSet> {
        let response = self.exec(Request::upsert(space, tuple, ops)).await?;
        RowSet::from_response(&response, false)
    }
    pub async fn delete(&self, space: impl Into<Ref>, key: Vec<Value>) -> ClientResult<RowSet> {
        let response = self.exec(Request::delete(space, key)).await?;
        RowSet::from_response(&response, false)
    }
    /// Call a stored function. The opcode follows the `use_new_call`
    /// configuration; either way the result is a single row
    pub async fn call(&self, function: impl ToString, args: Vec<Value>) -> ClientResult<RowSet> {
        let request = Request::call(function, args, self.conn.cfg.use_new_call);
        let single_row = request.op.single_row();
        let response = self.exec(request).await?;
        RowSet::from_response(&response, single_row)
    }
    pub async fn eval(&self, expression: impl ToString, args: Vec<Value>) -> ClientResult<RowSet> {
        let request = Request::eval(expression, args);
        let single_row = request.op.single_row();
        let response = self.exec(request).await?;
        RowSet::from_response(&response, single_row)
    }
    /// Execute an SQL statement, materializing either the affected-row count
    /// or the named result rows
    pub async fn execute(&self, sql: impl ToString, bind: Vec<Value>) -> ClientResult<SqlResult> {
        let response = self.exec(Request::execute(sql, bind)).await?;
        SqlResult::from_response(&response)
    }
    pub fn is_alive(&self) -> bool {
        self.conn.state.is_alive()
    }
    pub fn is_closed(&self) -> bool {
        self.conn.state.is_closed()
    }
    /// Wait until the connection is up, at most `timeout`
    pub async fn wait_alive(&self, timeout: Duration) -> bool {
        self.conn.state.wait_alive(timeout).await
    }
    /// Install a hook invoked every time the connection (re)reaches ALIVE
    pub fn on_reconnect(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.conn.on_reconnect.lock() = Some(Box::new(hook));
    }
    /// Terminal close: every in-flight future fails with a closed-connection
    /// error and all background tasks wind down before this returns
    pub async fn close(&self) {
        net::close(&self.conn, Error::Closed).await;
        let epoch = self.conn.io.lock().take();
        if let Some(epoch) = epoch {
            let _ = epoch.reader.await;
            let _ = epoch.writer.await;
        }
        let tasks: Vec<_> = self.conn.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        // release the socket
        *self.conn.write_half.lock().await = None;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // best effort for a client dropped without `close`: flip the state,
        // wake everything and fail whatever is still pending
        if !self.conn.state.close() {
            return;
        }
        let _ = self.conn.shutdown.send(());
        if let Some(epoch) = &*self.conn.io.lock() {
            epoch.stop.send_replace(true);
        }
        for rec in self.conn.registry.drain_all() {
            rec.fail(Error::Closed);
        }
        for task in self.conn.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
