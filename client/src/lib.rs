/*
 * Created on Mon Mar 11 2024
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

//! # The iproto driver
//!
//! This crate implements an asynchronous client driver for databases speaking the
//! MessagePack framed iproto protocol. The heart of the crate is a multiplexing
//! transport: any number of concurrent callers share one duplex TCP socket, requests
//! are pipelined and responses are correlated back to their callers by a per-request
//! sync id, in whatever order the server returns them.
//!
//! Two cross-cutting concerns are coordinated on top of the transport:
//! - **schema coherence**: requests that reference the server's schema catalog carry
//!   the locally cached schema version; when the server reports a newer version, the
//!   affected requests are transparently re-issued once the local cache catches up
//! - **connection lifecycle**: an explicit state machine drives connect, live I/O,
//!   reconnection after fatal socket errors, and terminal close
//!
//! The [`Client`] type is the single-peer driver; [`ClusterClient`] layers transient
//! error retry and fail-over across a set of peers on the same engine.
//!
//! Completion order across *different* requests is never guaranteed, even for a
//! single caller issuing them back to back: correlation is by sync id alone.

#[macro_use]
mod util;
mod config;
mod error;
mod net;
mod protocol;
mod schema;

pub mod cluster;
pub mod row;

mod client;

#[cfg(test)]
mod tests;

pub use self::{
    client::Client,
    cluster::{ClusterClient, ClusterConfig, ClusterDiscoverer},
    config::{Config, Credentials},
    error::{ClientResult, Error},
    net::provider::{AddressProvider, RoundRobinAddressProvider, SingleAddressProvider},
    protocol::{value::Value, Iter, Ref, Request, Response},
    row::{Row, RowSet, SqlResult},
    schema::{SchemaCache, StaticSchema},
};
