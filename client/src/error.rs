/*
 * Created on Thu Mar 14 2024
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

use {
    crate::protocol,
    std::{fmt, io::Error as IoError},
};

pub type ClientResult<T> = Result<T, Error>;

/// The error type surfaced by every operation of the driver.
///
/// Errors are cloneable by design: when a connection dies, every in-flight
/// future is failed with the *same* cause (the thumbstone), so late callers
/// see a consistent picture of the failure episode.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A socket or protocol framing failure. Fatal to the connection; the
    /// supervisor will attempt to reconnect
    Communication(String),
    /// The server answered with a non-zero response code. Not fatal to the
    /// connection
    Server { code: u32, message: String },
    /// The per-request deadline expired before the response arrived. The
    /// connection stays alive; the eventual late response is discarded
    Timeout,
    /// The write path deadline expired (contended write lock or no room in
    /// the shared buffer)
    TimedWrite,
    /// Caller-side misuse: bad arguments, unresolvable names, out-of-range
    /// numeric conversion
    ClientUse(String),
    /// The client has been closed
    Closed,
}

impl Error {
    pub(crate) fn comm(message: impl ToString) -> Self {
        Self::Communication(message.to_string())
    }
    pub(crate) fn usage(message: impl ToString) -> Self {
        Self::ClientUse(message.to_string())
    }
    /// Is this error worth retrying on another (or the same, reconnected) peer?
    ///
    /// Communication failures and a small set of server codes (the server is
    /// a read-only replica, or is still loading) qualify
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Communication(_) => true,
            Self::Server { code, .. } => protocol::is_transient_code(*code),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication(msg) => write!(f, "communication error: {msg}"),
            Self::Server { code, message } => write!(f, "server error {code}: {message}"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::TimedWrite => write!(f, "write timed out"),
            Self::ClientUse(msg) => write!(f, "client error: {msg}"),
            Self::Closed => write!(f, "connection is closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<IoError> for Error {
    fn from(ioe: IoError) -> Self {
        Self::Communication(ioe.to_string())
    }
}
