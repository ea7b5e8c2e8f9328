/*
 * Created on Sun Mar 17 2024
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
    crate::{
        error::{ClientResult, Error},
        util,
    },
    parking_lot::Mutex,
    std::{
        net::SocketAddr,
        sync::atomic::{AtomicUsize, Ordering},
    },
};

/// Where the supervisor gets peer addresses from.
///
/// `get` is consulted before every connection attempt with the number of
/// consecutive failures so far and the last error seen. Returning a
/// transient error (see [`Error::is_transient`]) makes the supervisor try
/// again; anything else closes the client for good
pub trait AddressProvider: Send + Sync + 'static {
    fn get(&self, retry: u32, last_error: Option<&Error>) -> ClientResult<SocketAddr>;
    /// Replace the address set. Only meaningful for refreshable providers
    /// (cluster discovery); the default ignores the update
    fn refresh(&self, _addrs: Vec<SocketAddr>) {}
    /// The current address set
    fn snapshot(&self) -> Vec<SocketAddr>;
}

/// A provider pinned to one peer
pub struct SingleAddressProvider {
    addr: SocketAddr,
    retry_limit: Option<u32>,
}

impl SingleAddressProvider {
    pub fn new(addr: SocketAddr, retry_limit: Option<u32>) -> Self {
        Self { addr, retry_limit }
    }
}

impl AddressProvider for SingleAddressProvider {
    fn get(&self, retry: u32, last_error: Option<&Error>) -> ClientResult<SocketAddr> {
        if let Some(limit) = self.retry_limit {
            if retry > limit {
                // deliberately not transient: the supervisor gives up
                return util::err(Error::usage(format!(
                    "giving up on {} after {retry} attempts (last error: {})",
                    self.addr,
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                )));
            }
        }
        Ok(self.addr)
    }
    fn snapshot(&self) -> Vec<SocketAddr> {
        vec![self.addr]
    }
}

/// A refreshable provider cycling through a set of peers. This is the
/// provider the cluster overlay drives: discovery swaps the address set in
/// place and the supervisor picks the next member on every attempt
pub struct RoundRobinAddressProvider {
    addrs: Mutex<Vec<SocketAddr>>,
    at: AtomicUsize,
    retry_limit: Option<u32>,
}

impl RoundRobinAddressProvider {
    pub fn new(addrs: Vec<SocketAddr>, retry_limit: Option<u32>) -> Self {
        Self {
            addrs: Mutex::new(addrs),
            at: AtomicUsize::new(0),
            retry_limit,
        }
    }
}

impl AddressProvider for RoundRobinAddressProvider {
    fn get(&self, retry: u32, last_error: Option<&Error>) -> ClientResult<SocketAddr> {
        let addrs = self.addrs.lock();
        if addrs.is_empty() {
            return util::err(Error::usage("the address set is empty"));
        }
        if let Some(limit) = self.retry_limit {
            // give every member a fair shot before giving up
            if retry > limit.saturating_mul(addrs.len() as u32) {
                return util::err(Error::usage(format!(
                    "giving up after {retry} attempts across {} members (last error: {})",
                    addrs.len(),
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                )));
            }
        }
        let at = self.at.fetch_add(1, Ordering::Relaxed);
        Ok(addrs[at % addrs.len()])
    }
    fn refresh(&self, addrs: Vec<SocketAddr>) {
        if !addrs.is_empty() {
            *self.addrs.lock() = addrs;
        }
    }
    fn snapshot(&self) -> Vec<SocketAddr> {
        self.addrs.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{AddressProvider, RoundRobinAddressProvider, SingleAddressProvider};

    fn addr(port: u16) -> std::net::SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    #[test]
    fn single_gives_up_past_the_limit() {
        let p = SingleAddressProvider::new(addr(3301), Some(2));
        assert!(p.get(0, None).is_ok());
        assert!(p.get(2, None).is_ok());
        let e = p.get(3, None).unwrap_err();
        assert!(!e.is_transient());
    }

    #[test]
    fn round_robin_cycles_and_refreshes() {
        let p = RoundRobinAddressProvider::new(vec![addr(1), addr(2)], None);
        assert_eq!(p.get(0, None).unwrap(), addr(1));
        assert_eq!(p.get(0, None).unwrap(), addr(2));
        assert_eq!(p.get(0, None).unwrap(), addr(1));
        p.refresh(vec![addr(9)]);
        assert_eq!(p.get(0, None).unwrap(), addr(9));
        // empty refreshes are ignored
        p.refresh(vec![]);
        assert_eq!(p.snapshot(), vec![addr(9)]);
    }
}
