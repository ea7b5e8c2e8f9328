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

//! # The request registry
//!
//! Every in-flight request lives in exactly one of two places:
//! - the **in-flight map**, keyed by sync id, when its bytes have been handed
//!   to the write path and the response hasn't been dispatched yet
//! - the **delayed queue**, ordered by sync id, when it waits for the schema
//!   cache to become ready (or to catch up after a version mismatch)
//!
//! The two sets are disjoint by construction: a record is moved, never
//! copied. Removing a record on timeout leaves a tombstone-by-absence; the
//! eventual late response finds nothing and is discarded.

use {
    crate::{
        error::{ClientResult, Error},
        protocol::{Request, Response},
    },
    parking_lot::Mutex,
    std::{
        collections::{BTreeMap, HashMap},
        mem,
        sync::atomic::{AtomicU64, Ordering},
    },
    tokio::{sync::oneshot, time::Instant},
};

/// One in-flight logical call
pub(crate) struct Record {
    /// correlation key on the wire
    pub sync: u64,
    /// the request, kept around so schema mismatches can re-encode it
    pub req: Request,
    /// single-assignment result slot
    pub tx: oneshot::Sender<ClientResult<Response>>,
    /// schema version stamped when the request was transmitted; 0 before
    pub started_schema: u64,
    /// absolute expiry instant
    pub deadline: Instant,
    /// for an internal sync-probe: the sync id of the delayed request whose
    /// resolution it gates. An index, not an owning cycle: both records are
    /// owned by the registry
    pub probe_of: Option<u64>,
    /// the original name-resolution failure, reported if the probe confirms
    /// the local schema is current
    pub resolution_error: Option<Error>,
}

impl Record {
    pub fn complete(self, result: ClientResult<Response>) {
        // the receiver may be gone (timed out caller); that is fine
        let _ = self.tx.send(result);
    }
    pub fn fail(self, e: Error) {
        self.complete(Err(e));
    }
    /// Has the caller stopped waiting?
    pub fn abandoned(&self) -> bool {
        self.tx.is_closed()
    }
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

pub(crate) struct Registry {
    in_flight: Mutex<HashMap<u64, Record>>,
    delayed: Mutex<BTreeMap<u64, Record>>,
    counter: AtomicU64,
}

impl Registry {
    pub fn new(capacity_hint: usize) -> Self {
        Self {
            in_flight: Mutex::new(HashMap::with_capacity(capacity_hint)),
            delayed: Mutex::new(BTreeMap::new()),
            counter: AtomicU64::new(0),
        }
    }
    /// Allocate the next sync id. Globally monotonic for this client
    pub fn next_sync(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }
    pub fn insert(&self, rec: Record) {
        self.in_flight.lock().insert(rec.sync, rec);
    }
    pub fn remove(&self, sync: u64) -> Option<Record> {
        self.in_flight.lock().remove(&sync)
    }
    pub fn delay(&self, rec: Record) {
        self.delayed.lock().insert(rec.sync, rec);
    }
    pub fn take_delayed(&self, sync: u64) -> Option<Record> {
        self.delayed.lock().remove(&sync)
    }
    /// Take the whole delayed queue, oldest sync id first
    pub fn drain_delayed(&self) -> Vec<Record> {
        mem::take(&mut *self.delayed.lock())
            .into_values()
            .collect()
    }
    /// Take everything, both live and delayed (connection teardown). No
    /// iteration order is guaranteed for the in-flight half
    pub fn drain_all(&self) -> Vec<Record> {
        let mut all: Vec<Record> = self.in_flight.lock().drain().map(|(_, r)| r).collect();
        all.extend(mem::take(&mut *self.delayed.lock()).into_values());
        all
    }
    /// Drop the record wherever it is (caller-side timeout)
    pub fn discard(&self, sync: u64) {
        if self.in_flight.lock().remove(&sync).is_none() {
            self.delayed.lock().remove(&sync);
        }
    }
    #[cfg(test)]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }
    #[cfg(test)]
    pub fn delayed_len(&self) -> usize {
        self.delayed.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{Record, Registry},
        crate::protocol::Request,
        std::time::Duration,
        tokio::{sync::oneshot, time::Instant},
    };

    fn record(reg: &Registry) -> (Record, oneshot::Receiver<super::ClientResult<super::Response>>) {
        let (tx, rx) = oneshot::channel();
        let rec = Record {
            sync: reg.next_sync(),
            req: Request::ping(),
            tx,
            started_schema: 0,
            deadline: Instant::now() + Duration::from_secs(1),
            probe_of: None,
            resolution_error: None,
        };
        (rec, rx)
    }

    #[tokio::test]
    async fn sync_ids_are_monotonic() {
        let reg = Registry::new(16);
        let a = reg.next_sync();
        let b = reg.next_sync();
        let c = reg.next_sync();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn delayed_drains_in_sync_order() {
        let reg = Registry::new(16);
        let mut ids = vec![];
        // insert out of order
        let mut recs = vec![];
        for _ in 0..8 {
            let (rec, rx) = record(&reg);
            ids.push(rec.sync);
            recs.push((rec, rx));
        }
        recs.reverse();
        for (rec, _rx) in recs {
            reg.delay(rec);
        }
        let drained: Vec<u64> = reg.drain_delayed().iter().map(|r| r.sync).collect();
        assert_eq!(drained, ids);
    }

    #[tokio::test]
    async fn records_move_between_sets() {
        let reg = Registry::new(16);
        let (rec, _rx) = record(&reg);
        let sync = rec.sync;
        reg.insert(rec);
        assert_eq!(reg.in_flight_len(), 1);
        let rec = reg.remove(sync).unwrap();
        reg.delay(rec);
        assert_eq!((reg.in_flight_len(), reg.delayed_len()), (0, 1));
        assert!(reg.take_delayed(sync).is_some());
        assert_eq!(reg.delayed_len(), 0);
    }

    #[tokio::test]
    async fn discard_leaves_a_tombstone_by_absence() {
        let reg = Registry::new(16);
        let (rec, _rx) = record(&reg);
        let sync = rec.sync;
        reg.insert(rec);
        reg.discard(sync);
        // the late response finds nothing
        assert!(reg.remove(sync).is_none());
    }

    #[tokio::test]
    async fn abandonment_tracks_the_receiver() {
        let reg = Registry::new(16);
        let (rec, rx) = record(&reg);
        assert!(!rec.abandoned());
        drop(rx);
        assert!(rec.abandoned());
    }
}
