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

//! # The connection state machine
//!
//! Connection lifecycle is an atomic bitset. The reader and writer tasks each
//! own one bit; holding both (and not CLOSED) is what "alive" means. The
//! supervisor owns the RECONNECT bit; CLOSED is terminal and absorbing.
//!
//! Legal transitions:
//! - fresh state carries RECONNECT (the supervisor starts in reconnect mode);
//!   clearing it and acquiring READING and WRITING independently reaches ALIVE
//! - on a fatal I/O error both I/O tasks release their bits; whichever
//!   releases last raises RECONNECT, exactly once per failure episode
//! - any state can move to CLOSED, and nothing moves out of it

use {
    std::{
        sync::atomic::{AtomicU8, Ordering},
        time::Duration,
    },
    tokio::sync::{watch, Notify},
};

consts! {
    /// held by the reader task
    pub(crate) READING: u8 = 1 << 0;
    /// held by the writer task
    pub(crate) WRITING: u8 = 1 << 1;
    /// both I/O bits: the connection is fully up
    pub(crate) ALIVE: u8 = READING | WRITING;
    /// one-shot guard around the schema refresh job
    pub(crate) SCHEMA_UPDATING: u8 = 1 << 2;
    /// the supervisor owns the socket; I/O acquisition is refused
    pub(crate) RECONNECT: u8 = 1 << 3;
    /// terminal
    pub(crate) CLOSED: u8 = 1 << 4;
}

const ORD_ACQ: Ordering = Ordering::Acquire;
const ORD_ACR: Ordering = Ordering::AcqRel;

pub(crate) struct ConnState {
    bits: AtomicU8,
    /// latch released whenever ALIVE is reached, re-armed when it is lost
    alive: watch::Sender<bool>,
    /// wakes the supervisor when RECONNECT (or CLOSED) is raised
    reconnect: Notify,
}

impl ConnState {
    pub fn new() -> Self {
        let (alive, _) = watch::channel(false);
        Self {
            // the supervisor starts in reconnect mode
            bits: AtomicU8::new(RECONNECT),
            alive,
            reconnect: Notify::new(),
        }
    }
    pub fn bits(&self) -> u8 {
        self.bits.load(ORD_ACQ)
    }
    /// Try to set every bit in `mask`. Returns the previous bitset on
    /// success and `None` when refused: the state is CLOSED, any requested
    /// bit is already set, or an I/O bit is requested while RECONNECT holds
    pub fn acquire(&self, mask: u8) -> Option<u8> {
        let mut current = self.bits();
        loop {
            let io_gated = mask & ALIVE != 0 && current & RECONNECT != 0;
            if current & CLOSED != 0 || current & mask != 0 || io_gated {
                return None;
            }
            match self
                .bits
                .compare_exchange(current, current | mask, ORD_ACR, ORD_ACQ)
            {
                Ok(prev) => {
                    if (prev | mask) & ALIVE == ALIVE && prev & ALIVE != ALIVE {
                        // this acquisition is the one that completed ALIVE
                        self.alive.send_replace(true);
                    }
                    return Some(prev);
                }
                Err(seen) => current = seen,
            }
        }
    }
    /// Clear every bit in `mask`, re-arming the alive latch if ALIVE is lost.
    /// Returns the previous bitset
    pub fn release(&self, mask: u8) -> u8 {
        let prev = self.bits.fetch_and(!mask, ORD_ACR);
        if prev & ALIVE == ALIVE && (prev & !mask) & ALIVE != ALIVE {
            self.alive.send_replace(false);
        }
        prev
    }
    /// Raise RECONNECT and wake the supervisor, but only when both I/O bits
    /// have been released and the state is neither closed nor already
    /// reconnecting. The compare-and-set makes the signal exactly-once per
    /// failure episode no matter which I/O task releases last
    pub fn try_signal_reconnect(&self) -> bool {
        let mut current = self.bits();
        loop {
            if current & (CLOSED | RECONNECT) != 0 || current & ALIVE != 0 {
                return false;
            }
            match self
                .bits
                .compare_exchange(current, current | RECONNECT, ORD_ACR, ORD_ACQ)
            {
                Ok(_) => {
                    self.reconnect.notify_one();
                    return true;
                }
                Err(seen) => current = seen,
            }
        }
    }
    /// The supervisor clears RECONNECT right before restarting I/O
    pub fn clear_reconnect(&self) {
        self.bits.fetch_and(!RECONNECT, ORD_ACR);
    }
    /// Transition to the terminal state. Returns `false` if already closed
    pub fn close(&self) -> bool {
        let prev = self.bits.fetch_or(CLOSED, ORD_ACR);
        if prev & CLOSED != 0 {
            return false;
        }
        self.alive.send_replace(false);
        // wake the supervisor so it can observe CLOSED and wind down
        self.reconnect.notify_one();
        true
    }
    pub fn is_closed(&self) -> bool {
        self.bits() & CLOSED != 0
    }
    pub fn is_alive(&self) -> bool {
        let bits = self.bits();
        bits & ALIVE == ALIVE && bits & CLOSED == 0
    }
    /// Wait until the connection reaches ALIVE, up to `timeout`. Returns
    /// whether the connection is alive
    pub async fn wait_alive(&self, timeout: Duration) -> bool {
        let mut rx = self.alive.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }
    /// Park until RECONNECT (or CLOSED) is raised
    pub async fn await_reconnect(&self) {
        loop {
            let wakeup = self.reconnect.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable();
            if self.bits() & (RECONNECT | CLOSED) != 0 {
                return;
            }
            wakeup.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_gated_by_reconnect() {
        let state = ConnState::new();
        // fresh state: reconnect mode, I/O refused
        assert_eq!(state.acquire(READING), None);
        state.clear_reconnect();
        assert_eq!(state.acquire(READING), Some(0));
        // double acquire is a refused no-op
        assert_eq!(state.acquire(READING), None);
        assert_eq!(state.acquire(WRITING), Some(READING));
    }

    #[test]
    fn alive_needs_both_bits() {
        let state = ConnState::new();
        state.clear_reconnect();
        state.acquire(WRITING);
        assert!(!state.is_alive());
        state.acquire(READING);
        assert!(state.is_alive());
        state.release(READING);
        assert!(!state.is_alive());
    }

    #[test]
    fn closed_is_absorbing() {
        let state = ConnState::new();
        state.clear_reconnect();
        assert!(state.close());
        assert!(!state.close());
        assert_eq!(state.acquire(READING), None);
        assert_eq!(state.acquire(SCHEMA_UPDATING), None);
        assert!(state.is_closed());
        assert!(!state.try_signal_reconnect());
    }

    #[test]
    fn reconnect_signal_fires_exactly_once() {
        let state = ConnState::new();
        state.clear_reconnect();
        state.acquire(READING);
        state.acquire(WRITING);
        // first releaser cannot signal: its peer still holds a bit
        state.release(WRITING);
        assert!(!state.try_signal_reconnect());
        // last releaser can, once
        state.release(READING);
        assert!(state.try_signal_reconnect());
        assert!(!state.try_signal_reconnect());
    }

    #[test]
    fn schema_guard_is_orthogonal_to_io() {
        let state = ConnState::new();
        // reconnect mode does not gate the schema guard
        assert!(state.acquire(SCHEMA_UPDATING).is_some());
        assert!(state.acquire(SCHEMA_UPDATING).is_none());
        state.release(SCHEMA_UPDATING);
        assert!(state.acquire(SCHEMA_UPDATING).is_some());
    }

    #[tokio::test]
    async fn wait_alive_latch() {
        let state = std::sync::Arc::new(ConnState::new());
        assert!(!state.wait_alive(Duration::from_millis(5)).await);
        state.clear_reconnect();
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_alive(Duration::from_secs(5)).await })
        };
        state.acquire(READING);
        state.acquire(WRITING);
        assert!(waiter.await.unwrap());
    }
}
