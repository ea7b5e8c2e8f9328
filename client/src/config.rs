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

use std::time::Duration;

/// Credentials for the authentication step of the connection handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl ToString, password: impl ToString) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

def! {
    /// Client configuration. All fields have usable defaults; construct with
    /// `Config::default()` and override what you need
    #[derive(Debug, Clone)]
    pub struct Config {
        /// capacity of the shared staging buffer (and of the writer's drain
        /// buffer, which mirrors it)
        pub shared_buffer_size: usize = 4 * 1024 * 1024,
        /// fraction of `shared_buffer_size` past which a packet skips the
        /// shared buffer and is written to the socket directly (0 < f <= 1)
        pub direct_write_factor: f64 = 0.5,
        /// how long a caller may wait for the write lock or for room in the
        /// shared buffer
        pub write_timeout: Duration = Duration::from_secs(60),
        /// default per-request deadline
        pub operation_timeout: Duration = Duration::from_secs(1),
        /// how long the constructor waits for the first connection
        pub init_timeout: Duration = Duration::from_secs(60),
        /// initial capacity hint for the in-flight request registry
        pub predicted_futures: usize = 1024,
        /// per-attempt TCP connect deadline
        pub connect_timeout: Duration = Duration::from_secs(2),
        /// how many consecutive failed connection attempts the default address
        /// providers tolerate before giving up for good; `None` retries forever
        pub retry_count: Option<u32> = None,
        /// use the modern CALL opcode instead of the legacy one
        pub use_new_call: bool = false,
        /// credentials for the handshake; anonymous when absent
        pub credentials: Option<Credentials> = None,
    }
}

impl Config {
    /// Byte threshold of the direct write path for this configuration.
    ///
    /// A packet strictly larger than `direct_write_factor * shared_buffer_size`
    /// bypasses the shared buffer
    pub(crate) fn direct_write_threshold(&self) -> f64 {
        self.direct_write_factor * self.shared_buffer_size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn direct_write_threshold() {
        let cfg = Config {
            shared_buffer_size: 4096,
            direct_write_factor: 0.5,
            ..Config::default()
        };
        assert_eq!(cfg.direct_write_threshold(), 2048.0);
    }
}
