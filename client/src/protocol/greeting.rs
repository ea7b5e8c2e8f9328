/*
 * Created on Wed Mar 13 2024
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

//! The server greeting. Before any packet flows, the server sends a fixed
//! 128 byte ASCII block: a version line and a base64 encoded authentication
//! salt line (64 bytes each)

use {
    crate::error::{ClientResult, Error},
    openssl::sha::sha1,
};

/// Total size of the greeting block
pub(crate) const GREETING_SIZE: usize = 128;
const GREETING_LINE: usize = 64;
/// How many decoded salt bytes the scramble uses
const SALT_LEN: usize = 20;

/// The parsed server greeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Greeting {
    /// the server's version banner (first greeting line, trimmed)
    pub version: String,
    /// decoded authentication salt
    pub salt: Vec<u8>,
}

impl Greeting {
    pub fn parse(block: &[u8; GREETING_SIZE]) -> ClientResult<Self> {
        if !block.is_ascii() {
            return Err(Error::comm("greeting is not ASCII"));
        }
        let version_line = std::str::from_utf8(&block[..GREETING_LINE])
            .map_err(|_| Error::comm("greeting is not ASCII"))?;
        let salt_line = std::str::from_utf8(&block[GREETING_LINE..])
            .map_err(|_| Error::comm("greeting is not ASCII"))?;
        let salt = base64::decode(salt_line.trim_end_matches(|c| c == '\n' || c == ' ' || c == '\0'))
            .map_err(|e| Error::comm(format!("bad salt in greeting: {e}")))?;
        if salt.len() < SALT_LEN {
            return Err(Error::comm("salt in greeting is too short"));
        }
        Ok(Self {
            version: version_line.trim_end().to_owned(),
            salt,
        })
    }
    /// Compute the chap-sha1 scramble for the authentication request:
    /// `xor(sha1(password), sha1(salt .. sha1(sha1(password))))`
    pub fn scramble(&self, password: &str) -> Vec<u8> {
        let step_1 = sha1(password.as_bytes());
        let step_2 = sha1(&step_1);
        let mut salted = Vec::with_capacity(SALT_LEN + step_2.len());
        salted.extend_from_slice(&self.salt[..SALT_LEN]);
        salted.extend_from_slice(&step_2);
        let step_3 = sha1(&salted);
        step_1
            .iter()
            .zip(step_3.iter())
            .map(|(a, b)| a ^ b)
            .collect()
    }
}

/// Build a syntactically valid greeting block (test support)
#[cfg(test)]
pub(crate) fn greeting_block(version: &str, salt: &[u8]) -> [u8; GREETING_SIZE] {
    let mut block = [b' '; GREETING_SIZE];
    block[..version.len()].copy_from_slice(version.as_bytes());
    block[63] = b'\n';
    let encoded = base64::encode(salt);
    block[64..64 + encoded.len()].copy_from_slice(encoded.as_bytes());
    block[127] = b'\n';
    block
}

#[cfg(test)]
mod tests {
    use super::{greeting_block, Greeting, GREETING_SIZE};

    #[test]
    fn parse_greeting() {
        let block = greeting_block("Acme iproto 2.10.4 (Binary)", &[7u8; 20]);
        let greeting = Greeting::parse(&block).unwrap();
        assert_eq!(greeting.version, "Acme iproto 2.10.4 (Binary)");
        assert_eq!(greeting.salt, vec![7u8; 20]);
    }

    #[test]
    fn reject_binary_garbage() {
        let block = [0xffu8; GREETING_SIZE];
        assert!(Greeting::parse(&block).is_err());
    }

    #[test]
    fn scramble_is_stable() {
        let block = greeting_block("Acme iproto 2.10.4", &[1u8; 20]);
        let greeting = Greeting::parse(&block).unwrap();
        let a = greeting.scramble("sesame");
        let b = greeting.scramble("sesame");
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        assert_ne!(a, greeting.scramble("not-sesame"));
    }
}
