// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connection preamble.
//!
//! Both ends write a fixed 24 byte preamble as soon as the socket is usable:
//!
//! ```text
//! +-----------+---------+------------------+----------------------+
//! | signature | purpose | version (be u32) | peer identity (16 B) |
//! +-----------+---------+------------------+----------------------+
//!   0..3        3         4..8               8..24
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::network::frame::{fill, ReadStatus, TryRead};
use crate::network::socket;
use crate::{AppError, AppResult};

pub const SIGNATURE: [u8; 3] = *b"SNP";
pub const PROTOCOL_VERSION: u32 = 1;
pub const PREAMBLE_SIZE: usize = 24;

const _: () = assert!(SIGNATURE.len() + 1 + 4 + 16 == PREAMBLE_SIZE);

/// 128-bit node identity, the key of the channel registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn random() -> PeerId {
        PeerId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> PeerId {
        PeerId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for PeerId {
    fn from(value: Uuid) -> Self {
        PeerId(value)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// What a channel is used for, announced by the dialing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelPurpose {
    Peer = 1,
    Client = 2,
    Replication = 3,
}

impl TryFrom<u8> for ChannelPurpose {
    type Error = AppError;

    fn try_from(value: u8) -> AppResult<Self> {
        match value {
            1 => Ok(ChannelPurpose::Peer),
            2 => Ok(ChannelPurpose::Client),
            3 => Ok(ChannelPurpose::Replication),
            other => Err(AppError::MalformedProtocol(format!(
                "unknown channel purpose {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub purpose: ChannelPurpose,
    pub version: u32,
    pub peer_id: PeerId,
}

impl Preamble {
    pub fn new(purpose: ChannelPurpose, peer_id: PeerId) -> Preamble {
        Preamble {
            purpose,
            version: PROTOCOL_VERSION,
            peer_id,
        }
    }

    pub fn encode(&self) -> [u8; PREAMBLE_SIZE] {
        let mut buf = [0u8; PREAMBLE_SIZE];
        buf[0..3].copy_from_slice(&SIGNATURE);
        buf[3] = self.purpose as u8;
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..24].copy_from_slice(self.peer_id.as_bytes());
        buf
    }

    /// Validate and decode a preamble; any mismatch is a protocol error.
    pub fn decode(buf: &[u8; PREAMBLE_SIZE]) -> AppResult<Preamble> {
        if buf[0..3] != SIGNATURE {
            return Err(AppError::MalformedProtocol(format!(
                "bad preamble signature {:02x?}",
                &buf[0..3]
            )));
        }
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != PROTOCOL_VERSION {
            return Err(AppError::UnsupportedVersion(version));
        }
        let purpose = ChannelPurpose::try_from(buf[3])?;
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[8..24]);
        Ok(Preamble {
            purpose,
            version,
            peer_id: PeerId::from_bytes(id),
        })
    }
}

pub async fn write_preamble(stream: &TcpStream, preamble: &Preamble) -> AppResult<()> {
    socket::write_all(stream, &preamble.encode()).await?;
    Ok(())
}

/// Reads exactly one preamble, never consuming bytes past it.
#[derive(Debug, Default)]
pub struct PreambleReader {
    buf: [u8; PREAMBLE_SIZE],
    filled: usize,
}

impl PreambleReader {
    pub fn new() -> PreambleReader {
        PreambleReader::default()
    }

    pub fn read<R: TryRead + ?Sized>(&mut self, src: &R) -> AppResult<ReadStatus<Preamble>> {
        if !fill(src, &mut self.buf, &mut self.filled)? {
            return Ok(ReadStatus::WouldBlock);
        }
        Preamble::decode(&self.buf).map(ReadStatus::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::frame::tests::ChunkedSource;

    #[test]
    fn test_layout() {
        let peer_id = PeerId::random();
        let buf = Preamble::new(ChannelPurpose::Replication, peer_id).encode();
        assert_eq!(&buf[0..3], b"SNP");
        assert_eq!(buf[3], 3);
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
        assert_eq!(&buf[8..], peer_id.as_bytes());
    }

    #[test]
    fn test_read_in_pieces() {
        let preamble = Preamble::new(ChannelPurpose::Peer, PeerId::random());
        let mut wire = preamble.encode().to_vec();
        // trailing frame bytes must stay in the socket
        wire.extend_from_slice(&[0xEE; 8]);
        let src = ChunkedSource::new(ChunkedSource::split(&wire, &[5, 2]), false);
        let mut reader = PreambleReader::new();
        let decoded = loop {
            match reader.read(&src).unwrap() {
                ReadStatus::Complete(decoded) => break decoded,
                ReadStatus::WouldBlock => {}
            }
        };
        assert_eq!(decoded, preamble);
        assert!(!src.consumed_all());
    }

    #[test]
    fn test_reject_bad_signature() {
        let mut buf = Preamble::new(ChannelPurpose::Peer, PeerId::random()).encode();
        buf[0] = b'X';
        let err = Preamble::decode(&buf).unwrap_err();
        assert!(matches!(err, AppError::MalformedProtocol(_)));
        assert!(err.is_protocol());
    }

    #[test]
    fn test_reject_version_mismatch() {
        let mut preamble = Preamble::new(ChannelPurpose::Peer, PeerId::random());
        preamble.version = PROTOCOL_VERSION + 1;
        let err = Preamble::decode(&preamble.encode()).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_reject_unknown_purpose() {
        let mut buf = Preamble::new(ChannelPurpose::Peer, PeerId::random()).encode();
        buf[3] = 0x7f;
        assert!(Preamble::decode(&buf).unwrap_err().is_protocol());
    }
}
