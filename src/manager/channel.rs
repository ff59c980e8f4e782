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

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::network::{socket, write_message, ChannelPurpose, Message, NetAddress, PeerId};
use crate::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// An identified, handshaken connection to one peer.
///
/// Shared through `Arc`: the registry holds one handle and the receive task
/// another. Frames written through [`Channel::send`] never interleave.
pub struct Channel {
    peer_id: PeerId,
    purpose: ChannelPurpose,
    direction: Direction,
    remote: SocketAddr,
    stream: Arc<TcpStream>,
    write_lock: Mutex<()>,
    sequence: AtomicU16,
    max_payload_size: u32,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(
        peer_id: PeerId,
        purpose: ChannelPurpose,
        direction: Direction,
        remote: SocketAddr,
        stream: Arc<TcpStream>,
        max_payload_size: u32,
    ) -> Channel {
        Channel {
            peer_id,
            purpose,
            direction,
            remote,
            stream,
            write_lock: Mutex::new(()),
            sequence: AtomicU16::new(0),
            max_payload_size,
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn purpose(&self) -> ChannelPurpose {
        self.purpose
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }

    pub fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Write one message. An oversized payload fails before any byte is sent.
    pub async fn send(&self, message: &Message) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        write_message(&self.stream, message, self.max_payload_size).await
    }

    /// Send with the next sequence number of this channel.
    pub async fn send_payload(&self, id: u16, payload: impl Into<Bytes>) -> AppResult<u16> {
        let sequence = self.next_sequence();
        self.send(&Message::new(id, sequence, payload)).await?;
        Ok(sequence)
    }

    /// Shut the socket down. The receive task observes end of stream and
    /// releases its handle; repeated calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = socket::shutdown(&self.stream) {
            trace!(peer = %self.peer_id, error = %e, "socket shutdown failed");
        }
        debug!(peer = %self.peer_id, remote = %self.remote, "channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer_id", &self.peer_id)
            .field("purpose", &self.purpose)
            .field("direction", &self.direction)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        trace!(peer = %self.peer_id, remote = %self.remote, "channel destroyed");
    }
}

#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub channel: Arc<Channel>,
    /// Dialers served by this channel. Several destination spellings can
    /// reach the same peer.
    pub dialers: Vec<NetAddress>,
}

impl ChannelEntry {
    pub fn new(channel: Arc<Channel>) -> ChannelEntry {
        ChannelEntry {
            channel,
            dialers: Vec::new(),
        }
    }

    pub fn link(&mut self, address: NetAddress) {
        if !self.dialers.contains(&address) {
            self.dialers.push(address);
        }
    }
}

/// At most one live [`Channel`] per peer identity. Callers hold the manager
/// lock.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<PeerId, ChannelEntry>,
}

impl ChannelRegistry {
    pub fn get(&self, peer_id: &PeerId) -> Option<&ChannelEntry> {
        self.channels.get(peer_id)
    }

    /// Insert or replace, returning the displaced entry.
    pub fn insert(&mut self, entry: ChannelEntry) -> Option<ChannelEntry> {
        self.channels.insert(entry.channel.peer_id(), entry)
    }

    /// Remove the entry only if it still refers to `channel`. A superseded
    /// channel tearing down must not evict its replacement.
    pub fn remove_if_current(&mut self, channel: &Arc<Channel>) -> Option<ChannelEntry> {
        let current = self
            .channels
            .get(&channel.peer_id())
            .is_some_and(|entry| Arc::ptr_eq(&entry.channel, channel));
        if current {
            self.channels.remove(&channel.peer_id())
        } else {
            None
        }
    }

    pub fn link_dialer(&mut self, peer_id: &PeerId, address: NetAddress) {
        if let Some(entry) = self.channels.get_mut(peer_id) {
            entry.link(address);
        }
    }

    pub fn drain(&mut self) -> Vec<ChannelEntry> {
        self.channels.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.channels.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net;

    use super::*;

    async fn connected_pair() -> (Arc<TcpStream>, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Arc::new(client), server)
    }

    fn channel(peer_id: PeerId, stream: Arc<TcpStream>) -> Arc<Channel> {
        let remote: net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        Arc::new(Channel::new(
            peer_id,
            ChannelPurpose::Peer,
            Direction::Outbound,
            remote,
            stream,
            1024,
        ))
    }

    #[tokio::test]
    async fn test_remove_if_current() {
        let (a, _a_peer) = connected_pair().await;
        let (b, _b_peer) = connected_pair().await;
        let peer_id = PeerId::random();
        let old = channel(peer_id, a);
        let new = channel(peer_id, b);

        let mut registry = ChannelRegistry::default();
        assert!(registry.insert(ChannelEntry::new(old.clone())).is_none());
        let displaced = registry.insert(ChannelEntry::new(new.clone())).unwrap();
        assert!(Arc::ptr_eq(&displaced.channel, &old));

        assert!(registry.remove_if_current(&old).is_none());
        assert_eq!(registry.len(), 1);

        let first: NetAddress = "tcp://127.0.0.1:1".parse().unwrap();
        let second: NetAddress = "tcp://localhost:1".parse().unwrap();
        registry.link_dialer(&peer_id, first.clone());
        registry.link_dialer(&peer_id, second.clone());
        registry.link_dialer(&peer_id, first.clone());
        let removed = registry.remove_if_current(&new).unwrap();
        assert_eq!(removed.dialers, vec![first, second]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_send_and_close() {
        use tokio::io::AsyncReadExt;

        let (stream, mut peer) = connected_pair().await;
        let channel = channel(PeerId::random(), stream);

        assert_eq!(channel.send_payload(7, &b"abc"[..]).await.unwrap(), 0);
        assert_eq!(channel.send_payload(7, &b"de"[..]).await.unwrap(), 1);
        let mut buf = [0u8; 8 + 3 + 8 + 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..8], &[0, 7, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&buf[8..11], b"abc");
        assert_eq!(&buf[11..19], &[0, 7, 0, 1, 0, 0, 0, 2]);

        let oversized = Message::new(1, 0, vec![0u8; 1025]);
        assert!(channel.send(&oversized).await.unwrap_err().is_protocol());

        channel.close();
        channel.close();
        assert!(channel.is_closed());
        // nothing of the oversized message reached the peer
        let mut rest = Vec::new();
        assert_eq!(peer.read_to_end(&mut rest).await.unwrap(), 0);
    }
}
