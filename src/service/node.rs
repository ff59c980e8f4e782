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

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing::{debug, error, info, warn};

use super::{AppResult, NodeConfig};
use crate::manager::{Channel, ChannelHandler, ConnectionManager, Direction};
use crate::network::{ChannelPurpose, Message, PeerId, Preamble};

/// Handler used by the standalone node: logs channel lifecycle and traffic.
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl ChannelHandler for LoggingHandler {
    fn on_select(&self, preamble: &Preamble, direction: Direction) -> AppResult<()> {
        debug!(peer = %preamble.peer_id, purpose = ?preamble.purpose, ?direction, "peer selected");
        Ok(())
    }

    fn on_init(&self, channel: &Arc<Channel>) {
        info!(peer = %channel.peer_id(), remote = %channel.remote_addr(), "peer connected");
    }

    fn on_message(&self, channel: &Arc<Channel>, message: Message) {
        debug!(
            peer = %channel.peer_id(),
            id = message.id,
            sequence = message.sequence,
            size = message.payload.len(),
            "message received"
        );
    }

    fn on_close(&self, channel: &Arc<Channel>) {
        info!(peer = %channel.peer_id(), remote = %channel.remote_addr(), "peer disconnected");
    }
}

/// A single cluster node: one listener plus a dialer per configured peer.
pub struct Node {
    config: NodeConfig,
    node_id: PeerId,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let node_id = config.node_id();
        Node { config, node_id }
    }

    pub fn node_id(&self) -> PeerId {
        self.node_id
    }

    /// Listen on the configured address and dial every seed peer.
    pub fn start(
        &self,
        handler: Arc<dyn ChannelHandler>,
    ) -> AppResult<(ConnectionManager, SocketAddr)> {
        let manager = ConnectionManager::new(self.config.clone(), self.node_id, handler)?;
        let local_addr = manager.listen(&self.config.network.listen)?;
        for peer in &self.config.network.peers {
            // an unreachable seed is retried by the sweep, a malformed one is skipped
            if let Err(e) = manager.dial(peer, ChannelPurpose::Peer) {
                warn!(peer = %peer, error = %e, "failed to dial seed peer");
            }
        }
        info!(
            node = %self.node_id,
            %local_addr,
            peers = self.config.network.peers.len(),
            "node started"
        );
        Ok((manager, local_addr))
    }

    pub fn run_until_ctrl_c(&self) -> AppResult<()> {
        let (manager, _) = self.start(Arc::new(LoggingHandler))?;
        match manager.handle().block_on(signal::ctrl_c()) {
            Ok(()) => info!("get shutdown signal"),
            Err(e) => error!(error = %e, "unable to listen for shutdown signal"),
        }
        manager.shutdown();
        info!(node = %self.node_id, "node shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::service::WorkerPoolConfig;

    fn local_config(peers: Vec<String>) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.network.listen = "tcp://127.0.0.1:0".to_string();
        config.network.peers = peers;
        config.worker_pool = WorkerPoolConfig {
            num_workers: 2,
            ..Default::default()
        };
        config
    }

    #[test]
    fn test_start_skips_malformed_seed() {
        let seed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let node = Node::new(local_config(vec![
            "udp://127.0.0.1:1".to_string(),
            format!("tcp://{}", seed.local_addr().unwrap()),
        ]));
        let (manager, local_addr) = node.start(Arc::new(LoggingHandler)).unwrap();
        assert!(local_addr.port() > 0);
        assert_eq!(manager.local_id(), node.node_id());
        assert_eq!(manager.dialers().len(), 1);
        manager.shutdown();
    }

    #[test]
    fn test_two_nodes_connect() {
        let first = Node::new(local_config(Vec::new()));
        let (first_manager, first_addr) = first.start(Arc::new(LoggingHandler)).unwrap();

        let second = Node::new(local_config(vec![format!("tcp://{first_addr}")]));
        let (second_manager, _) = second.start(Arc::new(LoggingHandler)).unwrap();

        let mut connected = false;
        for _ in 0..500 {
            if first_manager.channel(&second.node_id()).is_some()
                && second_manager.channel(&first.node_id()).is_some()
            {
                connected = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(connected);
    }
}
