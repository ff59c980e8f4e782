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

//! Connection manager.
//!
//! Outbound dials and accepted sockets both converge on the preamble
//! exchange, then selection, which binds the socket to a peer identity and
//! registers a receive task for it. A recurring sweep re-dials every
//! disconnected destination once its retry interval has elapsed.
//!
//! The dialer and channel registries share one lock. It guards bookkeeping
//! only and is never held across socket I/O or an application callback.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

pub use channel::{Channel, ChannelEntry, ChannelRegistry, Direction};
pub use dialer::{Dialer, DialerRegistry, DialerState};
use tasks::{DialTask, ListenerTask, Origin, ReceiveTask, SelectorTask, TimerTask};

use crate::network::{socket, write_preamble, ChannelPurpose, Message, NetAddress, PeerId, Preamble};
use crate::reactor::{Interest, Reactor, RegistrationInfo, Source};
use crate::service::NodeConfig;
use crate::{AppError, AppResult};

mod channel;
mod dialer;
mod tasks;

/// Application hooks invoked by the manager.
///
/// Callbacks run on the worker threads and must not block. `on_close` is
/// called exactly once for every channel that went through `on_init`, and
/// never before it. `on_init` runs before the channel is published, so the
/// channel is not yet visible through [`ConnectionManager::channel`] there.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Accept or refuse a peer after its preamble was validated. An error
    /// drops the connection before any channel exists.
    fn on_select(&self, _preamble: &Preamble, _direction: Direction) -> AppResult<()> {
        Ok(())
    }

    fn on_init(&self, _channel: &Arc<Channel>) {}

    fn on_message(&self, channel: &Arc<Channel>, message: Message);

    fn on_close(&self, _channel: &Arc<Channel>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStatus {
    Started,
    AlreadyRegistered,
}

#[derive(Debug, Default)]
struct Registries {
    dialers: DialerRegistry,
    channels: ChannelRegistry,
}

impl Registries {
    /// Whether a new connection to `peer_id` in `direction` takes the peer's
    /// slot. A losing dialed connection links its dialer to the survivor.
    fn admit(
        &mut self,
        peer_id: PeerId,
        direction: Direction,
        preferred: Direction,
        dialer: Option<&NetAddress>,
        now: Instant,
    ) -> bool {
        let keep_new = match self.channels.get(&peer_id) {
            Some(existing) => direction == preferred && existing.channel.direction() != direction,
            None => true,
        };
        if !keep_new {
            if let Some(address) = dialer {
                self.dialers.mark_connected(address, peer_id, now);
                self.channels.link_dialer(&peer_id, address.clone());
            }
        }
        keep_new
    }

    /// Insert `channel` as the peer's current channel, attached to every
    /// dialer known to reach that peer. Returns the displaced entry.
    fn publish(
        &mut self,
        channel: Arc<Channel>,
        dialer: Option<NetAddress>,
        now: Instant,
    ) -> Option<ChannelEntry> {
        let peer_id = channel.peer_id();
        let mut entry = ChannelEntry::new(channel);
        if let Some(existing) = self.channels.get(&peer_id) {
            for address in &existing.dialers {
                entry.link(address.clone());
            }
        }
        // an inbound channel also satisfies dialers that reached this peer
        // before, whatever address they dial
        for address in dialer.into_iter().chain(self.dialers.linked_to(&peer_id)) {
            entry.link(address);
        }
        for address in &entry.dialers {
            self.dialers.mark_connected(address, peer_id, now);
        }
        self.channels.insert(entry)
    }
}

struct ManagerCore {
    config: NodeConfig,
    local_id: PeerId,
    handler: Arc<dyn ChannelHandler>,
    reactor: Reactor,
    registries: Mutex<Registries>,
    shutdown: AtomicBool,
}

pub struct ConnectionManager {
    core: Arc<ManagerCore>,
}

impl ConnectionManager {
    /// Start the worker pool and the reconnection sweep.
    pub fn new(
        config: NodeConfig,
        local_id: PeerId,
        handler: Arc<dyn ChannelHandler>,
    ) -> AppResult<ConnectionManager> {
        config.validate()?;
        let reactor = Reactor::new(&config.worker_pool, config.network.max_connections)?;
        let sweep_interval = config.dialer.sweep_interval();
        let core = Arc::new(ManagerCore {
            config,
            local_id,
            handler,
            reactor,
            registries: Mutex::new(Registries::default()),
            shutdown: AtomicBool::new(false),
        });
        let timer = core.reactor.timer(sweep_interval);
        core.reactor.add(
            timer,
            Interest::IN,
            TimerTask {
                manager: Arc::downgrade(&core),
            },
        )?;
        info!(node = %local_id, "connection manager started");
        Ok(ConnectionManager { core })
    }

    pub fn local_id(&self) -> PeerId {
        self.core.local_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.core.config
    }

    /// Runtime handle of the worker pool, for sending from outside it.
    pub fn handle(&self) -> &Handle {
        self.core.reactor.handle()
    }

    /// Bind a listener and accept peers on it. Returns the bound address.
    #[instrument(level = "debug", skip(self))]
    pub fn listen(&self, address: &str) -> AppResult<SocketAddr> {
        let address: NetAddress = address.parse()?;
        let bind_addr = address.resolve()?;
        let listener = socket::bind_listener(bind_addr, self.core.config.network.listen_backlog)
            .map_err(|e| AppError::DetailedIoError(format!("bind {address}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let listener = self.core.reactor.listener(listener)?;
        self.core.reactor.add(
            Source::Listener(listener.clone()),
            Interest::IN,
            ListenerTask {
                manager: Arc::downgrade(&self.core),
                listener,
            },
        )?;
        info!(%local_addr, "listening");
        Ok(local_addr)
    }

    /// Connect to `address` unless a dialer for it already exists.
    ///
    /// Returns once the connect is in flight; the outcome shows up in the
    /// dialer state and, on success, as a new channel.
    #[instrument(level = "debug", skip(self))]
    pub fn dial(&self, address: &str, purpose: ChannelPurpose) -> AppResult<DialStatus> {
        let address: NetAddress = address.parse()?;
        if self.core.is_shutdown() {
            return Err(AppError::ReactorClosed);
        }
        if !self
            .core
            .registries
            .lock()
            .dialers
            .register(address.clone(), purpose, Instant::now())
        {
            debug!(%address, "dialer already registered");
            return Ok(DialStatus::AlreadyRegistered);
        }
        if let Err(e) = self.core.start_dial(&address, purpose) {
            self.core.registries.lock().dialers.remove(&address);
            return Err(e);
        }
        Ok(DialStatus::Started)
    }

    /// Forget the dialer for `address`. A live channel it produced stays up
    /// but is no longer re-dialed after it drops.
    pub fn unregister(&self, address: &NetAddress) -> Option<Dialer> {
        self.core.registries.lock().dialers.remove(address)
    }

    pub fn channel(&self, peer_id: &PeerId) -> Option<Arc<Channel>> {
        self.core
            .registries
            .lock()
            .channels
            .get(peer_id)
            .map(|entry| entry.channel.clone())
    }

    pub fn channel_count(&self) -> usize {
        self.core.registries.lock().channels.len()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.core.registries.lock().channels.peers()
    }

    pub fn dialer(&self, address: &NetAddress) -> Option<Dialer> {
        self.core.registries.lock().dialers.get(address).cloned()
    }

    pub fn dialers(&self) -> Vec<Dialer> {
        let registries = self.core.registries.lock();
        registries.dialers.iter().cloned().collect()
    }

    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        let mut infos = Vec::new();
        self.core.reactor.foreach(|info| infos.push(*info));
        infos
    }

    /// Stop every task, close every socket and release every channel.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

impl ManagerCore {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reactor.shutdown();
        let entries = {
            let mut registries = self.registries.lock();
            registries.dialers.clear();
            registries.channels.drain()
        };
        for entry in &entries {
            entry.channel.close();
            self.handler.on_close(&entry.channel);
        }
        info!(node = %self.local_id, channels = entries.len(), "connection manager shut down");
    }

    /// Open a non-blocking connect and wait for it on write readiness.
    fn start_dial(
        self: &Arc<Self>,
        address: &NetAddress,
        purpose: ChannelPurpose,
    ) -> AppResult<()> {
        let remote = address.resolve()?;
        let stream = socket::connect_nonblocking(remote, &self.config.keepalive)?;
        let stream = self.reactor.stream(stream)?;
        self.reactor.add(
            Source::Stream(stream.clone()),
            Interest::OUT,
            DialTask {
                manager: Arc::downgrade(self),
                address: address.clone(),
                purpose,
                remote,
                stream,
            },
        )?;
        debug!(%address, %remote, "dial started");
        Ok(())
    }

    /// A dial attempt for `address` failed. Only a dialer still waiting on
    /// that attempt goes back to `Disconnected`.
    fn abandon_attempt(&self, address: &NetAddress) {
        let mut registries = self.registries.lock();
        if registries.dialers.fail_attempt(address, Instant::now()) {
            debug!(%address, "dialer disconnected");
        }
    }

    /// Connect completed: announce ourselves and wait for the peer's preamble.
    async fn on_connected(
        self: &Arc<Self>,
        stream: Arc<TcpStream>,
        remote: SocketAddr,
        address: NetAddress,
        purpose: ChannelPurpose,
    ) -> AppResult<()> {
        write_preamble(&stream, &Preamble::new(purpose, self.local_id)).await?;
        self.reactor.add(
            Source::Stream(stream.clone()),
            Interest::IN,
            SelectorTask::new(
                Arc::downgrade(self),
                stream,
                remote,
                Origin::Dialed { address, purpose },
            ),
        )?;
        Ok(())
    }

    async fn on_accepted(
        self: &Arc<Self>,
        stream: std::net::TcpStream,
        remote: SocketAddr,
    ) -> AppResult<()> {
        socket::tune_accepted(&stream, &self.config.keepalive)?;
        let stream = self.reactor.stream(stream)?;
        write_preamble(&stream, &Preamble::new(ChannelPurpose::Peer, self.local_id)).await?;
        self.reactor.add(
            Source::Stream(stream.clone()),
            Interest::IN,
            SelectorTask::new(Arc::downgrade(self), stream, remote, Origin::Accepted),
        )?;
        debug!(%remote, "accepted");
        Ok(())
    }

    /// Handshake failed or the peer was refused before a channel existed.
    fn on_selection_failed(
        &self,
        stream: &TcpStream,
        remote: SocketAddr,
        origin: &Origin,
        err: &AppError,
    ) {
        if err.is_protocol() {
            warn!(%remote, error = %err, "handshake rejected");
        } else {
            debug!(%remote, error = %err, "handshake failed");
        }
        if let Origin::Dialed { address, .. } = origin {
            self.abandon_attempt(address);
        }
        let _ = socket::shutdown(stream);
    }

    /// Bind a handshaken socket to the peer identity it announced.
    ///
    /// When a channel to that peer already exists, the connection initiated
    /// by the node with the smaller identity survives on both ends.
    fn complete_selection(
        self: &Arc<Self>,
        stream: Arc<TcpStream>,
        remote: SocketAddr,
        origin: Origin,
        preamble: Preamble,
    ) -> AppResult<()> {
        let peer_id = preamble.peer_id;
        if peer_id == self.local_id {
            return Err(AppError::PeerRejected(format!(
                "{remote} announced our own identity"
            )));
        }
        let direction = origin.direction();
        self.handler.on_select(&preamble, direction)?;
        let (purpose, dialer) = match origin {
            Origin::Dialed { address, purpose } => (purpose, Some(address)),
            Origin::Accepted => (preamble.purpose, None),
        };
        let preferred = if self.local_id < peer_id {
            Direction::Outbound
        } else {
            Direction::Inbound
        };

        let now = Instant::now();
        if !self
            .registries
            .lock()
            .admit(peer_id, direction, preferred, dialer.as_ref(), now)
        {
            debug!(peer = %peer_id, %remote, ?direction, "redundant connection dropped");
            let _ = socket::shutdown(&stream);
            return Ok(());
        }

        let channel = Arc::new(Channel::new(
            peer_id,
            purpose,
            direction,
            remote,
            stream.clone(),
            self.config.network.max_payload_size,
        ));
        self.handler.on_init(&channel);

        // the slot may have changed hands while on_init ran
        let displaced = {
            let mut registries = self.registries.lock();
            let now = Instant::now();
            if self.is_shutdown()
                || !registries.admit(peer_id, direction, preferred, dialer.as_ref(), now)
            {
                None
            } else {
                Some(registries.publish(channel.clone(), dialer, now))
            }
        };
        let Some(displaced) = displaced else {
            debug!(peer = %peer_id, %remote, ?direction, "connection lost its peer slot");
            channel.close();
            self.handler.on_close(&channel);
            return Ok(());
        };
        if let Some(old) = displaced {
            debug!(peer = %peer_id, old = %old.channel.remote_addr(), "channel superseded");
            old.channel.close();
            self.handler.on_close(&old.channel);
        }
        info!(peer = %peer_id, %remote, ?direction, ?purpose, "channel established");

        let task = ReceiveTask::new(
            Arc::downgrade(self),
            channel.clone(),
            self.config.network.max_payload_size,
        );
        if let Err(e) = self.reactor.add(Source::Stream(stream), Interest::IN, task) {
            warn!(peer = %peer_id, error = %e, "receive registration failed");
            self.close_channel(&channel);
        }
        Ok(())
    }

    /// Evict `channel` if it is still the current one for its peer, demote
    /// every dialer it served and close it.
    fn close_channel(&self, channel: &Arc<Channel>) {
        let removed = {
            let mut registries = self.registries.lock();
            let now = Instant::now();
            let removed = registries.channels.remove_if_current(channel);
            for address in removed.iter().flat_map(|entry| &entry.dialers) {
                registries.dialers.demote(address, now);
            }
            removed.is_some()
        };
        channel.close();
        if removed {
            self.handler.on_close(channel);
        }
    }

    /// Re-dial every destination whose retry interval has elapsed.
    fn sweep(self: &Arc<Self>) {
        let due = self
            .registries
            .lock()
            .dialers
            .due_for_retry(Instant::now(), self.config.dialer.retry_interval());
        for (address, purpose) in due {
            debug!(%address, "retrying dial");
            if let Err(e) = self.start_dial(&address, purpose) {
                debug!(%address, error = %e, "retry failed to start");
                self.abandon_attempt(&address);
            }
        }
    }
}
