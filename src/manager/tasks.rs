//! Reactor tasks driving each connection through dial, accept, selection and
//! receive. Every task holds a weak manager reference and retires itself
//! once the manager is gone.

use std::io::ErrorKind;
use std::net::{self, SocketAddr};
use std::sync::{Arc, Weak};

use tokio::io::unix::AsyncFd;
use tokio::net::TcpStream;
use tracing::{debug, error, trace, warn};

use super::{Channel, Direction, ManagerCore};

use crate::network::{socket, ChannelPurpose, MessageReader, NetAddress, PreambleReader, ReadStatus};
use crate::reactor::{Decision, Interest, Readiness, ReactorTask, TaskKind, Token};
use crate::AppError;

/// Where a socket waiting for selection came from.
#[derive(Debug, Clone)]
pub(super) enum Origin {
    Dialed {
        address: NetAddress,
        purpose: ChannelPurpose,
    },
    Accepted,
}

impl Origin {
    pub(super) fn direction(&self) -> Direction {
        match self {
            Origin::Dialed { .. } => Direction::Outbound,
            Origin::Accepted => Direction::Inbound,
        }
    }
}

pub(super) struct ListenerTask {
    pub(super) manager: Weak<ManagerCore>,
    pub(super) listener: Arc<AsyncFd<net::TcpListener>>,
}

impl ReactorTask for ListenerTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Listener
    }

    async fn on_event(&mut self, _token: Token, events: Readiness) -> Decision {
        let Some(manager) = self.manager.upgrade() else {
            return Decision::Remove;
        };
        if events.is_error() {
            error!("listener failed, no longer accepting");
            return Decision::Remove;
        }
        loop {
            match self.listener.get_ref().accept() {
                Ok((stream, remote)) => {
                    if let Err(e) = manager.on_accepted(stream, remote).await {
                        debug!(%remote, error = %e, "dropping accepted connection");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        Decision::Rearm(Interest::IN)
    }
}

pub(super) struct DialTask {
    pub(super) manager: Weak<ManagerCore>,
    pub(super) address: NetAddress,
    pub(super) purpose: ChannelPurpose,
    pub(super) remote: SocketAddr,
    pub(super) stream: Arc<TcpStream>,
}

impl DialTask {
    fn fail(&self, manager: &ManagerCore, reason: &str) {
        debug!(address = %self.address, remote = %self.remote, reason, "dial failed");
        manager.abandon_attempt(&self.address);
        let _ = socket::shutdown(&self.stream);
    }
}

impl ReactorTask for DialTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Dialer
    }

    async fn on_event(&mut self, _token: Token, events: Readiness) -> Decision {
        let Some(manager) = self.manager.upgrade() else {
            return Decision::Remove;
        };
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => {
                self.fail(&manager, &e.to_string());
                return Decision::Remove;
            }
            Ok(None) => {}
        }
        if events.is_failed() {
            self.fail(&manager, "socket error");
            return Decision::Remove;
        }
        if !events.is_writable() {
            return Decision::Rearm(Interest::OUT);
        }
        trace!(address = %self.address, remote = %self.remote, "connected");
        if let Err(e) = manager
            .on_connected(
                self.stream.clone(),
                self.remote,
                self.address.clone(),
                self.purpose,
            )
            .await
        {
            self.fail(&manager, &e.to_string());
        }
        Decision::Remove
    }
}

/// Reads the peer's preamble and hands the socket to selection.
pub(super) struct SelectorTask {
    manager: Weak<ManagerCore>,
    stream: Arc<TcpStream>,
    remote: SocketAddr,
    origin: Origin,
    reader: PreambleReader,
}

impl SelectorTask {
    pub(super) fn new(
        manager: Weak<ManagerCore>,
        stream: Arc<TcpStream>,
        remote: SocketAddr,
        origin: Origin,
    ) -> SelectorTask {
        SelectorTask {
            manager,
            stream,
            remote,
            origin,
            reader: PreambleReader::new(),
        }
    }

    fn fail(&self, manager: &ManagerCore, err: &AppError) -> Decision {
        manager.on_selection_failed(&self.stream, self.remote, &self.origin, err);
        Decision::Remove
    }
}

impl ReactorTask for SelectorTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Selector
    }

    async fn on_event(&mut self, _token: Token, events: Readiness) -> Decision {
        let Some(manager) = self.manager.upgrade() else {
            return Decision::Remove;
        };
        match self.reader.read(self.stream.as_ref()) {
            Ok(ReadStatus::Complete(preamble)) => {
                trace!(remote = %self.remote, ?preamble, "preamble received");
                match manager.complete_selection(
                    self.stream.clone(),
                    self.remote,
                    self.origin.clone(),
                    preamble,
                ) {
                    Ok(()) => Decision::Remove,
                    Err(e) => self.fail(&manager, &e),
                }
            }
            Ok(ReadStatus::WouldBlock) if events.is_failed() => {
                self.fail(&manager, &AppError::ConnectionClosed)
            }
            Ok(ReadStatus::WouldBlock) => Decision::Rearm(Interest::IN),
            Err(e) => self.fail(&manager, &e),
        }
    }
}

/// Delivers every complete message of one channel to the handler.
pub(super) struct ReceiveTask {
    manager: Weak<ManagerCore>,
    channel: Arc<Channel>,
    reader: MessageReader,
}

impl ReceiveTask {
    pub(super) fn new(
        manager: Weak<ManagerCore>,
        channel: Arc<Channel>,
        max_payload_size: u32,
    ) -> ReceiveTask {
        ReceiveTask {
            manager,
            channel,
            reader: MessageReader::new(max_payload_size),
        }
    }
}

impl ReactorTask for ReceiveTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Receiver
    }

    async fn on_event(&mut self, _token: Token, events: Readiness) -> Decision {
        let Some(manager) = self.manager.upgrade() else {
            self.channel.close();
            return Decision::Remove;
        };
        loop {
            match self.reader.read(self.channel.stream().as_ref()) {
                Ok(ReadStatus::Complete(message)) => {
                    manager.handler.on_message(&self.channel, message);
                }
                Ok(ReadStatus::WouldBlock) if events.is_failed() => {
                    debug!(peer = %self.channel.peer_id(), ?events, "channel failed");
                    manager.close_channel(&self.channel);
                    return Decision::Remove;
                }
                Ok(ReadStatus::WouldBlock) => return Decision::Rearm(Interest::IN),
                Err(e) => {
                    if e.is_protocol() {
                        warn!(peer = %self.channel.peer_id(), error = %e, "closing channel");
                    } else {
                        debug!(peer = %self.channel.peer_id(), error = %e, "closing channel");
                    }
                    manager.close_channel(&self.channel);
                    return Decision::Remove;
                }
            }
        }
    }
}

/// Recurring reconnection sweep.
pub(super) struct TimerTask {
    pub(super) manager: Weak<ManagerCore>,
}

impl ReactorTask for TimerTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Timer
    }

    async fn on_event(&mut self, _token: Token, _events: Readiness) -> Decision {
        match self.manager.upgrade() {
            Some(manager) => {
                manager.sweep();
                Decision::Rearm(Interest::IN)
            }
            None => Decision::Remove,
        }
    }
}
