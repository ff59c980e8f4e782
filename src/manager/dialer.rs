use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::network::{ChannelPurpose, NetAddress, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialerState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for DialerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialerState::Disconnected => f.write_str("DISCONNECTED"),
            DialerState::Connecting => f.write_str("CONNECTING"),
            DialerState::Connected => f.write_str("CONNECTED"),
        }
    }
}

/// Outbound connection state for one destination address.
#[derive(Debug, Clone)]
pub struct Dialer {
    pub address: NetAddress,
    pub purpose: ChannelPurpose,
    pub state: DialerState,
    /// Valid once the dialer reached `Connected`.
    pub peer_id: Option<PeerId>,
    pub last_attempt: Instant,
    /// Retry clock, restarted by every attempt and every demotion.
    pub state_since: Instant,
    pub attempts: u64,
}

impl Dialer {
    fn new(address: NetAddress, purpose: ChannelPurpose, now: Instant) -> Dialer {
        Dialer {
            address,
            purpose,
            state: DialerState::Connecting,
            peer_id: None,
            last_attempt: now,
            state_since: now,
            attempts: 1,
        }
    }

    pub fn retry_due(&self, now: Instant, retry_interval: Duration) -> bool {
        self.state == DialerState::Disconnected
            && now.saturating_duration_since(self.state_since) >= retry_interval
    }
}

/// At most one [`Dialer`] per destination. Callers hold the manager lock.
#[derive(Debug, Default)]
pub struct DialerRegistry {
    dialers: HashMap<NetAddress, Dialer>,
}

impl DialerRegistry {
    /// Insert a fresh dialer in `Connecting`. Returns false, leaving the
    /// existing entry untouched, when the address is already registered.
    pub fn register(
        &mut self,
        address: NetAddress,
        purpose: ChannelPurpose,
        now: Instant,
    ) -> bool {
        if self.dialers.contains_key(&address) {
            return false;
        }
        self.dialers.insert(address.clone(), Dialer::new(address, purpose, now));
        true
    }

    pub fn get(&self, address: &NetAddress) -> Option<&Dialer> {
        self.dialers.get(address)
    }

    /// Every destination that has reached `peer_id` before.
    pub fn linked_to(&self, peer_id: &PeerId) -> Vec<NetAddress> {
        self.dialers
            .values()
            .filter(|dialer| dialer.peer_id.as_ref() == Some(peer_id))
            .map(|dialer| dialer.address.clone())
            .collect()
    }

    pub fn remove(&mut self, address: &NetAddress) -> Option<Dialer> {
        self.dialers.remove(address)
    }

    /// Back to `Disconnected`; the retry interval counts from `now`.
    pub fn demote(&mut self, address: &NetAddress, now: Instant) -> bool {
        match self.dialers.get_mut(address) {
            Some(dialer) => {
                dialer.state = DialerState::Disconnected;
                dialer.state_since = now;
                true
            }
            None => false,
        }
    }

    /// Demote after a failed dial attempt. A dialer that meanwhile got
    /// attached to a live channel stays `Connected`.
    pub fn fail_attempt(&mut self, address: &NetAddress, now: Instant) -> bool {
        let connecting = self
            .dialers
            .get(address)
            .is_some_and(|dialer| dialer.state == DialerState::Connecting);
        connecting && self.demote(address, now)
    }

    pub fn mark_connected(
        &mut self,
        address: &NetAddress,
        peer_id: PeerId,
        now: Instant,
    ) -> bool {
        match self.dialers.get_mut(address) {
            Some(dialer) => {
                dialer.state = DialerState::Connected;
                dialer.peer_id = Some(peer_id);
                dialer.state_since = now;
                true
            }
            None => false,
        }
    }

    /// Move every dialer whose retry is due to `Connecting` and return what
    /// is needed to dial them.
    pub fn due_for_retry(
        &mut self,
        now: Instant,
        retry_interval: Duration,
    ) -> Vec<(NetAddress, ChannelPurpose)> {
        self.dialers
            .values_mut()
            .filter(|dialer| dialer.retry_due(now, retry_interval))
            .map(|dialer| {
                dialer.state = DialerState::Connecting;
                dialer.last_attempt = now;
                dialer.state_since = now;
                dialer.attempts += 1;
                (dialer.address.clone(), dialer.purpose)
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.dialers.clear();
    }

    pub fn len(&self) -> usize {
        self.dialers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dialer> {
        self.dialers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NetAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = DialerRegistry::default();
        let now = Instant::now();
        assert!(registry.register(addr("tcp://10.0.0.1:7878"), ChannelPurpose::Peer, now));
        assert!(!registry.register(addr("TCP://10.0.0.1:7878"), ChannelPurpose::Client, now));
        assert_eq!(registry.len(), 1);
        let dialer = registry.get(&addr("10.0.0.1:7878")).unwrap();
        assert_eq!(dialer.purpose, ChannelPurpose::Peer);
        assert_eq!(dialer.state, DialerState::Connecting);
        assert_eq!(dialer.attempts, 1);
    }

    #[test]
    fn test_retry_timing() {
        let mut registry = DialerRegistry::default();
        let address = addr("tcp://10.0.0.1:7878");
        let interval = Duration::from_millis(5000);
        let t0 = Instant::now();
        registry.register(address.clone(), ChannelPurpose::Peer, t0);

        // connecting dialers are never picked up
        assert!(registry
            .due_for_retry(t0 + interval * 2, interval)
            .is_empty());

        let demoted_at = t0 + Duration::from_millis(100);
        assert!(registry.demote(&address, demoted_at));
        assert!(registry
            .due_for_retry(demoted_at + interval - Duration::from_millis(1), interval)
            .is_empty());

        let due_at = demoted_at + interval;
        let due = registry.due_for_retry(due_at, interval);
        assert_eq!(due, vec![(address.clone(), ChannelPurpose::Peer)]);

        let dialer = registry.get(&address).unwrap();
        assert_eq!(dialer.state, DialerState::Connecting);
        assert_eq!(dialer.last_attempt, due_at);
        assert_eq!(dialer.attempts, 2);

        // exactly one attempt per elapsed interval
        assert!(registry.due_for_retry(due_at, interval).is_empty());
    }

    #[test]
    fn test_mark_connected() {
        let mut registry = DialerRegistry::default();
        let address = addr("tcp://10.0.0.1:7878");
        let now = Instant::now();
        registry.register(address.clone(), ChannelPurpose::Replication, now);
        let peer_id = PeerId::random();
        assert!(registry.mark_connected(&address, peer_id, now));
        let dialer = registry.get(&address).unwrap();
        assert_eq!(dialer.state, DialerState::Connected);
        assert_eq!(dialer.peer_id, Some(peer_id));
        assert!(!dialer.retry_due(now + Duration::from_secs(3600), Duration::ZERO));

        assert!(!registry.mark_connected(&addr("tcp://10.0.0.9:1"), peer_id, now));
        assert!(registry.remove(&address).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_attempt_keeps_connected_dialer() {
        let mut registry = DialerRegistry::default();
        let address = addr("tcp://10.0.0.1:7878");
        let t0 = Instant::now();
        registry.register(address.clone(), ChannelPurpose::Peer, t0);

        // an inbound channel from the same peer satisfied the dialer mid-attempt
        let peer_id = PeerId::random();
        registry.mark_connected(&address, peer_id, t0);
        let later = t0 + Duration::from_millis(10);
        assert!(!registry.fail_attempt(&address, later));
        let dialer = registry.get(&address).unwrap();
        assert_eq!(dialer.state, DialerState::Connected);
        assert_eq!(dialer.state_since, t0);

        registry.demote(&address, later);
        let interval = Duration::from_millis(100);
        assert_eq!(registry.due_for_retry(later + interval, interval).len(), 1);
        let failed_at = later + interval + Duration::from_millis(5);
        assert!(registry.fail_attempt(&address, failed_at));
        let dialer = registry.get(&address).unwrap();
        assert_eq!(dialer.state, DialerState::Disconnected);
        assert_eq!(dialer.state_since, failed_at);

        assert!(!registry.fail_attempt(&addr("tcp://10.0.0.9:1"), failed_at));
    }

    #[test]
    fn test_linked_to_collects_every_address() {
        let mut registry = DialerRegistry::default();
        let now = Instant::now();
        let first = addr("tcp://127.0.0.1:7878");
        let second = addr("tcp://localhost:7878");
        let other = addr("tcp://10.0.0.2:7878");
        for address in [&first, &second, &other] {
            registry.register(address.clone(), ChannelPurpose::Peer, now);
        }
        let peer_id = PeerId::random();
        registry.mark_connected(&first, peer_id, now);
        registry.mark_connected(&second, peer_id, now);
        registry.mark_connected(&other, PeerId::random(), now);

        let mut linked = registry.linked_to(&peer_id);
        linked.sort_by_key(|address| address.to_string());
        let mut expected = vec![first, second];
        expected.sort_by_key(|address| address.to_string());
        assert_eq!(linked, expected);
        assert!(registry.linked_to(&PeerId::random()).is_empty());
    }
}
