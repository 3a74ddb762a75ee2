//! Sockets on top of the emulated IP stack of a node

pub mod icmp;
pub mod tcp;
pub mod udp;

use crate::transport::icmp::IcmpReply;
use crate::transport::tcp::connection::{Connection, ConnectionKey};
use crate::transport::tcp::ListenerShared;
use crate::transport::udp::ReceivedDatagram;
use fastrand::Rng;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Same range as the default `net.ipv4.ip_local_port_range`
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 32768..=60999;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection reset by peer")]
    ConnectionReset,
    #[error("Connection timed out")]
    TimedOut,
    #[error("Network is unreachable")]
    NetworkUnreachable,
    #[error("Address already in use")]
    AddressInUse,
    #[error("Broken pipe")]
    BrokenPipe,
    #[error("Message too long")]
    MessageTooLong,
}

/// Sockets of a node, indexed the way incoming packets look them up
#[derive(Default)]
pub(crate) struct TransportState {
    pub(crate) tcp_listeners: HashMap<u16, Arc<ListenerShared>>,
    pub(crate) tcp_connections: HashMap<ConnectionKey, Arc<Connection>>,
    pub(crate) udp_sockets: HashMap<u16, mpsc::UnboundedSender<ReceivedDatagram>>,
    pub(crate) icmp_waiters: HashMap<u16, mpsc::UnboundedSender<IcmpReply>>,
}

impl TransportState {
    pub(crate) fn tcp_port_in_use(&self, port: u16) -> bool {
        self.tcp_listeners.contains_key(&port)
            || self
                .tcp_connections
                .keys()
                .any(|key| key.local.port() == port)
    }

    pub(crate) fn udp_port_in_use(&self, port: u16) -> bool {
        self.udp_sockets.contains_key(&port)
    }

    /// Picks a free port in the ephemeral range, starting at a random offset
    pub(crate) fn allocate_port(
        &self,
        rng: &mut Rng,
        in_use: impl Fn(&Self, u16) -> bool,
    ) -> Result<u16, TransportError> {
        let first = *EPHEMERAL_PORTS.start() as u32;
        let span = *EPHEMERAL_PORTS.end() as u32 - first + 1;
        let offset = rng.u32(..span);
        (0..span)
            .map(|i| (first + (offset + i) % span) as u16)
            .find(|&port| !in_use(self, port))
            .ok_or(TransportError::AddressInUse)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_allocate_port() {
        let mut state = TransportState::default();
        let mut rng = Rng::with_seed(42);
        let port = state
            .allocate_port(&mut rng, TransportState::udp_port_in_use)
            .unwrap();
        assert!(EPHEMERAL_PORTS.contains(&port));

        let (tx, _rx) = mpsc::unbounded_channel();
        state.udp_sockets.insert(port, tx);
        let mut rng = Rng::with_seed(42);
        let other = state
            .allocate_port(&mut rng, TransportState::udp_port_in_use)
            .unwrap();
        assert_ne!(port, other);
    }
}
