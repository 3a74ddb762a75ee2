use crate::network::frame::{
    DEFAULT_TTL, IcmpKind, IpPayload, Ipv4Packet, MAX_UDP_PAYLOAD, UdpDatagram,
};
use crate::network::node::Node;
use crate::transport::{TransportError, TransportState};
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct ReceivedDatagram {
    pub payload: Vec<u8>,
    pub source: SocketAddrV4,
    pub received_at: Instant,
}

pub struct UdpSocket {
    node: Arc<Node>,
    local_port: u16,
    incoming: mpsc::UnboundedReceiver<ReceivedDatagram>,
}

impl UdpSocket {
    /// Binds to `port` on every address of the node (port 0 picks an ephemeral port)
    pub fn bind(node: &Arc<Node>, port: u16) -> Result<Self, TransportError> {
        let mut transport = node.transport.lock();
        let local_port = if port == 0 {
            transport.allocate_port(&mut node.ctx.rng.lock(), TransportState::udp_port_in_use)?
        } else if transport.udp_port_in_use(port) {
            return Err(TransportError::AddressInUse);
        } else {
            port
        };

        let (tx, rx) = mpsc::unbounded_channel();
        transport.udp_sockets.insert(local_port, tx);

        Ok(Self {
            node: node.clone(),
            local_port,
            incoming: rx,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn send_to(
        &self,
        payload: &[u8],
        destination: SocketAddrV4,
    ) -> Result<usize, TransportError> {
        if payload.len() > MAX_UDP_PAYLOAD {
            return Err(TransportError::MessageTooLong);
        }

        let source = self.node.source_address_for(*destination.ip())?;
        self.node.send_ip(Ipv4Packet {
            source,
            destination: *destination.ip(),
            ttl: DEFAULT_TTL,
            payload: IpPayload::Udp(UdpDatagram {
                source_port: self.local_port,
                destination_port: destination.port(),
                payload: payload.to_vec(),
            }),
        })?;

        Ok(payload.len())
    }

    pub async fn recv_from(&mut self) -> Option<ReceivedDatagram> {
        self.incoming.recv().await
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.node
            .transport
            .lock()
            .udp_sockets
            .remove(&self.local_port);
    }
}

/// Hands a datagram addressed to the node to the socket bound to its port
pub(crate) fn handle(node: &Arc<Node>, packet: &Ipv4Packet, datagram: &UdpDatagram) {
    let socket = node
        .transport
        .lock()
        .udp_sockets
        .get(&datagram.destination_port)
        .cloned();

    let delivered = socket.is_some_and(|socket| {
        socket
            .send(ReceivedDatagram {
                payload: datagram.payload.clone(),
                source: SocketAddrV4::new(packet.source, datagram.source_port),
                received_at: Instant::now(),
            })
            .is_ok()
    });

    if !delivered {
        node.send_icmp_error(packet, IcmpKind::PortUnreachable);
    }
}
