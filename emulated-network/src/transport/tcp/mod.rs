//! A minimal TCP: three-way handshake, cumulative acks, RTO and NewReno loss recovery, with
//! pluggable congestion control

pub mod congestion;
pub(crate) mod connection;

use crate::network::frame::{DEFAULT_TTL, IpPayload, Ipv4Packet, TcpFlags, TcpSegment};
use crate::network::node::Node;
use crate::transport::TransportError;
use crate::transport::TransportState;
use crate::transport::tcp::congestion::CongestionAlgorithm;
use crate::transport::tcp::connection::{Connection, ConnectionKey};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::sync::Notify;

pub use connection::TcpState;

/// Shared between a listener and the connections it spawns
pub(crate) struct ListenerShared {
    backlog: Mutex<VecDeque<Arc<Connection>>>,
    notify_accept: Notify,
}

impl ListenerShared {
    pub(crate) fn push(&self, connection: Arc<Connection>) {
        self.backlog.lock().push_back(connection);
        self.notify_accept.notify_one();
    }
}

pub struct TcpListener {
    node: Arc<Node>,
    port: u16,
    shared: Arc<ListenerShared>,
}

impl TcpListener {
    pub fn bind(node: &Arc<Node>, port: u16) -> Result<Self, TransportError> {
        let mut transport = node.transport.lock();
        if transport.tcp_listeners.contains_key(&port) {
            return Err(TransportError::AddressInUse);
        }

        let shared = Arc::new(ListenerShared {
            backlog: Mutex::new(VecDeque::new()),
            notify_accept: Notify::new(),
        });
        transport.tcp_listeners.insert(port, shared.clone());

        Ok(Self {
            node: node.clone(),
            port,
            shared,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Waits for the next connection that completed its handshake
    pub async fn accept(&self) -> TcpStream {
        loop {
            let connection = self.shared.backlog.lock().pop_front();
            if let Some(connection) = connection {
                return TcpStream {
                    node: self.node.clone(),
                    connection,
                };
            }

            self.shared.notify_accept.notified().await;
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.node.transport.lock().tcp_listeners.remove(&self.port);

        let pending: Vec<_> = self.shared.backlog.lock().drain(..).collect();
        for connection in pending {
            connection.detach();
        }
    }
}

/// An established connection
///
/// Dropping the stream closes it gracefully: data that was already written is still delivered
/// and followed by a FIN.
pub struct TcpStream {
    node: Arc<Node>,
    connection: Arc<Connection>,
}

impl TcpStream {
    /// Connects using the congestion control configured on the node
    pub async fn connect(node: &Arc<Node>, remote: SocketAddrV4) -> Result<Self, TransportError> {
        Self::connect_with(node, remote, node.congestion_control()).await
    }

    pub async fn connect_with(
        node: &Arc<Node>,
        remote: SocketAddrV4,
        algorithm: CongestionAlgorithm,
    ) -> Result<Self, TransportError> {
        let source = node.source_address_for(*remote.ip())?;
        let local_port = {
            let transport = node.transport.lock();
            transport.allocate_port(&mut node.ctx.rng.lock(), TransportState::tcp_port_in_use)?
        };

        let key = ConnectionKey {
            local: SocketAddrV4::new(source, local_port),
            remote,
        };

        let stream = Self {
            node: node.clone(),
            connection: Connection::open(node, key, algorithm),
        };

        stream.connection.established().await?;
        Ok(stream)
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.connection.key.local
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.connection.key.remote
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn state(&self) -> TcpState {
        self.connection.state()
    }

    pub fn congestion_algorithm(&self) -> CongestionAlgorithm {
        self.connection.congestion_algorithm()
    }

    /// Reads available data, waiting for some if necessary. Returns 0 at the end of the stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.connection.read(buf).await
    }

    /// Copies as much data as fits into the send buffer, waiting for room if it is full
    pub async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.connection.write(data).await
    }

    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), TransportError> {
        while !data.is_empty() {
            let written = self.write(data).await?;
            data = &data[written..];
        }

        Ok(())
    }

    /// Closes the sending side of the connection
    pub fn shutdown(&self) {
        self.connection.shutdown();
    }

    /// Waits until everything written so far has been acknowledged by the peer
    pub async fn wait_until_acked(&self) -> Result<(), TransportError> {
        self.connection.wait_until_acked().await
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.connection.detach();
    }
}

/// Handles a TCP segment addressed to the node
pub(crate) fn handle(node: &Arc<Node>, packet: &Ipv4Packet, segment: &TcpSegment) {
    let key = ConnectionKey {
        local: SocketAddrV4::new(packet.destination, segment.destination_port),
        remote: SocketAddrV4::new(packet.source, segment.source_port),
    };

    let (connection, listener) = {
        let transport = node.transport.lock();
        (
            transport.tcp_connections.get(&key).cloned(),
            transport
                .tcp_listeners
                .get(&segment.destination_port)
                .cloned(),
        )
    };

    if let Some(connection) = connection {
        connection.on_segment(segment);
        return;
    }

    let is_syn = segment.flags.contains(TcpFlags::SYN)
        && !segment.flags.contains(TcpFlags::ACK)
        && !segment.flags.contains(TcpFlags::RST);
    if let (true, Some(listener)) = (is_syn, listener) {
        Connection::accept_syn(node, key, segment, &listener);
        return;
    }

    if !segment.flags.contains(TcpFlags::RST) {
        send_reset(node, packet, segment);
    }
}

/// Answers a segment that does not belong to any connection (RFC 793 reset generation)
fn send_reset(node: &Arc<Node>, packet: &Ipv4Packet, segment: &TcpSegment) {
    let (sequence, acknowledgement, flags) = if segment.flags.contains(TcpFlags::ACK) {
        (segment.acknowledgement, 0, TcpFlags::RST)
    } else {
        (
            0,
            segment.sequence.wrapping_add(segment.sequence_len()),
            TcpFlags::RST | TcpFlags::ACK,
        )
    };

    let reset = Ipv4Packet {
        source: packet.destination,
        destination: packet.source,
        ttl: DEFAULT_TTL,
        payload: IpPayload::Tcp(TcpSegment {
            source_port: segment.destination_port,
            destination_port: segment.source_port,
            sequence,
            acknowledgement,
            flags,
            window: 0,
            payload: Vec::new(),
        }),
    };

    if let Err(e) = node.send_ip(reset) {
        tracing::debug!(node = %node.name(), "failed to send tcp reset: {e}");
    }
}
