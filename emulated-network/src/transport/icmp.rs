use crate::network::frame::{DEFAULT_TTL, ICMP_HEADER_SIZE, IcmpKind, IcmpMessage, IpPayload, Ipv4Packet};
use crate::network::node::Node;
use crate::transport::TransportError;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Offset of the echo identifier in the datagram quoted by an ICMP error (IPv4 header + ICMP
/// type, code and checksum)
const QUOTED_ECHO_IDENTIFIER_OFFSET: usize = 24;
const ECHO_REQUEST_TYPE: u8 = 8;

/// A reply to one of our echo requests, or an error caused by one of them
#[derive(Clone, Debug)]
pub struct IcmpReply {
    pub source: Ipv4Addr,
    pub kind: IcmpKind,
    pub sequence: u16,
    pub ttl: u8,
    /// Size of the ICMP message, header included
    pub size: usize,
    pub received_at: Instant,
}

/// A socket for sending echo requests, as used by `ping`
pub struct IcmpSocket {
    node: Arc<Node>,
    identifier: u16,
    replies: mpsc::UnboundedReceiver<IcmpReply>,
}

impl IcmpSocket {
    pub fn open(node: &Arc<Node>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut transport = node.transport.lock();
        let identifier = loop {
            let candidate = node.ctx.rng.lock().u16(..);
            if !transport.icmp_waiters.contains_key(&candidate) {
                break candidate;
            }
        };
        transport.icmp_waiters.insert(identifier, tx);

        Self {
            node: node.clone(),
            identifier,
            replies: rx,
        }
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    pub fn send_echo(
        &self,
        destination: Ipv4Addr,
        sequence: u16,
        payload_size: usize,
    ) -> Result<(), TransportError> {
        let source = self.node.source_address_for(destination)?;
        let data = (0..payload_size).map(|i| i as u8).collect();
        self.node.send_ip(Ipv4Packet {
            source,
            destination,
            ttl: DEFAULT_TTL,
            payload: IpPayload::Icmp(IcmpMessage {
                kind: IcmpKind::EchoRequest,
                identifier: self.identifier,
                sequence,
                data,
            }),
        })
    }

    pub async fn recv(&mut self) -> Option<IcmpReply> {
        self.replies.recv().await
    }
}

impl Drop for IcmpSocket {
    fn drop(&mut self) {
        self.node
            .transport
            .lock()
            .icmp_waiters
            .remove(&self.identifier);
    }
}

/// Handles an ICMP message addressed to the node
pub(crate) fn handle(node: &Arc<Node>, packet: &Ipv4Packet, message: &IcmpMessage) {
    let (identifier, sequence) = match message.kind {
        IcmpKind::EchoRequest => {
            let reply = Ipv4Packet {
                source: packet.destination,
                destination: packet.source,
                ttl: DEFAULT_TTL,
                payload: IpPayload::Icmp(IcmpMessage {
                    kind: IcmpKind::EchoReply,
                    identifier: message.identifier,
                    sequence: message.sequence,
                    data: message.data.clone(),
                }),
            };
            if let Err(e) = node.send_ip(reply) {
                tracing::debug!(node = %node.name(), "failed to send echo reply: {e}");
            }
            return;
        }
        IcmpKind::EchoReply => (message.identifier, message.sequence),
        IcmpKind::NetUnreachable
        | IcmpKind::HostUnreachable
        | IcmpKind::PortUnreachable
        | IcmpKind::TimeExceeded => match quoted_echo(&message.data) {
            Some(quoted) => quoted,
            None => return,
        },
    };

    let waiter = node.transport.lock().icmp_waiters.get(&identifier).cloned();
    if let Some(waiter) = waiter {
        waiter
            .send(IcmpReply {
                source: packet.source,
                kind: message.kind,
                sequence,
                ttl: packet.ttl,
                size: ICMP_HEADER_SIZE + message.data.len(),
                received_at: Instant::now(),
            })
            .ok();
    }
}

/// Extracts the identifier and sequence number of the echo request quoted by an error message
fn quoted_echo(data: &[u8]) -> Option<(u16, u16)> {
    let quoted = data.get(QUOTED_ECHO_IDENTIFIER_OFFSET - 4..QUOTED_ECHO_IDENTIFIER_OFFSET + 4)?;
    if quoted[0] != ECHO_REQUEST_TYPE {
        return None;
    }

    let identifier = u16::from_be_bytes([quoted[4], quoted[5]]);
    let sequence = u16::from_be_bytes([quoted[6], quoted[7]]);
    Some((identifier, sequence))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_quoted_echo() {
        let request = Ipv4Packet {
            source: "10.0.0.1".parse().unwrap(),
            destination: "10.0.0.2".parse().unwrap(),
            ttl: 1,
            payload: IpPayload::Icmp(IcmpMessage {
                kind: IcmpKind::EchoRequest,
                identifier: 0x1234,
                sequence: 7,
                data: vec![0; 56],
            }),
        };

        let quoted = request.to_bytes()[..28].to_vec();
        assert_eq!(quoted_echo(&quoted), Some((0x1234, 7)));
        assert_eq!(quoted_echo(&quoted[..20]), None);
    }
}
