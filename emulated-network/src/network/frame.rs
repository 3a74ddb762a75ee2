//! Frames exchanged between emulated nodes
//!
//! Frames are kept in a structured form while they travel through the emulated network. They are
//! only turned into bytes when a capture needs them (see [`Frame::to_bytes`]).

use pnet_base::MacAddr;
use pnet_packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet_packet::icmp::{IcmpCode, IcmpTypes, MutableIcmpPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::MutableIpv4Packet;
use pnet_packet::tcp::MutableTcpPacket;
use pnet_packet::udp::MutableUdpPacket;
use pnet_packet::{icmp, ipv4, tcp, udp};
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use uuid::Uuid;

pub const ETHERNET_HEADER_SIZE: usize = 14;
pub const MIN_FRAME_SIZE: usize = 60;
pub const ARP_PACKET_SIZE: usize = 28;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const ICMP_HEADER_SIZE: usize = 8;
pub const UDP_HEADER_SIZE: usize = 8;
pub const TCP_HEADER_SIZE: usize = 20;
/// Largest IP packet an interface transmits (loopback excepted)
pub const MTU: usize = 1500;
/// Largest payload that fits in the 16-bit length of an IP packet carrying UDP
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - IPV4_HEADER_SIZE - UDP_HEADER_SIZE;
pub const DEFAULT_TTL: u8 = 64;

#[derive(Clone, Debug)]
pub struct Frame {
    pub id: Uuid,
    pub source: MacAddr,
    pub destination: MacAddr,
    pub payload: FramePayload,
}

#[derive(Clone, Debug)]
pub enum FramePayload {
    Arp(ArpPacket),
    Ipv4(Ipv4Packet),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
}

#[derive(Clone, Debug)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

#[derive(Clone, Debug)]
pub struct Ipv4Packet {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub ttl: u8,
    pub payload: IpPayload,
}

#[derive(Clone, Debug)]
pub enum IpPayload {
    Icmp(IcmpMessage),
    Udp(UdpDatagram),
    Tcp(TcpSegment),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcmpKind {
    EchoRequest,
    EchoReply,
    NetUnreachable,
    HostUnreachable,
    PortUnreachable,
    TimeExceeded,
}

#[derive(Clone, Debug)]
pub struct IcmpMessage {
    pub kind: IcmpKind,
    pub identifier: u16,
    pub sequence: u16,
    /// Echo payload, or the header of the offending datagram for error messages
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct UdpDatagram {
    pub source_port: u16,
    pub destination_port: u16,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0b0000_0001);
    pub const SYN: TcpFlags = TcpFlags(0b0000_0010);
    pub const RST: TcpFlags = TcpFlags(0b0000_0100);
    pub const PSH: TcpFlags = TcpFlags(0b0000_1000);
    pub const ACK: TcpFlags = TcpFlags(0b0001_0000);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

impl Display for TcpFlags {
    /// Uses tcpdump's notation (`S`, `.`, `P`, `F`, `R`)
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut written = false;
        for (flag, symbol) in [
            (TcpFlags::SYN, "S"),
            (TcpFlags::FIN, "F"),
            (TcpFlags::PSH, "P"),
            (TcpFlags::RST, "R"),
        ] {
            if self.contains(flag) {
                write!(f, "{symbol}")?;
                written = true;
            }
        }

        if self.contains(TcpFlags::ACK) || !written {
            write!(f, ".")?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct TcpSegment {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// The amount of sequence space used by this segment (SYN and FIN count as one byte)
    pub fn sequence_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        len
    }
}

impl Frame {
    /// Size of the frame on the wire, in bytes (padded to the Ethernet minimum, without FCS)
    pub fn wire_size(&self) -> usize {
        let payload_size = match &self.payload {
            FramePayload::Arp(_) => ARP_PACKET_SIZE,
            FramePayload::Ipv4(packet) => packet.size(),
        };

        (ETHERNET_HEADER_SIZE + payload_size).max(MIN_FRAME_SIZE)
    }

    pub fn ipv4(&self) -> Option<&Ipv4Packet> {
        match &self.payload {
            FramePayload::Ipv4(packet) => Some(packet),
            FramePayload::Arp(_) => None,
        }
    }

    /// Serializes the frame into Ethernet bytes, as they would be seen by a packet capture
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = match &self.payload {
            FramePayload::Arp(arp) => arp.to_bytes(),
            FramePayload::Ipv4(packet) => packet.to_bytes(),
        };

        let frame_len = (ETHERNET_HEADER_SIZE + payload.len()).max(MIN_FRAME_SIZE);
        let mut buffer = vec![0; frame_len];
        let mut writer = MutableEthernetPacket::new(&mut buffer).unwrap();
        writer.set_destination(self.destination);
        writer.set_source(self.source);
        writer.set_ethertype(match self.payload {
            FramePayload::Arp(_) => EtherTypes::Arp,
            FramePayload::Ipv4(_) => EtherTypes::Ipv4,
        });
        drop(writer);

        buffer[ETHERNET_HEADER_SIZE..ETHERNET_HEADER_SIZE + payload.len()]
            .copy_from_slice(&payload);
        buffer
    }
}

impl ArpPacket {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0; ARP_PACKET_SIZE];
        let mut writer = MutableArpPacket::new(&mut buffer).unwrap();
        writer.set_hardware_type(ArpHardwareTypes::Ethernet);
        writer.set_protocol_type(EtherTypes::Ipv4);
        writer.set_hw_addr_len(6);
        writer.set_proto_addr_len(4);
        writer.set_operation(match self.operation {
            ArpOperation::Request => ArpOperations::Request,
            ArpOperation::Reply => ArpOperations::Reply,
        });
        writer.set_sender_hw_addr(self.sender_mac);
        writer.set_sender_proto_addr(self.sender_ip);
        writer.set_target_hw_addr(self.target_mac);
        writer.set_target_proto_addr(self.target_ip);
        drop(writer);
        buffer
    }
}

impl Ipv4Packet {
    /// Size of the IP packet, headers included
    pub fn size(&self) -> usize {
        IPV4_HEADER_SIZE
            + match &self.payload {
                IpPayload::Icmp(message) => ICMP_HEADER_SIZE + message.data.len(),
                IpPayload::Udp(datagram) => UDP_HEADER_SIZE + datagram.payload.len(),
                IpPayload::Tcp(segment) => TCP_HEADER_SIZE + segment.payload.len(),
            }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let transport = match &self.payload {
            IpPayload::Icmp(message) => message.to_bytes(),
            IpPayload::Udp(datagram) => datagram.to_bytes(self.source, self.destination),
            IpPayload::Tcp(segment) => segment.to_bytes(self.source, self.destination),
        };

        let total_length = IPV4_HEADER_SIZE + transport.len();
        let mut buffer = vec![0; total_length];
        let mut ip_writer = MutableIpv4Packet::new(&mut buffer).unwrap();
        ip_writer.set_version(4);
        ip_writer.set_header_length(5); // We don't use options
        ip_writer.set_dscp(0);
        ip_writer.set_identification(0); // We never fragment
        ip_writer.set_flags(0b010); // We never fragment
        ip_writer.set_fragment_offset(0); // We never fragment
        ip_writer.set_ttl(self.ttl);
        ip_writer.set_next_level_protocol(match self.payload {
            IpPayload::Icmp(_) => IpNextHeaderProtocols::Icmp,
            IpPayload::Udp(_) => IpNextHeaderProtocols::Udp,
            IpPayload::Tcp(_) => IpNextHeaderProtocols::Tcp,
        });
        ip_writer.set_source(self.source);
        ip_writer.set_destination(self.destination);
        ip_writer.set_total_length(total_length as u16);
        ip_writer.set_payload(&transport);
        let checksum = ipv4::checksum(&ip_writer.to_immutable());
        ip_writer.set_checksum(checksum);
        drop(ip_writer);

        buffer
    }
}

impl IcmpMessage {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0; ICMP_HEADER_SIZE + self.data.len()];
        let mut writer = MutableIcmpPacket::new(&mut buffer).unwrap();
        let (icmp_type, code) = match self.kind {
            IcmpKind::EchoRequest => (IcmpTypes::EchoRequest, 0),
            IcmpKind::EchoReply => (IcmpTypes::EchoReply, 0),
            IcmpKind::NetUnreachable => (IcmpTypes::DestinationUnreachable, 0),
            IcmpKind::HostUnreachable => (IcmpTypes::DestinationUnreachable, 1),
            IcmpKind::PortUnreachable => (IcmpTypes::DestinationUnreachable, 3),
            IcmpKind::TimeExceeded => (IcmpTypes::TimeExceeded, 0),
        };
        writer.set_icmp_type(icmp_type);
        writer.set_icmp_code(IcmpCode::new(code));

        // The "rest of header" holds the echo identifier and sequence number
        let mut payload = Vec::with_capacity(4 + self.data.len());
        payload.extend_from_slice(&self.identifier.to_be_bytes());
        payload.extend_from_slice(&self.sequence.to_be_bytes());
        payload.extend_from_slice(&self.data);
        writer.set_payload(&payload);
        let checksum = icmp::checksum(&writer.to_immutable());
        writer.set_checksum(checksum);
        drop(writer);

        buffer
    }
}

impl UdpDatagram {
    fn to_bytes(&self, source: Ipv4Addr, destination: Ipv4Addr) -> Vec<u8> {
        let length = UDP_HEADER_SIZE + self.payload.len();
        let mut buffer = vec![0; length];
        let mut udp_writer = MutableUdpPacket::new(&mut buffer).unwrap();
        udp_writer.set_source(self.source_port);
        udp_writer.set_destination(self.destination_port);
        udp_writer.set_length(length as u16);
        udp_writer.set_payload(&self.payload);
        let checksum = udp::ipv4_checksum(&udp_writer.to_immutable(), &source, &destination);
        udp_writer.set_checksum(checksum);
        drop(udp_writer);

        buffer
    }
}

impl TcpSegment {
    fn to_bytes(&self, source: Ipv4Addr, destination: Ipv4Addr) -> Vec<u8> {
        let mut buffer = vec![0; TCP_HEADER_SIZE + self.payload.len()];
        let mut tcp_writer = MutableTcpPacket::new(&mut buffer).unwrap();
        tcp_writer.set_source(self.source_port);
        tcp_writer.set_destination(self.destination_port);
        tcp_writer.set_sequence(self.sequence);
        tcp_writer.set_acknowledgement(self.acknowledgement);
        tcp_writer.set_data_offset(5);
        tcp_writer.set_flags(self.flags.bits().into());
        tcp_writer.set_window(self.window);
        tcp_writer.set_payload(&self.payload);
        let checksum = tcp::ipv4_checksum(&tcp_writer.to_immutable(), &source, &destination);
        tcp_writer.set_checksum(checksum);
        drop(tcp_writer);

        buffer
    }
}

impl Display for Frame {
    /// One-line summary in the style of `tcpdump -n`
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            FramePayload::Arp(arp) => match arp.operation {
                ArpOperation::Request => write!(
                    f,
                    "ARP, Request who-has {} tell {}, length 28",
                    arp.target_ip, arp.sender_ip
                ),
                ArpOperation::Reply => write!(
                    f,
                    "ARP, Reply {} is-at {}, length 28",
                    arp.sender_ip, arp.sender_mac
                ),
            },
            FramePayload::Ipv4(packet) => match &packet.payload {
                IpPayload::Icmp(message) => {
                    let description = match message.kind {
                        IcmpKind::EchoRequest => "echo request",
                        IcmpKind::EchoReply => "echo reply",
                        IcmpKind::NetUnreachable => "net unreachable",
                        IcmpKind::HostUnreachable => "host unreachable",
                        IcmpKind::PortUnreachable => "port unreachable",
                        IcmpKind::TimeExceeded => "time exceeded in-transit",
                    };
                    write!(
                        f,
                        "IP {} > {}: ICMP {description}, id {}, seq {}, length {}",
                        packet.source,
                        packet.destination,
                        message.identifier,
                        message.sequence,
                        ICMP_HEADER_SIZE + message.data.len()
                    )
                }
                IpPayload::Udp(datagram) => write!(
                    f,
                    "IP {}.{} > {}.{}: UDP, length {}",
                    packet.source,
                    datagram.source_port,
                    packet.destination,
                    datagram.destination_port,
                    datagram.payload.len()
                ),
                IpPayload::Tcp(segment) => {
                    write!(
                        f,
                        "IP {}.{} > {}.{}: Flags [{}], seq {}",
                        packet.source,
                        segment.source_port,
                        packet.destination,
                        segment.destination_port,
                        segment.flags,
                        segment.sequence,
                    )?;
                    if !segment.payload.is_empty() {
                        write!(
                            f,
                            ":{}",
                            segment.sequence.wrapping_add(segment.payload.len() as u32)
                        )?;
                    }
                    if segment.flags.contains(TcpFlags::ACK) {
                        write!(f, ", ack {}", segment.acknowledgement)?;
                    }
                    write!(
                        f,
                        ", win {}, length {}",
                        segment.window,
                        segment.payload.len()
                    )
                }
            },
        }
    }
}
