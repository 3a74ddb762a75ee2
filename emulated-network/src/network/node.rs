//! Emulated nodes and their IP stack
//!
//! Hosts and routers share the same stack (routers just have `net.ipv4.ip_forward` enabled while
//! the network runs). Switches have no stack at all and bridge frames between their ports.

use crate::network::NetworkContext;
use crate::network::arp::{ArpCache, Neighbor};
use crate::network::frame::{
    ArpOperation, ArpPacket, DEFAULT_TTL, Frame, FramePayload, IcmpKind, IcmpMessage, IpPayload,
    Ipv4Packet, MTU,
};
use crate::network::ip::Ipv4Cidr;
use crate::network::link::LinkDirection;
use crate::network::route::{Route, RouteError, RouteOrigin, RoutingTable};
use crate::network::spec::{NodeKind, NodeSpec};
use crate::network::switch::{BridgeTable, Forwarding};
use crate::network::sysctl::{SysctlError, Sysctls};
use crate::pcap_exporter::CaptureTaps;
use crate::trace::stats::PacketStats;
use crate::transport::tcp::congestion::CongestionAlgorithm;
use crate::transport::{TransportError, TransportState, icmp, tcp, udp};
use anyhow::Context;
use parking_lot::Mutex;
use pnet_base::MacAddr;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use tokio::time::Instant;

/// Bytes of the offending datagram quoted by ICMP errors (IP header plus 8 bytes)
const ICMP_ERROR_QUOTE_LEN: usize = 28;

pub struct Node {
    name: Arc<str>,
    kind: NodeKind,
    pub(crate) ctx: Arc<NetworkContext>,
    me: Weak<Node>,
    state: Mutex<NodeState>,
    pub(crate) transport: Mutex<TransportState>,
}

struct NodeState {
    interfaces: Vec<Interface>,
    routes: RoutingTable,
    arp: ArpCache,
    sysctls: Sysctls,
    bridge: Option<BridgeTable>,
}

struct Interface {
    name: Arc<str>,
    mac: MacAddr,
    address: Option<Ipv4Cidr>,
    up: bool,
    egress: Option<Arc<LinkDirection>>,
    taps: Arc<CaptureTaps>,
    rx: PacketStats,
    tx: PacketStats,
}

/// A snapshot of an interface, as shown by `ip addr` and `ifconfig`
#[derive(Clone, Debug)]
pub struct InterfaceInfo {
    pub name: Arc<str>,
    pub mac: MacAddr,
    pub address: Option<Ipv4Cidr>,
    pub up: bool,
    pub link: Option<Arc<str>>,
    pub rx: PacketStats,
    pub tx: PacketStats,
}

impl NodeState {
    fn port_of(&self, interface: &str) -> Option<usize> {
        self.interfaces.iter().position(|i| &*i.name == interface)
    }

    fn is_local(&self, address: Ipv4Addr) -> bool {
        address.is_loopback()
            || self
                .interfaces
                .iter()
                .any(|i| i.address.is_some_and(|a| a.address() == address))
    }

    /// Broadcast addresses of the attached subnets also count as ours
    fn accepts(&self, address: Ipv4Addr) -> bool {
        self.is_local(address)
            || address == Ipv4Addr::BROADCAST
            || self.interfaces.iter().any(|i| {
                i.address
                    .is_some_and(|a| a.network_prefix() < 31 && a.broadcast() == address)
            })
    }

    fn any_address(&self) -> Option<Ipv4Addr> {
        self.interfaces
            .iter()
            .find_map(|i| i.address.map(|a| a.address()))
    }

    fn connected_route(interface: &Interface) -> Option<Route> {
        let address = interface.address?;
        Some(Route {
            destination: address.network(),
            gateway: None,
            interface: interface.name.clone(),
            origin: RouteOrigin::Kernel,
            source: Some(address.address()),
        })
    }

    fn add_route(
        &mut self,
        destination: Ipv4Cidr,
        gateway: Option<Ipv4Addr>,
        interface: Option<&str>,
    ) -> Result<(), RouteError> {
        if let Some(interface) = interface {
            if self.port_of(interface).is_none() {
                return Err(RouteError::UnknownDevice(interface.to_string()));
            }
        }

        let interface: Arc<str> = match (gateway, interface) {
            (Some(gateway), _) => {
                self.routes.check_gateway(gateway)?;
                match interface {
                    Some(interface) => Arc::from(interface),
                    None => self
                        .routes
                        .lookup(gateway)
                        .map(|r| r.interface.clone())
                        .ok_or(RouteError::UnreachableGateway)?,
                }
            }
            (None, Some(interface)) => Arc::from(interface),
            (None, None) => return Err(RouteError::MissingNexthop),
        };

        self.routes.add(Route {
            destination: destination.network(),
            gateway,
            interface,
            origin: RouteOrigin::Static,
            source: None,
        })
    }
}

impl Node {
    pub(crate) fn new(spec: &NodeSpec, ctx: &Arc<NetworkContext>) -> anyhow::Result<Arc<Self>> {
        let interfaces: Vec<_> = spec
            .interfaces
            .iter()
            .map(|i| Interface {
                name: Arc::from(i.name.as_str()),
                mac: i.mac,
                address: i.address,
                up: true,
                egress: None,
                taps: Arc::new(CaptureTaps::default()),
                rx: PacketStats::default(),
                tx: PacketStats::default(),
            })
            .collect();

        let mut routes = RoutingTable::new();
        for route in interfaces.iter().filter_map(NodeState::connected_route) {
            // Two interfaces on the same subnet share the first connected route
            routes.add(route).ok();
        }

        let mut state = NodeState {
            interfaces,
            routes,
            arp: ArpCache::new(),
            sysctls: Sysctls::new(ctx.default_congestion),
            bridge: (spec.kind == NodeKind::Switch).then(BridgeTable::new),
        };

        for route in &spec.routes {
            state
                .add_route(route.destination, route.gateway, route.interface.as_deref())
                .with_context(|| {
                    format!("failed to add route to {} on {}", route.destination, spec.name)
                })?;
        }

        Ok(Arc::new_cyclic(|me| Self {
            name: Arc::from(spec.name.as_str()),
            kind: spec.kind,
            ctx: ctx.clone(),
            me: me.clone(),
            state: Mutex::new(state),
            transport: Mutex::new(TransportState::default()),
        }))
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// The address of the first interface, as `node.IP()` returns it
    pub fn ip(&self) -> Option<Ipv4Addr> {
        let state = self.state.lock();
        state.interfaces.first()?.address.map(|a| a.address())
    }

    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.state
            .lock()
            .interfaces
            .iter()
            .map(|i| InterfaceInfo {
                name: i.name.clone(),
                mac: i.mac,
                address: i.address,
                up: i.up,
                link: i.egress.as_ref().map(|e| e.link_id().clone()),
                rx: i.rx.clone(),
                tx: i.tx.clone(),
            })
            .collect()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().routes.routes().to_vec()
    }

    /// The routing table in `route -n` format
    pub fn kernel_routing_table(&self) -> String {
        self.state.lock().routes.render_kernel_table()
    }

    pub fn add_route(
        &self,
        destination: Ipv4Cidr,
        gateway: Option<Ipv4Addr>,
        interface: Option<&str>,
    ) -> Result<(), RouteError> {
        self.state
            .lock()
            .add_route(destination, gateway, interface)
    }

    pub fn remove_route(&self, destination: Ipv4Cidr) -> Result<Route, RouteError> {
        self.state.lock().routes.remove(destination)
    }

    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.state.lock().arp.neighbors()
    }

    pub fn sysctl(&self, key: &str) -> Result<String, SysctlError> {
        self.state.lock().sysctls.get(key)
    }

    /// Sets a kernel parameter, returning its new value
    pub fn set_sysctl(&self, key: &str, value: &str) -> Result<String, SysctlError> {
        self.state.lock().sysctls.set(key, value)
    }

    pub fn set_ip_forward(&self, enabled: bool) {
        self.state.lock().sysctls.ip_forward = enabled;
    }

    pub fn congestion_control(&self) -> CongestionAlgorithm {
        self.state.lock().sysctls.congestion_control
    }

    pub fn interface_taps(&self, interface: &str) -> Option<Arc<CaptureTaps>> {
        let state = self.state.lock();
        let port = state.port_of(interface)?;
        Some(state.interfaces[port].taps.clone())
    }

    pub(crate) fn port_of(&self, interface: &str) -> Option<usize> {
        self.state.lock().port_of(interface)
    }

    pub(crate) fn port_taps(&self, port: usize) -> Option<Arc<CaptureTaps>> {
        Some(self.state.lock().interfaces.get(port)?.taps.clone())
    }

    pub(crate) fn attach_link(&self, port: usize, egress: Arc<LinkDirection>) {
        if let Some(interface) = self.state.lock().interfaces.get_mut(port) {
            interface.egress = Some(egress);
        }
    }

    /// Brings an interface up or down (`ip link set <interface> up|down`)
    ///
    /// A down interface neither sends nor receives, and its connected route disappears.
    pub fn set_interface_up(&self, interface: &str, up: bool) -> Result<(), RouteError> {
        let mut state = self.state.lock();
        let port = state
            .port_of(interface)
            .ok_or_else(|| RouteError::UnknownDevice(interface.to_string()))?;

        let was_up = std::mem::replace(&mut state.interfaces[port].up, up);
        if was_up == up {
            return Ok(());
        }

        if up {
            if let Some(route) = NodeState::connected_route(&state.interfaces[port]) {
                state.routes.add(route).ok();
            }
        } else {
            state.routes.remove_connected(interface);
        }

        Ok(())
    }

    /// The source address the kernel would pick for traffic towards `destination`
    pub fn source_address_for(&self, destination: Ipv4Addr) -> Result<Ipv4Addr, TransportError> {
        let state = self.state.lock();
        if destination.is_loopback() {
            return Ok(Ipv4Addr::LOCALHOST);
        }
        if state.is_local(destination) {
            return Ok(destination);
        }

        let route = state
            .routes
            .lookup(destination)
            .ok_or(TransportError::NetworkUnreachable)?;
        if let Some(source) = route.source {
            return Ok(source);
        }

        state
            .port_of(&route.interface)
            .and_then(|port| state.interfaces[port].address)
            .map(|a| a.address())
            .or_else(|| state.any_address())
            .ok_or(TransportError::NetworkUnreachable)
    }

    /// Sends an IP packet originated by this node
    pub(crate) fn send_ip(&self, packet: Ipv4Packet) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.is_local(packet.destination) {
            drop(state);

            // Loopback, delivered on the next tick so callers never see their own packets
            // synchronously
            let Some(node) = self.me.upgrade() else {
                return Ok(());
            };
            tokio::spawn(async move {
                node.deliver_local(packet);
            });
            return Ok(());
        }

        // Nothing is fragmented, so oversized packets are refused like with `IP_PMTUDISC_DO`
        if packet.size() > MTU {
            return Err(TransportError::MessageTooLong);
        }

        self.route_and_send(&mut state, packet)
    }

    /// Sends an ICMP error about a packet addressed to this node
    pub(crate) fn send_icmp_error(&self, packet: &Ipv4Packet, kind: IcmpKind) {
        let mut state = self.state.lock();
        let Some(error) = self.icmp_error(&state, packet, kind, Some(packet.destination)) else {
            return;
        };

        if let Err(e) = self.route_and_send(&mut state, error) {
            tracing::debug!(node = %self.name, "failed to send icmp error: {e}");
        }
    }

    /// Builds an ICMP error, unless the offending packet must not be answered
    fn icmp_error(
        &self,
        state: &NodeState,
        packet: &Ipv4Packet,
        kind: IcmpKind,
        source: Option<Ipv4Addr>,
    ) -> Option<Ipv4Packet> {
        // Errors about errors could loop forever
        if let IpPayload::Icmp(message) = &packet.payload {
            if !matches!(message.kind, IcmpKind::EchoRequest | IcmpKind::EchoReply) {
                return None;
            }
        }

        if packet.destination == Ipv4Addr::BROADCAST {
            return None;
        }

        let source = source.or_else(|| state.any_address())?;
        let mut quoted = packet.to_bytes();
        quoted.truncate(ICMP_ERROR_QUOTE_LEN);

        Some(Ipv4Packet {
            source,
            destination: packet.source,
            ttl: DEFAULT_TTL,
            payload: IpPayload::Icmp(IcmpMessage {
                kind,
                identifier: 0,
                sequence: 0,
                data: quoted,
            }),
        })
    }

    fn route_and_send(
        &self,
        state: &mut NodeState,
        packet: Ipv4Packet,
    ) -> Result<(), TransportError> {
        let route = state
            .routes
            .lookup(packet.destination)
            .ok_or(TransportError::NetworkUnreachable)?;
        let next_hop = route.next_hop(packet.destination);
        let port = state
            .port_of(&route.interface)
            .ok_or(TransportError::NetworkUnreachable)?;

        self.send_to_neighbor(state, port, next_hop, packet);
        Ok(())
    }

    /// Resolves the MAC address of the next hop, holding the packet back while ARP does its job
    fn send_to_neighbor(
        &self,
        state: &mut NodeState,
        port: usize,
        next_hop: Ipv4Addr,
        packet: Ipv4Packet,
    ) {
        let interface = &state.interfaces[port];
        let is_broadcast = next_hop == Ipv4Addr::BROADCAST
            || interface
                .address
                .is_some_and(|a| a.network_prefix() < 31 && a.broadcast() == next_hop);
        if is_broadcast {
            self.transmit(state, port, MacAddr::broadcast(), FramePayload::Ipv4(packet));
            return;
        }

        if let Some(mac) = state.arp.lookup(next_hop) {
            self.transmit(state, port, mac, FramePayload::Ipv4(packet));
            return;
        }

        let interface_name = interface.name.clone();
        let sender_ip = interface
            .address
            .map(|a| a.address())
            .unwrap_or(packet.source);
        let sender_mac = interface.mac;

        let queued = state
            .arp
            .queue(next_hop, &interface_name, port, packet, Instant::now());

        if let Some(dropped) = queued.dropped {
            match state.arp.lookup(next_hop) {
                Some(mac) => self.transmit(state, port, mac, FramePayload::Ipv4(dropped)),
                None => tracing::debug!(
                    node = %self.name,
                    "arp queue towards {next_hop} is full, dropping the oldest packet"
                ),
            }
        }

        if queued.send_request {
            let request = ArpPacket {
                operation: ArpOperation::Request,
                sender_mac,
                sender_ip,
                target_mac: MacAddr::zero(),
                target_ip: next_hop,
            };
            self.transmit(state, port, MacAddr::broadcast(), FramePayload::Arp(request));
        }
    }

    /// Puts a frame on the link attached to `port`
    fn transmit(
        &self,
        state: &mut NodeState,
        port: usize,
        destination: MacAddr,
        payload: FramePayload,
    ) {
        let frame = Frame {
            id: self.ctx.new_frame_id(),
            source: state.interfaces[port].mac,
            destination,
            payload,
        };
        Self::transmit_frame(state, port, frame);
    }

    fn transmit_frame(state: &mut NodeState, port: usize, frame: Frame) {
        let Some(interface) = state.interfaces.get_mut(port) else {
            return;
        };

        if !interface.up {
            return;
        }

        if let Some(egress) = &interface.egress {
            interface.tx.track_one(frame.wire_size());
            egress.enqueue(frame);
        }
    }

    /// Handles a frame that arrived through the link attached to `port`
    pub(crate) fn receive(&self, port: usize, frame: Frame, at: Instant) {
        let mut state = self.state.lock();
        let Some(interface) = state.interfaces.get_mut(port) else {
            return;
        };

        if !interface.up {
            return;
        }

        interface.taps.record(at, &frame);
        interface.rx.track_one(frame.wire_size());
        let interface_mac = interface.mac;

        if self.kind == NodeKind::Switch {
            self.bridge(&mut state, port, frame);
            return;
        }

        if frame.destination != interface_mac && frame.destination != MacAddr::broadcast() {
            return;
        }

        match frame.payload {
            FramePayload::Arp(arp) => self.handle_arp(&mut state, port, arp),
            FramePayload::Ipv4(packet) => {
                if state.accepts(packet.destination) {
                    drop(state);
                    self.deliver_local(packet);
                } else if state.sysctls.ip_forward {
                    self.forward(&mut state, port, packet);
                } else {
                    tracing::trace!(
                        node = %self.name,
                        "dropping packet for {} (forwarding disabled)",
                        packet.destination
                    );
                }
            }
        }
    }

    fn bridge(&self, state: &mut NodeState, ingress: usize, frame: Frame) {
        if !self.ctx.is_started() {
            return;
        }

        let Some(bridge) = state.bridge.as_mut() else {
            return;
        };

        match bridge.process(frame.source, frame.destination, ingress) {
            Forwarding::Port(port) => Self::transmit_frame(state, port, frame),
            Forwarding::Flood => {
                for port in 0..state.interfaces.len() {
                    if port != ingress {
                        Self::transmit_frame(state, port, frame.clone());
                    }
                }
            }
            Forwarding::Filter => {}
        }
    }

    fn handle_arp(&self, state: &mut NodeState, port: usize, arp: ArpPacket) {
        let targets_us = state.is_local(arp.target_ip);
        let interface_name = state.interfaces[port].name.clone();
        let (resolved_port, pending) =
            state
                .arp
                .learn(arp.sender_ip, arp.sender_mac, &interface_name, port, targets_us);

        for packet in pending {
            self.transmit(
                state,
                resolved_port,
                arp.sender_mac,
                FramePayload::Ipv4(packet),
            );
        }

        if arp.operation == ArpOperation::Request && targets_us {
            let reply = ArpPacket {
                operation: ArpOperation::Reply,
                sender_mac: state.interfaces[port].mac,
                sender_ip: arp.target_ip,
                target_mac: arp.sender_mac,
                target_ip: arp.sender_ip,
            };
            self.transmit(state, port, arp.sender_mac, FramePayload::Arp(reply));
        }
    }

    fn forward(&self, state: &mut NodeState, ingress: usize, mut packet: Ipv4Packet) {
        let ingress_address = state.interfaces[ingress].address.map(|a| a.address());

        if packet.ttl <= 1 {
            if let Some(error) =
                self.icmp_error(state, &packet, IcmpKind::TimeExceeded, ingress_address)
            {
                self.route_and_send(state, error).ok();
            }
            return;
        }

        packet.ttl -= 1;
        if state.routes.lookup(packet.destination).is_none() {
            if let Some(error) =
                self.icmp_error(state, &packet, IcmpKind::NetUnreachable, ingress_address)
            {
                self.route_and_send(state, error).ok();
            }
            return;
        }

        self.route_and_send(state, packet).ok();
    }

    fn deliver_local(&self, packet: Ipv4Packet) {
        let Some(node) = self.me.upgrade() else {
            return;
        };

        match &packet.payload {
            IpPayload::Icmp(message) => icmp::handle(&node, &packet, message),
            IpPayload::Udp(datagram) => udp::handle(&node, &packet, datagram),
            IpPayload::Tcp(segment) => tcp::handle(&node, &packet, segment),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::spec::{InterfaceSpec, RouteSpec};
    use crate::network::test_context;

    fn router_spec() -> NodeSpec {
        NodeSpec {
            name: "r1".to_string(),
            kind: NodeKind::Router,
            interfaces: vec![
                InterfaceSpec {
                    name: "r1-eth0".to_string(),
                    mac: MacAddr::new(0, 0, 0, 0, 0, 1),
                    address: Some("192.168.1.1/24".parse().unwrap()),
                },
                InterfaceSpec {
                    name: "r1-eth1".to_string(),
                    mac: MacAddr::new(0, 0, 0, 0, 0, 2),
                    address: Some("10.0.0.1/30".parse().unwrap()),
                },
            ],
            routes: vec![RouteSpec {
                destination: "192.168.2.0/24".parse().unwrap(),
                gateway: Some("10.0.0.2".parse().unwrap()),
                interface: None,
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_and_source_addresses() {
        let node = Node::new(&router_spec(), &test_context()).unwrap();
        assert_eq!(node.ip(), Some("192.168.1.1".parse().unwrap()));

        let routes: Vec<_> = node.routes().iter().map(|r| r.to_string()).collect();
        assert_eq!(
            routes,
            [
                "192.168.1.0/24 dev r1-eth0 proto kernel scope link src 192.168.1.1",
                "10.0.0.0/30 dev r1-eth1 proto kernel scope link src 10.0.0.1",
                "192.168.2.0/24 via 10.0.0.2 dev r1-eth1",
            ]
        );

        assert_eq!(
            node.source_address_for("192.168.2.7".parse().unwrap()),
            Ok("10.0.0.1".parse().unwrap())
        );
        assert_eq!(
            node.source_address_for("8.8.8.8".parse().unwrap()),
            Err(TransportError::NetworkUnreachable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_errors() {
        let node = Node::new(&router_spec(), &test_context()).unwrap();
        let destination: Ipv4Cidr = "172.16.0.0/16".parse().unwrap();

        assert_eq!(
            node.add_route(destination, Some("172.16.0.1".parse().unwrap()), None),
            Err(RouteError::UnreachableGateway)
        );
        assert_eq!(
            node.add_route(destination, None, Some("eth7")),
            Err(RouteError::UnknownDevice("eth7".to_string()))
        );
        assert_eq!(
            node.add_route(destination, None, None),
            Err(RouteError::MissingNexthop)
        );

        node.add_route(destination, None, Some("r1-eth0")).unwrap();
        assert!(node.remove_route(destination).is_ok());
        assert_eq!(
            node.remove_route(destination),
            Err(RouteError::NotFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_down_removes_connected_route() {
        let node = Node::new(&router_spec(), &test_context()).unwrap();
        node.set_interface_up("r1-eth0", false).unwrap();
        assert!(
            node.routes()
                .iter()
                .all(|r| &*r.interface != "r1-eth0")
        );
        assert!(!node.interfaces()[0].up);

        node.set_interface_up("r1-eth0", true).unwrap();
        assert_eq!(node.routes().len(), 3);
    }
}
