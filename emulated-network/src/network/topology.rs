//! Declarative topology builder
//!
//! Nodes and links are declared first and resolved into a [`NetworkSpec`] afterwards, following
//! the conventions of the classic network emulation frameworks: automatic addresses taken from an
//! ip base, `<node>-eth<N>` interface names and deterministic MAC addresses.

use crate::network::ip::Ipv4Cidr;
use crate::network::spec::{
    EndpointSpec, InterfaceSpec, LinkShaping, LinkSpec, NetworkSpec, NodeKind, NodeSpec,
    RouteSpec,
};
use crate::util::natural_cmp;
use anyhow::{Context, bail};
use pnet_base::MacAddr;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("invalid node name `{0}` (only letters, digits, `_` and `-` are allowed)")]
    InvalidNodeName(String),
    #[error("node `{0}` already exists")]
    DuplicateNode(String),
    #[error("unknown node `{0}`")]
    UnknownNode(String),
    #[error("cannot link node `{0}` to itself")]
    SelfLink(String),
    #[error("interface `{interface}` already exists on node `{node}`")]
    DuplicateInterface { node: String, interface: String },
    #[error("link id `{0}` is already in use")]
    DuplicateLinkId(String),
    #[error("link `{0}` would create a loop between switches")]
    SwitchLoop(String),
    #[error("switch `{0}` cannot have an ip address")]
    AddressOnSwitch(String),
    #[error("the address pool {0} has no addresses left")]
    AddressPoolExhausted(Ipv4Cidr),
    #[error("invalid shaping parameters for link `{link}`: {reason}")]
    InvalidShaping { link: String, reason: String },
}

/// Options accepted by [`Topology::add_host`] and [`Topology::add_router`]
#[derive(Clone, Debug, Default)]
pub struct HostOptions {
    /// Address of the node's first interface (taken from the ip base when missing)
    pub ip: Option<Ipv4Cidr>,
    pub default_route: Option<DefaultRoute>,
    pub mac: Option<MacAddr>,
}

/// Options accepted by [`Topology::add_link`]
#[derive(Clone, Debug, Default)]
pub struct LinkOptions {
    pub id: Option<String>,
    pub intf_name1: Option<String>,
    pub intf_name2: Option<String>,
    pub ip1: Option<Ipv4Cidr>,
    pub ip2: Option<Ipv4Cidr>,
    pub shaping: LinkShaping,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DefaultRoute {
    Via(Ipv4Addr),
    Dev(String),
}

impl FromStr for DefaultRoute {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<_> = s.split_whitespace().collect();
        match words[..] {
            ["via", gateway] | [gateway] => Ok(DefaultRoute::Via(
                gateway
                    .parse()
                    .with_context(|| format!("invalid default route gateway `{gateway}`"))?,
            )),
            ["dev", interface] => Ok(DefaultRoute::Dev(interface.to_string())),
            _ => bail!("invalid default route `{s}` (expected `via <ip>` or `dev <interface>`)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TopologyConfig {
    /// Pool used for the automatic addresses of hosts and routers
    pub ip_base: Ipv4Cidr,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            ip_base: Ipv4Cidr {
                address: Ipv4Addr::new(10, 0, 0, 0),
                network_prefix: 8,
            },
        }
    }
}

struct DeclaredNode {
    name: String,
    kind: NodeKind,
    options: HostOptions,
    next_port: u32,
    ports: Vec<DeclaredPort>,
    routes: Vec<RouteSpec>,
}

struct DeclaredPort {
    number: u32,
    interface: String,
    address: Option<Ipv4Cidr>,
}

struct DeclaredLink {
    id: String,
    // (node index, port index) for each side
    endpoints: [(usize, usize); 2],
    shaping: LinkShaping,
}

#[derive(Default)]
pub struct Topology {
    nodes: Vec<DeclaredNode>,
    links: Vec<DeclaredLink>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&mut self, name: &str, options: HostOptions) -> Result<(), TopologyError> {
        self.add_node(name, NodeKind::Host, options)
    }

    pub fn add_router(&mut self, name: &str, options: HostOptions) -> Result<(), TopologyError> {
        self.add_node(name, NodeKind::Router, options)
    }

    pub fn add_switch(&mut self, name: &str) -> Result<(), TopologyError> {
        self.add_node(name, NodeKind::Switch, HostOptions::default())
    }

    /// Adds a static route to a host or router
    pub fn add_route(&mut self, node: &str, route: RouteSpec) -> Result<(), TopologyError> {
        let index = self.node_index(node)?;
        if self.nodes[index].kind == NodeKind::Switch {
            return Err(TopologyError::AddressOnSwitch(node.to_string()));
        }

        self.nodes[index].routes.push(route);
        Ok(())
    }

    fn add_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        options: HostOptions,
    ) -> Result<(), TopologyError> {
        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(TopologyError::InvalidNodeName(name.to_string()));
        }

        if self.nodes.iter().any(|n| n.name == name) {
            return Err(TopologyError::DuplicateNode(name.to_string()));
        }

        if kind == NodeKind::Switch && options.ip.is_some() {
            return Err(TopologyError::AddressOnSwitch(name.to_string()));
        }

        self.nodes.push(DeclaredNode {
            name: name.to_string(),
            kind,
            options,
            // Switch ports are numbered from 1, other nodes start at 0
            next_port: if kind == NodeKind::Switch { 1 } else { 0 },
            ports: Vec::new(),
            routes: Vec::new(),
        });

        Ok(())
    }

    pub fn add_link(
        &mut self,
        node1: &str,
        node2: &str,
        options: LinkOptions,
    ) -> Result<(), TopologyError> {
        let index1 = self.node_index(node1)?;
        let index2 = self.node_index(node2)?;
        if index1 == index2 {
            return Err(TopologyError::SelfLink(node1.to_string()));
        }

        let id = match options.id {
            Some(id) => {
                if self.links.iter().any(|l| l.id == id) {
                    return Err(TopologyError::DuplicateLinkId(id));
                }
                id
            }
            None => self.default_link_id(node1, node2),
        };

        options
            .shaping
            .validate()
            .map_err(|reason| TopologyError::InvalidShaping {
                link: id.clone(),
                reason,
            })?;

        let interface1 = self.next_interface(index1, options.intf_name1.as_deref())?;
        let interface2 = self.next_interface(index2, options.intf_name2.as_deref())?;
        for (index, ip) in [(index1, options.ip1), (index2, options.ip2)] {
            if ip.is_some() && self.nodes[index].kind == NodeKind::Switch {
                return Err(TopologyError::AddressOnSwitch(self.nodes[index].name.clone()));
            }
        }

        let port1 = self.push_port(index1, interface1, options.ip1);
        let port2 = self.push_port(index2, interface2, options.ip2);
        self.links.push(DeclaredLink {
            id,
            endpoints: [(index1, port1), (index2, port2)],
            shaping: options.shaping,
        });

        Ok(())
    }

    fn node_index(&self, name: &str) -> Result<usize, TopologyError> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))
    }

    fn default_link_id(&self, node1: &str, node2: &str) -> String {
        let base = format!("{node1}-{node2}");
        let taken = |id: &str| self.links.iter().any(|l| l.id == id);
        if !taken(&base) {
            return base;
        }

        (2..)
            .map(|n| format!("{base}-{n}"))
            .find(|id| !taken(id))
            .unwrap_or(base)
    }

    /// Returns the port number and interface name that the next link on this node will use
    fn next_interface(
        &self,
        node_index: usize,
        explicit_name: Option<&str>,
    ) -> Result<(u32, String), TopologyError> {
        let node = &self.nodes[node_index];
        let number = node.next_port;
        let name = explicit_name
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("{}-eth{number}", node.name));

        if node.ports.iter().any(|p| p.interface == name) {
            return Err(TopologyError::DuplicateInterface {
                node: node.name.clone(),
                interface: name,
            });
        }

        Ok((number, name))
    }

    fn push_port(
        &mut self,
        node_index: usize,
        (number, interface): (u32, String),
        address: Option<Ipv4Cidr>,
    ) -> usize {
        let node = &mut self.nodes[node_index];
        node.next_port = number + 1;
        node.ports.push(DeclaredPort {
            number,
            interface,
            address,
        });
        node.ports.len() - 1
    }

    /// Resolves addresses, MAC addresses and routes, producing a spec that can be instantiated
    pub fn build(&self, config: &TopologyConfig) -> Result<NetworkSpec, TopologyError> {
        self.check_switch_loops()?;

        // Hosts and routers are numbered in natural name order, starting at 1. Each of them
        // consumes an address from the ip base, even if an explicit address was provided.
        let mut numbered: Vec<_> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].kind.has_ip_stack())
            .collect();
        numbered.sort_by(|&a, &b| natural_cmp(&self.nodes[a].name, &self.nodes[b].name));
        let mut numbers = HashMap::new();
        for (position, &index) in numbered.iter().enumerate() {
            numbers.insert(index, position as u64 + 1);
        }

        let mut next_mac = numbered.len() as u64 + 1;
        let mut macs: HashMap<(usize, usize), MacAddr> = HashMap::new();
        for link in &self.links {
            for &(node_index, port_index) in &link.endpoints {
                let node = &self.nodes[node_index];
                let is_first_port = node
                    .ports
                    .iter()
                    .map(|p| p.number)
                    .min()
                    .is_some_and(|min| min == node.ports[port_index].number);

                let mac = match numbers.get(&node_index) {
                    Some(&number) if is_first_port => {
                        node.options.mac.unwrap_or_else(|| mac_from_number(number))
                    }
                    _ => {
                        let mac = mac_from_number(next_mac);
                        next_mac += 1;
                        mac
                    }
                };
                macs.insert((node_index, port_index), mac);
            }
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (node_index, node) in self.nodes.iter().enumerate() {
            let node_address = match numbers.get(&node_index) {
                None => None,
                Some(&number) => Some(match node.options.ip {
                    Some(ip) => ip,
                    None => {
                        let address = config
                            .ip_base
                            .nth_host(number as u32)
                            .ok_or(TopologyError::AddressPoolExhausted(config.ip_base))?;
                        Ipv4Cidr {
                            address,
                            network_prefix: config.ip_base.network_prefix,
                        }
                    }
                }),
            };

            let mut ports: Vec<_> = node.ports.iter().enumerate().collect();
            ports.sort_by_key(|(_, p)| p.number);

            let interfaces = ports
                .iter()
                .enumerate()
                .map(|(position, (port_index, port))| InterfaceSpec {
                    name: port.interface.clone(),
                    mac: macs[&(node_index, *port_index)],
                    // The node's address always lands on its first interface
                    address: if position == 0 {
                        node_address.or(port.address)
                    } else {
                        port.address
                    },
                })
                .collect();

            let mut routes = Vec::new();
            match &node.options.default_route {
                None => {}
                Some(DefaultRoute::Via(gateway)) => routes.push(RouteSpec {
                    destination: Ipv4Cidr::any(),
                    gateway: Some(*gateway),
                    interface: None,
                }),
                Some(DefaultRoute::Dev(interface)) => routes.push(RouteSpec {
                    destination: Ipv4Cidr::any(),
                    gateway: None,
                    interface: Some(interface.clone()),
                }),
            }
            routes.extend(node.routes.iter().cloned());

            nodes.push(NodeSpec {
                name: node.name.clone(),
                kind: node.kind,
                interfaces,
                routes,
            });
        }

        let links = self
            .links
            .iter()
            .map(|link| LinkSpec {
                id: link.id.clone(),
                endpoints: link.endpoints.map(|(node_index, port_index)| {
                    let node = &self.nodes[node_index];
                    EndpointSpec {
                        node: node.name.clone(),
                        interface: node.ports[port_index].interface.clone(),
                    }
                }),
                shaping: link.shaping.clone(),
            })
            .collect();

        Ok(NetworkSpec { nodes, links })
    }

    /// Flooding switches must form a forest, otherwise broadcast frames would circulate forever
    fn check_switch_loops(&self) -> Result<(), TopologyError> {
        let mut parent: Vec<usize> = (0..self.nodes.len()).collect();
        fn root(parent: &mut [usize], mut node: usize) -> usize {
            while parent[node] != node {
                parent[node] = parent[parent[node]];
                node = parent[node];
            }
            node
        }

        for link in &self.links {
            let [(a, _), (b, _)] = link.endpoints;
            if self.nodes[a].kind != NodeKind::Switch || self.nodes[b].kind != NodeKind::Switch {
                continue;
            }

            let root_a = root(&mut parent, a);
            let root_b = root(&mut parent, b);
            if root_a == root_b {
                return Err(TopologyError::SwitchLoop(link.id.clone()));
            }
            parent[root_a] = root_b;
        }

        Ok(())
    }
}

fn mac_from_number(number: u64) -> MacAddr {
    let bytes = number.to_be_bytes();
    MacAddr::new(bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7])
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    fn interface<'a>(spec: &'a NetworkSpec, node: &str, name: &str) -> &'a InterfaceSpec {
        spec.node(node)
            .unwrap()
            .interfaces
            .iter()
            .find(|i| i.name == name)
            .unwrap()
    }

    fn dumbbell() -> Topology {
        let mut topo = Topology::new();
        topo.add_switch("s1").unwrap();
        topo.add_switch("s2").unwrap();
        for host in ["h1", "h2", "h3", "h4"] {
            topo.add_host(host, HostOptions::default()).unwrap();
        }
        topo.add_link("h1", "s1", LinkOptions::default()).unwrap();
        topo.add_link("h2", "s1", LinkOptions::default()).unwrap();
        topo.add_link("h3", "s2", LinkOptions::default()).unwrap();
        topo.add_link("h4", "s2", LinkOptions::default()).unwrap();
        topo.add_link(
            "s1",
            "s2",
            LinkOptions {
                shaping: LinkShaping {
                    delay: Duration::from_millis(5),
                    ..LinkShaping::default()
                },
                ..LinkOptions::default()
            },
        )
        .unwrap();
        topo
    }

    #[test]
    fn test_automatic_addresses_and_names() {
        let spec = dumbbell().build(&TopologyConfig::default()).unwrap();

        for (host, ip) in [
            ("h1", "10.0.0.1/8"),
            ("h2", "10.0.0.2/8"),
            ("h3", "10.0.0.3/8"),
            ("h4", "10.0.0.4/8"),
        ] {
            let intf = interface(&spec, host, &format!("{host}-eth0"));
            assert_eq!(intf.address, Some(cidr(ip)));
        }

        // Switch ports start at 1
        let s1 = spec.node("s1").unwrap();
        let names: Vec<_> = s1.interfaces.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["s1-eth1", "s1-eth2", "s1-eth3"]);
        assert!(s1.interfaces.iter().all(|i| i.address.is_none()));

        let core = spec.links.iter().find(|l| l.id == "s1-s2").unwrap();
        assert_eq!(core.endpoints[0].interface, "s1-eth3");
        assert_eq!(core.endpoints[1].interface, "s2-eth3");
        assert_eq!(core.shaping.delay, Duration::from_millis(5));
    }

    #[test]
    fn test_deterministic_macs() {
        let spec = dumbbell().build(&TopologyConfig::default()).unwrap();
        assert_eq!(
            interface(&spec, "h1", "h1-eth0").mac,
            MacAddr::new(0, 0, 0, 0, 0, 1)
        );
        assert_eq!(
            interface(&spec, "h4", "h4-eth0").mac,
            MacAddr::new(0, 0, 0, 0, 0, 4)
        );

        let mut all_macs: Vec<_> = spec
            .nodes
            .iter()
            .flat_map(|n| n.interfaces.iter().map(|i| i.mac))
            .collect();
        let total = all_macs.len();
        all_macs.sort_by_key(|m| m.to_string());
        all_macs.dedup();
        assert_eq!(all_macs.len(), total);
    }

    #[test]
    fn test_three_router_plan() {
        let mut topo = Topology::new();
        for (router, ip) in [
            ("ra", "10.0.0.1/24"),
            ("rb", "10.100.0.1/24"),
            ("rc", "10.200.0.1/24"),
        ] {
            topo.add_router(
                router,
                HostOptions {
                    ip: Some(cidr(ip)),
                    ..HostOptions::default()
                },
            )
            .unwrap();
        }
        topo.add_switch("s1").unwrap();
        topo.add_host(
            "h1",
            HostOptions {
                ip: Some(cidr("10.0.0.100/24")),
                default_route: Some("via 10.0.0.1".parse().unwrap()),
                ..HostOptions::default()
            },
        )
        .unwrap();

        topo.add_link(
            "s1",
            "ra",
            LinkOptions {
                intf_name2: Some("ra-eth0".to_string()),
                ip2: Some(cidr("10.0.0.1/24")),
                ..LinkOptions::default()
            },
        )
        .unwrap();
        topo.add_link(
            "ra",
            "rb",
            LinkOptions {
                intf_name1: Some("ra-eth1".to_string()),
                intf_name2: Some("rb-eth1".to_string()),
                ip1: Some(cidr("10.0.50.1/24")),
                ip2: Some(cidr("10.0.50.2/24")),
                ..LinkOptions::default()
            },
        )
        .unwrap();
        topo.add_link("h1", "s1", LinkOptions::default()).unwrap();

        let spec = topo.build(&TopologyConfig::default()).unwrap();
        assert_eq!(
            interface(&spec, "ra", "ra-eth0").address,
            Some(cidr("10.0.0.1/24"))
        );
        assert_eq!(
            interface(&spec, "ra", "ra-eth1").address,
            Some(cidr("10.0.50.1/24"))
        );
        // rb's only interface is its first one, so the node address wins over the link address
        assert_eq!(
            interface(&spec, "rb", "rb-eth1").address,
            Some(cidr("10.100.0.1/24"))
        );
        assert_eq!(
            interface(&spec, "h1", "h1-eth0").address,
            Some(cidr("10.0.0.100/24"))
        );

        let h1 = spec.node("h1").unwrap();
        assert_eq!(
            h1.routes,
            vec![RouteSpec {
                destination: Ipv4Cidr::any(),
                gateway: Some("10.0.0.1".parse().unwrap()),
                interface: None,
            }]
        );
    }

    #[test]
    fn test_natural_numbering() {
        let mut topo = Topology::new();
        topo.add_host("h10", HostOptions::default()).unwrap();
        topo.add_host("h2", HostOptions::default()).unwrap();
        topo.add_link("h10", "h2", LinkOptions::default()).unwrap();

        let spec = topo.build(&TopologyConfig::default()).unwrap();
        assert_eq!(
            interface(&spec, "h2", "h2-eth0").address,
            Some(cidr("10.0.0.1/8"))
        );
        assert_eq!(
            interface(&spec, "h10", "h10-eth0").address,
            Some(cidr("10.0.0.2/8"))
        );
    }

    #[test]
    fn test_declaration_errors() {
        let mut topo = Topology::new();
        topo.add_host("h1", HostOptions::default()).unwrap();
        topo.add_switch("s1").unwrap();

        assert_eq!(
            topo.add_host("h1", HostOptions::default()),
            Err(TopologyError::DuplicateNode("h1".to_string()))
        );
        assert_eq!(
            topo.add_host("bad name", HostOptions::default()),
            Err(TopologyError::InvalidNodeName("bad name".to_string()))
        );
        assert_eq!(
            topo.add_link("h1", "h9", LinkOptions::default()),
            Err(TopologyError::UnknownNode("h9".to_string()))
        );
        assert_eq!(
            topo.add_link("h1", "h1", LinkOptions::default()),
            Err(TopologyError::SelfLink("h1".to_string()))
        );

        let invalid = topo.add_link(
            "h1",
            "s1",
            LinkOptions {
                shaping: LinkShaping {
                    loss_percent: 150.0,
                    ..LinkShaping::default()
                },
                ..LinkOptions::default()
            },
        );
        assert!(matches!(
            invalid,
            Err(TopologyError::InvalidShaping { .. })
        ));

        topo.add_link(
            "h1",
            "s1",
            LinkOptions {
                intf_name1: Some("h1-eth1".to_string()),
                ..LinkOptions::default()
            },
        )
        .unwrap();
        topo.add_switch("s2").unwrap();
        assert_eq!(
            topo.add_link("h1", "s2", LinkOptions::default()),
            Err(TopologyError::DuplicateInterface {
                node: "h1".to_string(),
                interface: "h1-eth1".to_string(),
            })
        );
    }

    #[test]
    fn test_switch_loop_is_rejected() {
        let mut topo = Topology::new();
        for switch in ["s1", "s2", "s3"] {
            topo.add_switch(switch).unwrap();
        }
        topo.add_link("s1", "s2", LinkOptions::default()).unwrap();
        topo.add_link("s2", "s3", LinkOptions::default()).unwrap();
        topo.add_link("s3", "s1", LinkOptions::default()).unwrap();

        assert_eq!(
            topo.build(&TopologyConfig::default()).unwrap_err(),
            TopologyError::SwitchLoop("s3-s1".to_string())
        );
    }

    #[test]
    fn test_address_pool_exhaustion() {
        let mut topo = Topology::new();
        for host in ["h1", "h2", "h3"] {
            topo.add_host(host, HostOptions::default()).unwrap();
        }

        let config = TopologyConfig {
            ip_base: cidr("192.168.0.0/30"),
        };
        assert_eq!(
            topo.build(&config).unwrap_err(),
            TopologyError::AddressPoolExhausted(cidr("192.168.0.0/30"))
        );
    }

    #[test]
    fn test_parse_default_route() {
        assert_eq!(
            "via 10.0.0.1".parse::<DefaultRoute>().unwrap(),
            DefaultRoute::Via("10.0.0.1".parse().unwrap())
        );
        assert_eq!(
            "10.0.0.1".parse::<DefaultRoute>().unwrap(),
            DefaultRoute::Via("10.0.0.1".parse().unwrap())
        );
        assert_eq!(
            "dev h1-eth0".parse::<DefaultRoute>().unwrap(),
            DefaultRoute::Dev("h1-eth0".to_string())
        );
        assert!("via".parse::<DefaultRoute>().is_err());
    }
}
