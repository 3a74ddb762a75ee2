use crate::network::ip::Ipv4Cidr;
use anyhow::Context;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

/// Who installed a route, as shown by `ip route`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOrigin {
    /// Derived from an interface address
    Kernel,
    /// Added by the topology or by `ip route add`
    Static,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
    pub interface: Arc<str>,
    pub origin: RouteOrigin,
    /// Preferred source address (only set for connected routes)
    pub source: Option<Ipv4Addr>,
}

impl Route {
    pub fn is_default(&self) -> bool {
        self.destination.network_prefix() == 0
    }

    /// The address the packet should be handed to on the outgoing link
    pub fn next_hop(&self, destination: Ipv4Addr) -> Ipv4Addr {
        self.gateway.unwrap_or(destination)
    }
}

impl Display for Route {
    /// Formats the route the way `ip route show` does
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_default() {
            write!(f, "default")?;
        } else {
            let network = self.destination.network();
            if network.network_prefix() == 32 {
                write!(f, "{}", network.address())?;
            } else {
                write!(f, "{network}")?;
            }
        }

        if let Some(gateway) = self.gateway {
            write!(f, " via {gateway}")?;
        }
        write!(f, " dev {}", self.interface)?;

        match self.origin {
            RouteOrigin::Kernel => {
                write!(f, " proto kernel scope link")?;
                if let Some(source) = self.source {
                    write!(f, " src {source}")?;
                }
            }
            RouteOrigin::Static => {}
        }

        Ok(())
    }
}

/// Destination of a route, which can be `default` or a CIDR range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteDestination(pub Ipv4Cidr);

impl FromStr for RouteDestination {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "default" || s == "0/0" {
            return Ok(Self(Ipv4Cidr::any()));
        }

        let cidr: Ipv4Cidr = s
            .parse()
            .with_context(|| format!("invalid route destination `{s}`"))?;
        Ok(Self(cidr.network()))
    }
}

#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("RTNETLINK answers: File exists")]
    AlreadyExists,
    #[error("RTNETLINK answers: No such process")]
    NotFound,
    #[error("Error: Nexthop has invalid gateway.")]
    UnreachableGateway,
    #[error("Cannot find device \"{0}\"")]
    UnknownDevice(String),
    #[error("Error: Device for nexthop is not up.")]
    MissingNexthop,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn add(&mut self, route: Route) -> Result<(), RouteError> {
        let exists = self.routes.iter().any(|r| {
            r.destination.network() == route.destination.network() && r.origin == route.origin
        });
        if exists {
            return Err(RouteError::AlreadyExists);
        }

        self.routes.push(route);
        Ok(())
    }

    pub fn remove(&mut self, destination: Ipv4Cidr) -> Result<Route, RouteError> {
        let position = self
            .routes
            .iter()
            .position(|r| r.destination.network() == destination.network())
            .ok_or(RouteError::NotFound)?;
        Ok(self.routes.remove(position))
    }

    /// Removes the connected route derived from the provided interface address
    pub(crate) fn remove_connected(&mut self, interface: &str) {
        self.routes
            .retain(|r| !(r.origin == RouteOrigin::Kernel && &*r.interface == interface));
    }

    /// Finds the most specific route towards `destination`
    pub fn lookup(&self, destination: Ipv4Addr) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|r| r.destination.contains(destination))
            .max_by_key(|r| {
                // Longest prefix wins; on ties, connected routes win over static ones
                (
                    r.destination.network_prefix(),
                    r.origin == RouteOrigin::Kernel,
                )
            })
    }

    /// Renders the table the way `route -n` does
    pub fn render_kernel_table(&self) -> String {
        let mut output = String::from("Kernel IP routing table\n");
        output.push_str(&format!(
            "{:<16}{:<16}{:<16}{:<6}{:<7}{:<4}{:>4} {}\n",
            "Destination", "Gateway", "Genmask", "Flags", "Metric", "Ref", "Use", "Iface"
        ));

        let mut sorted: Vec<_> = self.routes.iter().collect();
        sorted.sort_by_key(|r| std::cmp::Reverse(r.destination.network_prefix()));
        for route in sorted {
            let mut flags = String::from("U");
            if route.gateway.is_some() {
                flags.push('G');
            }
            if route.destination.network_prefix() == 32 {
                flags.push('H');
            }

            output.push_str(&format!(
                "{:<16}{:<16}{:<16}{:<6}{:<7}{:<4}{:>4} {}\n",
                route.destination.network().address().to_string(),
                route.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED).to_string(),
                Ipv4Addr::from_bits(route.destination.mask()).to_string(),
                flags,
                0,
                0,
                0,
                route.interface
            ));
        }

        output
    }

    /// Gateways must be directly reachable through one of the connected networks
    pub(crate) fn check_gateway(&self, gateway: Ipv4Addr) -> Result<(), RouteError> {
        let reachable = self
            .routes
            .iter()
            .any(|r| r.origin == RouteOrigin::Kernel && r.destination.contains(gateway));
        if reachable {
            Ok(())
        } else {
            Err(RouteError::UnreachableGateway)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn route(destination: &str, gateway: Option<&str>, interface: &str) -> Route {
        Route {
            destination: destination.parse::<RouteDestination>().unwrap().0,
            gateway: gateway.map(|g| g.parse().unwrap()),
            interface: interface.into(),
            origin: RouteOrigin::Static,
            source: None,
        }
    }

    #[test]
    fn test_longest_prefix_match() {
        let mut table = RoutingTable::new();
        table.add(route("default", Some("10.0.0.1"), "h1-eth0")).unwrap();
        table.add(route("10.100.0.0/16", Some("10.0.0.2"), "h1-eth0")).unwrap();
        table.add(route("10.100.5.0/24", Some("10.0.0.3"), "h1-eth0")).unwrap();

        let next = |ip: &str| {
            let ip: Ipv4Addr = ip.parse().unwrap();
            table.lookup(ip).unwrap().next_hop(ip).to_string()
        };

        assert_eq!(next("8.8.8.8"), "10.0.0.1");
        assert_eq!(next("10.100.1.1"), "10.0.0.2");
        assert_eq!(next("10.100.5.9"), "10.0.0.3");
    }

    #[test]
    fn test_duplicate_and_missing_routes() {
        let mut table = RoutingTable::new();
        table.add(route("10.200.0.0/24", Some("10.0.150.2"), "ra-eth2")).unwrap();
        assert_eq!(
            table.add(route("10.200.0.7/24", Some("10.0.150.3"), "ra-eth2")),
            Err(RouteError::AlreadyExists)
        );

        let removed = table.remove("10.200.0.0/24".parse().unwrap()).unwrap();
        assert_eq!(removed.gateway, Some("10.0.150.2".parse().unwrap()));
        assert_eq!(
            table.remove("10.200.0.0/24".parse().unwrap()),
            Err(RouteError::NotFound)
        );
    }

    #[test]
    fn test_route_display() {
        let connected = Route {
            destination: "10.0.0.1/24".parse::<Ipv4Cidr>().unwrap().network(),
            gateway: None,
            interface: "ra-eth0".into(),
            origin: RouteOrigin::Kernel,
            source: Some("10.0.0.1".parse().unwrap()),
        };
        assert_eq!(
            connected.to_string(),
            "10.0.0.0/24 dev ra-eth0 proto kernel scope link src 10.0.0.1"
        );
        assert_eq!(
            route("default", Some("10.0.0.1"), "h1-eth0").to_string(),
            "default via 10.0.0.1 dev h1-eth0"
        );
    }

    #[test]
    fn test_kernel_table_lists_gateway_flags() {
        let mut table = RoutingTable::new();
        table.add(route("10.100.0.0/24", Some("10.0.50.2"), "ra-eth1")).unwrap();
        let rendered = table.render_kernel_table();
        let line = rendered.lines().nth(2).unwrap();
        assert!(line.starts_with("10.100.0.0"));
        assert!(line.contains("10.0.50.2"));
        assert!(line.contains("255.255.255.0"));
        assert!(line.contains("UG"));
        assert!(line.ends_with("ra-eth1"));
    }
}
