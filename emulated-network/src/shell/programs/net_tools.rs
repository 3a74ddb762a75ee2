//! `ip` (iproute2) and the legacy net-tools: `route`, `arp` and `ifconfig`

use crate::network::ip::Ipv4Cidr;
use crate::network::node::{InterfaceInfo, Node};
use crate::network::route::{Route, RouteDestination, RouteError};
use crate::shell::io::Io;
use crate::shell::programs::{Invocation, ProgramFuture};
use futures::FutureExt;
use std::net::Ipv4Addr;

const LOOPBACK_MTU: u32 = 65536;
const ETHERNET_MTU: u32 = 1500;
/// Exit status of iproute2 when the kernel rejects a request
const RTNETLINK_FAILURE: i32 = 2;
const NET_TOOLS_FAILURE: i32 = 7;

fn is_abbreviation(word: &str, full: &str) -> bool {
    !word.is_empty() && full.starts_with(word)
}

pub fn ip(invocation: Invocation) -> ProgramFuture {
    let status = run_ip(&invocation.node, &invocation.args[1..], &invocation.io);
    async move { status }.boxed()
}

fn run_ip(node: &Node, args: &[String], io: &Io) -> i32 {
    // Options such as `-4` or `-br` don't change what we print
    let args: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .skip_while(|a| a.starts_with('-'))
        .collect();

    let Some((&object, rest)) = args.split_first() else {
        io.errln("Usage: ip [ OPTIONS ] OBJECT { COMMAND | help }");
        io.errln("where  OBJECT := { address | link | neighbour | route }");
        return 255;
    };

    if is_abbreviation(object, "route") {
        ip_route(node, rest, io)
    } else if is_abbreviation(object, "address") {
        ip_addr(node, rest, io)
    } else if is_abbreviation(object, "link") {
        ip_link(node, rest, io)
    } else if is_abbreviation(object, "neighbour") || object == "neighbor" {
        ip_neigh(node, io);
        0
    } else {
        io.errln(&format!("Object \"{object}\" is unknown, try \"ip help\"."));
        1
    }
}

/// Default route first, then by network address
fn sorted_routes(node: &Node) -> Vec<Route> {
    let mut routes = node.routes();
    routes.sort_by_key(|r| {
        (
            !r.is_default(),
            r.destination.network().address(),
            r.destination.network_prefix(),
        )
    });
    routes
}

fn ip_route(node: &Node, args: &[&str], io: &Io) -> i32 {
    let Some((&command, rest)) = args.split_first() else {
        for route in sorted_routes(node) {
            io.outln(&route.to_string());
        }
        return 0;
    };

    if is_abbreviation(command, "show") || is_abbreviation(command, "list") {
        for route in sorted_routes(node) {
            io.outln(&route.to_string());
        }
        return 0;
    }

    let add = is_abbreviation(command, "add");
    if !add && !is_abbreviation(command, "delete") {
        io.errln(&format!(
            "Command \"{command}\" is unknown, try \"ip route help\"."
        ));
        return 255;
    }

    let request = match parse_ip_route(rest) {
        Ok(request) => request,
        Err(message) => {
            io.errln(&message);
            return 1;
        }
    };

    let result = if add {
        node.add_route(request.destination, request.gateway, request.device)
    } else {
        node.remove_route(request.destination).map(|_| ())
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            io.errln(&e.to_string());
            RTNETLINK_FAILURE
        }
    }
}

#[derive(Debug, PartialEq)]
struct RouteRequest<'a> {
    destination: Ipv4Cidr,
    gateway: Option<Ipv4Addr>,
    device: Option<&'a str>,
}

fn parse_ip_route<'a>(args: &[&'a str]) -> Result<RouteRequest<'a>, String> {
    let mut destination = None;
    let mut gateway = None;
    let mut device = None;

    let mut args = args.iter();
    while let Some(&arg) = args.next() {
        match arg {
            "via" => {
                let value = args.next().ok_or("Error: argument \"via\" is wrong: no gateway")?;
                gateway = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Error: inet address is expected rather than \"{value}\"."))?,
                );
            }
            "dev" => {
                device = Some(*args.next().ok_or("Error: argument \"dev\" is wrong: no device")?);
            }
            "to" => {}
            _ if destination.is_none() => {
                let parsed: RouteDestination = arg
                    .parse()
                    .map_err(|_| format!("Error: any valid prefix is expected rather than \"{arg}\"."))?;
                destination = Some(parsed.0);
            }
            _ => {
                return Err(format!(
                    "Error: either \"to\" is duplicate, or \"{arg}\" is a garbage."
                ));
            }
        }
    }

    Ok(RouteRequest {
        destination: destination.ok_or("Error: no destination given")?,
        gateway,
        device,
    })
}

fn link_flags(up: bool) -> &'static str {
    if up {
        "<BROADCAST,MULTICAST,UP,LOWER_UP>"
    } else {
        "<BROADCAST,MULTICAST>"
    }
}

fn print_link(io: &Io, index: usize, interface: &InterfaceInfo) {
    io.outln(&format!(
        "{index}: {}: {} mtu {ETHERNET_MTU} qdisc htb state {} group default qlen 1000",
        interface.name,
        link_flags(interface.up),
        if interface.up { "UP" } else { "DOWN" }
    ));
    io.outln(&format!(
        "    link/ether {} brd ff:ff:ff:ff:ff:ff",
        interface.mac
    ));
}

fn print_loopback_link(io: &Io) {
    io.outln(&format!(
        "1: lo: <LOOPBACK,UP,LOWER_UP> mtu {LOOPBACK_MTU} qdisc noqueue state UNKNOWN group default qlen 1000"
    ));
    io.outln("    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00");
}

/// Interfaces matching an optional `[dev] NAME` filter, numbered the way the kernel would
fn selected_interfaces(
    node: &Node,
    args: &[&str],
    io: &Io,
) -> Result<(bool, Vec<(usize, InterfaceInfo)>), i32> {
    let args: Vec<&str> = args
        .iter()
        .copied()
        .filter(|a| !is_abbreviation(a, "show") && *a != "dev")
        .collect();

    let interfaces = node.interfaces().into_iter().enumerate().map(|(i, intf)| (i + 2, intf));
    match args.first() {
        None => Ok((true, interfaces.collect())),
        Some(&"lo") => Ok((true, Vec::new())),
        Some(name) => {
            let selected: Vec<_> = interfaces.filter(|(_, i)| &*i.name == *name).collect();
            if selected.is_empty() {
                io.errln(&format!("Device \"{name}\" does not exist."));
                return Err(1);
            }
            Ok((false, selected))
        }
    }
}

fn ip_addr(node: &Node, args: &[&str], io: &Io) -> i32 {
    let (loopback, interfaces) = match selected_interfaces(node, args, io) {
        Ok(selection) => selection,
        Err(status) => return status,
    };

    if loopback {
        print_loopback_link(io);
        io.outln("    inet 127.0.0.1/8 scope host lo");
        io.outln("       valid_lft forever preferred_lft forever");
    }

    for (index, interface) in interfaces {
        print_link(io, index, &interface);
        if let Some(address) = interface.address {
            io.outln(&format!(
                "    inet {address} brd {} scope global {}",
                address.broadcast(),
                interface.name
            ));
            io.outln("       valid_lft forever preferred_lft forever");
        }
    }

    0
}

fn ip_link(node: &Node, args: &[&str], io: &Io) -> i32 {
    if args.first() != Some(&"set") {
        let (loopback, interfaces) = match selected_interfaces(node, args, io) {
            Ok(selection) => selection,
            Err(status) => return status,
        };
        if loopback {
            print_loopback_link(io);
        }
        for (index, interface) in interfaces {
            print_link(io, index, &interface);
        }
        return 0;
    }

    let args: Vec<&str> = args[1..].iter().copied().filter(|a| *a != "dev").collect();
    let (name, up) = match args.as_slice() {
        [name, "up"] => (*name, true),
        [name, "down"] => (*name, false),
        _ => {
            io.errln("Usage: ip link set DEVICE { up | down }");
            return 255;
        }
    };

    match node.set_interface_up(name, up) {
        Ok(()) => 0,
        Err(e) => {
            io.errln(&e.to_string());
            1
        }
    }
}

fn ip_neigh(node: &Node, io: &Io) {
    let mut neighbors = node.neighbors();
    neighbors.sort_by_key(|n| n.address);
    for neighbor in neighbors {
        match neighbor.mac {
            Some(mac) => io.outln(&format!(
                "{} dev {} lladdr {mac} REACHABLE",
                neighbor.address, neighbor.interface
            )),
            None => io.outln(&format!(
                "{} dev {}  INCOMPLETE",
                neighbor.address, neighbor.interface
            )),
        }
    }
}

pub fn route(invocation: Invocation) -> ProgramFuture {
    let node = &invocation.node;
    let io = &invocation.io;
    let args: Vec<&str> = invocation.args[1..]
        .iter()
        .map(String::as_str)
        .filter(|a| !matches!(*a, "-n" | "-e" | "-ee"))
        .collect();

    let status = match args.split_first() {
        None => {
            io.out(&node.kernel_routing_table());
            0
        }
        Some((&command, rest)) if command == "add" || command == "del" => match parse_net_tools_route(rest) {
            Ok(request) => {
                let (result, operation) = if command == "add" {
                    (
                        node.add_route(request.destination, request.gateway, request.device),
                        "SIOCADDRT",
                    )
                } else {
                    (
                        node.remove_route(request.destination).map(|_| ()),
                        "SIOCDELRT",
                    )
                };

                match result {
                    Ok(()) => 0,
                    Err(e) => {
                        io.errln(&format!("{operation}: {}", net_tools_error(&e)));
                        NET_TOOLS_FAILURE
                    }
                }
            }
            Err(message) => {
                io.errln(&message);
                io.errln("Usage: route [-n] {add|del} [-net|-host] target [netmask Nm] [gw Gw] [[dev] If]");
                4
            }
        },
        Some((command, _)) => {
            io.errln(&format!("route: invalid command `{command}'"));
            4
        }
    };

    async move { status }.boxed()
}

fn net_tools_error(error: &RouteError) -> &'static str {
    match error {
        RouteError::AlreadyExists => "File exists",
        RouteError::NotFound => "No such process",
        RouteError::UnreachableGateway | RouteError::MissingNexthop => "Network is unreachable",
        RouteError::UnknownDevice(_) => "No such device",
    }
}

/// `route add -net 10.0.1.0 netmask 255.255.255.0 gw 10.0.0.1 dev h1-eth0` and friends
fn parse_net_tools_route<'a>(args: &[&'a str]) -> Result<RouteRequest<'a>, String> {
    let mut target: Option<&str> = None;
    let mut host = false;
    let mut netmask = None;
    let mut gateway = None;
    let mut device = None;

    let mut args = args.iter();
    while let Some(&arg) = args.next() {
        match arg {
            "-net" => host = false,
            "-host" => host = true,
            "netmask" => {
                let value = args.next().ok_or("route: netmask requires an argument")?;
                netmask = Some(parse_netmask(value).ok_or_else(|| format!("route: bogus netmask {value}"))?);
            }
            "gw" => {
                let value = args.next().ok_or("route: gw requires an argument")?;
                gateway = Some(
                    value
                        .parse()
                        .map_err(|_| format!("{value}: Unknown host"))?,
                );
            }
            "dev" => device = Some(*args.next().ok_or("route: dev requires an argument")?),
            "metric" | "mss" | "window" => {
                args.next();
            }
            _ if target.is_none() => target = Some(arg),
            _ if device.is_none() => device = Some(arg),
            _ => return Err(format!("route: unexpected argument {arg}")),
        }
    }

    let target = target.ok_or("route: no target given")?;
    let destination = if target == "default" {
        Ipv4Cidr::any()
    } else {
        let mut cidr: Ipv4Cidr = target
            .parse()
            .map_err(|_| format!("{target}: Unknown host"))?;
        if !target.contains('/') && !host {
            cidr.network_prefix = netmask.unwrap_or(32);
        }
        cidr.network()
    };

    Ok(RouteRequest {
        destination,
        gateway,
        device,
    })
}

/// Prefix length of a contiguous netmask such as `255.255.255.0`
fn parse_netmask(s: &str) -> Option<u8> {
    let bits = s.parse::<Ipv4Addr>().ok()?.to_bits();
    (bits.leading_ones() + bits.trailing_zeros() == 32).then_some(bits.leading_ones() as u8)
}

pub fn arp(invocation: Invocation) -> ProgramFuture {
    let io = &invocation.io;
    let bsd_style = invocation.args[1..].iter().any(|a| a == "-a");

    let mut neighbors = invocation.node.neighbors();
    neighbors.sort_by_key(|n| n.address);

    if bsd_style {
        for neighbor in &neighbors {
            match neighbor.mac {
                Some(mac) => io.outln(&format!(
                    "? ({}) at {mac} [ether] on {}",
                    neighbor.address, neighbor.interface
                )),
                None => io.outln(&format!(
                    "? ({}) at <incomplete> on {}",
                    neighbor.address, neighbor.interface
                )),
            }
        }
    } else if !neighbors.is_empty() {
        io.outln(&format!(
            "{:<25}{:<8}{:<20}{:<6}{:<16}{}",
            "Address", "HWtype", "HWaddress", "Flags", "Mask", "Iface"
        ));
        for neighbor in &neighbors {
            let (hw_type, hw_address, flags) = match neighbor.mac {
                Some(mac) => ("ether", mac.to_string(), "C"),
                None => ("", "(incomplete)".to_string(), ""),
            };
            io.outln(&format!(
                "{:<25}{:<8}{:<20}{:<6}{:<16}{}",
                neighbor.address.to_string(),
                hw_type,
                hw_address,
                flags,
                "",
                neighbor.interface
            ));
        }
    }

    async { 0 }.boxed()
}

pub fn ifconfig(invocation: Invocation) -> ProgramFuture {
    let status = run_ifconfig(&invocation.node, &invocation.args[1..], &invocation.io);
    async move { status }.boxed()
}

fn run_ifconfig(node: &Node, args: &[String], io: &Io) -> i32 {
    let all = args.iter().any(|a| a == "-a");
    let args: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| !a.starts_with('-'))
        .collect();

    match args.as_slice() {
        [] => {
            for interface in node.interfaces().iter().filter(|i| all || i.up) {
                print_ifconfig(io, interface);
            }
            print_ifconfig_loopback(io);
            0
        }
        ["lo"] => {
            print_ifconfig_loopback(io);
            0
        }
        [name] => match node.interfaces().iter().find(|i| &*i.name == *name) {
            Some(interface) => {
                print_ifconfig(io, interface);
                0
            }
            None => {
                io.errln(&format!(
                    "{name}: error fetching interface information: Device not found"
                ));
                1
            }
        },
        [name, state @ ("up" | "down")] => match node.set_interface_up(name, *state == "up") {
            Ok(()) => 0,
            Err(_) => {
                io.errln("SIOCSIFFLAGS: No such device");
                1
            }
        },
        _ => {
            io.errln("ifconfig: only `ifconfig [-a] [interface [up|down]]` is supported");
            1
        }
    }
}

/// Byte counts the way net-tools prints them next to the raw number
fn human_bytes(bytes: usize) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < units.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    format!("{value:.1} {}", units[unit])
}

fn print_ifconfig(io: &Io, interface: &InterfaceInfo) {
    if interface.up {
        io.outln(&format!(
            "{}: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu {ETHERNET_MTU}",
            interface.name
        ));
    } else {
        io.outln(&format!(
            "{}: flags=4098<BROADCAST,MULTICAST>  mtu {ETHERNET_MTU}",
            interface.name
        ));
    }

    if let Some(address) = interface.address {
        io.outln(&format!(
            "        inet {}  netmask {}  broadcast {}",
            address.address(),
            Ipv4Addr::from_bits(address.mask()),
            address.broadcast()
        ));
    }

    io.outln(&format!(
        "        ether {}  txqueuelen 1000  (Ethernet)",
        interface.mac
    ));
    io.outln(&format!(
        "        RX packets {}  bytes {} ({})",
        interface.rx.packets,
        interface.rx.bytes,
        human_bytes(interface.rx.bytes)
    ));
    io.outln("        RX errors 0  dropped 0  overruns 0  frame 0");
    io.outln(&format!(
        "        TX packets {}  bytes {} ({})",
        interface.tx.packets,
        interface.tx.bytes,
        human_bytes(interface.tx.bytes)
    ));
    io.outln("        TX errors 0  dropped 0 overruns 0  carrier 0  collisions 0");
    io.outln("");
}

fn print_ifconfig_loopback(io: &Io) {
    io.outln(&format!("lo: flags=73<UP,LOOPBACK,RUNNING>  mtu {LOOPBACK_MTU}"));
    io.outln("        inet 127.0.0.1  netmask 255.0.0.0");
    io.outln("        loop  txqueuelen 1000  (Local Loopback)");
    io.outln("        RX packets 0  bytes 0 (0.0 B)");
    io.outln("        RX errors 0  dropped 0  overruns 0  frame 0");
    io.outln("        TX packets 0  bytes 0 (0.0 B)");
    io.outln("        TX errors 0  dropped 0 overruns 0  carrier 0  collisions 0");
    io.outln("");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::spec::{InterfaceSpec, NodeKind, NodeSpec};
    use crate::network::test_context;
    use crate::shell::programs::run_line;
    use pnet_base::MacAddr;
    use std::sync::Arc;

    fn host() -> Arc<Node> {
        let spec = NodeSpec {
            name: "h1".to_string(),
            kind: NodeKind::Host,
            interfaces: vec![InterfaceSpec {
                name: "h1-eth0".to_string(),
                mac: MacAddr::new(0, 0, 0, 0, 0, 1),
                address: Some("10.0.0.1/24".parse().unwrap()),
            }],
            routes: Vec::new(),
        };
        Node::new(&spec, &test_context()).unwrap()
    }

    #[test]
    fn test_parse_ip_route() {
        let request = parse_ip_route(&["10.0.1.0/24", "via", "10.0.0.2", "dev", "h1-eth0"]).unwrap();
        assert_eq!(
            request,
            RouteRequest {
                destination: "10.0.1.0/24".parse().unwrap(),
                gateway: Some("10.0.0.2".parse().unwrap()),
                device: Some("h1-eth0"),
            }
        );

        let request = parse_ip_route(&["default", "via", "10.0.0.254"]).unwrap();
        assert_eq!(request.destination, Ipv4Cidr::any());
        assert!(parse_ip_route(&["10.0.1.0/24", "via"]).is_err());
        assert!(parse_ip_route(&["banana"]).is_err());
    }

    #[test]
    fn test_parse_net_tools_route() {
        let request = parse_net_tools_route(&[
            "-net", "10.0.1.0", "netmask", "255.255.255.0", "gw", "10.0.0.2",
        ])
        .unwrap();
        assert_eq!(request.destination, "10.0.1.0/24".parse().unwrap());
        assert_eq!(request.gateway, Some("10.0.0.2".parse().unwrap()));

        let request = parse_net_tools_route(&["-host", "10.0.1.7", "gw", "10.0.0.2"]).unwrap();
        assert_eq!(request.destination, "10.0.1.7/32".parse().unwrap());

        let request = parse_net_tools_route(&["default", "gw", "10.0.0.254", "h1-eth0"]).unwrap();
        assert_eq!(request.destination, Ipv4Cidr::any());
        assert_eq!(request.device, Some("h1-eth0"));

        assert!(parse_net_tools_route(&["-net", "10.0.1.0", "netmask", "255.0.255.0"]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_route_add_and_show() {
        let node = host();
        assert_eq!(run_line(&node, "ip route add 10.0.2.0/24 via 10.0.0.2").await.0, 0);
        assert_eq!(run_line(&node, "ip route add default via 10.0.0.254").await.0, 0);

        let (status, output) = run_line(&node, "ip route").await;
        assert_eq!(status, 0);
        assert_eq!(
            output,
            "default via 10.0.0.254 dev h1-eth0\n\
             10.0.0.0/24 dev h1-eth0 proto kernel scope link src 10.0.0.1\n\
             10.0.2.0/24 via 10.0.0.2 dev h1-eth0\n"
        );

        let (status, output) = run_line(&node, "ip route add 10.0.2.0/24 via 10.0.0.3").await;
        assert_eq!(status, RTNETLINK_FAILURE);
        assert_eq!(output, "RTNETLINK answers: File exists\n");

        let (status, output) = run_line(&node, "ip route add 10.0.3.0/24 via 192.168.0.1").await;
        assert_eq!(status, RTNETLINK_FAILURE);
        assert_eq!(output, "Error: Nexthop has invalid gateway.\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_n() {
        let node = host();
        let (status, _) =
            run_line(&node, "route add -net 10.0.5.0 netmask 255.255.255.0 gw 10.0.0.2").await;
        assert_eq!(status, 0);

        let (_, output) = run_line(&node, "route -n").await;
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines[0], "Kernel IP routing table");
        assert!(lines[1].starts_with("Destination     Gateway         Genmask"));
        assert!(lines.iter().any(|l| l.starts_with("10.0.5.0        10.0.0.2        255.255.255.0   UG")));

        let (status, output) = run_line(&node, "route del -net 10.0.9.0 netmask 255.255.255.0").await;
        assert_eq!(status, NET_TOOLS_FAILURE);
        assert_eq!(output, "SIOCDELRT: No such process\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_down_and_up() {
        let node = host();
        assert_eq!(run_line(&node, "ip link set h1-eth0 down").await.0, 0);
        let (_, output) = run_line(&node, "ip addr show h1-eth0").await;
        assert!(output.starts_with("2: h1-eth0: <BROADCAST,MULTICAST> mtu 1500 qdisc htb state DOWN"));

        assert_eq!(run_line(&node, "ifconfig h1-eth0 up").await.0, 0);
        let (_, output) = run_line(&node, "ifconfig h1-eth0").await;
        assert!(output.starts_with("h1-eth0: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 1500"));
        assert!(output.contains("inet 10.0.0.1  netmask 255.255.255.0  broadcast 10.0.0.255"));

        let (status, output) = run_line(&node, "ip link set h1-eth9 up").await;
        assert_eq!(status, 1);
        assert_eq!(output, "Cannot find device \"h1-eth9\"\n");
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0.0 B");
        assert_eq!(human_bytes(1234), "1.2 KB");
        assert_eq!(human_bytes(5_600_000), "5.6 MB");
    }
}
