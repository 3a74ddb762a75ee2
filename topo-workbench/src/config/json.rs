use anyhow::Context;
use emulated_network::network::event::{NetworkEvent, NetworkEventPayload, UpdateLinkStatus};
use emulated_network::network::ip::Ipv4Cidr;
use emulated_network::network::route::RouteDestination;
use emulated_network::network::spec::{LinkClass, LinkShaping, RouteSpec, parse_delay, parse_mac};
use emulated_network::network::topology::{
    DefaultRoute, HostOptions, LinkOptions, Topology, TopologyConfig,
};
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::net::Ipv4Addr;
use std::time::Duration;

/// The topology file given to `--config`
#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TopologyJson {
    /// Pool for the automatic addresses of hosts and routers (defaults to `10.0.0.0/8`)
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub ip_base: Option<Ipv4Cidr>,
    /// `tc` (default) or `plain`
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub link_class: Option<LinkClass>,
    nodes: Vec<NodeJson>,
    #[serde(default)]
    links: Vec<LinkJson>,
    #[serde(default)]
    routes: Vec<RouteJson>,
    #[serde(default)]
    events: Vec<EventJson>,
}

#[derive(Deserialize, Clone, Copy, Debug, Default)]
#[serde(rename_all = "camelCase")]
enum NodeKindJson {
    #[default]
    Host,
    Router,
    Switch,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct NodeJson {
    name: String,
    #[serde(rename = "type", default)]
    kind: NodeKindJson,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    ip: Option<Ipv4Cidr>,
    /// `via <gateway>`, a bare gateway address or `dev <interface>`
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    default_route: Option<DefaultRoute>,
    #[serde(default)]
    mac: Option<String>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct LinkJson {
    node1: String,
    node2: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    intf_name1: Option<String>,
    #[serde(default)]
    intf_name2: Option<String>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    ip1: Option<Ipv4Cidr>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    ip2: Option<Ipv4Cidr>,
    /// Bandwidth in Mbit/s
    #[serde(default)]
    bw: Option<f64>,
    /// `tc`-style delay (`"5ms"`; bare numbers are microseconds)
    #[serde(default)]
    delay: Option<String>,
    #[serde(default)]
    jitter: Option<String>,
    /// Loss percentage (0 to 100)
    #[serde(default)]
    loss: Option<f64>,
    #[serde(default)]
    max_queue_size: Option<usize>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct RouteJson {
    node: String,
    /// A network in CIDR notation or `default`
    #[serde_as(as = "DisplayFromStr")]
    destination: RouteDestination,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    gateway: Option<Ipv4Addr>,
    #[serde(default)]
    interface: Option<String>,
}

#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
enum LinkStatusJson {
    Up,
    Down,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct EventJson {
    /// Time since the network started (`"2s"`, `"500ms"`)
    at: String,
    link: String,
    #[serde(default)]
    status: Option<LinkStatusJson>,
    #[serde(default)]
    bw: Option<f64>,
    #[serde(default)]
    delay: Option<String>,
    #[serde(default)]
    jitter: Option<String>,
    #[serde(default)]
    loss: Option<f64>,
    #[serde(default)]
    max_queue_size: Option<usize>,
}

fn optional_delay(delay: Option<&str>) -> anyhow::Result<Option<Duration>> {
    delay.map(parse_delay).transpose()
}

impl TopologyJson {
    pub fn topology_config(&self) -> TopologyConfig {
        match self.ip_base {
            Some(ip_base) => TopologyConfig { ip_base },
            None => TopologyConfig::default(),
        }
    }

    /// Declares the nodes, links and routes of the file in a [`Topology`]
    pub fn topology(&self) -> anyhow::Result<Topology> {
        let mut topo = Topology::new();
        for node in &self.nodes {
            let options = HostOptions {
                ip: node.ip,
                default_route: node.default_route.clone(),
                mac: node
                    .mac
                    .as_deref()
                    .map(parse_mac)
                    .transpose()
                    .with_context(|| format!("invalid mac for node `{}`", node.name))?,
            };

            match node.kind {
                NodeKindJson::Host => topo.add_host(&node.name, options)?,
                NodeKindJson::Router => topo.add_router(&node.name, options)?,
                NodeKindJson::Switch => topo.add_switch(&node.name)?,
            }
        }

        for link in &self.links {
            let default = LinkShaping::default();
            let shaping = LinkShaping {
                bandwidth_mbps: link.bw,
                delay: optional_delay(link.delay.as_deref())?.unwrap_or(default.delay),
                jitter: optional_delay(link.jitter.as_deref())?.unwrap_or(default.jitter),
                loss_percent: link.loss.unwrap_or(default.loss_percent),
                max_queue_size: link.max_queue_size.unwrap_or(default.max_queue_size),
            };

            let options = LinkOptions {
                id: link.id.clone(),
                intf_name1: link.intf_name1.clone(),
                intf_name2: link.intf_name2.clone(),
                ip1: link.ip1,
                ip2: link.ip2,
                shaping,
            };
            topo.add_link(&link.node1, &link.node2, options)
                .with_context(|| format!("invalid link {} <-> {}", link.node1, link.node2))?;
        }

        for route in &self.routes {
            topo.add_route(
                &route.node,
                RouteSpec {
                    destination: route.destination.0,
                    gateway: route.gateway,
                    interface: route.interface.clone(),
                },
            )?;
        }

        Ok(topo)
    }

    pub fn events(&self) -> anyhow::Result<Vec<NetworkEvent>> {
        self.events
            .iter()
            .map(|event| {
                let relative_time = humantime::parse_duration(&event.at)
                    .with_context(|| format!("invalid event time `{}`", event.at))?;
                Ok(NetworkEvent {
                    relative_time,
                    payload: NetworkEventPayload {
                        link_id: event.link.clone(),
                        status: event.status.map(|s| match s {
                            LinkStatusJson::Up => UpdateLinkStatus::Up,
                            LinkStatusJson::Down => UpdateLinkStatus::Down,
                        }),
                        bandwidth_mbps: event.bw,
                        delay: optional_delay(event.delay.as_deref())?,
                        jitter: optional_delay(event.jitter.as_deref())?,
                        loss_percent: event.loss,
                        max_queue_size: event.max_queue_size,
                    },
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DUMBBELL: &str = r#"{
        "nodes": [
            { "name": "h1" },
            { "name": "h2", "ip": "10.0.0.20/24", "default_route": "via 10.0.0.254" },
            { "name": "r1", "type": "router" },
            { "name": "s1", "type": "switch" }
        ],
        "links": [
            { "node1": "h1", "node2": "s1", "bw": 10, "delay": "5ms", "loss": 1 },
            { "node1": "h2", "node2": "s1" },
            { "node1": "r1", "node2": "s1", "id": "uplink", "delay": "1500" }
        ],
        "routes": [
            { "node": "h1", "destination": "default", "gateway": "10.0.0.3" }
        ],
        "events": [
            { "at": "2s", "link": "uplink", "status": "down" },
            { "at": "4s", "link": "uplink", "status": "up", "delay": "10ms" }
        ]
    }"#;

    #[test]
    fn test_parse_and_build() {
        let json: TopologyJson = serde_json::from_str(DUMBBELL).unwrap();
        let spec = json
            .topology()
            .unwrap()
            .build(&json.topology_config())
            .unwrap();

        let h2 = spec.node("h2").unwrap();
        assert_eq!(h2.interfaces[0].address, Some("10.0.0.20/24".parse().unwrap()));
        assert_eq!(h2.routes.len(), 1);
        assert_eq!(spec.node("h1").unwrap().routes[0].destination, Ipv4Cidr::any());

        let h1_link = spec.links.iter().find(|l| l.touches("h1")).unwrap();
        assert_eq!(h1_link.shaping.bandwidth_mbps, Some(10.0));
        assert_eq!(h1_link.shaping.delay, Duration::from_millis(5));
        assert_eq!(h1_link.shaping.loss_percent, 1.0);

        let uplink = spec.links.iter().find(|l| l.id == "uplink").unwrap();
        assert_eq!(uplink.shaping.delay, Duration::from_micros(1500));

        let events = json.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].relative_time, Duration::from_secs(4));
        assert_eq!(events[1].payload.status, Some(UpdateLinkStatus::Up));
        assert_eq!(events[1].payload.delay, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_rejects_bad_input() {
        let unknown_field = r#"{ "nodes": [ { "name": "h1", "colour": "red" } ] }"#;
        assert!(serde_json::from_str::<TopologyJson>(unknown_field).is_err());

        let bad_ip = r#"{ "nodes": [ { "name": "h1", "ip": "10.0.0.300/24" } ] }"#;
        assert!(serde_json::from_str::<TopologyJson>(bad_ip).is_err());

        let unknown_node = r#"{
            "nodes": [ { "name": "h1" } ],
            "links": [ { "node1": "h1", "node2": "h9" } ]
        }"#;
        let json: TopologyJson = serde_json::from_str(unknown_node).unwrap();
        let error = json.topology().err().unwrap();
        assert_eq!(format!("{error:#}"), "invalid link h1 <-> h9: unknown node `h9`");
    }
}
