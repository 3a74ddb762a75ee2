//! In-memory network emulation
//!
//! A [`Network`] instantiates a resolved [`NetworkSpec`]: every host, router and switch becomes a
//! [`Node`] with its own IP stack, and every link becomes a pair of shaped directions driven by
//! their own tasks. All randomness comes from a single seeded RNG, and time is tokio's (usually
//! paused) clock, so runs are reproducible.

pub mod arp;
pub mod event;
pub mod frame;
mod inbound_queue;
pub mod ip;
pub mod link;
pub mod node;
pub mod route;
pub mod spec;
pub mod switch;
pub mod sysctl;
pub mod topology;

use crate::network::event::{NetworkEvent, NetworkEvents, UpdateLinkStatus};
use crate::network::frame::IcmpKind;
use crate::network::link::{LinkEnd, LinkStatus, NetworkLink};
use crate::network::node::Node;
use crate::network::spec::{LinkClass, NetworkSpec, NodeKind};
use crate::shell::Shell;
use crate::shell::programs::iperf;
use crate::trace::stats::NetworkStats;
use crate::trace::tracer::PacketTracer;
use crate::transport::icmp::IcmpSocket;
use crate::transport::tcp::congestion::CongestionAlgorithm;
use crate::util::natural_cmp;
use anyhow::{Context, anyhow, bail};
use fastrand::Rng;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long `pingall` waits for each reply (`ping -c1 -W1`)
const PING_ALL_TIMEOUT: Duration = Duration::from_secs(1);
const IPERF_PORT: u16 = 5001;

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub link_class: LinkClass,
    pub rng_seed: u64,
    pub default_congestion: CongestionAlgorithm,
    /// Directory where programs read and write their files
    pub workdir: PathBuf,
    /// Whether to keep every frame step in memory for the replay log
    pub record_steps: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            link_class: LinkClass::Tc,
            rng_seed: 42,
            default_congestion: CongestionAlgorithm::Cubic,
            workdir: PathBuf::from("."),
            record_steps: false,
        }
    }
}

/// State shared by every node and link of a network
pub(crate) struct NetworkContext {
    pub(crate) rng: Mutex<Rng>,
    pub(crate) tracer: Arc<PacketTracer>,
    pub(crate) start: Instant,
    started: AtomicBool,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) default_congestion: CongestionAlgorithm,
}

impl NetworkContext {
    fn new(config: &NetworkConfig) -> Self {
        let start = Instant::now();
        Self {
            rng: Mutex::new(Rng::with_seed(config.rng_seed)),
            tracer: Arc::new(PacketTracer::new(start, config.record_steps)),
            start,
            started: AtomicBool::new(false),
            cancellation_token: CancellationToken::new(),
            default_congestion: config.default_congestion,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Frame ids come from the seeded RNG, so they are stable across runs
    pub(crate) fn new_frame_id(&self) -> Uuid {
        Uuid::from_u128(self.rng.lock().u128(..))
    }
}

pub struct Network {
    ctx: Arc<NetworkContext>,
    spec: NetworkSpec,
    nodes: Vec<Arc<Node>>,
    links: Vec<Arc<NetworkLink>>,
    shells: HashMap<Arc<str>, Arc<Shell>>,
    events: Mutex<Option<NetworkEvents>>,
}

impl Network {
    /// Creates the nodes and links of the network and starts the link tasks
    ///
    /// Switches only forward and routers only route once [`Network::start`] is called.
    pub fn initialize(
        spec: NetworkSpec,
        events: NetworkEvents,
        config: NetworkConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let ctx = Arc::new(NetworkContext::new(&config));

        let mut nodes = Vec::with_capacity(spec.nodes.len());
        for node_spec in &spec.nodes {
            nodes.push(Node::new(node_spec, &ctx)?);
        }

        let find_node = |name: &str| {
            nodes
                .iter()
                .find(|n| &**n.name() == name)
                .ok_or_else(|| anyhow!("link references unknown node `{name}`"))
        };

        let mut links = Vec::with_capacity(spec.links.len());
        for link_spec in &spec.links {
            let shaping_events = events
                .sorted_events
                .iter()
                .filter(|e| e.payload.changes_shaping() && e.payload.link_id == link_spec.id);
            for event in shaping_events {
                let mut shaping = link_spec.shaping.clone();
                event.payload.apply_to(&mut shaping);
                shaping.validate().map_err(|reason| {
                    anyhow!("event for link `{}` has invalid shaping: {reason}", link_spec.id)
                })?;
            }

            let mut ends = Vec::with_capacity(2);
            for endpoint in &link_spec.endpoints {
                let node = find_node(&endpoint.node)?;
                let port = node.port_of(&endpoint.interface).with_context(|| {
                    format!(
                        "link `{}` references unknown interface `{}`",
                        link_spec.id, endpoint.interface
                    )
                })?;
                ends.push(LinkEnd {
                    node: Arc::downgrade(node),
                    node_name: node.name().clone(),
                    port,
                    taps: node
                        .port_taps(port)
                        .context("interface disappeared while building links")?,
                });
            }

            let ends: [LinkEnd; 2] = ends
                .try_into()
                .map_err(|_| anyhow!("link `{}` must have two endpoints", link_spec.id))?;
            let initial_status = events
                .initial_link_statuses
                .get(&link_spec.id)
                .copied()
                .unwrap_or(LinkStatus::Up);

            let ports = [ends[0].port, ends[1].port];
            let link = Arc::new(NetworkLink::new(
                link_spec,
                config.link_class,
                &ctx,
                ends,
                initial_status,
            ));

            for (i, endpoint) in link_spec.endpoints.iter().enumerate() {
                find_node(&endpoint.node)?.attach_link(ports[i], link.directions[i].clone());
            }

            link.spawn_tasks(&ctx.cancellation_token);
            links.push(link);
        }

        for event in &events.sorted_events {
            if !links.iter().any(|l| *l.id == event.payload.link_id) {
                bail!("event references unknown link `{}`", event.payload.link_id);
            }
        }

        let hosts: Arc<HashMap<String, Ipv4Addr>> = Arc::new(
            nodes
                .iter()
                .filter_map(|n| Some((n.name().to_string(), n.ip()?)))
                .collect(),
        );
        let shells = nodes
            .iter()
            .map(|n| {
                let shell = Shell::new(n.clone(), config.workdir.clone(), hosts.clone());
                (n.name().clone(), Arc::new(shell))
            })
            .collect();

        tracing::info!(
            nodes = nodes.len(),
            links = links.len(),
            "network initialized"
        );

        Ok(Arc::new(Self {
            ctx,
            spec,
            nodes,
            links,
            shells,
            events: Mutex::new(Some(events)),
        }))
    }

    /// Switches start forwarding, routers enable IP forwarding and scheduled events begin
    pub fn start(&self) {
        if self.ctx.started.swap(true, Ordering::Relaxed) {
            return;
        }

        for node in &self.nodes {
            if node.kind() == NodeKind::Router {
                node.set_ip_forward(true);
            }
        }

        if let Some(events) = self.events.lock().take() {
            if !events.is_empty() {
                tokio::spawn(run_events(
                    events.sorted_events,
                    self.links.clone(),
                    Instant::now(),
                    self.ctx.cancellation_token.clone(),
                ));
            }
        }

        tracing::info!("network started");
    }

    /// Ends every background job (flushing captures), disables forwarding and stops the links
    pub async fn stop(&self) {
        for node in &self.nodes {
            if let Some(shell) = self.shells.get(node.name()) {
                shell.kill_all_jobs().await;
            }
        }

        for node in &self.nodes {
            if node.kind() == NodeKind::Router {
                node.set_ip_forward(false);
            }
        }

        self.ctx.cancellation_token.cancel();
        self.ctx.started.store(false, Ordering::Relaxed);
        tracing::info!("network stopped");
    }

    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    /// Time elapsed since the network was created
    pub fn elapsed(&self) -> Duration {
        self.ctx.start.elapsed()
    }

    pub fn node(self: &Arc<Self>, name: &str) -> anyhow::Result<NodeHandle> {
        let node = self
            .nodes
            .iter()
            .find(|n| &**n.name() == name)
            .with_context(|| format!("unknown node `{name}`"))?;

        Ok(NodeHandle {
            network: self.clone(),
            node: node.clone(),
        })
    }

    /// Every node, in declaration order
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Hosts and routers, sorted by name the way the CLI lists them
    pub fn hosts(&self) -> Vec<Arc<Node>> {
        let mut hosts: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.kind().has_ip_stack())
            .cloned()
            .collect();
        hosts.sort_by(|a, b| natural_cmp(a.name(), b.name()));
        hosts
    }

    pub fn switches(&self) -> Vec<Arc<Node>> {
        let mut switches: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.kind() == NodeKind::Switch)
            .cloned()
            .collect();
        switches.sort_by(|a, b| natural_cmp(a.name(), b.name()));
        switches
    }

    pub fn links(&self) -> &[Arc<NetworkLink>] {
        &self.links
    }

    pub fn link(&self, id: &str) -> Option<&Arc<NetworkLink>> {
        self.links.iter().find(|l| &*l.id == id)
    }

    /// Brings every link between `a` and `b` up or down, like `link a b up|down` does
    pub fn config_link_status(&self, a: &str, b: &str, up: bool) -> anyhow::Result<()> {
        let mut found = false;
        for link in self.links.iter().filter(|l| l.connects(a, b)) {
            found = true;
            link.update_status(if up {
                UpdateLinkStatus::Up
            } else {
                UpdateLinkStatus::Down
            });
        }

        if !found {
            bail!("src and dst not connected: {a} {b}");
        }

        Ok(())
    }

    /// Sets the random loss of every link that does not touch a host
    pub fn set_core_link_loss(&self, loss_percent: f64) {
        for link in &self.links {
            let touches_host = link.endpoints.iter().any(|e| {
                self.spec
                    .node(&e.node)
                    .is_some_and(|n| n.kind == NodeKind::Host)
            });
            if !touches_host {
                link.update_shaping(|shaping| shaping.loss_percent = loss_percent);
            }
        }
    }

    pub fn link_stats(&self) -> NetworkStats {
        self.ctx.tracer.stats()
    }

    pub fn tracer(&self) -> &Arc<PacketTracer> {
        &self.ctx.tracer
    }

    /// Pings every host from every other host, once
    pub async fn ping_all(&self) -> PingAllReport {
        let hosts = self.hosts();
        let mut rows = Vec::with_capacity(hosts.len());
        let mut sent = 0;
        let mut received = 0;

        for source in &hosts {
            let mut results = Vec::with_capacity(hosts.len());
            for target in &hosts {
                if Arc::ptr_eq(source, target) {
                    continue;
                }

                sent += 1;
                let reached = match target.ip() {
                    Some(ip) => ping_once(source, ip).await,
                    None => false,
                };
                if reached {
                    received += 1;
                    results.push(Some(target.name().clone()));
                } else {
                    results.push(None);
                }
            }
            rows.push((source.name().clone(), results));
        }

        PingAllReport {
            rows,
            sent,
            received,
        }
    }

    /// Measures TCP throughput from `client` to `server`, returning the bandwidth reported by
    /// each side (as `net.iperf()` does)
    pub async fn iperf(&self, client: &str, server: &str, duration: Duration) -> anyhow::Result<[String; 2]> {
        let find = |name: &str| {
            self.nodes
                .iter()
                .find(|n| &**n.name() == name)
                .cloned()
                .with_context(|| format!("unknown node `{name}`"))
        };
        let client = find(client)?;
        let server = find(server)?;

        let result = iperf::tcp_test(&client, &server, IPERF_PORT, duration).await?;
        Ok([
            iperf::format_bandwidth(result.server_bits_per_sec),
            iperf::format_bandwidth(result.client_bits_per_sec),
        ])
    }

    pub(crate) fn shell(&self, node: &Node) -> Option<&Arc<Shell>> {
        self.shells.get(node.name())
    }
}

async fn ping_once(source: &Arc<Node>, destination: Ipv4Addr) -> bool {
    let mut socket = IcmpSocket::open(source);
    if socket.send_echo(destination, 1, 56).is_err() {
        return false;
    }

    let deadline = Instant::now() + PING_ALL_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, socket.recv()).await {
            Ok(Some(reply)) if reply.kind == IcmpKind::EchoReply && reply.sequence == 1 => {
                return true;
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return false,
        }
    }
}

async fn run_events(
    events: Vec<NetworkEvent>,
    links: Vec<Arc<NetworkLink>>,
    start: Instant,
    cancellation_token: CancellationToken,
) {
    for event in events {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => return,
            _ = tokio::time::sleep_until(start + event.relative_time) => {}
        }

        let Some(link) = links.iter().find(|l| *l.id == event.payload.link_id) else {
            continue;
        };

        if let Some(status) = event.payload.status {
            tracing::info!(link = %link.id, "link status changed to {status:?}");
            link.update_status(status);
        }

        if event.payload.changes_shaping() {
            link.update_shaping(|shaping| event.payload.apply_to(shaping));
            tracing::info!(link = %link.id, "link shaping changed to {}", link.shaping().describe());
        }
    }
}

/// Result of [`Network::ping_all`], displayed the way the `pingall` command prints it
pub struct PingAllReport {
    /// For each source host, the hosts it reached (`None` for the ones it didn't)
    pub rows: Vec<(Arc<str>, Vec<Option<Arc<str>>>)>,
    pub sent: u64,
    pub received: u64,
}

impl PingAllReport {
    pub fn dropped_percent(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }

        (self.sent - self.received) as f64 * 100.0 / self.sent as f64
    }
}

impl Display for PingAllReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "*** Ping: testing ping reachability")?;
        for (source, results) in &self.rows {
            write!(f, "{source} -> ")?;
            for result in results {
                match result {
                    Some(target) => write!(f, "{target} ")?,
                    None => write!(f, "X ")?,
                }
            }
            writeln!(f)?;
        }

        write!(
            f,
            "*** Results: {}% dropped ({}/{} received)",
            self.dropped_percent() as u64,
            self.received,
            self.sent
        )
    }
}

/// A node of a running network, able to run commands like `node.cmd()` does
#[derive(Clone)]
pub struct NodeHandle {
    network: Arc<Network>,
    node: Arc<Node>,
}

impl NodeHandle {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn name(&self) -> &Arc<str> {
        self.node.name()
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.node.ip()
    }

    /// Runs a command line inside the node and returns its combined output
    ///
    /// Output produced by background jobs since the previous call comes first.
    pub async fn cmd(&self, line: &str) -> String {
        match self.network.shell(&self.node) {
            Some(shell) => shell.execute(line).await,
            None => String::new(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> Arc<NetworkContext> {
    Arc::new(NetworkContext::new(&NetworkConfig::default()))
}
