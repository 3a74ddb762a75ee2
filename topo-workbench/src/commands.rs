//! The interactive command line of the emulator, modelled after the classic `mininet>` prompt

use crate::util::print_link_stats;
use anyhow::{Context, bail};
use emulated_network::Network;
use emulated_network::network::spec::NodeKind;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const PROMPT: &str = "mininet> ";
const IPERF_DURATION: Duration = Duration::from_secs(5);

const HELP: &str = "\
Documented commands:
  help                 show this help
  nodes                list all nodes
  net                  list the connections of every node
  links                list links and their status
  intfs                list the interfaces of every node
  dump                 describe every node
  pingall              ping between all hosts
  pingpair             ping between the first two hosts
  iperf [h1 h2]        measure TCP bandwidth between two hosts
  link n1 n2 up|down   bring the links between two nodes up or down
  stats                show link statistics
  source <file>        run the commands of a file
  exit | quit          leave the command line
  <node> <cmd>         run a shell command inside a node (node names in <cmd> become their IPs)";

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Cli {
    network: Arc<Network>,
    /// Lines queued by `source`, which run before the next input line
    pending: VecDeque<String>,
    /// Print each line before running it (useful when the input is not a terminal)
    echo: bool,
}

impl Cli {
    pub fn new(network: Arc<Network>, echo: bool) -> Self {
        Self {
            network,
            pending: VecDeque::new(),
            echo,
        }
    }

    /// Runs lines until the input is exhausted or `exit` is requested
    pub async fn run(&mut self, mut input: impl Iterator<Item = String>) {
        loop {
            let line = match self.pending.pop_front() {
                Some(line) => line,
                None => match input.next() {
                    Some(line) => line,
                    None => return,
                },
            };

            if self.echo && !line.trim().is_empty() {
                println!("{PROMPT}{line}");
            }

            match self.run_line(&line).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return,
                Err(e) => println!("*** Error: {e:#}"),
            }
        }
    }

    pub async fn run_line(&mut self, line: &str) -> anyhow::Result<Flow> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(Flow::Continue);
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        match command {
            "help" | "?" => println!("{HELP}"),
            "nodes" => self.nodes(),
            "net" => self.net(),
            "links" => self.links(),
            "intfs" => self.intfs(),
            "dump" => self.dump(),
            "pingall" => println!("{}", self.network.ping_all().await),
            "pingpair" => self.pingpair().await?,
            "iperf" => self.iperf(&args).await?,
            "link" => self.link(&args)?,
            "stats" => print_link_stats(&self.network),
            "source" => self.source(rest)?,
            "exit" | "quit" | "EOF" => return Ok(Flow::Exit),
            node if self.network.node(node).is_ok() => self.node_cmd(node, rest).await?,
            _ => println!("*** Unknown command: {line}"),
        }

        Ok(Flow::Continue)
    }

    fn sorted_names(&self) -> Vec<Arc<str>> {
        let mut nodes: Vec<_> = self.network.hosts();
        nodes.extend(self.network.switches());
        nodes.into_iter().map(|n| n.name().clone()).collect()
    }

    fn nodes(&self) {
        println!("available nodes are: ");
        println!("{}", self.sorted_names().join(" "));
    }

    /// For every interface, the interface at the other end of its link
    fn peers(&self) -> HashMap<(String, String), String> {
        let mut peers = HashMap::new();
        for link in self.network.links() {
            let [a, b] = &link.endpoints;
            peers.insert((a.node.clone(), a.interface.clone()), b.interface.clone());
            peers.insert((b.node.clone(), b.interface.clone()), a.interface.clone());
        }
        peers
    }

    fn net(&self) {
        let peers = self.peers();
        for name in self.sorted_names() {
            let Ok(handle) = self.network.node(&name) else {
                continue;
            };

            let mut line = name.to_string();
            if handle.node().kind() == NodeKind::Switch {
                line.push_str(" lo: ");
            }
            for interface in handle.node().interfaces() {
                let key = (name.to_string(), interface.name.to_string());
                let peer = peers.get(&key).map(String::as_str).unwrap_or("");
                line.push_str(&format!(" {}:{peer}", interface.name));
            }
            println!("{line}");
        }
    }

    fn links(&self) {
        for link in self.network.links() {
            let [a, b] = &link.endpoints;
            let status = if link.status().is_up() { "OK" } else { "DOWN" };
            println!("{}<->{} ({status} {status})", a.interface, b.interface);
        }
    }

    fn intfs(&self) {
        for name in self.sorted_names() {
            let Ok(handle) = self.network.node(&name) else {
                continue;
            };

            let mut interfaces: Vec<String> = Vec::new();
            if handle.node().kind() == NodeKind::Switch {
                interfaces.push("lo".to_string());
            }
            interfaces.extend(handle.node().interfaces().iter().map(|i| i.name.to_string()));
            println!("{name}: {}", interfaces.join(","));
        }
    }

    fn dump(&self) {
        for name in self.sorted_names() {
            let Ok(handle) = self.network.node(&name) else {
                continue;
            };

            let node = handle.node();
            let interfaces: Vec<String> = node
                .interfaces()
                .iter()
                .map(|i| match i.address {
                    Some(address) => format!("{}:{}", i.name, address.address()),
                    None => format!("{}:None", i.name),
                })
                .collect();
            println!("<{} {name}: {}>", node.kind(), interfaces.join(","));
        }
    }

    async fn pingpair(&self) -> anyhow::Result<()> {
        let hosts = self.network.hosts();
        let [first, second, ..] = &hosts[..] else {
            bail!("pingpair needs at least two hosts");
        };

        println!("*** Ping: testing ping reachability");
        let mut sent = 0;
        let mut received = 0;
        for (source, target) in [(first, second), (second, first)] {
            let ip = target
                .ip()
                .with_context(|| format!("{} has no address", target.name()))?;
            let handle = self.network.node(source.name())?;
            let output = handle.cmd(&format!("ping -c1 -W1 {ip}")).await;
            sent += 1;
            if output.contains(" 1 received") {
                received += 1;
                println!("{} -> {}", source.name(), target.name());
            } else {
                println!("{} -> X", source.name());
            }
        }

        let dropped = (sent - received) * 100 / sent;
        println!("*** Results: {dropped}% dropped ({received}/{sent} received)");
        Ok(())
    }

    async fn iperf(&self, args: &[&str]) -> anyhow::Result<()> {
        let hosts = self.network.hosts();
        let (client, server) = match args {
            [] => match (hosts.first(), hosts.last()) {
                (Some(first), Some(last)) if !Arc::ptr_eq(first, last) => {
                    (first.name().to_string(), last.name().to_string())
                }
                _ => bail!("iperf needs at least two hosts"),
            },
            [client, server] => (client.to_string(), server.to_string()),
            _ => bail!("invalid number of args: iperf src dst"),
        };

        println!("*** Iperf: testing TCP bandwidth between {client} and {server} ");
        let [server_bandwidth, client_bandwidth] = self
            .network
            .iperf(&client, &server, IPERF_DURATION)
            .await?;
        println!("*** Results: ['{server_bandwidth}', '{client_bandwidth}']");
        Ok(())
    }

    fn link(&self, args: &[&str]) -> anyhow::Result<()> {
        let [a, b, status] = args else {
            bail!("invalid number of args: link end1 end2 [up down]");
        };

        let up = match *status {
            "up" => true,
            "down" => false,
            _ => bail!("invalid type: link end1 end2 [up down]"),
        };

        self.network.config_link_status(a, b, up)
    }

    fn source(&mut self, path: &str) -> anyhow::Result<()> {
        if path.is_empty() {
            bail!("usage: source <file>");
        }

        let lines = read_lines(Path::new(path))?;
        for line in lines.into_iter().rev() {
            self.pending.push_front(line);
        }
        Ok(())
    }

    async fn node_cmd(&self, node: &str, rest: &str) -> anyhow::Result<()> {
        if rest.is_empty() {
            bail!("no command given to `{node}`");
        }

        let handle = self.network.node(node)?;
        let line = self.substitute_ips(rest);
        tracing::debug!(node, command = %line, "running command");
        print!("{}", handle.cmd(&line).await);
        Ok(())
    }

    /// Replaces words that name a node by the node's address
    fn substitute_ips(&self, rest: &str) -> String {
        rest.split_whitespace()
            .map(|word| {
                self.network
                    .node(word)
                    .ok()
                    .and_then(|n| n.ip())
                    .map_or_else(|| word.to_string(), |ip| ip.to_string())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read `{}`", path.display()))?;
    Ok(contents.lines().map(str::to_string).collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use emulated_network::NetworkConfig;
    use emulated_network::network::event::NetworkEvents;
    use emulated_network::network::topology::{HostOptions, LinkOptions, Topology, TopologyConfig};

    fn network() -> Arc<Network> {
        let mut topo = Topology::new();
        topo.add_switch("s1").unwrap();
        topo.add_host("h1", HostOptions::default()).unwrap();
        topo.add_host("h2", HostOptions::default()).unwrap();
        topo.add_link("h1", "s1", LinkOptions::default()).unwrap();
        topo.add_link("h2", "s1", LinkOptions::default()).unwrap();

        let spec = topo.build(&TopologyConfig::default()).unwrap();
        let network =
            Network::initialize(spec, NetworkEvents::default(), NetworkConfig::default()).unwrap();
        network.start();
        network
    }

    #[tokio::test(start_paused = true)]
    async fn test_substitute_ips() {
        let cli = Cli::new(network(), false);
        assert_eq!(cli.substitute_ips("ping -c 1  h2"), "ping -c 1 10.0.0.2");
        assert_eq!(cli.substitute_ips("iperf -c h1 -t s1"), "iperf -c 10.0.0.1 -t s1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow() {
        let mut cli = Cli::new(network(), false);
        assert_eq!(cli.run_line("# comment").await.unwrap(), Flow::Continue);
        assert_eq!(cli.run_line("h1 true").await.unwrap(), Flow::Continue);
        assert_eq!(cli.run_line("link h1 s1 down").await.unwrap(), Flow::Continue);
        assert!(cli.run_line("link h1 h2 down").await.is_err());
        assert!(cli.run_line("link h1 s1 sideways").await.is_err());
        assert!(cli.run_line("h1").await.is_err());
        assert_eq!(cli.run_line("quit").await.unwrap(), Flow::Exit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_queues_lines() {
        let path = std::env::temp_dir().join(format!("topo-source-{}", std::process::id()));
        std::fs::write(&path, "nodes\nexit\nnet\n").unwrap();

        let mut cli = Cli::new(network(), false);
        let line = format!("source {}", path.display());
        assert_eq!(cli.run_line(&line).await.unwrap(), Flow::Continue);
        assert_eq!(cli.pending, ["nodes", "exit", "net"]);

        // `exit` stops the run before `net` and the remaining input
        cli.run(["pingall".to_string()].into_iter()).await;
        assert_eq!(cli.pending, ["net"]);
        std::fs::remove_file(path).unwrap();
    }
}
