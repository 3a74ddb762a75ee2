#![allow(clippy::type_complexity)]

pub mod async_rt;
pub mod network;
pub mod pcap_exporter;
pub mod shell;
pub mod trace;
pub mod transport;
pub mod util;

pub use network::{Network, NetworkConfig, NodeHandle};

#[cfg(test)]
mod test {
    use crate::network::event::{NetworkEvent, NetworkEventPayload, NetworkEvents, UpdateLinkStatus};
    use crate::network::spec::{LinkClass, LinkShaping, RouteSpec};
    use crate::network::topology::{HostOptions, LinkOptions, Topology, TopologyConfig};
    use crate::network::{Network, NetworkConfig};
    use crate::transport::TransportError;
    use crate::transport::tcp::congestion::CongestionAlgorithm;
    use crate::transport::tcp::{TcpListener, TcpStream};
    use crate::transport::udp::UdpSocket;
    use bon::builder;
    use std::net::SocketAddrV4;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    const CORE_DELAY: Duration = Duration::from_millis(10);

    fn workdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "emulated-network-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Two switches joined by a core link, with two hosts behind each of them
    #[builder]
    fn default_network(
        bandwidth_mbps: Option<f64>,
        events: Option<Vec<NetworkEvent>>,
        workdir: Option<PathBuf>,
        link_class: Option<LinkClass>,
        congestion: Option<CongestionAlgorithm>,
    ) -> Arc<Network> {
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
                    bandwidth_mbps,
                    delay: CORE_DELAY,
                    ..LinkShaping::default()
                },
                ..LinkOptions::default()
            },
        )
        .unwrap();

        let spec = topo.build(&TopologyConfig::default()).unwrap();
        let config = NetworkConfig {
            workdir: workdir.unwrap_or_else(std::env::temp_dir),
            link_class: link_class.unwrap_or_default(),
            default_congestion: congestion.unwrap_or(CongestionAlgorithm::Cubic),
            ..NetworkConfig::default()
        };

        Network::initialize(spec, NetworkEvents::new(events.unwrap_or_default()), config)
            .unwrap()
    }

    /// Two subnets joined by a router
    fn routed_network() -> Arc<Network> {
        let cidr = |s: &str| s.parse().unwrap();
        let mut topo = Topology::new();
        topo.add_router(
            "r1",
            HostOptions {
                ip: Some(cidr("10.0.1.1/24")),
                ..HostOptions::default()
            },
        )
        .unwrap();
        for (host, ip, gateway) in [
            ("h1", "10.0.1.10/24", "via 10.0.1.1"),
            ("h2", "10.0.2.10/24", "via 10.0.2.1"),
        ] {
            topo.add_host(
                host,
                HostOptions {
                    ip: Some(cidr(ip)),
                    default_route: Some(gateway.parse().unwrap()),
                    ..HostOptions::default()
                },
            )
            .unwrap();
        }

        topo.add_link(
            "h1",
            "r1",
            LinkOptions {
                intf_name2: Some("r1-eth0".to_string()),
                ..LinkOptions::default()
            },
        )
        .unwrap();
        topo.add_link(
            "r1",
            "h2",
            LinkOptions {
                intf_name1: Some("r1-eth1".to_string()),
                ip1: Some(cidr("10.0.2.1/24")),
                shaping: LinkShaping {
                    delay: Duration::from_millis(5),
                    ..LinkShaping::default()
                },
                ..LinkOptions::default()
            },
        )
        .unwrap();

        let spec = topo.build(&TopologyConfig::default()).unwrap();
        Network::initialize(spec, NetworkEvents::default(), NetworkConfig::default()).unwrap()
    }

    fn link_event(at: Duration, status: UpdateLinkStatus) -> NetworkEvent {
        NetworkEvent {
            relative_time: at,
            payload: NetworkEventPayload {
                link_id: "s1-s2".to_string(),
                status: Some(status),
                ..NetworkEventPayload::default()
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_all_reaches_every_host() {
        let network = default_network().call();
        network.start();

        let report = network.ping_all().await;
        assert_eq!(report.sent, 12);
        assert_eq!(report.received, 12);

        let output = report.to_string();
        assert!(output.starts_with("*** Ping: testing ping reachability\nh1 -> h2 h3 h4 \n"));
        assert!(output.ends_with("*** Results: 0% dropped (12/12 received)"));

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_transfer_crosses_core_link() {
        let network = default_network().bandwidth_mbps(10.0).call();
        network.start();

        let h1 = network.node("h1").unwrap();
        let h4 = network.node("h4").unwrap();
        let listener = TcpListener::bind(h4.node(), 5001).unwrap();

        let server = tokio::spawn(async move {
            let stream = listener.accept().await;
            let mut received = Vec::new();
            let mut buf = vec![0; 8192];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        let data: Vec<u8> = (0..500_000u32).map(|i| (i % 251) as u8).collect();
        let start = Instant::now();
        let remote = SocketAddrV4::new(h4.ip().unwrap(), 5001);
        let stream = TcpStream::connect(h1.node(), remote).await.unwrap();
        stream.write_all(&data).await.unwrap();
        stream.shutdown();

        let received = server.await.unwrap();
        assert_eq!(received.len(), data.len());
        assert!(received == data);

        // 4 Mbit at 10 Mbit/s takes at least 400ms
        assert!(start.elapsed() >= Duration::from_millis(400));

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_sender_waits_for_receive_window() {
        let network = default_network().call();
        network.start();

        let h1 = network.node("h1").unwrap();
        let h4 = network.node("h4").unwrap();
        let listener = TcpListener::bind(h4.node(), 5002).unwrap();
        let remote = SocketAddrV4::new(h4.ip().unwrap(), 5002);
        let (stream, accepted) =
            tokio::join!(TcpStream::connect(h1.node(), remote), listener.accept());
        let stream = stream.unwrap();

        let writer = tokio::spawn(async move {
            stream.write_all(&vec![7; 300_000]).await.unwrap();
            stream.shutdown();
        });

        // Nobody reads yet, so the send and receive buffers fill up and the writer stalls
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!writer.is_finished());

        let mut total = 0;
        let mut buf = vec![0; 8192];
        loop {
            let n = accepted.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 300_000);
        writer.await.unwrap();

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_datagram_size_limits() {
        let network = default_network().call();
        network.start();

        let h1 = network.node("h1").unwrap();
        let h4 = network.node("h4").unwrap();
        let sender = UdpSocket::bind(h1.node(), 0).unwrap();
        let mut receiver = UdpSocket::bind(h4.node(), 5003).unwrap();
        let remote = SocketAddrV4::new(h4.ip().unwrap(), 5003);

        // Larger than any IP packet can carry
        assert_eq!(
            sender.send_to(&vec![7; 100_000], remote),
            Err(TransportError::MessageTooLong)
        );
        // Fits in IP but not in the interface MTU
        assert_eq!(
            sender.send_to(&vec![7; 1473], remote),
            Err(TransportError::MessageTooLong)
        );

        assert_eq!(sender.send_to(&vec![7; 1472], remote), Ok(1472));
        let datagram = receiver.recv_from().await.unwrap();
        assert_eq!(datagram.payload.len(), 1472);

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_larger_than_mtu() {
        let network = default_network().call();
        network.start();

        let h1 = network.node("h1").unwrap();
        let output = h1.cmd("ping -c 2 -s 2000 h2").await;
        assert!(output.contains("ping: local error: message too long, mtu=1500"), "{output}");
        assert!(output.contains("2 packets transmitted, 0 received, +2 errors"), "{output}");

        // 1472 bytes of payload plus the ICMP and IP headers fill the MTU exactly
        let output = h1.cmd("ping -c 1 -s 1472 h2").await;
        assert!(output.contains("1480 bytes from 10.0.0.2"), "{output}");

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_core_link_loss_skips_host_links() {
        let cidr = |s: &str| s.parse().unwrap();
        let mut topo = Topology::new();
        for (router, ip) in [("r1", "10.0.1.1/24"), ("r2", "10.0.2.1/24")] {
            let options = HostOptions {
                ip: Some(cidr(ip)),
                ..HostOptions::default()
            };
            topo.add_router(router, options).unwrap();
        }
        for (host, ip) in [("h1", "10.0.1.10/24"), ("h2", "10.0.2.10/24")] {
            let options = HostOptions {
                ip: Some(cidr(ip)),
                ..HostOptions::default()
            };
            topo.add_host(host, options).unwrap();
        }
        topo.add_switch("s1").unwrap();
        topo.add_switch("s2").unwrap();
        topo.add_host("h3", HostOptions::default()).unwrap();
        topo.add_host("h4", HostOptions::default()).unwrap();

        for (host, router) in [("h1", "r1"), ("h2", "r2")] {
            let options = LinkOptions {
                intf_name2: Some(format!("{router}-eth0")),
                ..LinkOptions::default()
            };
            topo.add_link(host, router, options).unwrap();
        }
        let transit = LinkOptions {
            intf_name1: Some("r1-eth1".to_string()),
            intf_name2: Some("r2-eth1".to_string()),
            ip1: Some(cidr("10.0.12.1/24")),
            ip2: Some(cidr("10.0.12.2/24")),
            ..LinkOptions::default()
        };
        topo.add_link("r1", "r2", transit).unwrap();
        topo.add_link("h3", "s1", LinkOptions::default()).unwrap();
        topo.add_link("s1", "s2", LinkOptions::default()).unwrap();
        topo.add_link("s2", "h4", LinkOptions::default()).unwrap();

        let spec = topo.build(&TopologyConfig::default()).unwrap();
        let network =
            Network::initialize(spec, NetworkEvents::default(), NetworkConfig::default()).unwrap();
        network.set_core_link_loss(25.0);

        let loss = |a: &str, b: &str| {
            let link = network.links().iter().find(|l| l.connects(a, b)).unwrap();
            link.shaping().loss_percent
        };
        assert_eq!(loss("s1", "s2"), 25.0);
        assert_eq!(loss("r1", "r2"), 25.0);
        assert_eq!(loss("h1", "r1"), 0.0);
        assert_eq!(loss("h2", "r2"), 0.0);
        assert_eq!(loss("h3", "s1"), 0.0);
        assert_eq!(loss("s2", "h4"), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_congestion_control() {
        let network = default_network()
            .congestion(CongestionAlgorithm::Reno)
            .call();
        network.start();

        let h1 = network.node("h1").unwrap();
        let h4 = network.node("h4").unwrap();
        assert_eq!(
            h1.cmd("sysctl net.ipv4.tcp_congestion_control").await,
            "net.ipv4.tcp_congestion_control = reno\n"
        );

        let listener = TcpListener::bind(h4.node(), 5004).unwrap();
        let remote = SocketAddrV4::new(h4.ip().unwrap(), 5004);
        let (stream, accepted) =
            tokio::join!(TcpStream::connect(h1.node(), remote), listener.accept());
        assert_eq!(stream.unwrap().congestion_algorithm(), CongestionAlgorithm::Reno);
        assert_eq!(accepted.congestion_algorithm(), CongestionAlgorithm::Reno);

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_links_ignore_shaping() {
        let network = default_network()
            .bandwidth_mbps(1.0)
            .link_class(LinkClass::Plain)
            .call();
        network.start();

        let core = network.link("s1-s2").unwrap();
        assert!(core.shaping().is_default());

        // Neither loss nor the core delay apply
        network.set_core_link_loss(100.0);
        assert!(core.shaping().is_default());

        let output = network.node("h1").unwrap().cmd("ping -c 3 h3").await;
        assert!(output.contains("3 packets transmitted, 3 received"), "{output}");
        assert!(!output.contains("time=20.0 ms"), "{output}");

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_through_shell() {
        let network = default_network().call();
        network.start();

        let output = network.node("h1").unwrap().cmd("ping -c 3 h3").await;
        assert!(output.starts_with("PING h3 (10.0.0.3) 56(84) bytes of data.\n"));
        assert!(output.contains("64 bytes from 10.0.0.3: icmp_seq=3 ttl=64 time=20.0 ms"));
        assert!(output.contains("3 packets transmitted, 3 received, 0% packet loss"));

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_router_forwards_only_while_running() {
        let network = routed_network();
        let h1 = network.node("h1").unwrap();

        let output = h1.cmd("ping -c 1 -W 1 10.0.2.10").await;
        assert!(output.contains("1 packets transmitted, 0 received"), "{output}");

        network.start();
        let output = h1.cmd("ping -c 2 10.0.2.10").await;
        assert!(output.contains("ttl=63"), "{output}");
        assert!(output.contains("2 packets transmitted, 2 received"), "{output}");

        let report = network.ping_all().await;
        assert_eq!(report.received, report.sent);

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_down_and_up() {
        let network = default_network().call();
        network.start();

        network.config_link_status("s1", "s2", false).unwrap();
        let report = network.ping_all().await;
        // Only the hosts that share a switch can reach each other
        assert_eq!(report.received, 4);

        network.config_link_status("s2", "s1", true).unwrap();
        let report = network.ping_all().await;
        assert_eq!(report.received, 12);

        assert!(network.config_link_status("h1", "h4", true).is_err());
        let stats = network.link_stats();
        assert!(stats.by_link["s1-s2"].dropped_link_down.packets > 0);

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_link_events() {
        let network = default_network()
            .events(vec![
                link_event(Duration::ZERO, UpdateLinkStatus::Down),
                link_event(Duration::from_secs(60), UpdateLinkStatus::Up),
            ])
            .call();
        network.start();

        let report = network.ping_all().await;
        assert_eq!(report.received, 4);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let report = network.ping_all().await;
        assert_eq!(report.received, 12);

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_iperf_with_background_server() {
        let network = default_network().bandwidth_mbps(10.0).call();
        network.start();

        let h1 = network.node("h1").unwrap();
        let h4 = network.node("h4").unwrap();

        let output = h4.cmd("iperf -s &").await;
        assert_eq!(output, "[1] 1000\n");

        let output = h1.cmd("iperf -c h4 -t 5").await;
        assert!(output.contains("Client connecting to 10.0.0.4, TCP port 5001"), "{output}");
        assert!(output.contains("[  3]  0.0- 5.0 sec"), "{output}");
        assert!(output.contains("Mbits/sec"), "{output}");

        let output = h4.cmd("jobs").await;
        assert!(output.contains("Server listening on TCP port 5001"), "{output}");
        assert!(output.contains("[1]+  Running"), "{output}");

        let output = h4.cmd("kill %1; jobs").await;
        assert!(!output.contains("Running"), "{output}");

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_iperf_between_nodes() {
        let network = default_network().bandwidth_mbps(10.0).call();
        network.start();

        let [server, client] = network
            .iperf("h1", "h4", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(server.ends_with("Mbits/sec"), "{server}");
        assert!(client.ends_with("Mbits/sec"), "{client}");

        network.stop().await;
    }

    fn mbits(reading: &str) -> f64 {
        reading
            .strip_suffix(" Mbits/sec")
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(|| panic!("not a Mbits/sec reading: {reading}"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_iperf_reports_link_bandwidth() {
        let network = default_network().bandwidth_mbps(10.0).call();
        network.start();

        let start = Instant::now();
        let [server, client] = network
            .iperf("h1", "h4", Duration::from_secs(5))
            .await
            .unwrap();

        // The 64 KiB receive window keeps the sender from queueing more than the link can drain
        assert!((9.0..=10.0).contains(&mbits(&server)), "{server}");
        assert!((9.0..=10.0).contains(&mbits(&client)), "{client}");
        assert!(start.elapsed() < Duration::from_secs(6), "{:?}", start.elapsed());

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_iperf_clients_with_captures() {
        let dir = workdir("iperf-captures");
        let network = default_network()
            .bandwidth_mbps(10.0)
            .workdir(dir.clone())
            .call();
        network.start();

        let h4 = network.node("h4").unwrap();
        for port in [5201, 5202, 5203] {
            let output = h4.cmd(&format!("iperf -s -p {port} -D")).await;
            assert!(output.contains("Running Iperf Server as a daemon"), "{output}");
        }
        h4.cmd("timeout 10 tcpdump -i h4-eth0 -w capture4.pcap &").await;

        let start = Instant::now();
        let clients = ["h1", "h2", "h3"].map(|name| network.node(name).unwrap());
        for (i, client) in clients[..2].iter().enumerate() {
            let output = client
                .cmd(&format!(
                    "timeout 7 tcpdump -i h{n}-eth0 -w capture{n}.pcap & iperf -c 10.0.0.4 -p 520{n} -t 5 &",
                    n = i + 1
                ))
                .await;
            assert_eq!(output, "[1] 1000\n[2] 1001\n");
        }
        let output = clients[2]
            .cmd("timeout 7 tcpdump -i h3-eth0 -w capture3.pcap & iperf -c 10.0.0.4 -p 5203 -t 5")
            .await;
        assert!(output.contains("TCP port 5203"), "{output}");
        assert!(output.contains("[  3]  0.0- 5.0 sec"), "{output}");

        for (i, client) in clients[..2].iter().enumerate() {
            let output = client.cmd("wait").await;
            assert!(output.contains(&format!("TCP port 520{}", i + 1)), "{output}");
            assert!(output.contains("[  3]  0.0- 5.0 sec"), "{output}");
            assert!(output.contains("packets captured"), "{output}");
        }

        // The captures end with their timeouts rather than with the transfers
        assert!(start.elapsed() < Duration::from_secs(8), "{:?}", start.elapsed());
        for n in 1..=3 {
            assert!(dir.join(format!("capture{n}.pcap")).exists());
        }

        network.stop().await;
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcpdump_writes_capture_file() {
        let dir = workdir("tcpdump");
        let network = default_network().workdir(dir.clone()).call();
        network.start();

        let h1 = network.node("h1").unwrap();
        let output = h1.cmd("tcpdump -i h1-eth0 -c 2 -w h1.pcapng &").await;
        assert_eq!(output, "[1] 1000\n");

        // The capture's output shows up in whichever command runs next
        let mut output = h1.cmd("ping -c 1 h2").await;
        output.push_str(&h1.cmd("wait").await);
        assert!(output.contains("tcpdump: listening on h1-eth0"), "{output}");
        assert!(output.contains("2 packets captured"), "{output}");

        let capture = std::fs::read(dir.join("h1.pcapng")).unwrap();
        // Section header block
        assert_eq!(&capture[..4], &[0x0a, 0x0d, 0x0d, 0x0a]);

        network.stop().await;
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_route_from_shell() {
        let network = default_network().call();
        network.start();

        let h1 = network.node("h1").unwrap();
        let output = h1.cmd("ip route add 192.168.7.0/24 via 10.0.0.2").await;
        assert_eq!(output, "");
        let output = h1.cmd("ip route show").await;
        assert!(output.contains("192.168.7.0/24 via 10.0.0.2 dev h1-eth0"), "{output}");

        let routes = h1.node().routes();
        assert!(routes.iter().any(|r| r.destination == "192.168.7.0/24".parse().unwrap()));

        network.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_server_and_curl() {
        let dir = workdir("http");
        std::fs::write(dir.join("index.html"), "<h1>hello</h1>\n").unwrap();
        let network = default_network().workdir(dir.clone()).call();
        network.start();

        let h1 = network.node("h1").unwrap();
        let h3 = network.node("h3").unwrap();
        h3.cmd("python -m http.server 80 &").await;

        let output = h1.cmd("curl -s h3/").await;
        assert_eq!(output, "<h1>hello</h1>\n");

        let output = h1.cmd("curl -s -o copy.html -w %{http_code} http://h3:80/index.html").await;
        assert_eq!(output, "200");
        assert_eq!(
            std::fs::read_to_string(dir.join("copy.html")).unwrap(),
            "<h1>hello</h1>\n"
        );

        let output = h1.cmd("curl -sS http://h3:8080/").await;
        assert!(output.starts_with("curl: (7) Failed to connect to h3 port 8080"), "{output}");

        let output = h3.cmd("jobs").await;
        assert!(output.contains("Serving HTTP on 0.0.0.0 port 80"), "{output}");
        assert!(output.contains("\"GET /index.html HTTP/1.1\" 200 -"), "{output}");

        network.stop().await;
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_program_and_operators() {
        let network = default_network().call();
        let h1 = network.node("h1").unwrap();

        assert_eq!(
            h1.cmd("nmap h2").await,
            "bash: nmap: command not found\n"
        );
        assert_eq!(h1.cmd("false || echo fallback").await, "fallback\n");
        assert_eq!(h1.cmd("true && hostname").await, "h1\n");
        assert_eq!(h1.cmd("echo a; echo b").await, "a\nb\n");
    }

    #[test]
    fn test_static_route_spec_is_applied() {
        let mut topo = Topology::new();
        topo.add_host("h1", HostOptions::default()).unwrap();
        topo.add_host("h2", HostOptions::default()).unwrap();
        topo.add_link("h1", "h2", LinkOptions::default()).unwrap();
        topo.add_route(
            "h1",
            RouteSpec {
                destination: "172.16.0.0/16".parse().unwrap(),
                gateway: Some("10.0.0.2".parse().unwrap()),
                interface: None,
            },
        )
        .unwrap();

        let spec = topo.build(&TopologyConfig::default()).unwrap();
        assert_eq!(spec.node("h1").unwrap().routes.len(), 1);
    }
}
