//! Emulated iperf 2, in TCP and UDP mode
//!
//! Reports follow the layout of iperf 2.0, so scripts that scrape its output keep working. UDP
//! datagrams carry a sequence number and a send timestamp; the client ends the test with a
//! datagram whose sequence number is negative, to which the server answers with its report.

use crate::network::node::Node;
use crate::shell::io::Io;
use crate::shell::programs::{Invocation, ProgramFuture};
use crate::transport::TransportError;
use crate::transport::tcp::congestion::CongestionAlgorithm;
use crate::transport::tcp::connection::WINDOW;
use crate::transport::tcp::{TcpListener, TcpStream};
use crate::transport::udp::UdpSocket;
use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

pub const DEFAULT_PORT: u16 = 5001;

const TCP_BUFFER_LEN: usize = 128 * 1024;
const UDP_DATAGRAM_LEN: usize = 1470;
/// Bits per second
const UDP_DEFAULT_RATE: f64 = 1024.0 * 1024.0;
const UDP_BUFFER_SIZE: usize = 212992;
/// Sequence number and send timestamp (seconds and microseconds)
const UDP_HEADER_LEN: usize = 12;
const FIN_RETRIES: u32 = 10;
const FIN_RETRY_INTERVAL: Duration = Duration::from_millis(250);

const CLIENT_ID: u32 = 3;
const FIRST_UDP_SERVER_ID: u32 = 3;
const FIRST_TCP_SERVER_ID: u32 = 4;

const SEPARATOR: &str = "------------------------------------------------------------";
const TCP_COLUMNS: &str = "[ ID] Interval       Transfer     Bandwidth";
const UDP_SERVER_COLUMNS: &str =
    "[ ID] Interval       Transfer     Bandwidth        Jitter   Lost/Total Datagrams";

#[derive(Parser, Debug)]
#[command(name = "iperf", about = "Measures network throughput")]
struct Args {
    /// Run in server mode
    #[arg(short, long)]
    server: bool,
    /// Run in client mode, connecting to HOST
    #[arg(short, long, value_name = "HOST")]
    client: Option<String>,
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Time in seconds to transmit for
    #[arg(short, long, default_value_t = 10.0)]
    time: f64,
    /// Use UDP rather than TCP
    #[arg(short, long)]
    udp: bool,
    /// UDP bandwidth to send at, in bits/sec (implies -u)
    #[arg(short, long, value_name = "RATE")]
    bandwidth: Option<String>,
    /// Length of the buffer to write, or of the UDP datagrams
    #[arg(short, long, value_name = "LEN")]
    len: Option<String>,
    /// Seconds between periodic bandwidth reports
    #[arg(short, long, value_name = "SECS")]
    interval: Option<f64>,
    /// Run the server as a daemon
    #[arg(short = 'D', long)]
    daemon: bool,
    /// TCP congestion control algorithm
    #[arg(short = 'Z', long = "tcp-congestion", value_name = "ALGO")]
    congestion: Option<String>,
    #[arg(short = 'y', long = "reportstyle", value_name = "STYLE")]
    report_style: Option<String>,
}

#[derive(Clone)]
struct Options {
    port: u16,
    duration: Duration,
    udp: bool,
    rate: f64,
    len: usize,
    interval: Option<Duration>,
    congestion: Option<CongestionAlgorithm>,
}

impl Options {
    fn from_args(args: &Args) -> Result<Self, String> {
        let duration = Duration::try_from_secs_f64(args.time)
            .map_err(|_| format!("invalid time `{}`", args.time))?;

        let rate = match &args.bandwidth {
            Some(rate) => parse_rate(rate).ok_or_else(|| format!("invalid bandwidth `{rate}`"))?,
            None => UDP_DEFAULT_RATE,
        };

        let udp = args.udp || args.bandwidth.is_some();
        let len = match &args.len {
            Some(len) => parse_size(len).ok_or_else(|| format!("invalid length `{len}`"))?,
            None if udp => UDP_DATAGRAM_LEN,
            None => TCP_BUFFER_LEN,
        };

        let interval = match args.interval {
            Some(secs) => Some(
                Duration::try_from_secs_f64(secs).map_err(|_| format!("invalid interval `{secs}`"))?,
            ),
            None => None,
        };

        let congestion = match &args.congestion {
            Some(name) => Some(name.parse().map_err(|_| {
                format!("Attempt to set '{name}' congestion control failed: No such file or directory")
            })?),
            None => None,
        };

        Ok(Self {
            port: args.port,
            duration,
            udp,
            rate,
            len: if udp { len.max(UDP_HEADER_LEN) } else { len },
            interval: interval.filter(|i| !i.is_zero()),
            congestion,
        })
    }
}

pub fn main(invocation: Invocation) -> ProgramFuture {
    async move {
        let args: Args = match invocation.parse_args() {
            Ok(args) => args,
            Err(status) => return status,
        };

        let io = &invocation.io;
        if args.report_style.is_some() {
            io.errln("iperf: report styles other than the default (-y) are not supported");
            return 1;
        }

        let options = match Options::from_args(&args) {
            Ok(options) => options,
            Err(message) => {
                io.errln(&message);
                return 1;
            }
        };

        let node = invocation.node.clone();
        match (args.server, &args.client) {
            (true, None) => {
                let server = match Server::bind(&node, &options) {
                    Ok(server) => server,
                    Err(e) => {
                        io.errln(&format!("bind failed: {e}"));
                        return 1;
                    }
                };

                if args.daemon {
                    io.outln("Running Iperf Server as a daemon");
                    let cancellation_token = node.ctx.cancellation_token.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            biased;
                            _ = cancellation_token.cancelled() => {}
                            _ = server.run(options, Io::null()) => {}
                        }
                    });
                    return 0;
                }

                server.run(options, invocation.io.clone()).await
            }
            (false, Some(host)) => {
                let Some(ip) = invocation.env.resolve(host) else {
                    io.errln(&format!("ERROR: Unknown host '{host}'"));
                    return 1;
                };

                let remote = SocketAddrV4::new(ip, options.port);
                if options.udp {
                    udp_client(&node, remote, &options, io).await
                } else {
                    tcp_client(&node, remote, &options, io).await
                }
            }
            (true, Some(_)) => {
                io.errln("iperf: cannot run as server and client at the same time");
                1
            }
            (false, None) => {
                io.errln("Usage: iperf [-s|-c host] [options]");
                io.errln("Try `iperf --help' for more information.");
                1
            }
        }
    }
    .boxed()
}

/// Result of a TCP test started from the network API
pub(crate) struct TcpTestResult {
    pub server_bits_per_sec: f64,
    pub client_bits_per_sec: f64,
}

/// Runs a TCP test between two nodes without going through their shells
pub(crate) async fn tcp_test(
    client: &Arc<Node>,
    server: &Arc<Node>,
    port: u16,
    duration: Duration,
) -> anyhow::Result<TcpTestResult> {
    let server_ip = server
        .ip()
        .with_context(|| format!("{} has no IP address", server.name()))?;
    let listener = TcpListener::bind(server, port)
        .with_context(|| format!("failed to listen on {}:{port}", server.name()))?;

    let io = Io::null();
    let server_side = async {
        let stream = listener.accept().await;
        anyhow::Ok(receive_tcp(&stream, &io, FIRST_TCP_SERVER_ID, None).await)
    };
    let client_side = async {
        let stream = TcpStream::connect(client, SocketAddrV4::new(server_ip, port))
            .await
            .with_context(|| format!("{} failed to connect to {server_ip}", client.name()))?;
        let transfer = send_tcp(&stream, duration, TCP_BUFFER_LEN, &io, CLIENT_ID, None)
            .await
            .context("iperf client failed")?;
        anyhow::Ok(transfer)
    };

    let (server_transfer, client_transfer) = tokio::try_join!(server_side, client_side)?;
    Ok(TcpTestResult {
        server_bits_per_sec: server_transfer.bits_per_sec(),
        client_bits_per_sec: client_transfer.bits_per_sec(),
    })
}

enum Server {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl Server {
    fn bind(node: &Arc<Node>, options: &Options) -> Result<Self, TransportError> {
        if options.udp {
            UdpSocket::bind(node, options.port).map(Server::Udp)
        } else {
            TcpListener::bind(node, options.port).map(Server::Tcp)
        }
    }

    async fn run(self, options: Options, io: Io) -> i32 {
        io.outln(SEPARATOR);
        match self {
            Server::Tcp(listener) => {
                io.outln(&format!("Server listening on TCP port {}", options.port));
                io.outln(&format!(
                    "TCP window size: {} (default)",
                    format_bytes(WINDOW as f64)
                ));
                io.outln(SEPARATOR);
                tcp_server(listener, options, io).await
            }
            Server::Udp(socket) => {
                io.outln(&format!("Server listening on UDP port {}", options.port));
                io.outln(&format!("Receiving {} byte datagrams", options.len));
                io.outln(&format!(
                    "UDP buffer size: {} (default)",
                    format_bytes(UDP_BUFFER_SIZE as f64)
                ));
                io.outln(SEPARATOR);
                udp_server(socket, options, io).await
            }
        }
    }
}

/// Amount of data moved during a test
struct Transfer {
    bytes: u64,
    elapsed: Duration,
}

impl Transfer {
    fn bits_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 * 8.0 / secs
        } else {
            0.0
        }
    }
}

/// Boundaries of the periodic reports requested with `-i`
struct Intervals {
    every: Duration,
    start: Instant,
    index: u32,
}

impl Intervals {
    fn new(every: Option<Duration>, start: Instant) -> Option<Self> {
        every.map(|every| Self {
            every,
            start,
            index: 0,
        })
    }

    fn next_deadline(&self) -> Instant {
        self.start + self.every * (self.index + 1)
    }

    /// Returns the next interval that has ended, if any
    fn due(&mut self) -> Option<(f64, f64)> {
        if Instant::now() < self.next_deadline() {
            return None;
        }

        let from = (self.every * self.index).as_secs_f64();
        self.index += 1;
        Some((from, (self.every * self.index).as_secs_f64()))
    }
}

/// Periodic transfer reports of a TCP test or a UDP client
struct ThroughputReports<'a> {
    io: &'a Io,
    id: u32,
    intervals: Option<Intervals>,
    reported_bytes: u64,
}

impl<'a> ThroughputReports<'a> {
    fn new(io: &'a Io, id: u32, every: Option<Duration>, start: Instant) -> Self {
        Self {
            io,
            id,
            intervals: Intervals::new(every, start),
            reported_bytes: 0,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.intervals.as_ref().map(Intervals::next_deadline)
    }

    fn update(&mut self, total_bytes: u64) {
        let Some(intervals) = &mut self.intervals else {
            return;
        };

        while let Some((from, to)) = intervals.due() {
            let bytes = total_bytes - self.reported_bytes;
            self.io
                .outln(&transfer_line(self.id, from, to, bytes));
            self.reported_bytes = total_bytes;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn print_connected(io: &Io, id: u32, local: SocketAddrV4, remote: SocketAddrV4) {
    io.outln(&format!(
        "[{id:3}] local {} port {} connected with {} port {}",
        local.ip(),
        local.port(),
        remote.ip(),
        remote.port()
    ));
}

async fn tcp_server(listener: TcpListener, options: Options, io: Io) -> i32 {
    let mut handlers = JoinSet::new();
    let mut next_id = FIRST_TCP_SERVER_ID;
    loop {
        tokio::select! {
            biased;
            Some(_) = handlers.join_next() => {}
            stream = listener.accept() => {
                let id = next_id;
                next_id += 1;
                let io = io.clone();
                let interval = options.interval;
                handlers.spawn(async move {
                    print_connected(&io, id, stream.local_addr(), stream.peer_addr());
                    io.outln(TCP_COLUMNS);
                    let transfer = receive_tcp(&stream, &io, id, interval).await;
                    io.outln(&transfer_line(id, 0.0, transfer.elapsed.as_secs_f64(), transfer.bytes));
                });
            }
        }
    }
}

/// Reads until the peer closes the connection
async fn receive_tcp(stream: &TcpStream, io: &Io, id: u32, interval: Option<Duration>) -> Transfer {
    let start = Instant::now();
    let mut reports = ThroughputReports::new(io, id, interval, start);
    let mut buf = vec![0; TCP_BUFFER_LEN];
    let mut bytes = 0;

    loop {
        tokio::select! {
            biased;
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => bytes += n as u64,
            },
            _ = sleep_until(reports.next_deadline()) => {}
        }

        reports.update(bytes);
    }

    Transfer {
        bytes,
        elapsed: start.elapsed(),
    }
}

/// Writes as fast as the connection allows for `duration`, then closes the sending side
async fn send_tcp(
    stream: &TcpStream,
    duration: Duration,
    len: usize,
    io: &Io,
    id: u32,
    interval: Option<Duration>,
) -> Result<Transfer, TransportError> {
    let buf: Vec<u8> = (0..len).map(|i| b'0' + (i % 10) as u8).collect();
    let start = Instant::now();
    let deadline = start + duration;
    let mut reports = ThroughputReports::new(io, id, interval, start);
    let mut bytes = 0;

    while Instant::now() < deadline {
        let wake_at = reports
            .next_deadline()
            .map_or(deadline, |report_at| report_at.min(deadline));
        if let Ok(written) = tokio::time::timeout_at(wake_at, stream.write(&buf)).await {
            bytes += written? as u64;
        }

        reports.update(bytes);
    }

    stream.shutdown();
    Ok(Transfer {
        bytes,
        elapsed: start.elapsed(),
    })
}

async fn tcp_client(node: &Arc<Node>, remote: SocketAddrV4, options: &Options, io: &Io) -> i32 {
    io.outln(SEPARATOR);
    io.outln(&format!(
        "Client connecting to {}, TCP port {}",
        remote.ip(),
        remote.port()
    ));
    io.outln(&format!(
        "TCP window size: {} (default)",
        format_bytes(WINDOW as f64)
    ));
    io.outln(SEPARATOR);

    let algorithm = options
        .congestion
        .unwrap_or_else(|| node.congestion_control());
    let stream = match TcpStream::connect_with(node, remote, algorithm).await {
        Ok(stream) => stream,
        Err(e) => {
            io.errln(&format!("connect failed: {e}"));
            return 1;
        }
    };

    print_connected(io, CLIENT_ID, stream.local_addr(), stream.peer_addr());
    io.outln(TCP_COLUMNS);
    match send_tcp(&stream, options.duration, options.len, io, CLIENT_ID, options.interval).await {
        Ok(transfer) => {
            io.outln(&transfer_line(
                CLIENT_ID,
                0.0,
                transfer.elapsed.as_secs_f64(),
                transfer.bytes,
            ));
            0
        }
        Err(e) => {
            io.errln(&format!("write failed: {e}"));
            1
        }
    }
}

/// The header of every test datagram
#[derive(Debug, PartialEq)]
struct DatagramHeader {
    seq: i32,
    /// Send time, relative to the start of the network
    sent: Duration,
}

impl DatagramHeader {
    fn write(&self, payload: &mut [u8]) {
        payload[0..4].copy_from_slice(&self.seq.to_be_bytes());
        payload[4..8].copy_from_slice(&(self.sent.as_secs() as u32).to_be_bytes());
        payload[8..12].copy_from_slice(&self.sent.subsec_micros().to_be_bytes());
    }

    fn read(payload: &[u8]) -> Option<Self> {
        let word = |i: usize| -> Option<[u8; 4]> { payload.get(i..i + 4)?.try_into().ok() };
        let secs = u32::from_be_bytes(word(4)?);
        let micros = u32::from_be_bytes(word(8)?);
        Some(Self {
            seq: i32::from_be_bytes(word(0)?),
            sent: Duration::from_secs(secs as u64) + Duration::from_micros(micros as u64),
        })
    }
}

/// What the UDP server reports back to the client at the end of a test
#[derive(Clone, Debug, PartialEq)]
struct ServerReport {
    bytes: u64,
    elapsed: Duration,
    /// Seconds
    jitter: f64,
    lost: u64,
    total: u64,
}

impl ServerReport {
    fn encode(&self, fin: &DatagramHeader) -> Vec<u8> {
        let mut payload = vec![0; UDP_HEADER_LEN];
        fin.write(&mut payload);
        for field in [
            self.bytes,
            self.elapsed.as_micros() as u64,
            self.jitter.to_bits(),
            self.lost,
            self.total,
        ] {
            payload.extend_from_slice(&field.to_be_bytes());
        }
        payload
    }

    fn decode(payload: &[u8]) -> Option<Self> {
        let field = |i: usize| -> Option<u64> {
            let start = UDP_HEADER_LEN + i * 8;
            Some(u64::from_be_bytes(payload.get(start..start + 8)?.try_into().ok()?))
        };

        Some(Self {
            bytes: field(0)?,
            elapsed: Duration::from_micros(field(1)?),
            jitter: f64::from_bits(field(2)?),
            lost: field(3)?,
            total: field(4)?,
        })
    }

    fn line(&self, id: u32) -> String {
        let percent = if self.total == 0 {
            0.0
        } else {
            self.lost as f64 * 100.0 / self.total as f64
        };
        udp_line(
            id,
            0.0,
            self.elapsed.as_secs_f64(),
            self.bytes,
            self.jitter,
            self.lost,
            self.total,
            percent,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn udp_line(
    id: u32,
    from: f64,
    to: f64,
    bytes: u64,
    jitter: f64,
    lost: u64,
    total: u64,
    percent: f64,
) -> String {
    format!(
        "{}  {:6.3} ms {lost:4}/{total:5} ({}%)",
        transfer_line(id, from, to, bytes),
        jitter * 1000.0,
        format_percent(percent)
    )
}

/// Receiving side of a UDP test, one per client address
struct UdpSession {
    id: u32,
    start: Instant,
    bytes: u64,
    received: u64,
    max_seq: i32,
    /// RFC 1889 interarrival jitter, in seconds
    jitter: f64,
    last_transit: Option<f64>,
    intervals: Option<Intervals>,
    reported: (u64, u64, i32),
}

impl UdpSession {
    fn new(id: u32, interval: Option<Duration>) -> Self {
        let start = Instant::now();
        Self {
            id,
            start,
            bytes: 0,
            received: 0,
            max_seq: -1,
            jitter: 0.0,
            last_transit: None,
            intervals: Intervals::new(interval, start),
            reported: (0, 0, -1),
        }
    }

    fn on_datagram(&mut self, header: &DatagramHeader, len: usize, transit: f64) {
        self.bytes += len as u64;
        self.received += 1;
        self.max_seq = self.max_seq.max(header.seq);
        if let Some(last) = self.last_transit {
            let delta = (transit - last).abs();
            self.jitter += (delta - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    fn interval_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let Some(intervals) = &mut self.intervals else {
            return lines;
        };

        while let Some((from, to)) = intervals.due() {
            let (bytes, received, max_seq) = self.reported;
            let total = (self.max_seq - max_seq).max(0) as u64;
            let lost = total.saturating_sub(self.received - received);
            let percent = if total == 0 {
                0.0
            } else {
                lost as f64 * 100.0 / total as f64
            };
            lines.push(udp_line(
                self.id,
                from,
                to,
                self.bytes - bytes,
                self.jitter,
                lost,
                total,
                percent,
            ));
            self.reported = (self.bytes, self.received, self.max_seq);
        }

        lines
    }

    fn finish(&self, total: u64) -> ServerReport {
        ServerReport {
            bytes: self.bytes,
            elapsed: self.start.elapsed(),
            jitter: self.jitter,
            lost: total.saturating_sub(self.received),
            total,
        }
    }
}

async fn udp_server(mut socket: UdpSocket, options: Options, io: Io) -> i32 {
    let network_start = socket.node().ctx.start;
    let mut sessions: HashMap<SocketAddrV4, UdpSession> = HashMap::new();
    let mut finished: HashMap<SocketAddrV4, Vec<u8>> = HashMap::new();
    let mut next_id = FIRST_UDP_SERVER_ID;

    while let Some(datagram) = socket.recv_from().await {
        let Some(header) = DatagramHeader::read(&datagram.payload) else {
            continue;
        };
        let source = datagram.source;

        if header.seq < 0 {
            if let Some(session) = sessions.remove(&source) {
                let total = (-(header.seq as i64) - 1) as u64;
                let report = session.finish(total);
                io.outln(&report.line(session.id));
                finished.insert(source, report.encode(&header));
            }
            if let Some(report) = finished.get(&source) {
                socket.send_to(report, source).ok();
            }
            continue;
        }

        let session = sessions.entry(source).or_insert_with(|| {
            let id = next_id;
            next_id += 1;
            finished.remove(&source);
            if let Ok(local) = socket.node().source_address_for(*source.ip()) {
                print_connected(&io, id, SocketAddrV4::new(local, options.port), source);
            }
            io.outln(UDP_SERVER_COLUMNS);
            UdpSession::new(id, options.interval)
        });

        let arrival = datagram.received_at.saturating_duration_since(network_start);
        let transit = arrival.as_secs_f64() - header.sent.as_secs_f64();
        session.on_datagram(&header, datagram.payload.len(), transit);
        for line in session.interval_lines() {
            io.outln(&line);
        }
    }

    0
}

async fn udp_client(node: &Arc<Node>, remote: SocketAddrV4, options: &Options, io: &Io) -> i32 {
    let gap = Duration::from_secs_f64(options.len as f64 * 8.0 / options.rate);
    io.outln(SEPARATOR);
    io.outln(&format!(
        "Client connecting to {}, UDP port {}",
        remote.ip(),
        remote.port()
    ));
    io.outln(&format!(
        "Sending {} byte datagrams, IPG target: {:.2} us (kalman adjust)",
        options.len,
        gap.as_secs_f64() * 1e6
    ));
    io.outln(&format!(
        "UDP buffer size: {} (default)",
        format_bytes(UDP_BUFFER_SIZE as f64)
    ));
    io.outln(SEPARATOR);

    let mut socket = match UdpSocket::bind(node, 0) {
        Ok(socket) => socket,
        Err(e) => {
            io.errln(&format!("bind failed: {e}"));
            return 1;
        }
    };
    let local = match node.source_address_for(*remote.ip()) {
        Ok(local) => local,
        Err(e) => {
            io.errln(&format!("write failed: {e}"));
            return 1;
        }
    };

    print_connected(io, CLIENT_ID, SocketAddrV4::new(local, socket.local_port()), remote);
    io.outln(TCP_COLUMNS);

    let network_start = node.ctx.start;
    let start = Instant::now();
    let deadline = start + options.duration;
    let mut reports = ThroughputReports::new(io, CLIENT_ID, options.interval, start);
    let mut payload = vec![0; options.len];
    let mut bytes = 0;
    let mut seq = 0;
    let mut next_send = start;

    while next_send < deadline {
        tokio::time::sleep_until(next_send).await;
        let header = DatagramHeader {
            seq,
            sent: Instant::now().saturating_duration_since(network_start),
        };
        header.write(&mut payload);
        if let Err(e) = socket.send_to(&payload, remote) {
            io.errln(&format!("write failed: {e}"));
            return 1;
        }

        bytes += payload.len() as u64;
        seq += 1;
        next_send += gap;
        reports.update(bytes);
    }

    let elapsed = start.elapsed();
    io.outln(&transfer_line(CLIENT_ID, 0.0, elapsed.as_secs_f64(), bytes));
    io.outln(&format!("[{CLIENT_ID:3}] Sent {seq} datagrams"));

    for _ in 0..FIN_RETRIES {
        let fin = DatagramHeader {
            seq: -seq - 1,
            sent: Instant::now().saturating_duration_since(network_start),
        };
        fin.write(&mut payload);
        socket.send_to(&payload, remote).ok();

        let retry_at = Instant::now() + FIN_RETRY_INTERVAL;
        while let Ok(Some(datagram)) = tokio::time::timeout_at(retry_at, socket.recv_from()).await {
            if datagram.source != remote {
                continue;
            }

            if let Some(report) = ServerReport::decode(&datagram.payload) {
                io.outln(&format!("[{CLIENT_ID:3}] Server Report:"));
                io.outln(&report.line(CLIENT_ID));
                return 0;
            }
        }
    }

    io.outln(&format!(
        "[{CLIENT_ID:3}] WARNING: did not receive ack of last datagram after {FIN_RETRIES} tries."
    ));
    0
}

fn transfer_line(id: u32, from: f64, to: f64, bytes: u64) -> String {
    let bits_per_sec = if to > from {
        bytes as f64 * 8.0 / (to - from)
    } else {
        0.0
    };

    format!(
        "[{id:3}] {from:4.1}-{to:4.1} sec  {}s  {}s/sec",
        format_bytes(bytes as f64),
        format_bits(bits_per_sec)
    )
}

/// Scales a quantity to the largest unit that keeps it below `base`, with iperf's precision
/// rules
fn format_quantity(mut value: f64, base: f64, units: [&str; 4]) -> String {
    let mut unit = 0;
    while value >= base && unit < units.len() - 1 {
        value /= base;
        unit += 1;
    }

    let number = if value < 9.995 {
        format!("{value:4.2}")
    } else if value < 99.95 {
        format!("{value:4.1}")
    } else {
        format!("{value:4.0}")
    };

    format!("{number} {}", units[unit])
}

fn format_bytes(bytes: f64) -> String {
    format_quantity(bytes, 1024.0, ["Byte", "KByte", "MByte", "GByte"])
}

fn format_bits(bits: f64) -> String {
    format_quantity(bits, 1000.0, ["bit", "Kbit", "Mbit", "Gbit"])
}

/// Formats a bandwidth the way iperf reports it (e.g. `941 Mbits/sec`)
pub fn format_bandwidth(bits_per_sec: f64) -> String {
    format!("{}s/sec", format_bits(bits_per_sec).trim_start())
}

/// `printf("%.2g")`, which is what iperf uses for loss percentages
fn format_percent(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if value >= 99.5 {
        return "1e+02".to_string();
    }

    let magnitude = value.log10().floor() as i32;
    let decimals = (1 - magnitude).max(0) as usize;
    let formatted = format!("{value:.decimals$}");
    if formatted.contains('.') {
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        formatted
    }
}

/// Bits per second, with decimal suffixes
fn parse_rate(s: &str) -> Option<f64> {
    let (number, multiplier) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1e3),
        'm' | 'M' => (&s[..s.len() - 1], 1e6),
        'g' | 'G' => (&s[..s.len() - 1], 1e9),
        _ => (s, 1.0),
    };

    let value: f64 = number.parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value * multiplier)
}

/// Bytes, with binary suffixes
fn parse_size(s: &str) -> Option<usize> {
    let (number, multiplier) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1024),
        'm' | 'M' => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };

    let value: usize = number.parse().ok()?;
    value.checked_mul(multiplier).filter(|&size| size > 0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_quantities() {
        assert_eq!(format_bytes(1.10 * 1024.0 * 1024.0 * 1024.0), "1.10 GByte");
        assert_eq!(format_bytes(212992.0), " 208 KByte");
        assert_eq!(format_bytes(65535.0), "64.0 KByte");
        assert_eq!(format_bits(941e6), " 941 Mbit");
        assert_eq!(format_bits(1.05e6), "1.05 Mbit");
        assert_eq!(format_bandwidth(941e6), "941 Mbits/sec");
        assert_eq!(format_bandwidth(9.6e6), "9.60 Mbits/sec");
    }

    #[test]
    fn test_transfer_line() {
        assert_eq!(
            transfer_line(3, 0.0, 10.0, 1_310_720),
            "[  3]  0.0-10.0 sec  1.25 MBytes  1.05 Mbits/sec"
        );
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(0.0), "0");
        assert_eq!(format_percent(12.34), "12");
        assert_eq!(format_percent(1.27), "1.3");
        assert_eq!(format_percent(0.5), "0.5");
        assert_eq!(format_percent(0.123), "0.12");
        assert_eq!(format_percent(100.0), "1e+02");
    }

    #[test]
    fn test_parse_rate_and_size() {
        assert_eq!(parse_rate("10M"), Some(10e6));
        assert_eq!(parse_rate("500k"), Some(500e3));
        assert_eq!(parse_rate("1000"), Some(1000.0));
        assert_eq!(parse_rate("fast"), None);
        assert_eq!(parse_size("128K"), Some(128 * 1024));
        assert_eq!(parse_size("1470"), Some(1470));
        assert_eq!(parse_size("0"), None);
        assert_eq!(parse_size(&format!("{}M", usize::MAX / 1024)), None);
        assert_eq!(parse_size(&format!("{}", usize::MAX)), Some(usize::MAX));
    }

    #[test]
    fn test_options() {
        let args = Args::try_parse_from(["iperf", "-c", "h2", "-b", "10M", "-t", "5"]).unwrap();
        let options = Options::from_args(&args).unwrap();
        assert!(options.udp);
        assert_eq!(options.len, UDP_DATAGRAM_LEN);
        assert_eq!(options.duration, Duration::from_secs(5));

        let args = Args::try_parse_from(["iperf", "-c", "h2", "-Z", "bbr"]).unwrap();
        assert!(Options::from_args(&args).is_err());

        let args = Args::try_parse_from(["iperf", "-c", "h2", "-Z", "reno"]).unwrap();
        let options = Options::from_args(&args).unwrap();
        assert_eq!(options.congestion, Some(CongestionAlgorithm::Reno));
        assert_eq!(options.len, TCP_BUFFER_LEN);
    }

    #[test]
    fn test_server_report_survives_the_wire() {
        let report = ServerReport {
            bytes: 1_310_720,
            elapsed: Duration::from_secs(10),
            jitter: 0.00001,
            lost: 3,
            total: 893,
        };
        let fin = DatagramHeader {
            seq: -894,
            sent: Duration::from_millis(10_500),
        };

        let payload = report.encode(&fin);
        assert_eq!(DatagramHeader::read(&payload), Some(fin));
        assert_eq!(ServerReport::decode(&payload), Some(report.clone()));
        assert_eq!(
            report.line(3),
            "[  3]  0.0-10.0 sec  1.25 MBytes  1.05 Mbits/sec   0.010 ms    3/  893 (0.34%)"
        );
    }
}
