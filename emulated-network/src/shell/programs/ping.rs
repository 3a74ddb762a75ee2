use crate::network::frame::{ICMP_HEADER_SIZE, IPV4_HEADER_SIZE, IcmpKind, MTU};
use crate::shell::io::Io;
use crate::shell::programs::{Invocation, ProgramFuture};
use crate::transport::TransportError;
use crate::transport::icmp::{IcmpReply, IcmpSocket};
use clap::Parser;
use futures::FutureExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_PAYLOAD_SIZE: usize = 56;
const DEFAULT_LINGER: Duration = Duration::from_secs(10);
const USAGE_FAILURE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "ping", about = "Sends ICMP echo requests to network hosts")]
struct Args {
    /// Stop after sending COUNT requests
    #[arg(short = 'c', value_name = "COUNT")]
    count: Option<u32>,
    /// Seconds between requests
    #[arg(short = 'i', value_name = "INTERVAL", default_value_t = 1.0)]
    interval: f64,
    /// Seconds to wait for outstanding replies after the last request
    #[arg(short = 'W', value_name = "TIMEOUT")]
    timeout: Option<f64>,
    /// Number of data bytes to send
    #[arg(short = 's', value_name = "SIZE", default_value_t = DEFAULT_PAYLOAD_SIZE)]
    size: usize,
    /// Numeric output only (names are never resolved)
    #[arg(short = 'n')]
    _numeric: bool,
    destination: String,
}

#[derive(Default)]
struct Statistics {
    transmitted: u32,
    received: u32,
    errors: u32,
    rtts: Vec<Duration>,
}

impl Statistics {
    fn summary(&self, elapsed: Duration) -> String {
        let loss = if self.transmitted == 0 {
            0.0
        } else {
            (self.transmitted - self.received) as f64 * 100.0 / self.transmitted as f64
        };

        let errors = if self.errors > 0 {
            format!(" +{} errors,", self.errors)
        } else {
            String::new()
        };

        let mut summary = format!(
            "{} packets transmitted, {} received,{errors} {}% packet loss, time {}ms",
            self.transmitted,
            self.received,
            format_loss(loss),
            elapsed.as_millis()
        );

        if !self.rtts.is_empty() {
            let millis: Vec<f64> = self.rtts.iter().map(|rtt| rtt.as_secs_f64() * 1000.0).collect();
            let min = millis.iter().copied().fold(f64::INFINITY, f64::min);
            let max = millis.iter().copied().fold(0.0, f64::max);
            let avg = millis.iter().sum::<f64>() / millis.len() as f64;
            let mean_square = millis.iter().map(|m| m * m).sum::<f64>() / millis.len() as f64;
            let mdev = (mean_square - avg * avg).max(0.0).sqrt();
            summary.push_str(&format!(
                "\nrtt min/avg/max/mdev = {min:.3}/{avg:.3}/{max:.3}/{mdev:.3} ms"
            ));
        }

        summary
    }
}

pub fn main(invocation: Invocation) -> ProgramFuture {
    async move {
        let args: Args = match invocation.parse_args() {
            Ok(args) => args,
            Err(status) => return status,
        };

        let io = &invocation.io;
        let Some(destination) = invocation.env.resolve(&args.destination) else {
            io.errln(&format!(
                "ping: {}: Name or service not known",
                args.destination
            ));
            return USAGE_FAILURE;
        };

        let (Ok(interval), Ok(linger)) = (
            Duration::try_from_secs_f64(args.interval),
            args.timeout
                .map_or(Ok(DEFAULT_LINGER), Duration::try_from_secs_f64),
        ) else {
            io.errln("ping: bad timing interval");
            return USAGE_FAILURE;
        };

        let mut socket = IcmpSocket::open(&invocation.node);
        io.outln(&format!(
            "PING {} ({destination}) {}({}) bytes of data.",
            args.destination,
            args.size,
            args.size + ICMP_HEADER_SIZE + IPV4_HEADER_SIZE
        ));

        let start = Instant::now();
        let mut statistics = Statistics::default();
        let mut sent_at: HashMap<u16, Instant> = HashMap::new();
        let mut sequence: u16 = 0;
        let mut next_send = Some(start);
        let mut linger_until = None;

        loop {
            if let Some(at) = next_send.filter(|at| Instant::now() >= *at) {
                sequence = sequence.wrapping_add(1);
                match socket.send_echo(destination, sequence, args.size) {
                    Ok(()) => {
                        sent_at.insert(sequence, Instant::now());
                    }
                    Err(TransportError::MessageTooLong) => {
                        io.errln(&format!("ping: local error: message too long, mtu={MTU}"));
                        statistics.errors += 1;
                    }
                    Err(e) if statistics.transmitted == 0 => {
                        io.errln(&format!("ping: connect: {e}"));
                        return USAGE_FAILURE;
                    }
                    Err(e) => io.errln(&format!("ping: sendmsg: {e}")),
                }

                statistics.transmitted += 1;
                if args.count.is_some_and(|count| statistics.transmitted >= count) {
                    next_send = None;
                    linger_until = Some(Instant::now() + linger);
                } else {
                    next_send = Some(at + interval);
                }
            }

            if let Some(count) = args.count {
                if statistics.received + statistics.errors >= count {
                    break;
                }
            }
            if linger_until.is_some_and(|until| Instant::now() >= until) {
                break;
            }

            let Some(wake_at) = next_send.or(linger_until) else {
                break;
            };
            tokio::select! {
                biased;
                reply = socket.recv() => match reply {
                    Some(reply) => on_reply(&reply, &mut sent_at, &mut statistics, io),
                    None => break,
                },
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }

        io.outln("");
        io.outln(&format!("--- {} ping statistics ---", args.destination));
        io.outln(&statistics.summary(start.elapsed()));

        if statistics.received > 0 { 0 } else { 1 }
    }
    .boxed()
}

fn on_reply(
    reply: &IcmpReply,
    sent_at: &mut HashMap<u16, Instant>,
    statistics: &mut Statistics,
    io: &Io,
) {
    let error = match reply.kind {
        IcmpKind::EchoReply => {
            let Some(sent) = sent_at.remove(&reply.sequence) else {
                return;
            };

            let rtt = reply.received_at.saturating_duration_since(sent);
            statistics.received += 1;
            statistics.rtts.push(rtt);
            io.outln(&format!(
                "{} bytes from {}: icmp_seq={} ttl={} time={} ms",
                reply.size,
                reply.source,
                reply.sequence,
                reply.ttl,
                format_rtt(rtt)
            ));
            return;
        }
        IcmpKind::NetUnreachable => "Destination Net Unreachable",
        IcmpKind::HostUnreachable => "Destination Host Unreachable",
        IcmpKind::PortUnreachable => "Destination Port Unreachable",
        IcmpKind::TimeExceeded => "Time to live exceeded",
        IcmpKind::EchoRequest => return,
    };

    statistics.errors += 1;
    io.outln(&format!(
        "From {} icmp_seq={} {error}",
        reply.source, reply.sequence
    ));
}

/// Fewer decimals as the round trip time grows, like iputils
fn format_rtt(rtt: Duration) -> String {
    let micros = rtt.as_micros();
    if micros >= 100_000 {
        format!("{}", micros / 1000)
    } else if micros >= 10_000 {
        format!("{}.{:01}", micros / 1000, (micros % 1000) / 100)
    } else if micros >= 1_000 {
        format!("{}.{:02}", micros / 1000, (micros % 1000) / 10)
    } else {
        format!("{}.{:03}", micros / 1000, micros % 1000)
    }
}

/// `printf("%g")`
fn format_loss(percent: f64) -> String {
    if percent == 0.0 {
        return "0".to_string();
    }

    let magnitude = percent.abs().log10().floor() as i32;
    let decimals = (5 - magnitude).max(0) as usize;
    let formatted = format!("{percent:.decimals$}");
    if formatted.contains('.') {
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        formatted
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_rtt() {
        assert_eq!(format_rtt(Duration::from_micros(52)), "0.052");
        assert_eq!(format_rtt(Duration::from_micros(1_234)), "1.23");
        assert_eq!(format_rtt(Duration::from_micros(20_456)), "20.4");
        assert_eq!(format_rtt(Duration::from_micros(123_456)), "123");
    }

    #[test]
    fn test_format_loss() {
        assert_eq!(format_loss(0.0), "0");
        assert_eq!(format_loss(100.0), "100");
        assert_eq!(format_loss(100.0 / 3.0), "33.3333");
        assert_eq!(format_loss(50.0), "50");
    }

    #[test]
    fn test_summary() {
        let statistics = Statistics {
            transmitted: 3,
            received: 2,
            errors: 0,
            rtts: vec![Duration::from_millis(10), Duration::from_millis(20)],
        };
        assert_eq!(
            statistics.summary(Duration::from_millis(2003)),
            "3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms\n\
             rtt min/avg/max/mdev = 10.000/15.000/20.000/5.000 ms"
        );

        let statistics = Statistics {
            transmitted: 2,
            received: 0,
            errors: 2,
            rtts: Vec::new(),
        };
        assert_eq!(
            statistics.summary(Duration::from_millis(1001)),
            "2 packets transmitted, 0 received, +2 errors, 100% packet loss, time 1001ms"
        );
    }
}
