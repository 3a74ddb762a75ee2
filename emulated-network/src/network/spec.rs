use crate::network::ip::Ipv4Cidr;
use anyhow::{Context, bail};
use pnet_base::MacAddr;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// A fully resolved network, ready to be instantiated
#[derive(Clone, Debug)]
pub struct NetworkSpec {
    pub nodes: Vec<NodeSpec>,
    pub links: Vec<LinkSpec>,
}

impl NetworkSpec {
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub interfaces: Vec<InterfaceSpec>,
    pub routes: Vec<RouteSpec>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Host,
    /// A host with IP forwarding enabled while the network runs
    Router,
    Switch,
}

impl NodeKind {
    pub fn has_ip_stack(self) -> bool {
        !matches!(self, NodeKind::Switch)
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Host => write!(f, "Host"),
            NodeKind::Router => write!(f, "LinuxRouter"),
            NodeKind::Switch => write!(f, "Switch"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InterfaceSpec {
    pub name: String,
    pub mac: MacAddr,
    pub address: Option<Ipv4Cidr>,
}

/// A static route, as given to `ip route add`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
    /// When missing, the interface is derived from the connected network of the gateway
    pub interface: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LinkSpec {
    pub id: String,
    pub endpoints: [EndpointSpec; 2],
    pub shaping: LinkShaping,
}

impl LinkSpec {
    pub fn touches(&self, node: &str) -> bool {
        self.endpoints.iter().any(|e| e.node == node)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSpec {
    pub node: String,
    pub interface: String,
}

/// Traffic shaping parameters, applied independently to each direction of a link
#[derive(Clone, Debug, PartialEq)]
pub struct LinkShaping {
    /// `None` means the link is not rate limited
    pub bandwidth_mbps: Option<f64>,
    pub delay: Duration,
    pub jitter: Duration,
    pub loss_percent: f64,
    pub max_queue_size: usize,
}

impl Default for LinkShaping {
    fn default() -> Self {
        Self {
            bandwidth_mbps: None,
            delay: Duration::ZERO,
            jitter: Duration::ZERO,
            loss_percent: 0.0,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

impl LinkShaping {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(bandwidth) = self.bandwidth_mbps {
            if !(bandwidth > 0.0 && bandwidth.is_finite()) {
                return Err(format!("bandwidth must be positive (got {bandwidth})"));
            }
        }

        if !(0.0..=100.0).contains(&self.loss_percent) {
            return Err(format!(
                "loss must be between 0 and 100 percent (got {})",
                self.loss_percent
            ));
        }

        if self.max_queue_size == 0 {
            return Err("max queue size must be at least one packet".to_string());
        }

        Ok(())
    }

    /// Time needed to put `size_bytes` on the wire
    pub fn serialization_time(&self, size_bytes: usize) -> Duration {
        match self.bandwidth_mbps {
            None => Duration::ZERO,
            Some(mbps) => {
                let bits = size_bytes as f64 * 8.0;
                Duration::from_nanos((bits * 1_000.0 / mbps).round() as u64)
            }
        }
    }

    /// Describes the parameters the way the framework logs them (e.g. `100.00Mbit 5ms delay`)
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(bandwidth) = self.bandwidth_mbps {
            parts.push(format!("{bandwidth:.2}Mbit"));
        }
        if !self.delay.is_zero() {
            parts.push(format!("{} delay", humantime::format_duration(self.delay)));
        }
        if !self.jitter.is_zero() {
            parts.push(format!("{} jitter", humantime::format_duration(self.jitter)));
        }
        if self.loss_percent > 0.0 {
            parts.push(format!("{:.5}% loss", self.loss_percent));
        }
        parts.join(" ")
    }
}

/// How links apply their shaping parameters
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LinkClass {
    /// Plain virtual ethernet pairs, which ignore any shaping parameters
    Plain,
    /// Links shaped with traffic control, honoring bandwidth, delay, jitter, loss and queue size
    #[default]
    Tc,
}

impl FromStr for LinkClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "link" => Ok(LinkClass::Plain),
            "tc" | "tclink" => Ok(LinkClass::Tc),
            _ => bail!("unknown link class `{s}` (expected `plain` or `tc`)"),
        }
    }
}

impl Display for LinkClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkClass::Plain => write!(f, "plain"),
            LinkClass::Tc => write!(f, "tc"),
        }
    }
}

/// Parses a delay the way `tc` does: bare numbers are microseconds, otherwise a unit is required
/// (`5ms`, `1.5s`, `200us`)
pub fn parse_delay(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if let Ok(micros) = s.parse::<f64>() {
        if micros < 0.0 {
            bail!("delay cannot be negative");
        }
        return Ok(Duration::from_nanos((micros * 1_000.0).round() as u64));
    }

    // Fractional values are not understood by humantime
    let split = s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    if value.contains('.') {
        let value: f64 = value
            .parse()
            .with_context(|| format!("invalid delay `{s}`"))?;
        let unit = humantime::parse_duration(&format!("1{unit}"))
            .with_context(|| format!("invalid delay unit in `{s}`"))?;
        return Ok(Duration::from_nanos(
            (unit.as_nanos() as f64 * value).round() as u64,
        ));
    }

    humantime::parse_duration(s).with_context(|| format!("invalid delay `{s}`"))
}

/// Parses a MAC address in the usual colon-separated notation
pub fn parse_mac(s: &str) -> anyhow::Result<MacAddr> {
    let octets: Vec<_> = s
        .split(':')
        .map(|octet| u8::from_str_radix(octet, 16))
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid mac address `{s}`"))?;

    let [a, b, c, d, e, f] = octets[..] else {
        bail!("invalid mac address `{s}` (expected six octets)");
    };

    Ok(MacAddr::new(a, b, c, d, e, f))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("5ms").unwrap(), Duration::from_millis(5));
        assert_eq!(parse_delay("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_delay("250").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_delay("1.5ms").unwrap(), Duration::from_micros(1500));
        assert!(parse_delay("-3").is_err());
        assert!(parse_delay("fast").is_err());
    }

    #[test]
    fn test_serialization_time() {
        let shaping = LinkShaping {
            bandwidth_mbps: Some(100.0),
            ..LinkShaping::default()
        };
        // 1514 bytes at 100 Mbit/s
        assert_eq!(
            shaping.serialization_time(1514),
            Duration::from_nanos(121_120)
        );
        assert_eq!(
            LinkShaping::default().serialization_time(1514),
            Duration::ZERO
        );
    }

    #[test]
    fn test_validate_shaping() {
        let mut shaping = LinkShaping::default();
        assert!(shaping.validate().is_ok());

        shaping.loss_percent = 101.0;
        assert!(shaping.validate().is_err());

        shaping.loss_percent = 1.0;
        shaping.bandwidth_mbps = Some(0.0);
        assert!(shaping.validate().is_err());
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("00:00:00:00:00:0a").unwrap(),
            MacAddr::new(0, 0, 0, 0, 0, 10)
        );
        assert!(parse_mac("00:00:00:00:00").is_err());
        assert!(parse_mac("zz:00:00:00:00:00").is_err());
    }

    #[test]
    fn test_describe_shaping() {
        let shaping = LinkShaping {
            bandwidth_mbps: Some(100.0),
            delay: Duration::from_millis(5),
            ..LinkShaping::default()
        };
        assert_eq!(shaping.describe(), "100.00Mbit 5ms delay");
    }
}
