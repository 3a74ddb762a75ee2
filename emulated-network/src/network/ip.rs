use anyhow::{Context, bail};
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 address together with its network prefix (e.g. `10.0.0.1/24`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    pub(crate) address: Ipv4Addr,
    pub(crate) network_prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(address: Ipv4Addr, network_prefix: u8) -> anyhow::Result<Self> {
        if network_prefix > 32 {
            bail!("network prefix /{network_prefix} is longer than 32 bits");
        }

        Ok(Self {
            address,
            network_prefix,
        })
    }

    /// The `0.0.0.0/0` range, used by default routes
    pub fn any() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            network_prefix: 0,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn network_prefix(&self) -> u8 {
        self.network_prefix
    }

    pub fn mask(&self) -> u32 {
        if self.network_prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.network_prefix)
        }
    }

    /// The network this address belongs to, with the host bits cleared
    pub fn network(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            address: Ipv4Addr::from_bits(self.address.to_bits() & self.mask()),
            network_prefix: self.network_prefix,
        }
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.address.to_bits() | !self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip.to_bits() & self.mask() == self.address.to_bits() & self.mask()
    }

    /// Returns the `n`th host address inside this network (`n = 1` is the first usable address)
    pub(crate) fn nth_host(&self, n: u32) -> Option<Ipv4Addr> {
        let host_bits = 32 - self.network_prefix as u32;
        let max_hosts = if host_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << host_bits).saturating_sub(2)
        };
        if n == 0 || n > max_hosts {
            return None;
        }

        let base = self.network().address.to_bits();
        Some(Ipv4Addr::from_bits(base + n))
    }
}

impl Display for Ipv4Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.network_prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    /// Parses `a.b.c.d/len`, where a missing length means a single address (`/32`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = match s.split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (s, None),
        };

        let address: Ipv4Addr = address
            .parse()
            .with_context(|| format!("`{address}` is not a valid IPv4 address"))?;
        let network_prefix = match prefix {
            Some(prefix) => prefix
                .parse()
                .with_context(|| format!("`{prefix}` is not a valid network prefix"))?,
            None => 32,
        };

        Self::new(address, network_prefix)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_network_and_broadcast() {
        let cases = [
            ("10.0.1.1/24", "10.0.1.0", "10.0.1.255"),
            ("10.100.0.2/30", "10.100.0.0", "10.100.0.3"),
            ("10.0.0.7/8", "10.0.0.0", "10.255.255.255"),
            ("172.20.5.9/12", "172.16.0.0", "172.31.255.255"),
            ("10.0.1.100/32", "10.0.1.100", "10.0.1.100"),
        ];

        for (input, network, broadcast) in cases {
            let cidr = Ipv4Cidr::from_str(input).unwrap();
            assert_eq!(cidr.network().address().to_string(), network);
            assert_eq!(cidr.broadcast().to_string(), broadcast);
        }
    }

    #[test]
    fn test_contains() {
        let cidr: Ipv4Cidr = "10.100.0.1/24".parse().unwrap();
        assert!(cidr.contains("10.100.0.200".parse().unwrap()));
        assert!(!cidr.contains("10.100.1.1".parse().unwrap()));
        assert!(Ipv4Cidr::any().contains("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_missing_prefix_is_host_route() {
        let cidr: Ipv4Cidr = "10.0.0.4".parse().unwrap();
        assert_eq!(cidr.network_prefix(), 32);
        assert_eq!(cidr.to_string(), "10.0.0.4/32");
    }

    #[test]
    fn test_invalid_inputs() {
        for input in ["", "10.0.0.0/33", "10.0.0.0/24/1", "10.0.0/24", "::1/64"] {
            assert!(Ipv4Cidr::from_str(input).is_err(), "{input} should fail");
        }
    }

    #[test]
    fn test_nth_host() {
        let base: Ipv4Cidr = "10.0.0.0/8".parse().unwrap();
        assert_eq!(base.nth_host(1), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(base.nth_host(256), Some("10.0.1.0".parse().unwrap()));

        let small: Ipv4Cidr = "192.168.0.0/30".parse().unwrap();
        assert_eq!(small.nth_host(2), Some("192.168.0.2".parse().unwrap()));
        assert_eq!(small.nth_host(3), None);
    }
}
