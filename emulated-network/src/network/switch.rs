use pnet_base::MacAddr;
use std::collections::HashMap;

/// Forwarding database of a learning bridge
#[derive(Default)]
pub(crate) struct BridgeTable {
    ports_by_mac: HashMap<MacAddr, usize>,
}

/// Where a switch should send a frame
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Forwarding {
    Port(usize),
    /// Every port except the ingress one
    Flood,
    /// The destination lives behind the ingress port
    Filter,
}

impl BridgeTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Learns the source of the frame and decides where to forward it
    pub(crate) fn process(
        &mut self,
        source: MacAddr,
        destination: MacAddr,
        ingress_port: usize,
    ) -> Forwarding {
        if !is_group(source) {
            self.ports_by_mac.insert(source, ingress_port);
        }

        if is_group(destination) {
            return Forwarding::Flood;
        }

        match self.ports_by_mac.get(&destination) {
            Some(&port) if port == ingress_port => Forwarding::Filter,
            Some(&port) => Forwarding::Port(port),
            None => Forwarding::Flood,
        }
    }
}

// Broadcast and multicast addresses have the least significant bit of the first octet set
fn is_group(mac: MacAddr) -> bool {
    mac.0 & 0x01 != 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_learning() {
        let mut table = BridgeTable::new();
        let h1 = MacAddr::new(0, 0, 0, 0, 0, 1);
        let h2 = MacAddr::new(0, 0, 0, 0, 0, 2);

        // Unknown destinations and broadcasts are flooded
        assert_eq!(table.process(h1, h2, 0), Forwarding::Flood);
        assert_eq!(
            table.process(h2, MacAddr::broadcast(), 1),
            Forwarding::Flood
        );

        // Both hosts are known by now
        assert_eq!(table.process(h1, h2, 0), Forwarding::Port(1));
        assert_eq!(table.process(h2, h1, 1), Forwarding::Port(0));

        // Frames for a host behind the ingress port are not sent back
        assert_eq!(table.process(h2, h1, 0), Forwarding::Filter);
    }
}
