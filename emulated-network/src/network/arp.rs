use crate::network::frame::Ipv4Packet;
use pnet_base::MacAddr;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum time between two requests for the same address
pub const ARP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Packets waiting for a neighbor to be resolved, beyond which the oldest ones get dropped
const MAX_PENDING_PACKETS: usize = 100;

pub(crate) struct ArpCache {
    entries: BTreeMap<Ipv4Addr, ArpEntry>,
}

struct ArpEntry {
    interface: Arc<str>,
    port: usize,
    state: ArpState,
}

enum ArpState {
    Resolved(MacAddr),
    Incomplete {
        pending: VecDeque<Ipv4Packet>,
        last_request: Instant,
    },
}

/// A neighbor, as shown by `arp -n` and `ip neigh`
pub struct Neighbor {
    pub address: Ipv4Addr,
    pub interface: Arc<str>,
    /// `None` while the address is still being resolved
    pub mac: Option<MacAddr>,
}

/// The outcome of queueing a packet for an unresolved neighbor
pub(crate) struct Queued {
    pub(crate) send_request: bool,
    pub(crate) dropped: Option<Ipv4Packet>,
}

impl ArpCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn lookup(&self, address: Ipv4Addr) -> Option<MacAddr> {
        match self.entries.get(&address)?.state {
            ArpState::Resolved(mac) => Some(mac),
            ArpState::Incomplete { .. } => None,
        }
    }

    /// Holds on to a packet until `address` is resolved
    pub(crate) fn queue(
        &mut self,
        address: Ipv4Addr,
        interface: &Arc<str>,
        port: usize,
        packet: Ipv4Packet,
        now: Instant,
    ) -> Queued {
        let entry = match self.entries.entry(address) {
            Entry::Vacant(vacant) => {
                vacant.insert(ArpEntry {
                    interface: interface.clone(),
                    port,
                    state: ArpState::Incomplete {
                        pending: VecDeque::from([packet]),
                        last_request: now,
                    },
                });
                return Queued {
                    send_request: true,
                    dropped: None,
                };
            }
            Entry::Occupied(occupied) => occupied.into_mut(),
        };

        let ArpState::Incomplete {
            pending,
            last_request,
        } = &mut entry.state
        else {
            // Already resolved, so the caller can send right away
            return Queued {
                send_request: false,
                dropped: Some(packet),
            };
        };

        pending.push_back(packet);
        let dropped = if pending.len() > MAX_PENDING_PACKETS {
            pending.pop_front()
        } else {
            None
        };

        let retry = now.saturating_duration_since(*last_request) >= ARP_RETRY_INTERVAL;
        if retry {
            *last_request = now;
        }

        Queued {
            send_request: retry,
            dropped,
        }
    }

    /// Records the MAC address of a neighbor, returning the packets that were waiting for it
    ///
    /// Unknown neighbors are only added when `create` is set, like the kernel does for requests
    /// addressed to us.
    pub(crate) fn learn(
        &mut self,
        address: Ipv4Addr,
        mac: MacAddr,
        interface: &Arc<str>,
        port: usize,
        create: bool,
    ) -> (usize, Vec<Ipv4Packet>) {
        let Some(entry) = self.entries.get_mut(&address) else {
            if create {
                self.entries.insert(
                    address,
                    ArpEntry {
                        interface: interface.clone(),
                        port,
                        state: ArpState::Resolved(mac),
                    },
                );
            }
            return (port, Vec::new());
        };

        let previous = std::mem::replace(&mut entry.state, ArpState::Resolved(mac));
        let pending = match previous {
            ArpState::Resolved(_) => Vec::new(),
            ArpState::Incomplete { pending, .. } => pending.into(),
        };
        (entry.port, pending)
    }

    pub(crate) fn neighbors(&self) -> Vec<Neighbor> {
        self.entries
            .iter()
            .map(|(address, entry)| Neighbor {
                address: *address,
                interface: entry.interface.clone(),
                mac: match entry.state {
                    ArpState::Resolved(mac) => Some(mac),
                    ArpState::Incomplete { .. } => None,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::frame::{IcmpKind, IcmpMessage, IpPayload};

    fn packet(sequence: u16) -> Ipv4Packet {
        Ipv4Packet {
            source: "10.0.0.1".parse().unwrap(),
            destination: "10.0.0.2".parse().unwrap(),
            ttl: 64,
            payload: IpPayload::Icmp(IcmpMessage {
                kind: IcmpKind::EchoRequest,
                identifier: 1,
                sequence,
                data: Vec::new(),
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_packets_are_released_on_reply() {
        let mut cache = ArpCache::new();
        let interface: Arc<str> = Arc::from("h1-eth0");
        let neighbor: Ipv4Addr = "10.0.0.2".parse().unwrap();

        let first = cache.queue(neighbor, &interface, 0, packet(1), Instant::now());
        assert!(first.send_request);
        let second = cache.queue(neighbor, &interface, 0, packet(2), Instant::now());
        assert!(!second.send_request);

        // Requests are repeated once the retry interval has passed
        tokio::time::sleep(ARP_RETRY_INTERVAL).await;
        let third = cache.queue(neighbor, &interface, 0, packet(3), Instant::now());
        assert!(third.send_request);

        let mac = MacAddr::new(0, 0, 0, 0, 0, 2);
        let (port, released) = cache.learn(neighbor, mac, &interface, 0, false);
        assert_eq!(port, 0);
        assert_eq!(released.len(), 3);
        assert_eq!(cache.lookup(neighbor), Some(mac));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_replies_only_create_entries_when_asked() {
        let mut cache = ArpCache::new();
        let interface: Arc<str> = Arc::from("h1-eth0");
        let neighbor: Ipv4Addr = "10.0.0.3".parse().unwrap();
        let mac = MacAddr::new(0, 0, 0, 0, 0, 3);

        cache.learn(neighbor, mac, &interface, 0, false);
        assert_eq!(cache.lookup(neighbor), None);

        cache.learn(neighbor, mac, &interface, 0, true);
        assert_eq!(cache.lookup(neighbor), Some(mac));
        assert_eq!(cache.neighbors().len(), 1);
    }
}
