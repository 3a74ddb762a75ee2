use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct NetworkStats {
    pub by_link: BTreeMap<Arc<str>, LinkStats>,
}

/// Counters of a link, summed over both directions
#[derive(Clone, Debug, Default)]
pub struct LinkStats {
    pub transmitted: PacketStats,
    pub delivered: PacketStats,
    pub dropped_random_loss: PacketStats,
    pub dropped_queue_full: PacketStats,
    pub dropped_link_down: PacketStats,
    pub max_queue_len: usize,
}

impl LinkStats {
    pub fn dropped(&self) -> PacketStats {
        let mut total = PacketStats::default();
        for stats in [
            &self.dropped_random_loss,
            &self.dropped_queue_full,
            &self.dropped_link_down,
        ] {
            total.packets += stats.packets;
            total.bytes += stats.bytes;
        }
        total
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PacketStats {
    pub packets: u64,
    pub bytes: usize,
}

impl PacketStats {
    pub fn track_one(&mut self, size_bytes: usize) {
        self.packets += 1;
        self.bytes += size_bytes;
    }
}
