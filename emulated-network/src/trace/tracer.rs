use crate::network::frame::Frame;
use crate::trace::stats::{LinkStats, NetworkStats};
use crate::trace::step::{DropReason, FrameDropped, FrameOnLink, TraceStep, TraceStepKind};
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;

pub struct PacketTracer {
    start: Instant,
    record_steps: bool,
    recorded_steps: Mutex<Vec<TraceStep>>,
    stats_by_link: Mutex<BTreeMap<Arc<str>, LinkStats>>,
    already_warned_queue_full: Mutex<HashSet<Arc<str>>>,
}

impl PacketTracer {
    /// Creates a tracer whose timestamps are relative to `start`
    ///
    /// Statistics are always collected, individual steps only when `record_steps` is set
    pub fn new(start: Instant, record_steps: bool) -> Self {
        Self {
            start,
            record_steps,
            recorded_steps: Mutex::default(),
            stats_by_link: Mutex::default(),
            already_warned_queue_full: Mutex::default(),
        }
    }

    /// Makes the link show up in the statistics even if no frame ever crosses it
    pub(crate) fn register_link(&self, link_id: &Arc<str>) {
        self.stats_by_link.lock().entry(link_id.clone()).or_default();
    }

    pub fn steps(&self) -> Vec<TraceStep> {
        self.recorded_steps.lock().clone()
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            by_link: self.stats_by_link.lock().clone(),
        }
    }

    pub fn write_replay_log(&self, path: &Path) -> anyhow::Result<()> {
        let file = fs::File::create(path)
            .with_context(|| format!("failed to open {} for writing", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &*self.recorded_steps.lock())
            .context("failed to write replay log")
    }

    fn record(&self, kind: TraceStepKind) {
        if self.record_steps {
            self.recorded_steps.lock().push(TraceStep {
                relative_time: self.start.elapsed(),
                kind,
            });
        }
    }

    fn update_stats(&self, link_id: &Arc<str>, f: impl FnOnce(&mut LinkStats)) {
        let mut stats = self.stats_by_link.lock();
        f(stats.entry(link_id.clone()).or_default());
    }

    pub(crate) fn track_queue_len(&self, link_id: &Arc<str>, queue_len: usize) {
        self.update_stats(link_id, |stats| {
            stats.max_queue_len = stats.max_queue_len.max(queue_len)
        });
    }

    pub(crate) fn track_transmitted(&self, link_id: &Arc<str>, node_id: &Arc<str>, frame: &Frame) {
        let size = frame.wire_size();
        self.update_stats(link_id, |stats| stats.transmitted.track_one(size));
        self.record(TraceStepKind::FrameTransmitted(FrameOnLink {
            frame_id: frame.id,
            frame_size_bytes: size,
            node_id: node_id.clone(),
            link_id: link_id.clone(),
        }));
    }

    pub(crate) fn track_delivered(&self, link_id: &Arc<str>, node_id: &Arc<str>, frame: &Frame) {
        let size = frame.wire_size();
        self.update_stats(link_id, |stats| stats.delivered.track_one(size));
        self.record(TraceStepKind::FrameDelivered(FrameOnLink {
            frame_id: frame.id,
            frame_size_bytes: size,
            node_id: node_id.clone(),
            link_id: link_id.clone(),
        }));
    }

    pub(crate) fn track_dropped(
        &self,
        link_id: &Arc<str>,
        node_id: &Arc<str>,
        frame: &Frame,
        reason: DropReason,
    ) {
        let size = frame.wire_size();
        self.update_stats(link_id, |stats| match reason {
            DropReason::RandomLoss => stats.dropped_random_loss.track_one(size),
            DropReason::QueueFull => stats.dropped_queue_full.track_one(size),
            DropReason::LinkDown => stats.dropped_link_down.track_one(size),
        });
        self.record(TraceStepKind::FrameDropped(FrameDropped {
            frame_id: frame.id,
            node_id: node_id.clone(),
            link_id: link_id.clone(),
            reason,
        }));

        match reason {
            DropReason::QueueFull => {
                let first_dropped = self
                    .already_warned_queue_full
                    .lock()
                    .insert(link_id.clone());
                if first_dropped {
                    tracing::warn!(
                        node = %node_id,
                        link = %link_id,
                        "frame dropped because the egress queue was full (further drops on this link are only logged at debug level)"
                    );
                } else {
                    tracing::debug!(node = %node_id, link = %link_id, frame = %frame, "queue full");
                }
            }
            DropReason::RandomLoss => {
                tracing::debug!(node = %node_id, link = %link_id, frame = %frame, "frame lost");
            }
            DropReason::LinkDown => {
                tracing::debug!(node = %node_id, link = %link_id, frame = %frame, "link down");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::frame::{ArpOperation, ArpPacket, FramePayload};
    use pnet_base::MacAddr;
    use uuid::Uuid;

    fn frame() -> Frame {
        Frame {
            id: Uuid::from_u128(7),
            source: MacAddr::new(0, 0, 0, 0, 0, 1),
            destination: MacAddr::broadcast(),
            payload: FramePayload::Arp(ArpPacket {
                operation: ArpOperation::Request,
                sender_mac: MacAddr::new(0, 0, 0, 0, 0, 1),
                sender_ip: "10.0.0.1".parse().unwrap(),
                target_mac: MacAddr::zero(),
                target_ip: "10.0.0.2".parse().unwrap(),
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_steps() {
        let tracer = PacketTracer::new(Instant::now(), true);
        let link: Arc<str> = Arc::from("s1-s2");
        let node: Arc<str> = Arc::from("s1");
        tracer.register_link(&Arc::from("h1-s1"));

        tracer.track_transmitted(&link, &node, &frame());
        tracer.track_delivered(&link, &node, &frame());
        tracer.track_dropped(&link, &node, &frame(), DropReason::QueueFull);
        tracer.track_queue_len(&link, 3);
        tracer.track_queue_len(&link, 1);

        let stats = tracer.stats();
        assert_eq!(stats.by_link.len(), 2);
        let s1_s2 = &stats.by_link[&link];
        assert_eq!(s1_s2.transmitted.packets, 1);
        assert_eq!(s1_s2.transmitted.bytes, 60);
        assert_eq!(s1_s2.dropped().packets, 1);
        assert_eq!(s1_s2.max_queue_len, 3);

        let steps = tracer.steps();
        assert_eq!(steps.len(), 3);
        let json = serde_json::to_string(&steps[2]).unwrap();
        assert!(json.contains("\"type\":\"frameDropped\""), "{json}");
        assert!(json.contains("\"reason\":\"queue_full\""), "{json}");
    }
}
