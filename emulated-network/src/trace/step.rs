use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, DurationNanoSeconds, serde_as};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceStep {
    #[serde_as(as = "DurationNanoSeconds")]
    #[serde(rename = "relative_time_ns")]
    pub relative_time: Duration,
    #[serde(flatten)]
    pub kind: TraceStepKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "data")]
pub enum TraceStepKind {
    /// The frame started being serialized onto a link
    FrameTransmitted(FrameOnLink),
    /// The frame was dropped by a link
    FrameDropped(FrameDropped),
    /// The frame reached the node at the other end of a link
    FrameDelivered(FrameOnLink),
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameOnLink {
    #[serde_as(as = "DisplayFromStr")]
    pub frame_id: Uuid,
    pub frame_size_bytes: usize,
    #[serde(with = "crate::util::serde_arc_str")]
    pub node_id: Arc<str>,
    #[serde(with = "crate::util::serde_arc_str")]
    pub link_id: Arc<str>,
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameDropped {
    #[serde_as(as = "DisplayFromStr")]
    pub frame_id: Uuid,
    #[serde(with = "crate::util::serde_arc_str")]
    pub node_id: Arc<str>,
    #[serde(with = "crate::util::serde_arc_str")]
    pub link_id: Arc<str>,
    pub reason: DropReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Random loss configured on the link
    RandomLoss,
    /// The egress queue of the link was full
    QueueFull,
    /// The link was down when the frame was sent or while it was in flight
    LinkDown,
}
