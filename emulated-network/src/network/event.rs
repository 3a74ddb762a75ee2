use crate::network::link::LinkStatus;
use crate::network::spec::LinkShaping;
use std::collections::HashMap;
use std::time::Duration;

/// Scheduled link updates, relative to the moment the network starts
#[derive(Default)]
pub struct NetworkEvents {
    pub(crate) sorted_events: Vec<NetworkEvent>,
    pub(crate) initial_link_statuses: HashMap<String, LinkStatus>,
}

impl NetworkEvents {
    pub fn new(mut events: Vec<NetworkEvent>) -> Self {
        events.sort_by_key(|e| e.relative_time);
        let initial_link_statuses = initial_statuses(&events);
        Self {
            sorted_events: events,
            initial_link_statuses,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_events.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct NetworkEvent {
    pub relative_time: Duration,
    pub payload: NetworkEventPayload,
}

#[derive(Clone, Debug, Default)]
pub struct NetworkEventPayload {
    pub link_id: String,
    pub status: Option<UpdateLinkStatus>,
    pub bandwidth_mbps: Option<f64>,
    pub delay: Option<Duration>,
    pub jitter: Option<Duration>,
    pub loss_percent: Option<f64>,
    pub max_queue_size: Option<usize>,
}

impl NetworkEventPayload {
    pub(crate) fn changes_shaping(&self) -> bool {
        self.bandwidth_mbps.is_some()
            || self.delay.is_some()
            || self.jitter.is_some()
            || self.loss_percent.is_some()
            || self.max_queue_size.is_some()
    }

    pub(crate) fn apply_to(&self, shaping: &mut LinkShaping) {
        if let Some(bandwidth_mbps) = self.bandwidth_mbps {
            shaping.bandwidth_mbps = Some(bandwidth_mbps);
        }
        if let Some(delay) = self.delay {
            shaping.delay = delay;
        }
        if let Some(jitter) = self.jitter {
            shaping.jitter = jitter;
        }
        if let Some(loss_percent) = self.loss_percent {
            shaping.loss_percent = loss_percent;
        }
        if let Some(max_queue_size) = self.max_queue_size {
            shaping.max_queue_size = max_queue_size;
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateLinkStatus {
    Up,
    Down,
}

/// A link whose first scheduled change brings it up must start down, and the other way around
fn initial_statuses(sorted_events: &[NetworkEvent]) -> HashMap<String, LinkStatus> {
    let mut statuses = HashMap::new();
    for event in sorted_events {
        let Some(status) = event.payload.status else {
            continue;
        };

        statuses
            .entry(event.payload.link_id.clone())
            .or_insert(match status {
                UpdateLinkStatus::Up => LinkStatus::Down,
                UpdateLinkStatus::Down => LinkStatus::Up,
            });
    }

    statuses
}

#[cfg(test)]
mod test {
    use super::*;

    fn status_event(secs: u64, link_id: &str, status: UpdateLinkStatus) -> NetworkEvent {
        NetworkEvent {
            relative_time: Duration::from_secs(secs),
            payload: NetworkEventPayload {
                link_id: link_id.to_string(),
                status: Some(status),
                ..NetworkEventPayload::default()
            },
        }
    }

    #[test]
    fn test_initial_statuses() {
        let events = NetworkEvents::new(vec![
            status_event(5, "s1-s2", UpdateLinkStatus::Down),
            status_event(2, "s1-s2", UpdateLinkStatus::Up),
            status_event(3, "h1-s1", UpdateLinkStatus::Down),
        ]);

        assert_eq!(events.sorted_events[0].relative_time, Duration::from_secs(2));
        assert_eq!(
            events.initial_link_statuses["s1-s2"],
            LinkStatus::Down
        );
        assert_eq!(events.initial_link_statuses["h1-s1"], LinkStatus::Up);
    }

    #[test]
    fn test_apply_shaping() {
        let mut shaping = LinkShaping::default();
        let payload = NetworkEventPayload {
            link_id: "s1-s2".to_string(),
            delay: Some(Duration::from_millis(20)),
            loss_percent: Some(5.0),
            ..NetworkEventPayload::default()
        };

        assert!(payload.changes_shaping());
        payload.apply_to(&mut shaping);
        assert_eq!(shaping.delay, Duration::from_millis(20));
        assert_eq!(shaping.loss_percent, 5.0);
        assert_eq!(shaping.bandwidth_mbps, None);
    }
}
