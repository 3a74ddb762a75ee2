use crate::network::frame::Frame;
use std::collections::BinaryHeap;
use tokio::time::Instant;

/// Frames that have left the transmitter of a link and are propagating towards the other end
pub struct InboundQueue {
    queue: BinaryHeap<PrioritizedFrame>,
    next_number: u64,
}

impl InboundQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            next_number: 0,
        }
    }

    pub(crate) fn send(&mut self, frame: Frame, transmitted: Instant, arrival: Instant) {
        let number = self.next_number;
        self.next_number += 1;
        self.queue.push(PrioritizedFrame {
            frame,
            transmitted,
            arrival,
            number,
        });
    }

    pub(crate) fn time_of_next_receive(&self) -> Option<Instant> {
        self.queue.peek().map(|next| next.arrival)
    }

    /// Removes every frame that has arrived by `now`, in arrival order
    pub(crate) fn receive(&mut self, now: Instant) -> Vec<DeliveredFrame> {
        let mut delivered = Vec::new();
        while self.queue.peek().is_some_and(|next| next.arrival <= now) {
            let Some(next) = self.queue.pop() else {
                break;
            };

            delivered.push(DeliveredFrame {
                frame: next.frame,
                transmitted: next.transmitted,
                arrival: next.arrival,
            });
        }

        delivered
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.len()
    }
}

pub struct DeliveredFrame {
    pub(crate) frame: Frame,
    pub(crate) transmitted: Instant,
    pub(crate) arrival: Instant,
}

// In transit frame, sorted by arrival time (ties are broken by transmission order)
struct PrioritizedFrame {
    frame: Frame,
    transmitted: Instant,
    arrival: Instant,
    number: u64,
}

impl Eq for PrioritizedFrame {}

impl PartialEq<Self> for PrioritizedFrame {
    fn eq(&self, other: &Self) -> bool {
        self.arrival == other.arrival && self.number == other.number
    }
}

impl PartialOrd<Self> for PrioritizedFrame {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedFrame {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Note: the order is reversed, so the "max" frame will be the next one to arrive
        other
            .arrival
            .cmp(&self.arrival)
            .then(other.number.cmp(&self.number))
    }
}
