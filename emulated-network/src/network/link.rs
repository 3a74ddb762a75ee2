use crate::network::NetworkContext;
use crate::network::event::UpdateLinkStatus;
use crate::network::frame::Frame;
use crate::network::inbound_queue::InboundQueue;
use crate::network::node::Node;
use crate::network::spec::{EndpointSpec, LinkClass, LinkShaping, LinkSpec};
use crate::pcap_exporter::CaptureTaps;
use crate::trace::step::DropReason;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
}

impl LinkStatus {
    pub fn is_up(self) -> bool {
        self == LinkStatus::Up
    }
}

/// A full-duplex link between two interfaces
///
/// Each direction shapes its own traffic: frames wait in a drop-tail queue, are serialized at the
/// link's bandwidth and then propagate for the link's delay (plus jitter) before reaching the
/// other end.
pub struct NetworkLink {
    pub id: Arc<str>,
    pub endpoints: [EndpointSpec; 2],
    pub class: LinkClass,
    /// `directions[i]` carries the frames sent by `endpoints[i]`
    pub(crate) directions: [Arc<LinkDirection>; 2],
    /// Set once the plain class has warned that it drops this link's shaping
    shaping_warned: AtomicBool,
}

/// One end of a link, as seen by the node that sends frames through it
pub(crate) struct LinkEnd {
    pub(crate) node: Weak<Node>,
    pub(crate) node_name: Arc<str>,
    pub(crate) port: usize,
    pub(crate) taps: Arc<CaptureTaps>,
}

impl NetworkLink {
    pub(crate) fn new(
        spec: &LinkSpec,
        class: LinkClass,
        ctx: &Arc<NetworkContext>,
        ends: [LinkEnd; 2],
        initial_status: LinkStatus,
    ) -> Self {
        let id: Arc<str> = Arc::from(spec.id.as_str());
        let shaping_warned = class == LinkClass::Plain && !spec.shaping.is_default();
        let shaping = match class {
            LinkClass::Tc => spec.shaping.clone(),
            LinkClass::Plain => {
                if shaping_warned {
                    tracing::warn!(
                        link = %id,
                        "the plain link class ignores shaping parameters ({})",
                        spec.shaping.describe()
                    );
                }
                LinkShaping::default()
            }
        };

        let [a, b] = ends;
        let directions = [
            Arc::new(LinkDirection::new(&id, ctx, &a, &b, &shaping, initial_status)),
            Arc::new(LinkDirection::new(&id, ctx, &b, &a, &shaping, initial_status)),
        ];

        ctx.tracer.register_link(&id);

        Self {
            id,
            endpoints: spec.endpoints.clone(),
            class,
            directions,
            shaping_warned: AtomicBool::new(shaping_warned),
        }
    }

    pub(crate) fn spawn_tasks(&self, cancellation_token: &CancellationToken) {
        for direction in &self.directions {
            tokio::spawn(direction.clone().run_transmitter(cancellation_token.clone()));
            tokio::spawn(direction.clone().run_delivery(cancellation_token.clone()));
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.directions[0].state.lock().status
    }

    pub fn shaping(&self) -> LinkShaping {
        self.directions[0].state.lock().shaping.clone()
    }

    pub fn connects(&self, a: &str, b: &str) -> bool {
        let [x, y] = &self.endpoints;
        (x.node == a && y.node == b) || (x.node == b && y.node == a)
    }

    pub(crate) fn update_status(&self, update: UpdateLinkStatus) {
        for direction in &self.directions {
            direction.update_status(update);
        }
    }

    /// Changes the shaping parameters of both directions
    pub(crate) fn update_shaping(&self, update: impl Fn(&mut LinkShaping)) {
        if self.class == LinkClass::Plain {
            if !self.shaping_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(link = %self.id, "the plain link class ignores shaping updates");
            }
            return;
        }

        for direction in &self.directions {
            update(&mut direction.state.lock().shaping);
        }
    }
}

pub(crate) struct LinkDirection {
    link_id: Arc<str>,
    source_node: Arc<str>,
    ctx: Arc<NetworkContext>,
    /// Captures on the sending interface, which see frames as their transmission starts
    source_taps: Arc<CaptureTaps>,
    target: Weak<Node>,
    target_node: Arc<str>,
    target_port: usize,
    state: Mutex<DirectionState>,
    in_transit: Mutex<InboundQueue>,
    notify_enqueued: Notify,
    notify_in_transit: Notify,
}

struct DirectionState {
    shaping: LinkShaping,
    status: LinkStatus,
    last_down: Option<Instant>,
    queue: VecDeque<Frame>,
    /// The transmitter is serializing a frame until this instant
    busy_until: Instant,
}

impl DirectionState {
    fn was_down_after(&self, instant: Instant) -> bool {
        matches!(self.last_down, Some(down) if down > instant)
    }
}

impl LinkDirection {
    fn new(
        link_id: &Arc<str>,
        ctx: &Arc<NetworkContext>,
        source: &LinkEnd,
        target: &LinkEnd,
        shaping: &LinkShaping,
        status: LinkStatus,
    ) -> Self {
        Self {
            link_id: link_id.clone(),
            source_node: source.node_name.clone(),
            ctx: ctx.clone(),
            source_taps: source.taps.clone(),
            target: target.node.clone(),
            target_node: target.node_name.clone(),
            target_port: target.port,
            state: Mutex::new(DirectionState {
                shaping: shaping.clone(),
                status,
                last_down: None,
                queue: VecDeque::new(),
                busy_until: Instant::now(),
            }),
            in_transit: Mutex::new(InboundQueue::new()),
            notify_enqueued: Notify::new(),
            notify_in_transit: Notify::new(),
        }
    }

    pub(crate) fn link_id(&self) -> &Arc<str> {
        &self.link_id
    }

    /// Hands a frame to the link, which may drop it right away
    pub(crate) fn enqueue(&self, frame: Frame) {
        let tracer = &self.ctx.tracer;
        let mut state = self.state.lock();

        if !state.status.is_up() {
            tracer.track_dropped(&self.link_id, &self.source_node, &frame, DropReason::LinkDown);
            return;
        }

        let loss_percent = state.shaping.loss_percent;
        if loss_percent > 0.0 && self.ctx.rng.lock().f64() * 100.0 < loss_percent {
            tracer.track_dropped(
                &self.link_id,
                &self.source_node,
                &frame,
                DropReason::RandomLoss,
            );
            return;
        }

        if state.queue.len() >= state.shaping.max_queue_size {
            tracer.track_dropped(&self.link_id, &self.source_node, &frame, DropReason::QueueFull);
            return;
        }

        if state.queue.is_empty() {
            // An idle transmitter can start right away
            state.busy_until = state.busy_until.max(Instant::now());
        }

        state.queue.push_back(frame);
        tracer.track_queue_len(&self.link_id, state.queue.len());
        drop(state);

        self.notify_enqueued.notify_one();
    }

    fn update_status(&self, update: UpdateLinkStatus) {
        let mut state = self.state.lock();
        match (state.status, update) {
            (LinkStatus::Up, UpdateLinkStatus::Down) => {
                state.status = LinkStatus::Down;
                state.last_down = Some(Instant::now());

                // Frames waiting for the transmitter are gone with the link, frames already in
                // flight will be dropped on arrival
                for frame in std::mem::take(&mut state.queue) {
                    self.ctx.tracer.track_dropped(
                        &self.link_id,
                        &self.source_node,
                        &frame,
                        DropReason::LinkDown,
                    );
                }
            }
            (LinkStatus::Down, UpdateLinkStatus::Up) => {
                state.status = LinkStatus::Up;
            }
            // No update
            (LinkStatus::Up, UpdateLinkStatus::Up) | (LinkStatus::Down, UpdateLinkStatus::Down) => {}
        }
    }

    /// Starts transmitting queued frames, returning when the transmitter will be free again (if
    /// frames are still waiting)
    fn transmit_ready_frames(&self, now: Instant) -> Option<Instant> {
        let mut state = self.state.lock();
        loop {
            if state.queue.is_empty() {
                return None;
            }

            if state.busy_until > now {
                return Some(state.busy_until);
            }

            let frame = state.queue.pop_front()?;
            let start = state.busy_until;
            let serialization_time = state.shaping.serialization_time(frame.wire_size());
            state.busy_until = start + serialization_time;

            let propagation = self.propagation_delay(&state.shaping);
            let arrival = start + serialization_time + propagation;

            self.source_taps.record(start, &frame);
            self.ctx
                .tracer
                .track_transmitted(&self.link_id, &self.source_node, &frame);
            self.in_transit.lock().send(frame, start, arrival);
            self.notify_in_transit.notify_one();
        }
    }

    /// Delay plus a uniformly distributed jitter, which may reorder frames as netem does
    fn propagation_delay(&self, shaping: &LinkShaping) -> Duration {
        if shaping.jitter.is_zero() {
            return shaping.delay;
        }

        let jitter_nanos = shaping.jitter.as_nanos() as f64;
        let offset = (self.ctx.rng.lock().f64() * 2.0 - 1.0) * jitter_nanos;
        let delay_nanos = (shaping.delay.as_nanos() as f64 + offset).max(0.0);
        Duration::from_nanos(delay_nanos.round() as u64)
    }

    async fn run_transmitter(self: Arc<Self>, cancellation_token: CancellationToken) {
        loop {
            match self.transmit_ready_frames(Instant::now()) {
                Some(free_at) => {
                    tokio::select! {
                        biased;
                        _ = cancellation_token.cancelled() => return,
                        _ = tokio::time::sleep_until(free_at) => {}
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = cancellation_token.cancelled() => return,
                        _ = self.notify_enqueued.notified() => {}
                    }
                }
            }
        }
    }

    async fn run_delivery(self: Arc<Self>, cancellation_token: CancellationToken) {
        loop {
            let now = Instant::now();
            let (delivered, next_arrival) = {
                let mut in_transit = self.in_transit.lock();
                let delivered = in_transit.receive(now);
                (delivered, in_transit.time_of_next_receive())
            };

            for delivered in delivered {
                let dropped = {
                    let state = self.state.lock();
                    !state.status.is_up() || state.was_down_after(delivered.transmitted)
                };

                if dropped {
                    self.ctx.tracer.track_dropped(
                        &self.link_id,
                        &self.source_node,
                        &delivered.frame,
                        DropReason::LinkDown,
                    );
                    continue;
                }

                self.ctx
                    .tracer
                    .track_delivered(&self.link_id, &self.target_node, &delivered.frame);
                if let Some(target) = self.target.upgrade() {
                    target.receive(self.target_port, delivered.frame, delivered.arrival);
                }
            }

            match next_arrival {
                Some(arrival) => {
                    tokio::select! {
                        biased;
                        _ = cancellation_token.cancelled() => return,
                        _ = tokio::time::sleep_until(arrival) => {}
                        // Jitter may schedule a new frame before the current head of the queue
                        _ = self.notify_in_transit.notified() => {}
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = cancellation_token.cancelled() => return,
                        _ = self.notify_in_transit.notified() => {}
                    }
                }
            }
        }
    }
}
