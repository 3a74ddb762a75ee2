//! State machine of a single TCP connection
//!
//! Stream positions are tracked as 64-bit offsets and only turned into 32-bit sequence numbers
//! when building segments. Offset 0 is the first data byte; our FIN takes the offset right after
//! the last data byte.

use crate::network::frame::{DEFAULT_TTL, IpPayload, Ipv4Packet, TcpFlags, TcpSegment};
use crate::network::node::Node;
use crate::transport::TransportError;
use crate::transport::tcp::ListenerShared;
use crate::transport::tcp::congestion::{CongestionAlgorithm, CongestionControl};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddrV4;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const MSS: u64 = 1460;
/// Largest window we can advertise without window scaling, which is also the size of the
/// receive and send buffers
pub const WINDOW: u16 = u16::MAX;
pub const RECV_BUFFER_SIZE: usize = WINDOW as usize;
pub const SEND_BUFFER_SIZE: usize = WINDOW as usize;

const SYN_RETRIES: u32 = 6;
const SYNACK_RETRIES: u32 = 5;
const DATA_RETRIES: u32 = 15;
const DUPLICATE_ACK_THRESHOLD: u32 = 3;

const INITIAL_RTO: Duration = Duration::from_secs(1);
const MIN_RTO: Duration = Duration::from_millis(200);
const MAX_RTO: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    SynSent,
    SynReceived,
    Established,
    Closed,
}

pub(crate) struct Connection {
    pub(crate) key: ConnectionKey,
    node: Weak<Node>,
    tcb: Mutex<Tcb>,
    /// Wakes up readers, writers and the handshake
    state_changed: Notify,
    /// Wakes up the retransmission timer task
    timer_changed: Notify,
}

/// RTO computation from RFC 6298
struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
}

impl RttEstimator {
    fn new() -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: INITIAL_RTO,
        }
    }

    fn on_sample(&mut self, rtt: Duration) {
        let srtt = match self.srtt {
            None => {
                self.rttvar = rtt / 2;
                rtt
            }
            Some(srtt) => {
                let deviation = srtt.abs_diff(rtt);
                self.rttvar = self.rttvar * 3 / 4 + deviation / 4;
                srtt * 7 / 8 + rtt / 8
            }
        };

        self.srtt = Some(srtt);
        self.rto = (srtt + (self.rttvar * 4).max(Duration::from_millis(1))).clamp(MIN_RTO, MAX_RTO);
    }

    fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
    }

    fn srtt(&self) -> Duration {
        self.srtt.unwrap_or(INITIAL_RTO)
    }
}

struct Tcb {
    state: TcpState,
    error: Option<TransportError>,
    /// The application no longer holds the connection
    detached: bool,
    listener: Option<Weak<ListenerShared>>,
    iss: u32,
    irs: u32,

    // Sender
    /// Data that is unacknowledged or not sent yet, starting at `buffer_start`
    send_buffer: VecDeque<u8>,
    buffer_start: u64,
    snd_una: u64,
    snd_nxt: u64,
    /// Highest offset ever sent (`snd_nxt` goes back after a timeout)
    snd_max: u64,
    /// Window advertised by the peer
    snd_wnd: u64,
    /// Set while probing a zero window
    persist: bool,
    fin_queued: bool,

    // Receiver
    rcv_nxt: u64,
    recv_buffer: VecDeque<u8>,
    out_of_order: BTreeMap<u64, Vec<u8>>,
    peer_fin: Option<u64>,
    fin_received: bool,

    // Loss recovery
    cc: Box<dyn CongestionControl>,
    rtt: RttEstimator,
    /// End offset and send time of the segment being timed
    rtt_sample: Option<(u64, Instant)>,
    duplicate_acks: u32,
    /// Set while in NewReno fast recovery
    recover: Option<u64>,
    window_inflation: u64,
    rto_deadline: Option<Instant>,
    retries: u32,
    handshake_sent_at: Instant,
}

impl Tcb {
    fn data_end(&self) -> u64 {
        self.buffer_start + self.send_buffer.len() as u64
    }

    fn fin_acked(&self) -> bool {
        self.fin_queued && self.snd_una > self.data_end()
    }

    fn all_acked(&self) -> bool {
        self.snd_una >= self.data_end() + u64::from(self.fin_queued)
    }

    fn local_seq(&self, offset: u64) -> u32 {
        self.iss.wrapping_add(1).wrapping_add(offset as u32)
    }

    fn remote_seq(&self, offset: u64) -> u32 {
        self.irs.wrapping_add(1).wrapping_add(offset as u32)
    }

    /// Maps a sequence number to an offset, using a nearby offset as reference
    fn offset_of(seq: u32, reference_seq: u32, reference: u64) -> i64 {
        reference as i64 + i64::from(seq.wrapping_sub(reference_seq) as i32)
    }

    /// Free space of the receive buffer, advertised as the full window while the buffer is at
    /// most half full (so that acks of in-order data carry the same window)
    fn rcv_wnd(&self) -> u16 {
        let free = RECV_BUFFER_SIZE.saturating_sub(self.recv_buffer.len());
        if free >= RECV_BUFFER_SIZE / 2 {
            WINDOW
        } else {
            free as u16
        }
    }

    fn segment(&self, key: &ConnectionKey, offset: u64, payload: Vec<u8>, flags: TcpFlags) -> TcpSegment {
        TcpSegment {
            source_port: key.local.port(),
            destination_port: key.remote.port(),
            sequence: self.local_seq(offset),
            acknowledgement: self.remote_seq(self.rcv_nxt),
            flags: flags | TcpFlags::ACK,
            window: self.rcv_wnd(),
            payload,
        }
    }

    fn syn(&self, key: &ConnectionKey) -> TcpSegment {
        let (flags, acknowledgement) = match self.state {
            TcpState::SynReceived => (TcpFlags::SYN | TcpFlags::ACK, self.irs.wrapping_add(1)),
            _ => (TcpFlags::SYN, 0),
        };

        TcpSegment {
            source_port: key.local.port(),
            destination_port: key.remote.port(),
            sequence: self.iss,
            acknowledgement,
            flags,
            window: self.rcv_wnd(),
            payload: Vec::new(),
        }
    }

    fn pure_ack(&self, key: &ConnectionKey) -> TcpSegment {
        self.segment(key, self.snd_nxt, Vec::new(), TcpFlags::ACK)
    }

    fn payload(&self, offset: u64, len: u64) -> Vec<u8> {
        let start = (offset - self.buffer_start) as usize;
        self.send_buffer
            .range(start..start + len as usize)
            .copied()
            .collect()
    }

    /// Sends as much new data as the congestion window and the peer's window allow
    fn output(&mut self, key: &ConnectionKey, now: Instant) -> Vec<TcpSegment> {
        let mut segments = Vec::new();
        if self.state != TcpState::Established {
            return segments;
        }

        loop {
            let data_end = self.data_end();
            let in_flight = self.snd_nxt - self.snd_una;
            let cwnd = self.cc.window() + self.window_inflation;

            if self.snd_nxt < data_end {
                let len = MSS.min(data_end - self.snd_nxt);
                let cwnd_allows = in_flight == 0 || in_flight + len <= cwnd;
                let peer_allows = in_flight + len <= self.snd_wnd;
                if !cwnd_allows {
                    break;
                }
                if !peer_allows {
                    if in_flight == 0 {
                        // Nothing in flight will bring a window update, so probe for one
                        self.persist = true;
                        if self.rto_deadline.is_none() {
                            self.rto_deadline = Some(now + self.rtt.rto);
                        }
                    }
                    break;
                }

                let offset = self.snd_nxt;
                let fin = self.fin_queued && offset + len == data_end;
                let mut flags = TcpFlags::ACK;
                if offset + len == data_end {
                    flags = flags | TcpFlags::PSH;
                }
                if fin {
                    flags = flags | TcpFlags::FIN;
                }

                segments.push(self.segment(key, offset, self.payload(offset, len), flags));
                self.on_sent(now, offset + len + u64::from(fin));
            } else if self.fin_queued && self.snd_nxt == data_end {
                segments.push(self.segment(key, data_end, Vec::new(), TcpFlags::FIN));
                self.on_sent(now, data_end + 1);
            } else {
                break;
            }
        }

        segments
    }

    fn on_sent(&mut self, now: Instant, end: u64) {
        if end > self.snd_max {
            if self.rtt_sample.is_none() {
                self.rtt_sample = Some((end, now));
            }
            self.snd_max = end;
        }

        self.snd_nxt = end;
        if self.rto_deadline.is_none() {
            self.rto_deadline = Some(now + self.rtt.rto);
        }
    }

    /// Retransmits the first unacknowledged segment (fast retransmit and partial acks)
    fn retransmit_first(&mut self, key: &ConnectionKey) -> Option<TcpSegment> {
        // Karn's rule: retransmitted data cannot be timed
        self.rtt_sample = None;

        let data_end = self.data_end();
        if self.snd_una < data_end {
            let len = MSS.min(data_end - self.snd_una);
            let mut flags = TcpFlags::ACK;
            if self.fin_queued && self.snd_una + len == data_end && self.snd_max > data_end {
                flags = flags | TcpFlags::FIN;
            }
            Some(self.segment(key, self.snd_una, self.payload(self.snd_una, len), flags))
        } else if self.fin_queued && self.snd_max > data_end {
            Some(self.segment(key, data_end, Vec::new(), TcpFlags::FIN))
        } else {
            None
        }
    }

    fn process_ack(&mut self, key: &ConnectionKey, now: Instant, segment: &TcpSegment, out: &mut Vec<TcpSegment>) {
        let ack = Self::offset_of(segment.acknowledgement, self.local_seq(self.snd_una), self.snd_una);
        if ack < self.snd_una as i64 || ack > self.snd_max as i64 {
            return;
        }
        let ack = ack as u64;
        let window = u64::from(segment.window);
        let window_update = window != self.snd_wnd;
        self.snd_wnd = window;
        if window > 0 && self.persist {
            self.persist = false;
            if self.snd_una == self.snd_max {
                self.rto_deadline = None;
            }
        }

        if ack > self.snd_una {
            let acked = ack - self.snd_una;
            if let Some((end, sent_at)) = self.rtt_sample {
                if ack >= end {
                    self.rtt.on_sample(now - sent_at);
                    self.rtt_sample = None;
                }
            }

            let released = ack.min(self.data_end()) - self.buffer_start;
            self.send_buffer.drain(..released as usize);
            self.buffer_start += released;

            self.snd_una = ack;
            self.snd_nxt = self.snd_nxt.max(ack);
            self.duplicate_acks = 0;
            self.retries = 0;

            match self.recover {
                Some(recover) if ack < recover => {
                    // Partial ack: the next hole is lost too
                    out.extend(self.retransmit_first(key));
                    self.window_inflation = self.window_inflation.saturating_sub(acked) + MSS;
                }
                Some(_) => {
                    self.recover = None;
                    self.window_inflation = 0;
                }
                None => self.cc.on_ack(now, acked, self.rtt.srtt()),
            }

            self.rto_deadline = if self.snd_una < self.snd_max {
                Some(now + self.rtt.rto)
            } else {
                None
            };
        } else if ack == self.snd_una
            && self.snd_una < self.snd_max
            && segment.payload.is_empty()
            && !segment.flags.contains(TcpFlags::FIN)
            && !window_update
        {
            self.duplicate_acks += 1;
            if self.duplicate_acks == DUPLICATE_ACK_THRESHOLD && self.recover.is_none() {
                self.cc
                    .on_congestion_event(now, self.snd_max - self.snd_una);
                self.recover = Some(self.snd_max);
                self.window_inflation = DUPLICATE_ACK_THRESHOLD as u64 * MSS;
                out.extend(self.retransmit_first(key));
            } else if self.duplicate_acks > DUPLICATE_ACK_THRESHOLD && self.recover.is_some() {
                self.window_inflation += MSS;
            }
        }
    }

    /// Accepts the payload and FIN of a segment, returning whether it must be acknowledged
    fn process_data(&mut self, segment: &TcpSegment) -> bool {
        let has_fin = segment.flags.contains(TcpFlags::FIN);
        if segment.payload.is_empty() && !has_fin {
            return false;
        }

        let offset = Self::offset_of(segment.sequence, self.remote_seq(self.rcv_nxt), self.rcv_nxt);
        let len = segment.payload.len() as i64;
        if has_fin && offset + len >= 0 {
            self.peer_fin = Some((offset + len) as u64);
        }

        if offset <= self.rcv_nxt as i64 {
            let skip = self.rcv_nxt as i64 - offset;
            if skip < len {
                self.recv_buffer
                    .extend(&segment.payload[skip as usize..]);
                self.rcv_nxt += (len - skip) as u64;
            }
        } else if len > 0 {
            let entry = self.out_of_order.entry(offset as u64).or_default();
            if entry.len() < segment.payload.len() {
                *entry = segment.payload.clone();
            }
        }

        while let Some((&start, _)) = self.out_of_order.first_key_value() {
            if start > self.rcv_nxt {
                break;
            }

            let Some((start, data)) = self.out_of_order.pop_first() else {
                break;
            };
            let end = start + data.len() as u64;
            if end > self.rcv_nxt {
                self.recv_buffer
                    .extend(&data[(self.rcv_nxt - start) as usize..]);
                self.rcv_nxt = end;
            }
        }

        if let Some(fin) = self.peer_fin {
            if !self.fin_received && self.rcv_nxt == fin {
                self.fin_received = true;
                self.rcv_nxt += 1;
            }
        }

        if self.detached {
            // Nobody is going to read this
            self.recv_buffer.clear();
        }

        true
    }

    fn close(&mut self, error: Option<TransportError>) {
        self.state = TcpState::Closed;
        self.error = self.error.or(error);
        self.rto_deadline = None;
    }
}

impl Connection {
    fn new(
        node: &Arc<Node>,
        key: ConnectionKey,
        state: TcpState,
        irs: u32,
        algorithm: CongestionAlgorithm,
        listener: Option<Weak<ListenerShared>>,
    ) -> Self {
        let iss = node.ctx.rng.lock().u32(..);
        Self {
            key,
            node: Arc::downgrade(node),
            tcb: Mutex::new(Tcb {
                state,
                error: None,
                detached: false,
                listener,
                iss,
                irs,
                send_buffer: VecDeque::new(),
                buffer_start: 0,
                snd_una: 0,
                snd_nxt: 0,
                snd_max: 0,
                snd_wnd: u64::from(WINDOW),
                persist: false,
                fin_queued: false,
                rcv_nxt: 0,
                recv_buffer: VecDeque::new(),
                out_of_order: BTreeMap::new(),
                peer_fin: None,
                fin_received: false,
                cc: algorithm.build(MSS),
                rtt: RttEstimator::new(),
                rtt_sample: None,
                duplicate_acks: 0,
                recover: None,
                window_inflation: 0,
                rto_deadline: None,
                retries: 0,
                handshake_sent_at: Instant::now(),
            }),
            state_changed: Notify::new(),
            timer_changed: Notify::new(),
        }
    }

    /// Registers a new outgoing connection and sends its SYN
    pub(crate) fn open(
        node: &Arc<Node>,
        key: ConnectionKey,
        algorithm: CongestionAlgorithm,
    ) -> Arc<Self> {
        let connection = Arc::new(Self::new(node, key, TcpState::SynSent, 0, algorithm, None));
        connection.start(node);
        connection
    }

    /// Registers a connection for an incoming SYN and answers with a SYN-ACK
    pub(crate) fn accept_syn(
        node: &Arc<Node>,
        key: ConnectionKey,
        syn: &TcpSegment,
        listener: &Arc<ListenerShared>,
    ) {
        let connection = Arc::new(Self::new(
            node,
            key,
            TcpState::SynReceived,
            syn.sequence,
            node.congestion_control(),
            Some(Arc::downgrade(listener)),
        ));
        connection.start(node);
    }

    fn start(self: &Arc<Self>, node: &Arc<Node>) {
        node.transport
            .lock()
            .tcp_connections
            .insert(self.key, self.clone());

        let syn = {
            let mut tcb = self.tcb.lock();
            let now = Instant::now();
            tcb.handshake_sent_at = now;
            tcb.rto_deadline = Some(now + tcb.rtt.rto);
            tcb.syn(&self.key)
        };

        tokio::spawn(
            self.clone()
                .run_timer(node.ctx.cancellation_token.clone()),
        );
        self.send(vec![syn]);
    }

    pub(crate) fn state(&self) -> TcpState {
        self.tcb.lock().state
    }

    pub(crate) fn congestion_algorithm(&self) -> CongestionAlgorithm {
        self.tcb.lock().cc.algorithm()
    }

    fn send(&self, segments: Vec<TcpSegment>) {
        if segments.is_empty() {
            return;
        }

        let Some(node) = self.node.upgrade() else {
            return;
        };

        for segment in segments {
            let packet = Ipv4Packet {
                source: *self.key.local.ip(),
                destination: *self.key.remote.ip(),
                ttl: DEFAULT_TTL,
                payload: IpPayload::Tcp(segment),
            };
            if let Err(e) = node.send_ip(packet) {
                tracing::debug!(node = %node.name(), "failed to send tcp segment: {e}");
            }
        }
    }

    /// Wakes everyone up after the control block changed
    fn changed(&self) {
        self.state_changed.notify_waiters();
        self.timer_changed.notify_one();
    }

    /// Forgets the connection once nobody can use it anymore
    fn remove_if_unused(&self) {
        let remove = {
            let tcb = self.tcb.lock();
            tcb.state == TcpState::Closed && tcb.detached
        };

        if remove {
            if let Some(node) = self.node.upgrade() {
                node.transport.lock().tcp_connections.remove(&self.key);
            }
        }
    }

    pub(crate) fn on_segment(self: &Arc<Self>, segment: &TcpSegment) {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut established_from_listener = None;

        {
            let mut tcb = self.tcb.lock();
            let key = &self.key;

            if segment.flags.contains(TcpFlags::RST) {
                match tcb.state {
                    TcpState::SynSent => {
                        if segment.flags.contains(TcpFlags::ACK)
                            && segment.acknowledgement == tcb.iss.wrapping_add(1)
                        {
                            tcb.close(Some(TransportError::ConnectionRefused));
                        }
                    }
                    TcpState::SynReceived => {
                        tcb.detached = true;
                        tcb.close(Some(TransportError::ConnectionReset));
                    }
                    TcpState::Established => tcb.close(Some(TransportError::ConnectionReset)),
                    TcpState::Closed => {}
                }
            } else {
                match tcb.state {
                    TcpState::SynSent => {
                        let acks_syn = segment.flags.contains(TcpFlags::ACK)
                            && segment.acknowledgement == tcb.iss.wrapping_add(1);
                        if segment.flags.contains(TcpFlags::SYN) && acks_syn {
                            tcb.irs = segment.sequence;
                            tcb.snd_wnd = u64::from(segment.window);
                            if tcb.retries == 0 {
                                let rtt = now - tcb.handshake_sent_at;
                                tcb.rtt.on_sample(rtt);
                            }
                            tcb.retries = 0;
                            tcb.rto_deadline = None;
                            tcb.state = TcpState::Established;
                            out.push(tcb.pure_ack(key));
                            out.extend(tcb.output(key, now));
                        }
                    }
                    TcpState::SynReceived => {
                        if segment.flags.contains(TcpFlags::SYN) {
                            // Our SYN-ACK got lost
                            out.push(tcb.syn(key));
                        } else if segment.flags.contains(TcpFlags::ACK)
                            && segment.acknowledgement == tcb.iss.wrapping_add(1)
                        {
                            if tcb.retries == 0 {
                                let rtt = now - tcb.handshake_sent_at;
                                tcb.rtt.on_sample(rtt);
                            }
                            tcb.retries = 0;
                            tcb.rto_deadline = None;
                            tcb.snd_wnd = u64::from(segment.window);
                            tcb.state = TcpState::Established;
                            established_from_listener = tcb.listener.take();
                            if tcb.process_data(segment) {
                                out.push(tcb.pure_ack(key));
                            }
                        }
                    }
                    TcpState::Established => {
                        if segment.flags.contains(TcpFlags::SYN) {
                            // Our handshake ACK got lost
                            out.push(tcb.pure_ack(key));
                        } else {
                            if segment.flags.contains(TcpFlags::ACK) {
                                tcb.process_ack(key, now, segment, &mut out);
                            }
                            if tcb.process_data(segment) {
                                out.push(tcb.pure_ack(key));
                            }
                            out.extend(tcb.output(key, now));

                            if tcb.fin_acked() && tcb.fin_received {
                                tcb.close(None);
                            }
                        }
                    }
                    TcpState::Closed => {
                        // Keep acknowledging retransmissions of the peer's FIN
                        if tcb.fin_received && segment.sequence_len() > 0 {
                            out.push(tcb.pure_ack(key));
                        }
                    }
                }
            }
        }

        self.send(out);

        if let Some(listener) = established_from_listener {
            match listener.upgrade() {
                Some(listener) => listener.push(self.clone()),
                None => self.detach(),
            }
        }

        self.changed();
        self.remove_if_unused();
    }

    fn on_timer(&self) {
        let now = Instant::now();
        let mut out = Vec::new();

        {
            let mut tcb = self.tcb.lock();
            let Some(deadline) = tcb.rto_deadline else {
                return;
            };
            if now < deadline {
                return;
            }

            tcb.retries += 1;
            tcb.rto_deadline = None;
            match tcb.state {
                TcpState::SynSent | TcpState::SynReceived => {
                    let max_retries = if tcb.state == TcpState::SynSent {
                        SYN_RETRIES
                    } else {
                        SYNACK_RETRIES
                    };

                    if tcb.retries > max_retries {
                        if tcb.state == TcpState::SynReceived {
                            tcb.detached = true;
                        }
                        tcb.close(Some(TransportError::TimedOut));
                    } else {
                        tcb.rtt.backoff();
                        tcb.rto_deadline = Some(now + tcb.rtt.rto);
                        out.push(tcb.syn(&self.key));
                    }
                }
                TcpState::Established if tcb.persist => {
                    // Window probe: one byte past the closed window, which the peer answers
                    // with its current window
                    tcb.retries = 0;
                    tcb.rtt.backoff();
                    tcb.rto_deadline = Some(now + tcb.rtt.rto);
                    if tcb.snd_una < tcb.data_end() {
                        let offset = tcb.snd_una;
                        out.push(tcb.segment(&self.key, offset, tcb.payload(offset, 1), TcpFlags::ACK));
                        tcb.on_sent(now, offset + 1);
                    }
                }
                TcpState::Established => {
                    if tcb.retries > DATA_RETRIES {
                        tcb.close(Some(TransportError::TimedOut));
                    } else {
                        let in_flight = tcb.snd_max - tcb.snd_una;
                        tcb.cc.on_timeout(now, in_flight);
                        tcb.recover = None;
                        tcb.window_inflation = 0;
                        tcb.duplicate_acks = 0;
                        tcb.rtt_sample = None;
                        tcb.rtt.backoff();

                        // Go back N: everything after the first hole is sent again
                        tcb.snd_nxt = tcb.snd_una;
                        out.extend(tcb.output(&self.key, now));
                    }
                }
                TcpState::Closed => {}
            }
        }

        self.send(out);
        self.changed();
        self.remove_if_unused();
    }

    async fn run_timer(self: Arc<Self>, cancellation_token: CancellationToken) {
        loop {
            let deadline = {
                let tcb = self.tcb.lock();
                if tcb.state == TcpState::Closed {
                    return;
                }
                tcb.rto_deadline
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        biased;
                        _ = cancellation_token.cancelled() => return,
                        _ = tokio::time::sleep_until(deadline) => self.on_timer(),
                        _ = self.timer_changed.notified() => {}
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = cancellation_token.cancelled() => return,
                        _ = self.timer_changed.notified() => {}
                    }
                }
            }
        }
    }

    /// Waits for the handshake to complete
    pub(crate) async fn established(&self) -> Result<(), TransportError> {
        loop {
            let notified = self.state_changed.notified();
            {
                let tcb = self.tcb.lock();
                match tcb.state {
                    TcpState::Established => return Ok(()),
                    TcpState::Closed => {
                        return Err(tcb.error.unwrap_or(TransportError::ConnectionRefused));
                    }
                    TcpState::SynSent | TcpState::SynReceived => {}
                }
            }
            notified.await;
        }
    }

    pub(crate) async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            let notified = self.state_changed.notified();
            {
                let mut tcb = self.tcb.lock();
                if !tcb.recv_buffer.is_empty() {
                    let window_before = tcb.rcv_wnd();
                    let n = buf.len().min(tcb.recv_buffer.len());
                    for (dst, src) in buf.iter_mut().zip(tcb.recv_buffer.drain(..n)) {
                        *dst = src;
                    }

                    // The peer may be waiting for the window to open
                    let reopened = u64::from(window_before) < 2 * MSS
                        && u64::from(tcb.rcv_wnd()) >= 2 * MSS
                        && tcb.state == TcpState::Established;
                    let update = reopened.then(|| tcb.pure_ack(&self.key));
                    drop(tcb);
                    self.send(update.into_iter().collect());
                    return Ok(n);
                }

                if tcb.fin_received {
                    return Ok(0);
                }

                if let Some(error) = tcb.error {
                    return Err(error);
                }

                if tcb.state == TcpState::Closed {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    pub(crate) async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        loop {
            let notified = self.state_changed.notified();
            let written = {
                let mut tcb = self.tcb.lock();
                if let Some(error) = tcb.error {
                    return Err(error);
                }
                if tcb.fin_queued || tcb.state == TcpState::Closed {
                    return Err(TransportError::BrokenPipe);
                }

                let room = SEND_BUFFER_SIZE.saturating_sub(tcb.send_buffer.len());
                if room == 0 {
                    None
                } else {
                    let n = room.min(data.len());
                    tcb.send_buffer.extend(&data[..n]);
                    Some((n, tcb.output(&self.key, Instant::now())))
                }
            };

            if let Some((n, segments)) = written {
                self.send(segments);
                self.timer_changed.notify_one();
                return Ok(n);
            }
            notified.await;
        }
    }

    /// Queues our FIN after the pending data
    pub(crate) fn shutdown(&self) {
        let segments = {
            let mut tcb = self.tcb.lock();
            if tcb.fin_queued {
                return;
            }
            tcb.fin_queued = true;
            tcb.output(&self.key, Instant::now())
        };

        self.send(segments);
        self.changed();
    }

    /// Waits until the peer has acknowledged everything we sent
    pub(crate) async fn wait_until_acked(&self) -> Result<(), TransportError> {
        loop {
            let notified = self.state_changed.notified();
            {
                let tcb = self.tcb.lock();
                if let Some(error) = tcb.error {
                    return Err(error);
                }
                if tcb.all_acked() || tcb.state == TcpState::Closed {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Called when the application drops the connection: pending data is still delivered and
    /// followed by a FIN
    pub(crate) fn detach(&self) {
        {
            let mut tcb = self.tcb.lock();
            tcb.detached = true;
            tcb.recv_buffer.clear();
            match tcb.state {
                TcpState::SynSent | TcpState::SynReceived => tcb.close(None),
                TcpState::Established | TcpState::Closed => {}
            }
        }

        self.shutdown();
        self.remove_if_unused();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rto_estimation() {
        let mut rtt = RttEstimator::new();
        assert_eq!(rtt.rto, INITIAL_RTO);

        rtt.on_sample(Duration::from_millis(100));
        assert_eq!(rtt.srtt(), Duration::from_millis(100));
        // 100ms + 4 * 50ms
        assert_eq!(rtt.rto, Duration::from_millis(300));

        rtt.backoff();
        assert_eq!(rtt.rto, Duration::from_millis(600));

        // Stable samples converge to the minimum
        for _ in 0..50 {
            rtt.on_sample(Duration::from_millis(10));
        }
        assert_eq!(rtt.rto, MIN_RTO);

        for _ in 0..20 {
            rtt.backoff();
        }
        assert_eq!(rtt.rto, MAX_RTO);
    }

    #[test]
    fn test_unwrap_sequence_numbers() {
        // Wraps around the 32-bit sequence space
        let reference_seq = u32::MAX - 10;
        assert_eq!(Tcb::offset_of(5, reference_seq, 1000), 1016);
        assert_eq!(Tcb::offset_of(u32::MAX - 20, reference_seq, 1000), 990);
    }
}
