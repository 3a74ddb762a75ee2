//! Congestion control algorithms
//!
//! Windows are measured in bytes. Loss recovery itself (fast retransmit, NewReno window
//! inflation, retransmission timeouts) lives in the connection; the algorithms here only decide
//! how the window grows and how it shrinks after a congestion event.

use anyhow::bail;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Initial window, in segments (RFC 6928)
const INITIAL_WINDOW_SEGMENTS: u64 = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CongestionAlgorithm {
    Reno,
    #[default]
    Cubic,
}

impl CongestionAlgorithm {
    pub const ALL: [CongestionAlgorithm; 2] = [CongestionAlgorithm::Reno, CongestionAlgorithm::Cubic];

    pub fn build(self, mss: u64) -> Box<dyn CongestionControl> {
        match self {
            CongestionAlgorithm::Reno => Box::new(Reno::new(mss)),
            CongestionAlgorithm::Cubic => Box::new(Cubic::new(mss)),
        }
    }
}

impl FromStr for CongestionAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reno" => Ok(CongestionAlgorithm::Reno),
            "cubic" => Ok(CongestionAlgorithm::Cubic),
            _ => bail!("unknown congestion control algorithm `{s}`"),
        }
    }
}

impl Display for CongestionAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CongestionAlgorithm::Reno => write!(f, "reno"),
            CongestionAlgorithm::Cubic => write!(f, "cubic"),
        }
    }
}

pub trait CongestionControl: Send {
    fn algorithm(&self) -> CongestionAlgorithm;

    /// The congestion window, in bytes
    fn window(&self) -> u64;

    /// The slow start threshold, in bytes (`u64::MAX` until the first congestion event)
    fn ssthresh(&self) -> u64;

    /// Called when new data is cumulatively acknowledged outside of loss recovery
    fn on_ack(&mut self, now: Instant, acked_bytes: u64, rtt: Duration);

    /// Called when loss is detected through duplicate acknowledgements
    fn on_congestion_event(&mut self, now: Instant, bytes_in_flight: u64);

    /// Called when the retransmission timer expires
    fn on_timeout(&mut self, now: Instant, bytes_in_flight: u64);
}

/// Classic AIMD: slow start, additive increase of one segment per window, halving on loss
pub struct Reno {
    mss: u64,
    cwnd: u64,
    ssthresh: u64,
    bytes_acked: u64,
}

impl Reno {
    pub fn new(mss: u64) -> Self {
        Self {
            mss,
            cwnd: INITIAL_WINDOW_SEGMENTS * mss,
            ssthresh: u64::MAX,
            bytes_acked: 0,
        }
    }
}

impl CongestionControl for Reno {
    fn algorithm(&self) -> CongestionAlgorithm {
        CongestionAlgorithm::Reno
    }

    fn window(&self) -> u64 {
        self.cwnd
    }

    fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    fn on_ack(&mut self, _now: Instant, acked_bytes: u64, _rtt: Duration) {
        if self.cwnd < self.ssthresh {
            self.cwnd += acked_bytes;
            return;
        }

        self.bytes_acked += acked_bytes;
        while self.bytes_acked >= self.cwnd {
            self.bytes_acked -= self.cwnd;
            self.cwnd += self.mss;
        }
    }

    fn on_congestion_event(&mut self, _now: Instant, bytes_in_flight: u64) {
        self.ssthresh = (bytes_in_flight / 2).max(2 * self.mss);
        self.cwnd = self.ssthresh;
        self.bytes_acked = 0;
    }

    fn on_timeout(&mut self, _now: Instant, bytes_in_flight: u64) {
        self.ssthresh = (bytes_in_flight / 2).max(2 * self.mss);
        self.cwnd = self.mss;
        self.bytes_acked = 0;
    }
}

/// CUBIC (RFC 8312), including the TCP-friendly region and fast convergence
pub struct Cubic {
    mss: u64,
    /// Window in segments
    cwnd: f64,
    ssthresh: u64,
    /// Window right before the last reduction, in segments
    w_max: f64,
    epoch: Option<CubicEpoch>,
}

struct CubicEpoch {
    start: Instant,
    k: f64,
    origin: f64,
    /// Window estimate of a standard AIMD flow, in segments
    w_est: f64,
}

impl Cubic {
    const C: f64 = 0.4;
    const BETA: f64 = 0.7;

    pub fn new(mss: u64) -> Self {
        Self {
            mss,
            cwnd: INITIAL_WINDOW_SEGMENTS as f64,
            ssthresh: u64::MAX,
            w_max: 0.0,
            epoch: None,
        }
    }

    fn reduce(&mut self) {
        self.epoch = None;
        self.w_max = if self.cwnd < self.w_max {
            // Fast convergence: release bandwidth for new flows
            self.cwnd * (1.0 + Self::BETA) / 2.0
        } else {
            self.cwnd
        };

        let reduced = (self.cwnd * Self::BETA).max(2.0);
        self.ssthresh = (reduced * self.mss as f64).round() as u64;
    }

    fn in_slow_start(&self) -> bool {
        self.window() < self.ssthresh
    }
}

impl CongestionControl for Cubic {
    fn algorithm(&self) -> CongestionAlgorithm {
        CongestionAlgorithm::Cubic
    }

    fn window(&self) -> u64 {
        (self.cwnd * self.mss as f64) as u64
    }

    fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    fn on_ack(&mut self, now: Instant, acked_bytes: u64, rtt: Duration) {
        let acked = acked_bytes as f64 / self.mss as f64;
        if self.in_slow_start() {
            self.cwnd += acked;
            return;
        }

        let cwnd = self.cwnd;
        let w_max = self.w_max;
        let epoch = self.epoch.get_or_insert_with(|| {
            let (k, origin) = if cwnd < w_max {
                (((w_max - cwnd) / Self::C).cbrt(), w_max)
            } else {
                (0.0, cwnd)
            };
            CubicEpoch {
                start: now,
                k,
                origin,
                w_est: cwnd,
            }
        });

        let t = now.saturating_duration_since(epoch.start).as_secs_f64() + rtt.as_secs_f64();
        let target = epoch.origin + Self::C * (t - epoch.k).powi(3);

        let mut next = if target > cwnd {
            cwnd + (target - cwnd) / cwnd * acked
        } else {
            cwnd + 0.01 * acked / cwnd
        };

        let alpha = 3.0 * (1.0 - Self::BETA) / (1.0 + Self::BETA);
        epoch.w_est += alpha * acked / cwnd;
        if epoch.w_est > next {
            next = epoch.w_est;
        }

        self.cwnd = next;
    }

    fn on_congestion_event(&mut self, _now: Instant, _bytes_in_flight: u64) {
        self.reduce();
        self.cwnd = self.ssthresh as f64 / self.mss as f64;
    }

    fn on_timeout(&mut self, _now: Instant, _bytes_in_flight: u64) {
        self.reduce();
        self.cwnd = 1.0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MSS: u64 = 1460;
    const RTT: Duration = Duration::from_millis(100);

    #[test]
    fn test_parse_algorithm() {
        assert_eq!(
            "reno".parse::<CongestionAlgorithm>().unwrap(),
            CongestionAlgorithm::Reno
        );
        assert_eq!(
            "cubic".parse::<CongestionAlgorithm>().unwrap(),
            CongestionAlgorithm::Cubic
        );
        assert!("bbr".parse::<CongestionAlgorithm>().is_err());
        assert_eq!(CongestionAlgorithm::default(), CongestionAlgorithm::Cubic);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reno_slow_start_and_avoidance() {
        let mut reno = Reno::new(MSS);
        let now = Instant::now();
        assert_eq!(reno.window(), 10 * MSS);

        // Slow start doubles the window every round trip
        reno.on_ack(now, 10 * MSS, RTT);
        assert_eq!(reno.window(), 20 * MSS);

        reno.on_congestion_event(now, 20 * MSS);
        assert_eq!(reno.window(), 10 * MSS);
        assert_eq!(reno.ssthresh(), 10 * MSS);

        // Congestion avoidance adds a segment per window
        reno.on_ack(now, 10 * MSS, RTT);
        assert_eq!(reno.window(), 11 * MSS);

        reno.on_timeout(now, 11 * MSS);
        assert_eq!(reno.window(), MSS);
        assert_eq!(reno.ssthresh(), 11 * MSS / 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cubic_reduction_and_fast_convergence() {
        let mut cubic = Cubic::new(MSS);
        cubic.cwnd = 100.0;
        cubic.on_congestion_event(Instant::now(), 100 * MSS);
        assert_eq!(cubic.window(), 70 * MSS);
        assert_eq!(cubic.w_max, 100.0);

        // A second loss below the previous maximum lowers the remembered maximum further
        cubic.cwnd = 90.0;
        cubic.on_congestion_event(Instant::now(), 90 * MSS);
        assert!((cubic.w_max - 76.5).abs() < 1e-9);
        assert_eq!(cubic.window(), 63 * MSS);
    }

    async fn grow_until(cubic: &mut Cubic, start: Instant, until: Duration) -> f64 {
        while start.elapsed() < until {
            // A full window gets acknowledged every round trip
            let acked = cubic.window() / 10;
            cubic.on_ack(Instant::now(), acked, RTT);
            tokio::time::advance(RTT / 10).await;
        }
        cubic.window() as f64 / MSS as f64
    }

    #[tokio::test(start_paused = true)]
    async fn test_cubic_window_growth() {
        let mut cubic = Cubic::new(MSS);
        cubic.cwnd = 100.0;
        cubic.on_congestion_event(Instant::now(), 100 * MSS);

        // K = cbrt((100 - 70) / 0.4) ~= 4.2 seconds
        let k = Duration::from_secs_f64((30.0f64 / 0.4).cbrt());
        let start = Instant::now();

        let concave = grow_until(&mut cubic, start, k / 2).await;
        assert!(concave > 70.0 && concave < 100.0, "{concave}");

        let plateau = grow_until(&mut cubic, start, k).await;
        assert!(plateau > 95.0 && plateau < 106.0, "{plateau}");

        let convex = grow_until(&mut cubic, start, k * 2).await;
        assert!(convex > 110.0, "{convex}");
    }
}
