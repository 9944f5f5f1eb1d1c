//! RTT estimation, probe timeout, and congestion control (RFC 9002).
//!
//! Loss detection proper lives with the per-space in-flight maps in
//! [`crate::packet::space`]; this module holds the connection-wide pieces:
//! the RTT estimator, PTO backoff, and a NewReno congestion window.

use crate::types::Instant;
use core::time::Duration;

/// Timer granularity floor (RFC 9002 kGranularity).
pub const GRANULARITY: Duration = Duration::from_millis(1);

/// Default RTT before the first sample (RFC 9002 Section 6.2.2).
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Packet reordering threshold (RFC 9002 kPacketThreshold).
pub const PACKET_THRESHOLD: u64 = 3;

/// Time reordering threshold as a fraction: 9/8 (RFC 9002 kTimeThreshold).
pub const TIME_THRESHOLD_NUM: u32 = 9;
pub const TIME_THRESHOLD_DEN: u32 = 8;

/// Smoothed RTT state (RFC 9002 Section 5).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    var: Duration,
    min: Duration,
    has_sample: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            latest: INITIAL_RTT,
            smoothed: INITIAL_RTT,
            var: INITIAL_RTT / 2,
            min: INITIAL_RTT,
            has_sample: false,
        }
    }

    /// Feed a sample taken from the largest newly-acknowledged packet.
    ///
    /// `ack_delay` is the peer's decoded ACK Delay, already clamped to its
    /// max_ack_delay by the caller (and zero until the handshake is
    /// confirmed, per RFC 9002 Section 5.3).
    pub fn update(&mut self, sample: Duration, ack_delay: Duration) {
        self.latest = sample;
        if !self.has_sample {
            self.has_sample = true;
            self.min = sample;
            self.smoothed = sample;
            self.var = sample / 2;
            return;
        }

        self.min = self.min.min(sample);
        // Only discount the peer's ack delay when it leaves a value above
        // the RTT floor.
        let adjusted = if sample > self.min + ack_delay {
            sample - ack_delay
        } else {
            sample
        };

        let var_sample = if self.smoothed > adjusted {
            self.smoothed - adjusted
        } else {
            adjusted - self.smoothed
        };
        self.var = (3 * self.var + var_sample) / 4;
        self.smoothed = (7 * self.smoothed + adjusted) / 8;
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed
    }

    pub fn var(&self) -> Duration {
        self.var
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn latest(&self) -> Duration {
        self.latest
    }

    /// Base probe timeout (RFC 9002 Section 6.2.1), before backoff.
    ///
    /// `max_ack_delay` is included only for the Application space; the
    /// handshake spaces pass `None` since the peer acks those immediately.
    pub fn pto_base(&self, max_ack_delay: Option<Duration>) -> Duration {
        self.smoothed + (4 * self.var).max(GRANULARITY) + max_ack_delay.unwrap_or(Duration::ZERO)
    }

    /// Time window after which a packet sent before `now - window` is lost
    /// (RFC 9002 Section 6.1.2).
    pub fn loss_delay(&self) -> Duration {
        let base = self.smoothed.max(self.latest);
        (base * TIME_THRESHOLD_NUM / TIME_THRESHOLD_DEN).max(GRANULARITY)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection-wide recovery state: RTT, PTO backoff, congestion window.
#[derive(Debug)]
pub struct Recovery {
    pub rtt: RttEstimator,
    pub pto_count: u32,
    pub congestion: NewReno,
}

impl Recovery {
    pub fn new(max_datagram_size: usize) -> Self {
        Self {
            rtt: RttEstimator::new(),
            pto_count: 0,
            congestion: NewReno::new(max_datagram_size),
        }
    }

    /// PTO duration with exponential backoff applied.
    pub fn pto(&self, max_ack_delay: Option<Duration>) -> Duration {
        self.rtt.pto_base(max_ack_delay) * 2u32.saturating_pow(self.pto_count.min(16))
    }
}

/// NewReno congestion controller (RFC 9002 Section 7).
#[derive(Debug)]
pub struct NewReno {
    window: usize,
    bytes_in_flight: usize,
    recovery_start: Option<Instant>,
    ssthresh: usize,
    max_datagram_size: usize,
}

impl NewReno {
    const INITIAL_WINDOW_PACKETS: usize = 10;
    const MIN_WINDOW_PACKETS: usize = 2;

    pub fn new(max_datagram_size: usize) -> Self {
        Self {
            window: Self::INITIAL_WINDOW_PACKETS * max_datagram_size,
            bytes_in_flight: 0,
            recovery_start: None,
            ssthresh: usize::MAX,
            max_datagram_size,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    /// Room left in the congestion window.
    pub fn available(&self) -> usize {
        self.window.saturating_sub(self.bytes_in_flight)
    }

    pub fn on_packet_sent(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes;
    }

    pub fn on_packet_acked(&mut self, bytes: usize, sent_time: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        // No window growth for packets sent before the loss that started
        // the current recovery period.
        if let Some(start) = self.recovery_start {
            if sent_time <= start {
                return;
            }
            self.recovery_start = None;
        }
        if self.window < self.ssthresh {
            // Slow start.
            self.window += bytes;
        } else {
            // Congestion avoidance: one MSS per window acked.
            self.window += self.max_datagram_size * bytes / self.window;
        }
    }

    pub fn on_packet_lost(&mut self, bytes: usize, sent_time: Instant, now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        let in_recovery = self
            .recovery_start
            .is_some_and(|start| sent_time <= start);
        if !in_recovery {
            self.recovery_start = Some(now);
            self.window = (self.window / 2).max(Self::MIN_WINDOW_PACKETS * self.max_datagram_size);
            self.ssthresh = self.window;
        }
    }

    /// Forget bytes whose packet number space was discarded; they were
    /// neither acknowledged nor lost.
    pub fn on_packet_discarded(&mut self, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_estimator() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        assert_eq!(rtt.smoothed(), Duration::from_millis(100));
        assert_eq!(rtt.var(), Duration::from_millis(50));
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn test_ewma_moves_toward_samples() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(120), Duration::ZERO);
        assert!(rtt.smoothed() > Duration::from_millis(100));
        assert!(rtt.smoothed() < Duration::from_millis(120));
        assert_eq!(rtt.min(), Duration::from_millis(100));
        assert_eq!(rtt.latest(), Duration::from_millis(120));
    }

    #[test]
    fn test_ack_delay_discounted_above_min() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(150), Duration::from_millis(30));
        // Sample treated as 120ms, not 150ms.
        assert!(rtt.smoothed() < Duration::from_millis(105));
    }

    #[test]
    fn test_pto_backoff_doubles() {
        let mut rec = Recovery::new(1200);
        rec.rtt.update(Duration::from_millis(100), Duration::ZERO);
        let base = rec.pto(Some(Duration::from_millis(25)));
        rec.pto_count = 1;
        assert_eq!(rec.pto(Some(Duration::from_millis(25))), base * 2);
        rec.pto_count = 3;
        assert_eq!(rec.pto(Some(Duration::from_millis(25))), base * 8);
    }

    #[test]
    fn test_pto_omits_ack_delay_for_handshake() {
        let rec = Recovery::new(1200);
        let with = rec.pto(Some(Duration::from_millis(25)));
        let without = rec.pto(None);
        assert_eq!(with - without, Duration::from_millis(25));
    }

    #[test]
    fn test_loss_delay_floor() {
        let rtt = RttEstimator::new();
        assert!(rtt.loss_delay() >= GRANULARITY);
    }

    #[test]
    fn test_newreno_slow_start_and_loss() {
        let mut cc = NewReno::new(1200);
        let start_window = cc.window();
        cc.on_packet_sent(1200);
        assert_eq!(cc.bytes_in_flight(), 1200);
        cc.on_packet_acked(1200, Instant::from_nanos(1));
        assert_eq!(cc.window(), start_window + 1200);
        assert_eq!(cc.bytes_in_flight(), 0);

        cc.on_packet_sent(1200);
        cc.on_packet_lost(1200, Instant::from_nanos(2), Instant::from_nanos(3));
        assert_eq!(cc.window(), (start_window + 1200) / 2);

        // Second loss from the same recovery period does not halve again.
        let window = cc.window();
        cc.on_packet_sent(1200);
        cc.on_packet_lost(1200, Instant::from_nanos(2), Instant::from_nanos(4));
        assert_eq!(cc.window(), window);
    }
}
