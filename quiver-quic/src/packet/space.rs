//! Per-space send/receive/ack bookkeeping and loss detection
//! (RFC 9000 Section 12.3, RFC 9002 Section 6).
//!
//! Each packet number space tracks what it has received (for ACK
//! generation), what it has sent (for loss detection), and the crypto
//! stream of its encryption level. Initial and Handshake spaces are
//! discarded as the handshake advances; their in-flight packets vanish
//! without counting as lost.

use crate::frames::{AckFrame, AckRange};
use crate::recovery::PACKET_THRESHOLD;
use crate::stream::{RecvBuffer, SendBuffer};
use crate::types::{Dir, Instant, PacketNumber, StreamId};
use core::time::Duration;
use std::collections::BTreeMap;
use tinyvec::TinyVec;

/// Most ranges ever reported in one ACK frame.
const MAX_ACK_RANGES: usize = 32;

/// Receiving two ack-eliciting packets forces an immediate ACK
/// (RFC 9000 Section 13.2.2).
const ACK_ELICITING_THRESHOLD: u32 = 2;

// ============================================================================
// Ack range set
// ============================================================================

/// Sorted, disjoint set of received packet numbers, kept as inclusive
/// ranges. Insertion merges; the set is bounded by dropping the lowest
/// ranges once [`MAX_ACK_RANGES`] is exceeded.
#[derive(Debug, Clone, Default)]
pub struct AckRangeSet {
    /// Ascending, non-overlapping, non-adjacent inclusive ranges.
    ranges: Vec<(u64, u64)>,
}

impl AckRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pn: PacketNumber) {
        let idx = self.ranges.partition_point(|&(_, hi)| hi < pn);
        // `idx` is the first range whose hi >= pn.
        if let Some(&(lo, _)) = self.ranges.get(idx) {
            if pn >= lo {
                return; // already present
            }
            if pn + 1 == lo {
                // Extend downward; maybe merge with the previous range.
                self.ranges[idx].0 = pn;
                if idx > 0 && self.ranges[idx - 1].1 + 1 == pn {
                    self.ranges[idx].0 = self.ranges[idx - 1].0;
                    self.ranges.remove(idx - 1);
                }
                return;
            }
        }
        if idx > 0 && self.ranges[idx - 1].1 + 1 == pn {
            self.ranges[idx - 1].1 = pn;
            return;
        }
        self.ranges.insert(idx, (pn, pn));
        if self.ranges.len() > MAX_ACK_RANGES {
            self.ranges.remove(0);
        }
    }

    pub fn contains(&self, pn: PacketNumber) -> bool {
        let idx = self.ranges.partition_point(|&(_, hi)| hi < pn);
        self.ranges.get(idx).is_some_and(|&(lo, _)| pn >= lo)
    }

    pub fn largest(&self) -> Option<PacketNumber> {
        self.ranges.last().map(|&(_, hi)| hi)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Ranges in descending order, as an ACK frame reports them.
    pub fn descending(&self) -> TinyVec<[AckRange; 8]> {
        self.ranges
            .iter()
            .rev()
            .map(|&(lo, hi)| AckRange { smallest: lo, largest: hi })
            .collect()
    }

    /// Drop ranges wholly at or below `pn`; the peer has confirmed an ACK
    /// covering them, so they never need re-reporting.
    pub fn discard_up_to(&mut self, pn: PacketNumber) {
        self.ranges.retain(|&(_, hi)| hi > pn);
        if let Some(first) = self.ranges.first_mut() {
            if first.0 <= pn {
                first.0 = pn + 1;
            }
        }
    }

    #[cfg(test)]
    fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }
}

// ============================================================================
// Sent packet records
// ============================================================================

/// Retransmittable content of a sent packet, recorded so acknowledgment and
/// loss can be mapped back onto the owning buffers.
#[derive(Debug, Clone)]
pub enum SentFrame {
    Ping,
    Ack { largest: PacketNumber },
    Crypto { offset: u64, len: usize },
    Stream { id: StreamId, offset: u64, len: usize, fin: bool },
    HandshakeDone,
    MaxData,
    MaxStreamData { id: StreamId },
    MaxStreams { dir: Dir },
    ResetStream { id: StreamId },
    StopSending { id: StreamId, code: u64 },
    StreamsBlocked { dir: Dir },
    PathResponse,
    RetireConnectionId { seq: u64 },
}

/// Record of one sent packet, immutable until acked, lost, or discarded.
#[derive(Debug)]
pub struct SentPacket {
    pub pn: PacketNumber,
    pub time_sent: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    /// Counts toward the congestion window (ack-eliciting or padded).
    pub in_flight: bool,
    pub largest_acked_at_send: Option<PacketNumber>,
    pub frames: Vec<SentFrame>,
}

// ============================================================================
// Packet number space
// ============================================================================

/// Crypto stream of one encryption level: ordinary stream buffers with no
/// flow-control limit.
#[derive(Debug)]
pub struct CryptoStream {
    pub send: SendBuffer,
    pub recv: RecvBuffer,
}

impl CryptoStream {
    fn new() -> Self {
        Self {
            send: SendBuffer::new(u64::MAX),
            recv: RecvBuffer::new(u64::MAX),
        }
    }
}

/// All per-space state.
#[derive(Debug)]
pub struct PacketSpace {
    // Receive side.
    pub ack_ranges: AckRangeSet,
    pub largest_recv_time: Option<Instant>,
    ack_eliciting_since_ack: u32,
    ack_deadline: Option<Instant>,

    // Send side.
    next_pn: PacketNumber,
    pub sent: BTreeMap<PacketNumber, SentPacket>,
    pub largest_acked: Option<PacketNumber>,
    pub loss_time: Option<Instant>,
    pub time_of_last_ack_eliciting: Option<Instant>,

    pub crypto: CryptoStream,
}

impl PacketSpace {
    pub fn new() -> Self {
        Self {
            ack_ranges: AckRangeSet::new(),
            largest_recv_time: None,
            ack_eliciting_since_ack: 0,
            ack_deadline: None,
            next_pn: 0,
            sent: BTreeMap::new(),
            largest_acked: None,
            loss_time: None,
            time_of_last_ack_eliciting: None,
            crypto: CryptoStream::new(),
        }
    }

    // ------------------------------------------------------------------
    // Receive / ack generation
    // ------------------------------------------------------------------

    pub fn is_duplicate(&self, pn: PacketNumber) -> bool {
        self.ack_ranges.contains(pn)
    }

    /// Record a freshly decrypted packet and schedule its acknowledgment.
    pub fn on_packet_received(
        &mut self,
        pn: PacketNumber,
        ack_eliciting: bool,
        now: Instant,
        max_ack_delay: Duration,
    ) {
        let prev_largest = self.ack_ranges.largest();
        let reordered = prev_largest.is_some_and(|l| pn < l || pn > l + 1);
        self.ack_ranges.insert(pn);
        if prev_largest.is_none_or(|l| pn > l) {
            self.largest_recv_time = Some(now);
        }

        if ack_eliciting {
            self.ack_eliciting_since_ack += 1;
            let deadline = if self.ack_eliciting_since_ack >= ACK_ELICITING_THRESHOLD || reordered
            {
                now
            } else {
                now + max_ack_delay
            };
            self.ack_deadline = Some(self.ack_deadline.map_or(deadline, |d| d.min(deadline)));
        }
    }

    /// Is an ACK owed right now (delay expired or immediate-ack condition)?
    pub fn ack_due(&self, now: Instant) -> bool {
        self.ack_deadline.is_some_and(|d| d <= now)
    }

    /// Is any ACK pending at all (regardless of delay)?
    pub fn ack_pending(&self) -> bool {
        self.ack_deadline.is_some()
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        self.ack_deadline
    }

    /// Build the ACK frame this space would send at `now`.
    pub fn build_ack(&self, now: Instant, ack_delay_exponent: u64) -> Option<AckFrame> {
        let largest = self.ack_ranges.largest()?;
        let delay_micros = self
            .largest_recv_time
            .map(|t| now.saturating_duration_since(t).as_micros() as u64)
            .unwrap_or(0);
        Some(AckFrame {
            largest,
            delay: delay_micros >> ack_delay_exponent,
            ranges: self.ack_ranges.descending(),
            ecn: None,
        })
    }

    pub fn on_ack_sent(&mut self) {
        self.ack_eliciting_since_ack = 0;
        self.ack_deadline = None;
    }

    // ------------------------------------------------------------------
    // Send / loss detection
    // ------------------------------------------------------------------

    pub fn next_packet_number(&mut self) -> PacketNumber {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    pub fn peek_packet_number(&self) -> PacketNumber {
        self.next_pn
    }

    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        if packet.ack_eliciting {
            self.time_of_last_ack_eliciting = Some(packet.time_sent);
        }
        self.sent.insert(packet.pn, packet);
    }

    /// Remove and return every in-flight record covered by `ack`, ascending.
    ///
    /// Packet numbers we never sent make the ACK invalid; the caller treats
    /// `None` as a PROTOCOL_VIOLATION.
    pub fn take_acked(&mut self, ack: &AckFrame) -> Option<Vec<SentPacket>> {
        if ack.largest >= self.next_pn {
            return None;
        }
        let mut acked = Vec::new();
        for range in ack.ranges.iter() {
            // BTreeMap range-collect keeps this proportional to hits.
            let hits: Vec<PacketNumber> = self
                .sent
                .range(range.smallest..=range.largest)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in hits {
                acked.push(self.sent.remove(&pn).unwrap());
            }
        }
        acked.sort_by_key(|p| p.pn);
        self.largest_acked = Some(self.largest_acked.map_or(ack.largest, |l| l.max(ack.largest)));
        Some(acked)
    }

    /// Declare packets lost per RFC 9002 Section 6.1: reordering threshold
    /// of [`PACKET_THRESHOLD`] packets, or age beyond `loss_delay`. Re-arms
    /// `loss_time` for the earliest packet still in the grace period.
    pub fn detect_lost(&mut self, now: Instant, loss_delay: Duration) -> Vec<SentPacket> {
        let Some(largest_acked) = self.largest_acked else {
            return Vec::new();
        };
        self.loss_time = None;
        let mut lost_pns = Vec::new();
        for (&pn, packet) in self.sent.range(..largest_acked) {
            let by_count = largest_acked >= pn + PACKET_THRESHOLD;
            let deadline = packet.time_sent + loss_delay;
            if by_count || deadline <= now {
                lost_pns.push(pn);
            } else {
                // Oldest surviving candidate decides the loss timer.
                self.loss_time = Some(self.loss_time.map_or(deadline, |t| t.min(deadline)));
            }
        }
        lost_pns
            .into_iter()
            .map(|pn| self.sent.remove(&pn).unwrap())
            .collect()
    }

    pub fn has_ack_eliciting_in_flight(&self) -> bool {
        self.sent.values().any(|p| p.ack_eliciting)
    }

    /// Tear the space down, yielding its in-flight records so the caller
    /// can release congestion-window credit. Not a loss signal.
    pub fn discard(&mut self) -> Vec<SentPacket> {
        self.ack_deadline = None;
        self.loss_time = None;
        self.time_of_last_ack_eliciting = None;
        let sent = std::mem::take(&mut self.sent);
        sent.into_values().collect()
    }
}

impl Default for PacketSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::RttEstimator;

    #[test]
    fn test_ack_range_merging() {
        let mut set = AckRangeSet::new();
        for pn in [5u64, 3, 4, 9, 1] {
            set.insert(pn);
        }
        let ranges: Vec<_> = set.iter().collect();
        assert_eq!(ranges, vec![(1, 1), (3, 5), (9, 9)]);
        set.insert(2);
        let ranges: Vec<_> = set.iter().collect();
        assert_eq!(ranges, vec![(1, 5), (9, 9)]);
        assert_eq!(set.largest(), Some(9));
    }

    #[test]
    fn test_ack_range_union_equals_inserted() {
        let mut set = AckRangeSet::new();
        let pns = [0u64, 2, 4, 6, 8, 7, 5, 3, 1, 20, 19, 21];
        for &pn in &pns {
            set.insert(pn);
            set.insert(pn); // duplicates are no-ops
        }
        for &pn in &pns {
            assert!(set.contains(pn));
        }
        assert!(!set.contains(9));
        assert!(!set.contains(18));
        let ranges: Vec<_> = set.iter().collect();
        assert_eq!(ranges, vec![(0, 8), (19, 21)]);
        // Sorted and disjoint by construction.
        for pair in ranges.windows(2) {
            assert!(pair[0].1 + 1 < pair[1].0);
        }
    }

    #[test]
    fn test_ack_range_trim_bound() {
        let mut set = AckRangeSet::new();
        // Every even packet its own range.
        for pn in (0u64..200).step_by(2) {
            set.insert(pn);
        }
        assert_eq!(set.len(), MAX_ACK_RANGES);
        // The newest ranges survive.
        assert!(set.contains(198));
        assert!(!set.contains(0));
    }

    #[test]
    fn test_discard_up_to() {
        let mut set = AckRangeSet::new();
        for pn in [1u64, 2, 3, 7, 8, 12] {
            set.insert(pn);
        }
        set.discard_up_to(7);
        let ranges: Vec<_> = set.iter().collect();
        assert_eq!(ranges, vec![(8, 8), (12, 12)]);
    }

    fn sent(pn: u64, at: u64) -> SentPacket {
        SentPacket {
            pn,
            time_sent: Instant::from_nanos(at),
            size: 1200,
            ack_eliciting: true,
            in_flight: true,
            largest_acked_at_send: None,
            frames: vec![SentFrame::Ping],
        }
    }

    fn ack_of(ranges: &[(u64, u64)]) -> AckFrame {
        AckFrame {
            largest: ranges[0].1,
            delay: 0,
            ranges: ranges
                .iter()
                .map(|&(lo, hi)| AckRange { smallest: lo, largest: hi })
                .collect(),
            ecn: None,
        }
    }

    #[test]
    fn test_take_acked_removes_in_flight() {
        let mut space = PacketSpace::new();
        for pn in 0..5 {
            assert_eq!(space.next_packet_number(), pn);
            space.on_packet_sent(sent(pn, pn * 1000));
        }
        let acked = space.take_acked(&ack_of(&[(3, 4), (0, 1)])).unwrap();
        let pns: Vec<_> = acked.iter().map(|p| p.pn).collect();
        assert_eq!(pns, vec![0, 1, 3, 4]);
        assert_eq!(space.largest_acked, Some(4));
        assert!(space.sent.contains_key(&2));
    }

    #[test]
    fn test_ack_of_unsent_packet_rejected() {
        let mut space = PacketSpace::new();
        space.next_packet_number();
        space.on_packet_sent(sent(0, 0));
        assert!(space.take_acked(&ack_of(&[(0, 7)])).is_none());
    }

    #[test]
    fn test_loss_by_packet_threshold() {
        let mut space = PacketSpace::new();
        for pn in 0..5 {
            space.next_packet_number();
            space.on_packet_sent(sent(pn, pn));
        }
        space.take_acked(&ack_of(&[(4, 4)])).unwrap();
        // Packets 0 and 1 trail the largest acked by >= 3.
        let lost = space.detect_lost(Instant::from_nanos(10), Duration::from_millis(100));
        let pns: Vec<_> = lost.iter().map(|p| p.pn).collect();
        assert_eq!(pns, vec![0, 1]);
        // 2 and 3 wait on the loss timer.
        assert!(space.loss_time.is_some());
        assert!(space.sent.contains_key(&2));
    }

    #[test]
    fn test_loss_by_time_threshold() {
        let mut space = PacketSpace::new();
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        for pn in 0..3 {
            space.next_packet_number();
            space.on_packet_sent(sent(pn, pn * 1_000_000));
        }
        space.take_acked(&ack_of(&[(2, 2)])).unwrap();
        // Not yet: only a few microseconds have passed.
        let lost = space.detect_lost(Instant::from_nanos(3_000_000), rtt.loss_delay());
        assert!(lost.is_empty());
        // Well past 9/8 * rtt after the send times.
        let lost = space.detect_lost(
            Instant::from_nanos(3_000_000 + rtt.loss_delay().as_nanos() as u64),
            rtt.loss_delay(),
        );
        let pns: Vec<_> = lost.iter().map(|p| p.pn).collect();
        assert_eq!(pns, vec![0, 1]);
    }

    #[test]
    fn test_ack_scheduling() {
        let mut space = PacketSpace::new();
        let t0 = Instant::from_nanos(0);
        let delay = Duration::from_millis(25);
        space.on_packet_received(0, true, t0, delay);
        // One ack-eliciting packet: ACK after max_ack_delay.
        assert!(!space.ack_due(t0));
        assert!(space.ack_due(t0 + delay));
        // Second one forces an immediate ACK.
        space.on_packet_received(1, true, t0, delay);
        assert!(space.ack_due(t0));

        let ack = space.build_ack(t0 + Duration::from_micros(800), 3).unwrap();
        assert_eq!(ack.largest, 1);
        assert_eq!(ack.delay, 800 >> 3);
        space.on_ack_sent();
        assert!(!space.ack_pending());
    }

    #[test]
    fn test_reordered_receive_acks_immediately() {
        let mut space = PacketSpace::new();
        let t0 = Instant::from_nanos(0);
        let delay = Duration::from_millis(25);
        space.on_packet_received(5, true, t0, delay);
        space.on_ack_sent();
        // A gap-filling packet arrives out of order.
        space.on_packet_received(3, true, t0, delay);
        assert!(space.ack_due(t0));
    }

    #[test]
    fn test_duplicate_detection() {
        let mut space = PacketSpace::new();
        space.on_packet_received(7, true, Instant::from_nanos(0), Duration::ZERO);
        assert!(space.is_duplicate(7));
        assert!(!space.is_duplicate(8));
    }

    #[test]
    fn test_discard_returns_in_flight_without_loss() {
        let mut space = PacketSpace::new();
        for pn in 0..3 {
            space.next_packet_number();
            space.on_packet_sent(sent(pn, pn));
        }
        let drained = space.discard();
        assert_eq!(drained.len(), 3);
        assert!(space.sent.is_empty());
        assert!(space.loss_time.is_none());
    }
}
