//! Outbound stream buffer with retransmission state (RFC 9000 Section 2.2).
//!
//! Data is held as offset-keyed chunks, each in one of four states:
//! `Pending` (never sent), `InFlight` (sent, not yet acknowledged), `Acked`,
//! or `Lost` (declared lost, waiting for re-send). Lost bytes sort ahead of
//! new data, so retransmissions always win the next send slot. Contiguous
//! acknowledged bytes are dropped from the head as the ack frontier moves.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Pending,
    InFlight,
    Acked,
    Lost,
}

impl ChunkState {
    fn is_sendable(self) -> bool {
        matches!(self, ChunkState::Pending | ChunkState::Lost)
    }
}

#[derive(Debug, Clone)]
struct Chunk {
    data: Bytes,
    state: ChunkState,
}

/// Send-side stream buffer.
#[derive(Debug, Default)]
pub struct SendBuffer {
    /// Non-overlapping chunks covering exactly [head, written).
    chunks: BTreeMap<u64, Chunk>,
    /// Total bytes ever enqueued.
    written: u64,
    /// Everything below this offset is acknowledged and released.
    head: u64,
    /// Peer's flow-control credit for this stream; never decreases.
    max_data: u64,
    /// Final size, once the application ends the stream.
    final_size: Option<u64>,
    /// Highest offset ever checked out; bytes below are retransmissions.
    sent_high: u64,
    fin_in_flight: bool,
    fin_acked: bool,
}

impl SendBuffer {
    pub fn new(max_data: u64) -> Self {
        Self {
            max_data,
            ..Self::default()
        }
    }

    /// Append application data at the write offset.
    ///
    /// Fails once the stream's final size has been declared.
    pub fn enqueue(&mut self, data: Bytes) -> Result<()> {
        if self.final_size.is_some() {
            return Err(Error::StreamStateError);
        }
        if data.is_empty() {
            return Ok(());
        }
        let offset = self.written;
        self.written += data.len() as u64;
        self.chunks.insert(
            offset,
            Chunk {
                data,
                state: ChunkState::Pending,
            },
        );
        Ok(())
    }

    /// Raise the peer-granted credit. Lower values are ignored.
    pub fn update_max_data(&mut self, n: u64) {
        self.max_data = self.max_data.max(n);
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    /// Declare the current write offset as the stream's final size.
    pub fn mark_end_of_data(&mut self) {
        if self.final_size.is_none() {
            self.final_size = Some(self.written);
        }
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Earliest contiguous run of sendable (Pending or Lost) bytes, clamped
    /// to the flow-control limit. `None` when nothing may be sent.
    pub fn next_sendable_range(&self) -> Option<(u64, u64)> {
        let (start, _) = self
            .chunks
            .iter()
            .find(|(_, c)| c.state.is_sendable())
            .map(|(&off, c)| (off, c))?;
        if start >= self.max_data {
            return None;
        }
        let mut end = start;
        for (&off, chunk) in self.chunks.range(start..) {
            if off != end || !chunk.state.is_sendable() {
                break;
            }
            end = off + chunk.data.len() as u64;
        }
        Some((start, end.min(self.max_data) - start))
    }

    /// Whether anything (data or a bare FIN) is ready to transmit.
    pub fn has_sendable(&self) -> bool {
        self.next_sendable_range().is_some() || self.fin_pending()
    }

    /// A FIN that still has to reach the peer, with no data attached to it.
    fn fin_pending(&self) -> bool {
        self.final_size == Some(self.written)
            && !self.fin_in_flight
            && !self.fin_acked
            && self
                .chunks
                .values()
                .all(|c| !c.state.is_sendable())
    }

    /// Copy up to `dst.len()` bytes of the next sendable range into `dst`
    /// and mark them in flight.
    ///
    /// Returns `(offset, length, fin)`; `fin` is set when this transmission
    /// carries the final byte (or is a bare FIN, with `length == 0`).
    pub fn check_out(&mut self, dst: &mut [u8]) -> Option<(u64, usize, bool)> {
        let range = self.next_sendable_range();
        let (offset, len) = match range {
            Some((offset, len)) => (offset, (len as usize).min(dst.len())),
            None if self.fin_pending() => {
                self.fin_in_flight = true;
                return Some((self.written, 0, true));
            }
            None => return None,
        };
        if len == 0 {
            return None;
        }

        let end = offset + len as u64;
        self.split_at(offset);
        self.split_at(end);

        let mut copied = 0;
        for (_, chunk) in self.chunks.range_mut(offset..end) {
            dst[copied..copied + chunk.data.len()].copy_from_slice(&chunk.data);
            copied += chunk.data.len();
            chunk.state = ChunkState::InFlight;
        }
        debug_assert_eq!(copied, len);

        self.sent_high = self.sent_high.max(end);
        let fin = self.final_size == Some(end);
        if fin {
            self.fin_in_flight = true;
        }
        Some((offset, len, fin))
    }

    /// Highest offset ever transmitted; sends below this are
    /// retransmissions and cost no connection-level flow credit.
    pub fn sent_high(&self) -> u64 {
        self.sent_high
    }

    /// Acknowledge `[offset, offset + len)`; drop contiguous acknowledged
    /// bytes from the head. `fin` acknowledges the FIN itself.
    pub fn on_ack(&mut self, offset: u64, len: usize, fin: bool) {
        if fin {
            self.fin_acked = true;
        }
        let end = offset + len as u64;
        let start = offset.max(self.head);
        if start < end {
            self.split_at(start);
            self.split_at(end);
            for (_, chunk) in self.chunks.range_mut(start..end) {
                chunk.state = ChunkState::Acked;
            }
        }
        // Advance the head over the acknowledged prefix.
        while let Some((&off, chunk)) = self.chunks.iter().next() {
            if off == self.head && chunk.state == ChunkState::Acked {
                self.head = off + chunk.data.len() as u64;
                self.chunks.remove(&off);
            } else {
                break;
            }
        }
    }

    /// Declare `[offset, offset + len)` lost: in-flight bytes become
    /// re-sendable ahead of new data. Acknowledged bytes are left alone
    /// (a spurious loss may race a later ack).
    pub fn on_lost(&mut self, offset: u64, len: usize, fin: bool) {
        if fin && !self.fin_acked {
            self.fin_in_flight = false;
        }
        let end = offset + len as u64;
        let start = offset.max(self.head);
        if start >= end {
            return;
        }
        self.split_at(start);
        self.split_at(end);
        for (_, chunk) in self.chunks.range_mut(start..end) {
            if chunk.state == ChunkState::InFlight {
                chunk.state = ChunkState::Lost;
            }
        }
    }

    /// All data (and the FIN) delivered and acknowledged.
    pub fn finished(&self) -> bool {
        self.fin_acked && self.final_size == Some(self.head)
    }

    /// Bytes sent but not yet acknowledged or declared lost, plus bytes
    /// awaiting (re-)transmission.
    pub fn has_unacked_data(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Offset at which flow control currently blocks this stream, if the
    /// next sendable byte sits at or beyond the limit.
    pub fn blocked_at(&self) -> Option<u64> {
        let (&start, _) = self
            .chunks
            .iter()
            .find(|(_, c)| c.state.is_sendable())?;
        (start >= self.max_data).then_some(self.max_data)
    }

    pub fn written_bytes(&self) -> u64 {
        self.written
    }

    pub fn acked_head(&self) -> u64 {
        self.head
    }

    #[cfg(test)]
    fn bytes_in(&self, state: ChunkState) -> u64 {
        self.chunks
            .values()
            .filter(|c| c.state == state)
            .map(|c| c.data.len() as u64)
            .sum()
    }

    /// Split the chunk spanning `at`, if any, so `at` becomes a boundary.
    fn split_at(&mut self, at: u64) {
        let Some((&start, chunk)) = self.chunks.range(..at).next_back() else {
            return;
        };
        let chunk_end = start + chunk.data.len() as u64;
        if at >= chunk_end {
            return;
        }
        let split = (at - start) as usize;
        let tail = Chunk {
            data: chunk.data.slice(split..),
            state: chunk.state,
        };
        let head = self.chunks.get_mut(&start).unwrap();
        head.data = head.data.slice(..split);
        self.chunks.insert(at, tail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> Bytes {
        (0..n as u8).collect::<Vec<u8>>().into()
    }

    #[test]
    fn test_partial_check_out() {
        let mut buf = SendBuffer::new(50);
        buf.enqueue(filled(10)).unwrap();

        let mut dst = [0u8; 5];
        let (offset, len, fin) = buf.check_out(&mut dst).unwrap();
        assert_eq!((offset, len, fin), (0, 5, false));
        assert_eq!(&dst, &[0, 1, 2, 3, 4]);
        assert_eq!(buf.next_sendable_range(), Some((5, 5)));
    }

    #[test]
    fn test_lost_ranges_sent_first_and_merge() {
        let mut buf = SendBuffer::new(50);
        buf.enqueue(filled(20)).unwrap();

        let mut dst = [0u8; 5];
        buf.check_out(&mut dst).unwrap();
        buf.check_out(&mut dst).unwrap();
        assert_eq!(buf.next_sendable_range(), Some((10, 10)));

        buf.on_lost(0, 5, false);
        assert_eq!(buf.next_sendable_range(), Some((0, 5)));

        buf.on_lost(5, 5, false);
        // Everything from 0 is sendable again and coalesces into one run.
        assert_eq!(buf.next_sendable_range(), Some((0, 20)));
    }

    #[test]
    fn test_finish_stream() {
        let mut buf = SendBuffer::new(50);
        buf.enqueue(filled(10)).unwrap();
        buf.mark_end_of_data();

        let mut dst = [0u8; 5];
        let (o1, l1, f1) = buf.check_out(&mut dst).unwrap();
        assert_eq!((o1, l1, f1), (0, 5, false));
        let (o2, l2, f2) = buf.check_out(&mut dst).unwrap();
        assert_eq!((o2, l2, f2), (5, 5, true));

        buf.on_ack(0, 5, false);
        assert!(!buf.finished());
        buf.on_ack(5, 5, true);
        assert!(buf.finished());
        assert!(!buf.has_unacked_data());
    }

    #[test]
    fn test_enqueue_after_finish_fails() {
        let mut buf = SendBuffer::new(50);
        buf.mark_end_of_data();
        assert_eq!(buf.enqueue(filled(1)), Err(Error::StreamStateError));
    }

    #[test]
    fn test_bare_fin_roundtrip() {
        let mut buf = SendBuffer::new(50);
        buf.mark_end_of_data();
        let mut dst = [0u8; 8];
        assert_eq!(buf.check_out(&mut dst), Some((0, 0, true)));
        // FIN is in flight; no duplicate until loss.
        assert_eq!(buf.check_out(&mut dst), None);
        buf.on_lost(0, 0, true);
        assert_eq!(buf.check_out(&mut dst), Some((0, 0, true)));
        buf.on_ack(0, 0, true);
        assert!(buf.finished());
    }

    #[test]
    fn test_flow_control_clamps_sendable() {
        let mut buf = SendBuffer::new(4);
        buf.enqueue(filled(10)).unwrap();
        assert_eq!(buf.next_sendable_range(), Some((0, 4)));

        let mut dst = [0u8; 10];
        let (_, len, _) = buf.check_out(&mut dst).unwrap();
        assert_eq!(len, 4);
        assert_eq!(buf.next_sendable_range(), None);
        assert_eq!(buf.blocked_at(), Some(4));

        buf.update_max_data(10);
        assert_eq!(buf.next_sendable_range(), Some((4, 6)));
        assert_eq!(buf.blocked_at(), None);
    }

    #[test]
    fn test_max_data_never_lowers() {
        let mut buf = SendBuffer::new(10);
        buf.update_max_data(5);
        assert_eq!(buf.max_data(), 10);
    }

    #[test]
    fn test_ack_out_of_order_head_advance() {
        let mut buf = SendBuffer::new(100);
        buf.enqueue(filled(30)).unwrap();
        let mut dst = [0u8; 30];
        buf.check_out(&mut dst).unwrap();

        buf.on_ack(10, 10, false);
        assert_eq!(buf.acked_head(), 0);
        buf.on_ack(0, 10, false);
        // Head jumps over both acknowledged runs.
        assert_eq!(buf.acked_head(), 20);
        buf.on_ack(20, 10, false);
        assert_eq!(buf.acked_head(), 30);
        assert!(!buf.has_unacked_data());
    }

    #[test]
    fn test_duplicate_ack_is_idempotent() {
        let mut buf = SendBuffer::new(100);
        buf.enqueue(filled(10)).unwrap();
        let mut dst = [0u8; 10];
        buf.check_out(&mut dst).unwrap();
        buf.on_ack(0, 10, false);
        buf.on_ack(0, 10, false);
        assert_eq!(buf.acked_head(), 10);
    }

    #[test]
    fn test_spurious_loss_after_ack_keeps_acked() {
        let mut buf = SendBuffer::new(100);
        buf.enqueue(filled(10)).unwrap();
        let mut dst = [0u8; 10];
        buf.check_out(&mut dst).unwrap();
        buf.on_ack(0, 10, false);
        buf.on_lost(0, 10, false);
        assert_eq!(buf.next_sendable_range(), None);
    }

    #[test]
    fn test_conservation_invariant() {
        // pending + in_flight + lost + acked head = written, throughout an
        // arbitrary interleaving.
        let mut buf = SendBuffer::new(1000);
        let check = |buf: &SendBuffer| {
            let tracked = buf.bytes_in(ChunkState::Pending)
                + buf.bytes_in(ChunkState::InFlight)
                + buf.bytes_in(ChunkState::Lost)
                + buf.bytes_in(ChunkState::Acked)
                + buf.acked_head();
            assert_eq!(tracked, buf.written_bytes());
        };

        buf.enqueue(filled(100)).unwrap();
        check(&buf);
        let mut dst = [0u8; 40];
        buf.check_out(&mut dst).unwrap();
        check(&buf);
        buf.on_lost(10, 20, false);
        check(&buf);
        buf.enqueue(filled(50)).unwrap();
        check(&buf);
        buf.check_out(&mut dst).unwrap();
        check(&buf);
        buf.on_ack(0, 10, false);
        check(&buf);
        buf.on_ack(10, 30, false);
        check(&buf);
    }
}
