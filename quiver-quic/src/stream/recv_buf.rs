//! Inbound stream reassembly buffer (RFC 9000 Section 2.2).
//!
//! Out-of-order fragments are held in an offset-keyed map with overlap
//! trimmed at insertion, so stored ranges never intersect. Delivery hands
//! out only the contiguous prefix; bytes beyond a gap wait.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Receive-side stream buffer.
#[derive(Debug)]
pub struct RecvBuffer {
    /// Undelivered fragments; keys are stream offsets, ranges are disjoint.
    chunks: BTreeMap<u64, Bytes>,
    /// End of the prefix already handed to the application.
    delivered: u64,
    /// Highest offset seen (end of the furthest received byte).
    highest_received: u64,
    /// Final size, once a FIN or RESET_STREAM pinned it.
    final_size: Option<u64>,
    /// Flow-control limit currently advertised to the peer.
    local_max: u64,
    /// Window size used when re-advertising credit.
    window: u64,
}

impl RecvBuffer {
    pub fn new(max_data: u64) -> Self {
        Self {
            chunks: BTreeMap::new(),
            delivered: 0,
            highest_received: 0,
            final_size: None,
            local_max: max_data,
            window: max_data,
        }
    }

    /// Insert a received fragment.
    ///
    /// Duplicate and overlapping bytes are tolerated when their content
    /// matches what was stored; a content mismatch in the overlap is a
    /// PROTOCOL_VIOLATION. Returns how far this fragment advanced
    /// `highest_received`, which is what connection-level flow control
    /// charges for.
    pub fn insert(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<u64> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::FrameEncodingError)?;

        if end > self.local_max {
            return Err(Error::FlowControlError);
        }

        match self.final_size {
            Some(final_size) => {
                if end > final_size || (fin && end != final_size) {
                    return Err(Error::FinalSizeError);
                }
            }
            None if fin => {
                if end < self.highest_received {
                    return Err(Error::FinalSizeError);
                }
                self.final_size = Some(end);
            }
            None => {}
        }

        let newly = end.saturating_sub(self.highest_received);
        self.highest_received = self.highest_received.max(end);

        // Clip away anything already delivered.
        let mut cur = offset.max(self.delivered);
        while cur < end {
            // A stored chunk covering `cur` means overlap: verify and skip.
            if let Some((&cstart, cdata)) = self.chunks.range(..=cur).next_back() {
                let cend = cstart + cdata.len() as u64;
                if cend > cur {
                    let overlap_end = cend.min(end);
                    let incoming = &data[(cur - offset) as usize..(overlap_end - offset) as usize];
                    let stored = &cdata[(cur - cstart) as usize..(overlap_end - cstart) as usize];
                    if incoming != stored {
                        return Err(Error::ProtocolViolation);
                    }
                    cur = overlap_end;
                    continue;
                }
            }
            // Free space up to the next stored chunk (or the fragment end).
            let gap_end = self
                .chunks
                .range(cur..)
                .next()
                .map(|(&s, _)| s.min(end))
                .unwrap_or(end);
            if gap_end > cur {
                self.chunks
                    .insert(cur, data.slice((cur - offset) as usize..(gap_end - offset) as usize));
            }
            cur = gap_end;
        }

        Ok(newly)
    }

    /// Pin the final size from a RESET_STREAM frame.
    pub fn on_reset(&mut self, final_size: u64) -> Result<u64> {
        match self.final_size {
            Some(known) if known != final_size => return Err(Error::FinalSizeError),
            None if final_size < self.highest_received => return Err(Error::FinalSizeError),
            _ => {}
        }
        self.final_size = Some(final_size);
        let newly = final_size.saturating_sub(self.highest_received);
        self.highest_received = self.highest_received.max(final_size);
        Ok(newly)
    }

    /// Length of the contiguous prefix ready for delivery.
    pub fn deliverable(&self) -> usize {
        let mut end = self.delivered;
        for (&off, data) in self.chunks.range(self.delivered..) {
            if off != end {
                break;
            }
            end = off + data.len() as u64;
        }
        (end - self.delivered) as usize
    }

    /// Take up to `max` contiguous bytes, advancing the delivery cursor.
    pub fn read(&mut self, max: usize) -> Option<Bytes> {
        let (&off, _) = self.chunks.range(self.delivered..).next()?;
        if off != self.delivered || max == 0 {
            return None;
        }
        let chunk = self.chunks.remove(&off).unwrap();
        if chunk.len() <= max {
            self.delivered += chunk.len() as u64;
            Some(chunk)
        } else {
            let out = chunk.slice(..max);
            self.delivered += max as u64;
            self.chunks.insert(self.delivered, chunk.slice(max..));
            Some(out)
        }
    }

    /// All bytes through the final size have been delivered.
    pub fn is_finished(&self) -> bool {
        self.final_size == Some(self.delivered)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn highest_received(&self) -> u64 {
        self.highest_received
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Re-advertise credit once the application has consumed half the
    /// window. Returns the new MAX_STREAM_DATA value to send, if due.
    pub fn max_data_update(&mut self) -> Option<u64> {
        if self.final_size.is_some() {
            return None;
        }
        let remaining = self.local_max - self.delivered.min(self.local_max);
        if remaining >= self.window / 2 {
            return None;
        }
        self.local_max = self.delivered.saturating_add(self.window);
        Some(self.local_max)
    }

    pub fn local_max(&self) -> u64 {
        self.local_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_delivery() {
        let mut buf = RecvBuffer::new(1024);
        buf.insert(0, Bytes::from_static(b"hello"), false).unwrap();
        assert_eq!(buf.deliverable(), 5);
        assert_eq!(&buf.read(100).unwrap()[..], b"hello");
        assert_eq!(buf.delivered(), 5);
        assert!(buf.read(100).is_none());
    }

    #[test]
    fn test_gap_blocks_delivery() {
        let mut buf = RecvBuffer::new(1024);
        buf.insert(5, Bytes::from_static(b"world"), false).unwrap();
        assert_eq!(buf.deliverable(), 0);
        assert!(buf.read(100).is_none());

        buf.insert(0, Bytes::from_static(b"hello"), false).unwrap();
        assert_eq!(buf.deliverable(), 10);
        assert_eq!(&buf.read(100).unwrap()[..], b"hello");
        assert_eq!(&buf.read(100).unwrap()[..], b"world");
    }

    #[test]
    fn test_any_permutation_same_stream() {
        // Non-overlapping fragments covering [0, 12) in three orders.
        let frags: [(u64, &[u8]); 3] = [(0, b"abcd"), (4, b"efgh"), (8, b"ijkl")];
        for order in [[0usize, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let mut buf = RecvBuffer::new(1024);
            for i in order {
                let (off, data) = frags[i];
                buf.insert(off, Bytes::from_static(data), false).unwrap();
            }
            assert_eq!(buf.deliverable(), 12);
            let mut out = Vec::new();
            while let Some(chunk) = buf.read(100) {
                out.extend_from_slice(&chunk);
            }
            assert_eq!(out, b"abcdefghijkl");
        }
    }

    #[test]
    fn test_partial_read_resumes() {
        let mut buf = RecvBuffer::new(1024);
        buf.insert(0, Bytes::from_static(b"hello world"), false).unwrap();
        assert_eq!(&buf.read(5).unwrap()[..], b"hello");
        assert_eq!(&buf.read(100).unwrap()[..], b" world");
    }

    #[test]
    fn test_duplicate_identical_tolerated() {
        let mut buf = RecvBuffer::new(1024);
        buf.insert(0, Bytes::from_static(b"hello"), false).unwrap();
        let newly = buf.insert(0, Bytes::from_static(b"hello"), false).unwrap();
        assert_eq!(newly, 0);
        assert_eq!(buf.deliverable(), 5);
    }

    #[test]
    fn test_overlap_mismatch_is_violation() {
        let mut buf = RecvBuffer::new(1024);
        buf.insert(0, Bytes::from_static(b"hello"), false).unwrap();
        assert_eq!(
            buf.insert(3, Bytes::from_static(b"XXtra"), false),
            Err(Error::ProtocolViolation)
        );
    }

    #[test]
    fn test_overlap_extension_accepted() {
        let mut buf = RecvBuffer::new(1024);
        buf.insert(2, Bytes::from_static(b"cde"), false).unwrap();
        // Covers the stored range with matching content plus new bytes on
        // both sides.
        buf.insert(0, Bytes::from_static(b"abcdefg"), false).unwrap();
        assert_eq!(buf.deliverable(), 7);
        assert_eq!(&buf.read(100).unwrap()[..], b"ab");
        assert_eq!(&buf.read(100).unwrap()[..], b"cde");
        assert_eq!(&buf.read(100).unwrap()[..], b"fg");
    }

    #[test]
    fn test_flow_control_limit() {
        let mut buf = RecvBuffer::new(10);
        assert_eq!(
            buf.insert(8, Bytes::from_static(b"abc"), false),
            Err(Error::FlowControlError)
        );
        buf.insert(7, Bytes::from_static(b"abc"), false).unwrap();
    }

    #[test]
    fn test_final_size_rules() {
        let mut buf = RecvBuffer::new(1024);
        buf.insert(0, Bytes::from_static(b"hello"), true).unwrap();
        assert_eq!(buf.final_size(), Some(5));

        // Different FIN position.
        assert_eq!(
            buf.insert(0, Bytes::from_static(b"he"), true),
            Err(Error::FinalSizeError)
        );
        // Data beyond the final size.
        assert_eq!(
            buf.insert(3, Bytes::from_static(b"llo!"), false),
            Err(Error::FinalSizeError)
        );
        // FIN below data already seen.
        let mut buf = RecvBuffer::new(1024);
        buf.insert(4, Bytes::from_static(b"data"), false).unwrap();
        assert_eq!(
            buf.insert(0, Bytes::from_static(b"x"), true),
            Err(Error::FinalSizeError)
        );
    }

    #[test]
    fn test_finished_after_full_delivery() {
        let mut buf = RecvBuffer::new(1024);
        buf.insert(0, Bytes::from_static(b"done"), true).unwrap();
        assert!(!buf.is_finished());
        buf.read(100).unwrap();
        assert!(buf.is_finished());
    }

    #[test]
    fn test_reset_final_size_conflict() {
        let mut buf = RecvBuffer::new(1024);
        buf.insert(0, Bytes::from_static(b"hello"), true).unwrap();
        assert_eq!(buf.on_reset(9), Err(Error::FinalSizeError));
        assert_eq!(buf.on_reset(5), Ok(0));
    }

    #[test]
    fn test_window_refresh_at_half() {
        let mut buf = RecvBuffer::new(100);
        buf.insert(0, Bytes::from(vec![0u8; 60]), false).unwrap();
        assert_eq!(buf.max_data_update(), None);
        buf.read(60).unwrap();
        // 40 remaining < 50 (half the window): re-advertise.
        assert_eq!(buf.max_data_update(), Some(160));
        assert_eq!(buf.max_data_update(), None);
    }

    #[test]
    fn test_flow_accounting_charges_new_bytes_once() {
        let mut buf = RecvBuffer::new(1024);
        assert_eq!(buf.insert(0, Bytes::from_static(b"aaaa"), false).unwrap(), 4);
        assert_eq!(buf.insert(2, Bytes::from_static(b"aabb"), false).unwrap(), 2);
        assert_eq!(buf.insert(0, Bytes::from_static(b"aa"), false).unwrap(), 0);
        assert_eq!(buf.highest_received(), 6);
    }
}
