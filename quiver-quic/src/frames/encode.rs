//! Frame serialization.
//!
//! `wire_size()` returns exactly what `encode()` will write, so the packet
//! builder can stop gathering before it would overflow the datagram.

use super::*;
use crate::error::Result;
use crate::wire::Writer;

fn varint_size(v: u64) -> usize {
    VarIntCodec::size(v)
}

impl Frame<'_> {
    /// Exact encoded length of this frame.
    pub fn wire_size(&self) -> usize {
        let ty_size = varint_size(self.ty());
        ty_size
            + match self {
                Frame::Padding { len } => len - 1,
                Frame::Ping | Frame::HandshakeDone => 0,
                Frame::Ack(ack) => ack_body_size(ack),
                Frame::ResetStream {
                    stream_id,
                    error_code,
                    final_size,
                } => {
                    varint_size(stream_id.value())
                        + varint_size(*error_code)
                        + varint_size(*final_size)
                }
                Frame::StopSending { stream_id, error_code } => {
                    varint_size(stream_id.value()) + varint_size(*error_code)
                }
                Frame::Crypto { offset, data } => {
                    varint_size(*offset) + varint_size(data.len() as u64) + data.len()
                }
                Frame::NewToken { token } => varint_size(token.len() as u64) + token.len(),
                Frame::Stream(s) => {
                    let mut size = varint_size(s.stream_id.value());
                    if s.offset > 0 {
                        size += varint_size(s.offset);
                    }
                    size + varint_size(s.data.len() as u64) + s.data.len()
                }
                Frame::MaxData { max } => varint_size(*max),
                Frame::MaxStreamData { stream_id, max } => {
                    varint_size(stream_id.value()) + varint_size(*max)
                }
                Frame::MaxStreams { max, .. } => varint_size(*max),
                Frame::DataBlocked { limit } => varint_size(*limit),
                Frame::StreamDataBlocked { stream_id, limit } => {
                    varint_size(stream_id.value()) + varint_size(*limit)
                }
                Frame::StreamsBlocked { limit, .. } => varint_size(*limit),
                Frame::NewConnectionId(f) => {
                    varint_size(f.seq)
                        + varint_size(f.retire_prior_to)
                        + 1
                        + f.cid.len()
                        + 16
                }
                Frame::RetireConnectionId { seq } => varint_size(*seq),
                Frame::PathChallenge { .. } | Frame::PathResponse { .. } => 8,
                Frame::ConnectionClose(close) => {
                    varint_size(close.error_code)
                        + close.frame_type.map_or(0, varint_size)
                        + varint_size(close.reason.len() as u64)
                        + close.reason.len()
                }
            }
    }

    /// Serialize this frame into `w`.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        w.put_varint(self.ty())?;
        match self {
            Frame::Padding { len } => {
                for _ in 1..*len {
                    w.put_u8(0x00)?;
                }
            }
            Frame::Ping | Frame::HandshakeDone => {}
            Frame::Ack(ack) => encode_ack(ack, w)?,
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                w.put_varint(stream_id.value())?;
                w.put_varint(*error_code)?;
                w.put_varint(*final_size)?;
            }
            Frame::StopSending { stream_id, error_code } => {
                w.put_varint(stream_id.value())?;
                w.put_varint(*error_code)?;
            }
            Frame::Crypto { offset, data } => {
                w.put_varint(*offset)?;
                w.put_varint_prefixed(data)?;
            }
            Frame::NewToken { token } => {
                w.put_varint_prefixed(token)?;
            }
            Frame::Stream(s) => {
                w.put_varint(s.stream_id.value())?;
                if s.offset > 0 {
                    w.put_varint(s.offset)?;
                }
                w.put_varint_prefixed(s.data)?;
            }
            Frame::MaxData { max } => w.put_varint(*max)?,
            Frame::MaxStreamData { stream_id, max } => {
                w.put_varint(stream_id.value())?;
                w.put_varint(*max)?;
            }
            Frame::MaxStreams { max, .. } => w.put_varint(*max)?,
            Frame::DataBlocked { limit } => w.put_varint(*limit)?,
            Frame::StreamDataBlocked { stream_id, limit } => {
                w.put_varint(stream_id.value())?;
                w.put_varint(*limit)?;
            }
            Frame::StreamsBlocked { limit, .. } => w.put_varint(*limit)?,
            Frame::NewConnectionId(f) => {
                w.put_varint(f.seq)?;
                w.put_varint(f.retire_prior_to)?;
                w.put_u8(f.cid.len() as u8)?;
                w.put_slice(f.cid.as_bytes())?;
                w.put_slice(&f.reset_token)?;
            }
            Frame::RetireConnectionId { seq } => w.put_varint(*seq)?,
            Frame::PathChallenge { data } | Frame::PathResponse { data } => {
                w.put_slice(data)?;
            }
            Frame::ConnectionClose(close) => {
                w.put_varint(close.error_code)?;
                if let Some(frame_type) = close.frame_type {
                    w.put_varint(frame_type)?;
                }
                w.put_varint_prefixed(close.reason)?;
            }
        }
        Ok(())
    }
}

fn ack_body_size(ack: &AckFrame) -> usize {
    let first = &ack.ranges[0];
    let mut size = varint_size(ack.largest)
        + varint_size(ack.delay)
        + varint_size(ack.ranges.len() as u64 - 1)
        + varint_size(first.largest - first.smallest);
    let mut prev_smallest = first.smallest;
    for range in &ack.ranges[1..] {
        size += varint_size(prev_smallest - range.largest - 2);
        size += varint_size(range.largest - range.smallest);
        prev_smallest = range.smallest;
    }
    if let Some(ecn) = &ack.ecn {
        size += varint_size(ecn.ect0) + varint_size(ecn.ect1) + varint_size(ecn.ce);
    }
    size
}

/// Serialize absolute ranges back into the gap encoding of RFC 9000 §19.3.
/// `ack.ranges` must be descending, non-adjacent, and start at `largest`.
fn encode_ack(ack: &AckFrame, w: &mut Writer<'_>) -> Result<()> {
    debug_assert!(!ack.ranges.is_empty());
    debug_assert_eq!(ack.ranges[0].largest, ack.largest);

    let first = &ack.ranges[0];
    w.put_varint(ack.largest)?;
    w.put_varint(ack.delay)?;
    w.put_varint(ack.ranges.len() as u64 - 1)?;
    w.put_varint(first.largest - first.smallest)?;

    let mut prev_smallest = first.smallest;
    for range in &ack.ranges[1..] {
        debug_assert!(range.largest + 2 <= prev_smallest);
        w.put_varint(prev_smallest - range.largest - 2)?;
        w.put_varint(range.largest - range.smallest)?;
        prev_smallest = range.smallest;
    }

    if let Some(ecn) = &ack.ecn {
        w.put_varint(ecn.ect0)?;
        w.put_varint(ecn.ect1)?;
        w.put_varint(ecn.ce)?;
    }
    Ok(())
}
