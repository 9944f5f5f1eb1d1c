//! QUIC frame types (RFC 9000 Section 19).
//!
//! Frames are the unit of meaning inside a packet. Decoding is zero-copy:
//! STREAM, CRYPTO, NEW_TOKEN and CONNECTION_CLOSE payloads borrow from the
//! decrypted packet buffer and must not outlive the datagram-processing
//! call; anything needed longer is copied out by the handler.

mod encode;
mod parse;

use crate::types::{ConnectionId, Dir, SpaceId, StatelessResetToken, StreamId, VarIntCodec};
use tinyvec::TinyVec;

// Frame type identifiers (RFC 9000 Section 19).
pub const TYPE_PADDING: u64 = 0x00;
pub const TYPE_PING: u64 = 0x01;
pub const TYPE_ACK: u64 = 0x02;
pub const TYPE_ACK_ECN: u64 = 0x03;
pub const TYPE_RESET_STREAM: u64 = 0x04;
pub const TYPE_STOP_SENDING: u64 = 0x05;
pub const TYPE_CRYPTO: u64 = 0x06;
pub const TYPE_NEW_TOKEN: u64 = 0x07;
pub const TYPE_STREAM_BASE: u64 = 0x08; // 0x08..=0x0f
pub const TYPE_MAX_DATA: u64 = 0x10;
pub const TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const TYPE_MAX_STREAMS_BIDI: u64 = 0x12;
pub const TYPE_MAX_STREAMS_UNI: u64 = 0x13;
pub const TYPE_DATA_BLOCKED: u64 = 0x14;
pub const TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const TYPE_STREAMS_BLOCKED_BIDI: u64 = 0x16;
pub const TYPE_STREAMS_BLOCKED_UNI: u64 = 0x17;
pub const TYPE_NEW_CONNECTION_ID: u64 = 0x18;
pub const TYPE_RETIRE_CONNECTION_ID: u64 = 0x19;
pub const TYPE_PATH_CHALLENGE: u64 = 0x1a;
pub const TYPE_PATH_RESPONSE: u64 = 0x1b;
pub const TYPE_CONNECTION_CLOSE: u64 = 0x1c;
pub const TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;
pub const TYPE_HANDSHAKE_DONE: u64 = 0x1e;

// STREAM frame flag bits carried in the type byte (RFC 9000 Section 19.8).
pub const STREAM_BIT_FIN: u64 = 0x01;
pub const STREAM_BIT_LEN: u64 = 0x02;
pub const STREAM_BIT_OFF: u64 = 0x04;

/// One inclusive range of acknowledged packet numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckRange {
    pub smallest: u64,
    pub largest: u64,
}

/// ECN counters reported in ACK_ECN frames (RFC 9000 Section 19.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

/// Decoded ACK frame with ranges resolved to absolute packet numbers.
///
/// `ranges` is in descending order and includes the first range; the gap
/// encoding of the wire format is resolved during parse and re-derived
/// during encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest: u64,
    /// Raw ACK Delay field; scale by 2^ack_delay_exponent to get microseconds.
    pub delay: u64,
    pub ranges: TinyVec<[AckRange; 8]>,
    pub ecn: Option<EcnCounts>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame<'a> {
    pub stream_id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: &'a [u8],
}

impl StreamFrame<'_> {
    /// Encoded size of the header alone (type, id, offset, length), for a
    /// sender deciding how much data fits after it.
    pub fn header_size(stream_id: StreamId, offset: u64, data_len: usize) -> usize {
        let mut size = 1 + VarIntCodec::size(stream_id.value());
        if offset > 0 {
            size += VarIntCodec::size(offset);
        }
        size + VarIntCodec::size(data_len as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame<'a> {
    pub error_code: u64,
    /// Frame type that provoked the close; `None` for application closes.
    pub frame_type: Option<u64>,
    pub reason: &'a [u8],
    pub is_application: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub seq: u64,
    pub retire_prior_to: u64,
    pub cid: ConnectionId,
    pub reset_token: StatelessResetToken,
}

/// Every QUIC v1 frame (RFC 9000 Section 19).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A run of consecutive PADDING bytes, collapsed into one frame.
    Padding { len: usize },
    Ping,
    Ack(AckFrame),
    ResetStream {
        stream_id: StreamId,
        error_code: u64,
        final_size: u64,
    },
    StopSending { stream_id: StreamId, error_code: u64 },
    Crypto { offset: u64, data: &'a [u8] },
    NewToken { token: &'a [u8] },
    Stream(StreamFrame<'a>),
    MaxData { max: u64 },
    MaxStreamData { stream_id: StreamId, max: u64 },
    MaxStreams { dir: Dir, max: u64 },
    DataBlocked { limit: u64 },
    StreamDataBlocked { stream_id: StreamId, limit: u64 },
    StreamsBlocked { dir: Dir, limit: u64 },
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId { seq: u64 },
    PathChallenge { data: [u8; 8] },
    PathResponse { data: [u8; 8] },
    ConnectionClose(CloseFrame<'a>),
    HandshakeDone,
}

impl Frame<'_> {
    /// Wire type identifier of this frame.
    pub fn ty(&self) -> u64 {
        match self {
            Frame::Padding { .. } => TYPE_PADDING,
            Frame::Ping => TYPE_PING,
            Frame::Ack(ack) => {
                if ack.ecn.is_some() {
                    TYPE_ACK_ECN
                } else {
                    TYPE_ACK
                }
            }
            Frame::ResetStream { .. } => TYPE_RESET_STREAM,
            Frame::StopSending { .. } => TYPE_STOP_SENDING,
            Frame::Crypto { .. } => TYPE_CRYPTO,
            Frame::NewToken { .. } => TYPE_NEW_TOKEN,
            Frame::Stream(s) => {
                let mut ty = TYPE_STREAM_BASE | STREAM_BIT_LEN;
                if s.offset > 0 {
                    ty |= STREAM_BIT_OFF;
                }
                if s.fin {
                    ty |= STREAM_BIT_FIN;
                }
                ty
            }
            Frame::MaxData { .. } => TYPE_MAX_DATA,
            Frame::MaxStreamData { .. } => TYPE_MAX_STREAM_DATA,
            Frame::MaxStreams { dir: Dir::Bi, .. } => TYPE_MAX_STREAMS_BIDI,
            Frame::MaxStreams { dir: Dir::Uni, .. } => TYPE_MAX_STREAMS_UNI,
            Frame::DataBlocked { .. } => TYPE_DATA_BLOCKED,
            Frame::StreamDataBlocked { .. } => TYPE_STREAM_DATA_BLOCKED,
            Frame::StreamsBlocked { dir: Dir::Bi, .. } => TYPE_STREAMS_BLOCKED_BIDI,
            Frame::StreamsBlocked { dir: Dir::Uni, .. } => TYPE_STREAMS_BLOCKED_UNI,
            Frame::NewConnectionId(_) => TYPE_NEW_CONNECTION_ID,
            Frame::RetireConnectionId { .. } => TYPE_RETIRE_CONNECTION_ID,
            Frame::PathChallenge { .. } => TYPE_PATH_CHALLENGE,
            Frame::PathResponse { .. } => TYPE_PATH_RESPONSE,
            Frame::ConnectionClose(close) => {
                if close.is_application {
                    TYPE_CONNECTION_CLOSE_APP
                } else {
                    TYPE_CONNECTION_CLOSE
                }
            }
            Frame::HandshakeDone => TYPE_HANDSHAKE_DONE,
        }
    }

    /// Whether this frame obliges the receiver to acknowledge the packet
    /// (RFC 9000 Section 13.2): everything except ACK, PADDING and
    /// CONNECTION_CLOSE.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. } | Frame::Ack(_) | Frame::ConnectionClose(_)
        )
    }

    /// Packet-type admission check (RFC 9000 Section 12.4, Table 3).
    ///
    /// Initial and Handshake packets carry only handshake machinery plus
    /// transport-level closes. A disallowed frame is a PROTOCOL_VIOLATION.
    pub fn is_allowed_in(&self, space: SpaceId) -> bool {
        match space {
            SpaceId::Initial | SpaceId::Handshake => matches!(
                self,
                Frame::Padding { .. }
                    | Frame::Ping
                    | Frame::Ack(_)
                    | Frame::Crypto { .. }
                    | Frame::ConnectionClose(CloseFrame {
                        is_application: false,
                        ..
                    })
            ),
            SpaceId::Application => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::wire::{Reader, Writer};
    use tinyvec::tiny_vec;

    fn roundtrip(frame: &Frame) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let mut w = Writer::new(&mut buf);
        frame.encode(&mut w).unwrap();
        let len = w.pos();
        assert_eq!(len, frame.wire_size(), "wire_size mismatch for {frame:?}");
        buf.truncate(len);
        let mut r = Reader::new(&buf);
        let decoded = Frame::parse(&mut r).unwrap();
        assert_eq!(&decoded, frame);
        assert!(r.is_empty());
        buf
    }

    #[test]
    fn test_stream_frame_roundtrip() {
        roundtrip(&Frame::Stream(StreamFrame {
            stream_id: StreamId(4),
            offset: 0,
            fin: false,
            data: b"hello",
        }));
        roundtrip(&Frame::Stream(StreamFrame {
            stream_id: StreamId(3),
            offset: 70_000,
            fin: true,
            data: b"",
        }));
    }

    #[test]
    fn test_stream_frame_type_bits() {
        let bytes = roundtrip(&Frame::Stream(StreamFrame {
            stream_id: StreamId(0),
            offset: 9,
            fin: true,
            data: b"x",
        }));
        // OFF | LEN | FIN on top of the 0x08 base.
        assert_eq!(bytes[0], 0x0f);
    }

    #[test]
    fn test_ack_frame_roundtrip_multi_range() {
        roundtrip(&Frame::Ack(AckFrame {
            largest: 100,
            delay: 37,
            ranges: tiny_vec![
                AckRange { smallest: 95, largest: 100 },
                AckRange { smallest: 80, largest: 90 },
                AckRange { smallest: 4, largest: 4 },
            ],
            ecn: None,
        }));
    }

    #[test]
    fn test_ack_ecn_roundtrip() {
        roundtrip(&Frame::Ack(AckFrame {
            largest: 7,
            delay: 0,
            ranges: tiny_vec![AckRange { smallest: 0, largest: 7 }],
            ecn: Some(EcnCounts { ect0: 1, ect1: 2, ce: 3 }),
        }));
    }

    #[test]
    fn test_ack_frame_rejects_negative_range() {
        // First ACK Range larger than Largest Acknowledged.
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        w.put_varint(TYPE_ACK).unwrap();
        w.put_varint(5).unwrap(); // largest
        w.put_varint(0).unwrap(); // delay
        w.put_varint(0).unwrap(); // range count
        w.put_varint(9).unwrap(); // first range, underflows
        let len = w.pos();
        let mut r = Reader::new(&buf[..len]);
        assert_eq!(Frame::parse(&mut r), Err(Error::FrameEncodingError));
    }

    #[test]
    fn test_control_frames_roundtrip() {
        roundtrip(&Frame::Ping);
        roundtrip(&Frame::HandshakeDone);
        roundtrip(&Frame::MaxData { max: 1_000_000 });
        roundtrip(&Frame::MaxStreamData { stream_id: StreamId(8), max: 4096 });
        roundtrip(&Frame::MaxStreams { dir: Dir::Bi, max: 16 });
        roundtrip(&Frame::MaxStreams { dir: Dir::Uni, max: 3 });
        roundtrip(&Frame::DataBlocked { limit: 500 });
        roundtrip(&Frame::StreamDataBlocked { stream_id: StreamId(0), limit: 99 });
        roundtrip(&Frame::StreamsBlocked { dir: Dir::Uni, limit: 1 });
        roundtrip(&Frame::ResetStream { stream_id: StreamId(4), error_code: 7, final_size: 123 });
        roundtrip(&Frame::StopSending { stream_id: StreamId(4), error_code: 7 });
        roundtrip(&Frame::RetireConnectionId { seq: 2 });
        roundtrip(&Frame::PathChallenge { data: [1, 2, 3, 4, 5, 6, 7, 8] });
        roundtrip(&Frame::PathResponse { data: [8, 7, 6, 5, 4, 3, 2, 1] });
        roundtrip(&Frame::Crypto { offset: 42, data: b"client hello" });
        roundtrip(&Frame::NewToken { token: &[0xaa; 12] });
    }

    #[test]
    fn test_new_connection_id_roundtrip() {
        roundtrip(&Frame::NewConnectionId(NewConnectionIdFrame {
            seq: 1,
            retire_prior_to: 0,
            cid: ConnectionId::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
            reset_token: [0x5a; 16],
        }));
    }

    #[test]
    fn test_new_token_empty_is_error() {
        let mut buf = [0u8; 4];
        let mut w = Writer::new(&mut buf);
        w.put_varint(TYPE_NEW_TOKEN).unwrap();
        w.put_varint(0).unwrap();
        let len = w.pos();
        let mut r = Reader::new(&buf[..len]);
        assert_eq!(Frame::parse(&mut r), Err(Error::FrameEncodingError));
    }

    #[test]
    fn test_connection_close_roundtrip() {
        roundtrip(&Frame::ConnectionClose(CloseFrame {
            error_code: 0x0a,
            frame_type: Some(TYPE_STREAM_BASE),
            reason: b"bad stream frame",
            is_application: false,
        }));
        roundtrip(&Frame::ConnectionClose(CloseFrame {
            error_code: 99,
            frame_type: None,
            reason: b"",
            is_application: true,
        }));
    }

    #[test]
    fn test_padding_run_collapses() {
        let buf = [0u8; 5];
        let mut r = Reader::new(&buf);
        assert_eq!(Frame::parse(&mut r).unwrap(), Frame::Padding { len: 5 });
        assert!(r.is_empty());
    }

    #[test]
    fn test_unknown_frame_type_is_error() {
        let mut r = Reader::new(&[0x21]);
        assert_eq!(Frame::parse(&mut r), Err(Error::FrameEncodingError));
    }

    #[test]
    fn test_ack_eliciting_classification() {
        assert!(!Frame::Padding { len: 1 }.is_ack_eliciting());
        assert!(!Frame::Ack(AckFrame {
            largest: 0,
            delay: 0,
            ranges: tiny_vec![AckRange::default()],
            ecn: None,
        })
        .is_ack_eliciting());
        assert!(!Frame::ConnectionClose(CloseFrame {
            error_code: 0,
            frame_type: None,
            reason: b"",
            is_application: false,
        })
        .is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(Frame::HandshakeDone.is_ack_eliciting());
    }

    #[test]
    fn test_packet_type_admission() {
        let crypto = Frame::Crypto { offset: 0, data: b"x" };
        let stream = Frame::Stream(StreamFrame {
            stream_id: StreamId(0),
            offset: 0,
            fin: false,
            data: b"x",
        });
        let app_close = Frame::ConnectionClose(CloseFrame {
            error_code: 1,
            frame_type: None,
            reason: b"",
            is_application: true,
        });
        assert!(crypto.is_allowed_in(SpaceId::Initial));
        assert!(crypto.is_allowed_in(SpaceId::Handshake));
        assert!(!stream.is_allowed_in(SpaceId::Initial));
        assert!(!stream.is_allowed_in(SpaceId::Handshake));
        assert!(stream.is_allowed_in(SpaceId::Application));
        assert!(!app_close.is_allowed_in(SpaceId::Initial));
        assert!(app_close.is_allowed_in(SpaceId::Application));
        assert!(!Frame::HandshakeDone.is_allowed_in(SpaceId::Handshake));
    }
}
