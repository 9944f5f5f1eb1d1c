//! Frame decoding (RFC 9000 Section 12.4).
//!
//! Malformed input is a FRAME_ENCODING_ERROR; a frame that decodes but is
//! illegal for its packet type is the caller's PROTOCOL_VIOLATION to raise.

use super::*;
use crate::error::{Error, Result};
use crate::wire::Reader;

impl<'a> Frame<'a> {
    /// Decode the next frame from `r`.
    ///
    /// Consecutive PADDING bytes are folded into a single frame so a padded
    /// packet costs one iteration, not twelve hundred.
    pub fn parse(r: &mut Reader<'a>) -> Result<Frame<'a>> {
        let ty = r.get_varint()?;

        if ty == TYPE_PADDING {
            let mut len = 1;
            while r.peek_u8() == Ok(0x00) {
                r.skip(1)?;
                len += 1;
            }
            return Ok(Frame::Padding { len });
        }

        let frame = match ty {
            TYPE_PING => Frame::Ping,
            TYPE_ACK | TYPE_ACK_ECN => Frame::Ack(parse_ack(r, ty == TYPE_ACK_ECN)?),
            TYPE_RESET_STREAM => Frame::ResetStream {
                stream_id: StreamId(r.get_varint()?),
                error_code: r.get_varint()?,
                final_size: r.get_varint()?,
            },
            TYPE_STOP_SENDING => Frame::StopSending {
                stream_id: StreamId(r.get_varint()?),
                error_code: r.get_varint()?,
            },
            TYPE_CRYPTO => {
                let offset = r.get_varint()?;
                let data = r.get_varint_prefixed()?;
                Frame::Crypto { offset, data }
            }
            TYPE_NEW_TOKEN => {
                let token = r.get_varint_prefixed()?;
                if token.is_empty() {
                    return Err(Error::FrameEncodingError);
                }
                Frame::NewToken { token }
            }
            ty if (TYPE_STREAM_BASE..=TYPE_STREAM_BASE | 0x07).contains(&ty) => {
                let stream_id = StreamId(r.get_varint()?);
                let offset = if ty & STREAM_BIT_OFF != 0 {
                    r.get_varint()?
                } else {
                    0
                };
                let data = if ty & STREAM_BIT_LEN != 0 {
                    r.get_varint_prefixed()?
                } else {
                    // No length field: the frame extends to the end of the packet.
                    let rest = r.rest();
                    r.skip(rest.len())?;
                    rest
                };
                Frame::Stream(StreamFrame {
                    stream_id,
                    offset,
                    fin: ty & STREAM_BIT_FIN != 0,
                    data,
                })
            }
            TYPE_MAX_DATA => Frame::MaxData { max: r.get_varint()? },
            TYPE_MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: StreamId(r.get_varint()?),
                max: r.get_varint()?,
            },
            TYPE_MAX_STREAMS_BIDI | TYPE_MAX_STREAMS_UNI => {
                let max = r.get_varint()?;
                // A streams count above 2^60 cannot be a valid stream ID space.
                if max > 1 << 60 {
                    return Err(Error::FrameEncodingError);
                }
                let dir = if ty == TYPE_MAX_STREAMS_BIDI { Dir::Bi } else { Dir::Uni };
                Frame::MaxStreams { dir, max }
            }
            TYPE_DATA_BLOCKED => Frame::DataBlocked { limit: r.get_varint()? },
            TYPE_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                stream_id: StreamId(r.get_varint()?),
                limit: r.get_varint()?,
            },
            TYPE_STREAMS_BLOCKED_BIDI | TYPE_STREAMS_BLOCKED_UNI => {
                let dir = if ty == TYPE_STREAMS_BLOCKED_BIDI { Dir::Bi } else { Dir::Uni };
                Frame::StreamsBlocked { dir, limit: r.get_varint()? }
            }
            TYPE_NEW_CONNECTION_ID => {
                let seq = r.get_varint()?;
                let retire_prior_to = r.get_varint()?;
                if retire_prior_to > seq {
                    return Err(Error::FrameEncodingError);
                }
                let cid_len = r.get_u8()? as usize;
                if cid_len == 0 || cid_len > crate::types::MAX_CID_LENGTH {
                    return Err(Error::FrameEncodingError);
                }
                let cid = ConnectionId::from_slice(r.get_bytes(cid_len)?)
                    .ok_or(Error::FrameEncodingError)?;
                let mut reset_token = [0u8; 16];
                reset_token.copy_from_slice(r.get_bytes(16)?);
                Frame::NewConnectionId(NewConnectionIdFrame {
                    seq,
                    retire_prior_to,
                    cid,
                    reset_token,
                })
            }
            TYPE_RETIRE_CONNECTION_ID => Frame::RetireConnectionId { seq: r.get_varint()? },
            TYPE_PATH_CHALLENGE | TYPE_PATH_RESPONSE => {
                let mut data = [0u8; 8];
                data.copy_from_slice(r.get_bytes(8)?);
                if ty == TYPE_PATH_CHALLENGE {
                    Frame::PathChallenge { data }
                } else {
                    Frame::PathResponse { data }
                }
            }
            TYPE_CONNECTION_CLOSE | TYPE_CONNECTION_CLOSE_APP => {
                let is_application = ty == TYPE_CONNECTION_CLOSE_APP;
                let error_code = r.get_varint()?;
                let frame_type = if is_application { None } else { Some(r.get_varint()?) };
                let reason = r.get_varint_prefixed()?;
                Frame::ConnectionClose(CloseFrame {
                    error_code,
                    frame_type,
                    reason,
                    is_application,
                })
            }
            TYPE_HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => return Err(Error::FrameEncodingError),
        };

        Ok(frame)
    }
}

/// Decode an ACK frame, resolving the gap encoding into absolute ranges
/// (RFC 9000 Section 19.3.1). Any underflow in the gap arithmetic means the
/// sender encoded a negative packet number.
fn parse_ack(r: &mut Reader<'_>, has_ecn: bool) -> Result<AckFrame> {
    let largest = r.get_varint()?;
    let delay = r.get_varint()?;
    let range_count = r.get_varint()?;
    let first_range = r.get_varint()?;

    let mut smallest = largest
        .checked_sub(first_range)
        .ok_or(Error::FrameEncodingError)?;

    let mut ranges: TinyVec<[AckRange; 8]> = TinyVec::new();
    ranges.push(AckRange { smallest, largest });

    for _ in 0..range_count {
        let gap = r.get_varint()?;
        let len = r.get_varint()?;
        let range_largest = smallest
            .checked_sub(gap)
            .and_then(|v| v.checked_sub(2))
            .ok_or(Error::FrameEncodingError)?;
        smallest = range_largest
            .checked_sub(len)
            .ok_or(Error::FrameEncodingError)?;
        ranges.push(AckRange {
            smallest,
            largest: range_largest,
        });
    }

    let ecn = if has_ecn {
        Some(EcnCounts {
            ect0: r.get_varint()?,
            ect1: r.get_varint()?,
            ce: r.get_varint()?,
        })
    } else {
        None
    };

    Ok(AckFrame {
        largest,
        delay,
        ranges,
        ecn,
    })
}
