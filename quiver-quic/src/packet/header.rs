//! Packet header parsing and construction (RFC 9000 Section 17).
//!
//! Headers are decoded in two stages: everything up to the packet number is
//! plaintext and parsed here; the packet number length and low first-byte
//! bits are under header protection and only known after the crypto layer
//! removes the mask.

use crate::error::{Error, Result};
use crate::types::{SpaceId, MAX_CID_LENGTH};
use crate::wire::{Reader, WireResult, Writer};

/// QUIC version 1 (RFC 9000).
pub const VERSION_1: u32 = 0x0000_0001;

const FORM_LONG: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

/// Packet type, from the header form and long-header type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    OneRtt,
    /// Long header with version 0; never processed, only recognized.
    VersionNegotiation,
}

impl PacketType {
    /// Packet number space this packet type belongs to.
    pub fn space(self) -> Option<SpaceId> {
        match self {
            PacketType::Initial => Some(SpaceId::Initial),
            PacketType::Handshake => Some(SpaceId::Handshake),
            PacketType::ZeroRtt | PacketType::OneRtt => Some(SpaceId::Application),
            PacketType::Retry | PacketType::VersionNegotiation => None,
        }
    }

    fn long_type_bits(self) -> u8 {
        match self {
            PacketType::Initial => 0x0,
            PacketType::ZeroRtt => 0x1,
            PacketType::Handshake => 0x2,
            PacketType::Retry => 0x3,
            _ => unreachable!("short header packets have no type bits"),
        }
    }
}

/// A header parsed up to (but not including) the protected packet number.
///
/// `pn_offset` is relative to the start of the packet within its datagram;
/// for long headers `payload_len` covers packet number + payload + AEAD tag,
/// for short headers the packet extends to the end of the datagram.
#[derive(Debug)]
pub struct PlainHeader<'a> {
    pub ty: PacketType,
    pub version: u32,
    pub dcid: &'a [u8],
    pub scid: &'a [u8],
    /// Initial packets only; empty otherwise.
    pub token: &'a [u8],
    pub payload_len: Option<usize>,
    pub pn_offset: usize,
}

impl<'a> PlainHeader<'a> {
    /// Parse the plaintext portion of the packet at the front of `r`.
    ///
    /// `local_cid_len` is the fixed length this endpoint issues, needed to
    /// delimit the DCID of short-header packets.
    pub fn decode(r: &mut Reader<'a>, local_cid_len: usize) -> Result<PlainHeader<'a>> {
        let start = r.pos();
        let first = r.get_u8()?;

        if first & FORM_LONG == 0 {
            // Short header: fixed bit must be set, DCID length is implicit.
            if first & FIXED_BIT == 0 {
                return Err(Error::ProtocolViolation);
            }
            let dcid = r.get_bytes(local_cid_len)?;
            return Ok(PlainHeader {
                ty: PacketType::OneRtt,
                version: 0,
                dcid,
                scid: &[],
                token: &[],
                payload_len: None,
                pn_offset: r.pos() - start,
            });
        }

        let version = r.get_u32()?;
        let dcid = Self::decode_cid(r)?;
        let scid = Self::decode_cid(r)?;

        if version == 0 {
            return Ok(PlainHeader {
                ty: PacketType::VersionNegotiation,
                version,
                dcid,
                scid,
                token: &[],
                payload_len: None,
                pn_offset: r.pos() - start,
            });
        }
        if first & FIXED_BIT == 0 {
            return Err(Error::ProtocolViolation);
        }

        let ty = match (first >> 4) & 0x3 {
            0x0 => PacketType::Initial,
            0x1 => PacketType::ZeroRtt,
            0x2 => PacketType::Handshake,
            _ => PacketType::Retry,
        };

        let token = if ty == PacketType::Initial {
            r.get_varint_prefixed().map_err(Error::from)?
        } else {
            &[]
        };

        if ty == PacketType::Retry {
            // Retry carries a token and integrity tag in place of a payload.
            return Ok(PlainHeader {
                ty,
                version,
                dcid,
                scid,
                token: r.rest(),
                payload_len: None,
                pn_offset: r.pos() - start,
            });
        }

        let length = r.get_varint()?;
        let length = usize::try_from(length).map_err(|_| Error::FrameEncodingError)?;
        if length > r.remaining() {
            return Err(Error::FrameEncodingError);
        }

        Ok(PlainHeader {
            ty,
            version,
            dcid,
            scid,
            token,
            payload_len: Some(length),
            pn_offset: r.pos() - start,
        })
    }

    fn decode_cid(r: &mut Reader<'a>) -> Result<&'a [u8]> {
        let len = r.get_u8()? as usize;
        if len > MAX_CID_LENGTH {
            return Err(Error::ProtocolViolation);
        }
        Ok(r.get_bytes(len)?)
    }
}

/// Offsets a packet builder needs to finish a long-header packet after the
/// payload length is known.
pub struct LongHeaderMarks {
    /// Where the 2-byte Length field sits, relative to the packet start.
    pub length_pos: usize,
    /// Where the packet number begins, relative to the packet start.
    pub pn_offset: usize,
}

/// Write a long header through the (unprotected) packet number.
///
/// The Length field is written as a 2-byte varint placeholder; the caller
/// patches it once the payload and AEAD tag sizes are final.
pub fn encode_long(
    w: &mut Writer<'_>,
    ty: PacketType,
    version: u32,
    dcid: &[u8],
    scid: &[u8],
    token: &[u8],
    pn: u64,
    pn_len: usize,
) -> WireResult<LongHeaderMarks> {
    let first = FORM_LONG | FIXED_BIT | (ty.long_type_bits() << 4) | (pn_len as u8 - 1);
    w.put_u8(first)?;
    w.put_u32(version)?;
    w.put_u8(dcid.len() as u8)?;
    w.put_slice(dcid)?;
    w.put_u8(scid.len() as u8)?;
    w.put_slice(scid)?;
    if ty == PacketType::Initial {
        w.put_varint_prefixed(token)?;
    }
    let length_pos = w.pos();
    w.put_varint_u16(0)?;
    let pn_offset = w.pos();
    super::number::encode_pn(pn, pn_len, w)?;
    Ok(LongHeaderMarks { length_pos, pn_offset })
}

/// Write a short (1-RTT) header through the (unprotected) packet number.
/// Returns the packet number offset relative to the packet start.
pub fn encode_short(
    w: &mut Writer<'_>,
    dcid: &[u8],
    pn: u64,
    pn_len: usize,
) -> WireResult<usize> {
    let first = FIXED_BIT | (pn_len as u8 - 1);
    w.put_u8(first)?;
    w.put_slice(dcid)?;
    let pn_offset = w.pos();
    super::number::encode_pn(pn, pn_len, w)?;
    Ok(pn_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::number;

    #[test]
    fn test_long_header_roundtrip() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        let marks = encode_long(
            &mut w,
            PacketType::Initial,
            VERSION_1,
            &[1, 2, 3, 4],
            &[5, 6],
            b"tok",
            7,
            2,
        )
        .unwrap();
        let total = w.pos();
        // Patch the length: pn (2) + pretend payload (0) + tag (16).
        buf[marks.length_pos..marks.length_pos + 2].copy_from_slice(&(0x4000u16 | 18).to_be_bytes());
        // Fake the tag bytes so the length check passes.
        let total = total + 16;

        let mut r = Reader::new(&buf[..total]);
        let hdr = PlainHeader::decode(&mut r, 4).unwrap();
        assert_eq!(hdr.ty, PacketType::Initial);
        assert_eq!(hdr.version, VERSION_1);
        assert_eq!(hdr.dcid, &[1, 2, 3, 4]);
        assert_eq!(hdr.scid, &[5, 6]);
        assert_eq!(hdr.token, b"tok");
        assert_eq!(hdr.payload_len, Some(18));
        assert_eq!(hdr.pn_offset, marks.pn_offset);
        assert_eq!(number::read_truncated(&buf[hdr.pn_offset..hdr.pn_offset + 2]), 7);
    }

    #[test]
    fn test_short_header_roundtrip() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        let pn_offset = encode_short(&mut w, &[9, 9, 9, 9, 9, 9, 9, 9], 0x2a, 1).unwrap();
        let total = w.pos();

        let mut r = Reader::new(&buf[..total]);
        let hdr = PlainHeader::decode(&mut r, 8).unwrap();
        assert_eq!(hdr.ty, PacketType::OneRtt);
        assert_eq!(hdr.dcid, &[9u8; 8]);
        assert_eq!(hdr.payload_len, None);
        assert_eq!(hdr.pn_offset, pn_offset);
    }

    #[test]
    fn test_version_negotiation_recognized() {
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        w.put_u8(0x80).unwrap();
        w.put_u32(0).unwrap();
        w.put_u8(2).unwrap();
        w.put_slice(&[1, 2]).unwrap();
        w.put_u8(0).unwrap();
        let len = w.pos();
        let mut r = Reader::new(&buf[..len]);
        let hdr = PlainHeader::decode(&mut r, 0).unwrap();
        assert_eq!(hdr.ty, PacketType::VersionNegotiation);
        assert!(hdr.ty.space().is_none());
    }

    #[test]
    fn test_fixed_bit_clear_rejected() {
        let mut r = Reader::new(&[0x00, 0x01]);
        assert!(PlainHeader::decode(&mut r, 1).is_err());
    }

    #[test]
    fn test_oversized_cid_rejected() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        w.put_u8(0xc3).unwrap();
        w.put_u32(VERSION_1).unwrap();
        w.put_u8(21).unwrap(); // DCID length beyond the RFC cap
        w.put_slice(&[0u8; 21]).unwrap();
        let len = w.pos();
        let mut r = Reader::new(&buf[..len]);
        assert_eq!(
            PlainHeader::decode(&mut r, 0).unwrap_err(),
            Error::ProtocolViolation
        );
    }

    #[test]
    fn test_truncated_length_rejected() {
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        let _ = encode_long(
            &mut w,
            PacketType::Handshake,
            VERSION_1,
            &[1],
            &[2],
            &[],
            0,
            1,
        )
        .unwrap();
        let total = w.pos();
        // Length still claims more than the datagram holds (placeholder 0x4000
        // was patched by nobody, so claim a huge value instead).
        buf[total - 3] = 0x7f; // length varint -> 0x3f?? keep simple: claim 0x3fXX
        let mut r = Reader::new(&buf[..total]);
        assert!(PlainHeader::decode(&mut r, 0).is_err());
    }
}
