//! Packet number truncation and reconstruction (RFC 9000 Section 17.1,
//! Appendices A.2 and A.3).

use crate::types::PacketNumber;
use crate::wire::{WireResult, Writer};

/// Minimum encoded length in bytes for `full` given the peer's largest
/// acknowledged packet number (RFC 9000 Appendix A.2).
pub fn pn_len(full: PacketNumber, largest_acked: Option<PacketNumber>) -> usize {
    let num_unacked = match largest_acked {
        Some(acked) => full - acked,
        None => full + 1,
    };
    if num_unacked < 1 << 7 {
        1
    } else if num_unacked < 1 << 15 {
        2
    } else if num_unacked < 1 << 23 {
        3
    } else {
        4
    }
}

/// Write the low `len` bytes of `full`, big-endian.
pub fn encode_pn(full: PacketNumber, len: usize, w: &mut Writer<'_>) -> WireResult<()> {
    debug_assert!((1..=4).contains(&len));
    let bytes = full.to_be_bytes();
    w.put_slice(&bytes[8 - len..])
}

/// Read a truncated packet number of `len` bytes.
pub fn read_truncated(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

/// Reconstruct the full packet number from its truncated form
/// (RFC 9000 Appendix A.3).
///
/// Picks the candidate with the given low bits closest to
/// `largest_received + 1`, breaking ties toward the smaller value.
pub fn decode_pn(
    largest_received: Option<PacketNumber>,
    truncated: u64,
    len: usize,
) -> PacketNumber {
    let expected = largest_received.map_or(0, |l| l + 1);
    let pn_nbits = len * 8;
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated;
    if candidate + pn_hwin <= expected && candidate + pn_win < 1 << 62 {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}
