//! Local connection ID generation.

use quiver_quic::ConnectionId;

/// Generate a random connection ID of `len` bytes.
///
/// Entropy comes from the OS; on the (never observed) failure path we fall
/// back to a counter so the endpoint keeps running rather than panicking
/// in the accept path.
pub fn random_cid(len: usize) -> ConnectionId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static FALLBACK: AtomicU64 = AtomicU64::new(0x9e37_79b9);

    let mut bytes = vec![0u8; len];
    if getrandom::getrandom(&mut bytes).is_err() {
        tracing::warn!("getrandom failed, using fallback CID entropy");
        let seed = FALLBACK.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (seed >> ((i % 8) * 8)) as u8 ^ (i as u8).wrapping_mul(137);
        }
    }
    ConnectionId::from_slice(&bytes).expect("configured CID length is within bounds")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_length_and_uniqueness() {
        let a = random_cid(8);
        let b = random_cid(8);
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
        assert_ne!(a, b);
    }
}
