//! Packet protection: AEAD sealing plus header protection
//! (RFC 9001 Sections 5.3, 5.4).

use super::{Aead, CryptoBackend, HeaderProtection};
use crate::error::{Error, Result};
use crate::packet::number::read_truncated;
use crate::types::PacketNumber;
use std::sync::Arc;

/// Header protection samples 16 bytes starting 4 bytes past the packet
/// number offset, sized for the longest packet number encoding.
pub const SAMPLE_LEN: usize = 16;
const SAMPLE_SKIP: usize = 4;

/// Per-level key material and the packet protection transform.
///
/// Immutable once installed; discarded together with its packet number
/// space.
pub struct CryptoSeal {
    key: Vec<u8>,
    iv: [u8; 12],
    hp_key: Vec<u8>,
    aead: Arc<dyn Aead>,
    hp: Arc<dyn HeaderProtection>,
}

impl std::fmt::Debug for CryptoSeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("CryptoSeal").finish_non_exhaustive()
    }
}

impl CryptoSeal {
    /// Derive key, IV, and header-protection key from a TLS traffic secret
    /// (RFC 9001 Section 5.1).
    pub fn from_secret(
        backend: &dyn CryptoBackend,
        secret: &[u8],
        cipher_suite: u16,
    ) -> Result<Self> {
        let aead = backend.aead(cipher_suite)?;
        let hp = backend.header_protection(cipher_suite)?;
        let ks = backend.key_schedule();

        let key = ks.expand_label(secret, "quic key", aead.key_len(), cipher_suite)?;
        let iv_bytes = ks.expand_label(secret, "quic iv", 12, cipher_suite)?;
        let hp_key = ks.expand_label(secret, "quic hp", hp.key_len(), cipher_suite)?;

        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_bytes);
        Ok(Self { key, iv, hp_key, aead, hp })
    }

    pub fn tag_len(&self) -> usize {
        self.aead.tag_len()
    }

    /// AEAD nonce: the IV XORed with the packet number, right-aligned
    /// big-endian (RFC 9001 Section 5.3).
    fn nonce(&self, pn: PacketNumber) -> [u8; 12] {
        let mut nonce = self.iv;
        for (i, byte) in pn.to_be_bytes().iter().enumerate() {
            nonce[4 + i] ^= byte;
        }
        nonce
    }

    /// Encrypt `plaintext` with the header as associated data.
    pub fn seal(
        &self,
        pn: PacketNumber,
        header: &[u8],
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        self.aead
            .seal(&self.key, &self.nonce(pn), header, plaintext, out)
    }

    /// Decrypt `ciphertext`; failure means the packet is dropped.
    pub fn open(
        &self,
        pn: PacketNumber,
        header: &[u8],
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        self.aead
            .open(&self.key, &self.nonce(pn), header, ciphertext, out)
    }

    /// Apply header protection to a finished packet in place.
    ///
    /// Masks the low first-byte bits (4 for long headers, 5 for short) and
    /// the packet number field (RFC 9001 Section 5.4.1).
    pub fn protect_header(
        &self,
        packet: &mut [u8],
        pn_offset: usize,
        pn_len: usize,
    ) -> Result<()> {
        let mask = self.sample_mask(packet, pn_offset)?;
        let form_mask = if packet[0] & 0x80 != 0 { 0x0f } else { 0x1f };
        packet[0] ^= mask[0] & form_mask;
        for i in 0..pn_len {
            packet[pn_offset + i] ^= mask[1 + i];
        }
        Ok(())
    }

    /// Remove header protection in place and decode the truncated packet
    /// number. Returns `(pn_len, truncated_pn)`.
    pub fn unprotect_header(
        &self,
        packet: &mut [u8],
        pn_offset: usize,
    ) -> Result<(usize, u64)> {
        let mask = self.sample_mask(packet, pn_offset)?;
        let form_mask = if packet[0] & 0x80 != 0 { 0x0f } else { 0x1f };
        packet[0] ^= mask[0] & form_mask;
        let pn_len = (packet[0] & 0x03) as usize + 1;
        if packet.len() < pn_offset + pn_len {
            return Err(Error::ProtocolViolation);
        }
        for i in 0..pn_len {
            packet[pn_offset + i] ^= mask[1 + i];
        }
        let truncated = read_truncated(&packet[pn_offset..pn_offset + pn_len]);
        Ok((pn_len, truncated))
    }

    fn sample_mask(&self, packet: &[u8], pn_offset: usize) -> Result<[u8; 5]> {
        let sample_at = pn_offset + SAMPLE_SKIP;
        let sample_end = sample_at + SAMPLE_LEN;
        if packet.len() < sample_end {
            return Err(Error::ProtocolViolation);
        }
        let mut sample = [0u8; SAMPLE_LEN];
        sample.copy_from_slice(&packet[sample_at..sample_end]);
        self.hp.mask(&self.hp_key, &sample)
    }
}
