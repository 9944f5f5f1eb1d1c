//! BoringSSL-backed crypto providers.
//!
//! AEAD through `EVP_AEAD_CTX`, header protection through AES-ECB (AES
//! suites) or a ChaCha20 keystream block (ChaCha suites), HKDF through
//! BoringSSL's one-shot helpers. Hash selection follows the negotiated
//! cipher suite; initial keys always use SHA-256.

use super::{
    Aead, CryptoBackend, HeaderProtection, KeySchedule, TLS_AES_128_GCM_SHA256,
    TLS_AES_256_GCM_SHA384, TLS_CHACHA20_POLY1305_SHA256,
};
use crate::error::{Error, Result};
use boring_sys as ffi;
use std::ptr;
use std::sync::Arc;

/// TLS alert `internal_error`, used when the library itself fails.
const ALERT_INTERNAL_ERROR: u8 = 80;

fn crypto_err() -> Error {
    Error::Crypto(ALERT_INTERNAL_ERROR)
}

pub struct BoringBackend {
    key_schedule: BoringKeySchedule,
}

impl BoringBackend {
    pub fn new() -> Self {
        Self {
            key_schedule: BoringKeySchedule,
        }
    }
}

impl Default for BoringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoBackend for BoringBackend {
    fn aead(&self, cipher_suite: u16) -> Result<Arc<dyn Aead>> {
        let aead = unsafe {
            match cipher_suite {
                TLS_AES_128_GCM_SHA256 => ffi::EVP_aead_aes_128_gcm(),
                TLS_AES_256_GCM_SHA384 => ffi::EVP_aead_aes_256_gcm(),
                TLS_CHACHA20_POLY1305_SHA256 => ffi::EVP_aead_chacha20_poly1305(),
                _ => return Err(crypto_err()),
            }
        };
        Ok(Arc::new(BoringAead { aead }))
    }

    fn header_protection(&self, cipher_suite: u16) -> Result<Arc<dyn HeaderProtection>> {
        let (cipher, is_chacha) = unsafe {
            match cipher_suite {
                TLS_AES_128_GCM_SHA256 => (ffi::EVP_aes_128_ecb(), false),
                TLS_AES_256_GCM_SHA384 => (ffi::EVP_aes_256_ecb(), false),
                TLS_CHACHA20_POLY1305_SHA256 => (
                    ffi::EVP_get_cipherbyname(c"chacha20".as_ptr()),
                    true,
                ),
                _ => return Err(crypto_err()),
            }
        };
        if cipher.is_null() {
            return Err(crypto_err());
        }
        Ok(Arc::new(BoringHeaderProtection { cipher, is_chacha }))
    }

    fn key_schedule(&self) -> &dyn KeySchedule {
        &self.key_schedule
    }
}

// ============================================================================
// AEAD
// ============================================================================

struct BoringAead {
    aead: *const ffi::EVP_AEAD,
}

unsafe impl Send for BoringAead {}
unsafe impl Sync for BoringAead {}

/// EVP_AEAD_CTX with cleanup on drop.
struct AeadCtx(ffi::EVP_AEAD_CTX);

impl AeadCtx {
    fn init(aead: *const ffi::EVP_AEAD, key: &[u8]) -> Result<Self> {
        unsafe {
            let mut ctx: ffi::EVP_AEAD_CTX = std::mem::zeroed();
            if ffi::EVP_AEAD_CTX_init(
                &mut ctx,
                aead,
                key.as_ptr(),
                key.len(),
                ffi::EVP_AEAD_DEFAULT_TAG_LENGTH as usize,
                ptr::null_mut(),
            ) != 1
            {
                return Err(crypto_err());
            }
            Ok(Self(ctx))
        }
    }
}

impl Drop for AeadCtx {
    fn drop(&mut self) {
        unsafe { ffi::EVP_AEAD_CTX_cleanup(&mut self.0) };
    }
}

impl Aead for BoringAead {
    fn seal(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        let mut ctx = AeadCtx::init(self.aead, key)?;
        let mut out_len = 0usize;
        let rc = unsafe {
            ffi::EVP_AEAD_CTX_seal(
                &mut ctx.0,
                out.as_mut_ptr(),
                &mut out_len,
                out.len(),
                nonce.as_ptr(),
                nonce.len(),
                plaintext.as_ptr(),
                plaintext.len(),
                aad.as_ptr(),
                aad.len(),
            )
        };
        if rc != 1 {
            return Err(crypto_err());
        }
        Ok(out_len)
    }

    fn open(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        let mut ctx = AeadCtx::init(self.aead, key)?;
        let mut out_len = 0usize;
        let rc = unsafe {
            ffi::EVP_AEAD_CTX_open(
                &mut ctx.0,
                out.as_mut_ptr(),
                &mut out_len,
                out.len(),
                nonce.as_ptr(),
                nonce.len(),
                ciphertext.as_ptr(),
                ciphertext.len(),
                aad.as_ptr(),
                aad.len(),
            )
        };
        if rc != 1 {
            return Err(crypto_err());
        }
        Ok(out_len)
    }

    fn key_len(&self) -> usize {
        unsafe { ffi::EVP_AEAD_key_length(self.aead) }
    }

    fn tag_len(&self) -> usize {
        unsafe { ffi::EVP_AEAD_max_tag_len(self.aead) }
    }
}

// ============================================================================
// Header protection
// ============================================================================

struct BoringHeaderProtection {
    cipher: *const ffi::EVP_CIPHER,
    is_chacha: bool,
}

unsafe impl Send for BoringHeaderProtection {}
unsafe impl Sync for BoringHeaderProtection {}

struct CipherCtx(*mut ffi::EVP_CIPHER_CTX);

impl Drop for CipherCtx {
    fn drop(&mut self) {
        unsafe { ffi::EVP_CIPHER_CTX_free(self.0) };
    }
}

impl HeaderProtection for BoringHeaderProtection {
    fn mask(&self, key: &[u8], sample: &[u8; 16]) -> Result<[u8; 5]> {
        let ctx = unsafe { ffi::EVP_CIPHER_CTX_new() };
        if ctx.is_null() {
            return Err(crypto_err());
        }
        let ctx = CipherCtx(ctx);

        let mut mask = [0u8; 5];
        let mut out_len: std::os::raw::c_int = 0;
        unsafe {
            if self.is_chacha {
                // sample[0..4] is the block counter (little-endian),
                // sample[4..16] the nonce; together they are exactly the
                // 16-byte EVP chacha20 IV. The mask is the keystream over
                // five zero bytes.
                if ffi::EVP_EncryptInit_ex(
                    ctx.0,
                    self.cipher,
                    ptr::null_mut(),
                    key.as_ptr(),
                    sample.as_ptr(),
                ) != 1
                {
                    return Err(crypto_err());
                }
                let zeros = [0u8; 5];
                if ffi::EVP_EncryptUpdate(
                    ctx.0,
                    mask.as_mut_ptr(),
                    &mut out_len,
                    zeros.as_ptr(),
                    zeros.len() as _,
                ) != 1
                {
                    return Err(crypto_err());
                }
            } else {
                // AES suites: mask = AES-ECB(hp_key, sample)[0..5].
                if ffi::EVP_EncryptInit_ex(
                    ctx.0,
                    self.cipher,
                    ptr::null_mut(),
                    key.as_ptr(),
                    ptr::null(),
                ) != 1
                {
                    return Err(crypto_err());
                }
                let mut block = [0u8; 32];
                if ffi::EVP_EncryptUpdate(
                    ctx.0,
                    block.as_mut_ptr(),
                    &mut out_len,
                    sample.as_ptr(),
                    sample.len() as _,
                ) != 1
                {
                    return Err(crypto_err());
                }
                mask.copy_from_slice(&block[..5]);
            }
        }
        Ok(mask)
    }

    fn key_len(&self) -> usize {
        unsafe { ffi::EVP_CIPHER_key_length(self.cipher) as usize }
    }
}

// ============================================================================
// Key schedule
// ============================================================================

struct BoringKeySchedule;

fn suite_hash(cipher_suite: u16) -> *const ffi::EVP_MD {
    unsafe {
        match cipher_suite {
            TLS_AES_256_GCM_SHA384 => ffi::EVP_sha384(),
            _ => ffi::EVP_sha256(),
        }
    }
}

impl KeySchedule for BoringKeySchedule {
    fn extract(&self, salt: &[u8], ikm: &[u8], cipher_suite: u16) -> Result<Vec<u8>> {
        let mut out = vec![0u8; ffi::EVP_MAX_MD_SIZE as usize];
        let mut out_len = 0usize;
        let rc = unsafe {
            ffi::HKDF_extract(
                out.as_mut_ptr(),
                &mut out_len,
                suite_hash(cipher_suite),
                ikm.as_ptr(),
                ikm.len(),
                salt.as_ptr(),
                salt.len(),
            )
        };
        if rc != 1 {
            return Err(crypto_err());
        }
        out.truncate(out_len);
        Ok(out)
    }

    fn expand_label(
        &self,
        secret: &[u8],
        label: &str,
        len: usize,
        cipher_suite: u16,
    ) -> Result<Vec<u8>> {
        // HkdfLabel per RFC 8446 Section 7.1, with empty context.
        let full_label = format!("tls13 {label}");
        let mut info = Vec::with_capacity(4 + full_label.len());
        info.extend_from_slice(&(len as u16).to_be_bytes());
        info.push(full_label.len() as u8);
        info.extend_from_slice(full_label.as_bytes());
        info.push(0);

        let mut out = vec![0u8; len];
        let rc = unsafe {
            ffi::HKDF_expand(
                out.as_mut_ptr(),
                len,
                suite_hash(cipher_suite),
                secret.as_ptr(),
                secret.len(),
                info.as_ptr(),
                info.len(),
            )
        };
        if rc != 1 {
            return Err(crypto_err());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{initial_traffic_secrets, CryptoSeal};
    use crate::types::ConnectionId;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    /// RFC 9001 Appendix A: dcid 0x8394c8f03e515708.
    fn rfc_dcid() -> ConnectionId {
        ConnectionId::from_slice(&hex("8394c8f03e515708")).unwrap()
    }

    #[test]
    fn test_initial_secret_rfc9001_a1() {
        let backend = BoringBackend::new();
        let secret = crate::crypto::initial_secret(&backend, &rfc_dcid()).unwrap();
        assert_eq!(
            secret,
            hex("7db5df06e7a69e432496adedb00851923595221596ae2ae9fb8115c1e9ed0a44")
        );
    }

    #[test]
    fn test_client_server_initial_secrets_rfc9001_a1() {
        let backend = BoringBackend::new();
        let (client, server) = initial_traffic_secrets(&backend, &rfc_dcid()).unwrap();
        assert_eq!(
            client,
            hex("c00cf151ca5be075ed0ebfb5c80323c42d6b7db67881289af4008f1f6c357aea")
        );
        assert_eq!(
            server,
            hex("3c199828fd139efd216c155ad844cc81fb82fa8d7446fa7d78be803acdda951b")
        );
    }

    #[test]
    fn test_client_initial_key_material_rfc9001_a1() {
        let backend = BoringBackend::new();
        let (client, _) = initial_traffic_secrets(&backend, &rfc_dcid()).unwrap();
        let ks = backend.key_schedule();
        let key = ks
            .expand_label(&client, "quic key", 16, TLS_AES_128_GCM_SHA256)
            .unwrap();
        let iv = ks
            .expand_label(&client, "quic iv", 12, TLS_AES_128_GCM_SHA256)
            .unwrap();
        let hp = ks
            .expand_label(&client, "quic hp", 16, TLS_AES_128_GCM_SHA256)
            .unwrap();
        assert_eq!(key, hex("1f369613dd76d5467730efcbe3b1a22d"));
        assert_eq!(iv, hex("fa044b2f42a3fd3b46fb255c"));
        assert_eq!(hp, hex("9f50449e04a0e810283a1e9933adedd2"));
    }

    #[test]
    fn test_server_initial_key_material_rfc9001_a1() {
        let backend = BoringBackend::new();
        let (_, server) = initial_traffic_secrets(&backend, &rfc_dcid()).unwrap();
        let ks = backend.key_schedule();
        let key = ks
            .expand_label(&server, "quic key", 16, TLS_AES_128_GCM_SHA256)
            .unwrap();
        let iv = ks
            .expand_label(&server, "quic iv", 12, TLS_AES_128_GCM_SHA256)
            .unwrap();
        let hp = ks
            .expand_label(&server, "quic hp", 16, TLS_AES_128_GCM_SHA256)
            .unwrap();
        assert_eq!(key, hex("cf3a5331653c364c88f0f379b6067e37"));
        assert_eq!(iv, hex("0ac1493ca1905853b0bba03e"));
        assert_eq!(hp, hex("c206b8d9b9f0f37644430b490eeaa314"));
    }

    #[test]
    fn test_client_initial_header_mask_rfc9001_a2() {
        let backend = BoringBackend::new();
        let hp = backend.header_protection(TLS_AES_128_GCM_SHA256).unwrap();
        let key = hex("9f50449e04a0e810283a1e9933adedd2");
        let mut sample = [0u8; 16];
        sample.copy_from_slice(&hex("d1b1c98dd7689fb8ec11d242b123dc9b"));
        let mask = hp.mask(&key, &sample).unwrap();
        assert_eq!(&mask[..], &hex("437b9aec36")[..]);
    }

    #[test]
    fn test_aead_roundtrip_and_tamper_rejection() {
        let backend = BoringBackend::new();
        let (client, _) = initial_traffic_secrets(&backend, &rfc_dcid()).unwrap();
        let seal = CryptoSeal::from_secret(&backend, &client, TLS_AES_128_GCM_SHA256).unwrap();

        let header = [0xc3u8, 0x00, 0x00, 0x00, 0x01];
        let plaintext = b"protected payload";
        let mut ciphertext = vec![0u8; plaintext.len() + seal.tag_len()];
        let clen = seal.seal(2, &header, plaintext, &mut ciphertext).unwrap();
        assert_eq!(clen, ciphertext.len());

        let mut out = vec![0u8; clen];
        let plen = seal.open(2, &header, &ciphertext, &mut out).unwrap();
        assert_eq!(&out[..plen], plaintext);

        // Any flipped bit in ciphertext, tag, or header fails the open.
        for index in [0, clen - 1] {
            let mut tampered = ciphertext.clone();
            tampered[index] ^= 0x01;
            assert!(seal.open(2, &header, &tampered, &mut out).is_err());
        }
        let mut bad_header = header;
        bad_header[0] ^= 0x40;
        assert!(seal.open(2, &bad_header, &ciphertext, &mut out).is_err());
        // Wrong packet number changes the nonce.
        assert!(seal.open(3, &header, &ciphertext, &mut out).is_err());
    }

    #[test]
    fn test_header_protection_roundtrip() {
        let backend = BoringBackend::new();
        let (client, _) = initial_traffic_secrets(&backend, &rfc_dcid()).unwrap();
        let seal = CryptoSeal::from_secret(&backend, &client, TLS_AES_128_GCM_SHA256).unwrap();

        // A minimal long-header packet image: header, 2-byte pn, payload.
        let mut packet = vec![0u8; 64];
        packet[0] = 0xc1; // long header, pn_len = 2
        let pn_offset = 18;
        packet[pn_offset] = 0x01;
        packet[pn_offset + 1] = 0x02;
        for (i, byte) in packet.iter_mut().enumerate().skip(pn_offset + 2) {
            *byte = i as u8;
        }
        let original = packet.clone();

        seal.protect_header(&mut packet, pn_offset, 2).unwrap();
        assert_ne!(packet[..pn_offset + 2], original[..pn_offset + 2]);
        // Bits covered by the long-header mask only.
        assert_eq!(packet[0] & 0xf0, original[0] & 0xf0);

        let (pn_len, truncated) = seal.unprotect_header(&mut packet, pn_offset).unwrap();
        assert_eq!(pn_len, 2);
        assert_eq!(truncated, 0x0102);
        assert_eq!(packet, original);
    }
}
