//! Cryptographic provider interfaces (RFC 9001).
//!
//! The state machine never touches a cipher directly: AEAD, header
//! protection, HKDF, and the TLS handshake are all behind traits. The
//! boring-backed implementations live in [`boring`]; tests drive the
//! connection with deterministic stand-ins.

pub mod boring;
mod seal;

pub use seal::CryptoSeal;

use crate::error::Result;
use crate::types::{ConnectionId, SpaceId};
use std::sync::Arc;

/// Encryption level of a packet or handshake byte stream (RFC 9001
/// Section 2.1). A closed set; levels map onto packet number spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CryptoLevel {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl CryptoLevel {
    pub fn space(self) -> SpaceId {
        match self {
            CryptoLevel::Initial => SpaceId::Initial,
            CryptoLevel::Handshake => SpaceId::Handshake,
            CryptoLevel::ZeroRtt | CryptoLevel::OneRtt => SpaceId::Application,
        }
    }
}

/// TLS 1.3 cipher suite identifiers negotiated for QUIC.
pub const TLS_AES_128_GCM_SHA256: u16 = 0x1301;
pub const TLS_AES_256_GCM_SHA384: u16 = 0x1302;
pub const TLS_CHACHA20_POLY1305_SHA256: u16 = 0x1303;

/// Initial salt for QUIC v1 (RFC 9001 Section 5.2).
pub const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Authenticated encryption primitive. Stateless: keys are provided per
/// call so one provider serves every level.
pub trait Aead: Send + Sync {
    fn seal(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize>;

    /// Decrypt and authenticate. Failure means the packet is dropped
    /// silently; it must never surface as a connection error.
    fn open(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<usize>;

    fn key_len(&self) -> usize;
    fn tag_len(&self) -> usize;
}

/// Header protection mask generator (RFC 9001 Section 5.4).
pub trait HeaderProtection: Send + Sync {
    /// Derive the 5-byte mask from a 16-byte ciphertext sample.
    fn mask(&self, key: &[u8], sample: &[u8; 16]) -> Result<[u8; 5]>;
    fn key_len(&self) -> usize;
}

/// HKDF operations of the TLS 1.3 key schedule (RFC 8446 Section 7.1).
pub trait KeySchedule: Send + Sync {
    /// HKDF-Extract with the hash of `cipher_suite`.
    fn extract(&self, salt: &[u8], ikm: &[u8], cipher_suite: u16) -> Result<Vec<u8>>;

    /// HKDF-Expand-Label with the "tls13 " prefix and empty context.
    fn expand_label(
        &self,
        secret: &[u8],
        label: &str,
        len: usize,
        cipher_suite: u16,
    ) -> Result<Vec<u8>>;
}

/// Factory tying the primitives together.
pub trait CryptoBackend: Send + Sync {
    fn aead(&self, cipher_suite: u16) -> Result<Arc<dyn Aead>>;
    fn header_protection(&self, cipher_suite: u16) -> Result<Arc<dyn HeaderProtection>>;
    fn key_schedule(&self) -> &dyn KeySchedule;
}

/// Derive the v1 initial secret from the client's first destination CID
/// (RFC 9001 Section 5.2). Always SHA-256, regardless of what the
/// handshake later negotiates.
pub fn initial_secret(backend: &dyn CryptoBackend, dcid: &ConnectionId) -> Result<Vec<u8>> {
    backend
        .key_schedule()
        .extract(&INITIAL_SALT_V1, dcid.as_bytes(), TLS_AES_128_GCM_SHA256)
}

/// Client and server initial traffic secrets.
pub fn initial_traffic_secrets(
    backend: &dyn CryptoBackend,
    dcid: &ConnectionId,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let initial = initial_secret(backend, dcid)?;
    let ks = backend.key_schedule();
    let client = ks.expand_label(&initial, "client in", 32, TLS_AES_128_GCM_SHA256)?;
    let server = ks.expand_label(&initial, "server in", 32, TLS_AES_128_GCM_SHA256)?;
    Ok((client, server))
}

// ============================================================================
// TLS session interface
// ============================================================================

/// What the handshake produced in response to input.
#[derive(Debug)]
pub enum TlsEvent {
    /// A decrypt secret for `level` is ready.
    ReadSecret {
        level: CryptoLevel,
        secret: Vec<u8>,
        cipher_suite: u16,
    },
    /// An encrypt secret for `level` is ready.
    WriteSecret {
        level: CryptoLevel,
        secret: Vec<u8>,
        cipher_suite: u16,
    },
    /// Handshake bytes to transmit in CRYPTO frames at `level`.
    HandshakeBytes { level: CryptoLevel, data: Vec<u8> },
    /// The handshake finished successfully.
    HandshakeComplete,
    /// A fatal TLS alert; close with CRYPTO_ERROR (0x100 | alert).
    Alert(u8),
}

/// Opaque TLS handshake driver.
///
/// The connection feeds it CRYPTO stream bytes tagged with their encryption
/// level and drains [`TlsEvent`]s after every call.
pub trait TlsSession: Send {
    /// Start the handshake (client: produce the first flight).
    fn start(&mut self) -> Result<()>;

    /// Deliver contiguous handshake bytes received at `level` and drive the
    /// handshake forward.
    fn read_handshake(&mut self, level: CryptoLevel, data: &[u8]) -> Result<()>;

    /// Drain the next pending event.
    fn next_event(&mut self) -> Option<TlsEvent>;

    fn is_handshake_complete(&self) -> bool;

    /// Negotiated ALPN protocol, once known.
    fn alpn(&self) -> Option<Vec<u8>>;

    /// The peer's raw quic_transport_parameters extension, once received.
    fn peer_transport_params(&self) -> Option<Vec<u8>>;

    /// Install our quic_transport_parameters before the handshake starts.
    fn set_transport_params(&mut self, params: &[u8]) -> Result<()>;
}
