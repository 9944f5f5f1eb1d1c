//! TLS bridge over BoringSSL's QUIC integration (RFC 9001).
//!
//! The handshake runs inside BoringSSL; this module forwards CRYPTO stream
//! bytes into `SSL_provide_quic_data`, drives `SSL_do_handshake`, and turns
//! the `SSL_QUIC_METHOD` callbacks into [`TlsEvent`]s the connection
//! consumes: traffic secrets to install, handshake bytes to transmit, and
//! alerts to close with.
//!
//! The callbacks receive a raw context pointer. It is never a connection
//! address: a pointer to this session's event queue is registered in the
//! SSL ex-data slot only for the duration of each call into BoringSSL and
//! cleared before returning.

use crate::crypto::{CryptoLevel, TlsEvent, TlsSession};
use crate::error::{Error, Result};
use boring::pkey::PKey;
use boring::ssl::{AlpnError, Ssl, SslContext, SslMethod, SslVerifyMode, SslVersion};
use boring::x509::X509;
use boring_sys as ffi;
use foreign_types::ForeignType;
use std::collections::VecDeque;
use std::ffi::c_void;
use std::ptr;
use std::sync::OnceLock;

/// TLS alert `internal_error`.
const ALERT_INTERNAL_ERROR: u8 = 80;

fn ex_data_index() -> i32 {
    static INDEX: OnceLock<i32> = OnceLock::new();
    *INDEX.get_or_init(|| unsafe {
        ffi::SSL_get_ex_new_index(0, ptr::null_mut(), ptr::null_mut(), None, None)
    })
}

fn tls_err() -> Error {
    Error::Crypto(ALERT_INTERNAL_ERROR)
}

#[allow(unreachable_patterns)]
fn level_from_ffi(level: ffi::ssl_encryption_level_t) -> Option<CryptoLevel> {
    match level {
        ffi::ssl_encryption_level_t::ssl_encryption_initial => Some(CryptoLevel::Initial),
        ffi::ssl_encryption_level_t::ssl_encryption_early_data => Some(CryptoLevel::ZeroRtt),
        ffi::ssl_encryption_level_t::ssl_encryption_handshake => Some(CryptoLevel::Handshake),
        ffi::ssl_encryption_level_t::ssl_encryption_application => Some(CryptoLevel::OneRtt),
        _ => None,
    }
}

fn level_to_ffi(level: CryptoLevel) -> ffi::ssl_encryption_level_t {
    match level {
        CryptoLevel::Initial => ffi::ssl_encryption_level_t::ssl_encryption_initial,
        CryptoLevel::ZeroRtt => ffi::ssl_encryption_level_t::ssl_encryption_early_data,
        CryptoLevel::Handshake => ffi::ssl_encryption_level_t::ssl_encryption_handshake,
        CryptoLevel::OneRtt => ffi::ssl_encryption_level_t::ssl_encryption_application,
    }
}

/// TLS 1.3 handshake driver backed by BoringSSL.
pub struct BoringTlsSession {
    ssl: Ssl,
    events: VecDeque<TlsEvent>,
    complete_reported: bool,
}

impl BoringTlsSession {
    /// Client session. `server_name` becomes the SNI the server sees; it is
    /// supplied by the application, per connection.
    pub fn new_client(
        server_name: &str,
        alpn_protocols: &[Vec<u8>],
        verify_peer: bool,
    ) -> Result<Box<dyn TlsSession>> {
        let mut ctx = SslContext::builder(SslMethod::tls_client()).map_err(|_| tls_err())?;
        ctx.set_min_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|_| tls_err())?;
        ctx.set_max_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|_| tls_err())?;
        if !verify_peer {
            ctx.set_verify(SslVerifyMode::NONE);
        }

        if !alpn_protocols.is_empty() {
            ctx.set_alpn_protos(&wire_alpn(alpn_protocols))
                .map_err(|_| tls_err())?;
        }

        let ctx = ctx.build();
        let mut ssl = Ssl::new(&ctx).map_err(|_| tls_err())?;
        ssl.set_hostname(server_name).map_err(|_| tls_err())?;

        unsafe {
            ffi::SSL_set_connect_state(ssl.as_ptr());
            if ffi::SSL_set_quic_method(ssl.as_ptr(), &QUIC_METHOD) != 1 {
                return Err(tls_err());
            }
        }

        Ok(Box::new(Self {
            ssl,
            events: VecDeque::new(),
            complete_reported: false,
        }))
    }

    /// Server session with a PEM certificate chain and private key.
    pub fn new_server(
        cert_pem: &[u8],
        key_pem: &[u8],
        alpn_protocols: &[Vec<u8>],
    ) -> Result<Box<dyn TlsSession>> {
        let mut ctx = SslContext::builder(SslMethod::tls_server()).map_err(|_| tls_err())?;
        ctx.set_min_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|_| tls_err())?;
        ctx.set_max_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|_| tls_err())?;

        let cert = X509::from_pem(cert_pem).map_err(|_| tls_err())?;
        ctx.set_certificate(&cert).map_err(|_| tls_err())?;
        let key = PKey::private_key_from_pem(key_pem).map_err(|_| tls_err())?;
        ctx.set_private_key(&key).map_err(|_| tls_err())?;

        if !alpn_protocols.is_empty() {
            let ours = wire_alpn(alpn_protocols);
            ctx.set_alpn_select_callback(move |_, client| {
                select_alpn(&ours, client).ok_or(AlpnError::NOACK)
            });
        }

        let ssl = Ssl::new(&ctx.build()).map_err(|_| tls_err())?;
        unsafe {
            ffi::SSL_set_accept_state(ssl.as_ptr());
            if ffi::SSL_set_quic_method(ssl.as_ptr(), &QUIC_METHOD) != 1 {
                return Err(tls_err());
            }
        }

        Ok(Box::new(Self {
            ssl,
            events: VecDeque::new(),
            complete_reported: false,
        }))
    }

    /// Run `f` with the event queue registered in the SSL ex-data slot so
    /// the QUIC method callbacks can find it.
    fn with_registered_queue<R>(&mut self, f: impl FnOnce(*mut ffi::SSL) -> R) -> R {
        let ssl = self.ssl.as_ptr();
        unsafe {
            ffi::SSL_set_ex_data(
                ssl,
                ex_data_index(),
                &mut self.events as *mut VecDeque<TlsEvent> as *mut c_void,
            );
            let out = f(ssl);
            ffi::SSL_set_ex_data(ssl, ex_data_index(), ptr::null_mut());
            out
        }
    }

    fn drive_handshake(&mut self) -> Result<()> {
        let (rc, err) = self.with_registered_queue(|ssl| unsafe {
            let rc = ffi::SSL_do_handshake(ssl);
            (rc, ffi::SSL_get_error(ssl, rc))
        });

        if rc == 1 {
            if !self.complete_reported {
                self.complete_reported = true;
                self.events.push_back(TlsEvent::HandshakeComplete);
            }
            return Ok(());
        }
        match err {
            ffi::SSL_ERROR_WANT_READ | ffi::SSL_ERROR_WANT_WRITE => Ok(()),
            _ => {
                // A fatal alert was already queued by the callback when the
                // peer is at fault; this covers local failures.
                if !self.events.iter().any(|e| matches!(e, TlsEvent::Alert(_))) {
                    self.events.push_back(TlsEvent::Alert(ALERT_INTERNAL_ERROR));
                }
                Err(tls_err())
            }
        }
    }
}

impl TlsSession for BoringTlsSession {
    fn start(&mut self) -> Result<()> {
        self.drive_handshake()
    }

    fn read_handshake(&mut self, level: CryptoLevel, data: &[u8]) -> Result<()> {
        let provided = self.with_registered_queue(|ssl| unsafe {
            ffi::SSL_provide_quic_data(ssl, level_to_ffi(level), data.as_ptr(), data.len())
        });
        if provided != 1 {
            return Err(tls_err());
        }
        self.drive_handshake()
    }

    fn next_event(&mut self) -> Option<TlsEvent> {
        self.events.pop_front()
    }

    fn is_handshake_complete(&self) -> bool {
        unsafe { ffi::SSL_in_init(self.ssl.as_ptr()) == 0 }
    }

    fn alpn(&self) -> Option<Vec<u8>> {
        self.ssl.selected_alpn_protocol().map(<[u8]>::to_vec)
    }

    fn peer_transport_params(&self) -> Option<Vec<u8>> {
        unsafe {
            let mut data: *const u8 = ptr::null();
            let mut len: usize = 0;
            ffi::SSL_get_peer_quic_transport_params(self.ssl.as_ptr(), &mut data, &mut len);
            if data.is_null() || len == 0 {
                return None;
            }
            Some(std::slice::from_raw_parts(data, len).to_vec())
        }
    }

    fn set_transport_params(&mut self, params: &[u8]) -> Result<()> {
        let rc = unsafe {
            ffi::SSL_set_quic_transport_params(self.ssl.as_ptr(), params.as_ptr(), params.len())
        };
        if rc != 1 {
            return Err(tls_err());
        }
        Ok(())
    }
}

/// Length-prefixed ALPN wire encoding.
fn wire_alpn(protocols: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for proto in protocols {
        out.push(proto.len() as u8);
        out.extend_from_slice(proto);
    }
    out
}

/// First client protocol that appears in our list, borrowed from the
/// client's wire encoding.
fn select_alpn<'a>(ours: &[u8], client: &'a [u8]) -> Option<&'a [u8]> {
    let mut c = client;
    while let Some((&len, rest)) = c.split_first() {
        let len = len as usize;
        if rest.len() < len {
            return None;
        }
        let proto = &rest[..len];
        let mut s = ours;
        while let Some((&slen, srest)) = s.split_first() {
            let slen = slen as usize;
            if srest.len() < slen {
                break;
            }
            if &srest[..slen] == proto {
                return Some(proto);
            }
            s = &srest[slen..];
        }
        c = &rest[len..];
    }
    None
}

// ============================================================================
// SSL_QUIC_METHOD callbacks
// ============================================================================

static QUIC_METHOD: ffi::SSL_QUIC_METHOD = ffi::SSL_QUIC_METHOD {
    set_read_secret: Some(set_read_secret),
    set_write_secret: Some(set_write_secret),
    add_handshake_data: Some(add_handshake_data),
    flush_flight: Some(flush_flight),
    send_alert: Some(send_alert),
};

unsafe fn queue_of(ssl: *mut ffi::SSL) -> Option<&'static mut VecDeque<TlsEvent>> {
    let data = ffi::SSL_get_ex_data(ssl, ex_data_index()) as *mut VecDeque<TlsEvent>;
    data.as_mut()
}

unsafe fn cipher_suite_of(cipher: *const ffi::SSL_CIPHER) -> u16 {
    if cipher.is_null() {
        return crate::crypto::TLS_AES_128_GCM_SHA256;
    }
    // SSL_CIPHER_get_id returns 0x0300_0000 | suite.
    (ffi::SSL_CIPHER_get_id(cipher) & 0xffff) as u16
}

unsafe extern "C" fn set_read_secret(
    ssl: *mut ffi::SSL,
    level: ffi::ssl_encryption_level_t,
    cipher: *const ffi::SSL_CIPHER,
    secret: *const u8,
    secret_len: usize,
) -> i32 {
    let Some(events) = queue_of(ssl) else { return 0 };
    let Some(level) = level_from_ffi(level) else { return 0 };
    events.push_back(TlsEvent::ReadSecret {
        level,
        secret: std::slice::from_raw_parts(secret, secret_len).to_vec(),
        cipher_suite: cipher_suite_of(cipher),
    });
    1
}

unsafe extern "C" fn set_write_secret(
    ssl: *mut ffi::SSL,
    level: ffi::ssl_encryption_level_t,
    cipher: *const ffi::SSL_CIPHER,
    secret: *const u8,
    secret_len: usize,
) -> i32 {
    let Some(events) = queue_of(ssl) else { return 0 };
    let Some(level) = level_from_ffi(level) else { return 0 };
    events.push_back(TlsEvent::WriteSecret {
        level,
        secret: std::slice::from_raw_parts(secret, secret_len).to_vec(),
        cipher_suite: cipher_suite_of(cipher),
    });
    1
}

unsafe extern "C" fn add_handshake_data(
    ssl: *mut ffi::SSL,
    level: ffi::ssl_encryption_level_t,
    data: *const u8,
    len: usize,
) -> i32 {
    let Some(events) = queue_of(ssl) else { return 0 };
    let Some(level) = level_from_ffi(level) else { return 0 };
    events.push_back(TlsEvent::HandshakeBytes {
        level,
        data: std::slice::from_raw_parts(data, len).to_vec(),
    });
    1
}

unsafe extern "C" fn flush_flight(_ssl: *mut ffi::SSL) -> i32 {
    // Handshake bytes are already stream-buffered per level.
    1
}

unsafe extern "C" fn send_alert(
    ssl: *mut ffi::SSL,
    _level: ffi::ssl_encryption_level_t,
    alert: u8,
) -> i32 {
    let Some(events) = queue_of(ssl) else { return 0 };
    events.push_back(TlsEvent::Alert(alert));
    1
}
