//! Transport error taxonomy (RFC 9000 Section 20).
//!
//! These are the errors that can appear in CONNECTION_CLOSE frames. Local
//! operational failures that never reach the wire (short buffers, a full
//! reassembly window) are handled where they occur and only escalate here
//! when they evidence peer misbehavior.

use crate::wire::ShortBuffer;
use thiserror::Error;

/// Transport-level error code (RFC 9000 Section 20.1).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("no error")]
    NoError,

    #[error("internal error")]
    InternalError,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("flow control error")]
    FlowControlError,

    #[error("stream limit error")]
    StreamLimitError,

    #[error("stream state error")]
    StreamStateError,

    #[error("final size error")]
    FinalSizeError,

    #[error("frame encoding error")]
    FrameEncodingError,

    #[error("transport parameter error")]
    TransportParameterError,

    #[error("connection ID limit error")]
    ConnectionIdLimitError,

    #[error("protocol violation")]
    ProtocolViolation,

    #[error("invalid token")]
    InvalidToken,

    #[error("application error")]
    ApplicationError,

    #[error("crypto buffer exceeded")]
    CryptoBufferExceeded,

    /// TLS alert surfaced by the handshake (0x0100 | alert code).
    #[error("crypto error: alert {0:#x}")]
    Crypto(u8),
}

impl Error {
    /// Wire error code for CONNECTION_CLOSE frames.
    pub fn to_wire(self) -> u64 {
        match self {
            Error::NoError => 0x00,
            Error::InternalError => 0x01,
            Error::ConnectionRefused => 0x02,
            Error::FlowControlError => 0x03,
            Error::StreamLimitError => 0x04,
            Error::StreamStateError => 0x05,
            Error::FinalSizeError => 0x06,
            Error::FrameEncodingError => 0x07,
            Error::TransportParameterError => 0x08,
            Error::ConnectionIdLimitError => 0x09,
            Error::ProtocolViolation => 0x0a,
            Error::InvalidToken => 0x0b,
            Error::ApplicationError => 0x0c,
            Error::CryptoBufferExceeded => 0x0d,
            Error::Crypto(alert) => 0x0100 | alert as u64,
        }
    }

    /// Map a received wire code back to an error.
    ///
    /// Unrecognized codes collapse to `ProtocolViolation` rather than being
    /// rejected; a close is a close.
    pub fn from_wire(code: u64) -> Self {
        match code {
            0x00 => Error::NoError,
            0x01 => Error::InternalError,
            0x02 => Error::ConnectionRefused,
            0x03 => Error::FlowControlError,
            0x04 => Error::StreamLimitError,
            0x05 => Error::StreamStateError,
            0x06 => Error::FinalSizeError,
            0x07 => Error::FrameEncodingError,
            0x08 => Error::TransportParameterError,
            0x09 => Error::ConnectionIdLimitError,
            0x0a => Error::ProtocolViolation,
            0x0b => Error::InvalidToken,
            0x0c => Error::ApplicationError,
            0x0d => Error::CryptoBufferExceeded,
            0x0100..=0x01ff => Error::Crypto((code & 0xff) as u8),
            _ => Error::ProtocolViolation,
        }
    }
}

impl From<ShortBuffer> for Error {
    fn from(_: ShortBuffer) -> Self {
        Error::FrameEncodingError
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_roundtrip() {
        for code in 0x00..=0x0d {
            assert_eq!(Error::from_wire(code).to_wire(), code);
        }
        assert_eq!(Error::Crypto(0x28).to_wire(), 0x0128);
        assert_eq!(Error::from_wire(0x0128), Error::Crypto(0x28));
    }

    #[test]
    fn test_unknown_code_is_protocol_violation() {
        assert_eq!(Error::from_wire(0x9f), Error::ProtocolViolation);
        assert_eq!(Error::from_wire(0x4000), Error::ProtocolViolation);
    }
}
