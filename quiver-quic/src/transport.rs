//! Transport parameters (RFC 9000 Section 18).
//!
//! Exchanged once in each direction inside the TLS handshake as a sequence
//! of (varint id, varint length, value) entries. Unknown ids are skipped;
//! server-only parameters arriving from a client, duplicates, and
//! out-of-range values are a TRANSPORT_PARAMETER_ERROR.

use crate::error::{Error, Result};
use crate::types::{ConnectionId, Side, StatelessResetToken, DEFAULT_MAX_UDP_PAYLOAD_SIZE};
use crate::wire::{Reader, Writer};
use bytes::Bytes;

const ID_ORIGINAL_DCID: u64 = 0x00;
const ID_MAX_IDLE_TIMEOUT: u64 = 0x01;
const ID_STATELESS_RESET_TOKEN: u64 = 0x02;
const ID_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const ID_INITIAL_MAX_DATA: u64 = 0x04;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const ID_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const ID_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const ID_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const ID_ACK_DELAY_EXPONENT: u64 = 0x0a;
const ID_MAX_ACK_DELAY: u64 = 0x0b;
const ID_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const ID_PREFERRED_ADDRESS: u64 = 0x0d;
const ID_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const ID_INITIAL_SOURCE_CID: u64 = 0x0f;
const ID_RETRY_SOURCE_CID: u64 = 0x10;

/// The recognized transport parameters with their RFC 9000 defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParameters {
    pub original_destination_connection_id: Option<ConnectionId>,
    /// Milliseconds; 0 disables the idle timeout.
    pub max_idle_timeout: u64,
    pub stateless_reset_token: Option<StatelessResetToken>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    /// Milliseconds.
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    /// Opaque; this endpoint records but does not use it (no migration).
    pub preferred_address: Option<Bytes>,
    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: DEFAULT_MAX_UDP_PAYLOAD_SIZE,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            preferred_address: None,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

impl TransportParameters {
    /// Serialize for the quic_transport_parameters extension. Values at
    /// their defaults are omitted.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let mut w = Writer::new(&mut buf);

        // Parameter values are small; the fixed scratch buffer above is
        // comfortably larger than the largest possible encoding.
        let mut put_raw = |w: &mut Writer<'_>, id: u64, value: &[u8]| {
            w.put_varint(id).expect("transport params fit scratch");
            w.put_varint_prefixed(value).expect("transport params fit scratch");
        };
        fn put_varint_param(w: &mut Writer<'_>, id: u64, value: u64) {
            let mut scratch = [0u8; 8];
            let mut vw = Writer::new(&mut scratch);
            vw.put_varint(value).expect("scratch holds any varint");
            let len = vw.pos();
            w.put_varint(id).expect("transport params fit scratch");
            w.put_varint_prefixed(&scratch[..len])
                .expect("transport params fit scratch");
        }

        if let Some(cid) = &self.original_destination_connection_id {
            put_raw(&mut w, ID_ORIGINAL_DCID, cid.as_bytes());
        }
        if self.max_idle_timeout != 0 {
            put_varint_param(&mut w, ID_MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        }
        if let Some(token) = &self.stateless_reset_token {
            put_raw(&mut w, ID_STATELESS_RESET_TOKEN, token);
        }
        if self.max_udp_payload_size != DEFAULT_MAX_UDP_PAYLOAD_SIZE {
            put_varint_param(&mut w, ID_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        }
        if self.initial_max_data != 0 {
            put_varint_param(&mut w, ID_INITIAL_MAX_DATA, self.initial_max_data);
        }
        if self.initial_max_stream_data_bidi_local != 0 {
            put_varint_param(
                &mut w,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
                self.initial_max_stream_data_bidi_local,
            );
        }
        if self.initial_max_stream_data_bidi_remote != 0 {
            put_varint_param(
                &mut w,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
                self.initial_max_stream_data_bidi_remote,
            );
        }
        if self.initial_max_stream_data_uni != 0 {
            put_varint_param(
                &mut w,
                ID_INITIAL_MAX_STREAM_DATA_UNI,
                self.initial_max_stream_data_uni,
            );
        }
        if self.initial_max_streams_bidi != 0 {
            put_varint_param(&mut w, ID_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        }
        if self.initial_max_streams_uni != 0 {
            put_varint_param(&mut w, ID_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        }
        if self.ack_delay_exponent != 3 {
            put_varint_param(&mut w, ID_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        }
        if self.max_ack_delay != 25 {
            put_varint_param(&mut w, ID_MAX_ACK_DELAY, self.max_ack_delay);
        }
        if self.disable_active_migration {
            put_raw(&mut w, ID_DISABLE_ACTIVE_MIGRATION, &[]);
        }
        if let Some(addr) = &self.preferred_address {
            put_raw(&mut w, ID_PREFERRED_ADDRESS, addr);
        }
        if self.active_connection_id_limit != 2 {
            put_varint_param(
                &mut w,
                ID_ACTIVE_CONNECTION_ID_LIMIT,
                self.active_connection_id_limit,
            );
        }
        if let Some(cid) = &self.initial_source_connection_id {
            put_raw(&mut w, ID_INITIAL_SOURCE_CID, cid.as_bytes());
        }
        if let Some(cid) = &self.retry_source_connection_id {
            put_raw(&mut w, ID_RETRY_SOURCE_CID, cid.as_bytes());
        }

        let len = w.pos();
        buf.truncate(len);
        buf
    }

    /// Parse the peer's parameters. `from` is the role of the *sender*;
    /// server-only parameters from a client are rejected.
    pub fn decode(buf: &[u8], from: Side) -> Result<Self> {
        let mut params = Self::default();
        let mut r = Reader::new(buf);
        let mut seen: u64 = 0;

        while !r.is_empty() {
            let id = r.get_varint().map_err(|_| Error::TransportParameterError)?;
            let value = r
                .get_varint_prefixed()
                .map_err(|_| Error::TransportParameterError)?;

            if id < 64 {
                if seen & (1 << id) != 0 {
                    return Err(Error::TransportParameterError);
                }
                seen |= 1 << id;
            }

            if from == Side::Client
                && matches!(
                    id,
                    ID_ORIGINAL_DCID
                        | ID_STATELESS_RESET_TOKEN
                        | ID_PREFERRED_ADDRESS
                        | ID_RETRY_SOURCE_CID
                )
            {
                return Err(Error::TransportParameterError);
            }

            let varint_value = || -> Result<u64> {
                let mut vr = Reader::new(value);
                let v = vr.get_varint().map_err(|_| Error::TransportParameterError)?;
                if !vr.is_empty() {
                    return Err(Error::TransportParameterError);
                }
                Ok(v)
            };
            let cid_value =
                || ConnectionId::from_slice(value).ok_or(Error::TransportParameterError);

            match id {
                ID_ORIGINAL_DCID => {
                    params.original_destination_connection_id = Some(cid_value()?)
                }
                ID_MAX_IDLE_TIMEOUT => params.max_idle_timeout = varint_value()?,
                ID_STATELESS_RESET_TOKEN => {
                    let token: StatelessResetToken = value
                        .try_into()
                        .map_err(|_| Error::TransportParameterError)?;
                    params.stateless_reset_token = Some(token);
                }
                ID_MAX_UDP_PAYLOAD_SIZE => params.max_udp_payload_size = varint_value()?,
                ID_INITIAL_MAX_DATA => params.initial_max_data = varint_value()?,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = varint_value()?
                }
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = varint_value()?
                }
                ID_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = varint_value()?
                }
                ID_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = varint_value()?
                }
                ID_INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = varint_value()?,
                ID_ACK_DELAY_EXPONENT => params.ack_delay_exponent = varint_value()?,
                ID_MAX_ACK_DELAY => params.max_ack_delay = varint_value()?,
                ID_DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(Error::TransportParameterError);
                    }
                    params.disable_active_migration = true;
                }
                ID_PREFERRED_ADDRESS => {
                    params.preferred_address = Some(Bytes::copy_from_slice(value))
                }
                ID_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = varint_value()?
                }
                ID_INITIAL_SOURCE_CID => params.initial_source_connection_id = Some(cid_value()?),
                ID_RETRY_SOURCE_CID => params.retry_source_connection_id = Some(cid_value()?),
                _ => {} // unknown ids are ignored
            }
        }

        params.validate()?;
        Ok(params)
    }

    /// Range checks from RFC 9000 Section 18.2.
    fn validate(&self) -> Result<()> {
        if self.ack_delay_exponent > 20 {
            return Err(Error::TransportParameterError);
        }
        if self.max_ack_delay >= 1 << 14 {
            return Err(Error::TransportParameterError);
        }
        if self.max_udp_payload_size < 1200 {
            return Err(Error::TransportParameterError);
        }
        if self.active_connection_id_limit < 2 {
            return Err(Error::TransportParameterError);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_non_defaults() {
        let params = TransportParameters {
            max_idle_timeout: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 65536,
            initial_max_stream_data_bidi_remote: 65536,
            initial_max_stream_data_uni: 32768,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 8,
            max_ack_delay: 20,
            active_connection_id_limit: 4,
            initial_source_connection_id: ConnectionId::from_slice(&[1, 2, 3, 4]),
            ..Default::default()
        };
        let encoded = params.encode();
        let decoded = TransportParameters::decode(&encoded, Side::Client).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_defaults_are_omitted_from_encoding() {
        let encoded = TransportParameters::default().encode();
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_server_only_param_from_client_rejected() {
        let params = TransportParameters {
            stateless_reset_token: Some([7u8; 16]),
            ..Default::default()
        };
        let encoded = params.encode();
        assert_eq!(
            TransportParameters::decode(&encoded, Side::Client),
            Err(Error::TransportParameterError)
        );
        // The same bytes from a server are fine.
        assert!(TransportParameters::decode(&encoded, Side::Server).is_ok());
    }

    #[test]
    fn test_unknown_ids_ignored() {
        let mut buf = vec![0u8; 32];
        let mut w = Writer::new(&mut buf);
        w.put_varint(0x1f3f).unwrap(); // a GREASE-ish id
        w.put_varint_prefixed(&[0xde, 0xad]).unwrap();
        let len = w.pos();
        let params = TransportParameters::decode(&buf[..len], Side::Server).unwrap();
        assert_eq!(params, TransportParameters::default());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let params = TransportParameters {
            initial_max_data: 5,
            ..Default::default()
        };
        let mut encoded = params.encode();
        let copy = encoded.clone();
        encoded.extend_from_slice(&copy);
        assert_eq!(
            TransportParameters::decode(&encoded, Side::Server),
            Err(Error::TransportParameterError)
        );
    }

    #[test]
    fn test_range_validation() {
        for bad in [
            TransportParameters { ack_delay_exponent: 21, ..Default::default() },
            TransportParameters { max_ack_delay: 1 << 14, ..Default::default() },
            TransportParameters { max_udp_payload_size: 1199, ..Default::default() },
        ] {
            let encoded = bad.encode();
            assert_eq!(
                TransportParameters::decode(&encoded, Side::Server),
                Err(Error::TransportParameterError),
                "expected rejection of {bad:?}"
            );
        }
    }

    #[test]
    fn test_truncated_input_rejected() {
        let params = TransportParameters {
            initial_max_data: 100_000,
            ..Default::default()
        };
        let encoded = params.encode();
        assert_eq!(
            TransportParameters::decode(&encoded[..encoded.len() - 1], Side::Server),
            Err(Error::TransportParameterError)
        );
    }
}
