//! Connection state machine (RFC 9000 Sections 5, 10).
//!
//! A pure state machine: datagrams and timestamps in, datagrams and events
//! out. No sockets, no threads, no wall clock. The owning event loop calls
//! [`Connection::handle_datagram`], [`Connection::on_timeout`], and
//! [`Connection::poll_transmit`], and reads application-facing
//! [`Event`]s from [`Connection::poll_event`].

mod cids;

use crate::crypto::{
    initial_traffic_secrets, CryptoBackend, CryptoLevel, CryptoSeal, TlsEvent, TlsSession,
    TLS_AES_128_GCM_SHA256,
};
use crate::error::{Error, Result};
use crate::flow_control::ConnectionFlow;
use crate::frames::{self, CloseFrame, Frame, NewConnectionIdFrame, StreamFrame};
use crate::packet::header::{self, PacketType, PlainHeader, VERSION_1};
use crate::packet::number::{decode_pn, pn_len};
use crate::packet::space::{PacketSpace, SentFrame, SentPacket};
use crate::recovery::Recovery;
use crate::stream::{StreamManager, StreamParams};
use crate::transport::TransportParameters;
use crate::types::{
    ConnectionId, Dir, Instant, Side, SpaceId, StreamId, VarIntCodec, AMPLIFICATION_FACTOR,
    MIN_INITIAL_DATAGRAM_SIZE,
};
use crate::wire::{Reader, Writer};
use bytes::Bytes;
use cids::RemoteCids;
use core::time::Duration;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Packets held for an encryption level whose keys are not yet installed.
const MAX_UNDECRYPTABLE_BUFFERED: usize = 8;

/// Bound on buffered crypto stream data per level.
const MAX_CRYPTO_BUFFER: u64 = 65536;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, no Initial packet exchanged yet.
    Start,
    /// Handshake in progress.
    WaitingHandshake,
    /// TLS reports completion; HANDSHAKE_DONE not yet settled.
    HandshakeConfirmed,
    /// Fully established.
    Connected,
    /// Local close sent; re-sending CONNECTION_CLOSE on peer traffic.
    Closing,
    /// Peer close received; absorbing stray packets silently.
    Draining,
    /// Terminal.
    Closed,
}

/// Application-visible connection events, drained via
/// [`Connection::poll_event`].
#[derive(Debug, Clone)]
pub enum Event {
    HandshakeComplete,
    /// Peer opened a stream.
    StreamOpened { id: StreamId },
    /// Ordered stream bytes ready for the application.
    StreamData { id: StreamId, data: Bytes, fin: bool },
    /// Peer finished the stream (all data delivered).
    StreamFinished { id: StreamId },
    /// Peer reset the stream.
    StreamReset { id: StreamId, error_code: u64 },
    /// Stream credit arrived; a blocked open may now succeed.
    StreamCreditAvailable,
    /// Address validation token for future connections (client only).
    NewToken { token: Bytes },
    /// Close is underway (local or remote).
    ConnectionClosing {
        error_code: u64,
        reason: Bytes,
        is_application: bool,
    },
    /// Terminal; the connection can be dropped.
    ConnectionClosed,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub smoothed_rtt: Duration,
}

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Our transport parameters (windows, limits, idle timeout).
    pub transport: TransportParameters,
    /// Datagram size budget for sends.
    pub max_udp_payload_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportParameters {
                max_idle_timeout: 30_000,
                initial_max_data: 1 << 20,
                initial_max_stream_data_bidi_local: 1 << 18,
                initial_max_stream_data_bidi_remote: 1 << 18,
                initial_max_stream_data_uni: 1 << 18,
                initial_max_streams_bidi: 100,
                initial_max_streams_uni: 100,
                ..Default::default()
            },
            max_udp_payload_size: MIN_INITIAL_DATAGRAM_SIZE,
        }
    }
}

impl ConnectionConfig {
    fn stream_params(&self) -> StreamParams {
        StreamParams {
            max_stream_data_bidi_local: self.transport.initial_max_stream_data_bidi_local,
            max_stream_data_bidi_remote: self.transport.initial_max_stream_data_bidi_remote,
            max_stream_data_uni: self.transport.initial_max_stream_data_uni,
            max_streams_bidi: self.transport.initial_max_streams_bidi,
            max_streams_uni: self.transport.initial_max_streams_uni,
        }
    }
}

/// Control frames owed to the peer, re-queued on loss.
#[derive(Debug, Default)]
struct Pending {
    max_data: Option<u64>,
    /// stream id -> new limit for MAX_STREAM_DATA.
    max_stream_data: BTreeMap<u64, u64>,
    handshake_done: bool,
    /// (id, error code, final size) for RESET_STREAM.
    resets: Vec<(StreamId, u64, u64)>,
    /// (id, error code) for STOP_SENDING.
    stop_sending: Vec<(StreamId, u64)>,
    retire_cids: Vec<u64>,
    path_response: Option<[u8; 8]>,
    streams_blocked: Option<Dir>,
}

#[derive(Debug)]
struct CloseState {
    error_code: u64,
    frame_type: Option<u64>,
    reason: Vec<u8>,
    is_application: bool,
    deadline: Instant,
    /// A CONNECTION_CLOSE transmission is owed.
    respond: bool,
}

/// One QUIC connection.
pub struct Connection {
    side: Side,
    state: State,
    config: ConnectionConfig,

    local_cid: ConnectionId,
    /// The client's first destination CID; keys and (for servers) the
    /// original_destination_connection_id parameter derive from it.
    original_dcid: ConnectionId,
    /// Client adopts the server's SCID from the first response.
    remote_cid_settled: bool,

    backend: Arc<dyn CryptoBackend>,
    tls: Box<dyn TlsSession>,

    spaces: [PacketSpace; 3],
    space_active: [bool; 3],
    read_seals: [Option<CryptoSeal>; 3],
    write_seals: [Option<CryptoSeal>; 3],
    undecryptable: Vec<(SpaceId, Vec<u8>)>,

    streams: StreamManager,
    flow: ConnectionFlow,
    recovery: Recovery,
    probes: [u8; 3],

    peer_params: Option<TransportParameters>,
    remote_cids: RemoteCids,

    pending: Pending,
    events: VecDeque<Event>,
    close: Option<CloseState>,

    handshake_complete: bool,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,

    /// Server-side anti-amplification accounting until the path validates.
    address_validated: bool,
    bytes_received_total: usize,
    bytes_sent_unvalidated: usize,

    stats: ConnectionStats,
}

impl Connection {
    /// Client connection. `dcid` is the random destination CID the Initial
    /// keys derive from; the TLS session carries the SNI and ALPN.
    pub fn new_client(
        config: ConnectionConfig,
        local_cid: ConnectionId,
        dcid: ConnectionId,
        mut tls: Box<dyn TlsSession>,
        backend: Arc<dyn CryptoBackend>,
        now: Instant,
    ) -> Result<Self> {
        let mut transport = config.transport.clone();
        transport.initial_source_connection_id = Some(local_cid.clone());
        tls.set_transport_params(&transport.encode())?;

        let mut conn = Self::new_common(
            Side::Client,
            config,
            local_cid,
            dcid.clone(),
            dcid,
            tls,
            backend,
            now,
        )?;
        conn.tls.start()?;
        conn.pump_tls(now)?;
        Ok(conn)
    }

    /// Server connection for a freshly seen Initial. `client_scid` is the
    /// peer's source CID, `original_dcid` the destination CID the client
    /// chose (which the Initial keys derive from).
    pub fn new_server(
        config: ConnectionConfig,
        local_cid: ConnectionId,
        client_scid: ConnectionId,
        original_dcid: ConnectionId,
        mut tls: Box<dyn TlsSession>,
        backend: Arc<dyn CryptoBackend>,
        now: Instant,
    ) -> Result<Self> {
        let mut transport = config.transport.clone();
        transport.initial_source_connection_id = Some(local_cid.clone());
        transport.original_destination_connection_id = Some(original_dcid.clone());
        tls.set_transport_params(&transport.encode())?;

        let mut conn = Self::new_common(
            Side::Server,
            config,
            local_cid,
            client_scid,
            original_dcid,
            tls,
            backend,
            now,
        )?;
        conn.remote_cid_settled = true;
        Ok(conn)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_common(
        side: Side,
        config: ConnectionConfig,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        original_dcid: ConnectionId,
        tls: Box<dyn TlsSession>,
        backend: Arc<dyn CryptoBackend>,
        now: Instant,
    ) -> Result<Self> {
        let (client_secret, server_secret) = initial_traffic_secrets(&*backend, &original_dcid)?;
        let (write_secret, read_secret) = match side {
            Side::Client => (client_secret, server_secret),
            Side::Server => (server_secret, client_secret),
        };
        let initial_write =
            CryptoSeal::from_secret(&*backend, &write_secret, TLS_AES_128_GCM_SHA256)?;
        let initial_read =
            CryptoSeal::from_secret(&*backend, &read_secret, TLS_AES_128_GCM_SHA256)?;

        let streams = StreamManager::new(side, config.stream_params());
        let flow = ConnectionFlow::new(config.transport.initial_max_data);
        let recovery = Recovery::new(config.max_udp_payload_size);
        let cid_limit = config.transport.active_connection_id_limit;
        let idle_ms = config.transport.max_idle_timeout;
        let idle_timeout = (idle_ms > 0).then(|| Duration::from_millis(idle_ms));

        Ok(Self {
            side,
            state: State::Start,
            config,
            local_cid,
            original_dcid,
            remote_cid_settled: false,
            backend,
            tls,
            spaces: [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()],
            space_active: [true; 3],
            read_seals: [Some(initial_read), None, None],
            write_seals: [Some(initial_write), None, None],
            undecryptable: Vec::new(),
            streams,
            flow,
            recovery,
            probes: [0; 3],
            peer_params: None,
            remote_cids: RemoteCids::new(remote_cid, cid_limit),
            pending: Pending::default(),
            events: VecDeque::new(),
            close: None,
            handshake_complete: false,
            idle_timeout,
            idle_deadline: idle_timeout.map(|t| now + t),
            address_validated: side == Side::Client,
            bytes_received_total: 0,
            bytes_sent_unvalidated: 0,
            stats: ConnectionStats::default(),
        })
    }

    // ======================================================================
    // Public surface
    // ======================================================================

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    #[cfg(test)]
    pub(crate) fn space_is_active(&self, space: SpaceId) -> bool {
        self.space_active[space as usize]
    }

    pub fn local_cid(&self) -> &ConnectionId {
        &self.local_cid
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats;
        stats.smoothed_rtt = self.recovery.rtt.smoothed();
        stats
    }

    /// Negotiated ALPN protocol, once the handshake settled it.
    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.tls.alpn()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Open a locally-initiated stream; `None` when the peer's stream
    /// limit blocks it (a STREAMS_BLOCKED frame is queued).
    pub fn open_stream(&mut self, dir: Dir) -> Option<StreamId> {
        match self.streams.open(dir) {
            Some(id) => Some(id),
            None => {
                self.pending.streams_blocked = Some(dir);
                None
            }
        }
    }

    /// Append application data to a stream's send buffer.
    pub fn write_stream(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        let stream = self.streams.get(id).ok_or(Error::StreamStateError)?;
        if stream.reset_sent.is_some() || stream.stop_sending_received {
            return Err(Error::StreamStateError);
        }
        let send = stream.send.as_mut().ok_or(Error::StreamStateError)?;
        send.enqueue(data)?;
        if fin {
            send.mark_end_of_data();
        }
        Ok(())
    }

    /// Abruptly terminate our send half of a stream.
    pub fn reset_stream(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        let stream = self.streams.get(id).ok_or(Error::StreamStateError)?;
        let send = stream.send.as_ref().ok_or(Error::StreamStateError)?;
        if stream.reset_sent.is_none() {
            let final_size = send.sent_high();
            stream.reset_sent = Some(error_code);
            self.pending.resets.push((id, error_code, final_size));
        }
        Ok(())
    }

    /// Ask the peer to stop sending on a stream.
    pub fn stop_sending(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        let stream = self.streams.get(id).ok_or(Error::StreamStateError)?;
        if stream.recv.is_none() {
            return Err(Error::StreamStateError);
        }
        self.pending.stop_sending.push((id, error_code));
        Ok(())
    }

    /// Application-initiated close.
    pub fn close(&mut self, error_code: u64, reason: &[u8], now: Instant) {
        self.begin_close(error_code, None, reason.to_vec(), true, now);
    }

    // ======================================================================
    // Receive path
    // ======================================================================

    /// Process one received datagram.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) {
        match self.state {
            State::Closed | State::Draining => return,
            State::Closing => {
                self.handle_datagram_closing(datagram, now);
                return;
            }
            _ => {}
        }

        self.stats.bytes_received += datagram.len() as u64;
        self.bytes_received_total += datagram.len();

        let mut offset = 0;
        while offset < datagram.len() {
            let mut r = Reader::new(&datagram[offset..]);
            let hdr = match PlainHeader::decode(&mut r, self.local_cid.len()) {
                Ok(hdr) => hdr,
                Err(_) => {
                    trace!("undecodable packet header, dropping rest of datagram");
                    return;
                }
            };
            let packet_len = match hdr.payload_len {
                Some(len) => hdr.pn_offset + len,
                None => datagram.len() - offset,
            };
            let mut packet = datagram[offset..offset + packet_len].to_vec();
            if let Err(err) = self.process_packet(&mut packet, now) {
                self.close_on_error(err, now);
                return;
            }
            offset += packet_len;
            if self.state == State::Closing || self.state == State::Draining {
                return;
            }
        }
    }

    /// Receive path while Closing. A CONNECTION_CLOSE from the peer moves
    /// the connection to Draining; any other decodable traffic earns one
    /// retransmission of our CONNECTION_CLOSE. Undecryptable packets keep
    /// dropping silently.
    fn handle_datagram_closing(&mut self, datagram: &[u8], now: Instant) {
        let mut offset = 0;
        while offset < datagram.len() {
            let mut r = Reader::new(&datagram[offset..]);
            let Ok(hdr) = PlainHeader::decode(&mut r, self.local_cid.len()) else {
                break;
            };
            let packet_len = match hdr.payload_len {
                Some(len) => hdr.pn_offset + len,
                None => datagram.len() - offset,
            };
            let pn_offset = hdr.pn_offset;
            let ty = hdr.ty;
            let mut packet = datagram[offset..offset + packet_len].to_vec();
            offset += packet_len;

            let Some(space_id) = ty.space() else { continue };
            if ty == PacketType::ZeroRtt {
                continue;
            }
            let idx = space_id as usize;
            if !self.space_active[idx] {
                continue;
            }
            let Some(seal) = self.read_seals[idx].as_ref() else {
                continue;
            };
            let Ok((pn_len, truncated)) = seal.unprotect_header(&mut packet, pn_offset) else {
                continue;
            };
            let pn = decode_pn(self.spaces[idx].ack_ranges.largest(), truncated, pn_len);
            // The packet buffer was cut to exactly this packet, so the
            // ciphertext is everything after the packet number.
            let (aad, ciphertext) = packet.split_at(pn_offset + pn_len);
            let mut out = vec![0u8; ciphertext.len()];
            let Ok(len) = seal.open(pn, aad, ciphertext, &mut out) else {
                continue;
            };
            out.truncate(len);

            let mut fr = Reader::new(&out);
            while !fr.is_empty() {
                let Ok(frame) = Frame::parse(&mut fr) else { break };
                if let Frame::ConnectionClose(close) = frame {
                    self.on_peer_close(&close, now);
                    return;
                }
            }
        }

        // No close from the peer: one CONNECTION_CLOSE per received
        // datagram, nothing more.
        if let Some(close) = &mut self.close {
            close.respond = true;
        }
    }

    fn process_packet(&mut self, packet: &mut Vec<u8>, now: Instant) -> Result<()> {
        let mut r = Reader::new(packet);
        let hdr = PlainHeader::decode(&mut r, self.local_cid.len())?;
        let ty = hdr.ty;
        let pn_offset = hdr.pn_offset;
        let packet_end = match hdr.payload_len {
            Some(len) => pn_offset + len,
            None => packet.len(),
        };
        let peer_scid = (!matches!(ty, PacketType::OneRtt)).then(|| hdr.scid.to_vec());

        match ty {
            PacketType::VersionNegotiation | PacketType::Retry => {
                trace!(?ty, "unsupported packet type dropped");
                return Ok(());
            }
            PacketType::ZeroRtt => {
                trace!("0-RTT packet dropped");
                return Ok(());
            }
            _ => {}
        }
        if !matches!(ty, PacketType::OneRtt) && hdr.version != VERSION_1 {
            trace!(version = hdr.version, "unknown version dropped");
            return Ok(());
        }

        let space_id = ty.space().expect("initial/handshake/1-rtt have a space");
        let idx = space_id as usize;
        if !self.space_active[idx] {
            trace!(?space_id, "packet for discarded space dropped");
            return Ok(());
        }
        if self.read_seals[idx].is_none() {
            if self.undecryptable.len() < MAX_UNDECRYPTABLE_BUFFERED {
                self.undecryptable.push((space_id, std::mem::take(packet)));
            }
            return Ok(());
        }

        // Unprotect, decode the packet number, decrypt. Failures drop the
        // packet silently; they must never become a connection error.
        let seal = self.read_seals[idx].as_ref().unwrap();
        let (plaintext, pn, first_byte) = {
            let (pn_len, truncated) = match seal.unprotect_header(packet, pn_offset) {
                Ok(v) => v,
                Err(_) => {
                    trace!("header unprotection failed, packet dropped");
                    return Ok(());
                }
            };
            let pn = decode_pn(self.spaces[idx].ack_ranges.largest(), truncated, pn_len);
            let (aad, rest) = packet.split_at(pn_offset + pn_len);
            let ciphertext = &rest[..packet_end - (pn_offset + pn_len)];
            let mut out = vec![0u8; ciphertext.len()];
            match seal.open(pn, aad, ciphertext, &mut out) {
                Ok(len) => {
                    out.truncate(len);
                    (out, pn, packet[0])
                }
                Err(_) => {
                    trace!(pn, "decryption failed, packet dropped");
                    return Ok(());
                }
            }
        };

        if self.spaces[idx].is_duplicate(pn) {
            trace!(pn, "duplicate packet dropped");
            return Ok(());
        }

        // Reserved bits are only checkable after a successful decrypt.
        let reserved = if first_byte & 0x80 != 0 { 0x0c } else { 0x18 };
        if first_byte & reserved != 0 {
            return Err(Error::ProtocolViolation);
        }

        if self.state == State::Start {
            self.state = State::WaitingHandshake;
        }

        // The peer's SCID from the first long-header response becomes our
        // destination CID.
        if !self.remote_cid_settled {
            if let Some(scid) = peer_scid {
                if let Some(cid) = ConnectionId::from_slice(&scid) {
                    self.remote_cids.update_handshake_cid(cid);
                    self.remote_cid_settled = true;
                }
            }
        }

        // A decrypted Handshake packet validates the client's address and
        // ends the server's use of Initial keys.
        if self.side == Side::Server && space_id == SpaceId::Handshake {
            self.address_validated = true;
            if self.space_active[SpaceId::Initial as usize] {
                self.discard_space(SpaceId::Initial);
            }
        }

        let mut ack_eliciting = false;
        let mut fr = Reader::new(&plaintext);
        while !fr.is_empty() {
            let frame = Frame::parse(&mut fr)?;
            if !frame.is_allowed_in(space_id) {
                return Err(Error::ProtocolViolation);
            }
            ack_eliciting |= frame.is_ack_eliciting();
            self.handle_frame(frame, space_id, now)?;
            if matches!(self.state, State::Draining | State::Closing | State::Closed) {
                break;
            }
        }

        let local_max_ack_delay = Duration::from_millis(self.config.transport.max_ack_delay);
        self.spaces[idx].on_packet_received(pn, ack_eliciting, now, local_max_ack_delay);
        self.stats.packets_received += 1;
        if ack_eliciting {
            self.touch_idle(now);
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame<'_>, space: SpaceId, now: Instant) -> Result<()> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}
            Frame::Ack(ack) => self.on_ack_frame(space, &ack, now)?,
            Frame::Crypto { offset, data } => {
                let level = match space {
                    SpaceId::Initial => CryptoLevel::Initial,
                    SpaceId::Handshake => CryptoLevel::Handshake,
                    SpaceId::Application => CryptoLevel::OneRtt,
                };
                let recv = &mut self.spaces[space as usize].crypto.recv;
                recv.insert(offset, Bytes::copy_from_slice(data), false)?;
                if recv.highest_received() - recv.delivered() > MAX_CRYPTO_BUFFER {
                    return Err(Error::CryptoBufferExceeded);
                }
                while let Some(chunk) = self.spaces[space as usize].crypto.recv.read(usize::MAX) {
                    self.tls.read_handshake(level, &chunk)?;
                }
                self.pump_tls(now)?;
            }
            Frame::Stream(frame) => self.on_stream_frame(frame)?,
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                let stream = self.streams.recv_side(stream_id)?;
                if stream.reset_received.is_none() {
                    let newly = stream
                        .recv
                        .as_mut()
                        .expect("recv_side streams have a recv half")
                        .on_reset(final_size)?;
                    stream.reset_received = Some(error_code);
                    stream.delivered_terminal_event = true;
                    self.flow.rx.on_received(newly)?;
                    self.events
                        .push_back(Event::StreamReset { id: stream_id, error_code });
                }
            }
            Frame::StopSending { stream_id, error_code } => {
                let stream = self.streams.send_side(stream_id)?;
                if !stream.stop_sending_received && stream.reset_sent.is_none() {
                    stream.stop_sending_received = true;
                    let final_size = stream
                        .send
                        .as_ref()
                        .map(|s| s.sent_high())
                        .unwrap_or_default();
                    stream.reset_sent = Some(error_code);
                    self.pending.resets.push((stream_id, error_code, final_size));
                }
            }
            Frame::MaxData { max } => {
                self.flow.tx.update_limit(max);
                self.events.push_back(Event::StreamCreditAvailable);
            }
            Frame::MaxStreamData { stream_id, max } => {
                let stream = self.streams.send_side(stream_id)?;
                if let Some(send) = &mut stream.send {
                    send.update_max_data(max);
                }
            }
            Frame::MaxStreams { dir, max } => {
                self.streams.on_max_streams(dir, max);
                self.events.push_back(Event::StreamCreditAvailable);
            }
            Frame::DataBlocked { limit } => {
                trace!(limit, "peer reports DATA_BLOCKED");
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                let _ = self.streams.recv_side(stream_id)?;
                trace!(%stream_id, limit, "peer reports STREAM_DATA_BLOCKED");
            }
            Frame::StreamsBlocked { dir, limit } => {
                trace!(?dir, limit, "peer reports STREAMS_BLOCKED");
            }
            Frame::NewToken { token } => {
                if self.side == Side::Server {
                    return Err(Error::ProtocolViolation);
                }
                self.events.push_back(Event::NewToken {
                    token: Bytes::copy_from_slice(token),
                });
            }
            Frame::NewConnectionId(frame) => self.on_new_cid(&frame)?,
            Frame::RetireConnectionId { seq } => {
                // We only ever issue the handshake CID (sequence 0), and the
                // peer cannot retire the CID its packet is addressed with.
                let _ = seq;
                return Err(Error::ProtocolViolation);
            }
            Frame::PathChallenge { data } => {
                self.pending.path_response = Some(data);
            }
            Frame::PathResponse { .. } => {
                // We never send PATH_CHALLENGE (no migration).
                trace!("unsolicited PATH_RESPONSE ignored");
            }
            Frame::ConnectionClose(close) => self.on_peer_close(&close, now),
            Frame::HandshakeDone => {
                if self.side == Side::Server {
                    return Err(Error::ProtocolViolation);
                }
                if self.space_active[SpaceId::Handshake as usize] {
                    self.discard_space(SpaceId::Handshake);
                }
                if matches!(self.state, State::WaitingHandshake | State::HandshakeConfirmed) {
                    debug!("handshake confirmed by HANDSHAKE_DONE");
                    self.state = State::Connected;
                }
            }
        }
        Ok(())
    }

    fn on_stream_frame(&mut self, frame: StreamFrame<'_>) -> Result<()> {
        let id = frame.stream_id;
        let fresh = !self.streams.contains(id);
        let stream = self.streams.recv_side(id)?;
        if stream.reset_received.is_some() {
            return Ok(()); // late data after a reset
        }
        let recv = stream
            .recv
            .as_mut()
            .expect("recv_side streams have a recv half");
        let newly = recv.insert(frame.offset, Bytes::copy_from_slice(frame.data), frame.fin)?;
        self.flow.rx.on_received(newly)?;

        if fresh {
            self.events.push_back(Event::StreamOpened { id });
        }

        // Deliver the contiguous prefix immediately.
        let mut delivered = 0u64;
        loop {
            let recv = self
                .streams
                .get(id)
                .and_then(|s| s.recv.as_mut())
                .expect("stream exists during delivery");
            let Some(chunk) = recv.read(usize::MAX) else { break };
            delivered += chunk.len() as u64;
            let fin = recv.is_finished();
            if let Some(update) = recv.max_data_update() {
                self.pending.max_stream_data.insert(id.value(), update);
            }
            self.events.push_back(Event::StreamData { id, data: chunk, fin });
            if fin {
                self.events.push_back(Event::StreamFinished { id });
            }
        }
        let stream = self.streams.get(id).expect("stream exists during delivery");
        if let Some(recv) = &stream.recv {
            if recv.is_finished() {
                if delivered == 0 && recv.final_size() == Some(recv.delivered()) {
                    // FIN with no outstanding data (possibly an empty fin).
                    if !stream.delivered_terminal_event {
                        self.events.push_back(Event::StreamFinished { id });
                    }
                }
                stream.delivered_terminal_event = true;
            }
        }
        if delivered > 0 {
            self.flow.rx.on_consumed(delivered);
            if let Some(update) = self.flow.rx.take_update() {
                self.pending.max_data = Some(update);
            }
        }
        Ok(())
    }

    fn on_new_cid(&mut self, frame: &NewConnectionIdFrame) -> Result<()> {
        let retire = self.remote_cids.on_new_cid(frame)?;
        self.pending.retire_cids.extend(retire);
        Ok(())
    }

    fn on_peer_close(&mut self, close: &CloseFrame<'_>, now: Instant) {
        debug!(
            code = close.error_code,
            app = close.is_application,
            "CONNECTION_CLOSE received, draining"
        );
        // A local close already announced itself; don't repeat the event
        // when the peer's close races ours.
        if self.state != State::Closing {
            self.events.push_back(Event::ConnectionClosing {
                error_code: close.error_code,
                reason: Bytes::copy_from_slice(close.reason),
                is_application: close.is_application,
            });
        }
        // A close already underway keeps its timer: a CONNECTION_CLOSE
        // received while Closing extends nothing.
        let deadline = match &self.close {
            Some(existing) => existing.deadline,
            None => now + 3 * self.recovery.pto(Some(self.peer_max_ack_delay())),
        };
        self.close = Some(CloseState {
            error_code: close.error_code,
            frame_type: close.frame_type,
            reason: close.reason.to_vec(),
            is_application: close.is_application,
            deadline,
            respond: false,
        });
        self.state = State::Draining;
    }

    // ======================================================================
    // ACK processing and loss handling
    // ======================================================================

    fn on_ack_frame(&mut self, space: SpaceId, ack: &frames::AckFrame, now: Instant) -> Result<()> {
        let idx = space as usize;
        let acked = self.spaces[idx]
            .take_acked(ack)
            .ok_or(Error::ProtocolViolation)?;

        if let Some(largest) = acked.last() {
            if largest.pn == ack.largest && largest.ack_eliciting {
                let sample = now.saturating_duration_since(largest.time_sent);
                let ack_delay = self.decoded_ack_delay(ack.delay);
                self.recovery.rtt.update(sample, ack_delay);
            }
        }
        if !acked.is_empty() {
            self.recovery.pto_count = 0;
        }

        for packet in acked {
            if packet.in_flight {
                self.recovery
                    .congestion
                    .on_packet_acked(packet.size, packet.time_sent);
            }
            for frame in packet.frames {
                self.on_frame_acked(space, frame);
            }
        }

        let loss_delay = self.recovery.rtt.loss_delay();
        let lost = self.spaces[idx].detect_lost(now, loss_delay);
        self.on_packets_lost(space, lost, now);
        Ok(())
    }

    /// Peer ACK Delay field, decoded and clamped.
    fn decoded_ack_delay(&self, raw: u64) -> Duration {
        if !self.handshake_complete {
            return Duration::ZERO;
        }
        let exponent = self
            .peer_params
            .as_ref()
            .map(|p| p.ack_delay_exponent)
            .unwrap_or(3);
        let micros = raw.saturating_mul(1u64 << exponent.min(20));
        Duration::from_micros(micros).min(self.peer_max_ack_delay())
    }

    fn peer_max_ack_delay(&self) -> Duration {
        Duration::from_millis(
            self.peer_params
                .as_ref()
                .map(|p| p.max_ack_delay)
                .unwrap_or(25),
        )
    }

    fn on_frame_acked(&mut self, space: SpaceId, frame: SentFrame) {
        match frame {
            SentFrame::Ping | SentFrame::HandshakeDone => {}
            SentFrame::Ack { largest } => {
                self.spaces[space as usize].ack_ranges.discard_up_to(largest);
            }
            SentFrame::Crypto { offset, len } => {
                self.spaces[space as usize]
                    .crypto
                    .send
                    .on_ack(offset, len, false);
            }
            SentFrame::Stream { id, offset, len, fin } => {
                if let Some(stream) = self.streams.get(id) {
                    if let Some(send) = &mut stream.send {
                        send.on_ack(offset, len, fin);
                        if send.finished() && stream.recv.is_none() {
                            stream.delivered_terminal_event = true;
                        }
                    }
                }
            }
            SentFrame::MaxData
            | SentFrame::MaxStreamData { .. }
            | SentFrame::MaxStreams { .. }
            | SentFrame::ResetStream { .. }
            | SentFrame::StopSending { .. }
            | SentFrame::StreamsBlocked { .. }
            | SentFrame::PathResponse
            | SentFrame::RetireConnectionId { .. } => {}
        }
        let _ = self.streams.reap();
    }

    fn on_packets_lost(&mut self, space: SpaceId, lost: Vec<SentPacket>, now: Instant) {
        for packet in lost {
            trace!(pn = packet.pn, ?space, "packet lost");
            self.stats.packets_lost += 1;
            if packet.in_flight {
                self.recovery
                    .congestion
                    .on_packet_lost(packet.size, packet.time_sent, now);
            }
            for frame in packet.frames {
                self.on_frame_lost(space, frame);
            }
        }
    }

    fn on_frame_lost(&mut self, space: SpaceId, frame: SentFrame) {
        match frame {
            SentFrame::Ping | SentFrame::Ack { .. } => {}
            SentFrame::Crypto { offset, len } => {
                self.spaces[space as usize]
                    .crypto
                    .send
                    .on_lost(offset, len, false);
            }
            SentFrame::Stream { id, offset, len, fin } => {
                if let Some(stream) = self.streams.get(id) {
                    if stream.reset_sent.is_none() {
                        if let Some(send) = &mut stream.send {
                            send.on_lost(offset, len, fin);
                        }
                    }
                }
            }
            SentFrame::HandshakeDone => self.pending.handshake_done = true,
            SentFrame::MaxData => {
                self.pending.max_data = Some(self.flow.rx.limit());
            }
            SentFrame::MaxStreamData { id } => {
                if let Some(stream) = self.streams.get(id) {
                    if let Some(recv) = &stream.recv {
                        self.pending
                            .max_stream_data
                            .insert(id.value(), recv.local_max());
                    }
                }
            }
            SentFrame::MaxStreams { dir } => self.streams.retransmit_max_streams(dir),
            SentFrame::ResetStream { id } => {
                if let Some(stream) = self.streams.get(id) {
                    if let (Some(code), Some(send)) = (stream.reset_sent, stream.send.as_ref()) {
                        self.pending.resets.push((id, code, send.sent_high()));
                    }
                }
            }
            SentFrame::StopSending { id, code } => {
                self.pending.stop_sending.push((id, code));
            }
            SentFrame::StreamsBlocked { dir } => {
                self.pending.streams_blocked = Some(dir);
            }
            SentFrame::PathResponse => {
                // Never retransmitted: a response answers the most recent
                // challenge only.
            }
            SentFrame::RetireConnectionId { seq } => self.pending.retire_cids.push(seq),
        }
    }

    // ======================================================================
    // TLS pump
    // ======================================================================

    fn pump_tls(&mut self, now: Instant) -> Result<()> {
        while let Some(event) = self.tls.next_event() {
            match event {
                TlsEvent::ReadSecret { level, secret, cipher_suite } => {
                    if level == CryptoLevel::ZeroRtt {
                        continue; // 0-RTT unsupported
                    }
                    let seal = CryptoSeal::from_secret(&*self.backend, &secret, cipher_suite)?;
                    let idx = level.space() as usize;
                    debug!(?level, "read keys installed");
                    self.read_seals[idx] = Some(seal);
                    self.replay_undecryptable(level.space(), now)?;
                }
                TlsEvent::WriteSecret { level, secret, cipher_suite } => {
                    if level == CryptoLevel::ZeroRtt {
                        continue;
                    }
                    let seal = CryptoSeal::from_secret(&*self.backend, &secret, cipher_suite)?;
                    let idx = level.space() as usize;
                    debug!(?level, "write keys installed");
                    self.write_seals[idx] = Some(seal);
                    // The client stops using Initial keys once it can send
                    // at the Handshake level.
                    if self.side == Side::Client
                        && level == CryptoLevel::Handshake
                        && self.space_active[SpaceId::Initial as usize]
                    {
                        self.discard_space(SpaceId::Initial);
                    }
                }
                TlsEvent::HandshakeBytes { level, data } => {
                    let idx = level.space() as usize;
                    self.spaces[idx].crypto.send.enqueue(Bytes::from(data))?;
                }
                TlsEvent::HandshakeComplete => self.on_handshake_complete(now)?,
                TlsEvent::Alert(alert) => {
                    return Err(Error::Crypto(alert));
                }
            }
        }
        Ok(())
    }

    fn replay_undecryptable(&mut self, space: SpaceId, now: Instant) -> Result<()> {
        let buffered: Vec<Vec<u8>> = {
            let mut kept = Vec::new();
            let mut matched = Vec::new();
            for (s, packet) in self.undecryptable.drain(..) {
                if s == space {
                    matched.push(packet);
                } else {
                    kept.push((s, packet));
                }
            }
            self.undecryptable = kept;
            matched
        };
        for mut packet in buffered {
            self.process_packet(&mut packet, now)?;
        }
        Ok(())
    }

    fn on_handshake_complete(&mut self, now: Instant) -> Result<()> {
        if self.handshake_complete {
            return Ok(());
        }
        self.handshake_complete = true;
        debug!(side = ?self.side, "TLS handshake complete");

        let raw = self
            .tls
            .peer_transport_params()
            .ok_or(Error::TransportParameterError)?;
        let params = TransportParameters::decode(&raw, self.side.peer())?;
        self.apply_peer_params(params, now)?;

        self.events.push_back(Event::HandshakeComplete);
        self.state = State::HandshakeConfirmed;

        if self.side == Side::Server {
            // The server confirms on completion: HANDSHAKE_DONE goes out
            // and the Handshake space is finished.
            self.pending.handshake_done = true;
            if self.space_active[SpaceId::Handshake as usize] {
                self.discard_space(SpaceId::Handshake);
            }
        }
        Ok(())
    }

    fn apply_peer_params(&mut self, params: TransportParameters, now: Instant) -> Result<()> {
        // Authenticate the handshake CIDs (RFC 9000 Section 7.3).
        if let Some(iscid) = &params.initial_source_connection_id {
            if iscid != self.remote_cids.current() {
                return Err(Error::TransportParameterError);
            }
        }
        if self.side == Side::Client {
            match &params.original_destination_connection_id {
                Some(odcid) if *odcid == self.original_dcid => {}
                _ => return Err(Error::TransportParameterError),
            }
        }

        self.flow.tx.update_limit(params.initial_max_data);
        self.streams.apply_peer_params(StreamParams {
            max_stream_data_bidi_local: params.initial_max_stream_data_bidi_local,
            max_stream_data_bidi_remote: params.initial_max_stream_data_bidi_remote,
            max_stream_data_uni: params.initial_max_stream_data_uni,
            max_streams_bidi: params.initial_max_streams_bidi,
            max_streams_uni: params.initial_max_streams_uni,
        });

        // Idle timeout: the effective value is the lower of the two
        // non-zero advertisements.
        let local = self.config.transport.max_idle_timeout;
        let peer = params.max_idle_timeout;
        let effective = match (local, peer) {
            (0, 0) => None,
            (0, t) | (t, 0) => Some(t),
            (a, b) => Some(a.min(b)),
        };
        self.idle_timeout = effective.map(Duration::from_millis);
        self.idle_deadline = self.idle_timeout.map(|t| now + t);

        self.peer_params = Some(params);
        Ok(())
    }

    // ======================================================================
    // Close
    // ======================================================================

    fn close_on_error(&mut self, err: Error, now: Instant) {
        warn!(%err, "closing on error");
        self.begin_close(err.to_wire(), Some(0), Vec::new(), false, now);
    }

    fn begin_close(
        &mut self,
        error_code: u64,
        frame_type: Option<u64>,
        reason: Vec<u8>,
        is_application: bool,
        now: Instant,
    ) {
        if matches!(self.state, State::Closing | State::Draining | State::Closed) {
            return;
        }
        let pto = self.recovery.pto(Some(self.peer_max_ack_delay()));
        self.events.push_back(Event::ConnectionClosing {
            error_code,
            reason: Bytes::copy_from_slice(&reason),
            is_application,
        });
        self.close = Some(CloseState {
            error_code,
            frame_type,
            reason,
            is_application,
            deadline: now + 3 * pto,
            respond: true,
        });
        self.state = State::Closing;
    }

    fn discard_space(&mut self, space: SpaceId) {
        debug!(?space, "packet number space discarded");
        let idx = space as usize;
        self.space_active[idx] = false;
        self.read_seals[idx] = None;
        self.write_seals[idx] = None;
        for packet in self.spaces[idx].discard() {
            if packet.in_flight {
                self.recovery.congestion.on_packet_discarded(packet.size);
            }
        }
        self.undecryptable.retain(|(s, _)| *s != space);
    }

    fn touch_idle(&mut self, now: Instant) {
        if let Some(timeout) = self.idle_timeout {
            self.idle_deadline = Some(now + timeout);
        }
    }

    // ======================================================================
    // Timers
    // ======================================================================

    /// Earliest instant at which [`Connection::on_timeout`] needs to run.
    pub fn next_timeout(&self) -> Option<Instant> {
        if self.state == State::Closed {
            return None;
        }
        if let Some(close) = &self.close {
            return Some(close.deadline);
        }

        let mut deadline = self.idle_deadline;
        let mut fold = |candidate: Option<Instant>| {
            deadline = match (deadline, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        };
        for space in SpaceId::ALL {
            if !self.space_active[space as usize] {
                continue;
            }
            let s = &self.spaces[space as usize];
            fold(s.loss_time);
            fold(s.ack_deadline());
        }
        fold(self.pto_deadline());
        deadline
    }

    fn pto_deadline(&self) -> Option<Instant> {
        let mut best: Option<(Instant, SpaceId)> = None;
        for space in SpaceId::ALL {
            if !self.space_active[space as usize] {
                continue;
            }
            let s = &self.spaces[space as usize];
            if !s.has_ack_eliciting_in_flight() {
                continue;
            }
            if let Some(base) = s.time_of_last_ack_eliciting {
                let mad =
                    (space == SpaceId::Application).then(|| self.peer_max_ack_delay());
                let deadline = base + self.recovery.pto(mad);
                if best.is_none_or(|(b, _)| deadline < b) {
                    best = Some((deadline, space));
                }
            }
        }
        if best.is_none() && !self.handshake_complete {
            // Anti-deadlock: keep probing while the handshake can stall
            // with nothing in flight.
            for space in [SpaceId::Initial, SpaceId::Handshake] {
                if !self.space_active[space as usize] {
                    continue;
                }
                if let Some(base) = self.spaces[space as usize].time_of_last_ack_eliciting {
                    let deadline = base + self.recovery.pto(None);
                    if best.is_none_or(|(b, _)| deadline < b) {
                        best = Some((deadline, space));
                    }
                }
            }
        }
        best.map(|(deadline, _)| deadline)
    }

    fn pto_space(&self) -> Option<SpaceId> {
        // Probe the space with the earliest outstanding ack-eliciting send.
        let mut best: Option<(Instant, SpaceId)> = None;
        for space in SpaceId::ALL {
            if !self.space_active[space as usize] {
                continue;
            }
            let s = &self.spaces[space as usize];
            let relevant = s.has_ack_eliciting_in_flight()
                || (!self.handshake_complete && space != SpaceId::Application);
            if !relevant {
                continue;
            }
            if let Some(t) = s.time_of_last_ack_eliciting {
                if best.is_none_or(|(b, _)| t < b) {
                    best = Some((t, space));
                }
            }
        }
        best.map(|(_, space)| space)
    }

    /// Drive expired timers: close/drain deadline, idle timeout, loss
    /// detection, and PTO.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.state == State::Closed {
            return;
        }

        if let Some(close) = &self.close {
            if now >= close.deadline {
                debug!("close timer elapsed");
                self.state = State::Closed;
                self.events.push_back(Event::ConnectionClosed);
            }
            return;
        }

        // Idle expiry is silent: no CONNECTION_CLOSE, straight to Closed.
        if self.idle_deadline.is_some_and(|d| now >= d) {
            debug!("idle timeout");
            self.state = State::Closed;
            self.events.push_back(Event::ConnectionClosed);
            return;
        }

        let loss_delay = self.recovery.rtt.loss_delay();
        for space in SpaceId::ALL {
            if !self.space_active[space as usize] {
                continue;
            }
            if self.spaces[space as usize].loss_time.is_some_and(|t| t <= now) {
                let lost = self.spaces[space as usize].detect_lost(now, loss_delay);
                self.on_packets_lost(space, lost, now);
            }
        }

        if self.pto_deadline().is_some_and(|d| d <= now) {
            if let Some(space) = self.pto_space() {
                debug!(?space, count = self.recovery.pto_count, "probe timeout");
                self.probes[space as usize] = 1;
                self.recovery.pto_count += 1;
            }
        }
    }

    // ======================================================================
    // Send path
    // ======================================================================

    /// Build the next outgoing datagram into `buf`.
    ///
    /// Returns the datagram length, or `None` when there is nothing to
    /// send. Call repeatedly until it returns `None`; the gather loop is
    /// bounded by flow control and the congestion window, not a fixed
    /// packet budget.
    pub fn poll_transmit(&mut self, buf: &mut [u8], now: Instant) -> Option<usize> {
        match self.state {
            State::Closed | State::Draining => return None,
            State::Closing => return self.poll_transmit_close(buf),
            _ => {}
        }

        let mut budget = self.config.max_udp_payload_size.min(buf.len());
        if self.side == Side::Server && !self.address_validated {
            let allowed = (self.bytes_received_total * AMPLIFICATION_FACTOR)
                .saturating_sub(self.bytes_sent_unvalidated);
            budget = budget.min(allowed);
            if budget < 64 {
                return None;
            }
        }

        let mut offset = 0;
        let mut sent_ack_eliciting = false;
        for space in SpaceId::ALL {
            if !self.space_active[space as usize] || self.write_seals[space as usize].is_none() {
                continue;
            }
            let Some((len, ack_eliciting, stop)) =
                self.build_packet(space, &mut buf[..budget], offset, now)
            else {
                continue;
            };
            offset += len;
            sent_ack_eliciting |= ack_eliciting;
            if stop || offset >= budget {
                break;
            }
        }

        if offset == 0 {
            return None;
        }
        if self.state == State::Start {
            self.state = State::WaitingHandshake;
        }
        if sent_ack_eliciting {
            self.touch_idle(now);
        }
        self.stats.bytes_sent += offset as u64;
        if !self.address_validated {
            self.bytes_sent_unvalidated += offset;
        }
        Some(offset)
    }

    /// Build one packet for `space` at `offset` within the datagram.
    /// Returns `(packet_len, ack_eliciting, stop_coalescing)`.
    fn build_packet(
        &mut self,
        space: SpaceId,
        buf: &mut [u8],
        offset: usize,
        now: Instant,
    ) -> Option<(usize, bool, bool)> {
        let idx = space as usize;
        let tag_len = self.write_seals[idx].as_ref().unwrap().tag_len();
        let remote_cid = self.remote_cids.current().clone();

        let ty = match space {
            SpaceId::Initial => PacketType::Initial,
            SpaceId::Handshake => PacketType::Handshake,
            SpaceId::Application => PacketType::OneRtt,
        };

        // Cheap overhead probe: without at least header + sample room there
        // is no point in starting.
        let packet_buf = &mut buf[offset..];
        if packet_buf.len() < 64 {
            return None;
        }

        let ack_due = self.spaces[idx].ack_due(now);
        let has_crypto = self.spaces[idx].crypto.send.has_sendable();
        let probe = self.probes[idx] > 0;
        let app_work = space == SpaceId::Application && self.has_app_work();
        if !(ack_due || has_crypto || probe || app_work) {
            return None;
        }

        let pn = self.spaces[idx].peek_packet_number();
        let largest_acked = self.spaces[idx].largest_acked;
        let pn_len = pn_len(pn, largest_acked);

        let mut w = Writer::new(packet_buf);
        let (pn_offset, length_pos) = match ty {
            PacketType::OneRtt => {
                let pn_offset =
                    header::encode_short(&mut w, remote_cid.as_bytes(), pn, pn_len).ok()?;
                (pn_offset, None)
            }
            _ => {
                let marks = header::encode_long(
                    &mut w,
                    ty,
                    VERSION_1,
                    remote_cid.as_bytes(),
                    self.local_cid.as_bytes(),
                    &[],
                    pn,
                    pn_len,
                )
                .ok()?;
                (marks.pn_offset, Some(marks.length_pos))
            }
        };
        let payload_start = w.pos();
        let payload_max = w.pos() + w.remaining().checked_sub(tag_len)?;

        let mut frames_sent: Vec<SentFrame> = Vec::new();
        let mut ack_eliciting = false;
        self.gather_frames(
            space,
            &mut w,
            payload_max,
            &mut frames_sent,
            &mut ack_eliciting,
            now,
        );

        if frames_sent.is_empty() {
            return None;
        }

        // A client datagram carrying an ack-eliciting Initial must fill
        // 1200 bytes; pad this packet and stop coalescing.
        let mut stop = false;
        let mut padded = false;
        if ty == PacketType::Initial && self.side == Side::Client && ack_eliciting {
            let target = MIN_INITIAL_DATAGRAM_SIZE
                .saturating_sub(offset)
                .min(payload_max + tag_len);
            while w.pos() + tag_len < target {
                if w.put_u8(frames::TYPE_PADDING as u8).is_err() {
                    break;
                }
                padded = true;
            }
            stop = true;
        }
        // Header protection samples 4 bytes past the packet number; make
        // sure short payloads leave enough ciphertext.
        while w.pos() - payload_start + pn_len < 4 {
            w.put_u8(frames::TYPE_PADDING as u8).ok()?;
            padded = true;
        }

        let payload_len = w.pos() - payload_start;
        let total_plain = w.pos();

        // Finalize the long-header Length field before it becomes AAD.
        if let Some(length_pos) = length_pos {
            let length = (pn_len + payload_len + tag_len) as u16;
            packet_buf[length_pos..length_pos + 2]
                .copy_from_slice(&(0x4000u16 | length).to_be_bytes());
        }

        let plaintext = packet_buf[payload_start..total_plain].to_vec();
        let seal = self.write_seals[idx].as_ref().unwrap();
        let (aad, payload_area) = packet_buf.split_at_mut(payload_start);
        let sealed_len = seal
            .seal(pn, aad, &plaintext, &mut payload_area[..payload_len + tag_len])
            .ok()?;
        debug_assert_eq!(sealed_len, payload_len + tag_len);
        let packet_len = payload_start + sealed_len;
        seal.protect_header(&mut packet_buf[..packet_len], pn_offset, pn_len)
            .ok()?;

        let assigned = self.spaces[idx].next_packet_number();
        debug_assert_eq!(assigned, pn);
        let in_flight = ack_eliciting || padded;
        self.spaces[idx].on_packet_sent(SentPacket {
            pn,
            time_sent: now,
            size: packet_len,
            ack_eliciting,
            in_flight,
            largest_acked_at_send: largest_acked,
            frames: frames_sent,
        });
        if in_flight {
            self.recovery.congestion.on_packet_sent(packet_len);
        }
        if probe {
            self.probes[idx] -= 1;
        }
        self.stats.packets_sent += 1;
        trace!(?space, pn, len = packet_len, "packet sent");
        Some((packet_len, ack_eliciting, stop))
    }

    /// Gather frames in priority order: ACK, CRYPTO, HANDSHAKE_DONE,
    /// MAX_* control, RESET_STREAM/STOP_SENDING, retransmits and new
    /// STREAM data, PING. CONNECTION_CLOSE never reaches here (the Closing
    /// state short-circuits).
    fn gather_frames(
        &mut self,
        space: SpaceId,
        w: &mut Writer<'_>,
        payload_max: usize,
        frames_sent: &mut Vec<SentFrame>,
        ack_eliciting: &mut bool,
        now: Instant,
    ) {
        let idx = space as usize;
        let room = |w: &Writer<'_>| payload_max.saturating_sub(w.pos());

        // ACK.
        if self.spaces[idx].ack_pending() {
            if let Some(ack) = self.spaces[idx]
                .build_ack(now, self.config.transport.ack_delay_exponent)
            {
                let frame = Frame::Ack(ack.clone());
                if frame.wire_size() <= room(w) && frame.encode(w).is_ok() {
                    frames_sent.push(SentFrame::Ack { largest: ack.largest });
                    self.spaces[idx].on_ack_sent();
                }
            }
        }

        // CRYPTO data, as many chunks as fit.
        loop {
            let Some((off, avail)) = self.spaces[idx].crypto.send.next_sendable_range() else {
                break;
            };
            let overhead = 1 + VarIntCodec::size(off) + 4;
            if room(w) <= overhead {
                break;
            }
            let len = (avail as usize).min(room(w) - overhead);
            if len == 0 {
                break;
            }
            if w.put_varint(frames::TYPE_CRYPTO).is_err()
                || w.put_varint(off).is_err()
                || w.put_varint(len as u64).is_err()
            {
                break;
            }
            let dst = w.claim(len).expect("room was checked");
            let (got_off, got_len, _) = self.spaces[idx]
                .crypto
                .send
                .check_out(dst)
                .expect("sendable range was present");
            debug_assert_eq!((got_off, got_len), (off, len));
            frames_sent.push(SentFrame::Crypto { offset: off, len });
            *ack_eliciting = true;
        }

        // Everything below is 1-RTT only.
        if space != SpaceId::Application {
            if self.probes[idx] > 0 && !*ack_eliciting && room(w) >= 1 {
                if Frame::Ping.encode(w).is_ok() {
                    frames_sent.push(SentFrame::Ping);
                    *ack_eliciting = true;
                }
            }
            return;
        }

        let congestion_open = self.recovery.congestion.available() > 0;

        if congestion_open {
            if self.pending.handshake_done && room(w) >= 1 {
                if Frame::HandshakeDone.encode(w).is_ok() {
                    self.pending.handshake_done = false;
                    frames_sent.push(SentFrame::HandshakeDone);
                    *ack_eliciting = true;
                    if self.side == Side::Server && self.state == State::HandshakeConfirmed {
                        self.state = State::Connected;
                    }
                }
            }

            if let Some(max) = self.pending.max_data {
                let frame = Frame::MaxData { max };
                if frame.wire_size() <= room(w) && frame.encode(w).is_ok() {
                    self.pending.max_data = None;
                    frames_sent.push(SentFrame::MaxData);
                    *ack_eliciting = true;
                }
            }

            loop {
                let Some((id, max)) = self
                    .pending
                    .max_stream_data
                    .iter()
                    .next()
                    .map(|(&id, &max)| (id, max))
                else {
                    break;
                };
                let frame = Frame::MaxStreamData { stream_id: StreamId(id), max };
                if frame.wire_size() > room(w) || frame.encode(w).is_err() {
                    break;
                }
                self.pending.max_stream_data.remove(&id);
                frames_sent.push(SentFrame::MaxStreamData { id: StreamId(id) });
                *ack_eliciting = true;
            }

            for dir in [Dir::Bi, Dir::Uni] {
                if let Some(max) = self.streams.take_max_streams_update(dir) {
                    let frame = Frame::MaxStreams { dir, max };
                    if frame.wire_size() <= room(w) && frame.encode(w).is_ok() {
                        frames_sent.push(SentFrame::MaxStreams { dir });
                        *ack_eliciting = true;
                    } else {
                        self.streams.retransmit_max_streams(dir);
                    }
                }
            }

            loop {
                let Some((id, code, final_size)) = self.pending.resets.first().copied() else {
                    break;
                };
                let frame = Frame::ResetStream {
                    stream_id: id,
                    error_code: code,
                    final_size,
                };
                if frame.wire_size() > room(w) || frame.encode(w).is_err() {
                    break;
                }
                self.pending.resets.remove(0);
                frames_sent.push(SentFrame::ResetStream { id });
                *ack_eliciting = true;
            }

            loop {
                let Some((id, code)) = self.pending.stop_sending.first().copied() else {
                    break;
                };
                let frame = Frame::StopSending { stream_id: id, error_code: code };
                if frame.wire_size() > room(w) || frame.encode(w).is_err() {
                    break;
                }
                self.pending.stop_sending.remove(0);
                frames_sent.push(SentFrame::StopSending { id, code });
                *ack_eliciting = true;
            }

            loop {
                let Some(seq) = self.pending.retire_cids.first().copied() else {
                    break;
                };
                let frame = Frame::RetireConnectionId { seq };
                if frame.wire_size() > room(w) || frame.encode(w).is_err() {
                    break;
                }
                self.pending.retire_cids.remove(0);
                frames_sent.push(SentFrame::RetireConnectionId { seq });
                *ack_eliciting = true;
            }

            if let Some(data) = self.pending.path_response {
                let frame = Frame::PathResponse { data };
                if frame.wire_size() <= room(w) && frame.encode(w).is_ok() {
                    self.pending.path_response = None;
                    frames_sent.push(SentFrame::PathResponse);
                    *ack_eliciting = true;
                }
            }

            if let Some(dir) = self.pending.streams_blocked {
                let frame = Frame::StreamsBlocked {
                    dir,
                    limit: self.streams.blocked_limit(dir),
                };
                if frame.wire_size() <= room(w) && frame.encode(w).is_ok() {
                    self.pending.streams_blocked = None;
                    frames_sent.push(SentFrame::StreamsBlocked { dir });
                    *ack_eliciting = true;
                }
            }

            // Stream data: lost ranges first (the send buffer orders them),
            // new data within connection flow control.
            self.gather_stream_frames(w, payload_max, frames_sent, ack_eliciting);
        }

        if self.probes[idx] > 0 && !*ack_eliciting && room(w) >= 1 {
            if Frame::Ping.encode(w).is_ok() {
                frames_sent.push(SentFrame::Ping);
                *ack_eliciting = true;
            }
        }
    }

    fn gather_stream_frames(
        &mut self,
        w: &mut Writer<'_>,
        payload_max: usize,
        frames_sent: &mut Vec<SentFrame>,
        ack_eliciting: &mut bool,
    ) {
        let room = |w: &Writer<'_>| payload_max.saturating_sub(w.pos());
        let mut conn_credit = self.flow.tx.available();

        let sendable: Vec<StreamId> = self
            .streams
            .iter_mut()
            .filter(|s| s.reset_sent.is_none())
            .filter(|s| s.send.as_ref().is_some_and(|b| b.has_sendable()))
            .map(|s| s.id)
            .collect();

        for id in sendable {
            loop {
                let Some(stream) = self.streams.get(id) else { break };
                let Some(send) = stream.send.as_mut() else { break };

                let (start, range_len, bare_fin) = match send.next_sendable_range() {
                    Some((start, len)) => (start, len, false),
                    None if send.has_sendable() => (send.written_bytes(), 0, true),
                    None => break,
                };

                // Connection flow control applies to first-time bytes only.
                let retransmit = send.sent_high().saturating_sub(start).min(range_len);
                let allowed = retransmit + (range_len - retransmit).min(conn_credit);
                if allowed == 0 && !bare_fin {
                    break;
                }

                let overhead =
                    1 + VarIntCodec::size(id.value()) + VarIntCodec::size(start) + 4;
                if room(w) < overhead + usize::from(!bare_fin) {
                    break;
                }
                let len = (allowed as usize).min(room(w) - overhead);

                // Encode the header, then let the buffer fill the payload
                // span in place.
                let mut ty = frames::TYPE_STREAM_BASE | frames::STREAM_BIT_LEN;
                if start > 0 {
                    ty |= frames::STREAM_BIT_OFF;
                }
                let ty_pos = w.pos();
                if w.put_varint(ty).is_err()
                    || w.put_varint(id.value()).is_err()
                    || (start > 0 && w.put_varint(start).is_err())
                    || w.put_varint(len as u64).is_err()
                {
                    break;
                }
                let dst = w.claim(len).expect("room was checked");
                let Some((got_off, got_len, fin)) = send.check_out(dst) else {
                    break;
                };
                debug_assert_eq!((got_off, got_len), (start, len));
                if fin {
                    // Patch the FIN bit into the already-written type byte
                    // (STREAM types encode as a single varint byte).
                    w.patch_u8(ty_pos, ty as u8 | frames::STREAM_BIT_FIN as u8);
                }

                // Charge flow credit for the first-time portion.
                let first_time = (len as u64).saturating_sub(retransmit);
                if first_time > 0 {
                    self.flow.tx.consume(first_time);
                    conn_credit -= first_time;
                }

                frames_sent.push(SentFrame::Stream { id, offset: start, len, fin });
                *ack_eliciting = true;

                if bare_fin || len == 0 {
                    break;
                }
            }
        }
    }

    fn has_app_work(&self) -> bool {
        self.pending.handshake_done
            || self.pending.max_data.is_some()
            || !self.pending.max_stream_data.is_empty()
            || !self.pending.resets.is_empty()
            || !self.pending.stop_sending.is_empty()
            || !self.pending.retire_cids.is_empty()
            || self.pending.path_response.is_some()
            || self.pending.streams_blocked.is_some()
            || self.probes[SpaceId::Application as usize] > 0
            || (self.recovery.congestion.available() > 0 && self.streams.has_sendable())
    }

    fn poll_transmit_close(&mut self, buf: &mut [u8]) -> Option<usize> {
        let close = self.close.as_mut()?;
        if !close.respond {
            return None;
        }
        close.respond = false;

        let error_code = close.error_code;
        let frame_type = close.frame_type;
        let reason = close.reason.clone();
        let is_application = close.is_application;

        let budget = self.config.max_udp_payload_size.min(buf.len());
        let mut offset = 0;
        for space in SpaceId::ALL {
            let idx = space as usize;
            if !self.space_active[idx] || self.write_seals[idx].is_none() {
                continue;
            }
            // Application closes degrade to APPLICATION_ERROR outside 1-RTT.
            let frame = if is_application && space != SpaceId::Application {
                Frame::ConnectionClose(CloseFrame {
                    error_code: Error::ApplicationError.to_wire(),
                    frame_type: Some(0),
                    reason: &[],
                    is_application: false,
                })
            } else {
                Frame::ConnectionClose(CloseFrame {
                    error_code,
                    frame_type: if is_application { None } else { frame_type.or(Some(0)) },
                    reason: &reason,
                    is_application,
                })
            };
            if let Some(len) = self.build_close_packet(space, &frame, &mut buf[..budget], offset)
            {
                offset += len;
            }
        }
        (offset > 0).then(|| {
            self.stats.bytes_sent += offset as u64;
            offset
        })
    }

    fn build_close_packet(
        &mut self,
        space: SpaceId,
        frame: &Frame<'_>,
        buf: &mut [u8],
        offset: usize,
    ) -> Option<usize> {
        let idx = space as usize;
        let tag_len = self.write_seals[idx].as_ref().unwrap().tag_len();
        let remote_cid = self.remote_cids.current().clone();
        let packet_buf = &mut buf[offset..];
        if packet_buf.len() < 64 {
            return None;
        }

        let pn = self.spaces[idx].peek_packet_number();
        let pn_len = pn_len(pn, self.spaces[idx].largest_acked);
        let mut w = Writer::new(packet_buf);
        let (pn_offset, length_pos) = match space {
            SpaceId::Application => {
                let pn_offset =
                    header::encode_short(&mut w, remote_cid.as_bytes(), pn, pn_len).ok()?;
                (pn_offset, None)
            }
            _ => {
                let ty = if space == SpaceId::Initial {
                    PacketType::Initial
                } else {
                    PacketType::Handshake
                };
                let marks = header::encode_long(
                    &mut w,
                    ty,
                    VERSION_1,
                    remote_cid.as_bytes(),
                    self.local_cid.as_bytes(),
                    &[],
                    pn,
                    pn_len,
                )
                .ok()?;
                (marks.pn_offset, Some(marks.length_pos))
            }
        };
        let payload_start = w.pos();
        if frame.wire_size() + tag_len > w.remaining() {
            return None;
        }
        frame.encode(&mut w).ok()?;
        while w.pos() - payload_start + pn_len < 4 {
            w.put_u8(0).ok()?;
        }
        let payload_len = w.pos() - payload_start;
        let total_plain = w.pos();

        if let Some(length_pos) = length_pos {
            let length = (pn_len + payload_len + tag_len) as u16;
            packet_buf[length_pos..length_pos + 2]
                .copy_from_slice(&(0x4000u16 | length).to_be_bytes());
        }

        let plaintext = packet_buf[payload_start..total_plain].to_vec();
        let seal = self.write_seals[idx].as_ref().unwrap();
        let (aad, payload_area) = packet_buf.split_at_mut(payload_start);
        seal.seal(pn, aad, &plaintext, &mut payload_area[..payload_len + tag_len])
            .ok()?;
        let packet_len = payload_start + payload_len + tag_len;
        seal.protect_header(&mut packet_buf[..packet_len], pn_offset, pn_len)
            .ok()?;
        self.spaces[idx].next_packet_number();
        self.stats.packets_sent += 1;
        Some(packet_len)
    }
}
