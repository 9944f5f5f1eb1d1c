//! Stream table and lifecycle (RFC 9000 Sections 2.1, 3, 4.6).
//!
//! Stream IDs encode initiator and direction in the low two bits. The
//! manager allocates local IDs against peer-advertised stream limits,
//! auto-creates remote streams up to the local limit, and retires streams
//! once both directions have run to completion.

use super::{RecvBuffer, SendBuffer};
use crate::error::{Error, Result};
use crate::types::{Dir, Side, StreamId};
use std::collections::BTreeMap;

/// Per-direction window and limit configuration, one set per endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamParams {
    pub max_stream_data_bidi_local: u64,
    pub max_stream_data_bidi_remote: u64,
    pub max_stream_data_uni: u64,
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
}

/// One application stream: send half, receive half, or both.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    /// Absent on streams the peer alone writes (remote unidirectional).
    pub send: Option<SendBuffer>,
    /// Absent on streams only we write (local unidirectional).
    pub recv: Option<RecvBuffer>,
    /// Error code of a RESET_STREAM we sent, if any.
    pub reset_sent: Option<u64>,
    /// Error code of a RESET_STREAM the peer sent, if any.
    pub reset_received: Option<u64>,
    /// Peer asked us to stop sending; a reset of our send half is owed.
    pub stop_sending_received: bool,
    /// The application has been told this stream finished or reset.
    pub delivered_terminal_event: bool,
}

impl Stream {
    fn new(id: StreamId, send: Option<SendBuffer>, recv: Option<RecvBuffer>) -> Self {
        Self {
            id,
            send,
            recv,
            reset_sent: None,
            reset_received: None,
            stop_sending_received: false,
            delivered_terminal_event: false,
        }
    }

    /// Both directions have reached a terminal state.
    fn is_done(&self) -> bool {
        let send_done = match &self.send {
            Some(send) => send.finished() || self.reset_sent.is_some(),
            None => true,
        };
        let recv_done = match &self.recv {
            Some(recv) => recv.is_finished() || self.reset_received.is_some(),
            None => true,
        };
        send_done && recv_done
    }
}

/// Stream table for one connection.
#[derive(Debug)]
pub struct StreamManager {
    side: Side,
    streams: BTreeMap<u64, Stream>,
    local: StreamParams,
    peer: StreamParams,
    /// Next index to issue, per direction.
    next_local_bidi: u64,
    next_local_uni: u64,
    /// Count of remote streams opened (max index + 1), per direction.
    remote_bidi_opened: u64,
    remote_uni_opened: u64,
    /// Limits we currently advertise to the peer.
    local_max_bidi: u64,
    local_max_uni: u64,
    /// Remote streams fully retired, counted toward limit replenishment.
    remote_bidi_closed: u64,
    remote_uni_closed: u64,
    /// Advertised limits the peer has not yet been told about.
    max_streams_dirty: [bool; 2],
}

impl StreamManager {
    pub fn new(side: Side, local: StreamParams) -> Self {
        Self {
            side,
            streams: BTreeMap::new(),
            local,
            peer: StreamParams::default(),
            next_local_bidi: 0,
            next_local_uni: 0,
            remote_bidi_opened: 0,
            remote_uni_opened: 0,
            local_max_bidi: local.max_streams_bidi,
            local_max_uni: local.max_streams_uni,
            remote_bidi_closed: 0,
            remote_uni_closed: 0,
            max_streams_dirty: [false; 2],
        }
    }

    /// Install the peer's transport parameters: stream limits and the send
    /// credit of every stream that already exists.
    pub fn apply_peer_params(&mut self, peer: StreamParams) {
        self.peer = peer;
        for stream in self.streams.values_mut() {
            if let Some(send) = &mut stream.send {
                send.update_max_data(Self::initial_send_credit(self.side, stream.id, &peer));
            }
        }
    }

    /// Peer's initial flow-control credit for our send half of `id`.
    fn initial_send_credit(side: Side, id: StreamId, peer: &StreamParams) -> u64 {
        match id.dir() {
            Dir::Uni => peer.max_stream_data_uni,
            // The peer names limits from its own perspective: its "remote"
            // limit governs streams we initiated.
            Dir::Bi if id.initiator() == side => peer.max_stream_data_bidi_remote,
            Dir::Bi => peer.max_stream_data_bidi_local,
        }
    }

    /// Our receive window for the peer-writable half of `id`.
    fn initial_recv_window(&self, id: StreamId) -> u64 {
        match id.dir() {
            Dir::Uni => self.local.max_stream_data_uni,
            Dir::Bi if id.initiator() == self.side => self.local.max_stream_data_bidi_local,
            Dir::Bi => self.local.max_stream_data_bidi_remote,
        }
    }

    /// Open a locally-initiated stream.
    ///
    /// Returns `None` when the peer's stream limit is exhausted; the caller
    /// surfaces "blocked" to the application and may send STREAMS_BLOCKED.
    pub fn open(&mut self, dir: Dir) -> Option<StreamId> {
        let (next, limit) = match dir {
            Dir::Bi => (&mut self.next_local_bidi, self.peer.max_streams_bidi),
            Dir::Uni => (&mut self.next_local_uni, self.peer.max_streams_uni),
        };
        if *next >= limit {
            return None;
        }
        let id = StreamId::new(self.side, dir, *next);
        *next += 1;

        let send = SendBuffer::new(Self::initial_send_credit(self.side, id, &self.peer));
        let recv = (dir == Dir::Bi).then(|| RecvBuffer::new(self.initial_recv_window(id)));
        self.streams.insert(id.value(), Stream::new(id, Some(send), recv));
        Some(id)
    }

    /// Limit value for a STREAMS_BLOCKED frame when `open` would fail.
    pub fn blocked_limit(&self, dir: Dir) -> u64 {
        match dir {
            Dir::Bi => self.peer.max_streams_bidi,
            Dir::Uni => self.peer.max_streams_uni,
        }
    }

    pub fn get(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id.value())
    }

    /// Resolve a stream referenced by a peer frame that writes to us
    /// (STREAM, RESET_STREAM, STREAM_DATA_BLOCKED).
    ///
    /// Remote streams are created on first reference, subject to the local
    /// stream limit. A reference to the peer-unwritable half of a stream is
    /// a STREAM_STATE_ERROR.
    pub fn recv_side(&mut self, id: StreamId) -> Result<&mut Stream> {
        if id.initiator() == self.side && id.dir() == Dir::Uni {
            return Err(Error::StreamStateError);
        }
        self.resolve(id)
    }

    /// Resolve a stream referenced by a peer frame about our send half
    /// (MAX_STREAM_DATA, STOP_SENDING).
    pub fn send_side(&mut self, id: StreamId) -> Result<&mut Stream> {
        if id.initiator() != self.side && id.dir() == Dir::Uni {
            return Err(Error::StreamStateError);
        }
        self.resolve(id)
    }

    fn resolve(&mut self, id: StreamId) -> Result<&mut Stream> {
        if id.initiator() == self.side {
            let issued = match id.dir() {
                Dir::Bi => self.next_local_bidi,
                Dir::Uni => self.next_local_uni,
            };
            if id.index() >= issued {
                // The peer references a stream we never opened.
                return Err(Error::StreamStateError);
            }
            return self
                .streams
                .get_mut(&id.value())
                .ok_or(Error::StreamStateError);
        }

        // Remote-initiated: admit up to the advertised limit.
        let (opened, limit) = match id.dir() {
            Dir::Bi => (&mut self.remote_bidi_opened, self.local_max_bidi),
            Dir::Uni => (&mut self.remote_uni_opened, self.local_max_uni),
        };
        if id.index() >= limit {
            return Err(Error::StreamLimitError);
        }
        *opened = (*opened).max(id.index() + 1);

        let recv_window = self.initial_recv_window(id);
        let send_credit = Self::initial_send_credit(self.side, id, &self.peer);
        Ok(self.streams.entry(id.value()).or_insert_with(|| {
            let recv = RecvBuffer::new(recv_window);
            let send = (id.dir() == Dir::Bi).then(|| SendBuffer::new(send_credit));
            Stream::new(id, send, Some(recv))
        }))
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id.value())
    }

    /// MAX_STREAMS from the peer raised our open budget.
    pub fn on_max_streams(&mut self, dir: Dir, n: u64) {
        match dir {
            Dir::Bi => self.peer.max_streams_bidi = self.peer.max_streams_bidi.max(n),
            Dir::Uni => self.peer.max_streams_uni = self.peer.max_streams_uni.max(n),
        }
    }

    /// Retire finished streams; returns their IDs. Retiring a remote stream
    /// replenishes that direction's advertised limit.
    pub fn reap(&mut self) -> Vec<StreamId> {
        let done: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, s)| s.is_done() && s.delivered_terminal_event)
            .map(|(&k, _)| k)
            .collect();
        let mut reaped = Vec::with_capacity(done.len());
        for key in done {
            let stream = self.streams.remove(&key).unwrap();
            if stream.id.initiator() != self.side {
                match stream.id.dir() {
                    Dir::Bi => {
                        self.remote_bidi_closed += 1;
                        self.local_max_bidi = self.local.max_streams_bidi + self.remote_bidi_closed;
                        self.max_streams_dirty[0] = true;
                    }
                    Dir::Uni => {
                        self.remote_uni_closed += 1;
                        self.local_max_uni = self.local.max_streams_uni + self.remote_uni_closed;
                        self.max_streams_dirty[1] = true;
                    }
                }
            }
            reaped.push(stream.id);
        }
        reaped
    }

    /// A MAX_STREAMS advertisement that is due, if any.
    pub fn take_max_streams_update(&mut self, dir: Dir) -> Option<u64> {
        let (slot, value) = match dir {
            Dir::Bi => (&mut self.max_streams_dirty[0], self.local_max_bidi),
            Dir::Uni => (&mut self.max_streams_dirty[1], self.local_max_uni),
        };
        std::mem::take(slot).then_some(value)
    }

    /// Re-queue a MAX_STREAMS advertisement after loss.
    pub fn retransmit_max_streams(&mut self, dir: Dir) {
        match dir {
            Dir::Bi => self.max_streams_dirty[0] = true,
            Dir::Uni => self.max_streams_dirty[1] = true,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Any stream with data (or a FIN) waiting to be transmitted.
    pub fn has_sendable(&self) -> bool {
        self.streams.values().any(|s| {
            s.reset_sent.is_none() && s.send.as_ref().is_some_and(|b| b.has_sendable())
        })
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(bidi: u64, uni: u64) -> StreamParams {
        StreamParams {
            max_stream_data_bidi_local: 1024,
            max_stream_data_bidi_remote: 2048,
            max_stream_data_uni: 512,
            max_streams_bidi: bidi,
            max_streams_uni: uni,
        }
    }

    #[test]
    fn test_open_respects_peer_limit() {
        let mut mgr = StreamManager::new(Side::Client, params(8, 8));
        mgr.apply_peer_params(params(2, 1));

        let a = mgr.open(Dir::Bi).unwrap();
        let b = mgr.open(Dir::Bi).unwrap();
        assert_eq!(a, StreamId(0));
        assert_eq!(b, StreamId(4));
        assert!(mgr.open(Dir::Bi).is_none());

        mgr.on_max_streams(Dir::Bi, 3);
        assert_eq!(mgr.open(Dir::Bi), Some(StreamId(8)));

        assert_eq!(mgr.open(Dir::Uni), Some(StreamId(2)));
        assert!(mgr.open(Dir::Uni).is_none());
    }

    #[test]
    fn test_remote_streams_auto_created_up_to_limit() {
        let mut mgr = StreamManager::new(Side::Server, params(2, 2));
        mgr.apply_peer_params(params(8, 8));

        // Client bidi stream 0 and 4 are admitted; 8 exceeds the limit.
        assert!(mgr.recv_side(StreamId(0)).is_ok());
        assert!(mgr.recv_side(StreamId(4)).is_ok());
        assert_eq!(mgr.recv_side(StreamId(8)).unwrap_err(), Error::StreamLimitError);
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn test_frame_for_unopened_local_stream_rejected() {
        let mut mgr = StreamManager::new(Side::Client, params(4, 4));
        mgr.apply_peer_params(params(4, 4));
        // Peer writes to client-initiated bidi stream 0 before we opened it.
        assert_eq!(mgr.recv_side(StreamId(0)).unwrap_err(), Error::StreamStateError);
        mgr.open(Dir::Bi).unwrap();
        assert!(mgr.recv_side(StreamId(0)).is_ok());
    }

    #[test]
    fn test_direction_validity() {
        let mut mgr = StreamManager::new(Side::Client, params(4, 4));
        mgr.apply_peer_params(params(4, 4));
        let uni = mgr.open(Dir::Uni).unwrap();
        // Peer cannot write to our unidirectional stream.
        assert_eq!(mgr.recv_side(uni).unwrap_err(), Error::StreamStateError);
        // But MAX_STREAM_DATA about it is fine.
        assert!(mgr.send_side(uni).is_ok());

        // Server's unidirectional stream: we have no send half.
        assert_eq!(mgr.send_side(StreamId(3)).unwrap_err(), Error::StreamStateError);
        assert!(mgr.recv_side(StreamId(3)).is_ok());
    }

    #[test]
    fn test_send_credit_follows_peer_params() {
        let mut mgr = StreamManager::new(Side::Client, params(4, 4));
        mgr.apply_peer_params(params(4, 4));
        let id = mgr.open(Dir::Bi).unwrap();
        // Our bidi stream is "remote" from the peer's point of view.
        assert_eq!(mgr.get(id).unwrap().send.as_ref().unwrap().max_data(), 2048);

        let id = mgr.open(Dir::Uni).unwrap();
        assert_eq!(mgr.get(id).unwrap().send.as_ref().unwrap().max_data(), 512);
    }

    #[test]
    fn test_reap_replenishes_remote_limit() {
        let mut mgr = StreamManager::new(Side::Server, params(1, 1));
        mgr.apply_peer_params(params(8, 8));

        // Client uni stream 2: receive-only for the server.
        let stream = mgr.recv_side(StreamId(2)).unwrap();
        stream
            .recv
            .as_mut()
            .unwrap()
            .insert(0, bytes::Bytes::from_static(b"x"), true)
            .unwrap();
        stream.recv.as_mut().unwrap().read(10).unwrap();
        stream.delivered_terminal_event = true;

        assert_eq!(mgr.recv_side(StreamId(6)).unwrap_err(), Error::StreamLimitError);
        let reaped = mgr.reap();
        assert_eq!(reaped, vec![StreamId(2)]);
        assert_eq!(mgr.take_max_streams_update(Dir::Uni), Some(2));
        assert_eq!(mgr.take_max_streams_update(Dir::Uni), None);
        // Index 1 (stream id 6) is now admissible.
        assert!(mgr.recv_side(StreamId(6)).is_ok());
    }
}
