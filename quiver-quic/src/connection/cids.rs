//! Remote connection ID tracking (RFC 9000 Sections 5.1.1, 19.15).
//!
//! The peer may issue alternative connection IDs with NEW_CONNECTION_ID;
//! we store them (with their stateless reset tokens), honor
//! `retire_prior_to`, and enforce the active_connection_id_limit we
//! advertised. Connection migration is out of scope, so stored CIDs are
//! never switched to; the bookkeeping exists to keep a compliant peer
//! happy and a misbehaving one caught.

use crate::error::{Error, Result};
use crate::frames::NewConnectionIdFrame;
use crate::types::{ConnectionId, StatelessResetToken};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct RemoteCids {
    /// Sequence number -> (cid, reset token). Sequence 0 is the handshake
    /// CID, which carries no token.
    active: BTreeMap<u64, (ConnectionId, Option<StatelessResetToken>)>,
    /// Largest retire_prior_to seen.
    retire_prior_to: u64,
    /// Our advertised active_connection_id_limit.
    limit: u64,
}

impl RemoteCids {
    pub fn new(handshake_cid: ConnectionId, limit: u64) -> Self {
        let mut active = BTreeMap::new();
        active.insert(0, (handshake_cid, None));
        Self {
            active,
            retire_prior_to: 0,
            limit,
        }
    }

    /// Process a NEW_CONNECTION_ID frame. Returns the sequence numbers we
    /// now owe RETIRE_CONNECTION_ID frames for.
    pub fn on_new_cid(&mut self, frame: &NewConnectionIdFrame) -> Result<Vec<u64>> {
        // Re-announcements must agree with what we stored.
        if let Some((cid, _)) = self.active.get(&frame.seq) {
            if *cid != frame.cid {
                return Err(Error::ProtocolViolation);
            }
            return Ok(Vec::new());
        }

        let mut to_retire = Vec::new();
        if frame.seq < self.retire_prior_to {
            // Already retired before it arrived.
            to_retire.push(frame.seq);
            return Ok(to_retire);
        }

        self.active
            .insert(frame.seq, (frame.cid.clone(), Some(frame.reset_token)));

        if frame.retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = frame.retire_prior_to;
            let stale: Vec<u64> = self
                .active
                .range(..frame.retire_prior_to)
                .map(|(&seq, _)| seq)
                .collect();
            for seq in stale {
                self.active.remove(&seq);
                to_retire.push(seq);
            }
        }

        if self.active.len() as u64 > self.limit {
            return Err(Error::ConnectionIdLimitError);
        }
        Ok(to_retire)
    }

    /// The CID to address the peer with.
    pub fn current(&self) -> &ConnectionId {
        let (_, (cid, _)) = self
            .active
            .iter()
            .next()
            .expect("at least one active remote CID");
        cid
    }

    /// Replace the provisional handshake CID (servers learn the client's
    /// real SCID from the first Initial; clients adopt the server's).
    pub fn update_handshake_cid(&mut self, cid: ConnectionId) {
        self.active.insert(0, (cid, None));
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}
