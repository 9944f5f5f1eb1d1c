//! Connection-level flow control (RFC 9000 Section 4.1).
//!
//! Stream-level limits live in the stream buffers; this module tracks the
//! aggregate across all streams. The send side counts every first-time
//! stream byte against the peer's MAX_DATA; the receive side charges the
//! highest received offset of each stream and re-advertises credit once the
//! application has consumed half the window.

use crate::error::{Error, Result};

/// Credit the peer has granted us to send.
#[derive(Debug, Clone, Copy)]
pub struct SendCredit {
    sent: u64,
    limit: u64,
}

impl SendCredit {
    pub fn new(limit: u64) -> Self {
        Self { sent: 0, limit }
    }

    /// Bytes of new stream data we may still send.
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.sent)
    }

    /// Charge `n` bytes of first-time stream data.
    pub fn consume(&mut self, n: u64) {
        debug_assert!(self.sent + n <= self.limit);
        self.sent += n;
    }

    /// MAX_DATA from the peer; lower values are ignored.
    pub fn update_limit(&mut self, n: u64) {
        self.limit = self.limit.max(n);
    }

    /// The limit we are stalled at, for DATA_BLOCKED frames.
    pub fn blocked(&self) -> Option<u64> {
        (self.available() == 0).then_some(self.limit)
    }
}

/// Credit we grant the peer to send.
#[derive(Debug, Clone, Copy)]
pub struct RecvWindow {
    limit: u64,
    window: u64,
    /// Sum over streams of the highest received offset.
    received: u64,
    /// Sum over streams of bytes delivered to the application.
    consumed: u64,
}

impl RecvWindow {
    pub fn new(window: u64) -> Self {
        Self {
            limit: window,
            window,
            received: 0,
            consumed: 0,
        }
    }

    /// Charge newly received bytes (highest-offset advancement).
    pub fn on_received(&mut self, n: u64) -> Result<()> {
        let received = self.received.checked_add(n).ok_or(Error::FlowControlError)?;
        if received > self.limit {
            return Err(Error::FlowControlError);
        }
        self.received = received;
        Ok(())
    }

    /// Credit bytes the application has consumed.
    pub fn on_consumed(&mut self, n: u64) {
        self.consumed += n;
    }

    /// A MAX_DATA advertisement that is due, once less than half the window
    /// remains ahead of the consumed frontier.
    pub fn take_update(&mut self) -> Option<u64> {
        let remaining = self.limit.saturating_sub(self.consumed);
        if remaining >= self.window / 2 {
            return None;
        }
        self.limit = self.consumed.saturating_add(self.window);
        Some(self.limit)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

/// Both directions of connection-level flow control.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionFlow {
    pub tx: SendCredit,
    pub rx: RecvWindow,
}

impl ConnectionFlow {
    /// `local_window` is what we advertise; the peer's limit arrives with
    /// its transport parameters.
    pub fn new(local_window: u64) -> Self {
        Self {
            tx: SendCredit::new(0),
            rx: RecvWindow::new(local_window),
        }
    }
}
