//! Application bridge: commands in, events out.
//!
//! The event loop is the sole writer of connection state. A
//! [`ConnectionHandle`] lets other threads interact with a connection in
//! exactly two ways: staging stream writes under a per-connection lock
//! (the loop drains the stage under the same lock), and posting commands
//! over the context's channel. Events flow back over a bounded channel.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use quiver_quic::{Dir, Event, StreamId};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

/// Wakes the event loop out of its blocking socket wait by poking its own
/// UDP socket with a one-byte datagram (first byte 0x00 can never be a
/// valid QUIC packet, so the loop drops it after waking).
#[derive(Debug)]
pub struct LoopWaker {
    socket: UdpSocket,
    target: SocketAddr,
}

impl LoopWaker {
    pub(crate) fn new(mut target: SocketAddr) -> std::io::Result<Self> {
        // A wildcard bind address is not routable; poke loopback instead.
        if target.ip().is_unspecified() {
            let loopback: IpAddr = match target {
                SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            };
            target.set_ip(loopback);
        }
        let bind: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        Ok(Self {
            socket: UdpSocket::bind(bind)?,
            target,
        })
    }

    pub(crate) fn wake(&self) {
        let _ = self.socket.send_to(&[0u8], self.target);
    }
}

/// Commands the loop executes on behalf of application threads.
#[derive(Debug)]
pub enum Command {
    /// Wake the loop: staged writes are waiting.
    Wake { slot: usize },
    /// Open a stream; the result comes back on `reply` (`None` when
    /// blocked on the peer's stream limit).
    OpenStream {
        slot: usize,
        dir: Dir,
        reply: Sender<Option<StreamId>>,
    },
    /// Abruptly terminate the send half of a stream.
    ResetStream { slot: usize, id: StreamId, error_code: u64 },
    /// Ask the peer to stop sending on a stream.
    StopSending { slot: usize, id: StreamId, error_code: u64 },
    /// Close the connection.
    Close { slot: usize, error_code: u64, reason: Vec<u8> },
    /// Drain the loop and close every connection.
    Shutdown,
}

/// Writes staged by application threads, drained by the loop.
#[derive(Debug, Default)]
pub struct WriteStage {
    pub writes: Mutex<Vec<(StreamId, Bytes, bool)>>,
}

/// Application-side handle to one connection.
pub struct ConnectionHandle {
    slot: usize,
    commands: Sender<Command>,
    events: Receiver<Event>,
    stage: Arc<WriteStage>,
    waker: Arc<LoopWaker>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        slot: usize,
        commands: Sender<Command>,
        events: Receiver<Event>,
        stage: Arc<WriteStage>,
        waker: Arc<LoopWaker>,
    ) -> Self {
        Self { slot, commands, events, stage, waker }
    }

    fn post(&self, command: Command) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("endpoint loop has shut down"))?;
        self.waker.wake();
        Ok(())
    }

    /// Stage bytes for a stream and ping the loop.
    pub fn write(&self, id: StreamId, data: Bytes, fin: bool) -> anyhow::Result<()> {
        self.stage.writes.lock().push((id, data, fin));
        self.post(Command::Wake { slot: self.slot })
    }

    /// Open a bidirectional stream. `None` when blocked on stream credit;
    /// retry after a [`Event::StreamCreditAvailable`].
    pub fn open_bi(&self) -> anyhow::Result<Option<StreamId>> {
        self.open(Dir::Bi)
    }

    /// Open a unidirectional stream.
    pub fn open_uni(&self) -> anyhow::Result<Option<StreamId>> {
        self.open(Dir::Uni)
    }

    fn open(&self, dir: Dir) -> anyhow::Result<Option<StreamId>> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.post(Command::OpenStream { slot: self.slot, dir, reply })?;
        response
            .recv()
            .map_err(|_| anyhow::anyhow!("endpoint loop has shut down"))
    }

    pub fn reset_stream(&self, id: StreamId, error_code: u64) -> anyhow::Result<()> {
        self.post(Command::ResetStream { slot: self.slot, id, error_code })
    }

    pub fn stop_sending(&self, id: StreamId, error_code: u64) -> anyhow::Result<()> {
        self.post(Command::StopSending { slot: self.slot, id, error_code })
    }

    pub fn close(&self, error_code: u64, reason: &[u8]) -> anyhow::Result<()> {
        self.post(Command::Close {
            slot: self.slot,
            error_code,
            reason: reason.to_vec(),
        })
    }

    /// Next connection event, blocking up to `timeout`.
    pub fn next_event(&self, timeout: Duration) -> Option<Event> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Next connection event without blocking.
    pub fn try_next_event(&self) -> Option<Event> {
        self.events.try_recv().ok()
    }
}
