//! Socket context: the single-threaded event loop driving every
//! connection multiplexed over one UDP socket.
//!
//! Demultiplexing is by destination connection ID: long headers carry an
//! explicit DCID, short headers are delimited by this endpoint's fixed CID
//! length. Unknown DCIDs on a server are candidate new connections (a
//! sufficiently large Initial), anything else is dropped.

use crate::cid::random_cid;
use crate::config::EndpointConfig;
use crate::handle::{Command, ConnectionHandle, LoopWaker, WriteStage};
use crate::socket::create_udp_socket;
use ahash::AHashMap;
use anyhow::{Context as _, Result};
use crossbeam_channel::{Receiver, Sender};
use quiver_quic::connection::Connection;
use quiver_quic::crypto::boring::BoringBackend;
use quiver_quic::crypto::CryptoBackend;
use quiver_quic::packet::header::VERSION_1;
use quiver_quic::packet::{PacketType, PlainHeader};
use quiver_quic::tls::BoringTlsSession;
use quiver_quic::types::MIN_INITIAL_DATAGRAM_SIZE;
use quiver_quic::wire::Reader;
use quiver_quic::{ConnectionId, Event, Instant};
use slab::Slab;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Fallback wait when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_millis(250);
/// Shortest socket timeout worth programming.
const MIN_WAIT: Duration = Duration::from_millis(1);

struct Entry {
    conn: Connection,
    peer: SocketAddr,
    stage: Arc<WriteStage>,
    events_tx: Sender<Event>,
}

/// One UDP socket and the connections multiplexed over it.
pub struct SocketContext {
    socket: UdpSocket,
    config: EndpointConfig,
    backend: Arc<dyn CryptoBackend>,
    connections: Slab<Entry>,
    by_cid: AHashMap<Vec<u8>, usize>,
    commands_tx: Sender<Command>,
    commands_rx: Receiver<Command>,
    incoming_tx: Sender<ConnectionHandle>,
    incoming_rx: Option<Receiver<ConnectionHandle>>,
    /// Shared by every handle to break the loop out of its socket wait.
    waker: Arc<LoopWaker>,
    /// Wall-clock base; the state machine sees nanoseconds from here.
    epoch: std::time::Instant,
}

impl SocketContext {
    pub fn new(config: EndpointConfig) -> Result<Self> {
        let socket = create_udp_socket(
            config.bind,
            config.socket_recv_buffer_size,
            config.socket_send_buffer_size,
        )?;
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let (incoming_tx, incoming_rx) = crossbeam_channel::unbounded();
        let waker = Arc::new(LoopWaker::new(socket.local_addr()?).context("creating loop waker")?);
        info!(addr = %socket.local_addr()?, server = config.is_server(), "socket context ready");
        Ok(Self {
            socket,
            config,
            backend: Arc::new(BoringBackend::new()),
            connections: Slab::new(),
            by_cid: AHashMap::new(),
            commands_tx,
            commands_rx,
            incoming_tx,
            incoming_rx: Some(incoming_rx),
            waker,
            epoch: std::time::Instant::now(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Channel on which server-side accepted connections surface.
    pub fn incoming(&mut self) -> Option<Receiver<ConnectionHandle>> {
        self.incoming_rx.take()
    }

    /// A handle usable from any thread to stop the loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            commands: self.commands_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    fn now(&self) -> Instant {
        Instant::from_nanos(self.epoch.elapsed().as_nanos() as u64)
    }

    /// Dial a server. The handshake proceeds once [`run`](Self::run) is
    /// driving the loop.
    pub fn connect(&mut self, peer: SocketAddr, server_name: &str) -> Result<ConnectionHandle> {
        let now = self.now();
        let local_cid = random_cid(self.config.cid_len);
        let initial_dcid = random_cid(self.config.cid_len.max(8));

        let tls = BoringTlsSession::new_client(
            server_name,
            &self.config.alpn,
            self.config.verify_peer,
        )
        .context("creating client TLS session")?;
        let conn = Connection::new_client(
            self.config.connection.clone(),
            local_cid.clone(),
            initial_dcid,
            tls,
            self.backend.clone(),
            now,
        )
        .context("creating client connection")?;

        debug!(%peer, cid = %local_cid, "connecting");
        let (_, handle) = self.install(conn, peer, local_cid);
        Ok(handle)
    }

    fn install(
        &mut self,
        conn: Connection,
        peer: SocketAddr,
        local_cid: ConnectionId,
    ) -> (usize, ConnectionHandle) {
        let (events_tx, events_rx) =
            crossbeam_channel::bounded(self.config.event_channel_capacity);
        let stage = Arc::new(WriteStage::default());
        let slot = self.connections.insert(Entry {
            conn,
            peer,
            stage: stage.clone(),
            events_tx,
        });
        self.by_cid.insert(local_cid.as_bytes().to_vec(), slot);
        let handle = ConnectionHandle::new(
            slot,
            self.commands_tx.clone(),
            events_rx,
            stage,
            self.waker.clone(),
        );
        (slot, handle)
    }

    /// Run the loop until a [`Command::Shutdown`] arrives.
    pub fn run(&mut self) -> Result<()> {
        let mut buf = vec![0u8; 65535];
        loop {
            // Sleep until the earliest of: a datagram, the next timer.
            let now = self.now();
            let wait = self
                .next_deadline()
                .map(|deadline| {
                    deadline
                        .saturating_duration_since(now)
                        .max(MIN_WAIT)
                        .min(IDLE_WAIT)
                })
                .unwrap_or(IDLE_WAIT);
            self.socket
                .set_read_timeout(Some(wait))
                .context("arming socket timeout")?;

            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    let now = self.now();
                    self.on_receive(&buf[..len], peer, now);
                }
                Err(e)
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => return Err(e).context("receiving datagram"),
            }

            // Application commands.
            while let Ok(command) = self.commands_rx.try_recv() {
                if matches!(command, Command::Shutdown) {
                    info!("shutdown requested, draining loop");
                    self.shutdown();
                    return Ok(());
                }
                self.on_command(command);
            }

            let now = self.now();
            self.fire_timers(now);
            self.drain_stages();
            self.attempt_send(now);
            self.deliver_events();
            self.reap(now);
        }
    }

    /// Route one datagram to its connection, or accept a new one.
    fn on_receive(&mut self, datagram: &[u8], peer: SocketAddr, now: Instant) {
        let Some(dcid) = dcid_of(datagram, self.config.cid_len) else {
            trace!(%peer, len = datagram.len(), "undecodable datagram dropped");
            return;
        };

        if let Some(&slot) = self.by_cid.get(dcid) {
            self.connections[slot].conn.handle_datagram(datagram, now);
            return;
        }

        if self.config.is_server() {
            self.accept(datagram, peer, now);
        } else {
            trace!(%peer, "datagram for unknown connection dropped");
        }
    }

    /// Server side: a datagram with an unknown DCID may open a connection.
    fn accept(&mut self, datagram: &[u8], peer: SocketAddr, now: Instant) {
        // Only a padded client Initial may create state.
        if datagram.len() < MIN_INITIAL_DATAGRAM_SIZE {
            trace!(%peer, len = datagram.len(), "short Initial dropped");
            return;
        }
        let mut r = Reader::new(datagram);
        let hdr = match PlainHeader::decode(&mut r, self.config.cid_len) {
            Ok(hdr) if hdr.ty == PacketType::Initial && hdr.version == VERSION_1 => hdr,
            _ => {
                trace!(%peer, "non-Initial for unknown connection dropped");
                return;
            }
        };
        let original_dcid = match ConnectionId::from_slice(hdr.dcid) {
            Some(cid) => cid,
            None => return,
        };
        let client_scid = match ConnectionId::from_slice(hdr.scid) {
            Some(cid) => cid,
            None => return,
        };

        let (cert, key) = match (&self.config.cert_pem, &self.config.key_pem) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => return,
        };
        let tls = match BoringTlsSession::new_server(&cert, &key, &self.config.alpn) {
            Ok(tls) => tls,
            Err(err) => {
                warn!(%err, "server TLS session creation failed");
                return;
            }
        };

        let local_cid = random_cid(self.config.cid_len);
        let conn = match Connection::new_server(
            self.config.connection.clone(),
            local_cid.clone(),
            client_scid,
            original_dcid.clone(),
            tls,
            self.backend.clone(),
            now,
        ) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%err, "server connection creation failed");
                return;
            }
        };

        debug!(%peer, cid = %local_cid, "accepting connection");
        let (slot, handle) = self.install(conn, peer, local_cid);
        // The client keeps addressing us by its chosen DCID until our SCID
        // reaches it; route that too.
        self.by_cid.insert(original_dcid.as_bytes().to_vec(), slot);
        self.connections[slot].conn.handle_datagram(datagram, now);
        let _ = self.incoming_tx.send(handle);
    }

    fn on_command(&mut self, command: Command) {
        let now = self.now();
        match command {
            Command::Wake { .. } => {} // staged writes drain below
            Command::OpenStream { slot, dir, reply } => {
                let result = self
                    .connections
                    .get_mut(slot)
                    .and_then(|entry| entry.conn.open_stream(dir));
                let _ = reply.send(result);
            }
            Command::ResetStream { slot, id, error_code } => {
                if let Some(entry) = self.connections.get_mut(slot) {
                    if let Err(err) = entry.conn.reset_stream(id, error_code) {
                        debug!(%err, stream = %id, "reset_stream rejected");
                    }
                }
            }
            Command::StopSending { slot, id, error_code } => {
                if let Some(entry) = self.connections.get_mut(slot) {
                    if let Err(err) = entry.conn.stop_sending(id, error_code) {
                        debug!(%err, stream = %id, "stop_sending rejected");
                    }
                }
            }
            Command::Close { slot, error_code, reason } => {
                if let Some(entry) = self.connections.get_mut(slot) {
                    entry.conn.close(error_code, &reason, now);
                }
            }
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        for (_, entry) in self.connections.iter_mut() {
            if entry.conn.next_timeout().is_some_and(|d| d <= now) {
                entry.conn.on_timeout(now);
            }
        }
    }

    /// Move staged application writes into the connections, under the same
    /// lock the application used to append.
    fn drain_stages(&mut self) {
        for (_, entry) in self.connections.iter_mut() {
            let staged: Vec<_> = std::mem::take(&mut *entry.stage.writes.lock());
            for (id, data, fin) in staged {
                if let Err(err) = entry.conn.write_stream(id, data, fin) {
                    debug!(%err, stream = %id, "staged write rejected");
                }
            }
        }
    }

    fn attempt_send(&mut self, now: Instant) {
        let mut buf = [0u8; 1500];
        for (_, entry) in self.connections.iter_mut() {
            while let Some(len) = entry.conn.poll_transmit(&mut buf, now) {
                if let Err(err) = self.socket.send_to(&buf[..len], entry.peer) {
                    warn!(%err, peer = %entry.peer, "send failed");
                    break;
                }
            }
        }
    }

    fn deliver_events(&mut self) {
        for (_, entry) in self.connections.iter_mut() {
            while let Some(event) = entry.conn.poll_event() {
                if entry.events_tx.try_send(event).is_err() {
                    // Application is slow or gone; stream-level flow
                    // control still bounds what piles up behind it.
                    break;
                }
            }
        }
    }

    fn reap(&mut self, _now: Instant) {
        let dead: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.conn.is_closed())
            .map(|(slot, _)| slot)
            .collect();
        for slot in dead {
            debug!(slot, "connection closed, detaching");
            self.connections.remove(slot);
            self.by_cid.retain(|_, s| *s != slot);
        }
    }

    /// Earliest wakeup across every attached connection.
    fn next_deadline(&self) -> Option<Instant> {
        self.connections
            .iter()
            .filter_map(|(_, entry)| entry.conn.next_timeout())
            .min()
    }

    fn shutdown(&mut self) {
        let now = self.now();
        let mut buf = [0u8; 1500];
        for (_, entry) in self.connections.iter_mut() {
            entry.conn.close(0, b"shutting down", now);
            while let Some(len) = entry.conn.poll_transmit(&mut buf, now) {
                let _ = self.socket.send_to(&buf[..len], entry.peer);
            }
            let _ = entry.events_tx.try_send(Event::ConnectionClosed);
        }
        self.connections.clear();
        self.by_cid.clear();
    }
}

/// Stops a running [`SocketContext`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    commands: Sender<Command>,
    waker: Arc<LoopWaker>,
}

impl ShutdownHandle {
    /// Drain the loop at its next wake-up: in-flight sends complete, every
    /// connection transitions to Closed, and `run` returns.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        self.waker.wake();
    }
}

/// Extract the destination connection ID from a datagram's first packet.
///
/// Long headers carry an explicit length; short headers use this
/// endpoint's fixed local CID length.
fn dcid_of(datagram: &[u8], local_cid_len: usize) -> Option<&[u8]> {
    let first = *datagram.first()?;
    if first & 0x80 != 0 {
        let len = *datagram.get(5)? as usize;
        datagram.get(6..6 + len)
    } else {
        datagram.get(1..1 + local_cid_len)
    }
}
