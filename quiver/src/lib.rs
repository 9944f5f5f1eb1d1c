//! quiver: a managed QUIC endpoint over the `quiver-quic` state machine.
//!
//! One [`context::SocketContext`] owns one UDP socket and drives every
//! connection multiplexed on it from a single-threaded cooperative loop:
//!
//! ```text
//! loop:
//!   wait for: datagram | app command | timer | shutdown
//!   on_receive / on_command / on_timeout
//!   attempt_send for all connections
//!   recompute the earliest timer
//! ```
//!
//! The loop is the only writer of connection state. Application threads
//! talk to it through [`handle::ConnectionHandle`]: stream writes are
//! staged under a per-connection lock and the loop is pinged; everything
//! else (opens, resets, closes) travels as commands over a channel.

pub mod cid;
pub mod config;
pub mod context;
pub mod handle;
pub mod socket;

pub use config::EndpointConfig;
pub use context::{ShutdownHandle, SocketContext};
pub use handle::ConnectionHandle;
pub use quiver_quic::{ConnectionStats, Dir, Event, StreamId};
