//! quiver-quic: QUIC v1 connection state machine (RFC 9000/9001/9002).
//!
//! A pure protocol engine: no sockets, no threads, no wall clock. Inputs
//! are datagrams and timestamps; outputs are datagrams, timer deadlines,
//! and application events. The endpoint crate (`quiver`) owns the UDP
//! socket and drives a [`connection::Connection`] from its event loop:
//!
//! ```text
//! quiver-quic/
//! ├── types          - varints, connection/stream IDs, monotonic time
//! ├── wire           - cursor reader/writer over byte buffers
//! ├── error          - RFC 9000 §20 transport error codes
//! ├── frames         - all frame types, zero-copy parse + encode
//! ├── packet         - headers, packet numbers, per-space ack/loss state
//! ├── recovery       - RTT estimation, PTO, NewReno (RFC 9002)
//! ├── stream         - send/reassembly buffers, stream table
//! ├── flow_control   - connection-level credit
//! ├── crypto         - AEAD/HKDF/TLS traits, packet protection, boring
//! ├── tls            - BoringSSL SSL_QUIC_METHOD bridge
//! ├── transport      - transport parameter codec
//! └── connection     - the state machine tying it all together
//! ```
//!
//! Deliberate omissions: 0-RTT application data is never accepted,
//! connection migration is not performed, unknown versions are dropped
//! rather than negotiated, and Retry packets are recognized but their
//! token cryptography is not implemented.

pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod packet;
pub mod recovery;
pub mod stream;
pub mod tls;
pub mod transport;
pub mod types;
pub mod wire;

pub use connection::{Connection, ConnectionConfig, ConnectionStats, Event, State};
pub use error::{Error, Result};
pub use transport::TransportParameters;
pub use types::{ConnectionId, Dir, Instant, Side, SpaceId, StreamId};
