//! Stream buffers and lifecycle management (RFC 9000 Sections 2-4).

mod manager;
mod recv_buf;
mod send_buf;

pub use manager::{Stream, StreamManager, StreamParams};
pub use recv_buf::RecvBuffer;
pub use send_buf::SendBuffer;
