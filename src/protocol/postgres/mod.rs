//! PostgreSQL wire protocol support
//!
//! Pure codec and authentication primitives: no I/O beyond reading a byte
//! source, no proxy state. The state machine that uses these lives in
//! [`crate::proxy::postgres`].

pub mod auth;
pub mod codec;
pub mod constants;
pub mod messages;

pub use codec::{read_packet, read_startup, Packet, StartupPacket, MAX_PACKET_SIZE};
pub use messages::{
    AuthenticationMessage, BackendKeyData, CancelRequest, DataRow, ErrorResponse, StartupMessage,
};
