//! gatehouse-agent - protocol proxy and connection-multiplexing engine
//!
//! The agent-side core of the Gatehouse access gateway. A client speaks a
//! standard database or TCP wire protocol to its local proxy; this engine,
//! running near the target resource, terminates that protocol against the
//! real server with credentials the client never sees, and tunnels
//! everything through a single multiplexed transport back to the gateway:
//!
//! - demultiplexes many logical client connections over one transport
//!   stream ([`proxy::router`], [`proxy::store`])
//! - runs a per-protocol handshake-intercepting state machine, PostgreSQL
//!   being the fully-featured instance ([`proxy::postgres`]) and raw TCP
//!   the degenerate one ([`proxy::tcp`])
//! - optionally masks outbound result data inline ([`redact`])
//!
//! The transport link itself, the gateway's session bookkeeping, and the
//! classify/mask service are external collaborators consumed through the
//! [`transport::PacketSink`] and [`redact::Classifier`] traits.

#[macro_use]
mod logging;

pub mod cancel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod redact;
pub mod tls;
pub mod transport;

pub use cancel::CancelRegistry;
pub use config::{AgentConfig, ConnectionParams, ConnectionType, RedactionLimits};
pub use error::{ProxyError, Result};
pub use proxy::router::PacketRouter;
pub use proxy::store::ConnectionStore;
pub use proxy::{ProxyConnection, ProxyState};
pub use redact::{Classifier, MaskingConfig};
pub use tls::SslMode;
pub use transport::{ChannelSink, ConnectionSink, PacketSink, TransportPacket};
