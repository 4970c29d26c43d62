//! Protocol proxies and the multiplexing machinery around them
//!
//! One [`ProxyConnection`] per client-originated connection, stored in the
//! [`store::ConnectionStore`] under its composite key and driven by the
//! [`router::PacketRouter`]. The protocol set is closed: a small tagged
//! enum dispatches the `{write, close, is_alive}` capability surface
//! instead of open-ended virtual dispatch.

pub mod input;
pub mod postgres;
pub mod router;
pub mod store;
pub mod tcp;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

/// Lifecycle of one protocol proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyState {
    /// Constructed, no client bytes seen yet
    Uninitialized = 0,
    /// Handshake interception in progress; writes buffer, nothing forwards
    Initializing = 1,
    /// Handshake complete; writes decode and forward to the real server
    Relaying = 2,
    /// Torn down by error, cancellation, or explicit close
    Closed = 3,
}

impl From<u8> for ProxyState {
    fn from(v: u8) -> Self {
        match v {
            0 => ProxyState::Uninitialized,
            1 => ProxyState::Initializing,
            2 => ProxyState::Relaying,
            _ => ProxyState::Closed,
        }
    }
}

/// Shared, lock-free view of a proxy's state.
///
/// Transitions only move forward; a closed proxy never reopens.
#[derive(Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl Default for SharedState {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(ProxyState::Uninitialized as u8)))
    }
}

impl SharedState {
    pub fn get(&self) -> ProxyState {
        self.0.load(Ordering::Acquire).into()
    }

    /// Advance to `state` unless already past it.
    pub fn advance(&self, state: ProxyState) {
        self.0.fetch_max(state as u8, Ordering::AcqRel);
    }

    pub fn is_closed(&self) -> bool {
        self.get() == ProxyState::Closed
    }
}

/// A live proxy for one client connection: the closed set of protocol
/// variants the router can construct.
#[derive(Clone)]
pub enum ProxyConnection {
    Postgres(postgres::PostgresProxyHandle),
    Tcp(tcp::TcpRelayHandle),
    #[cfg(test)]
    Stub(SharedState),
}

impl ProxyConnection {
    /// Feed client payload bytes into the proxy.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        match self {
            Self::Postgres(handle) => handle.write(data).await,
            Self::Tcp(handle) => handle.write(data).await,
            #[cfg(test)]
            Self::Stub(_) => Ok(()),
        }
    }

    /// Tear the proxy down: closes the real-server socket and cancels the
    /// relay loop. Does not remove the store entry.
    pub fn close(&self) {
        match self {
            Self::Postgres(handle) => handle.close(),
            Self::Tcp(handle) => handle.close(),
            #[cfg(test)]
            Self::Stub(state) => state.advance(ProxyState::Closed),
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            Self::Postgres(handle) => handle.is_alive(),
            Self::Tcp(handle) => handle.is_alive(),
            #[cfg(test)]
            Self::Stub(state) => !state.is_closed(),
        }
    }

    pub fn state(&self) -> ProxyState {
        match self {
            Self::Postgres(handle) => handle.state(),
            Self::Tcp(handle) => handle.state(),
            #[cfg(test)]
            Self::Stub(state) => state.get(),
        }
    }

    #[cfg(test)]
    pub fn stub() -> Self {
        Self::Stub(SharedState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_only_advance() {
        let state = SharedState::default();
        assert_eq!(state.get(), ProxyState::Uninitialized);

        state.advance(ProxyState::Initializing);
        assert_eq!(state.get(), ProxyState::Initializing);

        state.advance(ProxyState::Relaying);
        assert_eq!(state.get(), ProxyState::Relaying);

        // No regression to an earlier state.
        state.advance(ProxyState::Initializing);
        assert_eq!(state.get(), ProxyState::Relaying);

        state.advance(ProxyState::Closed);
        assert!(state.is_closed());
        state.advance(ProxyState::Relaying);
        assert!(state.is_closed());
    }

    #[test]
    fn test_stub_connection_close() {
        let conn = ProxyConnection::stub();
        assert!(conn.is_alive());
        conn.close();
        assert!(!conn.is_alive());
        assert_eq!(conn.state(), ProxyState::Closed);
    }
}
