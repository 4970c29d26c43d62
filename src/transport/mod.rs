//! Transport packet surface
//!
//! The engine never talks to the gateway link directly: everything crosses
//! a single multiplexed transport as opaque packets with a type, a spec
//! (key/value metadata) and a payload. Inbound packets are fed to the
//! router; outbound packets go through a [`PacketSink`].
//!
//! Every relayed payload is tagged with the composite key
//! `sessionID:connectionID` through its spec entries so the remote peer can
//! fan the bytes back to the correct physical client socket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{ProxyError, Result};

/// Spec keys consumed and produced by this engine.
pub mod spec {
    /// Gateway session identifier (always present)
    pub const SESSION_ID: &str = "session-id";
    /// Client connection identifier, unique within a session
    pub const CONNECTION_ID: &str = "connection-id";
    /// Protocol selector: "postgres", "tcp", ...
    pub const CONNECTION_TYPE: &str = "connection-type";
    /// Encoded connection-parameters blob, delivered once at session-open
    pub const CONNECTION_PARAMS: &str = "connection-params";
    /// Exit code attached to session-close packets
    pub const EXIT_CODE: &str = "exit-code";
    /// Serialized redaction transformation summaries
    pub const TRANSFORMATION_SUMMARY: &str = "transformation-summary";
}

/// Packet types received from the gateway.
pub mod recv {
    pub const SESSION_OPEN: &str = "session-open";
    pub const SESSION_CLOSE: &str = "session-close";
    pub const PG_CONNECTION_WRITE: &str = "pg-connection-write";
    pub const TCP_CONNECTION_WRITE: &str = "tcp-connection-write";
    pub const TCP_CONNECTION_CLOSE: &str = "tcp-connection-close";
}

/// Packet types sent back to the gateway.
pub mod send {
    pub const SESSION_OPEN_OK: &str = "session-open-ok";
    pub const SESSION_CLOSE: &str = "session-close";
    pub const PG_CLIENT_WRITE: &str = "pg-client-write";
    pub const TCP_CLIENT_WRITE: &str = "tcp-client-write";
    pub const TCP_CONNECTION_CLOSE: &str = "tcp-connection-close";
}

/// One frame on the multiplexed transport.
#[derive(Debug, Clone, Default)]
pub struct TransportPacket {
    pub packet_type: String,
    pub spec: HashMap<String, Vec<u8>>,
    pub payload: Vec<u8>,
}

impl TransportPacket {
    pub fn new(packet_type: &str) -> Self {
        Self {
            packet_type: packet_type.to_string(),
            ..Default::default()
        }
    }

    pub fn with_spec(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.spec.insert(key.to_string(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Spec value as UTF-8, empty string when absent or invalid.
    pub fn spec_str(&self, key: &str) -> &str {
        self.spec
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .unwrap_or("")
    }

    pub fn session_id(&self) -> &str {
        self.spec_str(spec::SESSION_ID)
    }

    pub fn connection_id(&self) -> &str {
        self.spec_str(spec::CONNECTION_ID)
    }

    pub fn connection_type(&self) -> &str {
        self.spec_str(spec::CONNECTION_TYPE)
    }

    /// Build a session-close packet with an optional error payload.
    pub fn session_close(session_id: &str, err_msg: Option<&str>, exit_code: i32) -> Self {
        let mut pkt = Self::new(send::SESSION_CLOSE)
            .with_spec(spec::SESSION_ID, session_id)
            .with_spec(spec::EXIT_CODE, exit_code.to_string());
        if let Some(msg) = err_msg {
            pkt.payload = msg.as_bytes().to_vec();
        }
        pkt
    }

    /// Build a session-open-ok packet echoing the session addressing.
    pub fn session_open_ok(session_id: &str, connection_type: &str) -> Self {
        Self::new(send::SESSION_OPEN_OK)
            .with_spec(spec::SESSION_ID, session_id)
            .with_spec(spec::CONNECTION_TYPE, connection_type)
    }

    /// Build a client-connection-close packet for one composite key.
    pub fn connection_close(session_id: &str, connection_id: &str) -> Self {
        Self::new(send::TCP_CONNECTION_CLOSE)
            .with_spec(spec::SESSION_ID, session_id)
            .with_spec(spec::CONNECTION_ID, connection_id)
    }
}

/// Outbound half of the multiplexed transport.
///
/// The transport's authentication and framing live outside this engine;
/// implementations only need to deliver packets in submission order.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn send(&self, pkt: TransportPacket) -> Result<()>;
}

/// [`PacketSink`] backed by an unbounded channel, drained by the process's
/// transport task (and by tests).
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransportPacket>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PacketSink for ChannelSink {
    async fn send(&self, pkt: TransportPacket) -> Result<()> {
        self.tx
            .send(pkt)
            .map_err(|_| ProxyError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
    }
}

/// A sink bound to one client connection: every payload it writes is
/// tagged with the same composite addressing spec.
#[derive(Clone)]
pub struct ConnectionSink {
    sink: Arc<dyn PacketSink>,
    packet_type: &'static str,
    session_id: String,
    connection_id: String,
}

impl ConnectionSink {
    pub fn new(
        sink: Arc<dyn PacketSink>,
        packet_type: &'static str,
        session_id: &str,
        connection_id: &str,
    ) -> Self {
        Self {
            sink,
            packet_type,
            session_id: session_id.to_string(),
            connection_id: connection_id.to_string(),
        }
    }

    fn base_packet(&self) -> TransportPacket {
        TransportPacket::new(self.packet_type)
            .with_spec(spec::SESSION_ID, self.session_id.as_str())
            .with_spec(spec::CONNECTION_ID, self.connection_id.as_str())
    }

    /// Write payload bytes addressed to this connection.
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        self.sink.send(self.base_packet().with_payload(payload)).await
    }

    /// Write payload bytes plus a serialized transformation summary.
    pub async fn write_with_summary(
        &self,
        payload: &[u8],
        summary: &impl Serialize,
    ) -> Result<()> {
        let mut pkt = self.base_packet().with_payload(payload);
        if let Ok(enc) = serde_json::to_vec(summary) {
            pkt.spec.insert(spec::TRANSFORMATION_SUMMARY.to_string(), enc);
        }
        self.sink.send(pkt).await
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_accessors() {
        let pkt = TransportPacket::new(recv::PG_CONNECTION_WRITE)
            .with_spec(spec::SESSION_ID, "sess-1")
            .with_spec(spec::CONNECTION_ID, "conn-9")
            .with_payload(vec![1, 2, 3]);
        assert_eq!(pkt.session_id(), "sess-1");
        assert_eq!(pkt.connection_id(), "conn-9");
        assert_eq!(pkt.connection_type(), "");
        assert_eq!(pkt.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_session_close_packet() {
        let pkt = TransportPacket::session_close("sess-1", Some("dial failed"), 1);
        assert_eq!(pkt.packet_type, send::SESSION_CLOSE);
        assert_eq!(pkt.spec_str(spec::EXIT_CODE), "1");
        assert_eq!(pkt.payload, b"dial failed");

        let clean = TransportPacket::session_close("sess-1", None, 0);
        assert!(clean.payload.is_empty());
    }

    #[tokio::test]
    async fn test_connection_sink_tags_every_packet() {
        let (sink, mut rx) = ChannelSink::new();
        let conn_sink =
            ConnectionSink::new(Arc::new(sink), send::PG_CLIENT_WRITE, "sess-1", "conn-2");

        conn_sink.write(b"hello").await.unwrap();
        conn_sink.write(b"world").await.unwrap();

        for expected in [b"hello".as_slice(), b"world".as_slice()] {
            let pkt = rx.recv().await.unwrap();
            assert_eq!(pkt.packet_type, send::PG_CLIENT_WRITE);
            assert_eq!(pkt.session_id(), "sess-1");
            assert_eq!(pkt.connection_id(), "conn-2");
            assert_eq!(pkt.payload, expected);
        }
    }

    #[tokio::test]
    async fn test_write_with_summary_attaches_spec() {
        let (sink, mut rx) = ChannelSink::new();
        let conn_sink =
            ConnectionSink::new(Arc::new(sink), send::TCP_CLIENT_WRITE, "s", "c");

        conn_sink
            .write_with_summary(b"data", &vec!["summary"])
            .await
            .unwrap();
        let pkt = rx.recv().await.unwrap();
        assert!(pkt.spec.contains_key(spec::TRANSFORMATION_SUMMARY));
    }
}
