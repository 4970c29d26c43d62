//! Packet router
//!
//! The agent control loop's dispatch core: receives packets from the
//! multiplexed transport, resolves the composite key, and routes payloads
//! into the matching protocol proxy, constructing one lazily on the first
//! packet of a new client connection. Session lifecycle packets create and
//! tear down the cached connection parameters and every proxy belonging to
//! the session.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cancel::CancelRegistry;
use crate::config::{AgentConfig, ConnectionParams, ConnectionType};
use crate::error::Result;
use crate::protocol::postgres::codec::fatal_error_packet;
use crate::redact::{Classifier, MaskingConfig};
use crate::transport::{recv, send, spec, ConnectionSink, PacketSink, TransportPacket};

use super::postgres::PostgresProxyHandle;
use super::store::{composite_key, ConnectionStore};
use super::tcp::{TcpRedaction, TcpRelayHandle};
use super::ProxyConnection;

struct SessionEntry {
    conn_type: ConnectionType,
    params: Arc<ConnectionParams>,
}

/// Routes inbound transport packets to protocol proxies.
pub struct PacketRouter {
    config: AgentConfig,
    store: ConnectionStore,
    sessions: DashMap<String, SessionEntry>,
    sink: Arc<dyn PacketSink>,
    registry: Arc<CancelRegistry>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl PacketRouter {
    pub fn new(
        config: AgentConfig,
        sink: Arc<dyn PacketSink>,
        registry: Arc<CancelRegistry>,
        classifier: Option<Arc<dyn Classifier>>,
    ) -> Self {
        Self {
            config,
            store: ConnectionStore::new(),
            sessions: DashMap::new(),
            sink,
            registry,
            classifier,
        }
    }

    /// The live-proxy store; exposed for lifecycle inspection.
    pub fn store(&self) -> &ConnectionStore {
        &self.store
    }

    /// Dispatch one inbound packet. Errors never escape: they are reported
    /// upstream as session-close packets or protocol-native errors.
    pub async fn handle_packet(&self, pkt: TransportPacket) {
        debug!(
            "session={} - received packet [{}]",
            pkt.session_id(),
            pkt.packet_type
        );
        match pkt.packet_type.as_str() {
            recv::SESSION_OPEN => self.handle_session_open(pkt).await,
            recv::PG_CONNECTION_WRITE => self.handle_pg_write(pkt).await,
            recv::TCP_CONNECTION_WRITE => self.handle_tcp_write(pkt).await,
            recv::TCP_CONNECTION_CLOSE => self.handle_connection_close(&pkt),
            recv::SESSION_CLOSE => self.handle_session_close(&pkt),
            other => debug!("ignoring packet of unknown type [{other}]"),
        }
    }

    /// Decode and cache the session's connection parameters, probe the
    /// target for liveness, and acknowledge.
    async fn handle_session_open(&self, pkt: TransportPacket) {
        let session_id = pkt.session_id().to_string();
        if session_id.is_empty() {
            warn!("received session-open without a session id");
            return;
        }

        let opened = self.open_session(&session_id, &pkt).await;
        match opened {
            Ok(conn_type) => {
                info!("session={session_id} - session opened");
                let ok = TransportPacket::session_open_ok(&session_id, conn_type.as_str());
                let _ = self.sink.send(ok).await;
            }
            Err(err) => {
                warn!("session={session_id} - failed opening session: {err}");
                self.close_session(&session_id, Some(&err.to_string())).await;
            }
        }
    }

    async fn open_session(
        &self,
        session_id: &str,
        pkt: &TransportPacket,
    ) -> Result<ConnectionType> {
        let conn_type = ConnectionType::parse(pkt.connection_type())?;
        let blob = pkt
            .spec
            .get(spec::CONNECTION_PARAMS)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let params = ConnectionParams::decode(blob)?.resolve(conn_type)?;
        info!(
            "session={session_id} - connection params decoded, masking-info-types={}",
            params.info_types.len()
        );

        self.probe_target(&params).await?;
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                conn_type,
                params: Arc::new(params),
            },
        );
        Ok(conn_type)
    }

    /// Cheap TCP liveness probe so a dead target fails the session open
    /// instead of the first client connection.
    async fn probe_target(&self, params: &ConnectionParams) -> Result<()> {
        use crate::error::ProxyError;

        let addr = params.address();
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(ProxyError::Upstream(format!(
                "failed connecting to {addr}, err={e}"
            ))),
            Err(_) => Err(ProxyError::Upstream(format!(
                "failed connecting to {addr}, err=timeout"
            ))),
        }
    }

    /// Route a Postgres payload: existing proxy, or lazily construct one
    /// from the cached session parameters.
    async fn handle_pg_write(&self, pkt: TransportPacket) {
        let session_id = pkt.session_id().to_string();
        let connection_id = pkt.connection_id().to_string();
        if session_id.is_empty() {
            warn!("received postgres payload without a session id");
            return;
        }
        if connection_id.is_empty() {
            if pkt.payload.is_empty() {
                return;
            }
            // Bytes without an addressable connection must not be dropped
            // silently.
            warn!("session={session_id} - postgres payload without a connection id");
            self.close_session(
                &session_id,
                Some("connection id not found, contact the administrator"),
            )
            .await;
            return;
        }

        let key = composite_key(&session_id, &connection_id);
        if let Some(conn) = self.store.get(&key) {
            if let Err(err) = conn.write(Bytes::from(pkt.payload)).await {
                warn!("session={session_id} - failed writing to proxy: {err}");
                conn.close();
            }
            return;
        }

        let Some(params) = self.session_params(&session_id, ConnectionType::Postgres) else {
            self.write_pg_client_error(
                &session_id,
                &connection_id,
                "credentials not found, contact the administrator",
            )
            .await;
            self.close_session(&session_id, Some("postgres session not found"))
                .await;
            return;
        };

        let connected = PostgresProxyHandle::connect(
            params,
            &self.config,
            Arc::clone(&self.sink),
            &session_id,
            &connection_id,
            Arc::clone(&self.registry),
            self.classifier.clone(),
        )
        .await;

        match connected {
            Ok(handle) => {
                let conn = ProxyConnection::Postgres(handle);
                // Prime the proxy with the first payload before storing so
                // a concurrent write cannot observe an un-primed proxy.
                if let Err(err) = conn.write(Bytes::from(pkt.payload)).await {
                    warn!("session={session_id} - failed priming proxy: {err}");
                    conn.close();
                    return;
                }
                self.store.set(&key, conn);
            }
            Err(err) => {
                warn!("session={session_id} - failed starting postgres proxy: {err}");
                self.write_pg_client_error(
                    &session_id,
                    &connection_id,
                    "failed connecting with postgres server, contact the administrator",
                )
                .await;
                self.close_session(&session_id, Some(&err.to_string())).await;
            }
        }
    }

    /// Route a raw TCP payload, lazily dialing the relay.
    async fn handle_tcp_write(&self, pkt: TransportPacket) {
        let session_id = pkt.session_id().to_string();
        let connection_id = pkt.connection_id().to_string();
        if session_id.is_empty() {
            warn!("received tcp payload without a session id");
            return;
        }
        if connection_id.is_empty() {
            if pkt.payload.is_empty() {
                return;
            }
            warn!("session={session_id} - tcp payload without a connection id");
            self.close_session(
                &session_id,
                Some("connection id not found, contact the administrator"),
            )
            .await;
            return;
        }

        let key = composite_key(&session_id, &connection_id);
        if let Some(conn) = self.store.get(&key) {
            if let Err(err) = conn.write(Bytes::from(pkt.payload)).await {
                warn!("session={session_id} - failed writing to relay: {err}");
                conn.close();
            }
            return;
        }

        let Some(params) = self.session_params(&session_id, ConnectionType::Tcp) else {
            self.close_session(&session_id, Some("tcp session not found"))
                .await;
            return;
        };

        let redaction = self.tcp_redaction(&params);
        let connected = TcpRelayHandle::connect(
            &params.address(),
            Duration::from_secs(self.config.connect_timeout_secs),
            Arc::clone(&self.sink),
            &session_id,
            &connection_id,
            redaction,
        )
        .await;

        match connected {
            Ok(handle) => {
                let conn = ProxyConnection::Tcp(handle);
                if let Err(err) = conn.write(Bytes::from(pkt.payload)).await {
                    warn!("session={session_id} - failed priming relay: {err}");
                    conn.close();
                    return;
                }
                self.store.set(&key, conn);
            }
            Err(err) => {
                warn!("session={session_id} - failed starting tcp relay: {err}");
                self.close_session(&session_id, Some(&err.to_string())).await;
            }
        }
    }

    /// Close every proxy under one client connection (sub-channels
    /// included), leaving the session's other connections untouched.
    fn handle_connection_close(&self, pkt: &TransportPacket) {
        let prefix = composite_key(pkt.session_id(), pkt.connection_id());
        info!("received {}, filter-by={prefix}", pkt.packet_type);
        for (key, conn) in self.store.filter(|k| k.starts_with(&prefix)) {
            conn.close();
            self.store.delete(&key);
        }
    }

    /// Tear down every proxy of the session. Keys of other sessions that
    /// merely embed this session id as a suffix are left alone.
    fn handle_session_close(&self, pkt: &TransportPacket) {
        let session_id = pkt.session_id().to_string();
        if session_id.is_empty() {
            warn!("received session-close without a session id");
            return;
        }
        info!("session={session_id} - cleaning up session");
        let prefix = format!("{session_id}:");
        for (key, conn) in self
            .store
            .filter(|k| k == session_id || k.starts_with(&prefix))
        {
            conn.close();
            self.store.delete(&key);
        }
        self.sessions.remove(&session_id);
    }

    fn session_params(
        &self,
        session_id: &str,
        expected: ConnectionType,
    ) -> Option<Arc<ConnectionParams>> {
        let entry = self.sessions.get(session_id)?;
        if entry.conn_type != expected {
            warn!(
                "session={session_id} - protocol mismatch: session is {}, packet wants {}",
                entry.conn_type.as_str(),
                expected.as_str()
            );
            return None;
        }
        Some(Arc::clone(&entry.params))
    }

    fn tcp_redaction(&self, params: &ConnectionParams) -> Option<TcpRedaction> {
        let classifier = self.classifier.clone()?;
        let config = match MaskingConfig::new(&params.info_types, &self.config.redaction) {
            Ok(config) if config.is_enabled() => config,
            Ok(_) => return None,
            Err(err) => {
                warn!("invalid masking configuration: {err}");
                return None;
            }
        };
        Some(TcpRedaction {
            classifier,
            config,
            limits: self.config.redaction.clone(),
        })
    }

    async fn close_session(&self, session_id: &str, err_msg: Option<&str>) {
        let exit_code = if err_msg.is_some() { 1 } else { 0 };
        let pkt = TransportPacket::session_close(session_id, err_msg, exit_code);
        if let Err(e) = self.sink.send(pkt).await {
            warn!("failed sending session close: {e}");
        }
    }

    /// Protocol-native fatal error so the client's own driver displays it.
    async fn write_pg_client_error(&self, session_id: &str, connection_id: &str, msg: &str) {
        let sink = ConnectionSink::new(
            Arc::clone(&self.sink),
            send::PG_CLIENT_WRITE,
            session_id,
            connection_id,
        );
        if let Err(e) = sink.write(&fatal_error_packet(msg).encode()).await {
            warn!("failed writing error back to client: {e}");
        }
    }
}
