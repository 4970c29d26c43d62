//! PostgreSQL protocol proxy
//!
//! One instance per client-originated connection. The handshake is
//! intercepted and completed against the real server with the stored
//! credentials:
//!
//! 1. Decode the client startup from the router-fed input buffer; answer
//!    SSL/GSSENC requests with 'N' (TLS toward the client terminates at
//!    the transport layer, not here) and decode the retried startup.
//! 2. Rewrite the username, probe the real server with an SSLRequest, and
//!    apply the configured sslmode policy.
//! 3. Authenticate with the real credentials (cleartext, MD5 or
//!    SCRAM-SHA-256), then synthesize AuthenticationOk for the client.
//! 4. Relay server packets to the transport, intercepting BackendKeyData
//!    for the cancel registry and offering result data to the redactor,
//!    until error, cancellation, or close.
//!
//! A cancel-request startup is handed to the registry and terminates the
//! instance without proxying anything.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelRegistry;
use crate::config::{AgentConfig, ConnectionParams, RedactionLimits};
use crate::error::{ProxyError, Result};
use crate::protocol::postgres::auth::{compute_md5_password, ScramClient};
use crate::protocol::postgres::codec::{
    auth_ok_packet, encode_startup, fatal_error_packet, parse_authentication,
    parse_backend_key_data, parse_error_response, read_packet, read_startup,
    sasl_initial_response_packet, sasl_response_packet, ssl_request, Packet, StartupPacket,
};
use crate::protocol::postgres::constants::*;
use crate::protocol::postgres::messages::{AuthenticationMessage, StartupMessage};
use crate::redact::postgres::{DataRowRedactor, Handled};
use crate::redact::{Classifier, MaskingConfig};
use crate::tls::{self, ServerStream};
use crate::transport::{ConnectionSink, PacketSink, TransportPacket};

use super::input::{client_input, ClientInputReader, ClientInputWriter};
use super::{ProxyState, SharedState};

/// Handle for one Postgres proxy; clones share the same instance.
#[derive(Clone)]
pub struct PostgresProxyHandle {
    input: ClientInputWriter,
    server_writer: Arc<Mutex<Option<WriteHalf<ServerStream>>>>,
    state: SharedState,
    cancel: CancellationToken,
}

impl PostgresProxyHandle {
    /// Dial the real server and start the proxy's driver task.
    ///
    /// Dial failure is reported here so the router can close the session
    /// without storing anything.
    pub async fn connect(
        params: Arc<ConnectionParams>,
        config: &AgentConfig,
        sink: Arc<dyn PacketSink>,
        session_id: &str,
        connection_id: &str,
        registry: Arc<CancelRegistry>,
        classifier: Option<Arc<dyn Classifier>>,
    ) -> Result<Self> {
        let masking = MaskingConfig::new(&params.info_types, &config.redaction)?;

        let addr = params.address();
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::Timeout(format!("connecting to {addr}")))?
            .map_err(|e| ProxyError::Upstream(format!("failed connecting to {addr}: {e}")))?;

        info!(
            "initializing postgres session, user={}, sslmode={:?}, servername={}",
            params.user, params.ssl_mode, params.host
        );

        let (input_writer, input_reader) = client_input();
        let state = SharedState::default();
        let cancel = CancellationToken::new();
        let server_writer = Arc::new(Mutex::new(None));

        let handle = Self {
            input: input_writer,
            server_writer: Arc::clone(&server_writer),
            state: state.clone(),
            cancel: cancel.clone(),
        };

        let driver = Driver {
            params,
            limits: config.redaction.clone(),
            masking,
            client_sink: ConnectionSink::new(
                Arc::clone(&sink),
                crate::transport::send::PG_CLIENT_WRITE,
                session_id,
                connection_id,
            ),
            sink,
            session_id: session_id.to_string(),
            registry,
            classifier,
            state,
            server_writer,
            cancel,
            backend_pid: StdMutex::new(None),
        };
        tokio::spawn(driver.run(stream, input_reader));

        Ok(handle)
    }

    /// Feed client bytes into the proxy. Before initialization completes
    /// they land in the startup buffer; afterwards each frame is decoded
    /// and forwarded to the real server.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        match self.state.get() {
            ProxyState::Closed => Err(ProxyError::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            ))),
            ProxyState::Relaying => {
                let mut guard = self.server_writer.lock().await;
                let writer = guard.as_mut().ok_or_else(|| {
                    ProxyError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
                })?;
                let mut cursor = std::io::Cursor::new(&data[..]);
                while (cursor.position() as usize) < data.len() {
                    let pkt = read_packet(&mut cursor).await?;
                    writer.write_all(&pkt.encode()).await?;
                }
                writer.flush().await?;
                Ok(())
            }
            ProxyState::Uninitialized | ProxyState::Initializing => {
                self.state.advance(ProxyState::Initializing);
                self.input.write(data)
            }
        }
    }

    pub fn close(&self) {
        self.state.advance(ProxyState::Closed);
        self.cancel.cancel();
    }

    pub fn is_alive(&self) -> bool {
        !self.state.is_closed()
    }

    pub fn state(&self) -> ProxyState {
        self.state.get()
    }

    /// Completes when the proxy reaches its closed state.
    pub async fn done(&self) {
        self.cancel.cancelled().await;
    }
}

/// Owns the handshake and the server-to-client relay for one connection.
struct Driver {
    params: Arc<ConnectionParams>,
    limits: RedactionLimits,
    masking: MaskingConfig,
    client_sink: ConnectionSink,
    sink: Arc<dyn PacketSink>,
    session_id: String,
    registry: Arc<CancelRegistry>,
    classifier: Option<Arc<dyn Classifier>>,
    state: SharedState,
    server_writer: Arc<Mutex<Option<WriteHalf<ServerStream>>>>,
    cancel: CancellationToken,
    backend_pid: StdMutex<Option<u32>>,
}

impl Driver {
    fn port(&self) -> u16 {
        self.params.port.unwrap_or(5432)
    }

    async fn run(mut self, stream: TcpStream, input: ClientInputReader) {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            res = self.drive(stream, input) => res,
        };

        let was_initializing = self.state.get() != ProxyState::Relaying;
        self.state.advance(ProxyState::Closed);
        self.cancel.cancel();
        if let Some(mut writer) = self.server_writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(pid) = self.backend_pid.lock().map(|g| *g).unwrap_or(None) {
            self.registry.release(&self.params.host, pid);
        }

        match result {
            Ok(()) => {
                info!("session={} - done reading postgres connection", self.session_id);
                let close = TransportPacket::session_close(&self.session_id, None, 0);
                let _ = self.sink.send(close).await;
            }
            Err(err) => {
                let msg = format!("failed processing postgres session, reason={err}");
                warn!("session={} - {msg}", self.session_id);
                if was_initializing {
                    // The client driver is waiting on an auth response; a
                    // protocol-native fatal error displays cleanly.
                    let _ = self
                        .client_sink
                        .write(&fatal_error_packet(&msg).encode())
                        .await;
                }
                let close = TransportPacket::session_close(&self.session_id, Some(&msg), 1);
                let _ = self.sink.send(close).await;
            }
        }
    }

    async fn drive(&mut self, stream: TcpStream, mut input: ClientInputReader) -> Result<()> {
        let Some(mut startup) = self.read_client_startup(&mut input).await? else {
            // Cancel request: handled out of band, nothing to proxy.
            return Ok(());
        };

        startup.set_user(&self.params.user);
        let mut server = self.negotiate_server_tls(stream).await?;
        self.authenticate(&mut server, &startup).await?;

        // The client's own driver now believes it authenticated directly.
        self.client_sink.write(&auth_ok_packet().encode()).await?;
        info!("session={} - initialized postgres session", self.session_id);

        self.state.advance(ProxyState::Relaying);
        let (read_half, write_half) = tokio::io::split(server);
        *self.server_writer.lock().await = Some(write_half);

        self.relay(read_half).await
    }

    /// Decode the client's startup packet, answering TLS probes with 'N'
    /// (the transport link is already encrypted) and handing cancel
    /// requests to the registry.
    async fn read_client_startup(
        &self,
        input: &mut ClientInputReader,
    ) -> Result<Option<StartupMessage>> {
        self.state.advance(ProxyState::Initializing);

        let mut pkt = read_startup(input).await?;
        if matches!(
            pkt,
            StartupPacket::SslRequest | StartupPacket::GssEncRequest
        ) {
            self.client_sink.write(&[SSL_NOT_SUPPORTED]).await?;
            pkt = read_startup(input).await?;
        }

        match pkt {
            StartupPacket::Startup(msg) => Ok(Some(msg)),
            StartupPacket::CancelRequest(req) => {
                info!(
                    "session={} - forwarding cancel request for pid={}",
                    self.session_id, req.process_id
                );
                if let Err(e) = self.registry.forward(&self.params.host, self.port(), req).await {
                    warn!("failed forwarding cancel request: {e}");
                }
                Ok(None)
            }
            StartupPacket::SslRequest | StartupPacket::GssEncRequest => Err(ProxyError::Protocol(
                "repeated TLS negotiation request in startup".into(),
            )),
        }
    }

    /// Probe the real server for TLS and wrap the stream per the sslmode
    /// policy. A server without TLS under require/verify-full is a hard
    /// failure, never a silent downgrade.
    async fn negotiate_server_tls(&self, mut stream: TcpStream) -> Result<ServerStream> {
        stream.write_all(&ssl_request()).await?;
        stream.flush().await?;

        let mut response = [0u8; 1];
        stream.read_exact(&mut response).await?;
        let supports_tls = match response[0] {
            SSL_SUPPORTED => true,
            SSL_NOT_SUPPORTED => false,
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unexpected SSL probe response from server: 0x{other:02X}"
                )));
            }
        };

        let server = tls::negotiate(
            stream,
            self.params.ssl_mode,
            supports_tls,
            &self.params.host,
            self.params.ssl_root_cert.as_deref(),
        )
        .await?;
        info!(
            "sslmode={:?}, server-supports-tls={supports_tls}, encrypted={}",
            self.params.ssl_mode,
            server.is_encrypted()
        );
        Ok(server)
    }

    /// Complete the server's authentication exchange with the real
    /// credentials. The original client never supplies or sees them.
    async fn authenticate(
        &self,
        server: &mut ServerStream,
        startup: &StartupMessage,
    ) -> Result<()> {
        server.write_all(&encode_startup(startup)).await?;
        server.flush().await?;

        loop {
            match self.read_auth_message(server).await? {
                AuthenticationMessage::Ok => {
                    debug!("server authentication successful");
                    return Ok(());
                }
                AuthenticationMessage::CleartextPassword => {
                    let pkt = crate::protocol::postgres::codec::password_packet(
                        &self.params.password,
                    );
                    server.write_all(&pkt.encode()).await?;
                    server.flush().await?;
                }
                AuthenticationMessage::Md5Password { salt } => {
                    debug!("server requested MD5 password");
                    let md5 =
                        compute_md5_password(&self.params.user, &self.params.password, &salt);
                    let pkt = crate::protocol::postgres::codec::password_packet(&md5);
                    server.write_all(&pkt.encode()).await?;
                    server.flush().await?;
                }
                AuthenticationMessage::Sasl { mechanisms } => {
                    debug!("server requested SASL authentication: {mechanisms:?}");
                    return self.scram_auth(server, &mechanisms).await;
                }
                AuthenticationMessage::SaslContinue { .. }
                | AuthenticationMessage::SaslFinal { .. } => {
                    return Err(ProxyError::Protocol(
                        "unexpected SASL continuation outside an exchange".into(),
                    ));
                }
                AuthenticationMessage::Unsupported(auth_type) => {
                    return Err(ProxyError::Handshake(format!(
                        "authentication type [{auth_type}] not supported"
                    )));
                }
            }
        }
    }

    /// Run the SCRAM-SHA-256 client-first/server-first/client-final/
    /// server-final exchange, then wait for AuthenticationOk.
    async fn scram_auth(&self, server: &mut ServerStream, mechanisms: &[String]) -> Result<()> {
        if !mechanisms
            .iter()
            .any(|m| m == SASL_MECHANISM_SCRAM_SHA_256)
        {
            return Err(ProxyError::Handshake(
                "server does not support SCRAM-SHA-256".into(),
            ));
        }

        let mut scram = ScramClient::new(&self.params.user, &self.params.password);
        let pkt =
            sasl_initial_response_packet(SASL_MECHANISM_SCRAM_SHA_256, &scram.client_first());
        server.write_all(&pkt.encode()).await?;
        server.flush().await?;

        let server_first = match self.read_auth_message(server).await? {
            AuthenticationMessage::SaslContinue { data } => data,
            other => {
                return Err(ProxyError::Protocol(format!(
                    "expected SASL continue, got {other:?}"
                )));
            }
        };
        let client_final = scram.continue_with(&server_first)?;
        server.write_all(&sasl_response_packet(&client_final).encode()).await?;
        server.flush().await?;

        match self.read_auth_message(server).await? {
            AuthenticationMessage::SaslFinal { data } => {
                scram.verify_final(&data)?;
                debug!("SCRAM server signature verified");
            }
            // Some servers skip the final message and answer Ok directly.
            AuthenticationMessage::Ok => return Ok(()),
            other => {
                return Err(ProxyError::Protocol(format!(
                    "expected SASL final, got {other:?}"
                )));
            }
        }

        match self.read_auth_message(server).await? {
            AuthenticationMessage::Ok => Ok(()),
            other => Err(ProxyError::Protocol(format!(
                "expected AuthenticationOk, got {other:?}"
            ))),
        }
    }

    /// Read the next authentication packet. A server ErrorResponse is
    /// forwarded to the client verbatim before failing the handshake.
    async fn read_auth_message(&self, server: &mut ServerStream) -> Result<AuthenticationMessage> {
        let pkt = read_packet(server).await?;
        match pkt.tag() {
            Some(MSG_AUTH_REQUEST) => parse_authentication(pkt.body()),
            Some(MSG_ERROR_RESPONSE) => {
                self.client_sink.write(&pkt.encode()).await?;
                let err = parse_error_response(pkt.body()).unwrap_or_default();
                Err(ProxyError::Handshake(format!(
                    "server rejected credentials: {}",
                    err.message().unwrap_or("unknown error")
                )))
            }
            other => Err(ProxyError::Protocol(format!(
                "unexpected packet during authentication: {other:?}"
            ))),
        }
    }

    /// Steady-state loop: decode server packets, intercept BackendKeyData
    /// for the cancel registry, offer everything to the redactor, forward
    /// the rest. Ends on server EOF, error, or cancellation.
    async fn relay(&mut self, mut server: ReadHalf<ServerStream>) -> Result<()> {
        let mut redactor = DataRowRedactor::new(
            self.classifier.clone(),
            self.masking.clone(),
            self.limits.clone(),
            self.client_sink.clone(),
        );

        loop {
            let pkt = match read_packet(&mut server).await {
                Ok(pkt) => pkt,
                Err(ProxyError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    redactor.flush().await?;
                    return Ok(());
                }
                Err(err) => {
                    let _ = redactor.flush().await;
                    return Err(err);
                }
            };

            self.intercept(&pkt);

            match redactor.handle(&pkt).await? {
                Handled::Forward => self.client_sink.write(&pkt.encode()).await?,
                Handled::Done => {}
            }
        }
    }

    /// BackendKeyData is registered before being forwarded onward
    /// unchanged, so an abrupt disconnect can still cancel the backend.
    fn intercept(&self, pkt: &Packet) {
        if pkt.tag() != Some(MSG_BACKEND_KEY_DATA) {
            return;
        }
        match parse_backend_key_data(pkt.body()) {
            Ok(key) => {
                if let Ok(mut guard) = self.backend_pid.lock() {
                    *guard = Some(key.process_id);
                }
                self.registry.register(&self.params.host, self.port(), key);
            }
            Err(e) => warn!("failed parsing backend key data: {e}"),
        }
    }
}
