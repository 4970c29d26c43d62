//! Raw TCP relay proxy
//!
//! The degenerate protocol variant: no handshake to intercept, bytes are
//! relayed verbatim in both directions. Outbound (server-to-client) data
//! still flows through the free-text redaction pipeline when the session
//! requests masking.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::RedactionLimits;
use crate::error::{ProxyError, Result};
use crate::redact::{redact_payload, Classifier, MaskingConfig};
use crate::transport::{ConnectionSink, PacketSink, TransportPacket};

use super::{ProxyState, SharedState};

/// Read size toward the transport; keeps individual frames bounded.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Masking setup for one relay's outbound stream.
pub struct TcpRedaction {
    pub classifier: Arc<dyn Classifier>,
    pub config: MaskingConfig,
    pub limits: RedactionLimits,
}

/// Handle for one raw TCP relay; clones share the same connection.
#[derive(Clone)]
pub struct TcpRelayHandle {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
    state: SharedState,
}

impl TcpRelayHandle {
    /// Dial the target and start the server-to-client relay task.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        sink: Arc<dyn PacketSink>,
        session_id: &str,
        connection_id: &str,
        redaction: Option<TcpRedaction>,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::Timeout(format!("connecting to {addr}")))?
            .map_err(|e| ProxyError::Upstream(format!("failed connecting to {addr}: {e}")))?;
        debug!("tcp relay connected to {addr}");

        let (read_half, write_half) = stream.into_split();
        let state = SharedState::default();
        state.advance(ProxyState::Relaying);
        let cancel = CancellationToken::new();

        let handle = Self {
            writer: Arc::new(Mutex::new(write_half)),
            cancel: cancel.clone(),
            state: state.clone(),
        };

        let data_sink = ConnectionSink::new(
            Arc::clone(&sink),
            crate::transport::send::TCP_CLIENT_WRITE,
            session_id,
            connection_id,
        );
        let session_id = session_id.to_string();
        let connection_id = connection_id.to_string();
        tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = read_half.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            warn!("tcp relay read error: {e}");
                            break;
                        }
                    },
                };

                let result = match &redaction {
                    Some(red) => {
                        match redact_payload(&red.classifier, &red.config, &red.limits, &buf[..n])
                            .await
                        {
                            Some((data, summaries)) => {
                                data_sink.write_with_summary(&data, &summaries).await
                            }
                            None => data_sink.write(&buf[..n]).await,
                        }
                    }
                    None => data_sink.write(&buf[..n]).await,
                };
                if let Err(e) = result {
                    warn!("tcp relay failed writing to transport: {e}");
                    break;
                }
            }

            state.advance(ProxyState::Closed);
            // Tell the peer to tear down the matching client socket.
            let close = TransportPacket::connection_close(&session_id, &connection_id);
            if let Err(e) = sink.send(close).await {
                debug!("tcp relay failed sending connection close: {e}");
            }
            debug!("tcp relay for {session_id}:{connection_id} exited");
        });

        Ok(handle)
    }

    /// Forward client payload bytes to the real server.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        if self.state.is_closed() {
            return Err(ProxyError::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
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
}
