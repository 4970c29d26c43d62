//! Cancel-request registry
//!
//! Several logical sessions may share one physical backend connection at
//! the real server, so canceling must not race ahead of sessions that
//! still need the backend alive. Backends are tracked per host; a host's
//! group is flushed, as one batch over a fresh TCP connection, only once
//! every entry in the group has been released.
//!
//! Constructed once at process start and injected into every Postgres
//! proxy instance; see <https://www.postgresql.org/docs/current/protocol-flow.html>
//! for the cancel-request flow this implements.

use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ProxyError, Result};
use crate::protocol::postgres::codec::encode_cancel_request;
use crate::protocol::postgres::messages::{BackendKeyData, CancelRequest};

/// One tracked backend process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelEntry {
    pub host: String,
    pub port: u16,
    pub process_id: u32,
    pub secret_key: u32,
    removed: bool,
}

/// Process-wide registry of outstanding backend pid/secret pairs.
pub struct CancelRegistry {
    groups: DashMap<String, Vec<CancelEntry>>,
    flush_timeout: Duration,
}

impl CancelRegistry {
    pub fn new(flush_timeout: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            flush_timeout,
        }
    }

    /// Track a backend announced via BackendKeyData.
    pub fn register(&self, host: &str, port: u16, key: BackendKeyData) {
        let entry = CancelEntry {
            host: host.to_string(),
            port,
            process_id: key.process_id,
            secret_key: key.secret_key,
            removed: false,
        };
        self.groups.entry(host.to_string()).or_default().push(entry);
        debug!(
            "registered backend pid={} for host={}",
            key.process_id, host
        );
    }

    /// Mark one backend released. When every entry of the host's group is
    /// released, the whole group is sent upstream as one best-effort batch.
    pub fn release(&self, host: &str, pid: u32) {
        if let Some(group) = self.complete_group(host, pid) {
            let flush_timeout = self.flush_timeout;
            tokio::spawn(async move {
                send_cancel_batch(group, flush_timeout).await;
            });
        }
    }

    /// Number of backends still tracked for a host.
    pub fn tracked(&self, host: &str) -> usize {
        self.groups.get(host).map_or(0, |g| g.len())
    }

    /// Mark `pid` removed; return and drop the group once all of its
    /// entries are removed.
    pub(crate) fn complete_group(&self, host: &str, pid: u32) -> Option<Vec<CancelEntry>> {
        let Some(mut group) = self.groups.get_mut(host) else {
            // Inconsistency is logged, never allowed to block the data path.
            debug!("release for untracked host={host}, pid={pid}");
            return None;
        };
        if let Some(entry) = group.iter_mut().find(|e| e.process_id == pid && !e.removed) {
            entry.removed = true;
        } else {
            warn!("release for unknown backend pid={pid} on host={host}");
        }
        if group.iter().all(|e| e.removed) {
            drop(group);
            return self.groups.remove(host).map(|(_, g)| g);
        }
        None
    }

    /// Forward an out-of-band cancel request a client sent on a fresh
    /// connection. Best-effort and time-boxed like the batch flush.
    pub async fn forward(&self, host: &str, port: u16, request: CancelRequest) -> Result<()> {
        let addr = format!("{host}:{port}");
        let mut stream = timeout(self.flush_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::Timeout(format!("dialing {addr} for cancel request")))?
            .map_err(|e| ProxyError::Upstream(format!("failed dialing {addr}: {e}")))?;
        stream.write_all(&encode_cancel_request(&request)).await?;
        stream.shutdown().await.ok();
        info!("forwarded cancel request for pid={}", request.process_id);
        Ok(())
    }
}

/// Dial each tracked backend's host once and send its cancel packet.
/// Failures are logged; there is no retry.
async fn send_cancel_batch(group: Vec<CancelEntry>, flush_timeout: Duration) {
    let mut errors = 0usize;
    let total = group.len();
    for entry in group {
        let addr = format!("{}:{}", entry.host, entry.port);
        let stream = match timeout(flush_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                warn!("fail to dial to {addr}, reason={e}");
                None
            }
            Err(_) => {
                warn!("fail to dial to {addr}, reason=timeout");
                None
            }
        };
        let Some(mut stream) = stream else {
            errors += 1;
            continue;
        };
        info!("canceling request for pid={}", entry.process_id);
        let packet = encode_cancel_request(&CancelRequest {
            process_id: entry.process_id,
            secret_key: entry.secret_key,
        });
        if let Err(e) = stream.write_all(&packet).await {
            warn!("failed sending cancel request to {addr}, reason={e}");
            errors += 1;
        }
        let _ = stream.shutdown().await;
    }
    info!("processed cancel request for total of {total} process(es), errors={errors}");
}
