//! End-to-end masking: a Postgres session with info types configured gets
//! its result rows classified and rewritten before they reach the
//! transport, batched per result set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use gatehouse_agent::redact::{
    Classifier, MaskingConfig, RedactedTable, RedactedText, Table,
};
use gatehouse_agent::transport::{recv, send, spec};
use gatehouse_agent::{
    AgentConfig, CancelRegistry, ChannelSink, PacketRouter, ProxyState, Result, TransportPacket,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Masks every table cell that contains an '@'.
struct EmailMasker;

#[async_trait]
impl Classifier for EmailMasker {
    async fn deidentify_text(&self, _config: &MaskingConfig, text: &str) -> Result<RedactedText> {
        Ok(RedactedText {
            content: text.to_string(),
            summary: vec![],
            results: vec![],
        })
    }

    async fn deidentify_table(
        &self,
        config: &MaskingConfig,
        table: &Table,
    ) -> Result<RedactedTable> {
        let mask = config.masking_character.repeat(5);
        Ok(RedactedTable {
            rows: table
                .rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|cell| {
                            if cell.contains('@') {
                                mask.clone()
                            } else {
                                cell.clone()
                            }
                        })
                        .collect()
                })
                .collect(),
            summary: vec!["EMAIL_ADDRESS".into()],
            results: vec![],
        })
    }
}

/// Minimal MD5-auth mock server that answers one query with a two-column
/// result set (name, email).
async fn mock_server(rows: Vec<(&'static str, &'static str)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let rows = rows.clone();
            tokio::spawn(async move {
                let mut probe = [0u8; 8];
                if socket.read_exact(&mut probe).await.is_err() {
                    return; // liveness probe
                }
                socket.write_all(b"N").await.unwrap();

                // Startup.
                let mut len_buf = [0u8; 4];
                socket.read_exact(&mut len_buf).await.unwrap();
                let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize - 4];
                socket.read_exact(&mut body).await.unwrap();

                // MD5 exchange, accepting whatever arrives.
                let salt = [1u8, 2, 3, 4];
                let mut auth = 5u32.to_be_bytes().to_vec();
                auth.extend_from_slice(&salt);
                write_packet(&mut socket, b'R', &auth).await;
                let _ = read_packet(&mut socket).await;
                write_packet(&mut socket, b'R', &0u32.to_be_bytes()).await;
                let mut key = 7u32.to_be_bytes().to_vec();
                key.extend_from_slice(&9u32.to_be_bytes());
                write_packet(&mut socket, b'K', &key).await;
                write_packet(&mut socket, b'Z', b"I").await;

                // Serve queries until the client goes away.
                while let Some((tag, _)) = read_packet(&mut socket).await {
                    if tag != b'Q' {
                        continue;
                    }
                    for (name, email) in &rows {
                        let mut body = 2u16.to_be_bytes().to_vec();
                        for value in [name, email] {
                            body.extend_from_slice(&(value.len() as i32).to_be_bytes());
                            body.extend_from_slice(value.as_bytes());
                        }
                        write_packet(&mut socket, b'D', &body).await;
                    }
                    write_packet(&mut socket, b'C', b"SELECT\0").await;
                    write_packet(&mut socket, b'Z', b"I").await;
                }
            });
        }
    });
    addr
}

async fn write_packet(socket: &mut TcpStream, tag: u8, body: &[u8]) {
    socket.write_all(&[tag]).await.unwrap();
    socket
        .write_all(&(body.len() as u32 + 4).to_be_bytes())
        .await
        .unwrap();
    socket.write_all(body).await.unwrap();
}

async fn read_packet(socket: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut tag = [0u8; 1];
    socket.read_exact(&mut tag).await.ok()?;
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await.ok()?;
    let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize - 4];
    socket.read_exact(&mut payload).await.ok()?;
    Some((tag[0], payload))
}

async fn recv_pkt(rx: &mut mpsc::UnboundedReceiver<TransportPacket>) -> TransportPacket {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("sink closed")
}

/// Decode concatenated data-row packets from a payload prefix; returns the
/// rows and the remaining bytes.
fn split_rows(mut payload: &[u8]) -> (Vec<Vec<String>>, &[u8]) {
    let mut rows = Vec::new();
    while payload.first() == Some(&b'D') {
        let len = u32::from_be_bytes(payload[1..5].try_into().unwrap()) as usize;
        let body = &payload[5..1 + len];
        let columns = u16::from_be_bytes(body[..2].try_into().unwrap()) as usize;
        let mut row = Vec::with_capacity(columns);
        let mut offset = 2;
        for _ in 0..columns {
            let value_len =
                i32::from_be_bytes(body[offset..offset + 4].try_into().unwrap());
            offset += 4;
            if value_len < 0 {
                row.push("NULL".to_string());
            } else {
                let end = offset + value_len as usize;
                row.push(String::from_utf8_lossy(&body[offset..end]).into_owned());
                offset = end;
            }
        }
        rows.push(row);
        payload = &payload[1 + len..];
    }
    (rows, payload)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_set_masked_and_batched() {
    let addr = mock_server(vec![
        ("alice", "alice@example.com"),
        ("bob", "bob@example.com"),
    ])
    .await;

    let (sink, mut rx) = ChannelSink::new();
    let registry = Arc::new(CancelRegistry::new(Duration::from_secs(2)));
    let router = PacketRouter::new(
        AgentConfig::default(),
        Arc::new(sink),
        registry,
        Some(Arc::new(EmailMasker)),
    );

    // Open a session that requests masking.
    let (host, port) = addr.rsplit_once(':').unwrap();
    let params = format!(
        r#"{{"host": "{host}", "port": {port}, "user": "dbuser",
            "password": "dbpass", "info_types": ["EMAIL_ADDRESS"]}}"#
    );
    router
        .handle_packet(
            TransportPacket::new(recv::SESSION_OPEN)
                .with_spec(spec::SESSION_ID, "sess-1")
                .with_spec(spec::CONNECTION_TYPE, "postgres")
                .with_spec(spec::CONNECTION_PARAMS, params.as_bytes().to_vec()),
        )
        .await;
    assert_eq!(recv_pkt(&mut rx).await.packet_type, send::SESSION_OPEN_OK);

    // Startup through the proxy.
    let mut startup = Vec::new();
    let content = {
        let mut c = 196608u32.to_be_bytes().to_vec();
        c.extend_from_slice(b"user\0appuser\0\0");
        c
    };
    startup.extend_from_slice(&(content.len() as u32 + 4).to_be_bytes());
    startup.extend_from_slice(&content);
    router
        .handle_packet(
            TransportPacket::new(recv::PG_CONNECTION_WRITE)
                .with_spec(spec::SESSION_ID, "sess-1")
                .with_spec(spec::CONNECTION_ID, "conn-1")
                .with_payload(startup),
        )
        .await;

    // Drain handshake: auth-ok, backend key data, ready-for-query.
    for _ in 0..3 {
        recv_pkt(&mut rx).await;
    }
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if let Some(conn) = router.store().get("sess-1:conn-1") {
            if conn.state() == ProxyState::Relaying {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "never reached relaying");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Issue a query; the whole result set must come back as ONE packet:
    // masked rows in original order, then CommandComplete, ReadyForQuery.
    let mut query = vec![b'Q'];
    let body = b"SELECT name, email FROM users\0";
    query.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
    query.extend_from_slice(body);
    router
        .handle_packet(
            TransportPacket::new(recv::PG_CONNECTION_WRITE)
                .with_spec(spec::SESSION_ID, "sess-1")
                .with_spec(spec::CONNECTION_ID, "conn-1")
                .with_payload(query),
        )
        .await;

    let pkt = recv_pkt(&mut rx).await;
    assert_eq!(pkt.packet_type, send::PG_CLIENT_WRITE);
    assert!(pkt.spec.contains_key(spec::TRANSFORMATION_SUMMARY));

    let (rows, rest) = split_rows(&pkt.payload);
    assert_eq!(
        rows,
        vec![
            vec!["alice".to_string(), "*****".to_string()],
            vec!["bob".to_string(), "*****".to_string()],
        ]
    );
    // Trailing packets preserved verbatim after the rows.
    assert_eq!(rest[0], b'C');
    let c_len = u32::from_be_bytes(rest[1..5].try_into().unwrap()) as usize;
    assert_eq!(rest[1 + c_len], b'Z');

    // Nothing else was sent for this result set: one flush per batch.
    assert!(rx.try_recv().is_err());
}
