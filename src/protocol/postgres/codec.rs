//! PostgreSQL message codec (read/write)
//!
//! Decodes single protocol frames from a byte source and re-encodes them
//! byte-exactly, plus parsers and builders for the packets the proxy
//! fabricates itself (auth results, errors, cancel requests, data rows).
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

use super::constants::*;
use super::messages::*;

/// Maximum accepted frame length (16 MiB). Anything larger is treated as
/// malformed or hostile input, not buffered.
pub const MAX_PACKET_SIZE: u32 = 1 << 24;

/// Minimum frame length: the 4-byte length field itself.
pub const MIN_PACKET_SIZE: u32 = 4;

// ============================================================================
// Packet
// ============================================================================

/// One protocol frame: an optional one-byte tag, a 4-byte big-endian
/// length-of-remainder header (implicit), and the frame body.
///
/// `encode` reproduces the exact wire bytes the frame was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    tag: Option<u8>,
    body: Bytes,
}

impl Packet {
    /// Build a typed frame (steady-state protocol traffic).
    pub fn typed(tag: u8, body: impl Into<Bytes>) -> Self {
        Self {
            tag: Some(tag),
            body: body.into(),
        }
    }

    /// Build an untyped frame (startup phase).
    pub fn untyped(body: impl Into<Bytes>) -> Self {
        Self {
            tag: None,
            body: body.into(),
        }
    }

    pub fn tag(&self) -> Option<u8> {
        self.tag
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Total encoded size on the wire.
    pub fn encoded_len(&self) -> usize {
        self.tag.map_or(0, |_| 1) + 4 + self.body.len()
    }

    /// Serialize to wire bytes: `[tag?][len = 4 + body][body]`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        if let Some(tag) = self.tag {
            buf.put_u8(tag);
        }
        buf.put_u32(self.body.len() as u32 + 4);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

// ============================================================================
// Low-Level Read Helpers
// ============================================================================

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).await?;
    Ok(buf[0])
}

async fn read_u32_be<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

/// Read a null-terminated string from a buffer at the given offset.
/// Returns the string and the number of bytes consumed (including null).
fn read_cstring_from_buf(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    if offset >= buf.len() {
        return Err(ProxyError::Protocol("string offset out of bounds".into()));
    }
    let end = buf[offset..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProxyError::Protocol("missing null terminator in string".into()))?;
    let s = std::str::from_utf8(&buf[offset..offset + end])
        .map_err(|_| ProxyError::Protocol("invalid UTF-8 in string".into()))?;
    Ok((s.to_string(), end + 1))
}

fn validate_length(length: u32) -> Result<usize> {
    if length < MIN_PACKET_SIZE {
        return Err(ProxyError::Protocol(format!(
            "invalid packet length: {length}"
        )));
    }
    if length > MAX_PACKET_SIZE {
        return Err(ProxyError::Protocol(format!(
            "packet too large: {length} bytes (max: {MAX_PACKET_SIZE})"
        )));
    }
    Ok((length - 4) as usize)
}

// ============================================================================
// Frame Reading
// ============================================================================

/// Read one typed frame (type byte + length + body).
///
/// Fails with a protocol error if the declared length is out of bounds or
/// the source closes mid-frame.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet> {
    let tag = read_u8(reader).await?;
    let length = read_u32_be(reader).await?;
    let body_len = validate_length(length)?;

    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        reader.read_exact(&mut body).await?;
    }
    Ok(Packet::typed(tag, body))
}

/// The three shapes a startup-phase packet can take.
#[derive(Debug)]
pub enum StartupPacket {
    /// Frontend SSL upgrade request
    SslRequest,
    /// Frontend GSSAPI encryption request
    GssEncRequest,
    /// Out-of-band query cancellation
    CancelRequest(CancelRequest),
    /// Regular startup with connection parameters
    Startup(StartupMessage),
}

/// Read the length-prefixed, untyped startup packet used before a type
/// byte exists, detecting the SSL/GSSENC and cancel special forms.
pub async fn read_startup<R: AsyncRead + Unpin>(reader: &mut R) -> Result<StartupPacket> {
    let length = read_u32_be(reader).await?;
    if length < 8 {
        return Err(ProxyError::Protocol(format!(
            "startup packet too short: {length} bytes"
        )));
    }
    if length > MAX_PACKET_SIZE {
        return Err(ProxyError::Protocol(format!(
            "startup packet too large: {length} bytes"
        )));
    }

    let code = read_u32_be(reader).await?;
    match code {
        SSL_REQUEST_CODE => return Ok(StartupPacket::SslRequest),
        GSSENC_REQUEST_CODE => return Ok(StartupPacket::GssEncRequest),
        CANCEL_REQUEST_CODE => {
            let process_id = read_u32_be(reader).await?;
            let secret_key = read_u32_be(reader).await?;
            return Ok(StartupPacket::CancelRequest(CancelRequest {
                process_id,
                secret_key,
            }));
        }
        PROTOCOL_VERSION_3_0 => {}
        other => {
            return Err(ProxyError::Protocol(format!(
                "unsupported protocol version: {other}"
            )));
        }
    }

    let mut buf = vec![0u8; (length - 8) as usize];
    reader.read_exact(&mut buf).await?;

    // Null-terminated key/value pairs, ended by an empty key. Wire order is
    // preserved so the rewritten packet stays deterministic.
    let mut parameters = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (key, key_len) = read_cstring_from_buf(&buf, offset)?;
        offset += key_len;
        if key.is_empty() {
            break;
        }
        if offset >= buf.len() {
            return Err(ProxyError::Protocol(format!(
                "missing value for parameter {key}"
            )));
        }
        let (value, value_len) = read_cstring_from_buf(&buf, offset)?;
        offset += value_len;
        parameters.push((key, value));
    }

    Ok(StartupPacket::Startup(StartupMessage {
        protocol_version: code,
        parameters,
    }))
}

// ============================================================================
// Frame Building
// ============================================================================

/// Encode a startup message, recomputing the length header.
pub fn encode_startup(msg: &StartupMessage) -> Bytes {
    let mut content = BytesMut::new();
    content.put_u32(msg.protocol_version);
    for (key, value) in &msg.parameters {
        content.extend_from_slice(key.as_bytes());
        content.put_u8(0);
        content.extend_from_slice(value.as_bytes());
        content.put_u8(0);
    }
    content.put_u8(0);

    let mut buf = BytesMut::with_capacity(content.len() + 4);
    buf.put_u32(content.len() as u32 + 4);
    buf.extend_from_slice(&content);
    buf.freeze()
}

/// The 8-byte SSL probe sent to the real server before the startup packet.
pub fn ssl_request() -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&8u32.to_be_bytes());
    buf[4..].copy_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    buf
}

/// The 16-byte cancel request sent on a fresh connection.
pub fn encode_cancel_request(req: &CancelRequest) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..4].copy_from_slice(&16u32.to_be_bytes());
    buf[4..8].copy_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
    buf[8..12].copy_from_slice(&req.process_id.to_be_bytes());
    buf[12..].copy_from_slice(&req.secret_key.to_be_bytes());
    buf
}

/// AuthenticationOk packet, synthesized for the client after the proxy
/// completes the real authentication.
pub fn auth_ok_packet() -> Packet {
    Packet::typed(MSG_AUTH_REQUEST, AUTH_OK.to_be_bytes().to_vec())
}

/// Fatal ErrorResponse packet for client-facing failures.
pub fn fatal_error_packet(message: &str) -> Packet {
    error_response_packet(&ErrorResponse::internal_error(message))
}

/// ErrorResponse packet from structured fields.
pub fn error_response_packet(response: &ErrorResponse) -> Packet {
    let mut body = BytesMut::new();
    for (field_type, value) in &response.fields {
        body.put_u8(*field_type);
        body.extend_from_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    Packet::typed(MSG_ERROR_RESPONSE, body.freeze())
}

/// Password message ('p') carrying a null-terminated password string.
pub fn password_packet(password: &str) -> Packet {
    let mut body = BytesMut::with_capacity(password.len() + 1);
    body.extend_from_slice(password.as_bytes());
    body.put_u8(0);
    Packet::typed(MSG_PASSWORD, body.freeze())
}

/// SASLInitialResponse: mechanism name + length-prefixed client-first data.
pub fn sasl_initial_response_packet(mechanism: &str, data: &[u8]) -> Packet {
    let mut body = BytesMut::new();
    body.extend_from_slice(mechanism.as_bytes());
    body.put_u8(0);
    if data.is_empty() {
        body.put_i32(-1);
    } else {
        body.put_i32(data.len() as i32);
        body.extend_from_slice(data);
    }
    Packet::typed(MSG_PASSWORD, body.freeze())
}

/// SASLResponse: raw client-final data.
pub fn sasl_response_packet(data: &[u8]) -> Packet {
    Packet::typed(MSG_PASSWORD, data.to_vec())
}

/// Re-encode a data row into wire format, preserving the NULL sentinel.
pub fn data_row_packet(row: &DataRow) -> Packet {
    let mut body = BytesMut::new();
    body.put_u16(row.values.len() as u16);
    for value in &row.values {
        match value {
            Some(data) => {
                body.put_i32(data.len() as i32);
                body.extend_from_slice(data);
            }
            None => body.put_i32(DATA_ROW_NULL),
        }
    }
    Packet::typed(MSG_DATA_ROW, body.freeze())
}

// ============================================================================
// Body Parsing
// ============================================================================

/// Parse an authentication request body (type 'R').
pub fn parse_authentication(body: &[u8]) -> Result<AuthenticationMessage> {
    if body.len() < 4 {
        return Err(ProxyError::Protocol(
            "authentication message too short".into(),
        ));
    }
    let auth_type = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);

    match auth_type {
        AUTH_OK => Ok(AuthenticationMessage::Ok),
        AUTH_CLEARTEXT_PASSWORD => Ok(AuthenticationMessage::CleartextPassword),
        AUTH_MD5_PASSWORD => {
            if body.len() < 8 {
                return Err(ProxyError::Protocol("MD5 auth message missing salt".into()));
            }
            let mut salt = [0u8; 4];
            salt.copy_from_slice(&body[4..8]);
            Ok(AuthenticationMessage::Md5Password { salt })
        }
        AUTH_SASL => {
            let mut mechanisms = Vec::new();
            let mut offset = 4;
            while offset < body.len() {
                let (mechanism, len) = read_cstring_from_buf(body, offset)?;
                offset += len;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            Ok(AuthenticationMessage::Sasl { mechanisms })
        }
        AUTH_SASL_CONTINUE => Ok(AuthenticationMessage::SaslContinue {
            data: body[4..].to_vec(),
        }),
        AUTH_SASL_FINAL => Ok(AuthenticationMessage::SaslFinal {
            data: body[4..].to_vec(),
        }),
        other => Ok(AuthenticationMessage::Unsupported(other)),
    }
}

/// Parse an error/notice response body (types 'E' and 'N').
pub fn parse_error_response(body: &[u8]) -> Result<ErrorResponse> {
    let mut response = ErrorResponse::new();
    let mut offset = 0;
    while offset < body.len() {
        let field_type = body[offset];
        offset += 1;
        if field_type == 0 {
            break;
        }
        let (value, len) = read_cstring_from_buf(body, offset)?;
        offset += len;
        response.push_field(field_type, &value);
    }
    Ok(response)
}

/// Parse a backend key data body (type 'K').
pub fn parse_backend_key_data(body: &[u8]) -> Result<BackendKeyData> {
    if body.len() < 8 {
        return Err(ProxyError::Protocol("BackendKeyData too short".into()));
    }
    Ok(BackendKeyData {
        process_id: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
        secret_key: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
    })
}

/// Parse a data row body (type 'D'), mapping the -1 sentinel to NULL.
pub fn parse_data_row(body: &[u8]) -> Result<DataRow> {
    if body.len() < 2 {
        return Err(ProxyError::Protocol("DataRow too short".into()));
    }
    let column_count = u16::from_be_bytes([body[0], body[1]]) as usize;
    let mut values = Vec::with_capacity(column_count);
    let mut offset = 2;

    for _ in 0..column_count {
        if offset + 4 > body.len() {
            return Err(ProxyError::Protocol("DataRow value length truncated".into()));
        }
        let value_len = i32::from_be_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]);
        offset += 4;

        if value_len == DATA_ROW_NULL {
            values.push(None);
        } else {
            let len = value_len as usize;
            if offset + len > body.len() {
                return Err(ProxyError::Protocol("DataRow value data truncated".into()));
            }
            values.push(Some(body[offset..offset + len].to_vec()));
            offset += len;
        }
    }
    Ok(DataRow { values })
}
