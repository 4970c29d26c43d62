//! Agent and per-session configuration types
//!
//! Two kinds of configuration flow through the engine:
//!
//! - [`ConnectionParams`]: decoded once from the session-open packet's
//!   connection-parameters blob and cached per session. Carries the target
//!   address, the real credentials the end client never sees, and the
//!   data-masking setup.
//! - [`AgentConfig`]: process-wide knobs (timeouts, redaction limits),
//!   deserializable from YAML.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{ProxyError, Result};
use crate::tls::SslMode;

/// Wire protocol spoken on a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// PostgreSQL protocol 3.0 with handshake interception
    Postgres,
    /// Opaque byte relay
    Tcp,
}

impl ConnectionType {
    /// Parse the `connection-type` spec value.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "postgres" => Ok(Self::Postgres),
            "tcp" => Ok(Self::Tcp),
            other => Err(ProxyError::Config(format!(
                "unsupported connection type: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Tcp => "tcp",
        }
    }
}

/// Per-session connection parameters, delivered once at session-open.
///
/// The blob arrives opaque on the transport; only this type knows its
/// layout. Credentials here are the *real* ones resolved by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionParams {
    /// Target database/service host
    pub host: String,
    /// Target port (protocol default applied when absent)
    #[serde(default)]
    pub port: Option<u16>,
    /// Real username substituted into the client handshake
    #[serde(default)]
    pub user: String,
    /// Real password, never transmitted to the end client
    #[serde(default)]
    pub password: String,
    /// Default database, when the client does not name one
    #[serde(default)]
    pub database: Option<String>,
    /// SSL mode policy toward the real server
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Certificate authority bundle for `verify-full`
    #[serde(default)]
    pub ssl_root_cert: Option<PathBuf>,
    /// Command list for exec-style sessions (opaque to this engine)
    #[serde(default)]
    pub command: Vec<String>,
    /// Info-type names requested for redaction; empty disables masking
    #[serde(default)]
    pub info_types: Vec<String>,
}

impl ConnectionParams {
    /// Decode the connection-parameters blob from a session-open packet.
    pub fn decode(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob)
            .map_err(|e| ProxyError::Config(format!("failed decoding connection params: {e}")))
    }

    /// Apply per-protocol defaults and check required fields.
    pub fn resolve(mut self, conn_type: ConnectionType) -> Result<Self> {
        match conn_type {
            ConnectionType::Postgres => {
                if self.port.is_none() {
                    self.port = Some(5432);
                }
                if self.host.is_empty() || self.user.is_empty() || self.password.is_empty() {
                    return Err(ProxyError::Config(
                        "missing required secrets for postgres connection [host, user, password]"
                            .into(),
                    ));
                }
            }
            ConnectionType::Tcp => {
                if self.host.is_empty() || self.port.is_none() {
                    return Err(ProxyError::Config(
                        "missing required parameters for tcp connection [host, port]".into(),
                    ));
                }
            }
        }
        Ok(self)
    }

    /// Target address in `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(0))
    }
}

/// Limits applied by the redaction pipeline.
///
/// The chunk size and findings ceiling track the classifier service's
/// per-request match limit; see the redact module for how they combine.
#[derive(Debug, Clone, Deserialize)]
pub struct RedactionLimits {
    /// Buffers at or below this size are never redacted
    #[serde(default = "defaults::min_redact_len")]
    pub min_redact_len: usize,
    /// Maximum bytes submitted per classify request
    #[serde(default = "defaults::max_chunk_size")]
    pub max_chunk_size: usize,
    /// Classifier per-request findings ceiling
    #[serde(default = "defaults::max_findings")]
    pub max_findings: usize,
    /// Maximum number of info types per request
    #[serde(default = "defaults::max_info_types")]
    pub max_info_types: usize,
    /// Per-chunk classify timeout in seconds
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Character used to mask matched values
    #[serde(default = "defaults::masking_character")]
    pub masking_character: String,
    /// Number of characters to mask per match (0 = all)
    #[serde(default = "defaults::number_to_mask")]
    pub number_to_mask: i32,
    /// Data-row buffering flush threshold in bytes
    #[serde(default = "defaults::max_buffered_bytes")]
    pub max_buffered_bytes: usize,
}

impl Default for RedactionLimits {
    fn default() -> Self {
        Self {
            min_redact_len: defaults::min_redact_len(),
            max_chunk_size: defaults::max_chunk_size(),
            max_findings: defaults::max_findings(),
            max_info_types: defaults::max_info_types(),
            request_timeout_secs: defaults::request_timeout_secs(),
            masking_character: defaults::masking_character(),
            number_to_mask: defaults::number_to_mask(),
            max_buffered_bytes: defaults::max_buffered_bytes(),
        }
    }
}

/// Process-wide agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Dial/liveness timeout toward real servers in seconds
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Time box for the cancel registry's flush dial in seconds
    #[serde(default = "defaults::cancel_flush_timeout_secs")]
    pub cancel_flush_timeout_secs: u64,
    /// Redaction pipeline limits
    #[serde(default)]
    pub redaction: RedactionLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: defaults::connect_timeout_secs(),
            cancel_flush_timeout_secs: defaults::cancel_flush_timeout_secs(),
            redaction: RedactionLimits::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }
}

mod defaults {
    pub fn min_redact_len() -> usize {
        30
    }
    // The chunk size stays low to avoid the classifier's per-request
    // findings limit.
    pub fn max_chunk_size() -> usize {
        62_500
    }
    pub fn max_findings() -> usize {
        2_900
    }
    pub fn max_info_types() -> usize {
        30
    }
    pub fn request_timeout_secs() -> u64 {
        5
    }
    pub fn masking_character() -> String {
        "*".to_string()
    }
    pub fn number_to_mask() -> i32 {
        5
    }
    pub fn max_buffered_bytes() -> usize {
        100_000
    }
    pub fn connect_timeout_secs() -> u64 {
        5
    }
    pub fn cancel_flush_timeout_secs() -> u64 {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_type_parse() {
        assert_eq!(
            ConnectionType::parse("postgres").unwrap(),
            ConnectionType::Postgres
        );
        assert_eq!(ConnectionType::parse("tcp").unwrap(), ConnectionType::Tcp);
        assert!(ConnectionType::parse("oracle").is_err());
    }

    #[test]
    fn test_connection_params_decode() {
        let blob = br#"{
            "host": "db.internal",
            "user": "app_rw",
            "password": "s3cret",
            "database": "orders",
            "ssl_mode": "require",
            "info_types": ["EMAIL_ADDRESS"]
        }"#;
        let params = ConnectionParams::decode(blob).unwrap();
        assert_eq!(params.host, "db.internal");
        assert_eq!(params.user, "app_rw");
        assert_eq!(params.ssl_mode, SslMode::Require);
        assert_eq!(params.info_types, vec!["EMAIL_ADDRESS"]);
        assert_eq!(params.port, None);
    }

    #[test]
    fn test_postgres_defaults_applied() {
        let blob = br#"{"host": "db", "user": "u", "password": "p"}"#;
        let params = ConnectionParams::decode(blob)
            .unwrap()
            .resolve(ConnectionType::Postgres)
            .unwrap();
        assert_eq!(params.port, Some(5432));
        assert_eq!(params.address(), "db:5432");
        assert_eq!(params.ssl_mode, SslMode::Prefer);
    }

    #[test]
    fn test_postgres_missing_secrets() {
        let blob = br#"{"host": "db", "user": "u", "password": ""}"#;
        let err = ConnectionParams::decode(blob)
            .unwrap()
            .resolve(ConnectionType::Postgres)
            .unwrap_err();
        assert!(err.to_string().contains("missing required secrets"));
    }

    #[test]
    fn test_tcp_requires_port() {
        let blob = br#"{"host": "svc"}"#;
        assert!(ConnectionParams::decode(blob)
            .unwrap()
            .resolve(ConnectionType::Tcp)
            .is_err());

        let blob = br#"{"host": "svc", "port": 6379}"#;
        let params = ConnectionParams::decode(blob)
            .unwrap()
            .resolve(ConnectionType::Tcp)
            .unwrap();
        assert_eq!(params.address(), "svc:6379");
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::from_yaml("{}").unwrap();
        assert_eq!(config.connect_timeout_secs, 5);
        assert_eq!(config.cancel_flush_timeout_secs, 3);
        assert_eq!(config.redaction.max_chunk_size, 62_500);
        assert_eq!(config.redaction.max_findings, 2_900);
        assert_eq!(config.redaction.min_redact_len, 30);
    }

    #[test]
    fn test_agent_config_overrides() {
        let yaml = r#"
connect_timeout_secs: 10
redaction:
  max_chunk_size: 1000
  request_timeout_secs: 2
"#;
        let config = AgentConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.redaction.max_chunk_size, 1000);
        assert_eq!(config.redaction.request_timeout_secs, 2);
        // untouched fields keep defaults
        assert_eq!(config.redaction.max_findings, 2_900);
    }
}
