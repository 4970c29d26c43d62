//! PostgreSQL protocol message structures
//!
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use super::constants::*;

// ============================================================================
// Startup Messages (no type byte)
// ============================================================================

/// PostgreSQL startup message sent by the client to initiate a connection.
///
/// Format: Length (4) + Protocol Version (4) + Parameters + \0
///
/// Parameters keep their wire order so a decoded message re-encodes to the
/// exact bytes it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    /// Protocol version (196608 for v3.0)
    pub protocol_version: u32,
    /// Connection parameters (user, database, options, ...) in wire order
    pub parameters: Vec<(String, String)>,
}

impl StartupMessage {
    /// Create a new startup message with the given user.
    pub fn new(user: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_3_0,
            parameters: vec![("user".to_string(), user.to_string())],
        }
    }

    /// Create a startup message with user and database.
    pub fn with_database(user: &str, database: &str) -> Self {
        let mut msg = Self::new(user);
        msg.parameters
            .push(("database".to_string(), database.to_string()));
        msg
    }

    /// Look up a parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Get the username from parameters.
    pub fn user(&self) -> Option<&str> {
        self.parameter("user")
    }

    /// Get the database name from parameters.
    pub fn database(&self) -> Option<&str> {
        self.parameter("database")
    }

    /// Substitute the `user` parameter in place, preserving the position of
    /// every other parameter. The packet length is recomputed on encode.
    pub fn set_user(&mut self, user: &str) {
        match self.parameters.iter_mut().find(|(k, _)| k == "user") {
            Some((_, v)) => *v = user.to_string(),
            None => self
                .parameters
                .insert(0, ("user".to_string(), user.to_string())),
        }
    }
}

/// Cancel request, sent on a fresh connection instead of a startup message.
///
/// Format: Length (4, always 16) + Cancel Code (4) + Process ID (4) + Secret Key (4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    /// Backend process ID
    pub process_id: u32,
    /// Secret key for this backend
    pub secret_key: u32,
}

// ============================================================================
// Authentication Messages
// ============================================================================

/// Authentication request from the server (type byte 'R').
#[derive(Debug, Clone)]
pub enum AuthenticationMessage {
    /// Authentication successful (subtype 0)
    Ok,
    /// Cleartext password required (subtype 3)
    CleartextPassword,
    /// MD5 password required (subtype 5), with 4-byte salt
    Md5Password { salt: [u8; 4] },
    /// SASL authentication required (subtype 10), listing mechanisms
    Sasl { mechanisms: Vec<String> },
    /// SASL continuation (subtype 11), server challenge data
    SaslContinue { data: Vec<u8> },
    /// SASL final (subtype 12), server signature data
    SaslFinal { data: Vec<u8> },
    /// Any other subtype this proxy does not negotiate
    Unsupported(u32),
}

impl AuthenticationMessage {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

// ============================================================================
// Server Information Messages
// ============================================================================

/// Backend key data (type 'K'): pid and secret key for cancel requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    pub process_id: u32,
    pub secret_key: u32,
}

/// A decoded data row (type 'D'). `None` is the NULL sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub values: Vec<Option<Vec<u8>>>,
}

impl DataRow {
    pub fn column_count(&self) -> usize {
        self.values.len()
    }
}

// ============================================================================
// Error/Notice Messages
// ============================================================================

/// Error or notice response (types 'E' and 'N').
///
/// Fields keep their wire order so decode/encode round-trips byte-exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorResponse {
    /// (field type byte, value) pairs in wire order
    pub fields: Vec<(u8, String)>,
}

impl ErrorResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an error response with severity, SQLSTATE code and message.
    pub fn error(severity: &str, code: &str, message: &str) -> Self {
        Self {
            fields: vec![
                (ERROR_FIELD_SEVERITY, severity.to_string()),
                (ERROR_FIELD_CODE, code.to_string()),
                (ERROR_FIELD_MESSAGE, message.to_string()),
            ],
        }
    }

    /// Create a FATAL error response.
    pub fn fatal(code: &str, message: &str) -> Self {
        Self::error("FATAL", code, message)
    }

    fn field(&self, field_type: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == field_type)
            .map(|(_, v)| v.as_str())
    }

    pub fn severity(&self) -> Option<&str> {
        self.field(ERROR_FIELD_SEVERITY)
    }

    pub fn code(&self) -> Option<&str> {
        self.field(ERROR_FIELD_CODE)
    }

    pub fn message(&self) -> Option<&str> {
        self.field(ERROR_FIELD_MESSAGE)
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Some("FATAL")
    }

    pub fn push_field(&mut self, field_type: u8, value: &str) {
        self.fields.push((field_type, value.to_string()));
    }

    /// Authentication failed error, as the real server would word it.
    pub fn authentication_failed(user: &str) -> Self {
        Self::fatal(
            SQLSTATE_INVALID_PASSWORD,
            &format!("password authentication failed for user \"{user}\""),
        )
    }

    /// Connection failure error.
    pub fn connection_failed(host: &str, port: u16) -> Self {
        Self::fatal(
            SQLSTATE_CONNECTION_FAILURE,
            &format!("could not connect to server at \"{host}\" port {port}"),
        )
    }

    /// Internal proxy error.
    pub fn internal_error(message: &str) -> Self {
        Self::fatal(SQLSTATE_INTERNAL_ERROR, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_message_new() {
        let msg = StartupMessage::new("appuser");
        assert_eq!(msg.user(), Some("appuser"));
        assert_eq!(msg.database(), None);
        assert_eq!(msg.protocol_version, 196608);
    }

    #[test]
    fn test_startup_message_set_user_preserves_order() {
        let mut msg = StartupMessage {
            protocol_version: PROTOCOL_VERSION_3_0,
            parameters: vec![
                ("client_encoding".into(), "UTF8".into()),
                ("user".into(), "appuser".into()),
                ("database".into(), "orders".into()),
            ],
        };
        msg.set_user("real_user");
        assert_eq!(msg.user(), Some("real_user"));
        assert_eq!(msg.parameters[0].0, "client_encoding");
        assert_eq!(msg.parameters[1], ("user".into(), "real_user".into()));
        assert_eq!(msg.parameters[2].0, "database");
    }

    #[test]
    fn test_startup_message_set_user_when_missing() {
        let mut msg = StartupMessage {
            protocol_version: PROTOCOL_VERSION_3_0,
            parameters: vec![("database".into(), "orders".into())],
        };
        msg.set_user("real_user");
        assert_eq!(msg.user(), Some("real_user"));
    }

    #[test]
    fn test_error_response_fields() {
        let err = ErrorResponse::error("ERROR", "42000", "syntax error");
        assert_eq!(err.severity(), Some("ERROR"));
        assert_eq!(err.code(), Some("42000"));
        assert_eq!(err.message(), Some("syntax error"));
        assert!(!err.is_fatal());

        let fatal = ErrorResponse::fatal("28P01", "authentication failed");
        assert!(fatal.is_fatal());
    }

    #[test]
    fn test_error_response_canned() {
        let auth = ErrorResponse::authentication_failed("bob");
        assert!(auth.message().unwrap().contains("bob"));
        assert_eq!(auth.code(), Some(SQLSTATE_INVALID_PASSWORD));

        let conn = ErrorResponse::connection_failed("db.internal", 5432);
        assert!(conn.message().unwrap().contains("db.internal"));
    }

    #[test]
    fn test_data_row_null_columns() {
        let row = DataRow {
            values: vec![Some(b"a".to_vec()), None, Some(vec![])],
        };
        assert_eq!(row.column_count(), 3);
        assert!(row.values[1].is_none());
        assert_eq!(row.values[2].as_deref(), Some(&[] as &[u8]));
    }
}
