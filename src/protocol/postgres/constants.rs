//! PostgreSQL protocol constants
//!
//! Wire protocol version 3.0.
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

/// PostgreSQL protocol version 3.0, encoded as (major << 16) | minor
pub const PROTOCOL_VERSION_3_0: u32 = 196608;

// ============================================================================
// Special Request Codes (startup-phase packets without a type byte)
// ============================================================================

/// SSL request code (0x04D2162F) - sent instead of a startup message
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// GSSAPI encryption request code (0x04D21630)
pub const GSSENC_REQUEST_CODE: u32 = 80877104;

/// Cancel request code (0x04D2162E) - followed by pid and secret key
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Single-byte server answer meaning "TLS not supported here"
pub const SSL_NOT_SUPPORTED: u8 = b'N';

/// Single-byte server answer accepting a TLS upgrade
pub const SSL_SUPPORTED: u8 = b'S';

// ============================================================================
// Frontend Message Types (client -> server)
// ============================================================================

/// Password message ('p') - password or SASL response
pub const MSG_PASSWORD: u8 = b'p';

/// Simple query ('Q')
pub const MSG_QUERY: u8 = b'Q';

/// Terminate ('X')
pub const MSG_TERMINATE: u8 = b'X';

// ============================================================================
// Backend Message Types (server -> client)
// ============================================================================

/// Authentication request ('R')
pub const MSG_AUTH_REQUEST: u8 = b'R';

/// Backend key data ('K') - pid and secret key for cancel requests
pub const MSG_BACKEND_KEY_DATA: u8 = b'K';

/// Parameter status ('S')
pub const MSG_PARAMETER_STATUS: u8 = b'S';

/// Ready for query ('Z') - end of a command cycle
pub const MSG_READY_FOR_QUERY: u8 = b'Z';

/// Row description ('T')
pub const MSG_ROW_DESCRIPTION: u8 = b'T';

/// Data row ('D')
pub const MSG_DATA_ROW: u8 = b'D';

/// Command complete ('C')
pub const MSG_COMMAND_COMPLETE: u8 = b'C';

/// Error response ('E')
pub const MSG_ERROR_RESPONSE: u8 = b'E';

/// Notice response ('N')
pub const MSG_NOTICE_RESPONSE: u8 = b'N';

// ============================================================================
// Authentication Types (subtypes of 'R')
// ============================================================================

/// Authentication successful
pub const AUTH_OK: u32 = 0;

/// Cleartext password required
pub const AUTH_CLEARTEXT_PASSWORD: u32 = 3;

/// MD5 password required (includes 4-byte salt)
pub const AUTH_MD5_PASSWORD: u32 = 5;

/// SASL authentication required (lists mechanisms)
pub const AUTH_SASL: u32 = 10;

/// SASL continuation (server challenge)
pub const AUTH_SASL_CONTINUE: u32 = 11;

/// SASL final (server signature)
pub const AUTH_SASL_FINAL: u32 = 12;

/// SCRAM-SHA-256 mechanism name
pub const SASL_MECHANISM_SCRAM_SHA_256: &str = "SCRAM-SHA-256";

// ============================================================================
// Error/Notice Field Types
// ============================================================================

/// Severity field - ERROR, FATAL, PANIC, WARNING, NOTICE
pub const ERROR_FIELD_SEVERITY: u8 = b'S';

/// SQLSTATE code field
pub const ERROR_FIELD_CODE: u8 = b'C';

/// Primary human-readable message field
pub const ERROR_FIELD_MESSAGE: u8 = b'M';

// ============================================================================
// SQLSTATE codes for proxy-generated errors
// ============================================================================

/// Invalid password
pub const SQLSTATE_INVALID_PASSWORD: &str = "28P01";

/// Invalid authorization specification
pub const SQLSTATE_INVALID_AUTHORIZATION: &str = "28000";

/// Connection failure
pub const SQLSTATE_CONNECTION_FAILURE: &str = "08006";

/// Protocol violation
pub const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";

/// Internal error
pub const SQLSTATE_INTERNAL_ERROR: &str = "XX000";

/// NULL column sentinel in a data row (-1 as i32)
pub const DATA_ROW_NULL: i32 = -1;
