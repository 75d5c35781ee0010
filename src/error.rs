//! Unified error handling for the zaguan driver.
//!
//! Callers get typed failures that distinguish "could not get a connection"
//! (capacity), "could not reach any server" (topology) and "a specific
//! round-trip failed" (transport), since each needs a different response.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::EndPoint;

/// Main error type for driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Invalid pool bounds or malformed endpoint text.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TCP connect-level failure against a specific endpoint.
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: EndPoint,
        #[source]
        source: io::Error,
    },

    /// Discovery exhausted every candidate without a confirmed primary.
    #[error("No writable primary found among the known servers")]
    NoPrimaryFound,

    /// The pool stayed at capacity for the whole acquire window.
    #[error("Timed out after {timeout:?} waiting for a pooled connection")]
    PoolTimeout { timeout: Duration },

    /// Framing or payload violated the wire protocol; the connection is
    /// desynchronized and must be discarded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O failure during an in-flight exchange.
    #[error("Communication failure on {endpoint}: {source}")]
    Transport {
        endpoint: EndPoint,
        #[source]
        source: io::Error,
    },

    /// An exchange was attempted on a connection that was already shut down.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The server rejected the authentication handshake.
    #[error("Authentication failed for database '{database}': {message}")]
    Authentication { database: String, message: String },

    /// A cursor option setter was called after the first batch was fetched.
    #[error("Cannot modify a cursor that has already returned documents")]
    CursorNotModifiable,

    /// A reply arrived but did not carry the expected document.
    #[error("Unexpected reply: {message}")]
    UnexpectedReply { message: String },
}

/// Wire-level protocol violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The inbound header did not announce a reply.
    #[error("Expected an OP_REPLY header but received op code {0}")]
    UnexpectedOpCode(i32),

    /// The frame ended before its declared contents.
    #[error("Reply frame truncated: {0}")]
    Truncated(String),

    /// A document failed to serialize for the wire.
    #[error("Failed to encode document: {0}")]
    Encode(#[from] bson::ser::Error),

    /// A document payload failed to deserialize.
    #[error("Failed to decode document: {0}")]
    Decode(#[from] bson::de::Error),

    /// The server flagged the query as failed.
    #[error("Server reported query failure: {0}")]
    QueryFailure(String),

    /// A get-more referenced a cursor the server no longer knows.
    #[error("Server no longer knows cursor {0}")]
    CursorNotFound(i64),
}

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

impl DriverError {
    /// Create a transport error for the given endpoint.
    pub fn transport(endpoint: EndPoint, source: io::Error) -> Self {
        DriverError::Transport { endpoint, source }
    }

    /// Create an unexpected-reply error.
    pub fn unexpected_reply<S: Into<String>>(message: S) -> Self {
        DriverError::UnexpectedReply {
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying after backoff.
    ///
    /// Configuration, protocol and cursor-misuse errors never clear up on
    /// their own; connect, capacity and transport errors can.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DriverError::Connect { .. }
                | DriverError::NoPrimaryFound
                | DriverError::PoolTimeout { .. }
                | DriverError::Transport { .. }
        )
    }
}
