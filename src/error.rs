//! Core error types and result handling.
//!
//! One error enum covers the whole gateway: transport failures, peer
//! exception responses, timeouts, value/range problems, address syntax,
//! configuration mistakes and malformed frames. Drivers surface these to
//! callers unchanged; the supervisor and the background loops intercept
//! them to drive state machines and keep running.

use thiserror::Error;

/// Result type used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Transport could not be established or was lost.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Transport alive but the peer returned an exception or negative
    /// response. `code` carries the protocol-native code (S7 CPU return
    /// code, Modbus exception code, CIP general status).
    #[error("Communication error in {operation}: code 0x{code:02X}")]
    Communication { operation: String, code: u16 },

    /// Operation exceeded the configured timeout.
    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Value fails range/type/width validation, decode underflow, or a
    /// lossy coercion was detected.
    #[error("Data error: {message}")]
    Data { message: String },

    /// Unparsable or semantically invalid address (e.g. writing to a
    /// read-only area).
    #[error("Invalid address '{address}': {reason}")]
    Address { address: String, reason: String },

    /// Mapping references an unknown node, or an invalid field value.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Malformed frame on the wire or a state-machine violation.
    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl GatewayError {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(message: S) -> Self {
        GatewayError::Connection {
            message: message.into(),
        }
    }

    /// Create a communication error for a failed operation.
    pub fn communication<S: Into<String>>(operation: S, code: u16) -> Self {
        GatewayError::Communication {
            operation: operation.into(),
            code,
        }
    }

    /// Create a timeout error.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        GatewayError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a data error.
    pub fn data<S: Into<String>>(message: S) -> Self {
        GatewayError::Data {
            message: message.into(),
        }
    }

    /// Create an address error.
    pub fn address<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        GatewayError::Address {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        GatewayError::Configuration {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        GatewayError::Protocol {
            message: message.into(),
        }
    }

    /// Whether this error indicates a lost or unusable transport.
    ///
    /// The supervisor uses this to decide between an Error transition and
    /// plain statistics recording.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::Connection { .. } | GatewayError::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Connection {
            message: err.to_string(),
        }
    }
}
