use crate::frame::ProtocolError;
use crate::transport::TransportError;

/// Top-level error for client operations.
///
/// Protocol and transport failures keep their own types so callers can tell
/// "the device rejected this" apart from "the link is broken"; the parameter
/// variants cover lookups against the catalogue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The key is not present in the parameter catalogue.
    #[error("unknown parameter key: {0}")]
    UnknownParameter(String),
    /// The key exists but the requested operation is not allowed on it.
    #[error("parameter {key} cannot be written: {reason}")]
    AccessViolation { key: String, reason: String },
    /// The supplied value does not fit the parameter's kind.
    #[error("invalid value for parameter {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}
