//! Crate-level error taxonomy.
//!
//! Each module keeps its own fine-grained error enum; this module folds them
//! into the one [`Error`] callers of the connection-level API see.

use thiserror::Error;

use crate::address::AddressError;
use crate::auth::AuthError;
use crate::demarshal::DemarshalError;
use crate::message::ProtocolError;
use crate::types::TypeMismatch;

/// Well-known D-Bus error names used by the dispatcher and the bus client.
pub mod name {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed address string; no recovery.
    #[error("bad address: {0}")]
    Address(#[from] AddressError),

    /// I/O or OS error opening or using a transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer rejected authentication or deviated from the line protocol.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Malformed incoming message.  Fatal for the connection that saw it.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A value disagrees with its declared type.  Surfaced synchronously,
    /// never fatal.
    #[error("type mismatch: {0}")]
    TypeMismatch(#[from] TypeMismatch),

    /// The connection was closed before or during the operation.
    #[error("connection closed")]
    ConnectionClosed,

    /// A method call failed; carries the well-known D-Bus error name and the
    /// peer's human-readable message.
    #[error("{name}: {message}")]
    MethodCall { name: String, message: String },

    /// A caller-imposed timeout elapsed.
    #[error("timed out")]
    TimedOut,
}

impl From<DemarshalError> for Error {
    fn from(e: DemarshalError) -> Self {
        Error::Protocol(ProtocolError::from(e))
    }
}
