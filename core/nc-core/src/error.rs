//! The internal error taxonomy (spec.md §7) and its narrowing into the
//! public `Status` enum, grounded on the teacher's
//! `connection::Error` → `std::io::ErrorKind` conversion pattern.

use crate::status::Status;
use alloc::string::String;

/// Design-level error kinds. Every fallible internal operation in
/// `nc-transport`/`nc-crypto` returns one of these; the facade narrows them
/// to `Status` at the public API boundary.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("API call made out of order for the current connection state")]
    OutOfOrderApiCall,

    #[error("I/O error on an endpoint channel")]
    Io,

    #[error("a frame failed to decode: {0}")]
    InvalidWireFormat(String),

    #[error("the secure handshake failed: {0}")]
    Handshake(HandshakeFailure),

    #[error("operation timed out")]
    Timeout,

    #[error("operation was canceled")]
    Canceled,

    #[error("no medium in the allowed set could establish a channel")]
    MediumUnavailable,

    #[error("an internal invariant was violated: {0}")]
    Fatal(String),
}

/// Sub-kinds of handshake failure (spec.md §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeFailure {
    #[error("handshake timed out")]
    Timeout,
    #[error("peer advertised an incompatible UKEY2/protocol version")]
    VersionMismatch,
    #[error("a handshake message was malformed")]
    BadFrame,
    #[error("no mutually supported cipher was offered")]
    CipherMismatch,
    #[error("key agreement failed")]
    KeyAgreement,
    #[error("a signcrypted message failed replay validation")]
    Replay,
}

impl From<HandshakeFailure> for ErrorKind {
    fn from(value: HandshakeFailure) -> Self {
        ErrorKind::Handshake(value)
    }
}

impl ErrorKind {
    /// Narrows an internal error into the public `Status` surfaced to
    /// listener callbacks and API return values.
    pub fn to_status(&self) -> Status {
        match self {
            ErrorKind::InvalidArgument(_) => Status::Error,
            ErrorKind::OutOfOrderApiCall => Status::OutOfOrderApiCall,
            ErrorKind::Io => Status::EndpointIoError,
            ErrorKind::InvalidWireFormat(_) => Status::EndpointIoError,
            ErrorKind::Handshake(_) => Status::ConnectionRejected,
            ErrorKind::Timeout => Status::EndpointIoError,
            ErrorKind::Canceled => Status::Error,
            ErrorKind::MediumUnavailable => Status::Error,
            ErrorKind::Fatal(_) => Status::Error,
        }
    }
}
