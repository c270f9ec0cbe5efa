//! Error types for the server and client.
//!
//! Maps I/O, codec and protocol errors to the NT status codes returned
//! in SMB2 response headers.

use crate::codec::CodecError;
use crate::smb2::status::NtStatus;
use std::fmt;

/// Top-level error type.
#[derive(Debug)]
pub enum ServerError {
    /// Malformed or out-of-bounds wire data.
    Decode(CodecError),
    /// Wrong command for the current state, no common dialect, or a
    /// malformed negotiation blob.
    ProtocolViolation(String),
    /// Proof mismatch, unknown user, or a disallowed NTLM mode.
    AuthenticationFailure(String),
    /// A resource-level failure with a specific NT status code
    /// (closed handle, missing path, ...).
    Resource(NtStatus),
    /// Unhandled info class, PDU type or operation number.
    UnsupportedOperation(String),
    /// A message carried a session id other than the connection's.
    SessionExpired { expected: u64, received: u64 },
    /// An I/O error from the transport or the storage provider.
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Decode error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Self::AuthenticationFailure(msg) => write!(f, "Auth failed: {}", msg),
            Self::Resource(s) => write!(f, "Resource error: {:?}", s),
            Self::UnsupportedOperation(msg) => write!(f, "Unsupported: {}", msg),
            Self::SessionExpired { expected, received } => write!(
                f,
                "Session id {:#018x} does not match {:#018x}",
                received, expected
            ),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<CodecError> for ServerError {
    fn from(e: CodecError) -> Self {
        ServerError::Decode(e)
    }
}

impl From<NtStatus> for ServerError {
    fn from(s: NtStatus) -> Self {
        ServerError::Resource(s)
    }
}

impl ServerError {
    /// Errors after which the connection is dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionExpired { .. } | Self::AuthenticationFailure(_))
    }
}

/// Map an `std::io::Error` to the most appropriate NT status code.
pub fn io_to_ntstatus(e: &std::io::Error) -> NtStatus {
    match e.kind() {
        std::io::ErrorKind::NotFound => NtStatus::ObjectNameNotFound,
        std::io::ErrorKind::PermissionDenied => NtStatus::AccessDenied,
        std::io::ErrorKind::AlreadyExists => NtStatus::ObjectNameCollision,
        std::io::ErrorKind::InvalidInput => NtStatus::InvalidParameter,
        std::io::ErrorKind::UnexpectedEof => NtStatus::EndOfFile,
        std::io::ErrorKind::DirectoryNotEmpty => NtStatus::DirectoryNotEmpty,
        _ => NtStatus::Unsuccessful,
    }
}

/// Map a `ServerError` to an NT status code for the SMB2 response.
pub fn error_to_ntstatus(e: &ServerError) -> NtStatus {
    match e {
        ServerError::Decode(CodecError::Unsupported(_)) => NtStatus::NotImplemented,
        ServerError::Decode(_) => NtStatus::InvalidParameter,
        ServerError::ProtocolViolation(_) => NtStatus::NotSupported,
        ServerError::AuthenticationFailure(_) => NtStatus::LogonFailure,
        ServerError::Resource(s) => *s,
        ServerError::UnsupportedOperation(_) => NtStatus::NotSupported,
        ServerError::SessionExpired { .. } => NtStatus::NetworkSessionExpired,
        ServerError::Io(io_err) => io_to_ntstatus(io_err),
    }
}
