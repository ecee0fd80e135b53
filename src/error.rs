//! Error types
//!
//! Protocol handlers fail with a typed [`ProtocolError`] carrying the RTSP
//! status to put on the wire; the session loop turns it into a reply and,
//! when fatal, a connection shutdown. Everything else funnels into [`Error`].

use std::fmt;

use crate::media::registry::RegistryError;

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// RTSP reply status line, code plus canonical reason phrase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Unauthorized,
    Forbidden,
    StreamNotFound,
    NotAcceptable,
    SessionNotFound,
    UnsupportedTransport,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Unauthorized => 401,
            Status::Forbidden => 403,
            Status::StreamNotFound => 404,
            Status::NotAcceptable => 406,
            Status::SessionNotFound => 454,
            Status::UnsupportedTransport => 461,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Unauthorized => "Unauthorized",
            Status::Forbidden => "Forbidden",
            Status::StreamNotFound => "Stream Not Found",
            Status::NotAcceptable => "Not Acceptable",
            Status::SessionNotFound => "Session Not Found",
            Status::UnsupportedTransport => "Unsupported Transport",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// A protocol failure with a wire status
///
/// `fatal` decides whether the session is torn down after the reply is
/// queued. Authentication challenges are replies, not errors, so 401 shows
/// up here only when the handshake is beyond saving.
#[derive(Debug, thiserror::Error)]
#[error("{status}: {detail}")]
pub struct ProtocolError {
    pub status: Status,
    pub detail: String,
    pub fatal: bool,
}

impl ProtocolError {
    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self { status: Status::Forbidden, detail: detail.into(), fatal: true }
    }

    pub fn stream_not_found(detail: impl Into<String>) -> Self {
        Self { status: Status::StreamNotFound, detail: detail.into(), fatal: true }
    }

    pub fn not_acceptable(detail: impl Into<String>) -> Self {
        Self { status: Status::NotAcceptable, detail: detail.into(), fatal: true }
    }

    pub fn session_not_found(detail: impl Into<String>) -> Self {
        Self { status: Status::SessionNotFound, detail: detail.into(), fatal: true }
    }

    pub fn unsupported_transport(detail: impl Into<String>) -> Self {
        // 461 leaves the connection usable per RFC 2326; the client may retry
        // with another transport
        Self { status: Status::UnsupportedTransport, detail: detail.into(), fatal: false }
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self { status: Status::Unauthorized, detail: detail.into(), fatal: true }
    }
}

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("malformed input: {0}")]
    Parse(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("peer shutdown: {0}")]
    PeerShutdown(String),

    #[error("shutdown: {0}")]
    Shutdown(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// True when the peer closed the connection on its own terms, as opposed
    /// to the server kicking it out. Decides the continue-push grace window.
    pub fn is_peer_shutdown(&self) -> bool {
        matches!(self, Error::PeerShutdown(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines() {
        assert_eq!(Status::Ok.to_string(), "200 OK");
        assert_eq!(Status::StreamNotFound.to_string(), "404 Stream Not Found");
        assert_eq!(Status::UnsupportedTransport.to_string(), "461 Unsupported Transport");
    }

    #[test]
    fn protocol_error_fatality() {
        assert!(ProtocolError::forbidden("x").fatal);
        assert!(!ProtocolError::unsupported_transport("x").fatal);
    }
}
