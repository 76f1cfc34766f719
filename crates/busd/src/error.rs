//! Error types shared across the daemon core.

use std::io;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the daemon core to its callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A rule string failed to parse (unknown key, missing quotes, ...).
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// The rule referenced an `arg*` predicate, which this core does not evaluate.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A requested interface has not come up; the request stays queued.
    #[error("interface not available: {0}")]
    BadInterface(String),

    /// A socket operation failed. Logged per attempt, never fatal on its own.
    #[error("socket error: {0}")]
    SocketError(String),

    /// An incoming datagram failed to decode and was dropped.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A required file does not exist.
    #[error("no such file: {0}")]
    NoSuchFile(String),

    /// A file existed but its contents were malformed.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The bundled router's configuration XML (or its JSON equivalent here) was malformed.
    #[error("bad bus configuration: {0}")]
    BusBadXml(String),

    /// Requested a language/encoding variant this build doesn't carry.
    #[error("language not supported: {0}")]
    LanguageNotSupported(String),

    /// A single-transport API call received a mask with `popcount != 1`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// An `InterfaceAlreadyExists`-equivalent condition: benign at `AddInterface`,
    /// callers that set up standard interfaces should map this to `Ok(())`.
    pub fn is_interface_already_exists(&self) -> bool {
        matches!(self, Error::BadInterface(msg) if msg.contains("already exists"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NoSuchFile(_) | Error::BadInterface(_))
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::ProtocolError(_))
    }

    pub fn is_parse_error(&self) -> bool {
        matches!(self, Error::ParseError(_) | Error::InvalidRule(_))
    }
}

impl From<crate::netlink::Error> for Error {
    fn from(e: crate::netlink::Error) -> Self {
        Error::SocketError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_found() {
        assert!(Error::NoSuchFile("x".into()).is_not_found());
        assert!(!Error::ParseError("x".into()).is_not_found());
    }

    #[test]
    fn classifies_already_exists() {
        let err = Error::BadInterface("eth0 already exists".into());
        assert!(err.is_interface_already_exists());
    }

    #[test]
    fn messages_are_human_readable() {
        let err = Error::InvalidRule("missing quotes".into());
        assert_eq!(err.to_string(), "invalid rule: missing quotes");
    }
}
