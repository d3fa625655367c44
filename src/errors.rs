//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling. Every fallible function in this crate returns `MailwatchResult`.

use thiserror::Error;

/// Application error type
///
/// Covers every error kind the supervisor, pool, IDLE driver and dispatcher
/// may encounter. `Protocol`'s `abort_eof` flag distinguishes a clean EOF
/// disconnect (transient, triggers reconnect) from any other protocol abort
/// (fatal).
#[derive(Debug, Error)]
pub enum MailwatchError {
    /// Malformed config file, unknown store/channel/group reference, or a
    /// mailbox present on one side of a channel but not the other.
    #[error("configuration error: {0}")]
    Config(String),
    /// `passcmd` failed, produced no output, or produced non-decodable output.
    #[error("credential error: {0}")]
    Credential(String),
    /// Malformed IMAP line, unexpected tagged status, or an unsupported
    /// capability (`IDLE`, `STARTTLS`).
    #[error("protocol error: {message}")]
    Protocol { message: String, abort_eof: bool },
    /// Socket error, TLS error, or a socket timeout outside of IDLE's
    /// designed refresh window.
    #[error("network error: {0}")]
    Network(String),
    /// Non-zero exit from the external synchronizer.
    #[error("sync command failed: {0}")]
    Sync(String),
    /// Anything else: surfaced from a watcher thread as an `ErrorTask`.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MailwatchError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            abort_eof: false,
        }
    }

    pub fn protocol_eof(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            abort_eof: true,
        }
    }

    /// True for error kinds the retry policy treats as transient: a network
    /// error, or a protocol abort that looks like an EOF disconnect.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
            || matches!(self, Self::Protocol { abort_eof: true, .. })
    }
}

impl From<std::io::Error> for MailwatchError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Network(format!("socket timeout: {e}"))
            }
            std::io::ErrorKind::UnexpectedEof => {
                Self::protocol_eof(format!("unexpected EOF: {e}"))
            }
            _ => Self::Network(e.to_string()),
        }
    }
}

impl From<native_tls::Error> for MailwatchError {
    fn from(e: native_tls::Error) -> Self {
        Self::Network(format!("TLS error: {e}"))
    }
}

impl From<native_tls::HandshakeError<std::net::TcpStream>> for MailwatchError {
    fn from(e: native_tls::HandshakeError<std::net::TcpStream>) -> Self {
        Self::Network(format!("TLS handshake failed: {e}"))
    }
}

/// Type alias for fallible return values
pub type MailwatchResult<T> = Result<T, MailwatchError>;
