//! Error types for the SMTP dialer and sender.
//!
//! Every fatal condition is a distinct variant so callers can branch on the
//! failure kind instead of matching error strings. Transient network
//! conditions are classified by [`SmtpError::is_transient`], which drives the
//! MAIL-step reconnect logic in the sending session.

use std::io;

use thiserror::Error;

use crate::config::StartTlsPolicy;

/// Result type for SMTP operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// SMTP error.
#[derive(Error, Debug)]
pub enum SmtpError {
    /// Establishing the TCP connection failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Target address in `host:port` form.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// A read, write, or connect operation exceeded the configured timeout.
    #[error("{what} timed out")]
    Timeout {
        /// The operation that timed out.
        what: &'static str,
    },

    /// The server closed the connection mid-exchange.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// An I/O error outside the classified cases above.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// TLS setup or handshake failed.
    #[error("TLS error for {host}: {reason}")]
    Tls {
        /// Host the handshake was attempted against.
        host: String,
        /// Human-readable failure description.
        reason: String,
    },

    /// The STARTTLS policy demands encryption but the server does not
    /// advertise STARTTLS.
    #[error("STARTTLS policy is {policy} but the server does not support STARTTLS")]
    StartTlsUnsupported {
        /// The policy that was in force when the dial was aborted.
        policy: StartTlsPolicy,
    },

    /// The selected mechanism refuses to send credentials over an
    /// unencrypted connection.
    #[error("authentication refused on unencrypted connection")]
    UnencryptedConnection,

    /// The server identity does not match the host the authenticator was
    /// configured for.
    #[error("server name {advertised:?} does not match configured host {configured:?}")]
    HostMismatch {
        /// Host the authenticator was built for.
        configured: String,
        /// Identity presented by the server.
        advertised: String,
    },

    /// The server sent a challenge the mechanism does not understand.
    #[error("unexpected server challenge: {challenge}")]
    UnexpectedChallenge {
        /// The decoded challenge text.
        challenge: String,
    },

    /// A header field did not parse as an address.
    #[error("invalid address in {field:?}: {reason}")]
    InvalidAddress {
        /// Name of the offending header field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The message carries neither a "Sender" nor a "From" field.
    #[error("message has no \"Sender\" or \"From\" field")]
    SenderMissing,

    /// The server answered a command with a failure code.
    #[error("server replied with {code}: {message}")]
    Response {
        /// SMTP reply code.
        code: u16,
        /// Reply text, multiline responses joined with newlines.
        message: String,
    },

    /// The response stream violated the SMTP grammar.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The dialer configuration is unusable.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A message in a batch failed; `index` is the zero-based position of
    /// the first failing message. Later messages were not attempted.
    #[error("could not send message {index}: {source}")]
    Batch {
        /// Zero-based position of the failing message.
        index: usize,
        /// The underlying failure.
        #[source]
        source: Box<SmtpError>,
    },
}

impl SmtpError {
    /// Returns true for network conditions presumed recoverable by
    /// reconnecting: timeouts and end-of-stream.
    pub fn is_transient(&self) -> bool {
        match self {
            SmtpError::Timeout { .. } | SmtpError::ConnectionClosed => true,
            SmtpError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// For batch errors, the position of the failing message.
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            SmtpError::Batch { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// For batch errors, the wrapped cause.
    pub fn batch_cause(&self) -> Option<&SmtpError> {
        match self {
            SmtpError::Batch { source, .. } => Some(source),
            _ => None,
        }
    }
}
