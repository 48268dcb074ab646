//! Error types for the networking runtime.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::async_op::OpState;

/// Errors that can occur while connecting, upgrading or talking over a session.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller used the API in a way that is never valid.
    #[error("usage error: {0}")]
    Misuse(#[from] Misuse),

    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration or protocol error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Host name resolution failed.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        /// Host that was being resolved.
        host: String,
        /// Resolver failure.
        #[source]
        source: std::io::Error,
    },

    /// Host name resolved to an empty address list.
    #[error("{0} did not resolve to any address")]
    NoAddresses(String),

    /// Connecting to a candidate address failed.
    ///
    /// When every candidate fails this is the failure of the last one.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Candidate address that refused or timed out.
        addr: SocketAddr,
        /// Underlying socket failure.
        #[source]
        source: std::io::Error,
    },

    /// TLS handshake failed.
    #[error("TLS handshake with {host} failed: {source}")]
    Handshake {
        /// Server name used for the handshake.
        host: String,
        /// Handshake failure as reported by the TLS layer.
        #[source]
        source: std::io::Error,
    },

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A received line exceeded the configured limit.
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    /// Plaintext bytes were already buffered when a TLS upgrade was requested.
    ///
    /// The upgrade is refused and the session is left as it was.
    #[error("{0} plaintext bytes pending before TLS upgrade")]
    BufferedPlaintext(usize),

    /// The connected hook rejected the new session.
    #[error("connected hook failed: {0}")]
    Hook(String),

    /// No tokio runtime was available to drive the operation.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// An operation failed and its error is still referenced elsewhere.
    #[error("{0}")]
    Shared(String),
}

impl Error {
    /// Returns true if this is a programming error rather than a runtime failure.
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(self, Self::Misuse(_))
    }

    /// Returns true if this error is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) | Self::Connect { source: e, .. } | Self::Handshake { source: e, .. } => {
                e.kind() == std::io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }

    /// Returns the usage fault, if this is one.
    #[must_use]
    pub const fn misuse(&self) -> Option<Misuse> {
        match self {
            Self::Misuse(m) => Some(*m),
            _ => None,
        }
    }
}

/// Programming errors. These are reported synchronously and never change state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Misuse {
    /// Connect was called on a connected session.
    #[error("session is already connected")]
    AlreadyConnected,

    /// The operation requires a connected session.
    #[error("session is not connected")]
    NotConnected,

    /// TLS upgrade was requested on a session that is already secure.
    #[error("session is already secure")]
    AlreadySecure,

    /// Another connect or upgrade is in flight.
    #[error("another connect or upgrade is in progress")]
    Busy,

    /// The operation was started twice.
    #[error("operation has already been started")]
    AlreadyStarted,

    /// The outcome was read before the operation completed.
    #[error("operation has not completed (state: {0:?})")]
    NotCompleted(OpState),

    /// There is no pending connect or upgrade to finish.
    #[error("no operation is pending")]
    NothingPending,

    /// The outcome was already taken by an earlier call.
    #[error("operation result has already been taken")]
    OutputTaken,

    /// The object has been disposed.
    #[error("object has been disposed")]
    Disposed,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
