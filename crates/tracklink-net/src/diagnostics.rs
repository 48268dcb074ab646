//! Diagnostics collaborator.
//!
//! A [`Diagnostics`] sink receives a record of what a session reads, writes
//! and runs into. The engine treats the sink as strictly best-effort: every
//! call goes through [`Reporter`], which discards returned errors and
//! swallows panics, so a broken sink can never affect a connection.

use std::fmt;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::Error;

/// Error type a diagnostics sink may return. It is always discarded.
pub type DiagnosticsError = Box<dyn std::error::Error + Send + Sync>;

/// Sink for session diagnostics.
///
/// Endpoints are `None` while they are not known yet (for example during
/// address resolution).
pub trait Diagnostics: Send + Sync {
    /// Records bytes received from the peer.
    ///
    /// # Errors
    ///
    /// Any error is ignored by the engine.
    fn bytes_read(
        &self,
        size: usize,
        text: &str,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError>;

    /// Records bytes sent to the peer.
    ///
    /// # Errors
    ///
    /// Any error is ignored by the engine.
    fn bytes_written(
        &self,
        size: usize,
        text: &str,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError>;

    /// Records a free-form event.
    ///
    /// # Errors
    ///
    /// Any error is ignored by the engine.
    fn text(
        &self,
        text: &str,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError>;

    /// Records a failure.
    ///
    /// # Errors
    ///
    /// Any error is ignored by the engine.
    fn exception(
        &self,
        text: &str,
        error: &Error,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError>;
}

/// Best-effort front for an optional [`Diagnostics`] sink.
#[derive(Clone, Default)]
pub(crate) struct Reporter {
    sink: Option<Arc<dyn Diagnostics>>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("attached", &self.sink.is_some())
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

impl Reporter {
    pub(crate) fn new(sink: Option<Arc<dyn Diagnostics>>) -> Self {
        Self {
            sink,
            local: None,
            remote: None,
        }
    }

    /// Returns a reporter tagged with the given endpoints.
    pub(crate) fn with_endpoints(&self, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            sink: self.sink.clone(),
            local: Some(local),
            remote: Some(remote),
        }
    }

    pub(crate) fn read(&self, size: usize, text: &str) {
        self.guard("bytes_read", |sink| {
            sink.bytes_read(size, text, self.local, self.remote)
        });
    }

    pub(crate) fn written(&self, size: usize, text: &str) {
        self.guard("bytes_written", |sink| {
            sink.bytes_written(size, text, self.local, self.remote)
        });
    }

    pub(crate) fn text(&self, text: &str) {
        self.guard("text", |sink| sink.text(text, self.local, self.remote));
    }

    pub(crate) fn exception(&self, text: &str, error: &Error) {
        self.guard("exception", |sink| {
            sink.exception(text, error, self.local, self.remote)
        });
    }

    fn guard<F>(&self, event: &'static str, call: F)
    where
        F: FnOnce(&dyn Diagnostics) -> Result<(), DiagnosticsError>,
    {
        let Some(sink) = self.sink.as_deref() else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| call(sink))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::trace!(event, error = %e, "diagnostics sink failed"),
            Err(_) => tracing::trace!(event, "diagnostics sink panicked"),
        }
    }
}
