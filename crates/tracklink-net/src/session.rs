//! Connection-oriented session contract.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};

use crate::Result;
use crate::stream::SessionStream;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque session identifier, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{:08X}", self.0)
    }
}

/// Snapshot of a connected session's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// When the connection was established.
    pub connect_time: DateTime<Utc>,
    /// Local endpoint.
    pub local_addr: SocketAddr,
    /// Remote endpoint.
    pub remote_addr: SocketAddr,
    /// Whether TLS is active.
    pub secure: bool,
}

/// A connected endpoint.
///
/// Every accessor except [`is_connected`](Self::is_connected) and
/// [`is_secure`](Self::is_secure) fails with `Misuse::NotConnected` when
/// there is no connection.
pub trait Session {
    /// Returns the session identifier assigned at connect.
    ///
    /// # Errors
    ///
    /// Fails if not connected.
    fn id(&self) -> Result<SessionId>;

    /// Returns when the session connected.
    ///
    /// # Errors
    ///
    /// Fails if not connected.
    fn connect_time(&self) -> Result<DateTime<Utc>>;

    /// Returns the time of the last successful read or write.
    ///
    /// # Errors
    ///
    /// Fails if not connected.
    fn last_activity(&self) -> Result<DateTime<Utc>>;

    /// Returns the local endpoint.
    ///
    /// # Errors
    ///
    /// Fails if not connected.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Returns the remote endpoint.
    ///
    /// # Errors
    ///
    /// Fails if not connected.
    fn remote_addr(&self) -> Result<SocketAddr>;

    /// Returns true while connected.
    fn is_connected(&self) -> bool;

    /// Returns true while connected over TLS. False when not connected.
    fn is_secure(&self) -> bool;

    /// Returns the session's byte stream.
    ///
    /// # Errors
    ///
    /// Fails if not connected.
    fn stream(&mut self) -> Result<&mut SessionStream>;

    /// Returns how long the session has been idle.
    ///
    /// # Errors
    ///
    /// Fails if not connected.
    fn idle_for(&self) -> Result<TimeDelta> {
        Ok(Utc::now() - self.last_activity()?)
    }

    /// Returns a snapshot of the session metadata.
    ///
    /// # Errors
    ///
    /// Fails if not connected.
    fn info(&self) -> Result<SessionInfo> {
        Ok(SessionInfo {
            id: self.id()?,
            connect_time: self.connect_time()?,
            local_addr: self.local_addr()?,
            remote_addr: self.remote_addr()?,
            secure: self.is_secure(),
        })
    }
}

/// Future returned by [`ConnectedHook::on_connected`].
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Extension point run once a connection is fully established, before the
/// connect operation reports completion.
///
/// Protocol clients use it to consume a greeting. An error fails the
/// connect and closes the socket.
pub trait ConnectedHook: Send + Sync {
    /// Called with the new session's metadata and stream.
    fn on_connected<'a>(
        &'a self,
        info: &'a SessionInfo,
        stream: &'a mut SessionStream,
    ) -> HookFuture<'a>;
}
