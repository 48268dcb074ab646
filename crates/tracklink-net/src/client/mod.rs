//! TCP client session.
//!
//! [`TcpClient`] is the one concrete [`Session`]. It moves through these
//! phases:
//!
//! ```text
//! ┌──────┐ begin_connect ┌────────────┐ end_connect ┌───────────┐
//! │ Idle │ ────────────→ │ Connecting │ ──────────→ │ Connected │
//! └──────┘ ←──────────── └────────────┘             └───────────┘
//!    ↑        failure                                 │       ↑
//!    │                        begin_switch_to_secure  │       │ end_switch_to_secure
//!    │                                                ▼       │
//!    │      disconnect / failed upgrade          ┌───────────┐
//!    └────────────────────────────────────────── │ Upgrading │
//!                                                └───────────┘
//! ```
//!
//! `dispose` moves any phase to `Disposed`, which is terminal.
//!
//! Connect and upgrade each come in two flavours: an awaiting call
//! ([`TcpClient::connect`], [`TcpClient::switch_to_secure`]) and a
//! begin/end pair returning an [`AsyncOp`] the caller can subscribe to or
//! wait on from another thread.

#![allow(clippy::missing_errors_doc)]

mod connect;
mod io;
mod upgrade;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;

use crate::async_op::AsyncOp;
use crate::config::ClientConfig;
use crate::diagnostics::Reporter;
use crate::session::{Session, SessionId, SessionInfo};
use crate::stream::{ActivityClock, SessionStream};
use crate::tls::create_tls_connector;
use crate::{Misuse, Result};

/// Operation returned by [`TcpClient::begin_connect`].
pub type ConnectOp = AsyncOp<Established>;

/// Operation returned by [`TcpClient::begin_switch_to_secure`].
pub type SwitchToSecureOp = AsyncOp<Established>;

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// A fully established connection, produced by connect and upgrade
/// operations and installed into the client by the matching `end_*` call.
#[derive(Debug)]
pub struct Established {
    host: String,
    id: SessionId,
    connect_time: DateTime<Utc>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    stream: SessionStream,
    rx: BytesMut,
    reporter: Reporter,
}

impl Established {
    /// Returns the session metadata.
    #[must_use]
    pub const fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            connect_time: self.connect_time,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            secure: self.stream.is_tls(),
        }
    }

    async fn close(mut self, timeout: std::time::Duration) {
        self.reporter.text("Disconnecting");
        match tokio::time::timeout(timeout, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "shutdown failed, closing anyway"),
            Err(_) => tracing::debug!(?timeout, "shutdown timed out, closing anyway"),
        }
    }
}

/// Where the client is in its lifecycle.
///
/// Pending phases hold the sending half of a channel the running work
/// listens on; dropping it makes the work give up and release its socket.
enum Phase {
    Idle,
    Connecting {
        op: ConnectOp,
        abandon: oneshot::Sender<()>,
    },
    Connected(Established),
    Upgrading {
        info: SessionInfo,
        activity: Arc<ActivityClock>,
        op: SwitchToSecureOp,
        abandon: oneshot::Sender<()>,
    },
    Disposed,
}

impl Phase {
    const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting { .. } => "connecting",
            Self::Connected(_) => "connected",
            Self::Upgrading { .. } => "upgrading",
            Self::Disposed => "disposed",
        }
    }
}

/// TCP client with optional TLS, usable as a [`Session`].
pub struct TcpClient {
    config: ClientConfig,
    label: Arc<str>,
    phase: Phase,
    connector: Option<TlsConnector>,
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TcpClient");
        s.field("label", &self.label).field("phase", &self.phase.name());
        if let Ok(info) = self.info() {
            s.field("session", &info);
        }
        s.finish_non_exhaustive()
    }
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpClient {
    /// Creates an unconnected client with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Creates an unconnected client.
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        let n = NEXT_CLIENT.fetch_add(1, Ordering::Relaxed);
        Self {
            config,
            label: Arc::from(format!("tcp-client-{n}")),
            phase: Phase::Idle,
            connector: None,
        }
    }

    /// Returns the client configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the label used as owner of this client's operations.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns true once the client has been disposed.
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        matches!(self.phase, Phase::Disposed)
    }

    /// Closes the connection and clears all session fields.
    ///
    /// Shutdown errors are ignored, so this succeeds even if the peer has
    /// already gone away. An in-flight upgrade is abandoned and its socket
    /// closed; the upgrade operation reports [`OpState::Disposed`].
    ///
    /// [`OpState::Disposed`]: crate::OpState::Disposed
    ///
    /// # Errors
    ///
    /// Returns [`Misuse::NotConnected`] if there is no connection and
    /// [`Misuse::Disposed`] after disposal.
    pub async fn disconnect(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connected(established) => {
                tracing::debug!(
                    client = %self.label,
                    session = %established.id,
                    remote = %established.remote_addr,
                    "disconnecting"
                );
                established.close(self.config.io_timeout).await;
                Ok(())
            }
            Phase::Upgrading {
                info, op, abandon, ..
            } => {
                tracing::debug!(client = %self.label, session = %info.id, "abandoning TLS upgrade");
                op.dispose();
                drop(abandon);
                Ok(())
            }
            Phase::Disposed => {
                self.phase = Phase::Disposed;
                Err(Misuse::Disposed.into())
            }
            other => {
                self.phase = other;
                Err(Misuse::NotConnected.into())
            }
        }
    }

    /// Releases the connection, if any, and makes the client unusable.
    ///
    /// Idempotent. Teardown errors are discarded. A pending connect is
    /// abandoned: its operation reports disposed and no socket survives it.
    pub async fn dispose(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Disposed => {
                self.phase = Phase::Disposed;
                return;
            }
            phase @ (Phase::Connected(_) | Phase::Upgrading { .. }) => {
                self.phase = phase;
                if let Err(e) = self.disconnect().await {
                    tracing::trace!(client = %self.label, error = %e, "ignoring teardown error");
                }
            }
            Phase::Connecting { op, abandon } => {
                tracing::debug!(client = %self.label, "abandoning connect");
                op.dispose();
                drop(abandon);
            }
            Phase::Idle => {}
        }
        tracing::debug!(client = %self.label, "disposed");
        self.phase = Phase::Disposed;
        self.connector = None;
    }

    fn check_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Misuse::Disposed.into());
        }
        Ok(())
    }

    /// Returns the cached TLS connector, building it on first use.
    fn connector(&mut self) -> Result<TlsConnector> {
        if let Some(connector) = &self.connector {
            return Ok(connector.clone());
        }
        let connector =
            create_tls_connector(Arc::clone(&self.config.validator), &self.config.extra_roots)?;
        self.connector = Some(connector.clone());
        Ok(connector)
    }

    fn not_connected(&self) -> Misuse {
        if self.is_disposed() {
            Misuse::Disposed
        } else {
            Misuse::NotConnected
        }
    }

    fn established(&self) -> Result<&Established> {
        match &self.phase {
            Phase::Connected(established) => Ok(established),
            _ => Err(self.not_connected().into()),
        }
    }

    fn established_mut(&mut self) -> Result<&mut Established> {
        let misuse = match &self.phase {
            Phase::Upgrading { .. } => Misuse::Busy,
            _ => self.not_connected(),
        };
        match &mut self.phase {
            Phase::Connected(established) => Ok(established),
            _ => Err(misuse.into()),
        }
    }

    fn session_info(&self) -> Result<SessionInfo> {
        match &self.phase {
            Phase::Connected(established) => Ok(established.info()),
            Phase::Upgrading { info, .. } => Ok(*info),
            _ => Err(self.not_connected().into()),
        }
    }
}

impl Session for TcpClient {
    fn id(&self) -> Result<SessionId> {
        Ok(self.session_info()?.id)
    }

    fn connect_time(&self) -> Result<DateTime<Utc>> {
        Ok(self.session_info()?.connect_time)
    }

    fn last_activity(&self) -> Result<DateTime<Utc>> {
        match &self.phase {
            Phase::Connected(established) => Ok(established.stream.last_activity()),
            Phase::Upgrading { activity, .. } => Ok(activity.last()),
            _ => Err(self.not_connected().into()),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.session_info()?.local_addr)
    }

    fn remote_addr(&self) -> Result<SocketAddr> {
        Ok(self.session_info()?.remote_addr)
    }

    fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected(_) | Phase::Upgrading { .. })
    }

    fn is_secure(&self) -> bool {
        self.established()
            .is_ok_and(|established| established.stream.is_tls())
    }

    fn stream(&mut self) -> Result<&mut SessionStream> {
        Ok(&mut self.established_mut()?.stream)
    }

    fn info(&self) -> Result<SessionInfo> {
        self.session_info()
    }
}
