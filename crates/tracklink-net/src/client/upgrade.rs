//! In-place TLS upgrade of a plaintext session (STARTTLS).
//!
//! The plaintext `TcpStream` is moved into the TLS connector, which wraps it
//! and keeps it open; only once the handshake succeeds does the new stream
//! replace the session's stream. A failed handshake leaves the transport in
//! an unknown state, so the socket is dropped and the client goes back to
//! idle. Disconnecting or disposing mid-handshake drops the socket too.

use std::sync::Arc;

use tokio::sync::oneshot;

use super::connect::handshake;
use super::{Established, Phase, SwitchToSecureOp, TcpClient};
use crate::async_op::OpState;
use crate::stream::{SessionStream, Transport};
use crate::{Error, Misuse, Result};

impl TcpClient {
    /// Upgrades the connected plaintext session to TLS.
    ///
    /// The caller must make sure the peer is ready for the handshake (for
    /// example after a `STARTTLS` command was accepted) and that no other
    /// I/O is in flight on the session.
    ///
    /// # Errors
    ///
    /// Usage faults ([`Misuse::NotConnected`], [`Misuse::AlreadySecure`],
    /// [`Misuse::Busy`], [`Misuse::Disposed`]) are returned before any I/O
    /// and leave the session unchanged, as does
    /// [`Error::BufferedPlaintext`]. A handshake failure disconnects the
    /// session.
    pub async fn switch_to_secure(&mut self) -> Result<()> {
        let op = self.begin_switch_to_secure()?;
        if let Err(e) = op.wait().await {
            self.phase = Phase::Idle;
            return Err(e);
        }
        self.end_switch_to_secure()
    }

    /// Starts the TLS upgrade and returns the running operation.
    ///
    /// While the operation runs the session reports itself connected but
    /// its stream is unavailable ([`Misuse::Busy`]).
    ///
    /// # Errors
    ///
    /// See [`switch_to_secure`](Self::switch_to_secure).
    pub fn begin_switch_to_secure(&mut self) -> Result<SwitchToSecureOp> {
        let established = match &self.phase {
            Phase::Connected(established) => established,
            Phase::Upgrading { .. } | Phase::Connecting { .. } => return Err(Misuse::Busy.into()),
            Phase::Idle => return Err(Misuse::NotConnected.into()),
            Phase::Disposed => return Err(Misuse::Disposed.into()),
        };
        if established.stream.is_tls() {
            return Err(Misuse::AlreadySecure.into());
        }
        if !established.rx.is_empty() {
            return Err(Error::BufferedPlaintext(established.rx.len()));
        }
        tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let connector = self.connector()?;

        let Phase::Connected(established) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return Err(Misuse::NotConnected.into());
        };
        let info = established.info();
        let Established {
            host,
            id,
            connect_time,
            local_addr,
            remote_addr,
            stream,
            rx,
            reporter,
        } = established;
        let (tcp, activity) = match stream.into_plain() {
            Ok(parts) => parts,
            Err(stream) => {
                self.phase = Phase::Connected(Established {
                    host,
                    id,
                    connect_time,
                    local_addr,
                    remote_addr,
                    stream,
                    rx,
                    reporter,
                });
                return Err(Misuse::AlreadySecure.into());
            }
        };

        tracing::debug!(client = %self.label, session = %id, host = %host, "upgrading to TLS");
        let io_timeout = self.config.io_timeout;
        let clock = Arc::clone(&activity);
        let client = Arc::clone(&self.label);
        let (abandon, abandoned) = oneshot::channel::<()>();
        let work = async move {
            reporter.text("Starting TLS handshake");
            let secured = tokio::select! {
                secured = handshake(&connector, &host, tcp, io_timeout) => secured,
                _ = abandoned => {
                    tracing::debug!(%client, session = %id, "TLS upgrade abandoned");
                    return Err(Error::from(Misuse::Disposed));
                }
            };
            match secured {
                Ok(tls) => {
                    reporter.text("TLS handshake completed");
                    Ok(Established {
                        host,
                        id,
                        connect_time,
                        local_addr,
                        remote_addr,
                        stream: SessionStream::new(Transport::Tls(Box::new(tls)), clock),
                        rx,
                        reporter,
                    })
                }
                Err(e) => {
                    reporter.exception("TLS upgrade failed", &e);
                    Err(e)
                }
            }
        };

        let op = SwitchToSecureOp::new();
        if let Err(e) = op.start(Arc::clone(&self.label), work) {
            tracing::warn!(client = %self.label, error = %e, "could not start TLS upgrade");
            return Err(e);
        }
        self.phase = Phase::Upgrading {
            info,
            activity,
            op: op.clone(),
            abandon,
        };
        Ok(op)
    }

    /// Installs the outcome of a completed upgrade.
    ///
    /// # Errors
    ///
    /// Returns [`Misuse::NotCompleted`] while the handshake is running,
    /// [`Misuse::NothingPending`] if no upgrade was begun, or the handshake
    /// failure, after which the client is disconnected.
    pub fn end_switch_to_secure(&mut self) -> Result<()> {
        let op = match &self.phase {
            Phase::Upgrading { op, .. } => op.clone(),
            Phase::Disposed => return Err(Misuse::Disposed.into()),
            _ => return Err(Misuse::NothingPending.into()),
        };
        match op.state() {
            OpState::Completed => {}
            OpState::Disposed => {
                self.phase = Phase::Idle;
                return Err(Misuse::Disposed.into());
            }
            state => return Err(Misuse::NotCompleted(state).into()),
        }

        self.phase = Phase::Idle;
        match op.take_output() {
            Ok(established) => {
                tracing::info!(client = %self.label, session = %established.id, "session secured");
                self.phase = Phase::Connected(established);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(client = %self.label, error = %e, "TLS upgrade failed, session closed");
                Err(e)
            }
        }
    }
}
