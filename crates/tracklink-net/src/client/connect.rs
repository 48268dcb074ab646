//! Connect state machine.
//!
//! `Idle → Resolving → Connecting → (TlsHandshaking) → Connected`, any step
//! failing into `Failed`. The whole run is bounded by `connect_timeout`.
//! Each socket attempt gets `io_timeout` or an even share of what is left of
//! the deadline across the remaining candidates, whichever is shorter, so a
//! silent address cannot starve the ones after it. The handshake is bounded
//! by `io_timeout`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use super::{ConnectOp, Established, Phase, TcpClient};
use crate::async_op::OpState;
use crate::diagnostics::Reporter;
use crate::resolve::{Resolve, literal_addr};
use crate::session::{ConnectedHook, SessionId};
use crate::stream::{ActivityClock, SessionStream, Transport};
use crate::tls::server_name;
use crate::{Error, Misuse, Result};

/// Everything a connect run needs, detached from the client.
struct ConnectPlan {
    host: String,
    port: u16,
    connector: Option<TlsConnector>,
    io_timeout: Duration,
    connect_timeout: Duration,
    local_addr: Option<SocketAddr>,
    resolver: Arc<dyn Resolve>,
    hook: Option<Arc<dyn ConnectedHook>>,
    reporter: Reporter,
    client: Arc<str>,
}

impl TcpClient {
    /// Connects to `host:port`, optionally negotiating TLS right away.
    ///
    /// `host` may be a name or an IP literal. Names resolving to several
    /// addresses are tried in order.
    ///
    /// # Errors
    ///
    /// Usage faults are returned before any I/O. Otherwise returns the
    /// failure of the connect operation, in which case the client is left
    /// unconnected and may be reused.
    pub async fn connect(&mut self, host: &str, port: u16, tls: bool) -> Result<()> {
        let op = self.begin_connect(host, port, tls)?;
        if let Err(e) = op.wait().await {
            self.phase = Phase::Idle;
            return Err(e);
        }
        self.end_connect()
    }

    /// Starts connecting and returns the running operation.
    ///
    /// Finish with [`end_connect`](Self::end_connect) once the operation has
    /// completed.
    ///
    /// # Errors
    ///
    /// Returns [`Misuse::AlreadyConnected`] if connected, [`Misuse::Busy`]
    /// while another connect or upgrade is pending, [`Misuse::Disposed`]
    /// after disposal, a TLS error if the connector cannot be built, and
    /// [`Error::NoRuntime`] outside a tokio runtime. None of these change
    /// the client's state.
    pub fn begin_connect(&mut self, host: &str, port: u16, tls: bool) -> Result<ConnectOp> {
        match &self.phase {
            Phase::Idle => {}
            Phase::Connected(_) => return Err(Misuse::AlreadyConnected.into()),
            Phase::Connecting { .. } | Phase::Upgrading { .. } => return Err(Misuse::Busy.into()),
            Phase::Disposed => return Err(Misuse::Disposed.into()),
        }
        tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let connector = if tls { Some(self.connector()?) } else { None };

        let plan = ConnectPlan {
            host: host.to_string(),
            port,
            connector,
            io_timeout: self.config.io_timeout,
            connect_timeout: self.config.connect_timeout,
            local_addr: self.config.local_addr,
            resolver: Arc::clone(&self.config.resolver),
            hook: self.config.hook.clone(),
            reporter: Reporter::new(self.config.diagnostics.clone()),
            client: Arc::clone(&self.label),
        };

        tracing::debug!(client = %self.label, host, port, tls, "connect requested");
        let (abandon, abandoned) = oneshot::channel();
        let op = ConnectOp::new();
        op.start(Arc::clone(&self.label), plan.run(abandoned))?;
        self.phase = Phase::Connecting {
            op: op.clone(),
            abandon,
        };
        Ok(op)
    }

    /// Installs the outcome of a completed connect operation.
    ///
    /// # Errors
    ///
    /// Returns [`Misuse::NotCompleted`] while the operation is still running
    /// (the client stays connecting), [`Misuse::NothingPending`] if no
    /// connect was begun, or the operation's failure, after which the client
    /// is idle again.
    pub fn end_connect(&mut self) -> Result<()> {
        let op = match &self.phase {
            Phase::Connecting { op, .. } => op.clone(),
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
        let established = op.take_output()?;
        tracing::info!(
            client = %self.label,
            session = %established.id,
            local = %established.local_addr,
            remote = %established.remote_addr,
            secure = established.stream.is_tls(),
            "connected"
        );
        self.phase = Phase::Connected(established);
        Ok(())
    }
}

impl ConnectPlan {
    /// Runs the connect until it succeeds, fails, runs out of time, or the
    /// client drops the other end of `abandoned`.
    async fn run(self, abandoned: oneshot::Receiver<()>) -> Result<Established> {
        let limit = self.connect_timeout;
        let deadline = Instant::now() + limit;
        let reporter = self.reporter.clone();
        let client = Arc::clone(&self.client);
        let outcome = tokio::select! {
            outcome = tokio::time::timeout_at(deadline, self.establish(deadline)) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout(limit)),
            },
            _ = abandoned => {
                tracing::debug!(%client, "connect abandoned");
                return Err(Misuse::Disposed.into());
            }
        };
        if let Err(e) = &outcome {
            reporter.exception("Connect failed", e);
        }
        outcome
    }

    async fn establish(self, deadline: Instant) -> Result<Established> {
        let addrs = self.resolve().await?;
        let (tcp, remote_addr) = self.connect_any(&addrs, deadline).await?;
        let local_addr = tcp.local_addr()?;
        let reporter = self.reporter.with_endpoints(local_addr, remote_addr);
        reporter.text(&format!("Connected to {remote_addr}"));

        let transport = match &self.connector {
            Some(connector) => {
                reporter.text("Starting TLS handshake");
                let tls = handshake(connector, &self.host, tcp, self.io_timeout).await?;
                reporter.text("TLS handshake completed");
                Transport::Tls(Box::new(tls))
            }
            None => Transport::Plain(tcp),
        };

        let connect_time = Utc::now();
        let mut established = Established {
            host: self.host,
            id: SessionId::next(),
            connect_time,
            local_addr,
            remote_addr,
            stream: SessionStream::new(transport, ActivityClock::new(connect_time)),
            rx: BytesMut::new(),
            reporter,
        };

        if let Some(hook) = &self.hook {
            let info = established.info();
            hook.on_connected(&info, &mut established.stream).await?;
        }
        Ok(established)
    }

    async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        if let Some(addr) = literal_addr(&self.host, self.port) {
            return Ok(vec![addr]);
        }

        tracing::debug!(client = %self.client, host = %self.host, "resolving");
        self.reporter.text(&format!("Resolving {}", self.host));
        let addrs = self
            .resolver
            .resolve(&self.host, self.port)
            .await
            .map_err(|source| Error::Resolve {
                host: self.host.clone(),
                source,
            })?;
        if addrs.is_empty() {
            return Err(Error::NoAddresses(self.host.clone()));
        }
        tracing::debug!(client = %self.client, host = %self.host, ?addrs, "resolved");
        Ok(addrs)
    }

    /// Tries each candidate in order and returns the first that connects.
    ///
    /// When all fail, the last candidate's failure is returned.
    async fn connect_any(
        &self,
        addrs: &[SocketAddr],
        deadline: Instant,
    ) -> Result<(TcpStream, SocketAddr)> {
        let mut last = None;
        for (i, &addr) in addrs.iter().enumerate() {
            let budget = attempt_budget(
                self.io_timeout,
                deadline.saturating_duration_since(Instant::now()),
                addrs.len() - i,
            );
            tracing::debug!(client = %self.client, %addr, attempt = i + 1, ?budget, "connecting");
            self.reporter.text(&format!("Connecting to {addr}"));
            match self.attempt(addr, budget).await {
                Ok(tcp) => return Ok((tcp, addr)),
                Err(source) => {
                    let remaining = addrs.len() - i - 1;
                    if remaining > 0 {
                        tracing::debug!(
                            client = %self.client,
                            %addr,
                            error = %source,
                            remaining,
                            "connect attempt failed, trying next address"
                        );
                    } else {
                        tracing::warn!(client = %self.client, %addr, error = %source, "connect failed");
                    }
                    last = Some(Error::Connect { addr, source });
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::NoAddresses(self.host.clone())))
    }

    async fn attempt(&self, addr: SocketAddr, budget: Duration) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = self.local_addr {
            socket.bind(local)?;
        }
        match tokio::time::timeout(budget, socket.connect(addr)).await {
            Ok(connected) => connected,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {budget:?}"),
            )),
        }
    }
}

/// Time allowed for one connect attempt with `candidates` addresses still to
/// try, this one included.
fn attempt_budget(io_timeout: Duration, remaining: Duration, candidates: usize) -> Duration {
    let share = u32::try_from(candidates.max(1)).map_or(Duration::ZERO, |n| remaining / n);
    io_timeout.min(share)
}

/// Runs a client TLS handshake over `tcp`.
///
/// The TLS stream takes ownership of the socket. On failure the socket is
/// dropped with the handshake future.
pub(super) async fn handshake(
    connector: &TlsConnector,
    host: &str,
    tcp: TcpStream,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let name = server_name(host)?;
    tracing::debug!(host, "starting TLS handshake");
    match tokio::time::timeout(timeout, connector.connect(name, tcp)).await {
        Ok(Ok(tls)) => {
            tracing::debug!(host, "TLS handshake completed");
            Ok(tls)
        }
        Ok(Err(source)) => Err(Error::Handshake {
            host: host.to_string(),
            source,
        }),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}
