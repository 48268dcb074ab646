//! Connect, lifecycle, diagnostics and hook behaviour over plaintext TCP.

#![allow(clippy::unwrap_used)]

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracklink_net::{
    ClientConfig, ConnectedHook, Diagnostics, DiagnosticsError, Error, HookFuture, Misuse,
    OpState, Resolve, Resolving, Session, SessionInfo, SessionStream, SwitchToSecureOp,
    TcpClient,
};

use common::{listen, spawn_echo_server};

/// Multi-address tests use extra loopback addresses, which only Linux
/// routes without configuration.
#[cfg(target_os = "linux")]
mod candidates {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use tokio::net::{TcpListener, TcpSocket, TcpStream};
    use tracklink_net::{ClientConfig, Error, Session, StaticResolver, TcpClient};

    use crate::common::spawn_echo_server;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
    const C: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3));

    #[tokio::test]
    async fn test_falls_back_through_candidates() {
        let listener = TcpListener::bind(SocketAddr::new(C, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        spawn_echo_server(listener, "+OK third\r\n");

        let resolver = StaticResolver::new().host("mail.test", [A, B, C]);
        let mut client = TcpClient::with_config(ClientConfig::builder().resolver(resolver).build());
        client.connect("mail.test", port, false).await.unwrap();

        assert_eq!(client.remote_addr().unwrap(), SocketAddr::new(C, port));
        assert_eq!(client.read_line().await.unwrap(), "+OK third");
    }

    #[tokio::test]
    async fn test_all_candidates_fail_with_last_error() {
        // Reserve a port on C, then free it so every candidate refuses.
        let port = {
            let listener = TcpListener::bind(SocketAddr::new(C, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let resolver = StaticResolver::new().host("mail.test", [A, B, C]);
        let mut client = TcpClient::with_config(ClientConfig::builder().resolver(resolver).build());
        let err = client.connect("mail.test", port, false).await.unwrap_err();

        match err {
            Error::Connect { addr, .. } => assert_eq!(addr, SocketAddr::new(C, port)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!client.is_connected());
    }

    /// Returns a listener on `ip` whose accept queue is full, so further
    /// connection attempts get no answer, and the connections filling it.
    async fn stalled_listener(ip: IpAddr) -> (TcpListener, Vec<TcpStream>) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind(SocketAddr::new(ip, 0)).unwrap();
        let listener = socket.listen(0).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut fillers = Vec::new();
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(tcp)) => fillers.push(tcp),
                Ok(Err(e)) => panic!("filler connect failed: {e}"),
                Err(_) => return (listener, fillers),
            }
        }
        panic!("accept queue never filled");
    }

    #[tokio::test]
    async fn test_silent_candidate_leaves_time_for_the_next() {
        let (stalled, _fillers) = stalled_listener(B).await;
        let port = stalled.local_addr().unwrap().port();
        let listener = TcpListener::bind(SocketAddr::new(C, port)).await.unwrap();
        spawn_echo_server(listener, "+OK second\r\n");

        let resolver = StaticResolver::new().host("mail.test", [B, C]);
        let config = ClientConfig::builder()
            .resolver(resolver)
            .connect_timeout(Duration::from_secs(2))
            .build();
        assert!(config.io_timeout > config.connect_timeout);
        let mut client = TcpClient::with_config(config);
        client.connect("mail.test", port, false).await.unwrap();

        assert_eq!(client.remote_addr().unwrap(), SocketAddr::new(C, port));
        assert_eq!(client.read_line().await.unwrap(), "+OK second");
    }
}

#[tokio::test]
async fn test_dispose_after_disconnect() {
    let (listener, addr) = listen().await;
    spawn_echo_server(listener, "+OK\r\n");

    let mut client = TcpClient::new();
    client.connect("127.0.0.1", addr.port(), false).await.unwrap();
    client.disconnect().await.unwrap();
    assert!(!client.is_connected());
    assert!(client.last_activity().is_err());

    client.dispose().await;
    client.dispose().await;
    assert!(client.is_disposed());
    assert!(!client.is_connected());
    assert!(!client.is_secure());
    assert_eq!(client.id().unwrap_err().misuse(), Some(Misuse::Disposed));
    assert_eq!(
        client.remote_addr().unwrap_err().misuse(),
        Some(Misuse::Disposed)
    );
    assert_eq!(
        client
            .connect("127.0.0.1", addr.port(), false)
            .await
            .unwrap_err()
            .misuse(),
        Some(Misuse::Disposed)
    );
}

#[tokio::test]
async fn test_dispose_while_connected() {
    let (listener, addr) = listen().await;
    spawn_echo_server(listener, "+OK\r\n");

    let mut client = TcpClient::new();
    client.connect("127.0.0.1", addr.port(), false).await.unwrap();
    client.dispose().await;
    assert!(!client.is_connected());
    assert_eq!(
        client.disconnect().await.unwrap_err().misuse(),
        Some(Misuse::Disposed)
    );
}

#[tokio::test]
async fn test_disconnect_after_peer_closed() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        drop(tcp);
    });

    let mut client = TcpClient::new();
    client.connect("127.0.0.1", addr.port(), false).await.unwrap();
    server.await.unwrap();
    assert!(matches!(
        client.read_line().await,
        Err(Error::ConnectionClosed)
    ));
    let _ = client.write_line("QUIT").await;

    client.disconnect().await.unwrap();
    assert!(!client.is_connected());
    assert_eq!(client.id().unwrap_err().misuse(), Some(Misuse::NotConnected));
}

/// Answers after a delay with a fixed address.
struct DelayedResolver {
    delay: Duration,
    addr: SocketAddr,
}

impl Resolve for DelayedResolver {
    fn resolve<'a>(&'a self, _host: &'a str, _port: u16) -> Resolving<'a> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(vec![self.addr])
        })
    }
}

#[tokio::test]
async fn test_dispose_while_connecting() {
    let (listener, addr) = listen().await;
    let resolver = DelayedResolver {
        delay: Duration::from_millis(100),
        addr,
    };
    let mut client = TcpClient::with_config(ClientConfig::builder().resolver(resolver).build());

    let op = client.begin_connect("mail.test", addr.port(), false).unwrap();
    client.dispose().await;

    assert!(client.is_disposed());
    assert!(!client.is_connected());
    assert_eq!(op.state(), OpState::Disposed);
    assert_eq!(
        client.end_connect().unwrap_err().misuse(),
        Some(Misuse::Disposed)
    );
    // The abandoned connect never reaches the server.
    assert!(
        tokio::time::timeout(Duration::from_millis(500), listener.accept())
            .await
            .is_err()
    );
}

/// Accepts one connection, then collects whatever the client sends until
/// it closes the socket. Never answers a TLS handshake.
fn spawn_silent_server(listener: TcpListener) -> oneshot::Receiver<Vec<u8>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let _ = tcp.read_to_end(&mut received).await;
        let _ = tx.send(received);
    });
    rx
}

/// Connects in plaintext and starts a TLS upgrade the server never answers.
async fn stuck_upgrade() -> (TcpClient, SwitchToSecureOp, oneshot::Receiver<Vec<u8>>) {
    let (listener, addr) = listen().await;
    let closed = spawn_silent_server(listener);

    let mut client = TcpClient::new();
    client.connect("127.0.0.1", addr.port(), false).await.unwrap();
    let op = client.begin_switch_to_secure().unwrap();
    assert_eq!(op.state(), OpState::Active);
    assert!(client.is_connected());
    (client, op, closed)
}

#[tokio::test]
async fn test_disconnect_while_upgrading() {
    let (mut client, op, closed) = stuck_upgrade().await;

    client.disconnect().await.unwrap();
    assert!(!client.is_connected());
    assert!(!client.is_disposed());
    assert_eq!(op.state(), OpState::Disposed);
    assert_eq!(
        client.end_switch_to_secure().unwrap_err().misuse(),
        Some(Misuse::NothingPending)
    );

    // The socket held by the handshake is closed.
    let received = tokio::time::timeout(Duration::from_secs(2), closed)
        .await
        .unwrap()
        .unwrap();
    assert!(received.first().is_none_or(|&b| b == 0x16));
}

#[tokio::test]
async fn test_dispose_while_upgrading() {
    let (mut client, op, closed) = stuck_upgrade().await;

    client.dispose().await;
    assert!(client.is_disposed());
    assert!(!client.is_connected());
    assert_eq!(op.state(), OpState::Disposed);

    tokio::time::timeout(Duration::from_secs(2), closed)
        .await
        .unwrap()
        .unwrap();
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: String) -> Result<(), DiagnosticsError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl Diagnostics for Recorder {
    fn bytes_read(
        &self,
        size: usize,
        text: &str,
        _local: Option<SocketAddr>,
        _remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError> {
        self.push(format!("read {size} {text}"))
    }

    fn bytes_written(
        &self,
        size: usize,
        text: &str,
        _local: Option<SocketAddr>,
        _remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError> {
        self.push(format!("written {size} {text}"))
    }

    fn text(
        &self,
        text: &str,
        _local: Option<SocketAddr>,
        _remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError> {
        self.push(text.to_string())
    }

    fn exception(
        &self,
        text: &str,
        error: &Error,
        _local: Option<SocketAddr>,
        _remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError> {
        self.push(format!("{text}: {error}"))
    }
}

/// Fails every other call and panics on the rest.
#[derive(Default)]
struct Broken {
    calls: Mutex<u32>,
}

impl Broken {
    fn misbehave(&self) -> Result<(), DiagnosticsError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        assert!(n % 2 == 0, "diagnostics sink exploded");
        Err("diagnostics sink is broken".into())
    }
}

impl Diagnostics for Broken {
    fn bytes_read(
        &self,
        _size: usize,
        _text: &str,
        _local: Option<SocketAddr>,
        _remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError> {
        self.misbehave()
    }

    fn bytes_written(
        &self,
        _size: usize,
        _text: &str,
        _local: Option<SocketAddr>,
        _remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError> {
        self.misbehave()
    }

    fn text(
        &self,
        _text: &str,
        _local: Option<SocketAddr>,
        _remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError> {
        self.misbehave()
    }

    fn exception(
        &self,
        _text: &str,
        _error: &Error,
        _local: Option<SocketAddr>,
        _remote: Option<SocketAddr>,
    ) -> Result<(), DiagnosticsError> {
        self.misbehave()
    }
}

/// Connects, greets, sends two commands and disconnects; returns every
/// line received.
async fn session_cycle(sink: Arc<dyn Diagnostics>) -> Vec<String> {
    let (listener, addr) = listen().await;
    spawn_echo_server(listener, "+OK hello\r\n");

    let mut client = TcpClient::with_config(ClientConfig::builder().diagnostics(sink).build());
    client.connect("127.0.0.1", addr.port(), false).await.unwrap();
    let mut lines = vec![client.read_line().await.unwrap()];
    for command in ["USER alice", "PASS secret"] {
        client.write_line(command).await.unwrap();
        lines.push(client.read_line().await.unwrap());
    }
    client.disconnect().await.unwrap();
    lines
}

#[tokio::test]
async fn test_diagnostics_failures_do_not_affect_sessions() {
    let recorder = Arc::new(Recorder::default());
    let recorded = session_cycle(recorder.clone()).await;
    let broken = session_cycle(Arc::new(Broken::default())).await;

    assert_eq!(recorded, ["+OK hello", "+OK USER alice", "+OK PASS secret"]);
    assert_eq!(broken, recorded);

    let events = recorder.events.lock().unwrap();
    assert!(events.iter().any(|e| e == "written 12 USER alice"));
    assert!(events.iter().any(|e| e == "read 11 +OK hello"));
    assert!(events.iter().any(|e| e == "Disconnecting"));
}

/// Reads the server greeting before the connect completes.
struct Greeting {
    seen: Arc<Mutex<Option<String>>>,
}

impl ConnectedHook for Greeting {
    fn on_connected<'a>(
        &'a self,
        info: &'a SessionInfo,
        stream: &'a mut SessionStream,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            assert!(!info.secure);
            let mut line = Vec::new();
            loop {
                let b = stream.read_u8().await?;
                if b == b'\n' {
                    break;
                }
                line.push(b);
            }
            let greeting = String::from_utf8_lossy(&line).trim_end().to_string();
            if !greeting.starts_with("+OK") {
                return Err(Error::Hook(greeting));
            }
            *self.seen.lock().unwrap() = Some(greeting);
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_hook_consumes_greeting() {
    let (listener, addr) = listen().await;
    spawn_echo_server(listener, "+OK POP3 ready\r\n");

    let seen = Arc::new(Mutex::new(None));
    let hook = Greeting { seen: seen.clone() };
    let mut client = TcpClient::with_config(ClientConfig::builder().hook(hook).build());
    client.connect("127.0.0.1", addr.port(), false).await.unwrap();

    assert_eq!(seen.lock().unwrap().as_deref(), Some("+OK POP3 ready"));
    client.write_line("CAPA").await.unwrap();
    assert_eq!(client.read_line().await.unwrap(), "+OK CAPA");
}

#[tokio::test]
async fn test_hook_error_fails_connect() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.unwrap();
        tcp.write_all(b"-ERR go away\r\n").await.unwrap();
        let mut rest = Vec::new();
        let _ = tcp.read_to_end(&mut rest).await;
    });

    let seen = Arc::new(Mutex::new(None));
    let hook = Greeting { seen: seen.clone() };
    let mut client = TcpClient::with_config(ClientConfig::builder().hook(hook).build());
    let err = client
        .connect("127.0.0.1", addr.port(), false)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Hook(ref greeting) if greeting == "-ERR go away"));
    assert!(!client.is_connected());
    assert!(seen.lock().unwrap().is_none());
}
