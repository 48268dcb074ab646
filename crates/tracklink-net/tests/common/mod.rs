//! Shared fixtures: a throwaway PKI and tiny line-based servers.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// A test CA and a server certificate for `localhost` issued by it.
pub struct TestPki {
    pub ca: CertificateDer<'static>,
    pub server: Arc<ServerConfig>,
}

fn named(cn: &str, sans: Vec<String>) -> CertificateParams {
    let mut params = CertificateParams::new(sans).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params
}

fn server_config(chain: Vec<CertificateDer<'static>>, key: &KeyPair) -> Arc<ServerConfig> {
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
    Arc::new(
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .unwrap(),
    )
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = named("tracklink test CA", Vec::new());
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf = named("localhost", vec!["localhost".to_string()])
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .unwrap();

        Self {
            ca: ca_cert.der().clone(),
            server: server_config(vec![leaf.der().clone()], &leaf_key),
        }
    }
}

/// A server config presenting a self-signed certificate for `localhost`.
pub fn self_signed_server() -> Arc<ServerConfig> {
    let key = KeyPair::generate().unwrap();
    let cert = named("localhost", vec!["localhost".to_string()])
        .self_signed(&key)
        .unwrap();
    server_config(vec![cert.der().clone()], &key)
}

/// Reads one CRLF line byte by byte so nothing past it is consumed.
pub async fn read_line_raw<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut line = Vec::new();
    loop {
        let b = stream.read_u8().await.unwrap();
        if b == b'\n' {
            break;
        }
        line.push(b);
    }
    String::from_utf8(line).unwrap().trim_end().to_string()
}

/// Listens on loopback and returns the listener with its address.
pub async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Accepts one TLS client, sends `greeting` and holds the connection until
/// the client goes away. Handshake failures end the task quietly.
pub fn spawn_tls_server(listener: TcpListener, config: Arc<ServerConfig>, greeting: &'static str) {
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let Ok(mut tls) = TlsAcceptor::from(config).accept(tcp).await else {
            return;
        };
        if tls.write_all(greeting.as_bytes()).await.is_err() {
            return;
        }
        let mut sink = Vec::new();
        let _ = tls.read_to_end(&mut sink).await;
    });
}

/// Accepts one plaintext client, sends `greeting` and echoes every line
/// back prefixed with `+OK `.
pub fn spawn_echo_server(listener: TcpListener, greeting: &'static str) {
    tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.unwrap();
        tcp.write_all(greeting.as_bytes()).await.unwrap();
        loop {
            let mut line = Vec::new();
            loop {
                match tcp.read_u8().await {
                    Ok(b'\n') => break,
                    Ok(b) => line.push(b),
                    Err(_) => return,
                }
            }
            let mut reply = b"+OK ".to_vec();
            reply.extend_from_slice(&line);
            reply.push(b'\n');
            if tcp.write_all(&reply).await.is_err() {
                return;
            }
        }
    });
}

