//! # tracklink-net
//!
//! Asynchronous TCP sessions with optional TLS, built for the mail fetcher
//! of the tracklink issue tracker.
//!
//! ## Features
//!
//! - **One-shot async operations**: [`AsyncOp`] tracks a piece of work from
//!   start to completion, delivers exactly one completion notification and
//!   can be awaited, waited on from a plain thread, or subscribed to
//! - **Multi-address connect**: every resolved address is tried in order
//!   until one accepts
//! - **Implicit TLS and STARTTLS**: TLS on connect, or an in-place upgrade of
//!   a plaintext session
//! - **Pluggable certificate policy**: a [`CertificateValidator`] sees the
//!   verification verdict and has the final say
//! - **Best-effort diagnostics**: a [`Diagnostics`] sink records traffic and
//!   failures without ever affecting the session
//!
//! ## Quick Start
//!
//! ```ignore
//! use tracklink_net::{Session, TcpClient};
//!
//! #[tokio::main]
//! async fn main() -> tracklink_net::Result<()> {
//!     let mut client = TcpClient::new();
//!     client.connect("pop.example.com", 110, false).await?;
//!     println!("greeting: {}", client.read_line().await?);
//!
//!     client.write_line("STLS").await?;
//!     if client.read_line().await?.starts_with("+OK") {
//!         client.switch_to_secure().await?;
//!         assert!(client.is_secure());
//!     }
//!
//!     client.write_line("QUIT").await?;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Operation States
//!
//! ```text
//! ┌─────────────────┐
//! │ WaitingForStart │ ─── start() ───→ Active
//! └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Active      │ ─── work done ───→ Completed
//! └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    Completed    │ ─── dispose() ───→ Disposed
//! └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`async_op`]: The one-shot operation primitive
//! - [`client`]: The TCP client and its connect/upgrade state machine
//! - [`config`]: Client configuration
//! - [`diagnostics`]: Diagnostics sink
//! - [`resolve`]: Host name resolution
//! - [`session`]: Session abstraction and connected hook
//! - [`stream`]: Plain/TLS transport
//! - [`tls`]: Certificate policy and TLS connector

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod async_op;
pub mod client;
pub mod config;
pub mod diagnostics;
mod error;
pub mod resolve;
pub mod session;
pub mod stream;
pub mod tls;

pub use async_op::{AsyncOp, OpState};
pub use client::{ConnectOp, Established, SwitchToSecureOp, TcpClient};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use diagnostics::{Diagnostics, DiagnosticsError};
pub use error::{Error, Misuse, Result};
pub use resolve::{Resolve, Resolving, StaticResolver, SystemResolver};
pub use session::{ConnectedHook, HookFuture, Session, SessionId, SessionInfo};
pub use stream::{SessionStream, Transport};
pub use tls::{
    CertificateValidator, DefaultValidator, PolicyErrors, StrictValidator, create_tls_connector,
};
