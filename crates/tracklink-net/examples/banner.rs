#![allow(clippy::doc_markdown, clippy::uninlined_format_args)]
//! Example: Read a line-based mail server banner
//!
//! Connects, prints the greeting and, when asked, upgrades the session with
//! `STLS`/`STARTTLS` before sending `QUIT`.
//!
//! ## Running
//!
//! ```bash
//! # POP3 over implicit TLS
//! cargo run --package tracklink-net --example banner -- pop.gmail.com 995 tls
//!
//! # POP3 with STARTTLS
//! cargo run --package tracklink-net --example banner -- pop.example.com 110 stls
//!
//! # SMTP with STARTTLS
//! RUST_LOG=tracklink_net=debug cargo run --package tracklink-net --example banner -- smtp.example.com 587 starttls
//! ```

use anyhow::{Context, bail};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracklink_net::{Session, TcpClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tracklink_net=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let Some(host) = args.next() else {
        bail!("usage: banner <host> <port> [tls|stls|starttls]");
    };
    let port: u16 = args
        .next()
        .context("missing port")?
        .parse()
        .context("invalid port")?;
    let mode = args.next().unwrap_or_default();

    println!("Connecting to {}:{}...", host, port);
    let mut client = TcpClient::new();
    client.connect(&host, port, mode == "tls").await?;
    let info = client.info()?;
    println!(
        "✓ Connected {} -> {} ({})",
        info.local_addr, info.remote_addr, info.id
    );
    println!("< {}", client.read_line().await?);

    if mode == "stls" || mode == "starttls" {
        let command = mode.to_uppercase();
        if command == "STARTTLS" {
            // SMTP wants a greeting before STARTTLS.
            client.write_line("EHLO tracklink.local").await?;
            loop {
                let line = client.read_line().await?;
                println!("< {}", line);
                if !line.starts_with("250-") {
                    break;
                }
            }
        }
        client.write_line(&command).await?;
        let reply = client.read_line().await?;
        println!("< {}", reply);
        if reply.starts_with('-') || reply.starts_with('4') || reply.starts_with('5') {
            bail!("server refused {}", command);
        }
        client.switch_to_secure().await?;
        println!("✓ Upgraded to TLS");
    }

    println!("  secure: {}", client.is_secure());
    client.write_line("QUIT").await?;
    if let Ok(line) = client.read_line().await {
        println!("< {}", line);
    }
    client.disconnect().await?;
    client.dispose().await;
    println!("✓ Done");
    Ok(())
}
