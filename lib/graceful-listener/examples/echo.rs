//! An echo server that drains its connections on ctrl-c.
//!
//! ```sh
//! cargo run --example echo -- [config.toml]
//! ```
//!
//! The optional config file holds a [ShutdownConfig], for example `timeout = "10s"`.

use std::sync::Arc;

use anyhow::{Context, Result};
use graceful_listener::signal::shutdown_stream;
use graceful_listener::{upgrade, ShutdownConfig, ShutdownError, TcpTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config from {path}"))?;
            toml::from_str(&raw).context("Failed to parse shutdown config")?
        },
        None => ShutdownConfig::default(),
    };

    let ln = Arc::new(upgrade(TcpTransport::bind("127.0.0.1:4230").await?));
    info!("Echo server listening on {}", ln.local_addr()?);

    let accept_loop = tokio::spawn({
        let ln = ln.clone();
        async move {
            loop {
                let (mut conn, addr) = match ln.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        info!("Stopped accepting: {e}");
                        break;
                    },
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) => break,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            },
                            Err(e) => {
                                warn!("Read from {addr} failed: {e}");
                                break;
                            },
                        }
                    }
                    if let Err(e) = conn.close().await {
                        warn!("Closing {addr} failed: {e}");
                    }
                });
            }
        }
    });

    shutdown_stream().await?;

    match ln.graceful_shutdown_with(&config).await {
        Ok(()) => info!("All connections finished"),
        Err(ShutdownError::Timeout { remaining }) => {
            warn!("Forcing shutdown with {remaining} connection(s) still open");
            ln.shutdown()?;
        },
        Err(e) => {
            error!("Graceful shutdown failed: {e}");
            if !ln.is_closed() {
                ln.shutdown()?;
            }
        },
    }

    accept_loop.await?;
    Ok(())
}
