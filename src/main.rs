//! # wsmux
//!
//! Echo/broadcast WebSocket server: every message goes back to its sender and
//! to every open connection. The text `close` closes the sender; `quit` or
//! Ctrl-C shuts the server down.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use tracing::{debug, info, warn};
use wsmux_core::ConnectionEvent;
use wsmux_core::event::CLOSE_NORMAL;
use wsmux_server::{MergedEvent, Message, WsServer, load_config, serve};
use wsmux_telemetry::{TelemetryConfig, init_telemetry};

/// wsmux echo/broadcast server.
#[derive(Parser, Debug)]
#[command(name = "wsmux", about = "Echo/broadcast WebSocket server")]
struct Cli {
    /// JSON config file (missing file means defaults).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        json: cli.json_logs,
        ..TelemetryConfig::default()
    })?;

    let mut config = load_config(cli.config.as_deref()).context("failed to load config")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let server = serve(config).await.context("failed to start server")?;
    let mut events = server.events()?;
    info!(url = %format!("ws://{}", server.local_addr()), "wsmux ready");

    let signal_server = server.clone();
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            signal_server.close().await;
        }
    });

    while let Some(merged) = events.next().await {
        handle(&server, merged).await;
    }

    server.close().await;
    info!("wsmux stopped");
    Ok(())
}

async fn handle(server: &WsServer, merged: MergedEvent) {
    let MergedEvent { connection, event } = merged;
    let conn_id = connection.id();

    match event {
        ConnectionEvent::Ping(body) | ConnectionEvent::Pong(body) => {
            debug!(%conn_id, len = body.len(), "ping/pong");
        }
        ConnectionEvent::Close { code, reason } => {
            info!(%conn_id, code, reason = %reason, "closed by peer");
        }
        event => {
            match &event {
                ConnectionEvent::Text(text) => info!(%conn_id, text = %text, "text"),
                ConnectionEvent::Binary(data) => info!(%conn_id, len = data.len(), "binary"),
                _ => {}
            }
            let quit = matches!(&event, ConnectionEvent::Text(t) if t == "quit");
            let close = matches!(&event, ConnectionEvent::Text(t) if t == "close");

            let Ok(message) = Message::try_from(event) else {
                return;
            };
            if let Err(error) = connection.send(message.clone()) {
                warn!(%conn_id, %error, "echo failed");
            }
            let _ = server.broadcast(message);

            if close {
                if let Err(error) = connection.close(CLOSE_NORMAL, "closed on request").await {
                    warn!(%conn_id, %error, "close failed");
                }
            } else if quit {
                server.close().await;
            }
        }
    }
}
