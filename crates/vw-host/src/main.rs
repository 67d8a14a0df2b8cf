//! Line-delimited JSON host for the view bridge
//!
//! Reads one JSON message per line from stdin. Messages with a `type` manage
//! bridges (`render`, `teardown`, `relaySignal`, `relayEvent`, `emit`);
//! messages with a `command` are routed onto a bridge by target id. Lines
//! addressed to the same target are handled in the order they arrive. Relayed
//! events and signals are written to stdout, one JSON object per line. Logs
//! go to stderr and are filtered through `RUST_LOG`.

mod host;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vw_core::{BridgeConfig, InboundCommandRouter, Outbound};

use host::{Host, Line};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => BridgeConfig::from_file(&path).with_context(|| format!("loading configuration from {}", path))?,
        None => BridgeConfig::default(),
    };
    config.apply_env().context("applying environment overrides")?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config))
}

async fn run(config: BridgeConfig) -> Result<()> {
    info!(
        interval_ms = config.lookup.interval_ms,
        max_attempts = config.lookup.max_attempts,
        "starting view bridge host"
    );

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_outbound(outbound_rx));

    let host = Arc::new(Host::new(config.clone(), outbound_tx));
    let router =
        Arc::new(InboundCommandRouter::new(Arc::new(host.registry().clone())).with_policy(config.retry_policy()));
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let serving = tokio::spawn(Arc::clone(&host).serve(router, line_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut number = 0usize;
    while let Some(text) = lines.next_line().await? {
        number += 1;
        if text.trim().is_empty() {
            continue;
        }
        match Line::parse(&text) {
            Ok(line) => {
                if line_tx.send(line).is_err() {
                    anyhow::bail!("line handling stopped");
                }
            }
            Err(err) => warn!(line = number, %err, "ignoring malformed message"),
        }
    }

    drop(line_tx);
    let routed = serving.await?;
    host.shutdown().await;
    drop(host);

    writer.await??;
    info!(lines = number, routed, "input closed, host stopped");
    Ok(())
}

async fn write_outbound(mut outbound: mpsc::UnboundedReceiver<Outbound>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = outbound.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
        stdout.flush().await?;
    }
    Ok(())
}
