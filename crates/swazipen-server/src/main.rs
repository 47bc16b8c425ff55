//! SwaziPen terminal server.
//!
//! Run with: swazipen <project-dir>
//!
//! Then open http://localhost:5000 in your browser.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{response::Html, routing::get};
use clap::Parser;
use swazipen_executor::RuntimeCommand;
use swazipen_transport::{AppState, router};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Args;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let ctx = args.project_context()?;
    warn_if_runtime_missing(&ctx.runtime).await;
    tracing::info!(
        root = %ctx.root().display(),
        runtime = %ctx.runtime.command,
        policy = ?ctx.run_policy,
        "Project loaded"
    );

    let app = router(AppState::new(Arc::new(ctx)))
        .route("/", get(index_handler))
        .layer(CorsLayer::permissive());

    let addr = args.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn warn_if_runtime_missing(runtime: &swazipen_core::RuntimeConfig) {
    let program = match RuntimeCommand::from_config(runtime).build_repl() {
        Ok(parts) => parts.program,
        Err(error) => {
            tracing::warn!(%error, "Runtime command is invalid; sessions will fail to start");
            return;
        }
    };
    if swazipen_pty::resolve_executable_path(&program).await.is_none() {
        tracing::warn!(%program, "Runtime not found; sessions will fail until it is installed");
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<meta charset="utf-8">
<title>SwaziPen</title>
<link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/xterm@5.3.0/css/xterm.css">
<script src="https://cdn.jsdelivr.net/npm/xterm@5.3.0/lib/xterm.js"></script>
<div id="term"></div>
<script>
const term = new Terminal();
term.open(document.getElementById('term'));
const ws = new WebSocket(`${location.protocol === 'https:' ? 'wss' : 'ws'}://${location.host}/ws`);
const bytes = (s) => btoa(String.fromCharCode(...new TextEncoder().encode(s)));
const send = (type, payload) => ws.send(JSON.stringify({ type, id: 'repl', payload }));

ws.onopen = () => send('create', { mode: 'repl', cols: term.cols, rows: term.rows });
ws.onmessage = ({ data }) => {
  const { type, payload } = JSON.parse(data);
  if (type === 'data') term.write(Uint8Array.from(atob(payload.data), (c) => c.charCodeAt(0)));
  if (type === 'exit') term.write(`\r\n[exit ${payload.signal ?? payload.code}]\r\n`);
  if (type === 'error') term.write(`\r\n[error] ${payload.message}\r\n`);
};
term.onData((d) => send('input', { data: bytes(d) }));
term.onResize(({ cols, rows }) => send('resize', { cols, rows }));
</script>
"#;
