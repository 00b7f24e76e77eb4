use crate::ops::observability::SinkMetrics;
use crate::session::SessionState;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with reloadable level.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// What the telemetry endpoint reads from.
#[derive(Clone)]
pub struct TelemetrySource {
    pub metrics: Arc<SinkMetrics>,
    pub state: watch::Receiver<SessionState>,
}

/// Start a minimal HTTP endpoint serving `/metrics`, `/healthz` and `/loglevel`.
/// Returns the bound address.
pub async fn start_http(
    bind: &str,
    source: TelemetrySource,
    log_handle: Option<LogHandle>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind telemetry endpoint on {bind}"))?;
    let local = listener.local_addr()?;
    tracing::info!("telemetry endpoint listening on {}", local);
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _addr)) => {
                    let source = source.clone();
                    let log_handle = log_handle.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_conn(&mut socket, source, log_handle).await {
                            tracing::warn!("telemetry handler error: {err:?}");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!("telemetry accept error: {err:?}");
                }
            }
        }
    });
    Ok(local)
}

async fn handle_conn(
    socket: &mut tokio::net::TcpStream,
    source: TelemetrySource,
    log_handle: Option<LogHandle>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first = req.lines().next().unwrap_or("");
    let target = first.split_whitespace().nth(1).unwrap_or("/");
    let (route, query) = target.split_once('?').unwrap_or((target, ""));
    let (status, body, content_type) = match route {
        "/metrics" => (200, source.metrics.render_prometheus(), "text/plain"),
        "/healthz" => {
            let state = *source.state.borrow();
            let status = if state == SessionState::Connected { 200 } else { 503 };
            (
                status,
                format!("{{\"session\":\"{}\"}}", state.as_str()),
                "application/json",
            )
        }
        "/loglevel" => match (log_handle, query.strip_prefix("level=")) {
            (Some(handle), Some(level)) => match EnvFilter::try_new(level) {
                Ok(filter) => {
                    let _ = handle.modify(|f| *f = filter);
                    (200, "{\"status\":\"ok\"}".to_string(), "application/json")
                }
                Err(_) => (
                    400,
                    "{\"status\":\"invalid level\"}".to_string(),
                    "application/json",
                ),
            },
            _ => (
                400,
                "{\"status\":\"unavailable\"}".to_string(),
                "application/json",
            ),
        },
        _ => (404, "not found".to_string(), "text/plain"),
    };
    let resp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
        status,
        reason_phrase(status),
        content_type,
        body.len(),
        body
    );
    socket.write_all(resp.as_bytes()).await?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "",
    }
}
