use super::metrics::MetricsRegistry;
use crate::connections::ConnectionRegistry;
use crate::core::ShutdownState;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
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

/// What the operational endpoint reads from.
pub struct TelemetryState {
    pub metrics: Arc<MetricsRegistry>,
    pub shutdown: Arc<ShutdownState>,
    pub registry: Arc<ConnectionRegistry>,
}

/// Start a minimal HTTP endpoint serving metrics, health, and loglevel controls.
pub async fn start_http(
    bind: &str,
    state: Arc<TelemetryState>,
    log_handle: Option<LogHandle>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind telemetry endpoint on {bind}"))?;
    let addr = listener.local_addr().context("telemetry local addr")?;
    tracing::info!("telemetry endpoint listening on {}", addr);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((mut socket, _)) => {
                        let state = state.clone();
                        let log_handle = log_handle.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_conn(&mut socket, &state, log_handle).await {
                                tracing::warn!("telemetry handler error: {err:?}");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!("telemetry accept error: {err:?}");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
    Ok((addr, handle))
}

async fn handle_conn(
    socket: &mut TcpStream,
    state: &TelemetryState,
    log_handle: Option<LogHandle>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first = req.lines().next().unwrap_or("");
    let target = first.split_whitespace().nth(1).unwrap_or("/");
    let (route, query) = target.split_once('?').unwrap_or((target, ""));
    let (status, body, content_type) = match route {
        "/metrics" => (200, collect_metrics(state), "text/plain; version=0.0.4"),
        "/readyz" => readyz(state),
        "/livez" => livez(),
        "/v1/loglevel" => set_log_level(query, log_handle.as_ref()),
        _ => (404, "not found".to_string(), "text/plain"),
    };
    let resp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
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
        _ => "Unknown",
    }
}

fn collect_metrics(state: &TelemetryState) -> String {
    state.metrics.gauge_set(
        "courier_registry_sessions",
        state.registry.len() as i64,
        &[],
    );
    state.metrics.gauge_set(
        "courier_draining",
        i64::from(state.shutdown.is_draining()),
        &[],
    );
    state.metrics.render_prometheus()
}

pub fn readyz(state: &TelemetryState) -> (u16, String, &'static str) {
    let draining = state.shutdown.is_draining();
    let code = if draining { 503 } else { 200 };
    let body = format!(
        "{{\"ready\":{},\"draining\":{},\"sessions\":{}}}",
        !draining,
        draining,
        state.registry.len()
    );
    (code, body, "application/json")
}

pub fn livez() -> (u16, String, &'static str) {
    (200, "{\"live\":true}".to_string(), "application/json")
}

fn set_log_level(query: &str, handle: Option<&LogHandle>) -> (u16, String, &'static str) {
    let Some(level) = query
        .split('&')
        .find_map(|part| part.strip_prefix("level="))
    else {
        return (400, "{\"status\":\"missing level\"}".to_string(), "application/json");
    };
    let Ok(filter) = EnvFilter::try_new(level) else {
        return (400, "{\"status\":\"invalid level\"}".to_string(), "application/json");
    };
    let unavailable = (
        503,
        "{\"status\":\"log reload unavailable\"}".to_string(),
        "application/json",
    );
    let Some(handle) = handle else {
        return unavailable;
    };
    match handle.modify(|f| *f = filter) {
        Ok(()) => {
            tracing::info!(level, "log level changed");
            (200, "{\"status\":\"ok\"}".to_string(), "application/json")
        }
        Err(err) => {
            tracing::warn!("log level reload failed: {err}");
            unavailable
        }
    }
}
