//! HTTP health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Process is up (always 200 while serving)
//! - `GET /live` - 503 once any dedicated loop has died, so the supervisor
//!   restarts the process
//! - `GET /ready` - 503 unless every loop has started, is running and is not
//!   rebalancing; lists each loop's flags
//! - `GET /metrics` - Prometheus metrics in text format
//!
//! Kubernetes-style aliases `/healthz`, `/livez` and `/readyz` are accepted.
//!
//! # Usage
//!
//! ```rust,no_run
//! use chat_backplane::runtime::HealthRegistry;
//! use chat_backplane::server::health::HealthServer;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(HealthRegistry::new());
//!     let server = HealthServer::new("0.0.0.0:8080", registry).await.unwrap();
//!     server.run(CancellationToken::new()).await.unwrap();
//! }
//! ```

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::runtime::HealthRegistry;

pub struct HealthServer {
    listener: TcpListener,
    registry: Arc<HealthRegistry>,
}

impl HealthServer {
    /// Bind the health server to `addr`, e.g. "0.0.0.0:8080".
    pub async fn new(addr: &str, registry: Arc<HealthRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::IoError(e.kind()))?;

        info!(addr = %addr, "Health server listening");

        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::IoError(e.kind()))
    }

    /// Serve requests until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Health server shutting down");
                    return Ok(());
                }
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((mut stream, addr)) => {
                            debug!(client_addr = %addr, "Health check connection");
                            let registry = Arc::clone(&self.registry);

                            tokio::spawn(async move {
                                let mut buf = [0u8; 1024];
                                match stream.read(&mut buf).await {
                                    Ok(n) if n > 0 => {
                                        let request = String::from_utf8_lossy(&buf[..n]);
                                        let response = handle_request(&request, &registry);
                                        if let Err(e) = stream.write_all(response.as_bytes()).await {
                                            debug!(error = ?e, "Failed to write health response");
                                        }
                                    }
                                    Ok(_) => debug!("Empty request received"),
                                    Err(e) => debug!(error = ?e, "Failed to read health request"),
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = ?e, "Failed to accept health check connection");
                        }
                    }
                }
            }
        }
    }
}

fn handle_request(request: &str, registry: &HealthRegistry) -> String {
    let first_line = request.lines().next().unwrap_or("");
    let path = first_line.split_whitespace().nth(1).unwrap_or("/");

    match path {
        "/health" | "/healthz" | "/health/" => text_response(200, "OK", "status: healthy\n"),
        "/live" | "/livez" | "/live/" => liveness_response(registry),
        "/ready" | "/readyz" | "/ready/" => ready_response(registry),
        "/metrics" => metrics_response(),
        _ => not_found_response(),
    }
}

fn text_response(code: u16, reason: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        code, reason, body
    )
}

fn liveness_response(registry: &HealthRegistry) -> String {
    if registry.is_live() {
        text_response(200, "OK", "status: alive\n")
    } else {
        let mut body = String::from("status: dead\n");
        for status in registry.statuses() {
            if status.started && !status.healthy {
                let _ = writeln!(body, "stopped: {}", status.name);
            }
        }
        text_response(503, "Service Unavailable", &body)
    }
}

fn ready_response(registry: &HealthRegistry) -> String {
    let ready = registry.is_ready();
    let mut body = format!("status: {}\n", if ready { "ready" } else { "not_ready" });
    for status in registry.statuses() {
        let _ = writeln!(
            body,
            "loop: {} started={} healthy={} rebalancing={}",
            status.name, status.started, status.healthy, status.rebalancing
        );
    }

    if ready {
        text_response(200, "OK", &body)
    } else {
        text_response(503, "Service Unavailable", &body)
    }
}

fn metrics_response() -> String {
    match crate::metrics::encode_metrics() {
        Ok(body) => format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            body
        ),
        Err(e) => {
            error!(error = ?e, "Failed to encode metrics");
            text_response(500, "Internal Server Error", "error: failed to encode metrics\n")
        }
    }
}

fn not_found_response() -> String {
    text_response(
        404,
        "Not Found",
        "Available endpoints:\n\
         - /health - Process is up\n\
         - /live - Fails once a consumer loop has died\n\
         - /ready - Fails unless every consumer loop is running and assigned\n\
         - /metrics - Prometheus metrics\n",
    )
}
