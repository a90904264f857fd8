//! Health probe endpoint
//!
//! `GET /healthz` answers while the process serves requests. `GET /readyz`
//! answers 200 only while every registered controller is watching; a
//! controller whose stream ended turns the operator unready again.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Running state per controller
#[derive(Debug, Default)]
pub struct Readiness {
    controllers: DashMap<&'static str, bool>,
}

impl Readiness {
    /// Registers `controllers` as not running yet
    pub fn new(controllers: &[&'static str]) -> Self {
        let readiness = Self::default();
        for name in controllers {
            readiness.controllers.insert(*name, false);
        }
        readiness
    }

    pub fn set_running(&self, controller: &'static str, running: bool) {
        self.controllers.insert(controller, running);
    }

    pub fn is_ready(&self) -> bool {
        !self.controllers.is_empty() && self.controllers.iter().all(|c| *c.value())
    }

    /// Registered controllers that are not running, sorted
    pub fn waiting_for(&self) -> Vec<&'static str> {
        let mut waiting: Vec<&'static str> = self
            .controllers
            .iter()
            .filter(|c| !*c.value())
            .map(|c| *c.key())
            .collect();
        waiting.sort_unstable();
        waiting
    }
}

fn http_response(status: &str, body: serde_json::Value) -> String {
    let body = body.to_string();
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Response for the request line of a probe
pub fn respond(request_line: &str, readiness: &Readiness) -> String {
    let mut parts = request_line.split_whitespace();
    let (method, path) = (parts.next(), parts.next());

    match (method, path) {
        (Some("GET"), Some("/healthz")) => {
            http_response("200 OK", serde_json::json!({ "status": "ok" }))
        }
        (Some("GET"), Some("/readyz")) if readiness.is_ready() => {
            http_response("200 OK", serde_json::json!({ "ready": true }))
        }
        (Some("GET"), Some("/readyz")) => http_response(
            "503 Service Unavailable",
            serde_json::json!({ "ready": false, "waitingFor": readiness.waiting_for() }),
        ),
        _ => http_response("404 Not Found", serde_json::json!({ "error": "not found" })),
    }
}

/// Serves the probes until the listener fails
pub async fn serve(addr: SocketAddr, readiness: Arc<Readiness>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Health probes listening on /healthz and /readyz");

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let readiness = readiness.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            match socket.read(&mut buf).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let request_line = request.lines().next().unwrap_or_default();
                    debug!(%peer, request = request_line, "Health probe");

                    let response = respond(request_line, &readiness);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        warn!(%peer, error = %e, "Failed to send health response");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(%peer, error = %e, "Health probe socket error"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_once_every_controller_runs() {
        let readiness = Readiness::new(&["kvmcluster", "pod"]);
        assert!(!readiness.is_ready());
        assert_eq!(readiness.waiting_for(), vec!["kvmcluster", "pod"]);

        readiness.set_running("pod", true);
        assert_eq!(readiness.waiting_for(), vec!["kvmcluster"]);

        readiness.set_running("kvmcluster", true);
        assert!(readiness.is_ready());

        readiness.set_running("pod", false);
        assert!(!readiness.is_ready());
    }

    #[test]
    fn test_nothing_registered_is_not_ready() {
        assert!(!Readiness::default().is_ready());
    }

    #[test]
    fn test_probe_responses() {
        let readiness = Readiness::new(&["kvmcluster"]);

        let live = respond("GET /healthz HTTP/1.1", &readiness);
        assert!(live.starts_with("HTTP/1.1 200 OK\r\n"));

        let unready = respond("GET /readyz HTTP/1.1", &readiness);
        assert!(unready.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(unready.ends_with(r#"{"ready":false,"waitingFor":["kvmcluster"]}"#));

        readiness.set_running("kvmcluster", true);
        let ready = respond("GET /readyz HTTP/1.1", &readiness);
        assert!(ready.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(ready.contains("Content-Length: 14\r\n"));

        assert!(respond("POST /readyz HTTP/1.1", &readiness).starts_with("HTTP/1.1 404"));
        assert!(respond("", &readiness).starts_with("HTTP/1.1 404"));
    }
}
