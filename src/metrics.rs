//! Prometheus-format counters for the honeypot and a tiny HTTP endpoint serving them.

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Upper bucket bounds in seconds; +Inf is reported from the count.
const DURATION_BUCKETS: [f64; 11] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Non-cumulative buckets, a count and a sum in microseconds.
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub connections_total: AtomicU64,
    /// Frames that failed BER decoding or had no readable envelope.
    pub decode_errors: AtomicU64,
    /// Requests no handler claimed.
    pub unclaimed_requests: AtomicU64,
    pub bind_success: AtomicU64,
    pub bind_failure: AtomicU64,
    pub starttls_upgrades: AtomicU64,
    requests: DashMap<String, AtomicU64>,
    durations: DashMap<String, DurationHistogram>,
}

/// Request types with their own series. Anything else, including the raw tag of an
/// unknown opcode, is counted as "unknown" so peers cannot grow the label set.
const REQUEST_TYPES: [&str; 11] = [
    "bind",
    "unbind",
    "search",
    "modify",
    "add",
    "delete",
    "modify-dn",
    "compare",
    "abandon",
    "extended",
    "extended.tls",
];

fn request_label(request_type: &str) -> &'static str {
    REQUEST_TYPES
        .iter()
        .find(|t| **t == request_type)
        .copied()
        .unwrap_or("unknown")
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_unclaimed(&self) {
        self.unclaimed_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_starttls(&self) {
        self.starttls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bind(&self, success: bool) {
        let counter = if success {
            &self.bind_success
        } else {
            &self.bind_failure
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one request of `request_type` and how long it took to answer.
    pub fn record_request(&self, request_type: &str, duration: Duration) {
        let label = request_label(request_type);
        self.requests
            .entry(label.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        self.durations
            .entry(label.to_string())
            .or_default()
            .observe(duration);
    }

    pub fn requests(&self, request_type: &str) -> u64 {
        self.requests
            .get(request_type)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, help, value) in [
            ("connections_total", "Total number of client connections accepted.", &self.connections_total),
            ("decode_errors_total", "Total number of undecodable LDAP messages.", &self.decode_errors),
            ("unclaimed_requests_total", "Requests no handler answered.", &self.unclaimed_requests),
            ("starttls_upgrades_total", "Connections upgraded with StartTLS.", &self.starttls_upgrades),
        ] {
            out.push_str(&format!("# HELP ldap_honeypot_{} {}\n", name, help));
            out.push_str(&format!("# TYPE ldap_honeypot_{} counter\n", name));
            out.push_str(&format!("ldap_honeypot_{} {}\n", name, value.load(Ordering::Relaxed)));
        }

        out.push_str("# HELP ldap_honeypot_binds_total Simple binds by outcome.\n");
        out.push_str("# TYPE ldap_honeypot_binds_total counter\n");
        out.push_str(&format!(
            "ldap_honeypot_binds_total{{result=\"success\"}} {}\n",
            self.bind_success.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "ldap_honeypot_binds_total{{result=\"failure\"}} {}\n",
            self.bind_failure.load(Ordering::Relaxed)
        ));

        let mut types: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        types.sort();

        out.push_str("# HELP ldap_honeypot_requests_total Total LDAP requests by request type.\n");
        out.push_str("# TYPE ldap_honeypot_requests_total counter\n");
        for t in &types {
            out.push_str(&format!(
                "ldap_honeypot_requests_total{{type=\"{}\"}} {}\n",
                escape_label(t),
                self.requests(t)
            ));
        }

        out.push_str("# HELP ldap_honeypot_request_duration_seconds Time to answer a request, by request type.\n");
        out.push_str("# TYPE ldap_honeypot_request_duration_seconds histogram\n");
        for t in &types {
            let Some(hist) = self.durations.get(t) else {
                continue;
            };
            let label = escape_label(t);
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_honeypot_request_duration_seconds_bucket{{type=\"{}\",le=\"{}\"}} {}\n",
                    label, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_honeypot_request_duration_seconds_bucket{{type=\"{}\",le=\"+Inf\"}} {}\n",
                label, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_honeypot_request_duration_seconds_sum{{type=\"{}\"}} {}\n",
                label, sum_secs
            ));
            out.push_str(&format!(
                "ldap_honeypot_request_duration_seconds_count{{type=\"{}\"}} {}\n",
                label, count
            ));
        }

        out
    }
}

/// Path from an HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let mut parts = first_line.trim().split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

fn http_response(path: &str, metrics: &Metrics) -> String {
    let (status, body) = match path {
        "/health" => ("200 OK", "ok".to_string()),
        "/metrics" => ("200 OK", metrics.render()),
        _ => ("404 Not Found", "Not found. Supported: GET /metrics, GET /health.\n".to_string()),
    };
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Serve GET /metrics and GET /health until `cancel` fires.
pub async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>, cancel: CancellationToken) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health)", socket_addr);

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (mut stream, _peer) = match accepted {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");
            let response = http_response(path, &metrics);
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
