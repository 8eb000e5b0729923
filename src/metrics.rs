//! Prometheus-compatible metrics endpoint
//!
//! Counters are plain atomics written from the simulation and network
//! threads. Default endpoint: http://localhost:9100/metrics

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Tick samples kept for percentiles
const TICK_HISTORY_LENGTH: usize = 1000;

#[derive(Debug)]
pub struct Metrics {
    // Simulation
    pub tick_count: AtomicU64,
    pub current_tick: AtomicU64,
    pub entity_count: AtomicU64,
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,

    // Network
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub batches_sent: AtomicU64,
    pub batches_compressed: AtomicU64,

    // Synchronisation
    pub inputs_dropped: AtomicU64,
    pub tick_adjustments_sent: AtomicU64,
    pub desync_disconnects: AtomicU64,
    pub mispredictions: AtomicU64,

    start_time: Instant,
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tick_count: AtomicU64::new(0),
            current_tick: AtomicU64::new(0),
            entity_count: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            batches_compressed: AtomicU64::new(0),
            inputs_dropped: AtomicU64::new(0),
            tick_adjustments_sent: AtomicU64::new(0),
            desync_disconnects: AtomicU64::new(0),
            mispredictions: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY_LENGTH)),
        }
    }

    #[inline]
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY_LENGTH {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();
            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("worldsim_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("worldsim_current_tick", "Current simulation tick", "gauge",
            self.current_tick.load(Ordering::Relaxed));
        metric!("worldsim_entities", "Live entities", "gauge",
            self.entity_count.load(Ordering::Relaxed));
        metric!("worldsim_tick_time_microseconds", "Last tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("worldsim_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("worldsim_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));

        metric!("worldsim_connections_active", "Connected clients", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("worldsim_connections_total", "Connections accepted", "counter",
            self.connections_total.load(Ordering::Relaxed));
        metric!("worldsim_messages_sent_total", "Messages sent", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("worldsim_messages_received_total", "Messages received", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("worldsim_bytes_sent_total", "Bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("worldsim_bytes_received_total", "Bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("worldsim_batches_sent_total", "Batches sent", "counter",
            self.batches_sent.load(Ordering::Relaxed));
        metric!("worldsim_batches_compressed_total", "Batches sent lz4 compressed", "counter",
            self.batches_compressed.load(Ordering::Relaxed));

        metric!("worldsim_inputs_dropped_total", "Client inputs outside the sequencer window", "counter",
            self.inputs_dropped.load(Ordering::Relaxed));
        metric!("worldsim_tick_adjustments_total", "Nonzero tick adjustments sent", "counter",
            self.tick_adjustments_sent.load(Ordering::Relaxed));
        metric!("worldsim_desync_disconnects_total", "Connections dropped for protocol desync", "counter",
            self.desync_disconnects.load(Ordering::Relaxed));
        metric!("worldsim_mispredictions_total", "Client mispredictions corrected", "counter",
            self.mispredictions.load(Ordering::Relaxed));
        metric!("worldsim_uptime_seconds", "Uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve `/metrics` and `/health` until the task is dropped
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            if let Err(e) = serve_request(&mut socket, &metrics).await {
                debug!("Metrics request from {} failed: {}", peer, e);
            }
        });
    }
}

/// Answer one HTTP request on `socket`
async fn serve_request<S>(socket: &mut S, metrics: &Metrics) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = [0u8; 1024];
    let n = socket.read(&mut buffer).await?;
    if n == 0 {
        return Ok(());
    }
    let request = String::from_utf8_lossy(&buffer[..n]);
    socket.write_all(http_response(&request, metrics).as_bytes()).await
}

fn http_response(request: &str, metrics: &Metrics) -> String {
    let (content_type, body) = if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_tick_time() {
        let metrics = Metrics::new();
        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) >= 1000);
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.connections_active.store(3, Ordering::Relaxed);
        Metrics::add(&metrics.inputs_dropped, 2);

        let output = metrics.to_prometheus();
        assert!(output.contains("worldsim_connections_active 3"));
        assert!(output.contains("worldsim_inputs_dropped_total 2"));
        assert!(output.contains("# TYPE worldsim_tick_count counter"));
    }

    #[test]
    fn test_http_routes() {
        let metrics = Metrics::new();
        assert!(http_response("GET /metrics HTTP/1.1", &metrics).contains("worldsim_tick_count"));
        assert!(http_response("GET /health HTTP/1.1", &metrics).ends_with("OK"));
        assert!(http_response("GET /nope HTTP/1.1", &metrics).starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_metrics_server_serves_prometheus() {
        let metrics = Arc::new(Metrics::new());
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let server = tokio::spawn(start_metrics_server(metrics, port));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("worldsim_uptime_seconds"));
        server.abort();
    }

    #[test]
    fn test_health_endpoint() {
        let metrics = Metrics::new();
        let mut socket = tokio_test::io::Builder::new()
            .read(b"GET /health HTTP/1.1\r\n\r\n")
            .write(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK")
            .build();
        tokio_test::block_on(serve_request(&mut socket, &metrics)).unwrap();
    }

    #[test]
    fn test_unknown_path_is_404() {
        let metrics = Metrics::new();
        let mut socket = tokio_test::io::Builder::new()
            .read(b"GET /favicon.ico HTTP/1.1\r\n\r\n")
            .write(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .build();
        tokio_test::block_on(serve_request(&mut socket, &metrics)).unwrap();
    }
}
