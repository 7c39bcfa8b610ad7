//! Prometheus-compatible metrics endpoint
//!
//! Exposes session server metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Power-of-two latency buckets; bucket `i` holds durations below `2^i` us
const EVENT_TIME_BUCKETS: usize = 32;

/// Metrics registry for the session server
#[derive(Debug)]
pub struct Metrics {
    // Sessions
    pub sessions_created: AtomicU64,
    pub sessions_active: AtomicU64,
    pub sessions_evicted: AtomicU64,
    pub games_completed: AtomicU64,

    // Connections
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,

    // Actor events
    pub events_processed: AtomicU64,
    pub actions_committed: AtomicU64,
    pub actions_rejected: AtomicU64,
    pub actions_busy: AtomicU64,

    // Outbound delivery
    pub messages_sent: AtomicU64,
    pub messages_dropped: AtomicU64,

    // Event handling time (microseconds)
    pub event_time_max_us: AtomicU64,
    event_time_buckets: [AtomicU64; EVENT_TIME_BUCKETS],

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_created: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            games_completed: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            actions_committed: AtomicU64::new(0),
            actions_rejected: AtomicU64::new(0),
            actions_busy: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            event_time_max_us: AtomicU64::new(0),
            event_time_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Record how long an actor took to handle one event.
    ///
    /// Called by every session actor, so it only touches atomics.
    pub fn record_event_time(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.events_processed.fetch_add(1, Ordering::Relaxed);

        let bucket = (u64::BITS - us.leading_zeros()) as usize;
        self.event_time_buckets[bucket.min(EVENT_TIME_BUCKETS - 1)].fetch_add(1, Ordering::Relaxed);
        self.event_time_max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Upper bound of the bucket holding the `quantile` sample, capped at the
    /// observed maximum. Zero until something was recorded.
    pub fn event_time_percentile_us(&self, quantile: f64) -> u64 {
        let counts: Vec<u64> = self
            .event_time_buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0;
        }

        let rank = ((total as f64 * quantile.clamp(0.0, 1.0)).ceil() as u64).max(1);
        let max = self.event_time_max_us.load(Ordering::Relaxed);
        let mut seen = 0;
        for (i, count) in counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                let upper = match i {
                    0 => 0,
                    i if i == EVENT_TIME_BUCKETS - 1 => max,
                    i => (1u64 << i) - 1,
                };
                return upper.min(max);
            }
        }
        max
    }

    pub fn connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturates at zero
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("pig_arena_sessions_created_total", "Sessions created", "counter",
            self.sessions_created.load(Ordering::Relaxed));
        metric!("pig_arena_sessions_active", "Sessions registered in the directory", "gauge",
            self.sessions_active.load(Ordering::Relaxed));
        metric!("pig_arena_sessions_evicted_total", "Sessions removed by the sweeper", "counter",
            self.sessions_evicted.load(Ordering::Relaxed));
        metric!("pig_arena_games_completed_total", "Games that reached game over", "counter",
            self.games_completed.load(Ordering::Relaxed));

        metric!("pig_arena_connections_active", "Open participant connections", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("pig_arena_connections_total", "Participant connections accepted", "counter",
            self.connections_total.load(Ordering::Relaxed));

        metric!("pig_arena_events_processed_total", "Events handled by session actors", "counter",
            self.events_processed.load(Ordering::Relaxed));
        metric!("pig_arena_actions_committed_total", "Roll and hold actions applied", "counter",
            self.actions_committed.load(Ordering::Relaxed));
        metric!("pig_arena_actions_rejected_total", "Actions rejected by game rules", "counter",
            self.actions_rejected.load(Ordering::Relaxed));
        metric!("pig_arena_actions_busy_total", "Actions refused because a session mailbox was full", "counter",
            self.actions_busy.load(Ordering::Relaxed));

        metric!("pig_arena_messages_sent_total", "Messages queued to connections", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("pig_arena_messages_dropped_total", "Messages dropped on full connection mailboxes", "counter",
            self.messages_dropped.load(Ordering::Relaxed));

        metric!("pig_arena_event_time_p95_microseconds", "95th percentile event handling time", "gauge",
            self.event_time_percentile_us(0.95));
        metric!("pig_arena_event_time_p99_microseconds", "99th percentile event handling time", "gauge",
            self.event_time_percentile_us(0.99));
        metric!("pig_arena_event_time_max_microseconds", "Maximum event handling time since start", "gauge",
            self.event_time_max_us.load(Ordering::Relaxed));
        metric!("pig_arena_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// JSON view of the same counters
    pub fn to_json(&self) -> String {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        json!({
            "sessions": {
                "created": load(&self.sessions_created),
                "active": load(&self.sessions_active),
                "evicted": load(&self.sessions_evicted),
                "completed": load(&self.games_completed),
            },
            "connections": {
                "active": load(&self.connections_active),
                "total": load(&self.connections_total),
            },
            "actions": {
                "events": load(&self.events_processed),
                "committed": load(&self.actions_committed),
                "rejected": load(&self.actions_rejected),
                "busy": load(&self.actions_busy),
            },
            "messages": {
                "sent": load(&self.messages_sent),
                "dropped": load(&self.messages_dropped),
            },
            "performance": {
                "event_time_p95_us": self.event_time_percentile_us(0.95),
                "event_time_p99_us": self.event_time_percentile_us(0.99),
                "event_time_max_us": load(&self.event_time_max_us),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let response = if request.starts_with("GET /metrics/json")
                        || request.starts_with("GET /json")
                    {
                        http_response("200 OK", "application/json", &metrics.to_json())
                    } else if request.starts_with("GET /metrics") {
                        http_response(
                            "200 OK",
                            "text/plain; version=0.0.4",
                            &metrics.to_prometheus(),
                        )
                    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
                        http_response("200 OK", "text/plain", "OK")
                    } else {
                        http_response("404 Not Found", "text/plain", "")
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
