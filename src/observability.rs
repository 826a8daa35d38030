use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "innkeep_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "innkeep_request_duration_seconds";

/// Histogram: all-rooms availability search latency in seconds.
pub const SEARCH_DURATION_SECONDS: &str = "innkeep_search_duration_seconds";

/// Counter: reservations committed.
pub const BOOKINGS_TOTAL: &str = "innkeep_bookings_total";

/// Counter: commits rejected because the room was taken in the meantime.
pub const BOOKING_CONFLICTS_TOTAL: &str = "innkeep_booking_conflicts_total";

/// Counter: store operations that hit the deadline.
pub const STORE_TIMEOUTS_TOTAL: &str = "innkeep_store_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeep_connections_rejected_total";

/// Counter: failed staff logins.
pub const AUTH_FAILURES_TOTAL: &str = "innkeep_auth_failures_total";

/// Counter: mail messages queued for delivery.
pub const MAIL_ENQUEUED_TOTAL: &str = "innkeep_mail_enqueued_total";

/// Counter: mail messages rejected (queue full or closed).
pub const MAIL_REJECTED_TOTAL: &str = "innkeep_mail_rejected_total";

/// Counter: idle sessions expired by the reaper.
pub const SESSIONS_REAPED_TOTAL: &str = "innkeep_sessions_reaped_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeep_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
