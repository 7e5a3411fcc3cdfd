use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "rackbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "rackbook_request_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: successful submissions. Labels: side, late.
pub const SUBMISSIONS_TOTAL: &str = "rackbook_submissions_total";

/// Counter: engine operations refused. Labels: kind.
pub const REJECTIONS_TOTAL: &str = "rackbook_rejections_total";

/// Counter: admin pushes through the hard restriction.
pub const OVERRIDES_TOTAL: &str = "rackbook_hard_restriction_overrides_total";

/// Counter: mail/task deliveries that failed. Labels: collaborator.
pub const DOWNSTREAM_FAILURES_TOTAL: &str = "rackbook_downstream_failures_total";

/// Counter: compensating template deletes. Labels: result.
pub const ROLLBACKS_TOTAL: &str = "rackbook_rollbacks_total";

/// Histogram: instances materialized per submission.
pub const INSTANCES_PER_SUBMISSION: &str = "rackbook_instances_per_submission";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rackbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rackbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rackbook_connections_rejected_total";

/// Counter: WAL compactions run by the background task.
pub const WAL_COMPACTIONS_TOTAL: &str = "rackbook_wal_compactions_total";

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
