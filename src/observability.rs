use std::net::SocketAddr;

use crate::engine::EngineError;

// ── Request-driven metrics ──────────────────────────────────────

/// Counter: register calls. Labels: outcome.
pub const REGISTRATIONS_TOTAL: &str = "holdfast_registrations_total";

/// Counter: confirm calls. Labels: outcome.
pub const CONFIRMATIONS_TOTAL: &str = "holdfast_confirmations_total";

/// Counter: cancel calls. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "holdfast_cancellations_total";

/// Histogram: atomic unit latency in seconds, lock wait included. Labels: operation.
pub const UNIT_DURATION_SECONDS: &str = "holdfast_unit_duration_seconds";

// ── Reclaimer ───────────────────────────────────────────────────

/// Counter: pending holds released by the reclaimer.
pub const HOLDS_RECLAIMED_TOTAL: &str = "holdfast_holds_reclaimed_total";

/// Counter: reclaim candidates that failed with something other than a lost race.
pub const RECLAIM_FAILURES_TOTAL: &str = "holdfast_reclaim_failures_total";

/// Histogram: reclaim cycle duration in seconds.
pub const RECLAIM_CYCLE_DURATION_SECONDS: &str = "holdfast_reclaim_cycle_duration_seconds";

// ── Store ───────────────────────────────────────────────────────

/// Gauge: number of events.
pub const EVENTS_ACTIVE: &str = "holdfast_events_active";

/// Counter: invariant violations detected. Any non-zero value should page.
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "holdfast_invariant_violations_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "holdfast_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (units per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "holdfast_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(
    port: Option<u16>,
) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map an operation result to a short label for metrics.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::SoldOut(_)) => "sold_out",
        Err(EngineError::AlreadyRegistered(_)) => "already_registered",
        Err(EngineError::Expired(_)) => "expired",
        Err(EngineError::WrongHolder(_)) => "wrong_holder",
        Err(EngineError::NotPending { .. }) => "not_pending",
        Err(EngineError::InvalidInput(_)) => "invalid_input",
        Err(EngineError::LimitExceeded(_)) => "limit_exceeded",
        Err(EngineError::TransientStore(_)) => "transient_store",
        Err(EngineError::InvariantViolation(_)) => "invariant_violation",
    }
}
