use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "innkeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "innkeeper_query_duration_seconds";

/// Counter: booking admission decisions. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "innkeeper_admissions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeeper_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeeper_wal_flush_batch_size";

/// Counter: journal compactions. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "innkeeper_compactions_total";

/// Install the Prometheus exporter on `addr`. No-op if `addr` is None.
pub fn init(addr: Option<SocketAddr>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(addr) = addr else { return Ok(()) };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertRoom { .. } => "upsert_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectAvailableRooms { .. } => "select_available_rooms",
    }
}
