use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "salond_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "salond_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (`created` or a refusal reason).
pub const BOOKINGS_TOTAL: &str = "salond_bookings_total";

/// Counter: status transitions. Labels: status, outcome.
pub const TRANSITIONS_TOTAL: &str = "salond_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "salond_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "salond_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "salond_connections_rejected_total";

/// Gauge: salons with a loaded engine.
pub const SALONS_ACTIVE: &str = "salond_salons_active";

/// Counter: logins with a malformed identity.
pub const AUTH_FAILURES_TOTAL: &str = "salond_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "salond_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "salond_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None. A
/// failed install is logged and the server runs without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertTransition { .. } => "insert_transition",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::SelectServices { .. } => "select_services",
        Command::InsertStaff { .. } => "insert_staff",
        Command::DeleteStaff { .. } => "delete_staff",
        Command::SelectStaff { .. } => "select_staff",
        Command::InsertPolicy { .. } => "insert_policy",
        Command::SelectPolicy => "select_policy",
    }
}
