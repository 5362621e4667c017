use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "seatd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "seatd_query_duration_seconds";

/// Counter: booking operations refused by a business rule. Labels: rule.
pub const BOOKING_REJECTIONS_TOTAL: &str = "seatd_booking_rejections_total";

// ── Background work ─────────────────────────────────────────────

/// Counter: transitions applied by the expiration sweep. Labels: transition.
pub const SWEEP_TRANSITIONS_TOTAL: &str = "seatd_sweep_transitions_total";

/// Histogram: duration of a full sweep pass in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "seatd_sweep_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "seatd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "seatd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "seatd_connections_rejected_total";

/// Gauge: number of loaded sites.
pub const SITES_ACTIVE: &str = "seatd_sites_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "seatd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatd_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSeat { .. } => "insert_seat",
        Command::SetMaintenance { on: true, .. } => "start_maintenance",
        Command::SetMaintenance { on: false, .. } => "end_maintenance",
        Command::InsertBooking { .. } => "insert_booking",
        Command::ConfirmAttendance { .. } => "confirm_attendance",
        Command::StartBreak { .. } => "start_break",
        Command::EndBreak { .. } => "end_break",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectSeats { .. } => "select_seats",
    }
}
