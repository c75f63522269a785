use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "agenda_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "agenda_query_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: appointments booked.
pub const APPOINTMENTS_BOOKED_TOTAL: &str = "agenda_appointments_booked_total";

/// Counter: writes rejected because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "agenda_slot_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "agenda_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "agenda_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "agenda_connections_rejected_total";

/// Gauge: number of registered tenants.
pub const TENANTS_ACTIVE: &str = "agenda_tenants_active";

/// Counter: sessions refused after authentication (bad tenant database).
pub const AUTH_FAILURES_TOTAL: &str = "agenda_auth_failures_total";

/// Counter: bounded waits on a tenant lock or the WAL queue that expired.
pub const STORE_TIMEOUTS_TOTAL: &str = "agenda_store_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "agenda_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "agenda_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "agenda_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
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
        Command::InsertTenant { .. } => "insert_tenant",
        Command::UpdateTenant { .. } => "update_tenant",
        Command::DeleteTenant { .. } => "delete_tenant",
        Command::InsertClient { .. } => "insert_client",
        Command::UpdateClient { .. } => "update_client",
        Command::DeleteClient { .. } => "delete_client",
        Command::InsertService { .. } => "insert_service",
        Command::UpdateService { .. } => "update_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::DeleteAppointment { .. } => "cancel_appointment",
        Command::SelectTenants { .. } => "select_tenants",
        Command::SelectClients { .. } => "select_clients",
        Command::SelectServices { .. } => "select_services",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectDayWindow { .. } => "select_day_window",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
