use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command.
pub const QUERIES_TOTAL: &str = "intake_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "intake_query_duration_seconds";

/// Counter: bookings committed through the transactional path.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "intake_bookings_committed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "intake_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "intake_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "intake_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "intake_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "intake_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "intake_wal_flush_batch_size";

// ── Sweep metrics ───────────────────────────────────────────────

/// Counter: interviews auto-completed by the lapsed sweep.
pub const SWEEP_INTERVIEWS_COMPLETED_TOTAL: &str = "intake_sweep_interviews_completed_total";

/// Counter: interviews parked as lapsed by the sweep.
pub const SWEEP_INTERVIEWS_LAPSED_TOTAL: &str = "intake_sweep_interviews_lapsed_total";

/// Counter: interviews auto-resolved off terminal candidates.
pub const SWEEP_INTERVIEWS_RESOLVED_TOTAL: &str = "intake_sweep_interviews_resolved_total";

/// Counter: booking links expired by the sweep.
pub const SWEEP_LINKS_EXPIRED_TOTAL: &str = "intake_sweep_links_expired_total";

/// Counter: candidates withdrawn after their link expired unused.
pub const SWEEP_CANDIDATES_WITHDRAWN_TOTAL: &str = "intake_sweep_candidates_withdrawn_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertCandidate { .. } => "upsert_candidate",
        Command::SetCandidateStatus { .. } => "set_candidate_status",
        Command::InsertLink { .. } => "insert_link",
        Command::RevokeLink { .. } => "revoke_link",
        Command::SetSchedule { .. } => "set_schedule",
        Command::SetBlocks { .. } => "set_blocks",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertBooking { .. } => "insert_booking",
        Command::ResolveInterview { .. } => "resolve_interview",
        Command::SelectInterviews { .. } => "select_interviews",
        Command::SelectLink { .. } => "select_link",
        Command::SweepInterviews => "sweep_interviews",
        Command::SweepLinks => "sweep_links",
        Command::Listen { .. } => "listen",
    }
}
