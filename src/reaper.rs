use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{now_ms, Engine};

/// Which of the two recurring sweeps a job instance drives. One
/// parameterized loop covers both; cadence is the only difference.
#[derive(Debug, Clone, Copy)]
pub enum SweepKind {
    /// Past-dated open interviews → completed / lapsed / resolved.
    Interviews,
    /// Overdue active links → expired, plus candidate withdrawal.
    Links,
}

/// Background task driving one sweep on a fixed cadence. Safe to rerun
/// or overlap: records only ever move forward, so a duplicate pass is
/// a no-op for anything already transitioned.
pub async fn run_sweeper(engine: Arc<Engine>, kind: SweepKind, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let now = now_ms();
        let result = match kind {
            SweepKind::Interviews => engine.sweep_lapsed_interviews(now).await,
            SweepKind::Links => engine.sweep_expired_links(now).await,
        };
        match result {
            Ok(report) if report.transitions() > 0 => {
                info!(
                    "sweep {kind:?}: {} completed, {} lapsed, {} resolved, {} links expired, {} withdrawn",
                    report.completed,
                    report.lapsed,
                    report.resolved,
                    report.expired_links,
                    report.withdrawn
                );
            }
            Ok(_) => {}
            Err(e) => warn!("sweep {kind:?} failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("WAL compacted"),
                Err(e) => warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
