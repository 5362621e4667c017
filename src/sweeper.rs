use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use tracing::info;

use crate::engine::{now_local, Engine, SweepReport};
use crate::observability;

/// Background task that settles overdue bookings and breaks. The first
/// pass runs immediately so a restart catches up before serving traffic.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_tick(&engine, now_local()).await;
    }
}

pub(crate) async fn sweep_tick(engine: &Engine, now: NaiveDateTime) -> SweepReport {
    let start = Instant::now();
    let report = engine.sweep(now).await;
    metrics::histogram!(observability::SWEEP_DURATION_SECONDS)
        .record(start.elapsed().as_secs_f64());
    if !report.is_empty() {
        info!(
            completed = report.completed,
            no_shows = report.no_shows,
            breaks_closed = report.breaks_closed,
            failed = report.failed,
            "sweep applied transitions"
        );
    }
    report
}

/// Rewrites the WAL as a snapshot once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

pub(crate) async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}
