//! Background housekeeping: expire stale draft snapshots and mark redirected
//! orders that never received a callback as abandoned.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_drafts: u64,
    pub abandoned_orders: u64,
}

/// Run the sweep loop until `shutdown` is cancelled.
pub async fn run(pool: SqlitePool, config: Config, shutdown: CancellationToken) {
    let interval = Duration::from_secs(config.sweep_interval_secs.max(1));
    info!("Sweeper starting, interval {}s", interval.as_secs());

    loop {
        match sweep_once(&pool, &config, Utc::now().timestamp()).await {
            Ok(report) if report != SweepReport::default() => {
                info!(
                    expired_drafts = report.expired_drafts,
                    abandoned_orders = report.abandoned_orders,
                    "Sweep complete"
                );
            }
            Ok(_) => {}
            Err(e) => error!("Sweep error: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Sweeper stopped");
}

/// One pass at wall-clock `now` (unix seconds).
pub async fn sweep_once(
    pool: &SqlitePool,
    config: &Config,
    now: i64,
) -> crate::errors::Result<SweepReport> {
    let expired_drafts = db::delete_expired_drafts(pool, now).await?;
    let cutoff = now - config.abandon_after_mins * 60;
    let abandoned_orders = db::mark_abandoned(pool, cutoff).await?;

    Ok(SweepReport {
        expired_drafts,
        abandoned_orders,
    })
}
