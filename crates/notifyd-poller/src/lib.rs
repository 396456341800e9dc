//! notifyd-poller — Outbox/Scheduled Poller (C5)
//!
//! Two stateless-between-runs sweeps (spec §4.5), both sharing the same
//! `RealtimeJob` schema C4 uses so downstream is oblivious to the source:
//!
//! - **catch-up**: closes the gap if C4 drops events during a reconnect.
//! - **scheduled**: the only path that ever wakes a `scheduled_for` row.
//!
//! Stateless shape grounded on `mqk-reconcile::gate::reconcile_tick`
//! ("periodic pure check, no memory between runs" besides the one cursor
//! this component is explicitly allowed to keep).

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use notifyd_schemas::{ChangeEventType, NotificationStatus, RealtimeJob};
use sqlx::PgPool;
use tokio::sync::{broadcast, RwLock};

/// Catch-up sweep restricts to these statuses by default (spec §4.5);
/// exposed so callers can narrow it further if their deployment needs to.
pub const DEFAULT_CATCHUP_STATUSES: [NotificationStatus; 2] =
    [NotificationStatus::Pending, NotificationStatus::Failed];

pub struct Poller {
    pool: PgPool,
    jobs: broadcast::Sender<RealtimeJob>,
    cursor: RwLock<DateTime<Utc>>,
    catchup_statuses: Vec<NotificationStatus>,
}

impl Poller {
    /// Initial cursor is `now - 24h` per spec §4.5.
    pub fn new(pool: PgPool, jobs: broadcast::Sender<RealtimeJob>) -> Self {
        Self {
            pool,
            jobs,
            cursor: RwLock::new(Utc::now() - ChronoDuration::hours(24)),
            catchup_statuses: DEFAULT_CATCHUP_STATUSES.to_vec(),
        }
    }

    pub fn with_catchup_statuses(mut self, statuses: Vec<NotificationStatus>) -> Self {
        self.catchup_statuses = statuses;
        self
    }

    pub async fn cursor(&self) -> DateTime<Utc> {
        *self.cursor.read().await
    }

    fn enqueue(&self, job: RealtimeJob) {
        if self.jobs.send(job).is_err() {
            tracing::warn!("poller job dropped: no pipeline receiver attached");
        }
    }

    /// Catch-up sweep: rows changed since the cursor, restricted to
    /// `catchup_statuses`, advance the cursor to the max `updated_at` seen
    /// (spec §4.5). Returns how many jobs were enqueued.
    pub async fn catch_up_sweep(
        &self,
        tenant_filter: Option<&str>,
        batch: i64,
    ) -> anyhow::Result<usize> {
        let cursor = self.cursor().await;
        let rows = notifyd_db::list_changes_since(&self.pool, cursor, batch, tenant_filter)
            .await
            .map_err(|e| anyhow::anyhow!("catch-up sweep: {e}"))?;

        let mut max_seen = cursor;
        let mut enqueued = 0usize;
        for row in rows {
            if row.updated_at > max_seen {
                max_seen = row.updated_at;
            }
            if !self.catchup_statuses.contains(&row.status) {
                continue;
            }
            self.enqueue(RealtimeJob::from_row(ChangeEventType::Update, row));
            enqueued += 1;
        }

        if max_seen > cursor {
            *self.cursor.write().await = max_seen;
        }
        Ok(enqueued)
    }

    /// Scheduled sweep: `status=PENDING and scheduled_for <= now`, one job
    /// per row (spec §4.5).
    pub async fn scheduled_sweep(&self, now: DateTime<Utc>, batch: i64) -> anyhow::Result<usize> {
        let rows = notifyd_db::list_scheduled_due(&self.pool, now, batch)
            .await
            .map_err(|e| anyhow::anyhow!("scheduled sweep: {e}"))?;
        let count = rows.len();
        for row in rows {
            self.enqueue(RealtimeJob::from_row(ChangeEventType::Insert, row));
        }
        Ok(count)
    }
}

/// Spawn the scheduled sweep on a fixed cadence for every monitored tenant
/// (the cadence C8's Orchestration Loop drives per spec §4.8, exposed here
/// too for deployments that want C5 self-ticking without going through C8).
pub fn spawn_scheduled_sweep_loop(
    poller: Arc<Poller>,
    interval: std::time::Duration,
    batch: i64,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = poller.scheduled_sweep(Utc::now(), batch).await {
                        tracing::error!(error = %e, "scheduled sweep tick failed");
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catchup_statuses_are_pending_and_failed() {
        assert_eq!(
            DEFAULT_CATCHUP_STATUSES,
            [NotificationStatus::Pending, NotificationStatus::Failed]
        );
    }
}
