//! notifyd-reconciler — Rule Reconciler (C7)
//!
//! Keeps engine-side cron schedules aligned with the `rule` table (spec
//! §4.7). The comparison itself ([`diff`]) is pure and ported from
//! `mqk-reconcile::engine::reconcile`; this module adds the IO shell around
//! it — fetch desired/actual, apply the plan one action at a time so a
//! single rule's engine error never blocks the rest (spec §4.7 "must never
//! block permanently on a single rule").

mod diff;
mod types;

pub use diff::diff;
pub use types::{ReconcilePlan, ScheduleAction};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notifyd_engine::EngineScheduleClient;
use sqlx::PgPool;
use tokio::sync::watch;

pub const SCHEDULE_PREFIX: &str = "rule-";

pub struct RuleReconciler {
    pool: PgPool,
    engine: Arc<dyn EngineScheduleClient>,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl RuleReconciler {
    pub fn new(pool: PgPool, engine: Arc<dyn EngineScheduleClient>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            pool,
            engine,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx,
            stop_rx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One reconcile pass: fetch desired/actual, apply every action,
    /// logging and skipping per-rule failures rather than aborting (spec
    /// §4.7).
    pub async fn force_reconcile(&self) -> anyhow::Result<ReconcilePlan> {
        let all_rules = notifyd_db::list_rules(&self.pool, None)
            .await
            .map_err(|e| anyhow::anyhow!("listing rules: {e}"))?;
        let desired: Vec<_> = all_rules.into_iter().filter(|r| !r.deactivated).collect();

        let actual = self
            .engine
            .list_schedules(SCHEDULE_PREFIX)
            .await
            .map_err(|e| anyhow::anyhow!("listing engine schedules: {e}"))?;

        let plan = diff(&desired, &actual);

        for action in &plan.actions {
            let result = match action {
                ScheduleAction::Create {
                    schedule_id,
                    spec,
                    action_payload,
                } => {
                    self.engine
                        .create_schedule(schedule_id, spec.clone(), action_payload.clone())
                        .await
                }
                ScheduleAction::Update { schedule_id, spec } => {
                    self.engine.update_schedule(schedule_id, spec.clone()).await
                }
                ScheduleAction::Delete { schedule_id } => {
                    self.engine.delete_schedule(schedule_id).await
                }
            };
            if let Err(e) = result {
                tracing::error!(
                    schedule_id = action.schedule_id(),
                    error = %e,
                    "reconcile action failed, continuing with remaining rules"
                );
            }
        }

        Ok(plan)
    }

    /// Start the steady-state loop on `interval` (spec §4.7 "the loop"). A
    /// second `start()` while already running is a no-op.
    pub fn start(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return tokio::spawn(async {});
        }
        let this = Arc::clone(self);
        let mut stop_rx = self.stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.force_reconcile().await {
                            tracing::error!(error = %e, "reconcile tick failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            this.running.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use notifyd_engine::{ObservedSchedule, ScheduleSpec};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeEngine {
        schedules: Mutex<std::collections::HashMap<String, ScheduleSpec>>,
    }

    #[async_trait]
    impl EngineScheduleClient for FakeEngine {
        async fn list_schedules(&self, prefix: &str) -> anyhow::Result<Vec<ObservedSchedule>> {
            Ok(self
                .schedules
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id.starts_with(prefix))
                .map(|(id, spec)| ObservedSchedule {
                    schedule_id: id.clone(),
                    spec: spec.clone(),
                })
                .collect())
        }

        async fn create_schedule(
            &self,
            schedule_id: &str,
            spec: ScheduleSpec,
            _action_payload: serde_json::Value,
        ) -> anyhow::Result<()> {
            self.schedules
                .lock()
                .unwrap()
                .insert(schedule_id.to_string(), spec);
            Ok(())
        }

        async fn update_schedule(&self, schedule_id: &str, spec: ScheduleSpec) -> anyhow::Result<()> {
            self.schedules
                .lock()
                .unwrap()
                .insert(schedule_id.to_string(), spec);
            Ok(())
        }

        async fn delete_schedule(&self, schedule_id: &str) -> anyhow::Result<()> {
            self.schedules.lock().unwrap().remove(schedule_id);
            Ok(())
        }
    }

    async fn make_pool() -> Option<PgPool> {
        let url = std::env::var(notifyd_db::ENV_STORE_URL).ok()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .ok()?;
        notifyd_db::migrate(&pool).await.ok()?;
        Some(pool)
    }

    #[tokio::test]
    async fn force_reconcile_is_idempotent_on_unchanged_rule_table() {
        let Some(pool) = make_pool().await else {
            eprintln!("SKIP: STORE_URL not set");
            return;
        };
        let wf = notifyd_db::create_workflow(
            &pool,
            &notifyd_db::NewWorkflow {
                tenant_id: "tenant-reconcile".into(),
                workflow_key: "wf-reconcile".into(),
                kind: notifyd_schemas::WorkflowKind::Static,
                default_channels: vec![],
                template_overrides: Default::default(),
                payload_schema: serde_json::json!({}),
            },
        )
        .await
        .unwrap();

        sqlx::query(
            "insert into notifyd.rule (tenant_id, workflow_ref, trigger_config, payload_template, deactivated) \
             values ($1, $2, $3, $4, false)",
        )
        .bind("tenant-reconcile")
        .bind(wf.id)
        .bind(serde_json::json!({"cron": "0 15 * * FRI", "timezone": "America/New_York"}))
        .bind(serde_json::json!({}))
        .execute(&pool)
        .await
        .unwrap();

        let engine = Arc::new(FakeEngine::default());
        let reconciler = RuleReconciler::new(pool, engine.clone());

        let first = reconciler.force_reconcile().await.unwrap();
        assert!(!first.is_clean());
        assert_eq!(first.creates().count(), 1);

        let second = reconciler.force_reconcile().await.unwrap();
        assert!(second.is_clean());
    }
}
