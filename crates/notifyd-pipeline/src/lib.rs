//! notifyd-pipeline — Notification Pipeline (C6)
//!
//! One workflow-instance-per-job, composed from four activities (spec
//! §4.6). The claim/resolve/dispatch/finalize sequence is built directly on
//! `notifyd-db`'s claim/status functions (ported from
//! `mqk-db::outbox_claim_batch`'s family), strung together the way
//! `mqk-testkit::Orchestrator` composes several crates' engines into one
//! loop iteration.
//!
//! Per-row safety derives entirely from the Claim activity's CAS — many
//! `process_job` calls can run concurrently across workers; duplicate jobs
//! for the same notification are harmless because the second claim is a
//! no-op (spec §4.6 "Concurrency").

use std::sync::Arc;
use std::time::Duration;

use notifyd_delivery::{DeliveryClient, DeliveryError};
use notifyd_engine::retry_with_backoff;
use notifyd_registry::WorkflowRegistry;
use notifyd_schemas::{NotificationRequest, NotificationStatus, RealtimeJob};
use sqlx::PgPool;

#[derive(Clone, Copy, Debug)]
pub struct DispatchRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
}

impl Default for DispatchRetryPolicy {
    /// spec §5: "exponential retry with a cap (default 5 attempts, 1s→30s)".
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of one `process_job` call, for logging/metrics — the durable
/// record of truth is always the `notification.status` column (spec §4.6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Row wasn't `PENDING` at claim time (already claimed, terminal, or
    /// retracted) — the instance ends successfully without doing anything.
    Abandoned,
    Sent { transaction_id: String },
    Failed { reason: String },
}

/// Errors without a `DeliveryError` classification (e.g. a plain network
/// error bubbled up before the HTTP client could classify it) default to
/// retryable, matching the prior behavior for anything that isn't explicitly
/// `Rejected`.
fn is_retryable_delivery_error(err: &anyhow::Error) -> bool {
    !matches!(
        err.downcast_ref::<DeliveryError>(),
        Some(DeliveryError::Rejected(_))
    )
}

pub struct Pipeline {
    pool: PgPool,
    registry: Arc<WorkflowRegistry>,
    delivery: Arc<dyn DeliveryClient>,
    retry_policy: DispatchRetryPolicy,
}

impl Pipeline {
    pub fn new(
        pool: PgPool,
        registry: Arc<WorkflowRegistry>,
        delivery: Arc<dyn DeliveryClient>,
    ) -> Self {
        Self {
            pool,
            registry,
            delivery,
            retry_policy: DispatchRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: DispatchRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Runs one job through claim -> resolve -> dispatch -> finalize.
    /// UPDATE events are handled identically to INSERTs — the claim is the
    /// only gate that matters (spec §4.6 "UPDATE events").
    pub async fn process_job(&self, job: RealtimeJob) -> anyhow::Result<PipelineOutcome> {
        let Some(claimed) = self
            .claim(job.notification_id, &job.tenant_id)
            .await?
        else {
            return Ok(PipelineOutcome::Abandoned);
        };

        let Some(workflow_key) = self.resolve_workflow_key(&claimed).await? else {
            self.finalize_failed(&claimed, "workflow not found").await?;
            return Ok(PipelineOutcome::Failed {
                reason: "workflow not found".to_string(),
            });
        };

        match self.dispatch(&workflow_key, &claimed).await {
            Ok(transaction_id) => {
                self.finalize_sent(&claimed, &transaction_id).await?;
                Ok(PipelineOutcome::Sent { transaction_id })
            }
            Err(e) => {
                let reason = e.to_string();
                self.finalize_failed(&claimed, &reason).await?;
                Ok(PipelineOutcome::Failed { reason })
            }
        }
    }

    /// Claim activity: CAS `PENDING -> PROCESSING` (spec §4.6 step 1).
    async fn claim(
        &self,
        notification_id: i64,
        tenant_id: &str,
    ) -> anyhow::Result<Option<NotificationRequest>> {
        notifyd_db::claim_notification(&self.pool, notification_id, tenant_id)
            .await
            .map_err(|e| anyhow::anyhow!("claim failed: {e}"))
    }

    /// Resolve activity: load the request's Workflow, look up its
    /// definition via the Registry. Returns `None` when the definition is
    /// missing (spec §4.6 step 2).
    async fn resolve_workflow_key(
        &self,
        req: &NotificationRequest,
    ) -> anyhow::Result<Option<String>> {
        let Some(workflow) =
            notifyd_db::get_workflow(&self.pool, req.workflow_ref, &req.tenant_id)
                .await
                .map_err(|e| anyhow::anyhow!("resolve failed: {e}"))?
        else {
            return Ok(None);
        };
        if self
            .registry
            .resolve(&workflow.workflow_key, Some(&req.tenant_id))
            .is_none()
        {
            return Ok(None);
        }
        Ok(Some(workflow.workflow_key))
    }

    /// Dispatch activity: the retry unit (spec §4.6 step 3, §5 attempt
    /// retries). A `DeliveryError::Rejected` (4xx, "retrying with the same
    /// input will fail identically") short-circuits immediately rather than
    /// burning the full attempt budget (spec §4.6 step 4, §7 "Delivery").
    async fn dispatch(
        &self,
        workflow_key: &str,
        req: &NotificationRequest,
    ) -> anyhow::Result<String> {
        let policy = self.retry_policy;
        retry_with_backoff(
            policy.max_attempts,
            policy.base_delay,
            policy.cap_delay,
            is_retryable_delivery_error,
            || {
                self.delivery.trigger(
                    workflow_key,
                    &req.recipients,
                    &req.payload,
                    req.overrides.as_ref(),
                )
            },
        )
        .await
    }

    /// Finalize activity: success path (spec §4.6 step 4).
    async fn finalize_sent(
        &self,
        req: &NotificationRequest,
        transaction_id: &str,
    ) -> anyhow::Result<()> {
        notifyd_db::update_notification_status(
            &self.pool,
            req.id,
            &req.tenant_id,
            NotificationStatus::Sent,
            None,
            Some(transaction_id),
        )
        .await
        .map_err(|e| anyhow::anyhow!("finalize (sent) failed: {e}"))?;
        Ok(())
    }

    /// Finalize activity: terminal failure path (spec §4.6 step 4, §7
    /// "Data"/"Delivery").
    async fn finalize_failed(&self, req: &NotificationRequest, reason: &str) -> anyhow::Result<()> {
        notifyd_db::update_notification_status(
            &self.pool,
            req.id,
            &req.tenant_id,
            NotificationStatus::Failed,
            Some(reason),
            None,
        )
        .await
        .map_err(|e| anyhow::anyhow!("finalize (failed) failed: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_policy_matches_spec_defaults() {
        let policy = DispatchRetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.cap_delay, Duration::from_secs(30));
    }
}
