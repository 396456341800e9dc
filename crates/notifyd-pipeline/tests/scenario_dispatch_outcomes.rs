//! Scenario tests for the Notification Pipeline (spec §8): happy-path
//! dispatch, dispatch failure landing the row in FAILED, and tenant
//! isolation at the claim gate. Skips cleanly when `STORE_URL` isn't set,
//! the same pattern every other crate's Postgres-backed scenario test uses.

use std::sync::Arc;

use async_trait::async_trait;
use notifyd_factory::{Definition, DefinitionBuilder, ValidationError};
use notifyd_pipeline::{Pipeline, PipelineOutcome};
use notifyd_registry::WorkflowRegistry;
use notifyd_schemas::{Channel, ChangeEventType, NewWorkflow, RealtimeJob, WorkflowConfig, WorkflowKind};
use notifyd_testkit::FakeDeliveryClient;
use serde_json::Value;
use sqlx::PgPool;

struct Echo;
#[async_trait]
impl Definition for Echo {
    async fn execute(&self, _tenant_id: &str, _payload: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

struct NeverBuilds;
impl DefinitionBuilder for NeverBuilds {
    fn build(&self, _config: WorkflowConfig) -> Result<Arc<dyn Definition>, Vec<ValidationError>> {
        Err(vec![ValidationError::EmptyChannels])
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

async fn seed_workflow(pool: &PgPool, tenant_id: &str, key: &str) -> i64 {
    let workflow = notifyd_db::create_workflow(
        pool,
        &NewWorkflow {
            tenant_id: tenant_id.to_string(),
            workflow_key: key.to_string(),
            kind: WorkflowKind::Static,
            default_channels: vec![Channel::Email],
            template_overrides: serde_json::Map::new(),
            payload_schema: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
    workflow.id
}

#[tokio::test]
async fn happy_path_dispatch_marks_sent_and_calls_delivery_once() {
    let Some(pool) = make_pool().await else {
        eprintln!("SKIP: STORE_URL not set");
        return;
    };
    let tenant_id = format!("T-{}", uuid::Uuid::new_v4());
    let workflow_id = seed_workflow(&pool, &tenant_id, "welcome").await;

    let notification = notifyd_db::create_notification(
        &pool,
        &notifyd_db::NewNotification {
            tenant_id: tenant_id.clone(),
            workflow_ref: workflow_id,
            recipients: vec!["user@example.com".to_string()],
            payload: serde_json::json!({"name": "Ada"}),
            overrides: None,
            scheduled_for: None,
        },
    )
    .await
    .unwrap();

    let mut registry = WorkflowRegistry::new(Arc::new(NeverBuilds));
    registry.register_static("welcome", Arc::new(Echo));
    let registry = Arc::new(registry);

    let delivery = Arc::new(FakeDeliveryClient::new());
    let pipeline = Pipeline::new(pool.clone(), registry, delivery.clone());

    let job = RealtimeJob::from_row(ChangeEventType::Insert, notification.clone());
    let outcome = pipeline.process_job(job).await.unwrap();

    match outcome {
        PipelineOutcome::Sent { transaction_id } => assert_eq!(transaction_id, "TXN-000001"),
        other => panic!("expected Sent, got {other:?}"),
    }
    assert_eq!(delivery.call_count(), 1);

    let reloaded = notifyd_db::get_notification(&pool, notification.id, &tenant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.status, notifyd_schemas::NotificationStatus::Sent);
    assert_eq!(reloaded.transaction_id.as_deref(), Some("TXN-000001"));
}

#[tokio::test]
async fn delivery_failure_marks_failed_with_reason() {
    let Some(pool) = make_pool().await else {
        eprintln!("SKIP: STORE_URL not set");
        return;
    };
    let tenant_id = format!("T-{}", uuid::Uuid::new_v4());
    let workflow_id = seed_workflow(&pool, &tenant_id, "welcome").await;

    let notification = notifyd_db::create_notification(
        &pool,
        &notifyd_db::NewNotification {
            tenant_id: tenant_id.clone(),
            workflow_ref: workflow_id,
            recipients: vec!["user@example.com".to_string()],
            payload: serde_json::json!({}),
            overrides: None,
            scheduled_for: None,
        },
    )
    .await
    .unwrap();

    let mut registry = WorkflowRegistry::new(Arc::new(NeverBuilds));
    registry.register_static("welcome", Arc::new(Echo));
    let registry = Arc::new(registry);

    let delivery = Arc::new(FakeDeliveryClient::new());
    delivery.fail_with("upstream rejected payload");
    let pipeline = Pipeline::new(pool.clone(), registry, delivery.clone())
        .with_retry_policy(notifyd_pipeline::DispatchRetryPolicy {
            max_attempts: 1,
            base_delay: std::time::Duration::from_millis(1),
            cap_delay: std::time::Duration::from_millis(1),
        });

    let job = RealtimeJob::from_row(ChangeEventType::Insert, notification.clone());
    let outcome = pipeline.process_job(job).await.unwrap();

    match outcome {
        PipelineOutcome::Failed { reason } => assert!(reason.contains("upstream rejected payload")),
        other => panic!("expected Failed, got {other:?}"),
    }

    let reloaded = notifyd_db::get_notification(&pool, notification.id, &tenant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.status, notifyd_schemas::NotificationStatus::Failed);
    assert!(reloaded
        .error_details
        .as_deref()
        .unwrap_or_default()
        .contains("upstream rejected payload"));
}

#[tokio::test]
async fn rejected_delivery_short_circuits_without_exhausting_retries() {
    let Some(pool) = make_pool().await else {
        eprintln!("SKIP: STORE_URL not set");
        return;
    };
    let tenant_id = format!("T-{}", uuid::Uuid::new_v4());
    let workflow_id = seed_workflow(&pool, &tenant_id, "welcome").await;

    let notification = notifyd_db::create_notification(
        &pool,
        &notifyd_db::NewNotification {
            tenant_id: tenant_id.clone(),
            workflow_ref: workflow_id,
            recipients: vec!["user@example.com".to_string()],
            payload: serde_json::json!({}),
            overrides: None,
            scheduled_for: None,
        },
    )
    .await
    .unwrap();

    let mut registry = WorkflowRegistry::new(Arc::new(NeverBuilds));
    registry.register_static("welcome", Arc::new(Echo));
    let registry = Arc::new(registry);

    let delivery = Arc::new(FakeDeliveryClient::new());
    delivery.fail_with_rejected("bad request");
    // A policy that would retry several times if the error class were ignored.
    let pipeline = Pipeline::new(pool.clone(), registry, delivery.clone())
        .with_retry_policy(notifyd_pipeline::DispatchRetryPolicy {
            max_attempts: 5,
            base_delay: std::time::Duration::from_millis(1),
            cap_delay: std::time::Duration::from_millis(1),
        });

    let job = RealtimeJob::from_row(ChangeEventType::Insert, notification.clone());
    let outcome = pipeline.process_job(job).await.unwrap();

    match outcome {
        PipelineOutcome::Failed { reason } => assert!(reason.contains("bad request")),
        other => panic!("expected Failed, got {other:?}"),
    }
    // Rejected is non-retryable: exactly one attempt, not five.
    assert_eq!(delivery.call_count(), 1);
}

#[tokio::test]
async fn wrong_tenant_job_is_abandoned_without_calling_delivery() {
    let Some(pool) = make_pool().await else {
        eprintln!("SKIP: STORE_URL not set");
        return;
    };
    let tenant_id = format!("T-{}", uuid::Uuid::new_v4());
    let other_tenant_id = format!("T-{}", uuid::Uuid::new_v4());
    let workflow_id = seed_workflow(&pool, &tenant_id, "welcome").await;

    let notification = notifyd_db::create_notification(
        &pool,
        &notifyd_db::NewNotification {
            tenant_id: tenant_id.clone(),
            workflow_ref: workflow_id,
            recipients: vec!["user@example.com".to_string()],
            payload: serde_json::json!({}),
            overrides: None,
            scheduled_for: None,
        },
    )
    .await
    .unwrap();

    let mut registry = WorkflowRegistry::new(Arc::new(NeverBuilds));
    registry.register_static("welcome", Arc::new(Echo));
    let registry = Arc::new(registry);

    let delivery = Arc::new(FakeDeliveryClient::new());
    let pipeline = Pipeline::new(pool.clone(), registry, delivery.clone());

    let mut job = RealtimeJob::from_row(ChangeEventType::Insert, notification.clone());
    job.tenant_id = other_tenant_id;

    let outcome = pipeline.process_job(job).await.unwrap();
    assert_eq!(outcome, PipelineOutcome::Abandoned);
    assert_eq!(delivery.call_count(), 0);

    let reloaded = notifyd_db::get_notification(&pool, notification.id, &tenant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.status, notifyd_schemas::NotificationStatus::Pending);
}
