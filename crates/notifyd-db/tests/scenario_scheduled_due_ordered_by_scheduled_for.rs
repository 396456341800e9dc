//! Scenario: scheduled-due rows surface in `scheduled_for` order and rows
//! whose `scheduled_for` is still in the future are excluded (spec §4.1).
//!
//! Skips gracefully when `STORE_URL` is not set.

use chrono::{Duration, Utc};
use serde_json::json;

#[tokio::test]
async fn due_rows_are_ordered_ascending_and_future_rows_excluded() -> anyhow::Result<()> {
    let url = match std::env::var(notifyd_db::ENV_STORE_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: STORE_URL not set");
            return Ok(());
        }
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await?;
    notifyd_db::migrate(&pool).await?;

    let tenant_id = "tenant-scheduled-due";
    let workflow = notifyd_db::create_workflow(
        &pool,
        &notifyd_db::NewWorkflow {
            tenant_id: tenant_id.to_string(),
            workflow_key: "wf-scheduled".into(),
            kind: notifyd_schemas::WorkflowKind::Static,
            default_channels: vec![],
            template_overrides: Default::default(),
            payload_schema: json!({}),
        },
    )
    .await?;

    let now = Utc::now();
    let later = notifyd_db::create_notification(
        &pool,
        &notifyd_db::NewNotification {
            tenant_id: tenant_id.to_string(),
            workflow_ref: workflow.id,
            recipients: vec!["sub-1".into()],
            payload: json!({}),
            overrides: None,
            scheduled_for: Some(now - Duration::seconds(5)),
        },
    )
    .await?;
    let sooner = notifyd_db::create_notification(
        &pool,
        &notifyd_db::NewNotification {
            tenant_id: tenant_id.to_string(),
            workflow_ref: workflow.id,
            recipients: vec!["sub-2".into()],
            payload: json!({}),
            overrides: None,
            scheduled_for: Some(now - Duration::seconds(50)),
        },
    )
    .await?;
    let _future = notifyd_db::create_notification(
        &pool,
        &notifyd_db::NewNotification {
            tenant_id: tenant_id.to_string(),
            workflow_ref: workflow.id,
            recipients: vec!["sub-3".into()],
            payload: json!({}),
            overrides: None,
            scheduled_for: Some(now + Duration::seconds(3600)),
        },
    )
    .await?;

    let due = notifyd_db::list_scheduled_due(&pool, now, 10).await?;
    let due_ids: Vec<i64> = due.iter().map(|r| r.id).collect();

    assert!(due_ids.contains(&sooner.id));
    assert!(due_ids.contains(&later.id));
    let sooner_pos = due_ids.iter().position(|&id| id == sooner.id).unwrap();
    let later_pos = due_ids.iter().position(|&id| id == later.id).unwrap();
    assert!(
        sooner_pos < later_pos,
        "rows must be ordered ascending by scheduled_for"
    );
    assert!(
        !due_ids.contains(&_future.id),
        "a row scheduled in the future must not be due yet"
    );

    Ok(())
}
