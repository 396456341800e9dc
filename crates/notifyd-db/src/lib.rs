//! notifyd-db — Store Gateway (C1)
//!
//! Tenant-filtered CRUD facade over Postgres, exposed as free functions over
//! a `PgPool` rather than a repository trait/struct — the teacher this crate
//! is grounded on never wraps its pool in an object either. Every function
//! that touches a specific row requires and filters on `tenant_id`; a
//! mismatch returns `None`/no rows, never a cross-tenant leak.
//!
//! "Row not found" is `Ok(None)`, not an error. Transport/constraint errors
//! surface as [`StoreError`] so callers can decide whether to retry.

pub mod error;

pub use error::StoreError;

use chrono::{DateTime, Utc};
use notifyd_schemas::{
    Channel, NotificationRequest, NotificationRule, NotificationStatus, PublishStatus,
    TriggerConfig, Workflow, WorkflowKind,
};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

pub const ENV_STORE_URL: &str = "STORE_URL";

/// Connect to Postgres using `STORE_URL`, scoping every session to the
/// `notifyd` schema via `search_path` so callers never have to qualify
/// table names.
pub async fn connect_from_env() -> Result<PgPool, StoreError> {
    let url = std::env::var(ENV_STORE_URL)
        .map_err(|_| StoreError::Transient(anyhow::anyhow!("missing env var {ENV_STORE_URL}")))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("set search_path to notifyd, public")
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .map_err(StoreError::from)?;

    Ok(pool)
}

/// Run embedded SQLx migrations. Safe to call on every boot; re-running
/// against an already-migrated database is a no-op.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| anyhow::anyhow!("db migrate failed: {e}"))
}

// ---------------------------------------------------------------------------
// wire-format <-> domain-type helpers
// ---------------------------------------------------------------------------

fn parse_kind(s: &str) -> Result<WorkflowKind, StoreError> {
    match s {
        "STATIC" => Ok(WorkflowKind::Static),
        "DYNAMIC" => Ok(WorkflowKind::Dynamic),
        other => Err(StoreError::Constraint(anyhow::anyhow!(
            "unrecognized workflow kind in store: {other}"
        ))),
    }
}

fn kind_str(k: WorkflowKind) -> &'static str {
    match k {
        WorkflowKind::Static => "STATIC",
        WorkflowKind::Dynamic => "DYNAMIC",
    }
}

fn parse_publish_status(s: &str) -> Result<PublishStatus, StoreError> {
    match s {
        "DRAFT" => Ok(PublishStatus::Draft),
        "PUBLISH" => Ok(PublishStatus::Publish),
        other => Err(StoreError::Constraint(anyhow::anyhow!(
            "unrecognized publish status in store: {other}"
        ))),
    }
}

fn publish_status_str(s: PublishStatus) -> &'static str {
    match s {
        PublishStatus::Draft => "DRAFT",
        PublishStatus::Publish => "PUBLISH",
    }
}

fn parse_notification_status(s: &str) -> Result<NotificationStatus, StoreError> {
    match s {
        "PENDING" => Ok(NotificationStatus::Pending),
        "PROCESSING" => Ok(NotificationStatus::Processing),
        "SENT" => Ok(NotificationStatus::Sent),
        "FAILED" => Ok(NotificationStatus::Failed),
        "RETRACTED" => Ok(NotificationStatus::Retracted),
        other => Err(StoreError::Constraint(anyhow::anyhow!(
            "unrecognized notification status in store: {other}"
        ))),
    }
}

fn notification_status_str(s: NotificationStatus) -> &'static str {
    match s {
        NotificationStatus::Pending => "PENDING",
        NotificationStatus::Processing => "PROCESSING",
        NotificationStatus::Sent => "SENT",
        NotificationStatus::Failed => "FAILED",
        NotificationStatus::Retracted => "RETRACTED",
    }
}

fn parse_channels(v: Value) -> Result<Vec<Channel>, StoreError> {
    let raw: Vec<String> = serde_json::from_value(v)
        .map_err(|e| StoreError::Constraint(anyhow::anyhow!("malformed channel list: {e}")))?;
    raw.iter()
        .map(|s| {
            s.parse::<Channel>()
                .map_err(|e| StoreError::Constraint(anyhow::anyhow!(e)))
        })
        .collect()
}

fn channels_json(channels: &[Channel]) -> Value {
    Value::Array(
        channels
            .iter()
            .map(|c| Value::String(c.as_str().to_string()))
            .collect(),
    )
}

fn workflow_from_row(row: &sqlx::postgres::PgRow) -> Result<Workflow, StoreError> {
    let default_channels: Value = row.try_get("default_channels")?;
    let template_overrides: Value = row.try_get("template_overrides")?;
    Ok(Workflow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        workflow_key: row.try_get("workflow_key")?,
        kind: parse_kind(row.try_get("kind")?)?,
        default_channels: parse_channels(default_channels)?,
        template_overrides: template_overrides.as_object().cloned().unwrap_or_default(),
        payload_schema: row.try_get("payload_schema")?,
        publish_status: parse_publish_status(row.try_get("publish_status")?)?,
        deactivated: row.try_get("deactivated")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn notification_from_row(
    row: &sqlx::postgres::PgRow,
) -> Result<NotificationRequest, StoreError> {
    let recipients: Value = row.try_get("recipients")?;
    let recipients: Vec<String> = serde_json::from_value(recipients)
        .map_err(|e| StoreError::Constraint(anyhow::anyhow!("malformed recipients: {e}")))?;
    Ok(NotificationRequest {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        workflow_ref: row.try_get("workflow_ref")?,
        recipients,
        payload: row.try_get("payload")?,
        overrides: row.try_get("overrides")?,
        status: parse_notification_status(row.try_get("status")?)?,
        transaction_id: row.try_get("transaction_id")?,
        error_details: row.try_get("error_details")?,
        scheduled_for: row.try_get("scheduled_for")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn rule_from_row(row: &sqlx::postgres::PgRow) -> Result<NotificationRule, StoreError> {
    let trigger_config: Value = row.try_get("trigger_config")?;
    let trigger_config: TriggerConfig = serde_json::from_value(trigger_config)
        .map_err(|e| StoreError::Constraint(anyhow::anyhow!("malformed trigger_config: {e}")))?;
    Ok(NotificationRule {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        workflow_ref: row.try_get("workflow_ref")?,
        trigger_config,
        payload_template: row.try_get("payload_template")?,
        deactivated: row.try_get("deactivated")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

pub struct NewWorkflow {
    pub tenant_id: String,
    pub workflow_key: String,
    pub kind: WorkflowKind,
    pub default_channels: Vec<Channel>,
    pub template_overrides: serde_json::Map<String, Value>,
    pub payload_schema: Value,
}

pub async fn get_workflow(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
) -> Result<Option<Workflow>, StoreError> {
    let row = sqlx::query(
        "select id, tenant_id, workflow_key, kind, default_channels, template_overrides, \
         payload_schema, publish_status, deactivated, created_at, updated_at \
         from workflow where id = $1 and tenant_id = $2",
    )
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(workflow_from_row).transpose()
}

pub async fn get_workflow_by_key(
    pool: &PgPool,
    workflow_key: &str,
    tenant_id: &str,
) -> Result<Option<Workflow>, StoreError> {
    let row = sqlx::query(
        "select id, tenant_id, workflow_key, kind, default_channels, template_overrides, \
         payload_schema, publish_status, deactivated, created_at, updated_at \
         from workflow where workflow_key = $1 and tenant_id = $2",
    )
    .bind(workflow_key)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(workflow_from_row).transpose()
}

pub async fn list_published_workflows(
    pool: &PgPool,
    tenant_id: &str,
) -> Result<Vec<Workflow>, StoreError> {
    let rows = sqlx::query(
        "select id, tenant_id, workflow_key, kind, default_channels, template_overrides, \
         payload_schema, publish_status, deactivated, created_at, updated_at \
         from workflow where tenant_id = $1 and publish_status = 'PUBLISH' and deactivated = false \
         order by id asc",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(workflow_from_row).collect()
}

pub async fn list_dynamic_published(
    pool: &PgPool,
    tenant_id: &str,
) -> Result<Vec<Workflow>, StoreError> {
    let rows = sqlx::query(
        "select id, tenant_id, workflow_key, kind, default_channels, template_overrides, \
         payload_schema, publish_status, deactivated, created_at, updated_at \
         from workflow where tenant_id = $1 and kind = 'DYNAMIC' \
         and publish_status = 'PUBLISH' and deactivated = false \
         order by id asc",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(workflow_from_row).collect()
}

pub async fn create_workflow(pool: &PgPool, new: &NewWorkflow) -> Result<Workflow, StoreError> {
    let row = sqlx::query(
        "insert into workflow (tenant_id, workflow_key, kind, default_channels, \
         template_overrides, payload_schema, publish_status, deactivated) \
         values ($1, $2, $3, $4, $5, $6, 'DRAFT', false) \
         returning id, tenant_id, workflow_key, kind, default_channels, template_overrides, \
         payload_schema, publish_status, deactivated, created_at, updated_at",
    )
    .bind(&new.tenant_id)
    .bind(&new.workflow_key)
    .bind(kind_str(new.kind))
    .bind(channels_json(&new.default_channels))
    .bind(Value::Object(new.template_overrides.clone()))
    .bind(&new.payload_schema)
    .fetch_one(pool)
    .await?;
    workflow_from_row(&row)
}

pub async fn update_workflow(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
    default_channels: &[Channel],
    template_overrides: &serde_json::Map<String, Value>,
    payload_schema: &Value,
) -> Result<Option<Workflow>, StoreError> {
    let row = sqlx::query(
        "update workflow set default_channels = $3, template_overrides = $4, \
         payload_schema = $5, updated_at = now() \
         where id = $1 and tenant_id = $2 \
         returning id, tenant_id, workflow_key, kind, default_channels, template_overrides, \
         payload_schema, publish_status, deactivated, created_at, updated_at",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(channels_json(default_channels))
    .bind(Value::Object(template_overrides.clone()))
    .bind(payload_schema)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(workflow_from_row).transpose()
}

async fn set_workflow_publish_status(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
    status: PublishStatus,
) -> Result<Option<Workflow>, StoreError> {
    let row = sqlx::query(
        "update workflow set publish_status = $3, updated_at = now() \
         where id = $1 and tenant_id = $2 \
         returning id, tenant_id, workflow_key, kind, default_channels, template_overrides, \
         payload_schema, publish_status, deactivated, created_at, updated_at",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(publish_status_str(status))
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(workflow_from_row).transpose()
}

pub async fn publish_workflow(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
) -> Result<Option<Workflow>, StoreError> {
    set_workflow_publish_status(pool, id, tenant_id, PublishStatus::Publish).await
}

pub async fn unpublish_workflow(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
) -> Result<Option<Workflow>, StoreError> {
    set_workflow_publish_status(pool, id, tenant_id, PublishStatus::Draft).await
}

pub async fn deactivate_workflow(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
) -> Result<Option<Workflow>, StoreError> {
    let row = sqlx::query(
        "update workflow set deactivated = true, updated_at = now() \
         where id = $1 and tenant_id = $2 \
         returning id, tenant_id, workflow_key, kind, default_channels, template_overrides, \
         payload_schema, publish_status, deactivated, created_at, updated_at",
    )
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(workflow_from_row).transpose()
}

// ---------------------------------------------------------------------------
// Notification (outbox)
// ---------------------------------------------------------------------------

pub struct NewNotification {
    pub tenant_id: String,
    pub workflow_ref: i64,
    pub recipients: Vec<String>,
    pub payload: Value,
    pub overrides: Option<Value>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

const NOTIFICATION_COLUMNS: &str = "id, tenant_id, workflow_ref, recipients, payload, overrides, \
    status, transaction_id, error_details, scheduled_for, created_at, updated_at";

pub async fn get_notification(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
) -> Result<Option<NotificationRequest>, StoreError> {
    let row = sqlx::query(&format!(
        "select {NOTIFICATION_COLUMNS} from notification where id = $1 and tenant_id = $2"
    ))
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(notification_from_row).transpose()
}

pub async fn create_notification(
    pool: &PgPool,
    new: &NewNotification,
) -> Result<NotificationRequest, StoreError> {
    let row = sqlx::query(&format!(
        "insert into notification (tenant_id, workflow_ref, recipients, payload, overrides, \
         status, scheduled_for) values ($1, $2, $3, $4, $5, 'PENDING', $6) \
         returning {NOTIFICATION_COLUMNS}"
    ))
    .bind(&new.tenant_id)
    .bind(new.workflow_ref)
    .bind(Value::Array(
        new.recipients.iter().cloned().map(Value::String).collect(),
    ))
    .bind(&new.payload)
    .bind(&new.overrides)
    .bind(new.scheduled_for)
    .fetch_one(pool)
    .await?;
    notification_from_row(&row)
}

/// Insert every row in `news` in one statement via `unnest` — either all
/// rows land or none do (spec §4.1 "all-or-nothing").
pub async fn bulk_create_notifications(
    pool: &PgPool,
    news: &[NewNotification],
) -> Result<Vec<NotificationRequest>, StoreError> {
    if news.is_empty() {
        return Ok(Vec::new());
    }

    let tenant_ids: Vec<&str> = news.iter().map(|n| n.tenant_id.as_str()).collect();
    let workflow_refs: Vec<i64> = news.iter().map(|n| n.workflow_ref).collect();
    let recipients: Vec<Value> = news
        .iter()
        .map(|n| Value::Array(n.recipients.iter().cloned().map(Value::String).collect()))
        .collect();
    let payloads: Vec<Value> = news.iter().map(|n| n.payload.clone()).collect();
    let overrides: Vec<Option<Value>> = news.iter().map(|n| n.overrides.clone()).collect();
    let scheduled_fors: Vec<Option<DateTime<Utc>>> =
        news.iter().map(|n| n.scheduled_for).collect();

    let rows = sqlx::query(&format!(
        "insert into notification (tenant_id, workflow_ref, recipients, payload, overrides, \
         status, scheduled_for) \
         select t, w, r, p, o, 'PENDING', s from unnest( \
           $1::text[], $2::bigint[], $3::jsonb[], $4::jsonb[], $5::jsonb[], $6::timestamptz[] \
         ) as u(t, w, r, p, o, s) \
         returning {NOTIFICATION_COLUMNS}"
    ))
    .bind(&tenant_ids)
    .bind(&workflow_refs)
    .bind(&recipients)
    .bind(&payloads)
    .bind(&overrides)
    .bind(&scheduled_fors)
    .fetch_all(pool)
    .await?;

    rows.iter().map(notification_from_row).collect()
}

/// Idempotent: writing the status the row already has is a no-op that still
/// refreshes `updated_at` per spec (a genuine idempotent retry, not a stall).
pub async fn update_notification_status(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
    status: NotificationStatus,
    error_details: Option<&str>,
    transaction_id: Option<&str>,
) -> Result<Option<NotificationRequest>, StoreError> {
    let row = sqlx::query(&format!(
        "update notification set status = $3, error_details = coalesce($4, error_details), \
         transaction_id = coalesce($5, transaction_id), updated_at = now() \
         where id = $1 and tenant_id = $2 returning {NOTIFICATION_COLUMNS}"
    ))
    .bind(id)
    .bind(tenant_id)
    .bind(notification_status_str(status))
    .bind(error_details)
    .bind(transaction_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(notification_from_row).transpose()
}

/// Claim (C6 Claim activity): `PENDING -> PROCESSING`, single-row CAS via
/// `UPDATE ... WHERE ... RETURNING` targeted by primary key — no
/// `FOR UPDATE SKIP LOCKED` needed since this never targets a batch.
pub async fn claim_notification(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
) -> Result<Option<NotificationRequest>, StoreError> {
    let row = sqlx::query(&format!(
        "update notification set status = 'PROCESSING', updated_at = now() \
         where id = $1 and tenant_id = $2 and status = 'PENDING' \
         returning {NOTIFICATION_COLUMNS}"
    ))
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(notification_from_row).transpose()
}

pub async fn list_by_status(
    pool: &PgPool,
    status: NotificationStatus,
    tenant_id: &str,
    limit: i64,
) -> Result<Vec<NotificationRequest>, StoreError> {
    let rows = sqlx::query(&format!(
        "select {NOTIFICATION_COLUMNS} from notification \
         where tenant_id = $1 and status = $2 order by id asc limit $3"
    ))
    .bind(tenant_id)
    .bind(notification_status_str(status))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(notification_from_row).collect()
}

/// C5 scheduled sweep: due = `status = PENDING and scheduled_for <= now`,
/// ordered ascending by `scheduled_for` (spec §4.1).
pub async fn list_scheduled_due(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<NotificationRequest>, StoreError> {
    let rows = sqlx::query(&format!(
        "select {NOTIFICATION_COLUMNS} from notification \
         where status = 'PENDING' and scheduled_for is not null and scheduled_for <= $1 \
         order by scheduled_for asc limit $2"
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(notification_from_row).collect()
}

/// C5 catch-up sweep: rows updated after `cursor`, ascending — a read-only
/// sweep, so no row locking is needed (unlike claim).
pub async fn list_changes_since(
    pool: &PgPool,
    cursor: DateTime<Utc>,
    limit: i64,
    tenant_filter: Option<&str>,
) -> Result<Vec<NotificationRequest>, StoreError> {
    let rows = match tenant_filter {
        Some(tenant_id) => {
            sqlx::query(&format!(
                "select {NOTIFICATION_COLUMNS} from notification \
                 where updated_at > $1 and tenant_id = $2 order by updated_at asc limit $3"
            ))
            .bind(cursor)
            .bind(tenant_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "select {NOTIFICATION_COLUMNS} from notification \
                 where updated_at > $1 order by updated_at asc limit $2"
            ))
            .bind(cursor)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    rows.iter().map(notification_from_row).collect()
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

const RULE_COLUMNS: &str =
    "id, tenant_id, workflow_ref, trigger_config, payload_template, deactivated, updated_at";

pub async fn list_rules(
    pool: &PgPool,
    tenant_id: Option<&str>,
) -> Result<Vec<NotificationRule>, StoreError> {
    let rows = match tenant_id {
        Some(t) => {
            sqlx::query(&format!(
                "select {RULE_COLUMNS} from rule where tenant_id = $1 order by id asc"
            ))
            .bind(t)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!("select {RULE_COLUMNS} from rule order by id asc"))
                .fetch_all(pool)
                .await?
        }
    };
    rows.iter().map(rule_from_row).collect()
}

pub async fn get_rule(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
) -> Result<Option<NotificationRule>, StoreError> {
    let row = sqlx::query(&format!(
        "select {RULE_COLUMNS} from rule where id = $1 and tenant_id = $2"
    ))
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(rule_from_row).transpose()
}

pub async fn update_rule_timestamps(
    pool: &PgPool,
    id: i64,
    tenant_id: &str,
) -> Result<bool, StoreError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "update rule set updated_at = now() where id = $1 and tenant_id = $2 returning id",
    )
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}
