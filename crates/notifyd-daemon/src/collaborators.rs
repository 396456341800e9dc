//! Real (non-fake) implementations of every external collaborator trait
//! this daemon's crates define. `notifyd-testkit` holds the in-memory
//! fakes used by `tests/scenario_*.rs` across the workspace; this module is
//! the composition root's counterpart — the adapters actually wired into
//! `main.rs` at boot.
//!
//! Grounded on `mqk-broker-alpaca`'s role as "the live HTTP adapter to an
//! external counterparty", the same shape `notifyd-delivery::HttpDeliveryClient`
//! already uses for the Delivery SDK.

use std::str::FromStr;

use async_trait::async_trait;
use notifyd_engine::{EngineScheduleClient, ObservedSchedule, ScheduleSpec, WorkflowStarter};
use notifyd_factory::{ChannelStep, StatusWriter, TemplateRenderer};
use notifyd_realtime::ChangeFeedSource;
use notifyd_schemas::{Channel, ChangeEvent, ChangeEventType};
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// StatusWriter — C3's slice of C1, Postgres-backed
// ---------------------------------------------------------------------------

/// Best-effort status writes a dynamic [`notifyd_factory::Definition`] makes
/// around its own execution (spec §4.3 steps 1 & 3). Failures here are
/// logged by the caller, never propagated (spec §4.3 "best-effort").
pub struct DbStatusWriter {
    pool: PgPool,
}

impl DbStatusWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatusWriter for DbStatusWriter {
    async fn mark_processing(&self, notification_id: i64, tenant_id: &str) -> anyhow::Result<()> {
        notifyd_db::update_notification_status(
            &self.pool,
            notification_id,
            tenant_id,
            notifyd_schemas::NotificationStatus::Processing,
            None,
            None,
        )
        .await
        .map_err(|e| anyhow::anyhow!("status write (processing) failed: {e}"))?;
        Ok(())
    }

    async fn mark_sent(&self, notification_id: i64, tenant_id: &str) -> anyhow::Result<()> {
        notifyd_db::update_notification_status(
            &self.pool,
            notification_id,
            tenant_id,
            notifyd_schemas::NotificationStatus::Sent,
            None,
            None,
        )
        .await
        .map_err(|e| anyhow::anyhow!("status write (sent) failed: {e}"))?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        notification_id: i64,
        tenant_id: &str,
        error_details: &str,
    ) -> anyhow::Result<()> {
        notifyd_db::update_notification_status(
            &self.pool,
            notification_id,
            tenant_id,
            notifyd_schemas::NotificationStatus::Failed,
            Some(error_details),
            None,
        )
        .await
        .map_err(|e| anyhow::anyhow!("status write (failed) failed: {e}"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TemplateRenderer / ChannelStep — thin delegation to the Delivery SDK
// ---------------------------------------------------------------------------

/// Per-channel template rendering is explicitly out of scope for this
/// daemon (spec §1); this client only forwards to whatever renders
/// templates upstream, using the same Delivery SDK endpoint/secret pair
/// `HttpDeliveryClient` uses.
pub struct HttpTemplateRenderer {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

impl HttpTemplateRenderer {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            secret: secret.into(),
        })
    }
}

#[async_trait]
impl TemplateRenderer for HttpTemplateRenderer {
    async fn render(
        &self,
        tenant_id: &str,
        channel: Channel,
        template_id: &str,
        payload: &Value,
    ) -> anyhow::Result<Value> {
        let resp = self
            .http
            .post(format!("{}/v1/templates/render", self.base_url))
            .bearer_auth(&self.secret)
            .json(&serde_json::json!({
                "tenantId": tenant_id,
                "channel": channel.as_str(),
                "templateId": template_id,
                "payload": payload,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("template render for {template_id} returned {}", resp.status());
        }
        Ok(resp.json().await?)
    }
}

/// Per-channel dispatch is likewise out of scope (spec §1); this forwards
/// the rendered result to whatever invokes the channel-specific send.
pub struct HttpChannelStep {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

impl HttpChannelStep {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            secret: secret.into(),
        })
    }
}

#[async_trait]
impl ChannelStep for HttpChannelStep {
    async fn invoke(&self, tenant_id: &str, channel: Channel, rendered: Value) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(format!("{}/v1/channels/{}/invoke", self.base_url, channel.as_str()))
            .bearer_auth(&self.secret)
            .json(&serde_json::json!({
                "tenantId": tenant_id,
                "rendered": rendered,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("channel step {} returned {}", channel.as_str(), resp.status());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EngineScheduleClient / WorkflowStarter — HTTP client to the workflow engine
// ---------------------------------------------------------------------------

/// The one client this daemon holds onto "the workflow engine" (spec §6):
/// schedule CRUD for C7, workflow starts for C6/C8. `ENGINE_ADDRESS` is
/// treated as an HTTP base URL and `ENGINE_TASK_QUEUE` is threaded through
/// every start-workflow call as the task list workers pull from.
pub struct HttpEngineClient {
    http: reqwest::Client,
    base_url: String,
    task_queue: String,
}

#[derive(Deserialize)]
struct ScheduleListEntry {
    schedule_id: String,
    cron: String,
    timezone: String,
}

impl HttpEngineClient {
    pub fn new(base_url: impl Into<String>, task_queue: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            task_queue: task_queue.into(),
        })
    }

    /// Fail fast on a malformed cron expression rather than letting the
    /// engine reject it after a round trip (spec §7 "errors never cross
    /// boundaries silently").
    fn validate_cron(cron_expr: &str) -> anyhow::Result<()> {
        cron::Schedule::from_str(cron_expr)
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("invalid cron expression '{cron_expr}': {e}"))
    }
}

#[async_trait]
impl EngineScheduleClient for HttpEngineClient {
    async fn list_schedules(&self, prefix: &str) -> anyhow::Result<Vec<ObservedSchedule>> {
        let resp = self
            .http
            .get(format!("{}/v1/schedules", self.base_url))
            .query(&[("prefix", prefix), ("taskQueue", &self.task_queue)])
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("list_schedules returned {}", resp.status());
        }
        let entries: Vec<ScheduleListEntry> = resp.json().await?;
        Ok(entries
            .into_iter()
            .map(|e| ObservedSchedule {
                schedule_id: e.schedule_id,
                spec: ScheduleSpec {
                    cron: e.cron,
                    timezone: e.timezone,
                },
            })
            .collect())
    }

    async fn create_schedule(
        &self,
        schedule_id: &str,
        spec: ScheduleSpec,
        action_payload: Value,
    ) -> anyhow::Result<()> {
        Self::validate_cron(&spec.cron)?;
        let resp = self
            .http
            .post(format!("{}/v1/schedules/{schedule_id}", self.base_url))
            .json(&serde_json::json!({
                "cron": spec.cron,
                "timezone": spec.timezone,
                "taskQueue": self.task_queue,
                "actionPayload": action_payload,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("create_schedule({schedule_id}) returned {}", resp.status());
        }
        Ok(())
    }

    async fn update_schedule(&self, schedule_id: &str, spec: ScheduleSpec) -> anyhow::Result<()> {
        Self::validate_cron(&spec.cron)?;
        let resp = self
            .http
            .put(format!("{}/v1/schedules/{schedule_id}", self.base_url))
            .json(&serde_json::json!({
                "cron": spec.cron,
                "timezone": spec.timezone,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("update_schedule({schedule_id}) returned {}", resp.status());
        }
        Ok(())
    }

    async fn delete_schedule(&self, schedule_id: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .delete(format!("{}/v1/schedules/{schedule_id}", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            anyhow::bail!("delete_schedule({schedule_id}) returned {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStarter for HttpEngineClient {
    async fn start_workflow(&self, workflow_id: &str, input: Value) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(format!("{}/v1/workflows/{workflow_id}/start", self.base_url))
            .json(&serde_json::json!({
                "taskQueue": self.task_queue,
                "input": input,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("start_workflow({workflow_id}) returned {}", resp.status());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ChangeFeedSource — Postgres LISTEN/NOTIFY transport
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct NotifyPayload {
    op: String,
    id: i64,
    tenant_id: String,
}

pub const NOTIFY_CHANNEL: &str = "notifyd_notification_changes";

/// The daemon's one handle onto the change-feed transport (spec §6).
/// Postgres's native `LISTEN`/`NOTIFY` is the concrete transport for this
/// store, fed by the trigger `notifyd-db`'s migrations install; each
/// notification carries only the row's identity, so `recv` re-fetches the
/// full row rather than trusting a stale payload.
pub struct PgChangeFeedSource {
    pool: PgPool,
    listener: Option<PgListener>,
}

impl PgChangeFeedSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, listener: None }
    }
}

#[async_trait]
impl ChangeFeedSource for PgChangeFeedSource {
    async fn connect(&mut self) -> anyhow::Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        self.listener = Some(listener);
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<Option<ChangeEvent>> {
        let Some(listener) = self.listener.as_mut() else {
            anyhow::bail!("recv called before connect");
        };
        let notification = listener.recv().await?;
        let payload: NotifyPayload = serde_json::from_str(notification.payload())?;

        let event_type = match payload.op.as_str() {
            "INSERT" => ChangeEventType::Insert,
            "UPDATE" => ChangeEventType::Update,
            other => anyhow::bail!("unrecognized change-feed op '{other}'"),
        };

        let row = notifyd_db::get_notification(&self.pool, payload.id, &payload.tenant_id)
            .await
            .map_err(|e| anyhow::anyhow!("change-feed row lookup failed: {e}"))?;

        Ok(row.map(|row| ChangeEvent {
            event_type,
            tenant_id: payload.tenant_id,
            new_row: Some(row),
            old_row: None,
        }))
    }
}
