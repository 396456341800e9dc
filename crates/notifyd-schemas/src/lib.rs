//! notifyd-schemas
//!
//! Plain domain entities shared across the daemon plane: workflows,
//! notification requests (the outbox), notification rules, and the
//! in-process job envelope that carries outbox rows from an ingestion
//! source (realtime or poll) into the pipeline.
//!
//! No behavior lives here beyond the small parse/normalize rules (e.g. the
//! `INAPP` channel alias) that every consumer needs to agree on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// One delivery modality. Serializes as `IN_APP`; deserializes `IN_APP` and
/// the `INAPP` alias to the same variant (spec §4.3 validation rule).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    InApp,
    Sms,
    Push,
    Chat,
}

/// Fixed dispatch order required by spec §4.3 step 2.
pub const CHANNEL_ORDER: [Channel; 5] = [
    Channel::Email,
    Channel::InApp,
    Channel::Sms,
    Channel::Push,
    Channel::Chat,
];

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::InApp => "IN_APP",
            Channel::Sms => "SMS",
            Channel::Push => "PUSH",
            Channel::Chat => "CHAT",
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(Channel::Email),
            // INAPP is accepted as an alias for IN_APP (spec §4.3).
            "IN_APP" | "INAPP" => Ok(Channel::InApp),
            "SMS" => Ok(Channel::Sms),
            "PUSH" => Ok(Channel::Push),
            "CHAT" => Ok(Channel::Chat),
            other => Err(format!("unrecognized channel: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowKind {
    Static,
    Dynamic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishStatus {
    Draft,
    Publish,
}

/// A named recipe for turning a notification request into per-channel
/// dispatches (spec §3 "Workflow").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    pub tenant_id: String,
    pub workflow_key: String,
    pub kind: WorkflowKind,
    pub default_channels: Vec<Channel>,
    /// channel (as its wire string, e.g. "EMAIL") -> template id.
    pub template_overrides: serde_json::Map<String, Value>,
    pub payload_schema: Value,
    pub publish_status: PublishStatus,
    pub deactivated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Only rows with `publish_status=PUBLISH ∧ ¬deactivated` are eligible
    /// for resolution (spec §3 invariant).
    pub fn is_eligible(&self) -> bool {
        matches!(self.publish_status, PublishStatus::Publish) && !self.deactivated
    }

    pub fn template_id_for(&self, channel: Channel) -> Option<&str> {
        self.template_overrides.get(channel.as_str())?.as_str()
    }
}

// ---------------------------------------------------------------------------
// WorkflowConfig — in-memory projection built by the Factory (spec §3/§4.3)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub workflow_key: String,
    pub kind: WorkflowKind,
    pub channels: Vec<Channel>,
    pub email_template_id: Option<String>,
    pub in_app_template_id: Option<String>,
    pub sms_template_id: Option<String>,
    pub push_template_id: Option<String>,
    pub chat_template_id: Option<String>,
    pub payload_schema: Option<Value>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl WorkflowConfig {
    pub fn template_id_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email_template_id.as_deref(),
            Channel::InApp => self.in_app_template_id.as_deref(),
            Channel::Sms => self.sms_template_id.as_deref(),
            Channel::Push => self.push_template_id.as_deref(),
            Channel::Chat => self.chat_template_id.as_deref(),
        }
    }

    /// Build a projection from a stored `Workflow` row (the Factory's input
    /// shape). Returns `None` for STATIC workflows — those resolve directly
    /// to a compiled-in definition and have no stored config to project.
    pub fn from_workflow(w: &Workflow) -> Option<Self> {
        if !matches!(w.kind, WorkflowKind::Dynamic) {
            return None;
        }
        let mut cfg = WorkflowConfig {
            workflow_key: w.workflow_key.clone(),
            kind: w.kind,
            channels: w.default_channels.clone(),
            email_template_id: None,
            in_app_template_id: None,
            sms_template_id: None,
            push_template_id: None,
            chat_template_id: None,
            payload_schema: Some(w.payload_schema.clone()),
            name: None,
            description: None,
            tags: None,
        };
        for c in CHANNEL_ORDER {
            let Some(id) = w.template_id_for(c) else {
                continue;
            };
            let id = id.to_string();
            match c {
                Channel::Email => cfg.email_template_id = Some(id),
                Channel::InApp => cfg.in_app_template_id = Some(id),
                Channel::Sms => cfg.sms_template_id = Some(id),
                Channel::Push => cfg.push_template_id = Some(id),
                Channel::Chat => cfg.chat_template_id = Some(id),
            }
        }
        Some(cfg)
    }
}

// ---------------------------------------------------------------------------
// NotificationRequest — the outbox row
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Retracted,
}

impl NotificationStatus {
    /// Status transition DAG from spec §3:
    /// `PENDING -> PROCESSING -> {SENT, FAILED}`, `PENDING -> RETRACTED`,
    /// `FAILED -> PENDING` (retry).
    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Pending, Retracted)
                | (Failed, Pending)
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: i64,
    pub tenant_id: String,
    pub workflow_ref: i64,
    pub recipients: Vec<String>,
    pub payload: Value,
    pub overrides: Option<Value>,
    pub status: NotificationStatus,
    pub transaction_id: Option<String>,
    pub error_details: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRequest {
    /// `scheduled_for ≠ null` ⇒ must not be dispatched before now ≥
    /// `scheduled_for` (spec §3 invariant).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_for {
            Some(at) => at <= now,
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationRule
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub cron: String,
    pub timezone: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: i64,
    pub tenant_id: String,
    pub workflow_ref: i64,
    pub trigger_config: TriggerConfig,
    pub payload_template: Value,
    pub deactivated: bool,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRule {
    /// Deterministic engine-side schedule id (spec §3/§4.7).
    pub fn schedule_id(&self) -> String {
        format!("rule-{}-{}", self.tenant_id, self.id)
    }
}

// ---------------------------------------------------------------------------
// RealtimeJob — the unit of work handed from C4/C5 into C6 (spec §4.4/§4.5)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeJob {
    pub event_id: Uuid,
    pub event_type: ChangeEventType,
    pub tenant_id: String,
    pub notification_id: i64,
    pub new_row: Option<NotificationRequest>,
    pub old_row: Option<NotificationRequest>,
    pub timestamp: DateTime<Utc>,
}

impl RealtimeJob {
    pub fn from_row(event_type: ChangeEventType, row: NotificationRequest) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            tenant_id: row.tenant_id.clone(),
            notification_id: row.id,
            timestamp: row.updated_at,
            new_row: Some(row),
            old_row: None,
        }
    }
}

/// One row-level change observed on the change-feed transport (spec §4.4/§6),
/// before it has been turned into a [`RealtimeJob`] and validated against the
/// monitored tenant set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    pub tenant_id: String,
    pub new_row: Option<NotificationRequest>,
    pub old_row: Option<NotificationRequest>,
}

impl ChangeEvent {
    pub fn into_job(self) -> Option<RealtimeJob> {
        let row = self.new_row.clone().or_else(|| self.old_row.clone())?;
        Some(RealtimeJob {
            event_id: Uuid::new_v4(),
            event_type: self.event_type,
            tenant_id: self.tenant_id,
            notification_id: row.id,
            timestamp: row.updated_at,
            new_row: self.new_row,
            old_row: self.old_row,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inapp_alias_normalizes_to_in_app() {
        let c: Channel = serde_json::from_str("\"INAPP\"").unwrap();
        assert_eq!(c, Channel::InApp);
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"IN_APP\"");
    }

    #[test]
    fn unrecognized_channel_is_rejected() {
        let err = serde_json::from_str::<Channel>("\"CARRIER_PIGEON\"");
        assert!(err.is_err());
    }

    #[test]
    fn status_dag_allows_only_spec_edges() {
        use NotificationStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Sent));
        assert!(Processing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Retracted));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Sent.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Sent));
    }

    #[test]
    fn scheduled_for_gates_dispatch_on_now() {
        let mut req = sample_request();
        let now = Utc::now();
        req.scheduled_for = Some(now + chrono::Duration::seconds(10));
        assert!(!req.is_due(now));
        req.scheduled_for = Some(now - chrono::Duration::seconds(10));
        assert!(req.is_due(now));
        req.scheduled_for = None;
        assert!(req.is_due(now));
    }

    fn sample_request() -> NotificationRequest {
        NotificationRequest {
            id: 1,
            tenant_id: "T".into(),
            workflow_ref: 1,
            recipients: vec!["sub-1".into()],
            payload: serde_json::json!({}),
            overrides: None,
            status: NotificationStatus::Pending,
            transaction_id: None,
            error_details: None,
            scheduled_for: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn schedule_id_is_deterministic() {
        let rule = NotificationRule {
            id: 7,
            tenant_id: "T".into(),
            workflow_ref: 1,
            trigger_config: TriggerConfig {
                cron: "0 15 * * FRI".into(),
                timezone: "America/New_York".into(),
            },
            payload_template: serde_json::json!({}),
            deactivated: false,
            updated_at: Utc::now(),
        };
        assert_eq!(rule.schedule_id(), "rule-T-7");
    }
}
