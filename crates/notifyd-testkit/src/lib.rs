//! notifyd-testkit
//!
//! Deterministic in-memory fakes standing in for the daemon's external
//! collaborators — the delivery SDK, the workflow engine's schedule CRUD,
//! the change-feed transport, and the render/channel-step edges a dynamic
//! workflow definition calls into. Grounded on `mqk-testkit::PaperBroker`:
//! no randomness, no network I/O, deterministic ids, and a small recording
//! surface (`calls()`/`count()`) tests assert against directly instead of
//! re-deriving state from a mock framework's call log.
//!
//! Every fake here satisfies a narrow trait from `notifyd-engine`,
//! `notifyd-delivery`, `notifyd-realtime`, or `notifyd-factory` — the same
//! "define the interface, let a fake and the real thing both satisfy it"
//! split spec §9 calls for.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use notifyd_delivery::DeliveryClient;
use notifyd_engine::{EngineScheduleClient, ObservedSchedule, ScheduleSpec};
use notifyd_factory::{ChannelStep, StatusWriter, TemplateRenderer};
use notifyd_realtime::ChangeFeedSource;
use notifyd_schemas::{Channel, ChangeEvent};
use serde_json::Value;

// ---------------------------------------------------------------------------
// FakeDeliveryClient
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedTrigger {
    pub workflow_key: String,
    pub to: Vec<String>,
    pub payload: Value,
    pub overrides: Option<Value>,
}

/// Deterministic stand-in for the upstream delivery SDK (spec §6, §8
/// scenario 1 "delivery SDK called exactly once"). Transaction ids are
/// `TXN-000001`, `TXN-000002`, ... — no RNG.
#[derive(Clone)]
enum ScriptedFailure {
    /// Plain error, no `DeliveryError` classification attached.
    Plain(String),
    /// Wrapped in `DeliveryError::Rejected` so callers can exercise the
    /// non-retryable short-circuit path (spec §4.6 step 4, §7 "Delivery").
    Rejected(String),
}

#[derive(Default)]
pub struct FakeDeliveryClient {
    calls: Mutex<Vec<RecordedTrigger>>,
    next_txn: Mutex<u64>,
    /// When set, every call fails instead of succeeding.
    fail_with: Mutex<Option<ScriptedFailure>>,
}

impl FakeDeliveryClient {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_txn: Mutex::new(1),
            fail_with: Mutex::new(None),
        }
    }

    /// Every subsequent `trigger` call returns this error instead of a
    /// transaction id (spec §7 "Delivery" / §8 scenario 3's renderer-fails
    /// sibling for the dispatch side).
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock().unwrap() = Some(ScriptedFailure::Plain(message.into()));
    }

    /// Every subsequent `trigger` call fails with a `DeliveryError::Rejected`
    /// — the non-retryable 4xx class (spec §7 "Delivery").
    pub fn fail_with_rejected(&self, message: impl Into<String>) {
        *self.fail_with.lock().unwrap() = Some(ScriptedFailure::Rejected(message.into()));
    }

    pub fn calls(&self) -> Vec<RecordedTrigger> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryClient for FakeDeliveryClient {
    async fn trigger(
        &self,
        workflow_key: &str,
        to: &[String],
        payload: &Value,
        overrides: Option<&Value>,
    ) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(RecordedTrigger {
            workflow_key: workflow_key.to_string(),
            to: to.to_vec(),
            payload: payload.clone(),
            overrides: overrides.cloned(),
        });

        match self.fail_with.lock().unwrap().clone() {
            Some(ScriptedFailure::Plain(message)) => anyhow::bail!(message),
            Some(ScriptedFailure::Rejected(message)) => {
                return Err(notifyd_delivery::DeliveryError::Rejected(anyhow::anyhow!(message)).into())
            }
            None => {}
        }

        let mut next = self.next_txn.lock().unwrap();
        let txn = format!("TXN-{:06}", *next);
        *next += 1;
        Ok(txn)
    }
}

// ---------------------------------------------------------------------------
// FakeEngineScheduleClient
// ---------------------------------------------------------------------------

/// In-memory stand-in for the workflow engine's cron schedule CRUD (spec
/// §6, §4.7). Keyed exactly like the real engine would be: schedule id ->
/// spec. `create_schedule`'s `action_payload` is recorded but not
/// interpreted — the reconciler never inspects it either.
#[derive(Default)]
pub struct FakeEngineScheduleClient {
    schedules: Mutex<HashMap<String, ScheduleSpec>>,
    action_payloads: Mutex<HashMap<String, Value>>,
}

impl FakeEngineScheduleClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_count(&self) -> usize {
        self.schedules.lock().unwrap().len()
    }

    pub fn spec_of(&self, schedule_id: &str) -> Option<ScheduleSpec> {
        self.schedules.lock().unwrap().get(schedule_id).cloned()
    }

    pub fn action_payload_of(&self, schedule_id: &str) -> Option<Value> {
        self.action_payloads.lock().unwrap().get(schedule_id).cloned()
    }
}

#[async_trait]
impl EngineScheduleClient for FakeEngineScheduleClient {
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
        action_payload: Value,
    ) -> anyhow::Result<()> {
        self.schedules
            .lock()
            .unwrap()
            .insert(schedule_id.to_string(), spec);
        self.action_payloads
            .lock()
            .unwrap()
            .insert(schedule_id.to_string(), action_payload);
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
        self.action_payloads.lock().unwrap().remove(schedule_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeChangeFeedSource
// ---------------------------------------------------------------------------

/// Scripted change-feed transport (spec §4.4, §8 scenario 6 "realtime
/// reconnect"). `connect` fails the first `fail_connects_remaining` times,
/// then succeeds; `recv` drains `events` in order, then returns `Ok(None)`
/// (clean end-of-stream) to force the manager back into reconnect.
pub struct FakeChangeFeedSource {
    events: std::collections::VecDeque<ChangeEvent>,
    fail_connects_remaining: u32,
}

impl FakeChangeFeedSource {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self {
            events: events.into(),
            fail_connects_remaining: 0,
        }
    }

    pub fn failing_connects(mut self, times: u32) -> Self {
        self.fail_connects_remaining = times;
        self
    }
}

#[async_trait]
impl ChangeFeedSource for FakeChangeFeedSource {
    async fn connect(&mut self) -> anyhow::Result<()> {
        if self.fail_connects_remaining > 0 {
            self.fail_connects_remaining -= 1;
            anyhow::bail!("simulated transport failure");
        }
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<Option<ChangeEvent>> {
        Ok(self.events.pop_front())
    }
}

// ---------------------------------------------------------------------------
// Factory-side fakes: renderer, channel step, status writer
// ---------------------------------------------------------------------------

/// Renders every channel to a fixed shape, or fails with a scripted message
/// if `fail_with` is set (spec §8 scenario 3 "rendering failure").
#[derive(Default)]
pub struct FakeTemplateRenderer {
    fail_with: Option<String>,
}

impl FakeTemplateRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
        }
    }
}

#[async_trait]
impl TemplateRenderer for FakeTemplateRenderer {
    async fn render(
        &self,
        _tenant_id: &str,
        _channel: Channel,
        _template_id: &str,
        _payload: &Value,
    ) -> anyhow::Result<Value> {
        if let Some(message) = &self.fail_with {
            anyhow::bail!(message.clone());
        }
        Ok(serde_json::json!({"rendered": true}))
    }
}

/// Records every channel invoked, in the order it happened (spec §8
/// scenario "channels invoked in fixed order").
#[derive(Default)]
pub struct RecordingChannelStep {
    invocations: Mutex<Vec<Channel>>,
}

impl RecordingChannelStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<Channel> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelStep for RecordingChannelStep {
    async fn invoke(&self, _tenant_id: &str, channel: Channel, _rendered: Value) -> anyhow::Result<()> {
        self.invocations.lock().unwrap().push(channel);
        Ok(())
    }
}

/// Records every status transition requested of it, in order — for tests
/// that assert the dynamic definition's best-effort status writes happen in
/// the right sequence without standing up Postgres.
#[derive(Default)]
pub struct RecordingStatusWriter {
    calls: Mutex<Vec<String>>,
}

impl RecordingStatusWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusWriter for RecordingStatusWriter {
    async fn mark_processing(&self, notification_id: i64, _tenant_id: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("processing:{notification_id}"));
        Ok(())
    }

    async fn mark_sent(&self, notification_id: i64, _tenant_id: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("sent:{notification_id}"));
        Ok(())
    }

    async fn mark_failed(
        &self,
        notification_id: i64,
        _tenant_id: &str,
        error_details: &str,
    ) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("failed:{notification_id}:{error_details}"));
        Ok(())
    }
}
