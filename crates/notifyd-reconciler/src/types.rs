//! Plan types for the Rule Reconciler (C7). Grounded on
//! `mqk-reconcile`'s `ReconcileDiff`/`ReconcileReport` shape — a flat,
//! sortable, serializable description of "what must change", computed
//! without touching the engine.

use notifyd_engine::ScheduleSpec;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum ScheduleAction {
    /// A desired rule has no matching schedule on the engine (spec §4.7
    /// step 3).
    Create {
        schedule_id: String,
        spec: ScheduleSpec,
        action_payload: Value,
    },
    /// A desired rule's schedule exists but its `(cron, timezone)` differs
    /// from the store (spec §4.7 step 4).
    Update {
        schedule_id: String,
        spec: ScheduleSpec,
    },
    /// A schedule exists on the engine with no matching active rule —
    /// either orphaned or the rule was deactivated (spec §4.7 step 5).
    Delete { schedule_id: String },
}

impl ScheduleAction {
    pub fn schedule_id(&self) -> &str {
        match self {
            ScheduleAction::Create { schedule_id, .. } => schedule_id,
            ScheduleAction::Update { schedule_id, .. } => schedule_id,
            ScheduleAction::Delete { schedule_id } => schedule_id,
        }
    }
}

/// The set-difference result of one reconcile pass. Empty `actions` means
/// the engine already matches the rule table exactly (spec §8 "force_reconcile
/// twice on an unchanged rule table makes zero engine mutations the second
/// time").
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcilePlan {
    pub actions: Vec<ScheduleAction>,
}

impl ReconcilePlan {
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn creates(&self) -> impl Iterator<Item = &ScheduleAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, ScheduleAction::Create { .. }))
    }

    pub fn updates(&self) -> impl Iterator<Item = &ScheduleAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, ScheduleAction::Update { .. }))
    }

    pub fn deletes(&self) -> impl Iterator<Item = &ScheduleAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, ScheduleAction::Delete { .. }))
    }
}
