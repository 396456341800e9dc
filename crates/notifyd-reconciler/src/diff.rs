//! Pure desired/actual schedule comparison (spec §4.7 steps 1-5). Ported
//! almost verbatim from `mqk-reconcile::engine::reconcile`'s local-vs-broker
//! set comparison, re-keyed from orders/positions to rule schedules: stable
//! sorted output, no IO, no clock.

use std::collections::BTreeMap;

use notifyd_engine::{ObservedSchedule, ScheduleSpec};
use notifyd_schemas::NotificationRule;

use crate::types::{ReconcilePlan, ScheduleAction};

fn synthetic_payload(rule: &NotificationRule) -> serde_json::Value {
    serde_json::json!({
        "ruleId": rule.id,
        "tenantId": rule.tenant_id,
        "workflowRef": rule.workflow_ref,
        "payload": rule.payload_template,
    })
}

fn spec_of(rule: &NotificationRule) -> ScheduleSpec {
    ScheduleSpec {
        cron: rule.trigger_config.cron.clone(),
        timezone: rule.trigger_config.timezone.clone(),
    }
}

/// Compute the create/update/delete set for one reconcile pass.
///
/// `desired` must already be filtered to non-deactivated rules (spec §4.7
/// step 1); `actual` is every schedule currently observed on the engine
/// matching this reconciler's id prefix (step 2).
pub fn diff(desired: &[NotificationRule], actual: &[ObservedSchedule]) -> ReconcilePlan {
    let actual_by_id: BTreeMap<&str, &ObservedSchedule> = actual
        .iter()
        .map(|s| (s.schedule_id.as_str(), s))
        .collect();

    let mut desired_ids: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    let mut actions = Vec::new();

    for rule in desired {
        let schedule_id = rule.schedule_id();
        desired_ids.insert(schedule_id.clone());
        let desired_spec = spec_of(rule);

        match actual_by_id.get(schedule_id.as_str()) {
            None => actions.push(ScheduleAction::Create {
                schedule_id,
                spec: desired_spec,
                action_payload: synthetic_payload(rule),
            }),
            Some(observed) if observed.spec != desired_spec => {
                actions.push(ScheduleAction::Update {
                    schedule_id,
                    spec: desired_spec,
                })
            }
            Some(_) => {} // matches the store exactly, nothing to do.
        }
    }

    for observed in actual {
        if !desired_ids.contains(&observed.schedule_id) {
            actions.push(ScheduleAction::Delete {
                schedule_id: observed.schedule_id.clone(),
            });
        }
    }

    actions.sort_by(|a, b| a.schedule_id().cmp(b.schedule_id()));
    ReconcilePlan { actions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(id: i64, tenant: &str, cron: &str, tz: &str, deactivated: bool) -> NotificationRule {
        NotificationRule {
            id,
            tenant_id: tenant.into(),
            workflow_ref: 1,
            trigger_config: notifyd_schemas::TriggerConfig {
                cron: cron.into(),
                timezone: tz.into(),
            },
            payload_template: serde_json::json!({}),
            deactivated,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn rule_with_no_schedule_produces_create() {
        let plan = diff(&[rule(7, "T", "0 15 * * FRI", "America/New_York", false)], &[]);
        assert_eq!(plan.actions.len(), 1);
        match &plan.actions[0] {
            ScheduleAction::Create { schedule_id, spec, .. } => {
                assert_eq!(schedule_id, "rule-T-7");
                assert_eq!(spec.cron, "0 15 * * FRI");
                assert_eq!(spec.timezone, "America/New_York");
            }
            other => panic!("expected Create, got {other:?}"),
        }
    }

    #[test]
    fn matching_schedule_produces_no_action() {
        let r = rule(7, "T", "0 15 * * FRI", "America/New_York", false);
        let observed = ObservedSchedule {
            schedule_id: r.schedule_id(),
            spec: notifyd_engine::ScheduleSpec {
                cron: "0 15 * * FRI".into(),
                timezone: "America/New_York".into(),
            },
        };
        let plan = diff(&[r], &[observed]);
        assert!(plan.is_clean());
    }

    #[test]
    fn changed_cron_produces_update() {
        let r = rule(7, "T", "0 16 * * FRI", "America/New_York", false);
        let observed = ObservedSchedule {
            schedule_id: r.schedule_id(),
            spec: notifyd_engine::ScheduleSpec {
                cron: "0 15 * * FRI".into(),
                timezone: "America/New_York".into(),
            },
        };
        let plan = diff(&[r], &[observed]);
        assert_eq!(plan.actions.len(), 1);
        assert!(matches!(plan.actions[0], ScheduleAction::Update { .. }));
    }

    #[test]
    fn orphaned_schedule_is_deleted() {
        let observed = ObservedSchedule {
            schedule_id: "rule-T-99".into(),
            spec: notifyd_engine::ScheduleSpec {
                cron: "* * * * *".into(),
                timezone: "UTC".into(),
            },
        };
        let plan = diff(&[], &[observed]);
        assert_eq!(plan.actions, vec![ScheduleAction::Delete {
            schedule_id: "rule-T-99".into()
        }]);
    }

    #[test]
    fn deactivated_rule_excluded_from_desired_gets_deleted() {
        // Caller is responsible for pre-filtering `deactivated` rules out of
        // `desired` (spec §4.7 step 1); diff() itself only ever sees the
        // rules the caller decided are active.
        let r = rule(7, "T", "0 15 * * FRI", "America/New_York", true);
        assert!(r.deactivated);
        let observed = ObservedSchedule {
            schedule_id: r.schedule_id(),
            spec: notifyd_engine::ScheduleSpec {
                cron: "0 15 * * FRI".into(),
                timezone: "America/New_York".into(),
            },
        };
        // Simulating the caller's pre-filter: deactivated rule never enters `desired`.
        let plan = diff(&[], &[observed]);
        assert_eq!(plan.actions, vec![ScheduleAction::Delete {
            schedule_id: "rule-T-7".into()
        }]);
    }

    #[test]
    fn second_diff_on_unchanged_input_is_clean() {
        let r = rule(7, "T", "0 15 * * FRI", "America/New_York", false);
        let observed = ObservedSchedule {
            schedule_id: r.schedule_id(),
            spec: notifyd_engine::ScheduleSpec {
                cron: "0 15 * * FRI".into(),
                timezone: "America/New_York".into(),
            },
        };
        let first = diff(&[r.clone()], &[]);
        assert!(!first.is_clean());
        let second = diff(&[r], &[observed]);
        assert!(second.is_clean());
    }
}
