//! notifyd-engine
//!
//! Narrow abstraction over "the workflow engine" (spec §6): durable workflow
//! execution, cron schedules addressable by deterministic id, and a task
//! queue that workers pull from. The daemon plane never talks to a concrete
//! engine SDK directly — every crate that needs engine capabilities (C4's
//! job sink, C6's workflow starts, C7's schedule CRUD) depends on the traits
//! here, and `notifyd-testkit` supplies the in-memory fakes that satisfy
//! them for tests.
//!
//! Also home to `retry_with_backoff`, the one shared backoff helper used by
//! C4's reconnect loop and C6's Dispatch activity (spec §5 "Cancellation &
//! timeouts").

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// One engine-side cron schedule (spec §3 "Engine Schedule").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub cron: String,
    pub timezone: String,
}

/// A schedule as observed on the engine: its id plus the spec it currently
/// carries. `action_payload` is opaque to the reconciler — it's handed back
/// verbatim when the engine fires the schedule.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedSchedule {
    pub schedule_id: String,
    pub spec: ScheduleSpec,
}

/// Engine capability needed by C7 (create/update/delete schedules, list the
/// ones that exist) — spec §4.7 and §6 "workflow engine... cron schedules
/// addressable by deterministic id with create/update/delete".
#[async_trait]
pub trait EngineScheduleClient: Send + Sync {
    async fn list_schedules(&self, prefix: &str) -> anyhow::Result<Vec<ObservedSchedule>>;
    async fn create_schedule(
        &self,
        schedule_id: &str,
        spec: ScheduleSpec,
        action_payload: Value,
    ) -> anyhow::Result<()>;
    async fn update_schedule(&self, schedule_id: &str, spec: ScheduleSpec) -> anyhow::Result<()>;
    async fn delete_schedule(&self, schedule_id: &str) -> anyhow::Result<()>;
}

/// Engine capability needed by C6/C8: start a durable workflow instance by
/// id, and a coarse running/not-running signal for the orchestration
/// supervisor (spec §4.8, §6 "a client to start/signal/cancel workflows").
#[async_trait]
pub trait WorkflowStarter: Send + Sync {
    async fn start_workflow(&self, workflow_id: &str, input: Value) -> anyhow::Result<()>;
}

/// Exponential backoff with a hard cap, shared by C4's reconnect state
/// machine (spec §4.4) and C6's Dispatch activity retry policy (spec §5).
///
/// `base` is the delay after the first failed attempt; each subsequent
/// attempt doubles it up to `cap`. `attempt` is 1-indexed (first failure is
/// attempt 1).
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let scaled = base.checked_mul(factor.min(u64::from(u32::MAX)) as u32);
    scaled.filter(|d| *d < cap).unwrap_or(cap)
}

/// Retry `f` up to `max_attempts` times, sleeping `backoff_delay` between
/// attempts. Returns the last error if every attempt fails or if
/// `is_retryable` rejects an error (spec §4.6 step 4 "terminal failure
/// (retries exhausted or non-retryable error class)"). `max_attempts` counts
/// the first try, so `max_attempts=1` never retries.
pub async fn retry_with_backoff<T, E, F, Fut>(
    max_attempts: u32,
    base: Duration,
    cap: Duration,
    is_retryable: impl Fn(&E) -> bool,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= max_attempts || !is_retryable(&e) {
                    return Err(e);
                }
                tokio::time::sleep(backoff_delay(base, cap, attempt)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, cap, 10), cap);
    }

    #[tokio::test]
    async fn retry_with_backoff_returns_first_success() {
        let mut calls = 0;
        let result: Result<i32, &str> = retry_with_backoff(
            5,
            Duration::from_millis(1),
            Duration::from_millis(5),
            |_| true,
            || {
                calls += 1;
                async move {
                    if calls < 3 {
                        Err("not yet")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_with_backoff_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<i32, &str> = retry_with_backoff(
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
            |_| true,
            || {
                calls += 1;
                async move { Err("always fails") }
            },
        )
        .await;
        assert_eq!(result, Err("always fails"));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_with_backoff_short_circuits_on_non_retryable_error() {
        let mut calls = 0;
        let result: Result<i32, &str> = retry_with_backoff(
            5,
            Duration::from_millis(1),
            Duration::from_millis(5),
            |e| *e != "rejected",
            || {
                calls += 1;
                async move { Err("rejected") }
            },
        )
        .await;
        assert_eq!(result, Err("rejected"));
        assert_eq!(calls, 1);
    }
}
