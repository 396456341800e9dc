//! Shared runtime state for notifyd-daemon.
//!
//! All types here are `Clone`-able (via `Arc`). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself
//! beyond the health aggregation read.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use notifyd_orchestrator::Orchestrator;
use notifyd_realtime::{ConnectionState, SubscriptionManager};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            service: "notifyd",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

// ---------------------------------------------------------------------------
// Health status (spec §4.9)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Pure aggregation rule (spec §4.9): `healthy` iff workers up ∧
/// orchestration running ∧ (C4 not configured, or subscribed with zero
/// failed attempts); `degraded` iff running but C4 is reconnecting/erroring/
/// still connecting; `unhealthy` otherwise.
pub fn aggregate_health(
    workers_alive: bool,
    orchestrating: bool,
    subscription: Option<(ConnectionState, u32)>,
) -> HealthStatus {
    if !workers_alive || !orchestrating {
        return HealthStatus::Unhealthy;
    }
    match subscription {
        None => HealthStatus::Healthy,
        Some((ConnectionState::Subscribed, 0)) => HealthStatus::Healthy,
        Some(_) => HealthStatus::Degraded,
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub build: BuildInfo,
    pub orchestrator: Arc<Orchestrator>,
    /// `None` when `tenants` was empty at boot and C4 was never started
    /// (spec §4.9 start sequence step 3).
    pub subscriptions: Option<Arc<SubscriptionManager>>,
    /// Flipped to `false` if every engine worker task has exited.
    pub workers_alive: Arc<AtomicBool>,
    /// Rough "in-flight + queued" gauge for `/metrics`' pipeline depth line,
    /// incremented when a worker pulls a job off the bus and decremented
    /// once `process_job` returns.
    pub pipeline_queue_depth: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        subscriptions: Option<Arc<SubscriptionManager>>,
        workers_alive: Arc<AtomicBool>,
        pipeline_queue_depth: Arc<AtomicU64>,
    ) -> Self {
        Self {
            build: BuildInfo::default(),
            orchestrator,
            subscriptions,
            workers_alive,
            pipeline_queue_depth,
        }
    }

    pub async fn health_status(&self) -> HealthStatus {
        let sub = match &self.subscriptions {
            None => None,
            Some(mgr) => Some((mgr.state().await, mgr.failed_attempts())),
        };
        aggregate_health(
            self.workers_alive.load(Ordering::SeqCst),
            self.orchestrator.is_running(),
            sub,
        )
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START.get_or_init(std::time::Instant::now).elapsed().as_secs()
}
