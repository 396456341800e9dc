//! Request and response types for notifyd-daemon's HTTP endpoints.
//!
//! These types are `Serialize` (+ `Deserialize` for tests) so they can be
//! JSON-encoded by Axum and decoded by scenario tests. No business logic
//! lives here.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// GET /health/detailed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub components: Vec<ComponentStatus>,
    pub pipeline_queue_depth: u64,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// GET /health/subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionsResponse {
    pub configured: bool,
    pub state: Option<String>,
    pub failed_attempts: Option<u32>,
}
