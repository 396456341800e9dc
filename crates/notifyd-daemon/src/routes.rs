//! Axum router and all HTTP handlers for notifyd-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use notifyd_realtime::ConnectionState;

use crate::api_types::{ComponentStatus, DetailedHealthResponse, HealthResponse, SubscriptionsResponse};
use crate::state::{uptime_secs, AppState, HealthStatus};

/// Every health handler's per-request budget (spec §5 "Health HTTP handlers
/// have a per-request timeout of 5s").
const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/subscriptions", get(health_subscriptions))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn connection_state_str(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Subscribed => "subscribed",
        ConnectionState::Reconnecting => "reconnecting",
        ConnectionState::Error => "error",
    }
}

fn status_code_for(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn with_timeout<F, T>(fut: F) -> Response
where
    F: std::future::Future<Output = (StatusCode, Json<T>)>,
    T: serde::Serialize,
{
    match tokio::time::timeout(HANDLER_TIMEOUT, fut).await {
        Ok((code, body)) => (code, body).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    with_timeout(async move {
        let status = st.health_status().await;
        (
            status_code_for(status),
            Json(HealthResponse {
                status: status.as_str().to_string(),
                uptime_secs: uptime_secs(),
                timestamp: chrono::Utc::now(),
            }),
        )
    })
    .await
}

// ---------------------------------------------------------------------------
// GET /health/detailed
// ---------------------------------------------------------------------------

pub(crate) async fn health_detailed(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    with_timeout(async move {
        let status = st.health_status().await;

        let mut components = vec![
            ComponentStatus {
                name: "engine_workers".to_string(),
                state: if st.workers_alive.load(Ordering::SeqCst) {
                    "up".to_string()
                } else {
                    "down".to_string()
                },
            },
            ComponentStatus {
                name: "orchestration".to_string(),
                state: if st.orchestrator.is_running() {
                    "running".to_string()
                } else {
                    "stopped".to_string()
                },
            },
        ];
        match &st.subscriptions {
            Some(mgr) => components.push(ComponentStatus {
                name: "subscriptions".to_string(),
                state: connection_state_str(mgr.state().await).to_string(),
            }),
            None => components.push(ComponentStatus {
                name: "subscriptions".to_string(),
                state: "not_configured".to_string(),
            }),
        }

        (
            status_code_for(status),
            Json(DetailedHealthResponse {
                status: status.as_str().to_string(),
                uptime_secs: uptime_secs(),
                timestamp: chrono::Utc::now(),
                components,
                pipeline_queue_depth: st.pipeline_queue_depth.load(Ordering::SeqCst),
                service: st.build.service,
                version: st.build.version,
            }),
        )
    })
    .await
}

// ---------------------------------------------------------------------------
// GET /health/subscriptions
// ---------------------------------------------------------------------------

pub(crate) async fn health_subscriptions(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    with_timeout(async move {
        let body = match &st.subscriptions {
            Some(mgr) => SubscriptionsResponse {
                configured: true,
                state: Some(connection_state_str(mgr.state().await).to_string()),
                failed_attempts: Some(mgr.failed_attempts()),
            },
            None => SubscriptionsResponse {
                configured: false,
                state: None,
                failed_attempts: None,
            },
        };
        (StatusCode::OK, Json(body))
    })
    .await
}

// ---------------------------------------------------------------------------
// GET /metrics
// ---------------------------------------------------------------------------

pub(crate) async fn metrics(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    match tokio::time::timeout(HANDLER_TIMEOUT, render_metrics(st)).await {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Hand-rolled Prometheus text exposition (spec §4.9 "no new dependency").
async fn render_metrics(st: Arc<AppState>) -> String {
    let status = st.health_status().await;
    let (total, active, failed, reconnecting) = match &st.subscriptions {
        Some(mgr) => {
            let state = mgr.state().await;
            let failed_attempts = mgr.failed_attempts();
            let active = u64::from(state == ConnectionState::Subscribed);
            let failed = u64::from(matches!(state, ConnectionState::Error) || failed_attempts > 0);
            let reconnecting = u64::from(state == ConnectionState::Reconnecting);
            (1u64, active, failed, reconnecting)
        }
        None => (0, 0, 0, 0),
    };

    let mut out = String::new();
    out.push_str("# HELP uptime_seconds Process uptime in seconds.\n");
    out.push_str("# TYPE uptime_seconds gauge\n");
    out.push_str(&format!("uptime_seconds {}\n", uptime_secs()));

    out.push_str("# HELP healthy Whether the daemon's aggregated health is healthy (1) or not (0).\n");
    out.push_str("# TYPE healthy gauge\n");
    out.push_str(&format!(
        "healthy {}\n",
        u8::from(status == HealthStatus::Healthy)
    ));

    out.push_str("# HELP subscriptions_total Whether the Realtime Subscription Manager is configured.\n");
    out.push_str("# TYPE subscriptions_total gauge\n");
    out.push_str(&format!("subscriptions_total {total}\n"));

    out.push_str("# HELP subscriptions_active Subscriptions currently in the Subscribed state.\n");
    out.push_str("# TYPE subscriptions_active gauge\n");
    out.push_str(&format!("subscriptions_active {active}\n"));

    out.push_str("# HELP subscriptions_failed Subscriptions in the Error state or with outstanding failed attempts.\n");
    out.push_str("# TYPE subscriptions_failed gauge\n");
    out.push_str(&format!("subscriptions_failed {failed}\n"));

    out.push_str("# HELP subscriptions_reconnecting Subscriptions currently reconnecting.\n");
    out.push_str("# TYPE subscriptions_reconnecting gauge\n");
    out.push_str(&format!("subscriptions_reconnecting {reconnecting}\n"));

    out.push_str("# HELP pipeline_queue_depth Notifications currently claimed or queued for dispatch.\n");
    out.push_str("# TYPE pipeline_queue_depth gauge\n");
    out.push_str(&format!(
        "pipeline_queue_depth {}\n",
        st.pipeline_queue_depth.load(Ordering::SeqCst)
    ));

    out
}
