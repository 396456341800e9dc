//! notifyd-realtime — Realtime Subscription Manager (C4)
//!
//! One shared change-feed connection that fans row events into the pipeline
//! (spec §4.4). The connection FSM is modelled as an explicit pure
//! transition function — the same "pure tick, no IO" shape
//! `mqk-reconcile::gate::reconcile_tick` uses — wrapped by an async loop
//! that owns the one `ChangeFeedSource`. The fan-out itself reuses
//! `mqk-daemon::state`'s `broadcast::channel` pattern, generalized from
//! "heartbeats to SSE clients" to "change rows to the pipeline".

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notifyd_engine::backoff_delay;
use notifyd_schemas::{ChangeEvent, ChangeEventType, RealtimeJob};
use tokio::sync::{broadcast, RwLock};

// ---------------------------------------------------------------------------
// Tenant filter
// ---------------------------------------------------------------------------

/// `tenants` config from spec §4.4: either a fixed set, or the `shared`
/// sentinel meaning "no filter, accept any tenant and demultiplex".
#[derive(Clone, Debug)]
pub enum TenantFilter {
    Shared,
    Set(HashSet<String>),
}

impl TenantFilter {
    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        TenantFilter::Set(ids.into_iter().collect())
    }

    pub fn accepts(&self, tenant_id: &str) -> bool {
        match self {
            TenantFilter::Shared => true,
            TenantFilter::Set(set) => set.contains(tenant_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection state machine (spec §4.4)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Reconnecting,
    Error,
}

/// Outcome of one connect/subscribe attempt, fed into [`next_state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Subscribed,
    Failed,
}

/// Pure FSM transition (spec §4.4): `Disconnected -> Connecting ->
/// {Subscribed, Error -> Reconnecting -> Connecting}`. Returns the next
/// state and, when retries are exhausted, `true` in the second slot meaning
/// "give up, stay in Error, human action required".
pub fn next_state(
    current: ConnectionState,
    outcome: AttemptOutcome,
    retry_count: u32,
    max_retries: u32,
) -> (ConnectionState, bool) {
    match (current, outcome) {
        (_, AttemptOutcome::Subscribed) => (ConnectionState::Subscribed, false),
        (_, AttemptOutcome::Failed) => {
            if retry_count >= max_retries {
                (ConnectionState::Error, true)
            } else {
                (ConnectionState::Reconnecting, false)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Change feed source (external collaborator)
// ---------------------------------------------------------------------------

/// The daemon's one handle onto the change-stream transport (spec §6
/// "Change-feed contract"). `connect` performs the subscribe handshake;
/// `recv` yields one row-level event at a time, or `Ok(None)` on a clean
/// end-of-stream that should trigger a reconnect.
#[async_trait]
pub trait ChangeFeedSource: Send {
    async fn connect(&mut self) -> anyhow::Result<()>;
    async fn recv(&mut self) -> anyhow::Result<Option<ChangeEvent>>;
}

// ---------------------------------------------------------------------------
// Subscription manager
// ---------------------------------------------------------------------------

pub struct SubscriptionConfig {
    pub tenants: TenantFilter,
    pub events: HashSet<ChangeEventType>,
    pub reconnect_delay_base: Duration,
    pub max_retries: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            tenants: TenantFilter::Shared,
            events: HashSet::from([ChangeEventType::Insert, ChangeEventType::Update]),
            reconnect_delay_base: Duration::from_millis(1000),
            max_retries: 10,
        }
    }
}

const RECONNECT_CAP: Duration = Duration::from_secs(30);

pub struct SubscriptionManager {
    config: SubscriptionConfig,
    jobs: broadcast::Sender<RealtimeJob>,
    state: Arc<RwLock<ConnectionState>>,
    failed_attempts: AtomicU32,
    callback: Option<Arc<dyn Fn(&RealtimeJob) + Send + Sync>>,
}

impl SubscriptionManager {
    pub fn new(config: SubscriptionConfig, jobs: broadcast::Sender<RealtimeJob>) -> Self {
        Self {
            config,
            jobs,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            failed_attempts: AtomicU32::new(0),
            callback: None,
        }
    }

    pub fn with_callback(mut self, cb: Arc<dyn Fn(&RealtimeJob) + Send + Sync>) -> Self {
        self.callback = Some(cb);
        self
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::SeqCst)
    }

    /// Validate + enqueue one observed change-feed row (spec §4.4). Returns
    /// `true` if the event was accepted and enqueued, `false` if dropped
    /// (unmonitored tenant or unsubscribed event type).
    pub fn handle_event(&self, event: ChangeEvent) -> bool {
        if !self.config.tenants.accepts(&event.tenant_id) {
            return false;
        }
        if !self.config.events.contains(&event.event_type) {
            return false;
        }
        let Some(job) = event.into_job() else {
            return false;
        };

        // A full broadcast channel here means backpressure, not data loss:
        // `send` only fails if there are zero receivers, which never happens
        // while the pipeline's worker is alive (spec §5 "Backpressure").
        if self.jobs.send(job.clone()).is_err() {
            tracing::warn!("realtime job dropped: no pipeline receiver attached");
            return false;
        }
        if let Some(cb) = &self.callback {
            cb(&job);
        }
        true
    }

    /// Drive one connect attempt through to `Subscribed` or exhausted
    /// retries, sleeping the FSM's backoff between attempts. Shutdown is via
    /// `shutdown: &mut broadcast::Receiver<()>`-style cancellation left to
    /// the caller's `tokio::select!` around `run`; this loop itself is
    /// immediate to cancel since every suspension point is a `.await`.
    pub async fn run(&self, source: &mut dyn ChangeFeedSource) {
        *self.state.write().await = ConnectionState::Connecting;

        loop {
            let outcome = match source.connect().await {
                Ok(()) => AttemptOutcome::Subscribed,
                Err(e) => {
                    tracing::warn!(error = %e, "realtime connect failed");
                    AttemptOutcome::Failed
                }
            };

            let retry_count = self.failed_attempts.load(Ordering::SeqCst);
            let (new_state, give_up) =
                next_state(ConnectionState::Connecting, outcome, retry_count, self.config.max_retries);
            *self.state.write().await = new_state;

            match outcome {
                AttemptOutcome::Subscribed => {
                    self.failed_attempts.store(0, Ordering::SeqCst);
                    break;
                }
                AttemptOutcome::Failed => {
                    let attempt = self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if give_up {
                        tracing::error!("realtime subscription exhausted retries, staying in Error");
                        return;
                    }
                    let delay = backoff_delay(self.config.reconnect_delay_base, RECONNECT_CAP, attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // Subscribed: drain events until the source ends or errors.
        loop {
            match source.recv().await {
                Ok(Some(event)) => {
                    self.handle_event(event);
                }
                Ok(None) => {
                    tracing::info!("realtime stream ended cleanly, reconnecting");
                    *self.state.write().await = ConnectionState::Reconnecting;
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "realtime stream errored, reconnecting");
                    *self.state.write().await = ConnectionState::Error;
                    return;
                }
            }
        }
    }
}
