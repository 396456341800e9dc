//! notifyd-orchestrator — Orchestration Loop (C8)
//!
//! A single long-lived supervisor task started at daemon boot with
//! `{tenants, cron_tick, scheduled_tick, scheduled_batch}` (spec §4.8). It
//! fires two child activities on independent cadences — C7's
//! `force_reconcile` and C5's scheduled sweep, once per monitored tenant —
//! and exits cleanly on a `stop_orchestration` signal.
//!
//! Grounded on `mqk-daemon::state::spawn_heartbeat`'s `tokio::time::interval`
//! loop, extended with `tokio::select!` over a `watch::Receiver<bool>` for
//! graceful stop the way `notifyd-reconciler::RuleReconciler::start` already
//! does for its own steady-state loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notifyd_poller::Poller;
use notifyd_reconciler::RuleReconciler;
use tokio::sync::watch;

/// Boot-time arguments for the supervisor (spec §4.8).
#[derive(Clone, Debug)]
pub struct OrchestrationConfig {
    pub tenants: Vec<String>,
    /// Default 1 minute (spec §4.8).
    pub cron_tick: Duration,
    /// Default 1 minute (spec §4.8).
    pub scheduled_tick: Duration,
    pub scheduled_batch: i64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            tenants: Vec::new(),
            cron_tick: Duration::from_secs(60),
            scheduled_tick: Duration::from_secs(60),
            scheduled_batch: 100,
        }
    }
}

/// The long-lived supervisor workflow (spec §4.8). Restart after crash is
/// safe: both `force_reconcile` and `scheduled_sweep` are idempotent, so a
/// fresh `Orchestrator` with a fresh id can simply be started again.
pub struct Orchestrator {
    config: OrchestrationConfig,
    reconciler: Arc<RuleReconciler>,
    poller: Arc<Poller>,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(config: OrchestrationConfig, reconciler: Arc<RuleReconciler>, poller: Arc<Poller>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            reconciler,
            poller,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx,
            stop_rx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the supervisor. A second `start()` while already running is a
    /// no-op (mirrors `RuleReconciler::start`'s guard).
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return tokio::spawn(async {});
        }
        let this = Arc::clone(self);
        let mut stop_rx = self.stop_rx.clone();
        tokio::spawn(async move {
            let mut cron_ticker = tokio::time::interval(this.config.cron_tick);
            let mut scheduled_ticker = tokio::time::interval(this.config.scheduled_tick);
            // `interval` fires immediately on the first `tick()`; skip that
            // burst so both cadences start from "one period from now", not
            // "immediately on boot and then again a period later".
            cron_ticker.tick().await;
            scheduled_ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cron_ticker.tick() => {
                        if let Err(e) = this.reconciler.force_reconcile().await {
                            tracing::error!(error = %e, "orchestration cron_tick: force_reconcile failed");
                        }
                    }
                    _ = scheduled_ticker.tick() => {
                        this.run_scheduled_sweep().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            this.running.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Signal the supervisor to stop (spec §4.8 `stop_orchestration`).
    /// Idempotent: sending again before the task observes the first send is
    /// harmless.
    pub fn stop_orchestration(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Scheduled sweep (spec §4.8 "invoke C5's scheduled sweep"). `list_scheduled_due`
    /// is global across tenants (spec §4.1), so one sweep per tick covers every
    /// monitored tenant; calling it once per tenant would just enqueue each due
    /// row N times for no benefit.
    async fn run_scheduled_sweep(&self) {
        if let Err(e) = self
            .poller
            .scheduled_sweep(Utc::now(), self.config.scheduled_batch)
            .await
        {
            tracing::error!(error = %e, "orchestration scheduled_tick: sweep failed");
        }
    }
}
