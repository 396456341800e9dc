//! notifyd daemon entry point.
//!
//! Thin composition root: resolve config, build every collaborator defined
//! in `collaborators.rs`, wire up the nine spec components in the §4.9
//! start sequence, serve health/metrics, and tear everything down in
//! reverse on signal. All business logic lives in the `notifyd-*` crates;
//! this file only wires them together, the way `mqk-daemon/src/main.rs`
//! only wires `state`/`routes` together.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use notifyd_config::DaemonConfig;
use notifyd_daemon::collaborators::{
    DbStatusWriter, HttpChannelStep, HttpEngineClient, HttpTemplateRenderer, PgChangeFeedSource,
};
use notifyd_daemon::routes::build_router;
use notifyd_daemon::state::AppState;
use notifyd_delivery::{DeliveryClient, HttpDeliveryClient};
use notifyd_engine::EngineScheduleClient;
use notifyd_factory::DynamicWorkflowFactory;
use notifyd_orchestrator::{OrchestrationConfig, Orchestrator};
use notifyd_pipeline::Pipeline;
use notifyd_poller::Poller;
use notifyd_realtime::{ConnectionState, SubscriptionConfig, SubscriptionManager, TenantFilter};
use notifyd_reconciler::RuleReconciler;
use notifyd_registry::WorkflowRegistry;
use notifyd_schemas::RealtimeJob;

/// Engine workers sharing one task list (spec §4.9 start step 1). All of
/// them subscribe to the same job bus; the Claim activity's CAS makes
/// redundant delivery to more than one worker harmless (spec §4.6
/// "Concurrency"), so this is a plain fixed-size pool rather than a
/// work-stealing queue.
const NUM_PIPELINE_WORKERS: usize = 8;

/// Bound on the job bus so a stalled pipeline applies backpressure to C4/C5
/// rather than growing without limit (spec §5 "Backpressure").
const JOB_BUS_CAPACITY: usize = 4096;

/// Total deadline for the reverse stop sequence (spec §4.9).
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Grace period given to the Orchestration Loop before it is cancelled
/// outright (spec §4.9 stop step 3).
const ORCHESTRATION_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "notifyd", about = "Multi-tenant notification orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the daemon. The only subcommand; also the default when none is given.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env().context("loading daemon configuration")?;
    init_tracing(&config.log_level);
    tracing::info!(
        health_port = config.health_port,
        tenants = config.tenant_ids.len(),
        "notifyd starting"
    );

    let pool = notifyd_db::connect_from_env()
        .await
        .context("connecting to store")?;
    notifyd_db::migrate(&pool).await.context("running store migrations")?;

    let delivery: Arc<dyn DeliveryClient> = Arc::new(
        HttpDeliveryClient::new(
            config.delivery_sdk_url.clone(),
            config.secrets.delivery_sdk_secret.clone(),
        )
        .context("building delivery SDK client")?,
    );
    let renderer = Arc::new(
        HttpTemplateRenderer::new(
            config.delivery_sdk_url.clone(),
            config.secrets.delivery_sdk_secret.clone(),
        )
        .context("building template renderer client")?,
    );
    let channel_step = Arc::new(
        HttpChannelStep::new(
            config.delivery_sdk_url.clone(),
            config.secrets.delivery_sdk_secret.clone(),
        )
        .context("building channel step client")?,
    );
    let status_writer = Arc::new(DbStatusWriter::new(pool.clone()));
    let factory = Arc::new(DynamicWorkflowFactory::new(renderer, channel_step, status_writer));

    // The static catalogue of compiled-in workflow bodies (fire-drill, SMS,
    // push, ...) is out of scope for this daemon (spec §1); the static
    // index is left empty here. A deployment that ships such a catalogue
    // would call `registry.register_static(key, def)` for each before any
    // tenant load.
    let registry = Arc::new(WorkflowRegistry::new(factory));
    for tenant_id in &config.tenant_ids {
        if let Err(e) = registry.load_tenant(&pool, tenant_id).await {
            tracing::error!(tenant_id = tenant_id.as_str(), error = %e, "initial dynamic workflow load failed for tenant");
        }
    }

    let engine: Arc<dyn EngineScheduleClient> = Arc::new(
        HttpEngineClient::new(config.engine_address.clone(), config.engine_task_queue.clone())
            .context("building workflow engine client")?,
    );

    let (jobs_tx, _jobs_rx) = broadcast::channel::<RealtimeJob>(JOB_BUS_CAPACITY);

    let pipeline = Arc::new(Pipeline::new(pool.clone(), Arc::clone(&registry), Arc::clone(&delivery)));
    let workers_alive = Arc::new(AtomicBool::new(true));
    let pipeline_queue_depth = Arc::new(AtomicU64::new(0));
    let (worker_stop_tx, worker_stop_rx) = watch::channel(false);

    // --- start sequence (spec §4.9) -----------------------------------

    // 1. Engine workers.
    let mut worker_handles = Vec::with_capacity(NUM_PIPELINE_WORKERS);
    for worker_id in 0..NUM_PIPELINE_WORKERS {
        worker_handles.push(spawn_pipeline_worker(
            worker_id,
            jobs_tx.subscribe(),
            Arc::clone(&pipeline),
            Arc::clone(&pipeline_queue_depth),
            worker_stop_rx.clone(),
        ));
    }

    // 2. Orchestration workflow.
    let reconciler = Arc::new(RuleReconciler::new(pool.clone(), Arc::clone(&engine)));
    let poller = Arc::new(Poller::new(pool.clone(), jobs_tx.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestrationConfig {
            tenants: config.tenant_ids.clone(),
            cron_tick: Duration::from_secs(60),
            scheduled_tick: Duration::from_millis(config.scheduled_interval_ms),
            scheduled_batch: i64::from(config.scheduled_batch),
        },
        Arc::clone(&reconciler),
        Arc::clone(&poller),
    ));
    let orchestration_handle = orchestrator.start();

    // Catch-up sweep runs on the same cadence as the scheduled sweep,
    // closing whatever gap C4 leaves during a reconnect (spec §4.5, §8
    // scenario 6).
    let (catchup_stop_tx, mut catchup_stop_rx) = watch::channel(false);
    let catchup_handle = {
        let poller = Arc::clone(&poller);
        let tenant_filter = config.tenant_ids.first().cloned();
        let interval = Duration::from_millis(config.scheduled_interval_ms);
        let batch = i64::from(config.scheduled_batch);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = poller.catch_up_sweep(tenant_filter.as_deref(), batch).await {
                            tracing::error!(error = %e, "catch-up sweep tick failed");
                        }
                    }
                    _ = catchup_stop_rx.changed() => {
                        if *catchup_stop_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    };

    // 3. Realtime Subscription Manager, only if tenants were configured.
    let (subscriptions, realtime_stop_tx, realtime_handle) = if config.realtime_enabled() {
        let sub_config = SubscriptionConfig {
            tenants: TenantFilter::from_ids(config.tenant_ids.clone()),
            reconnect_delay_base: Duration::from_millis(config.subscription_reconnect_delay_ms),
            max_retries: config.subscription_max_retries,
            ..SubscriptionConfig::default()
        };
        let manager = Arc::new(SubscriptionManager::new(sub_config, jobs_tx.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_realtime_supervisor(Arc::clone(&manager), pool.clone(), stop_rx);
        (Some(manager), Some(stop_tx), Some(handle))
    } else {
        tracing::info!("DAEMON_TENANT_IDS empty, realtime subscription manager disabled");
        (None, None, None)
    };

    // 4. Health HTTP server.
    let app_state = Arc::new(AppState::new(
        Arc::clone(&orchestrator),
        subscriptions.clone(),
        Arc::clone(&workers_alive),
        Arc::clone(&pipeline_queue_depth),
    ));
    let router = build_router(Arc::clone(&app_state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive());
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.health_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding health server to {addr}"))?;
    tracing::info!(%addr, "health server listening");

    let (health_stop_tx, health_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let health_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = health_stop_rx.await;
            })
            .await
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping notifyd");

    // --- stop sequence (reverse order, 30s deadline; spec §4.9) -------
    let stop_result = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        // 1. Health server.
        let _ = health_stop_tx.send(());
        if let Err(e) = health_handle.await {
            tracing::error!(error = %e, "health server task panicked");
        }

        // 2. Realtime subscription manager.
        if let Some(stop_tx) = realtime_stop_tx {
            let _ = stop_tx.send(true);
        }
        if let Some(handle) = realtime_handle {
            let _ = handle.await;
        }

        // 3. Orchestration + its sweep loops: signal, then cancel after a grace period.
        orchestrator.stop_orchestration();
        let _ = catchup_stop_tx.send(true);
        if tokio::time::timeout(ORCHESTRATION_STOP_GRACE, orchestration_handle)
            .await
            .is_err()
        {
            tracing::warn!("orchestration loop did not stop within grace period, it will be cancelled");
        }
        catchup_handle.abort();

        // 4. Engine workers.
        let _ = worker_stop_tx.send(true);
        workers_alive.store(false, Ordering::SeqCst);
        for handle in worker_handles {
            let _ = handle.await;
        }
    })
    .await;

    if stop_result.is_err() {
        tracing::error!("shutdown deadline exceeded, forcing exit");
    }

    tracing::info!("notifyd stopped cleanly");
    Ok(())
}

/// One engine worker: pulls jobs off the shared bus and runs them through
/// the Pipeline (spec §4.6). A lagged receiver (the bus overran this
/// worker's backlog) just resumes at the next available job — the catch-up
/// sweep exists precisely to paper over gaps like this.
fn spawn_pipeline_worker(
    worker_id: usize,
    mut jobs_rx: broadcast::Receiver<RealtimeJob>,
    pipeline: Arc<Pipeline>,
    queue_depth: Arc<AtomicU64>,
    mut stop_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = jobs_rx.recv() => {
                    match received {
                        Ok(job) => {
                            queue_depth.fetch_add(1, Ordering::SeqCst);
                            let notification_id = job.notification_id;
                            let tenant_id = job.tenant_id.clone();
                            match pipeline.process_job(job).await {
                                Ok(outcome) => {
                                    tracing::debug!(worker_id, notification_id, tenant_id, ?outcome, "job processed");
                                }
                                Err(e) => {
                                    tracing::error!(worker_id, notification_id, tenant_id, error = %e, "pipeline job failed");
                                }
                            }
                            queue_depth.fetch_sub(1, Ordering::SeqCst);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(worker_id, skipped, "job bus lagged for this worker");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

/// Owns the Subscription Manager's connection lifecycle (spec §4.4): each
/// call to `run` drives one connect episode through to `Subscribed` (with
/// its own internal backoff) and then drains events until the stream ends
/// or errors. This loop re-enters `run` to reconnect, unless the manager
/// has permanently given up (`Error` with retries exhausted) — at that
/// point spec §4.4 calls for "stays in Error, health degraded, human
/// action required", not an automatic restart.
fn spawn_realtime_supervisor(
    manager: Arc<SubscriptionManager>,
    pool: sqlx::PgPool,
    mut stop_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut source = PgChangeFeedSource::new(pool);
        loop {
            tokio::select! {
                () = manager.run(&mut source) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return;
                    }
                }
            }

            if *stop_rx.borrow() {
                return;
            }
            if manager.state().await == ConnectionState::Error {
                tracing::error!("realtime subscription exhausted retries, giving up until operator restarts the daemon");
                return;
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    let mut sigusr2 = signal(SignalKind::user_defined2()).expect("installing SIGUSR2 handler");

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigint.recv() => tracing::info!("received SIGINT"),
        _ = sigusr2.recv() => tracing::info!("received SIGUSR2"),
    }

    // A second signal of any kind force-exits rather than waiting on the
    // graceful stop sequence (spec §4.9 "subsequent signals force-exit").
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
            _ = sigusr2.recv() => {}
        }
        tracing::error!("second shutdown signal received, forcing immediate exit");
        std::process::exit(1);
    });
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received ctrl-c");
}
