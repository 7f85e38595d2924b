//! Transcode Worker — binds to a single queue (`fast` or `background`) and
//! runs the claim -> process -> mirror loop, plus a periodic stall sweep.
//!
//! Environment variables:
//! - WORKER_QUEUE: which queue to bind to, "fast" or "background" (overridden by --queue)
//! - DATABASE_URL, REDIS_URL: backing stores, see `transcode_pipeline::config`
//! - WORKER_TEMP_DIR_ROOT: scoped tempdir root for in-flight encodes
//! - WORKER_ENCODER_HEARTBEAT_SECS, WORKER_ENCODER_KILL_GRACE_SECS: ffmpeg supervision timing

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use transcode_pipeline::config::Config;
use transcode_pipeline::db::job_repo;
use transcode_pipeline::queue::{QueueName, Scheduler};
use transcode_pipeline::storage::ObjectStore;
use transcode_pipeline::worker::{self, WorkerContext};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("transcode_worker=info".parse().expect("valid directive"))
                .add_directive("transcode_pipeline=info".parse().expect("valid directive")),
        )
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let queue = resolve_queue(&config)?;
    info!(queue = queue.as_str(), "starting transcode worker");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;

    let object_store = ObjectStore::new(&config.object_store).await;
    object_store
        .health_check()
        .await
        .map_err(|e| format!("object store unreachable at startup: {e}"))?;

    let scheduler = Scheduler::connect(&config.queue.redis_url).await?;
    let worker_id = format!("{}-{}", queue.as_str(), std::process::id());

    let ctx = Arc::new(Mutex::new(WorkerContext {
        pool: pool.clone(),
        scheduler,
        object_store,
        config: config.clone(),
        worker_id,
        queue,
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl_c");
        info!("shutdown signal received");
        let _ = shutdown_tx_clone.send(true);
    });

    let sweep_handle = spawn_stall_sweeper(ctx.clone(), queue, &config, shutdown_rx.clone());

    info!("entering claim loop");
    worker::run(ctx, shutdown_rx).await;

    info!("waiting for stall sweeper to finish");
    let _ = sweep_handle.await;

    info!("transcode worker stopped");
    Ok(())
}

fn resolve_queue(config: &Config) -> std::result::Result<QueueName, Box<dyn std::error::Error>> {
    let requested = std::env::args()
        .collect::<Vec<_>>()
        .windows(2)
        .find(|pair| pair[0] == "--queue")
        .map(|pair| pair[1].clone())
        .unwrap_or_else(|| config.worker.queue.clone());

    QueueName::from_str(&requested)
        .ok_or_else(|| format!("unknown queue '{requested}', expected 'fast' or 'background'").into())
}

/// Periodically promote due delayed entries and fail/requeue stalled ones,
/// mirroring each resulting event into the Job Store.
fn spawn_stall_sweeper(
    ctx: Arc<Mutex<WorkerContext>>,
    queue: QueueName,
    config: &Config,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval_secs = match queue {
        QueueName::Fast => config.queue.fast_stall_check_secs,
        QueueName::Background => config.queue.background_stall_check_secs,
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        interval.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("stall sweeper shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    let mut guard = ctx.lock().await;
                    let now = now_millis();
                    if let Err(e) = guard.scheduler.promote_delayed(queue, now).await {
                        warn!(error = %e, "failed to promote delayed entries");
                    }
                    match guard.scheduler.sweep_stalled(queue).await {
                        Ok(events) => {
                            for event in events {
                                mirror_stall_event(&guard.pool, event).await;
                            }
                        }
                        Err(e) => error!(error = %e, "stall sweep failed"),
                    }
                }
            }
        }
    })
}

async fn mirror_stall_event(pool: &sqlx::PgPool, event: transcode_pipeline::queue::QueueEvent) {
    use transcode_pipeline::queue::QueueEvent;
    let result = match event {
        QueueEvent::Stalled { job_id } => job_repo::mark_stalled(pool, &job_id).await,
        QueueEvent::Failed { job_id, reason } => {
            let error = transcode_pipeline::models::JobError {
                message: reason,
                detail: None,
                occurred_at: chrono::Utc::now(),
            };
            job_repo::mark_failed(pool, &job_id, &error).await
        }
        _ => Ok(()),
    };
    if let Err(e) = result {
        error!(error = %e, "failed to mirror stall-sweep event");
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}
