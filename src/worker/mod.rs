/// Transcode Worker
///
/// Binds to a single queue and runs a linear `process_job` routine per
/// claimed entry: acquire input, encode, upload outputs, finalize,
/// notify, enqueue the next stage, all bounded by cancellation
/// checkpoints and a tempdir that is always cleaned up on exit.
use crate::config::Config;
use crate::db::job_repo;
use crate::encoder::{self, JobTempDir};
use crate::error::{AppError, Result};
use crate::models::{Job, JobError, QueuePayload, ResolutionProgress, ResolutionStatus, Stage};
use crate::queue::{QueueEvent, QueueName, Scheduler};
use crate::storage::ObjectStore;
use crate::webhook::WebhookNotifier;
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub struct WorkerContext {
    pub pool: PgPool,
    pub scheduler: Scheduler,
    pub object_store: ObjectStore,
    pub config: Config,
    pub worker_id: String,
    pub queue: QueueName,
}

/// Run the claim → process → heartbeat loop until `shutdown_rx` fires.
/// New claims stop being made once shutdown is signalled; a job already
/// in flight is allowed to drain.
pub async fn run(ctx: Arc<tokio::sync::Mutex<WorkerContext>>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            tracing::info!("worker shutting down, no further claims");
            break;
        }

        let claimed = {
            let mut guard = ctx.lock().await;
            let (timeout_secs, lock_duration_secs) = queue_timing(&guard.config, guard.queue);
            let worker_id = guard.worker_id.clone();
            let queue = guard.queue;
            guard
                .scheduler
                .claim(queue, &worker_id, timeout_secs, lock_duration_secs)
                .await
        };

        let entry = match claimed {
            Ok(Some(entry)) => entry,
            Ok(None) => continue, // poll timeout elapsed, loop back to check shutdown
            Err(e) => {
                tracing::error!(error = %e, "claim failed, backing off");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        let result = process_job(&ctx, &entry.payload, entry.attempts_made).await;
        let mut guard = ctx.lock().await;
        let queue = guard.queue;
        match result {
            Ok(hls_master_url) => {
                if let Ok(event) = guard.scheduler.complete(queue, &entry.job_id, hls_master_url.clone()).await {
                    mirror_event(&guard.pool, event).await;
                }
            }
            Err(e) => {
                let event = guard
                    .scheduler
                    .retry(queue, &entry.job_id, e.to_string(), crate::queue::MAX_ATTEMPTS)
                    .await;
                if let Ok(event) = event {
                    mirror_event(&guard.pool, event).await;
                }
            }
        }
    }
}

fn queue_timing(config: &Config, queue: QueueName) -> (u64, u64) {
    match queue {
        QueueName::Fast => (config.queue.poll_timeout_secs, config.queue.fast_lock_ttl_secs),
        QueueName::Background => (config.queue.poll_timeout_secs, config.queue.background_lock_ttl_secs),
    }
}

/// Lock TTL and renew interval for an in-flight entry on `queue`.
fn lock_renewal(config: &Config, queue: QueueName) -> (u64, u64) {
    match queue {
        QueueName::Fast => (config.queue.fast_lock_ttl_secs, config.queue.fast_lock_renew_secs),
        QueueName::Background => (config.queue.background_lock_ttl_secs, config.queue.background_lock_renew_secs),
    }
}

/// Periodically calls `Scheduler::heartbeat` while a job is actively
/// encoding so the stall sweep doesn't reclaim a perfectly healthy job
/// whose encode runs past the claim's original lock TTL. The caller
/// aborts the returned handle once the job finishes.
fn spawn_lock_renewer(
    ctx: Arc<tokio::sync::Mutex<WorkerContext>>,
    queue: QueueName,
    job_id: String,
    config: &Config,
) -> tokio::task::JoinHandle<()> {
    let (lock_duration_secs, renew_interval_secs) = lock_renewal(config, queue);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(renew_interval_secs));
        interval.tick().await; // skip the immediate first tick, the claim already set the lock
        loop {
            interval.tick().await;
            let mut guard = ctx.lock().await;
            if let Err(e) = guard.scheduler.heartbeat(queue, &job_id, lock_duration_secs).await {
                tracing::warn!(job_id = %job_id, error = %e, "failed to renew job lock");
            }
        }
    })
}

async fn mirror_event(pool: &PgPool, event: QueueEvent) {
    let result = match event {
        QueueEvent::Added { .. } => Ok(()),
        QueueEvent::Active { job_id } => job_repo::mark_processing(pool, &job_id).await,
        QueueEvent::Progress { job_id, percent } => job_repo::set_progress(pool, &job_id, percent).await,
        QueueEvent::Completed { job_id, hls_master_url } => {
            job_repo::mark_completed(pool, &job_id, &hls_master_url).await
        }
        QueueEvent::Failed { job_id, reason } => {
            let attempts = job_repo::increment_attempts(pool, &job_id).await.unwrap_or(0);
            let error = JobError {
                message: reason,
                detail: Some(format!("attempt {attempts}")),
                occurred_at: chrono::Utc::now(),
            };
            job_repo::mark_failed(pool, &job_id, &error).await
        }
        QueueEvent::Stalled { job_id } => job_repo::mark_stalled(pool, &job_id).await,
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "failed to mirror queue event into job store");
    }
}

/// The 9-step routine. Returns the job's `hls_master_url` on success.
async fn process_job(
    ctx: &Arc<tokio::sync::Mutex<WorkerContext>>,
    payload: &QueuePayload,
    attempts_made: i32,
) -> Result<String> {
    let (pool, object_store, config, api_base, webhook, queue) = {
        let guard = ctx.lock().await;
        (
            guard.pool.clone(),
            guard.object_store.clone(),
            guard.config.clone(),
            guard.config.app.base_url.clone(),
            // WebhookNotifier doesn't implement Clone cheaply across the lock; re-read config instead.
            guard.config.webhook.clone(),
            guard.queue,
        )
    };

    job_repo::mark_processing(&pool, &payload.job_id).await?;
    job_repo::set_progress(&pool, &payload.job_id, 5).await?;

    let temp_dir = JobTempDir::create(Path::new(&config.worker.temp_dir_root), &payload.job_id).await?;

    let heartbeat_handle = spawn_lock_renewer(ctx.clone(), queue, payload.job_id.clone(), &config);
    let result = run_pipeline(&pool, &object_store, &config, &api_base, payload, &temp_dir).await;
    heartbeat_handle.abort();

    match &result {
        Ok(hls_master_url) => {
            if let Some(webhook_config) = webhook {
                if payload.correlation_id.is_some() {
                    let notifier = WebhookNotifier::new(webhook_config);
                    notifier
                        .notify_completed(&payload.job_id, payload.correlation_id.as_deref(), hls_master_url)
                        .await;
                }
            }

            if payload.stage == Stage::Fast.as_str() {
                enqueue_background_stage(ctx, &pool, payload).await;
            }
        }
        Err(e) => {
            tracing::error!(job_id = %payload.job_id, attempts = attempts_made, error = %e, "job processing failed");
        }
    }

    result
}

async fn run_pipeline(
    pool: &PgPool,
    object_store: &ObjectStore,
    config: &Config,
    api_base: &str,
    payload: &QueuePayload,
    temp_dir: &JobTempDir,
) -> Result<String> {
    let stage = Stage::from_str(&payload.stage).ok_or_else(|| AppError::Internal(format!("unknown stage {}", payload.stage)))?;

    let input_path = acquire_input(object_store, payload, temp_dir).await?;
    job_repo::set_progress(pool, &payload.job_id, 10).await?;

    let duration_secs = probe_duration_secs(&input_path).await.unwrap_or(0.0);

    // Fast-lane jobs trade encode quality for turnaround; background jobs
    // trade speed for quality and leave CPU headroom for the fast lane.
    let (preset, cpu_threads): (&str, Option<u32>) = match stage {
        Stage::Fast => ("ultrafast", None),
        Stage::Background => ("medium", Some(2)),
    };

    let targets = stage.target_resolutions();
    let total = targets.len().max(1) as i32;
    for (idx, resolution_name) in targets.iter().copied().enumerate() {
        let spec = encoder::resolution_spec(resolution_name)
            .ok_or_else(|| AppError::Internal(format!("unknown resolution {resolution_name}")))?;
        let output_dir = temp_dir.path().join(resolution_name);

        job_repo::set_resolution_progress(
            pool,
            &payload.job_id,
            resolution_name,
            ResolutionProgress { status: ResolutionStatus::Processing, progress: 0 },
        )
        .await?;

        let (progress_tx, mut progress_rx) = mpsc::channel::<encoder::EncodeProgress>(16);
        let watcher_job_id = payload.job_id.clone();
        let watcher_pool = pool.clone();
        let watcher = tokio::spawn(async move {
            while let Some(update) = progress_rx.recv().await {
                let _ = job_repo::set_resolution_progress(
                    &watcher_pool,
                    &watcher_job_id,
                    update.resolution,
                    ResolutionProgress { status: ResolutionStatus::Processing, progress: update.percent },
                )
                .await;
            }
        });

        let heartbeat = std::time::Duration::from_secs(config.worker.encoder_heartbeat_secs);
        let kill_grace = std::time::Duration::from_secs(config.worker.encoder_kill_grace_secs);

        let encode_result = encoder::encode_resolution(
            &input_path,
            &output_dir,
            duration_secs,
            spec,
            preset,
            cpu_threads,
            progress_tx,
            heartbeat,
            kill_grace,
        )
        .await;

        let _ = watcher.await;

        match encode_result {
            Ok(()) => {
                job_repo::set_resolution_progress(
                    pool,
                    &payload.job_id,
                    resolution_name,
                    ResolutionProgress { status: ResolutionStatus::Completed, progress: 100 },
                )
                .await?;
            }
            Err(e) => {
                job_repo::set_resolution_progress(
                    pool,
                    &payload.job_id,
                    resolution_name,
                    ResolutionProgress { status: ResolutionStatus::Failed, progress: 0 },
                )
                .await?;
                return Err(e);
            }
        }

        let overall = 10 + (((idx as i32 + 1) * 60) / total);
        job_repo::set_progress(pool, &payload.job_id, overall).await?;
    }

    let master_playlist = encoder::build_master_playlist(&stage.playlist_resolutions());
    let master_path = temp_dir.path().join("master.m3u8");
    tokio::fs::write(&master_path, master_playlist)
        .await
        .map_err(|e| AppError::Internal(format!("failed to write master playlist: {e}")))?;

    object_store
        .upload_tree(temp_dir.path(), &payload.output_prefix)
        .await?;
    job_repo::set_progress(pool, &payload.job_id, 95).await?;

    let hls_master_url = format!("{api_base}/hls/{}/master.m3u8", payload.output_prefix);
    Ok(hls_master_url)
}

async fn acquire_input(
    object_store: &ObjectStore,
    payload: &QueuePayload,
    temp_dir: &JobTempDir,
) -> Result<std::path::PathBuf> {
    let extension = Path::new(&payload.raw_object_key)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4");
    let input_path = temp_dir.path().join(format!("input.{extension}"));

    object_store.download(&payload.raw_object_key, &input_path).await?;

    Ok(input_path)
}

/// Probe the input's duration with `ffprobe`, used to turn ffmpeg's
/// `out_time_ms` progress markers into a percentage.
async fn probe_duration_secs(input_path: &Path) -> Option<f64> {
    let output = tokio::process::Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(input_path)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

async fn enqueue_background_stage(ctx: &Arc<tokio::sync::Mutex<WorkerContext>>, pool: &PgPool, payload: &QueuePayload) {
    let background_job_id = uuid::Uuid::new_v4().to_string();
    let created = job_repo::create(
        pool,
        &background_job_id,
        &payload.original_filename,
        0,
        "video/unknown",
        &payload.raw_object_key,
        &payload.output_prefix,
        Stage::Background.as_str(),
        crate::queue::MAX_ATTEMPTS,
        payload.correlation_id.as_deref(),
    )
    .await;

    let Ok(job) = created else {
        tracing::error!(job_id = %background_job_id, "failed to create background-stage job record");
        return;
    };

    enqueue_job(ctx, pool, &job, payload).await;
}

async fn enqueue_job(ctx: &Arc<tokio::sync::Mutex<WorkerContext>>, pool: &PgPool, job: &Job, source: &QueuePayload) {
    let background_payload = QueuePayload {
        job_id: job.job_id.clone(),
        raw_object_key: source.raw_object_key.clone(),
        original_filename: source.original_filename.clone(),
        output_prefix: source.output_prefix.clone(),
        stage: Stage::Background.as_str().to_string(),
        correlation_id: source.correlation_id.clone(),
    };

    let mut guard = ctx.lock().await;
    if let Err(e) = guard.scheduler.enqueue(QueueName::Background, background_payload).await {
        tracing::error!(job_id = %job.job_id, error = %e, "failed to enqueue background stage");
        return;
    }
    drop(guard);

    if let Err(e) = job_repo::mark_queued(pool, &job.job_id).await {
        tracing::error!(job_id = %job.job_id, error = %e, "failed to mark background-stage job queued");
    }
}
