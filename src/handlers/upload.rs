/// Admission handlers — accept an already-stored upload reference and
/// start its journey through the pipeline.
use actix_web::web;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::db::job_repo;
use crate::error::{AppError, Result};
use crate::models::{CreateJobRequest, CreateJobResponse, Job, QueuePayload, Stage};
use crate::queue::{QueueName, Scheduler};

/// Source uploads larger than this are rejected at admission rather than
/// failing partway through an encode.
const MAX_SOURCE_SIZE_BYTES: i64 = 5 * 1024 * 1024 * 1024;

/// `POST /v1/upload` — create a Job for an already-uploaded object and
/// enqueue it on the `fast` lane. Multipart handling and the actual
/// object-store write happen upstream of this service; this handler only
/// ever sees the resulting `raw_object_key`.
pub async fn create_job(
    pool: web::Data<PgPool>,
    scheduler: web::Data<Mutex<Scheduler>>,
    config: web::Data<Config>,
    req: web::Json<CreateJobRequest>,
) -> Result<actix_web::HttpResponse> {
    if req.raw_object_key.trim().is_empty() {
        return Err(AppError::ValidationError("raw_object_key is required".to_string()));
    }
    if req.original_size > MAX_SOURCE_SIZE_BYTES {
        return Err(AppError::ValidationError(format!(
            "source size {} exceeds the {}-byte cap",
            req.original_size, MAX_SOURCE_SIZE_BYTES
        )));
    }

    let job_id = Uuid::new_v4().to_string();
    let output_prefix = Job::derive_output_prefix(&req.raw_object_key);

    let job = job_repo::create(
        pool.get_ref(),
        &job_id,
        &req.original_filename,
        req.original_size,
        &req.mime_type,
        &req.raw_object_key,
        &output_prefix,
        Stage::Fast.as_str(),
        crate::queue::MAX_ATTEMPTS,
        req.correlation_id.as_deref(),
    )
    .await?;

    enqueue_job(&scheduler, &job, Stage::Fast, req.correlation_id.as_deref()).await?;
    job_repo::mark_queued(pool.get_ref(), &job.job_id).await?;

    let status_url = format!("{}/v1/jobs/{}/status", config.app.base_url, job.job_id);
    Ok(actix_web::HttpResponse::Accepted().json(CreateJobResponse {
        job_id: job.job_id,
        status_url,
    }))
}

/// Build the queue payload for `job` and enqueue it on the queue matching
/// `stage`. Shared with the retry handler, which re-enqueues onto a job's
/// own current stage rather than always `fast`.
pub(crate) async fn enqueue_job(
    scheduler: &web::Data<Mutex<Scheduler>>,
    job: &Job,
    stage: Stage,
    correlation_id: Option<&str>,
) -> Result<()> {
    let payload = QueuePayload {
        job_id: job.job_id.clone(),
        raw_object_key: job.raw_object_key.clone(),
        original_filename: job.original_filename.clone(),
        output_prefix: job.output_prefix.clone(),
        stage: stage.as_str().to_string(),
        correlation_id: correlation_id.map(|s| s.to_string()),
    };

    let queue = match stage {
        Stage::Fast => QueueName::Fast,
        Stage::Background => QueueName::Background,
    };

    let mut scheduler = scheduler.lock().await;
    scheduler.enqueue(queue, payload).await
}
