/// Job lifecycle handlers: status, list, retry, delete, queue stats.
use actix_web::web;
use sqlx::PgPool;
use tokio::sync::Mutex;

use super::upload::enqueue_job;
use crate::db::job_repo::{self, JobPatch, ListFilter};
use crate::error::{AppError, Result};
use crate::models::{JobListQuery, JobListResponse, JobStatus, JobView, QueueStats, QueueStatsResponse};
use crate::queue::{QueueName, Scheduler};

/// `GET /v1/jobs/{job_id}/status`
pub async fn get_status(pool: web::Data<PgPool>, job_id: web::Path<String>) -> Result<actix_web::HttpResponse> {
    let job = job_repo::get(pool.get_ref(), &job_id).await?;
    Ok(actix_web::HttpResponse::Ok().json(JobView::from(job)))
}

/// `GET /v1/jobs`
pub async fn list_jobs(
    pool: web::Data<PgPool>,
    query: web::Query<JobListQuery>,
) -> Result<actix_web::HttpResponse> {
    let filter = ListFilter {
        status: query.status.clone(),
        limit: query.limit,
        offset: query.offset,
    };

    let jobs = job_repo::list(pool.get_ref(), &filter).await?;
    let total = job_repo::count(pool.get_ref(), filter.status.as_deref()).await?;

    Ok(actix_web::HttpResponse::Ok().json(JobListResponse {
        jobs: jobs.into_iter().map(JobView::from).collect(),
        total,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

/// `POST /v1/jobs/{job_id}/retry` — only a `failed` Job under its attempt
/// cap may be retried; a concurrent retry of the same Job yields exactly
/// one success, the other a `Conflict`.
pub async fn retry_job(
    pool: web::Data<PgPool>,
    scheduler: web::Data<Mutex<Scheduler>>,
    job_id: web::Path<String>,
) -> Result<actix_web::HttpResponse> {
    let job = job_repo::get(pool.get_ref(), &job_id).await?;

    if job.get_status() != JobStatus::Failed {
        return Err(AppError::Precondition(format!(
            "job {} is {}, not failed",
            job.job_id, job.status
        )));
    }
    if job.attempts >= job.max_attempts {
        return Err(AppError::Precondition(format!(
            "job {} already exhausted its {} attempts",
            job.job_id, job.max_attempts
        )));
    }

    // Atomically claim the retry: only one of two concurrent requests for
    // the same failed job can flip `failed` -> `queued`. The loser's
    // precondition fails here and is reported as a `Conflict`, not a
    // second successful retry.
    let patch = JobPatch {
        status: Some("queued".to_string()),
        touch_queued_at: true,
        ..Default::default()
    };
    job_repo::update(pool.get_ref(), &job.job_id, patch, Some("failed"))
        .await
        .map_err(|e| match e {
            AppError::Precondition(_) => AppError::Conflict(format!("job {} is no longer failed", job.job_id)),
            other => other,
        })?;

    enqueue_job(&scheduler, &job, job.get_stage(), job.correlation_id.as_deref()).await?;

    let job = job_repo::get(pool.get_ref(), &job.job_id).await?;
    Ok(actix_web::HttpResponse::Ok().json(JobView::from(job)))
}

/// `DELETE /v1/jobs/{job_id}` — refuses a Job currently `processing`.
pub async fn delete_job(pool: web::Data<PgPool>, job_id: web::Path<String>) -> Result<actix_web::HttpResponse> {
    job_repo::delete(pool.get_ref(), &job_id).await?;
    Ok(actix_web::HttpResponse::Ok().finish())
}

/// `GET /v1/queue/stats`
pub async fn queue_stats(
    pool: web::Data<PgPool>,
    scheduler: web::Data<Mutex<Scheduler>>,
) -> Result<actix_web::HttpResponse> {
    let mut scheduler = scheduler.lock().await;

    let (fast_waiting, fast_delayed, fast_in_flight) = scheduler.stats(QueueName::Fast).await?;
    let (bg_waiting, bg_delayed, bg_in_flight) = scheduler.stats(QueueName::Background).await?;
    drop(scheduler);

    let jobs_by_status = job_repo::count_by_status(pool.get_ref()).await?;

    let mut queues = std::collections::HashMap::new();
    queues.insert(
        QueueName::Fast.as_str().to_string(),
        QueueStats { waiting: fast_waiting, delayed: fast_delayed, in_flight: fast_in_flight },
    );
    queues.insert(
        QueueName::Background.as_str().to_string(),
        QueueStats { waiting: bg_waiting, delayed: bg_delayed, in_flight: bg_in_flight },
    );

    Ok(actix_web::HttpResponse::Ok().json(QueueStatsResponse { queues, jobs_by_status }))
}
