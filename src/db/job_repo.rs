/// Job repository — database operations for the Job Store
///
/// Provides reusable SQL helpers for the `jobs` table so the rest of the
/// service can depend on a consistent data-access surface.
use crate::error::{AppError, Result};
use crate::models::{Job, JobError, ResolutionProgress};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;

/// Insert a new job row in `pending` status.
#[allow(clippy::too_many_arguments)]
pub async fn create(
    pool: &PgPool,
    job_id: &str,
    original_filename: &str,
    original_size: i64,
    mime_type: &str,
    raw_object_key: &str,
    output_prefix: &str,
    stage: &str,
    max_attempts: i32,
    correlation_id: Option<&str>,
) -> Result<Job> {
    let empty_resolutions: sqlx::types::Json<HashMap<String, ResolutionProgress>> =
        sqlx::types::Json(HashMap::new());

    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (
            job_id, original_filename, original_size, mime_type,
            raw_object_key, output_prefix, status, stage, progress,
            per_resolution, attempts, max_attempts, hls_master_url, error,
            created_at, correlation_id
        ) VALUES (
            $1, $2, $3, $4, $5, $6, 'pending', $7, 0,
            $8, 0, $9, NULL, NULL, NOW(), $10
        )
        RETURNING job_id, original_filename, original_size, mime_type,
                  raw_object_key, output_prefix, status, stage, progress,
                  per_resolution, attempts, max_attempts, hls_master_url, error,
                  created_at, queued_at, started_at, completed_at, failed_at,
                  correlation_id",
    )
    .bind(job_id)
    .bind(original_filename)
    .bind(original_size)
    .bind(mime_type)
    .bind(raw_object_key)
    .bind(output_prefix)
    .bind(stage)
    .bind(empty_resolutions)
    .bind(max_attempts)
    .bind(correlation_id)
    .fetch_one(pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            AppError::Conflict(format!("job {job_id} already exists"))
        }
        _ => AppError::from(e),
    })?;

    Ok(job)
}

/// Fetch a single job by id.
pub async fn get(pool: &PgPool, job_id: &str) -> Result<Job> {
    let job = sqlx::query_as::<_, Job>(
        "SELECT job_id, original_filename, original_size, mime_type,
                raw_object_key, output_prefix, status, stage, progress,
                per_resolution, attempts, max_attempts, hls_master_url, error,
                created_at, queued_at, started_at, completed_at, failed_at,
                correlation_id
         FROM jobs
         WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    job.ok_or_else(|| AppError::NotFound(format!("job not found: {job_id}")))
}

/// Partial update applied by `update`; only the `Some`/`true` fields are
/// touched.
#[derive(Debug, Default)]
pub struct JobPatch {
    pub status: Option<String>,
    pub progress: Option<i32>,
    pub hls_master_url: Option<String>,
    pub error: Option<JobError>,
    pub touch_queued_at: bool,
    pub touch_started_at: bool,
    pub touch_completed_at: bool,
    pub touch_failed_at: bool,
}

/// Apply `patch` to `job_id`. When `expected_status` is given, the write
/// is gated on the row's current status still matching it: if another
/// caller already moved the row elsewhere, zero rows match and this
/// returns `Precondition` rather than silently doing nothing — the round
/// trip law a concurrent retry/cancel race depends on to know which of
/// two competing callers actually won.
pub async fn update(
    pool: &PgPool,
    job_id: &str,
    patch: JobPatch,
    expected_status: Option<&str>,
) -> Result<()> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE jobs SET ");
    let mut first = true;

    if let Some(status) = patch.status {
        builder.push("status = ").push_bind(status);
        first = false;
    }
    if let Some(progress) = patch.progress {
        if !first {
            builder.push(", ");
        }
        builder.push("progress = ").push_bind(progress);
        first = false;
    }
    if let Some(url) = patch.hls_master_url {
        if !first {
            builder.push(", ");
        }
        builder.push("hls_master_url = ").push_bind(url);
        first = false;
    }
    if let Some(error) = patch.error {
        if !first {
            builder.push(", ");
        }
        builder
            .push("error = ")
            .push_bind(sqlx::types::Json(Some(error)));
        first = false;
    }
    for (touch, column) in [
        (patch.touch_queued_at, "queued_at"),
        (patch.touch_started_at, "started_at"),
        (patch.touch_completed_at, "completed_at"),
        (patch.touch_failed_at, "failed_at"),
    ] {
        if touch {
            if !first {
                builder.push(", ");
            }
            builder.push(format!("{column} = NOW()"));
            first = false;
        }
    }

    if first {
        return Ok(());
    }

    builder.push(" WHERE job_id = ").push_bind(job_id.to_string());
    if let Some(expected) = expected_status {
        builder.push(" AND status = ").push_bind(expected.to_string());
    }

    let result = builder.build().execute(pool).await?;

    if result.rows_affected() == 0 {
        if let Some(expected) = expected_status {
            let current = get(pool, job_id).await?;
            return Err(AppError::Precondition(format!(
                "job {job_id} is {}, expected {expected}",
                current.status
            )));
        }
        return Err(AppError::NotFound(format!("job not found: {job_id}")));
    }
    Ok(())
}

/// Transition a job to `queued` once it has been handed to the Scheduler.
pub async fn mark_queued(pool: &PgPool, job_id: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = 'queued', queued_at = NOW() WHERE job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mirror a Scheduler `active` event: the worker has claimed the job.
pub async fn mark_processing(pool: &PgPool, job_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'processing', started_at = NOW() WHERE job_id = $1",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mirror a Scheduler `progress` event.
pub async fn set_progress(pool: &PgPool, job_id: &str, progress: i32) -> Result<()> {
    sqlx::query("UPDATE jobs SET progress = $2 WHERE job_id = $1")
        .bind(job_id)
        .bind(progress)
        .execute(pool)
        .await?;
    Ok(())
}

/// Update a single resolution's encode status within the `per_resolution`
/// map.
pub async fn set_resolution_progress(
    pool: &PgPool,
    job_id: &str,
    resolution: &str,
    progress: ResolutionProgress,
) -> Result<()> {
    let job = get(pool, job_id).await?;
    let mut map = job.per_resolution.0;
    map.insert(resolution.to_string(), progress);

    sqlx::query("UPDATE jobs SET per_resolution = $2 WHERE job_id = $1")
        .bind(job_id)
        .bind(sqlx::types::Json(map))
        .execute(pool)
        .await?;
    Ok(())
}

/// Mirror a Scheduler `completed` event.
pub async fn mark_completed(pool: &PgPool, job_id: &str, hls_master_url: &str) -> Result<()> {
    sqlx::query(
        "UPDATE jobs
         SET status = 'completed', progress = 100, completed_at = NOW(), hls_master_url = $2
         WHERE job_id = $1",
    )
    .bind(job_id)
    .bind(hls_master_url)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mirror a Scheduler `failed` event.
pub async fn mark_failed(pool: &PgPool, job_id: &str, error: &JobError) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'failed', failed_at = NOW(), error = $2 WHERE job_id = $1",
    )
    .bind(job_id)
    .bind(sqlx::types::Json(Some(error.clone())))
    .execute(pool)
    .await?;
    Ok(())
}

/// Mirror a Scheduler `stalled` event: reset status to `queued` while the
/// entry awaits a new worker.
pub async fn mark_stalled(pool: &PgPool, job_id: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = 'queued' WHERE job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn increment_attempts(pool: &PgPool, job_id: &str) -> Result<i32> {
    let attempts: (i32,) = sqlx::query_as(
        "UPDATE jobs SET attempts = attempts + 1 WHERE job_id = $1 RETURNING attempts",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;
    Ok(attempts.0)
}

pub struct ListFilter {
    pub status: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list(pool: &PgPool, filter: &ListFilter) -> Result<Vec<Job>> {
    let jobs = match &filter.status {
        Some(status) => {
            sqlx::query_as::<_, Job>(
                "SELECT job_id, original_filename, original_size, mime_type,
                        raw_object_key, output_prefix, status, stage, progress,
                        per_resolution, attempts, max_attempts, hls_master_url, error,
                        created_at, queued_at, started_at, completed_at, failed_at,
                        correlation_id
                 FROM jobs
                 WHERE status = $1
                 ORDER BY created_at DESC
                 LIMIT $2 OFFSET $3",
            )
            .bind(status)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Job>(
                "SELECT job_id, original_filename, original_size, mime_type,
                        raw_object_key, output_prefix, status, stage, progress,
                        per_resolution, attempts, max_attempts, hls_master_url, error,
                        created_at, queued_at, started_at, completed_at, failed_at,
                        correlation_id
                 FROM jobs
                 ORDER BY created_at DESC
                 LIMIT $1 OFFSET $2",
            )
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(jobs)
}

pub async fn count(pool: &PgPool, status: Option<&str>) -> Result<i64> {
    let total: (i64,) = match status {
        Some(status) => {
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = $1")
                .bind(status)
                .fetch_one(pool)
                .await?
        }
        None => sqlx::query_as("SELECT COUNT(*) FROM jobs").fetch_one(pool).await?,
    };
    Ok(total.0)
}

pub async fn count_by_status(pool: &PgPool) -> Result<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}

/// Delete a job. Refuses to delete a job currently `processing`.
pub async fn delete(pool: &PgPool, job_id: &str) -> Result<()> {
    let job = get(pool, job_id).await?;
    if job.status == "processing" {
        return Err(AppError::Conflict(
            "cannot delete a job while it is processing".to_string(),
        ));
    }

    sqlx::query("DELETE FROM jobs WHERE job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}
