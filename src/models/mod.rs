/// Data models for the transcode pipeline
///
/// This module defines structures for:
/// - Job: the durable unit of work tracked in the Job Store
/// - Queue payload: the ephemeral envelope carried by the Queue & Scheduler
/// - Request/response DTOs for the admission API
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The four resolutions the encoder driver knows how to produce, ascending.
pub const ALL_RESOLUTIONS: [&str; 4] = ["360p", "480p", "720p", "1080p"];

// ========================================
// Job Models
// ========================================

/// Job status in the system lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `true` once a job has reached a state only administrative deletion
    /// may transition away from.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Which lane of the two-stage scheduler a job is (or was) executing in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fast,
    Background,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Background => "background",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(Self::Fast),
            "background" => Some(Self::Background),
            _ => None,
        }
    }

    /// Resolutions the encoder driver must produce for this stage.
    pub fn target_resolutions(&self) -> Vec<&'static str> {
        match self {
            Self::Fast => vec!["360p"],
            Self::Background => vec!["480p", "720p", "1080p"],
        }
    }

    /// Resolutions referenced in the stage's generated master playlist.
    /// `background` supersets `fast`'s output since the prior stage's
    /// 360p rendition already exists alongside the new ones.
    pub fn playlist_resolutions(&self) -> Vec<&'static str> {
        match self {
            Self::Fast => vec!["360p"],
            Self::Background => vec!["360p", "480p", "720p", "1080p"],
        }
    }
}

/// Per-resolution encode status tracked within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionProgress {
    pub status: ResolutionStatus,
    pub progress: i32,
}

impl Default for ResolutionProgress {
    fn default() -> Self {
        Self {
            status: ResolutionStatus::Pending,
            progress: 0,
        }
    }
}

/// Failure detail recorded on a job once it reaches `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// The durable unit of work. One row per stage: the `fast` stage and its
/// `background` sibling are two independent `Job` rows linked only by a
/// shared `raw_object_key`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub job_id: String,
    pub original_filename: String,
    pub original_size: i64,
    pub mime_type: String,
    pub raw_object_key: String,
    pub output_prefix: String,
    pub status: String,
    pub stage: String,
    pub progress: i32,
    #[sqlx(json)]
    pub per_resolution: sqlx::types::Json<HashMap<String, ResolutionProgress>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub hls_master_url: Option<String>,
    #[sqlx(json)]
    pub error: sqlx::types::Json<Option<JobError>>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
}

impl Job {
    pub fn get_status(&self) -> JobStatus {
        JobStatus::from_str(&self.status).unwrap_or(JobStatus::Pending)
    }

    pub fn get_stage(&self) -> Stage {
        Stage::from_str(&self.stage).unwrap_or(Stage::Fast)
    }

    /// Derive the object-store prefix HLS output lands under from a raw
    /// upload key: strip the conventional `raw-videos/` segment and the
    /// file extension.
    pub fn derive_output_prefix(raw_object_key: &str) -> String {
        let stripped = raw_object_key
            .strip_prefix("raw-videos/")
            .unwrap_or(raw_object_key);
        match stripped.rfind('.') {
            Some(idx) => stripped[..idx].to_string(),
            None => stripped.to_string(),
        }
    }
}

/// Job detail view returned by the status endpoint and embedded in list
/// responses.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub status: String,
    pub stage: String,
    pub progress: i32,
    pub per_resolution: HashMap<String, ResolutionProgress>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub hls_master_url: Option<String>,
    pub error: Option<JobError>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub correlation_id: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            stage: job.stage,
            progress: job.progress,
            per_resolution: job.per_resolution.0,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            hls_master_url: job.hls_master_url,
            error: job.error.0,
            created_at: job.created_at.timestamp(),
            completed_at: job.completed_at.map(|dt| dt.timestamp()),
            failed_at: job.failed_at.map(|dt| dt.timestamp()),
            correlation_id: job.correlation_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

// ========================================
// Admission API DTOs
// ========================================

/// Request body for the upload-admission endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub raw_object_key: String,
    pub original_filename: String,
    pub original_size: i64,
    pub mime_type: String,
    pub correlation_id: Option<String>,
}

/// Response for the upload-admission endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status_url: String,
}

// ========================================
// Queue Models
// ========================================

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub queues: HashMap<String, QueueStats>,
    pub jobs_by_status: HashMap<String, i64>,
}

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub delayed: i64,
    pub in_flight: i64,
}

/// Ephemeral payload carried by a queue entry; the queue backend owns its
/// own bookkeeping fields (attempts_made, lock_owner, lock_expires_at,
/// stall_count) separately from this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePayload {
    pub job_id: String,
    pub raw_object_key: String,
    pub original_filename: String,
    pub output_prefix: String,
    pub stage: String,
    pub correlation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_output_prefix_strips_raw_videos_and_extension() {
        assert_eq!(
            Job::derive_output_prefix("raw-videos/abc-sample.mp4"),
            "abc-sample"
        );
        assert_eq!(
            Job::derive_output_prefix("raw-videos/nested/path-video.mov"),
            "nested/path-video"
        );
    }

    #[test]
    fn derive_output_prefix_handles_missing_prefix_or_extension() {
        assert_eq!(Job::derive_output_prefix("abc-sample.mp4"), "abc-sample");
        assert_eq!(Job::derive_output_prefix("raw-videos/noext"), "noext");
    }

    #[test]
    fn stage_resolutions_match_spec_table() {
        assert_eq!(Stage::Fast.target_resolutions(), vec!["360p"]);
        assert_eq!(Stage::Fast.playlist_resolutions(), vec!["360p"]);
        assert_eq!(
            Stage::Background.target_resolutions(),
            vec!["480p", "720p", "1080p"]
        );
        assert_eq!(
            Stage::Background.playlist_resolutions(),
            vec!["360p", "480p", "720p", "1080p"]
        );
    }

    #[test]
    fn job_status_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }
}
