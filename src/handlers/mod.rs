/// HTTP handlers for the admission API and the HLS proxy.
///
/// This module contains handlers for:
/// - Upload: admit a stored object reference and start its Job
/// - Jobs: status, list, retry, delete, queue stats
/// - Hls: playlist rewriting and segment streaming

pub mod hls;
pub mod jobs;
pub mod upload;

pub use hls::{master_playlist, segment, variant_playlist};
pub use jobs::{delete_job, get_status, list_jobs, queue_stats, retry_job};
pub use upload::create_job;
