/// Configuration management for the transcode pipeline
///
/// Loads configuration from environment variables with sensible defaults.
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub cors: CorsConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub object_store: ObjectStoreConfig,
    pub worker: WorkerConfig,
    pub webhook: Option<WebhookConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub env: String,
    /// Base URL other services (worker webhooks, HLS clients) use to reach
    /// this API, e.g. "https://transcode.example.com".
    pub base_url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Redis connection backing the Queue & Scheduler.
#[derive(Clone, Debug, Deserialize)]
pub struct QueueConfig {
    pub redis_url: String,
    /// Seconds a `BLPOP` call blocks before the worker loop re-checks for
    /// shutdown.
    pub poll_timeout_secs: u64,
    /// How often the stall-sweep tick runs for the `fast` queue.
    pub fast_stall_check_secs: u64,
    /// How often the stall-sweep tick runs for the `background` queue.
    pub background_stall_check_secs: u64,
    /// Lock duration granted to a claimed `fast` entry before it is
    /// considered stalled.
    pub fast_lock_ttl_secs: u64,
    /// Lock duration granted to a claimed `background` entry before it is
    /// considered stalled.
    pub background_lock_ttl_secs: u64,
    /// How often an in-flight `fast` job's worker renews its lock.
    pub fast_lock_renew_secs: u64,
    /// How often an in-flight `background` job's worker renews its lock.
    pub background_lock_renew_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Custom endpoint for S3-compatible stores (e.g. MinIO). `None` uses
    /// AWS's default resolver.
    pub endpoint_url: Option<String>,
    /// MinIO and other non-AWS stores require path-style addressing.
    pub force_path_style: bool,
    /// Seconds a presigned GET URL remains valid.
    pub presign_expiry_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WorkerConfig {
    /// Which queue this worker process binds to: "fast" or "background".
    /// Overridden by the `--queue` CLI flag if present.
    pub queue: String,
    /// Root directory scoped temp dirs are created under.
    pub temp_dir_root: String,
    /// Seconds without an encoder progress line before the heartbeat
    /// check fires.
    pub encoder_heartbeat_secs: u64,
    /// Grace period after SIGTERM before the encoder is sent SIGKILL.
    pub encoder_kill_grace_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub shared_secret: String,
    pub timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Config {
            app: AppConfig {
                host: std::env::var("TRANSCODE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("TRANSCODE_PORT")
                    .unwrap_or_else(|_| "8082".to_string())
                    .parse()
                    .unwrap_or(8082),
                env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                base_url: std::env::var("TRANSCODE_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:8082".to_string()),
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_else(|_| vec!["*".to_string()]),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/transcode".to_string()),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            queue: QueueConfig {
                redis_url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost".to_string()),
                poll_timeout_secs: std::env::var("QUEUE_POLL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
                fast_stall_check_secs: std::env::var("QUEUE_FAST_STALL_CHECK_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
                background_stall_check_secs: std::env::var("QUEUE_BACKGROUND_STALL_CHECK_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
                fast_lock_ttl_secs: std::env::var("QUEUE_FAST_LOCK_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
                background_lock_ttl_secs: std::env::var("QUEUE_BACKGROUND_LOCK_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(600),
                fast_lock_renew_secs: std::env::var("QUEUE_FAST_LOCK_RENEW_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
                background_lock_renew_secs: std::env::var("QUEUE_BACKGROUND_LOCK_RENEW_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            },
            object_store: ObjectStoreConfig {
                bucket: std::env::var("OBJECT_STORE_BUCKET")
                    .unwrap_or_else(|_| "transcode-pipeline".to_string()),
                region: std::env::var("OBJECT_STORE_REGION")
                    .unwrap_or_else(|_| "us-east-1".to_string()),
                access_key_id: std::env::var("OBJECT_STORE_ACCESS_KEY_ID").ok(),
                secret_access_key: std::env::var("OBJECT_STORE_SECRET_ACCESS_KEY").ok(),
                endpoint_url: std::env::var("OBJECT_STORE_ENDPOINT_URL").ok(),
                force_path_style: std::env::var("OBJECT_STORE_FORCE_PATH_STYLE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(false),
                presign_expiry_secs: std::env::var("OBJECT_STORE_PRESIGN_EXPIRY_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(900),
            },
            worker: WorkerConfig {
                queue: std::env::var("WORKER_QUEUE").unwrap_or_else(|_| "fast".to_string()),
                temp_dir_root: std::env::var("WORKER_TEMP_DIR_ROOT")
                    .unwrap_or_else(|_| std::env::temp_dir().to_string_lossy().to_string()),
                encoder_heartbeat_secs: std::env::var("WORKER_ENCODER_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
                encoder_kill_grace_secs: std::env::var("WORKER_ENCODER_KILL_GRACE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            },
            webhook: parse_webhook_config(),
        })
    }
}

fn parse_webhook_config() -> Option<WebhookConfig> {
    let url = std::env::var("WEBHOOK_URL").ok()?;
    let shared_secret = std::env::var("WEBHOOK_SHARED_SECRET").ok()?;
    let timeout_secs = std::env::var("WEBHOOK_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);

    Some(WebhookConfig {
        url,
        shared_secret,
        timeout_secs,
    })
}
