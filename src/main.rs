/// Transcode Pipeline - Admission API & HLS Proxy
///
/// Accepts already-stored upload references, tracks Job lifecycle, and
/// serves the resulting HLS tree back through a playlist-rewriting proxy.
use actix_cors::Cors;
use actix_web::{middleware as actix_middleware, web, App, HttpResponse, HttpServer};
use sqlx::postgres::PgPoolOptions;
use std::io;
use tokio::sync::Mutex;
use transcode_pipeline::config::Config;
use transcode_pipeline::handlers;
use transcode_pipeline::queue::Scheduler;
use transcode_pipeline::storage::ObjectStore;

#[actix_web::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("failed to load configuration");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .expect("failed to connect to the job store database");

    let object_store = ObjectStore::new(&config.object_store).await;
    object_store
        .health_check()
        .await
        .expect("object store health check failed, refusing to start");

    let scheduler = Scheduler::connect(&config.queue.redis_url)
        .await
        .expect("failed to connect to the queue backend");

    let bind_address = format!("{}:{}", config.app.host, config.app.port);
    tracing::info!(bind_address = %bind_address, "transcode-api starting");

    let pool_data = web::Data::new(pool);
    let scheduler_data = web::Data::new(Mutex::new(scheduler));
    let object_store_data = web::Data::new(object_store);
    let config_data = web::Data::new(config.clone());

    HttpServer::new(move || {
        let cors = build_cors(&config.cors.allowed_origins);

        App::new()
            .wrap(actix_middleware::Logger::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .wrap(cors)
            .app_data(pool_data.clone())
            .app_data(scheduler_data.clone())
            .app_data(object_store_data.clone())
            .app_data(config_data.clone())
            .route(
                "/api/upload/v1/healthz",
                web::get().to(|| async { HttpResponse::Ok().json(serde_json::json!({"status": "ok"})) }),
            )
            .route("/api/upload/v1/upload", web::post().to(handlers::create_job))
            .route("/api/upload/v1/jobs", web::get().to(handlers::list_jobs))
            .route("/api/upload/v1/jobs/{job_id}/status", web::get().to(handlers::get_status))
            .route("/api/upload/v1/jobs/{job_id}/retry", web::post().to(handlers::retry_job))
            .route("/api/upload/v1/jobs/{job_id}", web::delete().to(handlers::delete_job))
            .route("/api/upload/v1/queue/stats", web::get().to(handlers::queue_stats))
            // `prefix` is matched non-greedily against the rest of the path since
            // it can itself contain slashes (derived from a nested raw_object_key).
            .route("/api/upload/hls/{prefix:.*}/master.m3u8", web::get().to(handlers::master_playlist))
            .route(
                "/api/upload/hls/{prefix:.*}/{tag}/playlist.m3u8",
                web::get().to(handlers::variant_playlist),
            )
            .route(
                "/api/upload/hls/{prefix:.*}/{tag}/{segment}",
                web::get().to(handlers::segment),
            )
    })
    .bind(&bind_address)?
    .run()
    .await
}

fn build_cors(allowed_origins: &[String]) -> Cors {
    if allowed_origins.iter().any(|o| o == "*") {
        return Cors::permissive();
    }

    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "DELETE"])
        .allow_any_header();
    for origin in allowed_origins {
        cors = cors.allowed_origin(origin);
    }
    cors
}
