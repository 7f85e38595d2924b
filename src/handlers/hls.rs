/// HLS Proxy handlers: fetch objects from the private bucket, rewrite
/// playlists so players never see the object store directly, and stream
/// segments through without buffering.
use actix_web::{web, HttpRequest, HttpResponse, HttpResponseBuilder};
use futures::TryStreamExt;
use tokio_util::io::ReaderStream;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::proxy;
use crate::storage::ObjectStore;

fn add_cors(builder: &mut HttpResponseBuilder) {
    builder.insert_header(("Access-Control-Allow-Origin", "*"));
}

fn upstream_error_response(e: AppError) -> HttpResponse {
    let mut builder = HttpResponse::BadGateway();
    add_cors(&mut builder);
    builder.json(serde_json::json!({ "error": "upstream_error", "detail": e.to_string() }))
}

/// Every response from this proxy carries CORS, including a 404 for a
/// missing object — `AppError`'s generic `ResponseError` impl doesn't know
/// about that requirement, so this route builds the 404 itself instead of
/// letting the error propagate through it.
fn not_found_response(e: AppError) -> HttpResponse {
    let mut builder = HttpResponse::NotFound();
    add_cors(&mut builder);
    builder.json(serde_json::json!({ "error": "not_found", "detail": e.to_string() }))
}

/// `GET /hls/{prefix}/master.m3u8`
pub async fn master_playlist(
    object_store: web::Data<ObjectStore>,
    config: web::Data<Config>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let output_prefix = path.into_inner();
    let key = format!("{output_prefix}/master.m3u8");

    let bytes = match object_store.get(&key).await {
        Ok(bytes) => bytes,
        Err(e @ AppError::NotFound(_)) => return Ok(not_found_response(e)),
        Err(e) => return Ok(upstream_error_response(e)),
    };
    let body = String::from_utf8_lossy(&bytes);
    let rewritten = proxy::rewrite_master(&body, &config.app.base_url, &output_prefix);

    let mut builder = HttpResponse::Ok();
    add_cors(&mut builder);
    builder.content_type("application/vnd.apple.mpegurl");
    Ok(builder.body(rewritten))
}

/// `GET /hls/{prefix}/{tag}/playlist.m3u8`
pub async fn variant_playlist(
    object_store: web::Data<ObjectStore>,
    config: web::Data<Config>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (output_prefix, tag) = path.into_inner();
    let key = format!("{output_prefix}/{tag}/index.m3u8");

    let bytes = match object_store.get(&key).await {
        Ok(bytes) => bytes,
        Err(e @ AppError::NotFound(_)) => return Ok(not_found_response(e)),
        Err(e) => return Ok(upstream_error_response(e)),
    };
    let body = String::from_utf8_lossy(&bytes);
    let rewritten = proxy::rewrite_variant(&body, &config.app.base_url, &output_prefix, &tag);

    let mut builder = HttpResponse::Ok();
    add_cors(&mut builder);
    builder.content_type("application/vnd.apple.mpegurl");
    Ok(builder.body(rewritten))
}

/// `GET /hls/{prefix}/{tag}/{segment}` — streamed straight through,
/// forwarding a client `Range` header to the Object Store.
pub async fn segment(
    object_store: web::Data<ObjectStore>,
    req: HttpRequest,
    path: web::Path<(String, String, String)>,
) -> Result<HttpResponse> {
    let (output_prefix, tag, segment) = path.into_inner();
    let key = format!("{output_prefix}/{tag}/{segment}");

    let range = req
        .headers()
        .get(actix_web::http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let is_range_request = range.is_some();

    let stream = match object_store.get_stream(&key, range).await {
        Ok(stream) => stream,
        Err(e @ AppError::NotFound(_)) => return Ok(not_found_response(e)),
        Err(e) => return Ok(upstream_error_response(e)),
    };

    let reader = stream.body.into_async_read();
    let body_stream = ReaderStream::new(reader).map_err(actix_web::error::ErrorBadGateway);

    let mut builder = if is_range_request { HttpResponse::PartialContent() } else { HttpResponse::Ok() };
    add_cors(&mut builder);
    builder.content_type("video/MP2T");
    builder.insert_header(("Accept-Ranges", "bytes"));
    builder.insert_header(("Cache-Control", "public, max-age=31536000"));
    if let Some(content_length) = stream.content_length {
        builder.insert_header(("Content-Length", content_length.to_string()));
    }

    Ok(builder.streaming(body_stream))
}
