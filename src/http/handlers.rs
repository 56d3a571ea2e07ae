//! Axum handlers. Each handler resolves the fork/version row, enforces the
//! relevant auth check, then delegates to `auth`, `ingest`, `availability`,
//! `publish`, `download`, or `fileserve`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::config::{ForkSettings, WatchdogTarget};
use crate::db::manifest::ForkRow;
use crate::db::{ContentStore, ManifestStore};
use crate::error::{AppError, DownloadError};
use crate::layout::BuildLayout;
use crate::state::AppState;
use crate::{auth, availability, codec, download, fileserve, ingest, publish};

fn header_str<'a>(headers: &'a HeaderMap, name: HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn accept_encoding_has_zstd(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("zstd")))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn fork_config<'a>(state: &'a AppState, fork: &str) -> Option<&'a ForkSettings> {
    state.settings.manifest.forks.get(fork)
}

fn default_fork(state: &AppState) -> Result<String, AppError> {
    state
        .settings
        .default_fork
        .clone()
        .ok_or_else(|| AppError::NotFound("no default fork configured".to_string()))
}

fn check_fork_access(fork_row: &ForkRow, fork: &str, headers: &HeaderMap) -> Result<(), AppError> {
    if !fork_row.private {
        return Ok(());
    }
    let private_users: HashMap<String, String> = fork_row
        .private_users_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    auth::check_basic(header_str(headers, header::AUTHORIZATION), &private_users, fork)?;
    Ok(())
}

/// Fires ingestion, availability flip, and watchdog notification for `fork`
/// as a single coalesced background job.
fn spawn_ingest_chain(state: &Arc<AppState>, fork: &str, fork_cfg: &ForkSettings) {
    let content = state.content.clone();
    let manifest = state.manifest.clone();
    let layout = state.layout.clone();
    let settings = state.settings.clone();
    let http = state.http.clone();
    let client_zip_name = fork_cfg.client_zip_name.clone();
    let watchdogs = fork_cfg.notify_watchdogs.clone();
    let fork_name = fork.to_string();
    let key = format!("ingest:{fork_name}");

    state.scheduler.trigger_keyed(key, async move {
        run_ingest_chain(&content, &manifest, &layout, &settings, &http, &fork_name, &client_zip_name, &watchdogs).await;
    });
}

async fn run_ingest_chain(
    content: &ContentStore,
    manifest: &ManifestStore,
    layout: &BuildLayout,
    settings: &crate::config::Settings,
    http: &reqwest::Client,
    fork: &str,
    client_zip_name: &str,
    watchdogs: &[WatchdogTarget],
) {
    let outcome = match ingest::discover_and_ingest(content, layout, &settings.cdn, fork, client_zip_name) {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(fork, error = %err, "ingestion failed");
            return;
        }
    };
    if outcome.ingested.is_empty() {
        return;
    }
    if let Err(err) = availability::flip_available_and_rebuild(content, manifest, settings, fork, &outcome.ingested) {
        tracing::error!(fork, error = %err, "availability flip failed");
        return;
    }
    availability::notify_watchdogs(http, fork, watchdogs).await;
}

pub async fn handle_healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptimeSeconds": state.uptime_seconds(),
    }))
}

pub async fn handle_status(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let content_versions = state.content.version_count()?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "contentVersions": content_versions,
    }))
    .into_response())
}

pub async fn handle_trigger_update(
    State(state): State<Arc<AppState>>,
    Path(fork): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let fork_cfg = fork_config(&state, &fork).ok_or_else(|| AppError::NotFound(format!("unknown fork {fork}")))?;
    auth::check_bearer(header_str(&headers, header::AUTHORIZATION), &fork_cfg.update_token)?;

    spawn_ingest_chain(&state, &fork, fork_cfg);
    Ok(StatusCode::ACCEPTED.into_response())
}

pub async fn handle_fork_listing(
    State(state): State<Arc<AppState>>,
    Path(fork): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let fork_row = state
        .manifest
        .get_fork(&fork)?
        .ok_or_else(|| AppError::NotFound(format!("unknown fork {fork}")))?;
    check_fork_access(&fork_row, &fork, &headers)?;

    let versions = state.manifest.available_versions(&fork, 50)?;
    let mut html = String::from("<!doctype html>\n<html>\n<body>\n<ul>\n");
    for version in &versions {
        let client_url = state.settings.file_url(&fork, &version.name, &version.client_zip_name);
        html.push_str(&format!(
            "<li>{name} ({time}) — <a href=\"{client_url}\">client</a>",
            name = html_escape(&version.name),
            time = html_escape(&version.publish_time),
        ));
        for build in state.manifest.server_builds(version.id)? {
            let url = state.settings.file_url(&fork, &version.name, &build.file_name);
            html.push_str(&format!(", <a href=\"{url}\">{platform}</a>", platform = html_escape(&build.platform)));
        }
        html.push_str("</li>\n");
    }
    html.push_str("</ul>\n</body>\n</html>\n");

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response())
}

pub async fn handle_fork_manifest_json(
    State(state): State<Arc<AppState>>,
    Path(fork): Path<String>,
) -> Result<Response, AppError> {
    if state.manifest.get_fork(&fork)?.is_none() {
        return Err(AppError::NotFound(format!("unknown fork {fork}")));
    }
    let json = fileserve::fork_manifest_json(&state.manifest, &fork)?
        .ok_or_else(|| AppError::NotFound(format!("fork {fork} has no published manifest yet")))?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], json).into_response())
}

pub async fn handle_fork_file(
    State(state): State<Arc<AppState>>,
    Path((fork, version, file)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let fork_row = state
        .manifest
        .get_fork(&fork)?
        .ok_or_else(|| AppError::NotFound(format!("unknown fork {fork}")))?;
    check_fork_access(&fork_row, &fork, &headers)?;

    if state.manifest.get_fork_version(&fork, &version)?.is_none() {
        return Err(AppError::NotFound(format!("unknown version {fork}/{version}")));
    }

    let data = fileserve::read_artifact(&state.layout, &fork, &version, &file)?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "application/zip")], data).into_response())
}

#[derive(Deserialize)]
pub struct OneShotPublishRequest {
    pub archive: String,
    pub version: String,
    #[serde(rename = "engineVersion")]
    pub engine_version: String,
}

pub async fn handle_publish_one_shot(
    State(state): State<Arc<AppState>>,
    Path(fork): Path<String>,
    headers: HeaderMap,
    Json(req): Json<OneShotPublishRequest>,
) -> Result<Response, AppError> {
    let fork_cfg = fork_config(&state, &fork).ok_or_else(|| AppError::NotFound(format!("unknown fork {fork}")))?;
    auth::check_bearer(header_str(&headers, header::AUTHORIZATION), &fork_cfg.update_token)?;

    let version_id = publish::publish_one_shot(
        &state.content,
        &state.manifest,
        &state.layout,
        &state.http,
        &fork,
        &req.version,
        &req.engine_version,
        &fork_cfg.client_zip_name,
        &fork_cfg.server_zip_name,
        &req.archive,
        &state.settings.base_url,
    )
    .await?;

    spawn_ingest_chain(&state, &fork, fork_cfg);

    Ok((StatusCode::CREATED, Json(serde_json::json!({"versionId": version_id}))).into_response())
}

#[derive(Deserialize)]
pub struct StartPublishRequest {
    pub version: String,
    #[serde(rename = "engineVersion")]
    pub engine_version: String,
}

pub async fn handle_publish_start(
    State(state): State<Arc<AppState>>,
    Path(fork): Path<String>,
    headers: HeaderMap,
    Json(req): Json<StartPublishRequest>,
) -> Result<Response, AppError> {
    let fork_cfg = fork_config(&state, &fork).ok_or_else(|| AppError::NotFound(format!("unknown fork {fork}")))?;
    auth::check_bearer(header_str(&headers, header::AUTHORIZATION), &fork_cfg.update_token)?;

    publish::start_multi_publish(&state.manifest, &state.layout, &fork, &req.version, &req.engine_version)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn handle_publish_file(
    State(state): State<Arc<AppState>>,
    Path(fork): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let fork_cfg = fork_config(&state, &fork).ok_or_else(|| AppError::NotFound(format!("unknown fork {fork}")))?;
    auth::check_bearer(header_str(&headers, header::AUTHORIZATION), &fork_cfg.update_token)?;

    let file_name = header_str(&headers, HeaderName::from_static("robust-cdn-publish-file"))
        .ok_or_else(|| AppError::BadRequest("missing Robust-Cdn-Publish-File header".to_string()))?
        .to_string();
    let version = header_str(&headers, HeaderName::from_static("robust-cdn-publish-version"))
        .ok_or_else(|| AppError::BadRequest("missing Robust-Cdn-Publish-Version header".to_string()))?
        .to_string();

    publish::write_multi_publish_file(&state.layout, &fork, &version, &file_name, &body)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
pub struct FinishPublishRequest {
    pub version: String,
}

pub async fn handle_publish_finish(
    State(state): State<Arc<AppState>>,
    Path(fork): Path<String>,
    headers: HeaderMap,
    Json(req): Json<FinishPublishRequest>,
) -> Result<Response, AppError> {
    let fork_cfg = fork_config(&state, &fork).ok_or_else(|| AppError::NotFound(format!("unknown fork {fork}")))?;
    auth::check_bearer(header_str(&headers, header::AUTHORIZATION), &fork_cfg.update_token)?;

    let engine_version = state
        .manifest
        .in_progress_engine_version(&fork, &req.version)?
        .ok_or_else(|| AppError::NotFound(format!("no in-progress publish for {fork}/{}", req.version)))?;

    let version_id = publish::finish_multi_publish(
        &state.content,
        &state.manifest,
        &state.layout,
        &fork,
        &req.version,
        &engine_version,
        &fork_cfg.client_zip_name,
        &fork_cfg.server_zip_name,
        &state.settings.base_url,
    )?;

    spawn_ingest_chain(&state, &fork, fork_cfg);

    Ok((StatusCode::CREATED, Json(serde_json::json!({"versionId": version_id}))).into_response())
}

async fn version_manifest_response(
    state: &Arc<AppState>,
    fork: &str,
    version: &str,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let fork_row = state
        .manifest
        .get_fork(fork)?
        .ok_or_else(|| AppError::NotFound(format!("unknown fork {fork}")))?;
    check_fork_access(&fork_row, fork, headers)?;

    let version_id = state
        .content
        .find_version_id(fork, version)?
        .ok_or_else(|| AppError::NotFound(format!("unknown version {fork}/{version}")))?;

    let accepts_zstd = accept_encoding_has_zstd(headers);
    let body = fileserve::version_manifest(&state.content, version_id, accepts_zstd)?
        .ok_or_else(|| AppError::NotFound(format!("manifest missing for {fork}/{version}")))?;

    let mut response = (StatusCode::OK, body.bytes).into_response();
    response.headers_mut().insert(
        HeaderName::from_static("x-manifest-hash"),
        HeaderValue::from_str(&body.hash.to_hex_upper()).expect("hex digest is a valid header value"),
    );
    if body.zstd_encoded {
        response
            .headers_mut()
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("zstd"));
    }
    Ok(response)
}

pub async fn handle_version_manifest(
    State(state): State<Arc<AppState>>,
    Path((fork, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    version_manifest_response(&state, &fork, &version, &headers).await
}

pub async fn handle_legacy_version_manifest(
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let fork = default_fork(&state)?;
    version_manifest_response(&state, &fork, &version, &headers).await
}

pub async fn handle_download_options() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            ("X-Robust-Download-Min-Protocol", "1"),
            ("X-Robust-Download-Max-Protocol", "1"),
        ],
    )
        .into_response()
}

async fn download_response(
    state: &Arc<AppState>,
    fork: &str,
    version: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let fork_row = state
        .manifest
        .get_fork(fork)?
        .ok_or_else(|| AppError::NotFound(format!("unknown fork {fork}")))?;
    check_fork_access(&fork_row, fork, headers)?;

    let protocol = header_str(headers, HeaderName::from_static("x-robust-download-protocol"))
        .and_then(|v| v.parse::<i32>().ok())
        .ok_or_else(|| AppError::BadRequest("missing or invalid X-Robust-Download-Protocol header".to_string()))?;
    if !(download::MIN_PROTOCOL..=download::MAX_PROTOCOL).contains(&protocol) {
        return Err(AppError::from(DownloadError::UnsupportedProtocol(protocol)));
    }

    let version_id = state
        .content
        .find_version_id(fork, version)?
        .ok_or_else(|| AppError::NotFound(format!("unknown version {fork}/{version}")))?;

    let entries_count = state.content.entries_count(version_id)?;
    let indices = download::parse_indices(&body, entries_count)?;

    let distinct_blob_count = state.content.distinct_blob_count(version_id)?;
    let accepts_zstd = accept_encoding_has_zstd(headers);
    let (stream_compress, pre_compress) = download::resolve_compression_strategy(
        &state.settings.cdn,
        indices.len(),
        distinct_blob_count,
        accepts_zstd,
    );

    let mut raw = Vec::new();
    download::write_stream(&mut raw, &state.content, version_id, &indices, pre_compress)?;

    let (payload, content_encoding) = if stream_compress {
        let mut buf = codec::CompressBuffer::new();
        let compressed = codec::zstd_compress(&raw, state.settings.cdn.stream_compress_level, &mut buf)
            .map_err(DownloadError::from)?;
        (compressed, Some("zstd"))
    } else {
        (raw, None)
    };

    let bytes_sent = payload.len() as i64;
    let flags: i64 = if pre_compress { 1 } else { 0 };

    let mut response = (StatusCode::OK, payload).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    if let Some(encoding) = content_encoding {
        response
            .headers_mut()
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
    }

    state
        .request_log
        .log(crate::requestlog::RequestLogEntry {
            time: chrono::Utc::now().to_rfc3339(),
            flags,
            protocol: i64::from(protocol),
            bytes_sent,
            version_id,
            body: body.to_vec(),
        })
        .await;

    Ok(response)
}

pub async fn handle_download(
    State(state): State<Arc<AppState>>,
    Path((fork, version)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    download_response(&state, &fork, &version, &headers, body).await
}

pub async fn handle_legacy_download(
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let fork = default_fork(&state)?;
    download_response(&state, &fork, &version, &headers, body).await
}
