//! Request handlers for the resource read path and operator endpoints.

use crate::error::ApiError;
use crate::serve::{ServeParams, serve_file};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, RANGE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use depot_core::ResourceKey;
use depot_fetch::FetchOutcome;
use serde::Serialize;

/// Resource payloads are the compressed tarballs exactly as received from
/// upstream.
const RESOURCE_CONTENT_TYPE: &str = "application/x-tar";
const RESOURCE_CONTENT_ENCODING: &str = "gzip";

/// GET|HEAD /registry/{uuid}/{hash}
pub async fn get_registry_resource(
    State(state): State<AppState>,
    Path((uuid, hash)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    resource_response(state, format!("/registry/{uuid}/{hash}"), method, headers).await
}

/// GET|HEAD /package/{uuid}/{hash}
pub async fn get_package_resource(
    State(state): State<AppState>,
    Path((uuid, hash)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    resource_response(state, format!("/package/{uuid}/{hash}"), method, headers).await
}

/// GET|HEAD /artifact/{hash}
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    resource_response(state, format!("/artifact/{hash}"), method, headers).await
}

/// Classify the path and serve. Malformed uuid/hash segments 404 without
/// consulting the fetch coordinator.
async fn resource_response(
    state: AppState,
    path: String,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let key = match ResourceKey::parse(&path) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(path, error = %e, "rejecting malformed resource path");
            return ApiError::NotFound(path).into_response();
        }
    };
    serve_resource(&state, key, &method, &headers).await
}

/// Serve one resource: cache hits bypass the coordinator entirely; misses
/// join or start a download and stream from its growing staging file.
pub(crate) async fn serve_resource(
    state: &AppState,
    key: ResourceKey,
    method: &Method,
    headers: &HeaderMap,
) -> Response {
    let kind = key.kind().as_str();
    let head_only = method == Method::HEAD;
    let range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    if let Some(pinned) = state.cache.pin(&key) {
        crate::metrics::REQUESTS_TOTAL
            .with_label_values(&[kind, "cache_hit"])
            .inc();
        let path = pinned.path().to_path_buf();
        return serve_file(
            path,
            head_only,
            range,
            ServeParams {
                resource: key.to_string(),
                content_length: pinned.size(),
                content_type: RESOURCE_CONTENT_TYPE,
                content_encoding: RESOURCE_CONTENT_ENCODING,
                completion: None,
                fallback_path: None,
                pin: Some(pinned),
            },
        );
    }

    match state
        .coordinator
        .fetch(&key, &state.config.upstream.servers)
        .await
    {
        FetchOutcome::Download(download) => {
            crate::metrics::REQUESTS_TOTAL
                .with_label_values(&[kind, "fetched"])
                .inc();
            serve_file(
                download.staging_path().clone(),
                head_only,
                range,
                ServeParams {
                    resource: key.to_string(),
                    content_length: download.content_length(),
                    content_type: RESOURCE_CONTENT_TYPE,
                    content_encoding: RESOURCE_CONTENT_ENCODING,
                    completion: Some(download.handle()),
                    // The staging file may be renamed into the cache before
                    // this handler opens it.
                    fallback_path: Some(state.cache.destination(&key)),
                    pin: None,
                },
            )
        }
        FetchOutcome::NoUpstream => {
            crate::metrics::REQUESTS_TOTAL
                .with_label_values(&[kind, "not_found"])
                .inc();
            ApiError::NotFound(key.to_string()).into_response()
        }
        FetchOutcome::Failed => {
            crate::metrics::REQUESTS_TOTAL
                .with_label_values(&[kind, "failed"])
                .inc();
            ApiError::NotFound(key.to_string()).into_response()
        }
    }
}

/// GET|HEAD /registries - the published registries index.
pub async fn get_registries(State(state): State<AppState>) -> Response {
    let path = state.config.cache.static_dir().join("registries");
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            (StatusCode::OK, [(CONTENT_TYPE, "text/plain")], bytes).into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            ApiError::NotFound("/registries".to_string()).into_response()
        }
        Err(e) => ApiError::Internal(e.to_string()).into_response(),
    }
}

/// GET /healthz - liveness probe.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Response body of the forget-failures endpoint.
#[derive(Debug, Serialize)]
pub struct ForgetFailuresResponse {
    /// Number of failed keys made retryable.
    pub cleared: usize,
}

/// POST /admin/forget-failures - clear the recent-failure sets.
///
/// This is the retry-after-cooldown knob: within one cooldown window a
/// failed key is never re-attempted, and an operator (or cron) calling this
/// endpoint opens the next window.
pub async fn forget_failures(State(state): State<AppState>) -> Json<ForgetFailuresResponse> {
    let cleared = state.coordinator.forget_failures().await;
    tracing::info!(cleared, "cleared recorded fetch failures");
    Json(ForgetFailuresResponse { cleared })
}
