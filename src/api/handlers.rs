use std::path::{Path as StdPath, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::FaceError;
use crate::face::matcher::{encode_query, find_matches, MatchIndex};
use crate::materialize::publish_matches;
use crate::models::face::ImageId;
use crate::AppState;

pub const SAMPLE_FIELD: &str = "sample_photo";
pub const NO_FACE_MESSAGE: &str = "No face detected in sample.";

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

type JsonResponse = (StatusCode, Json<serde_json::Value>);

fn error_body(status: StatusCode, msg: impl Into<String>) -> JsonResponse {
    (status, Json(serde_json::json!({ "error": msg.into() })))
}

/// Status code and user-facing message for an engine error.
pub fn error_response(e: &FaceError) -> JsonResponse {
    match e {
        FaceError::NoFaceDetected => error_body(StatusCode::UNPROCESSABLE_ENTITY, NO_FACE_MESSAGE),
        FaceError::ImageDecode { .. } => error_body(StatusCode::BAD_REQUEST, "Could not read the uploaded photo."),
        FaceError::InvalidParameter(msg) => error_body(StatusCode::BAD_REQUEST, msg.clone()),
        other => {
            error!("request failed: {}", other);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> JsonResponse {
    error!("blocking task failed: {}", e);
    error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "store": state.paths.store,
        "library": state.paths.library,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    });
    (StatusCode::OK, Json(body))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.stats.snapshot()))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.stats.metrics_text(),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub threshold: Option<f32>,
    /// Also report the `top_k` closest library faces with their distances.
    pub top_k: Option<usize>,
}

/// Save the uploaded sample under `uploads` with a unique name, keeping the
/// client's extension so the decoder can pick a format.
async fn save_upload(uploads: &StdPath, file_name: Option<&str>, bytes: &[u8]) -> Result<PathBuf, JsonResponse> {
    let ext = file_name
        .and_then(|n| StdPath::new(n).extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_else(|| "jpg".to_string());
    let mime = mime_guess::from_ext(&ext).first_or_octet_stream();
    if mime.type_() != mime_guess::mime::IMAGE {
        return Err(error_body(StatusCode::BAD_REQUEST, format!("Unsupported upload type: .{}", ext)));
    }
    tokio::fs::create_dir_all(uploads).await.map_err(|e| {
        error!("failed to create uploads dir {:?}: {}", uploads, e);
        error_body(StatusCode::INTERNAL_SERVER_ERROR, "failed to store upload")
    })?;
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = uploads.join(format!("query-{}-{}-{}.{}", nanos, std::process::id(), seq, ext));
    tokio::fs::write(&path, bytes).await.map_err(|e| {
        error!("failed to write upload {:?}: {}", path, e);
        error_body(StatusCode::INTERNAL_SERVER_ERROR, "failed to store upload")
    })?;
    Ok(path)
}

/// Find every library photo containing the person in `sample_photo`.
///
/// The library is reconciled first so photos added since the last request
/// are searchable; matches replace the contents of the results folder.
pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let started = Instant::now();

    let mut upload: Option<(Option<String>, Vec<u8>)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some(SAMPLE_FIELD) {
                    continue;
                }
                let file_name = field.file_name().map(|s| s.to_string());
                match field.bytes().await {
                    Ok(bytes) => upload = Some((file_name, bytes.to_vec())),
                    Err(e) => return error_body(StatusCode::BAD_REQUEST, format!("Failed to read upload: {}", e)),
                }
            }
            Ok(None) => break,
            Err(e) => return error_body(StatusCode::BAD_REQUEST, format!("Invalid multipart body: {}", e)),
        }
    }
    let Some((file_name, bytes)) = upload.filter(|(_, b)| !b.is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, format!("Missing '{}' upload.", SAMPLE_FIELD));
    };
    let sample = match save_upload(&state.paths.uploads, file_name.as_deref(), &bytes).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let threshold = params
        .threshold
        .unwrap_or_else(|| state.config.match_threshold(state.encoder.distance_scale()));
    let top_k = params.top_k;
    let result = tokio::task::spawn_blocking({
        let state = state.clone();
        let sample = sample.clone();
        move || {
            let query = encode_query(state.encoder.as_ref(), &sample, state.config.query_detection_model)?;
            // Held through publishing: the results folder is shared by all searches.
            let mut store = state.store.lock();
            let report = store.reconcile(&state.paths.library, state.encoder.as_ref(), &state.config.reconcile_options())?;
            state.stats.record_reconcile(&report);
            let matches = find_matches(&query, store.iter(), threshold)?;
            let nearest = match top_k {
                Some(k) => Some(MatchIndex::from_records(store.iter())?.nearest(&query, k)?),
                None => None,
            };
            let published = publish_matches(&state.paths.library, &matches, &state.paths.results)?;
            Ok::<_, FaceError>((matches, nearest, published))
        }
    })
    .await;

    if let Err(e) = tokio::fs::remove_file(&sample).await {
        warn!("failed to remove upload {:?}: {}", sample, e);
    }

    let (matches, nearest, published) = match result {
        Ok(Ok(v)) => v,
        Ok(Err(FaceError::NoFaceDetected)) => {
            state.stats.record_no_face();
            return error_response(&FaceError::NoFaceDetected);
        }
        Ok(Err(e)) => return error_response(&e),
        Err(e) => return join_error(e),
    };

    let elapsed = started.elapsed().as_secs_f64();
    state.stats.record_search(matches.len(), elapsed);
    info!("search matched {} photo(s) in {:.2}s", matches.len(), elapsed);
    let names: Vec<&str> = matches.iter().map(|m| m.as_str()).collect();
    let copy_failures: Vec<String> = published.failures.iter().map(|f| f.to_string()).collect();
    let mut body = serde_json::json!({
        "matches": names,
        "count": matches.len(),
        "time_taken_secs": (elapsed * 100.0).round() / 100.0,
        "threshold": threshold,
        "results_dir": state.paths.results,
        "copy_failures": copy_failures,
    });
    if let Some(nearest) = nearest {
        body["nearest"] = nearest
            .iter()
            .map(|(id, distance)| serde_json::json!({ "id": id.as_str(), "distance": distance }))
            .collect();
    }
    (StatusCode::OK, Json(body))
}

pub async fn library_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max_attempts = state.config.max_decode_attempts;
    let result = tokio::task::spawn_blocking({
        let state = state.clone();
        move || {
            let store = state.store.lock();
            let quarantined: Vec<String> = store.quarantined(max_attempts).into_iter().map(|(id, _)| id.to_string()).collect();
            serde_json::json!({
                "library": state.paths.library,
                "store": store.path(),
                "records": store.len(),
                "faces": store.face_count(),
                "dimension": store.dimension(),
                "pending_failures": store.failures().len(),
                "quarantined": quarantined,
            })
        }
    })
    .await;
    match result {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => join_error(e),
    }
}

pub async fn reconcile_library(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking({
        let state = state.clone();
        move || {
            let mut store = state.store.lock();
            store.reconcile(&state.paths.library, state.encoder.as_ref(), &state.config.reconcile_options())
        }
    })
    .await;
    match result {
        Ok(Ok(report)) => {
            state.stats.record_reconcile(&report);
            (StatusCode::OK, Json(serde_json::json!(report)))
        }
        Ok(Err(e)) => error_response(&e),
        Err(e) => join_error(e),
    }
}

pub async fn invalidate_record(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking({
        let state = state.clone();
        let id = ImageId::new(id.clone());
        move || state.store.lock().invalidate(&id)
    })
    .await;
    match result {
        Ok(Ok(true)) => (StatusCode::OK, Json(serde_json::json!({ "removed": true, "id": id }))),
        Ok(Ok(false)) => error_body(StatusCode::NOT_FOUND, format!("No record for '{}'.", id)),
        Ok(Err(e)) => error_response(&e),
        Err(e) => join_error(e),
    }
}

pub async fn clear_records(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking({
        let state = state.clone();
        move || state.store.lock().clear()
    })
    .await;
    match result {
        Ok(Ok(removed)) => (StatusCode::OK, Json(serde_json::json!({ "removed": removed }))),
        Ok(Err(e)) => error_response(&e),
        Err(e) => join_error(e),
    }
}
