use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::{
    error::ApiError,
    models::{
        CancelResponse, CreateSessionRequest, CreateSessionResponse, ExportStatus,
        UploadStrategyQuery, UploadStrategyResponse,
    },
    sse::progress_stream,
    AppState,
};

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "sessions": state.registry.session_count().await,
        "subscribers": state.registry.broadcaster().total_subscribers(),
    }))
}

pub fn stream_url(export_id: &str) -> String {
    format!("/export/progress/{export_id}/stream")
}

pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let export_id = state.registry.create(payload.total_items).await;
    let response = CreateSessionResponse {
        sse_url: stream_url(&export_id),
        export_id,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn get_progress(
    State(state): State<AppState>,
    Path(export_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .registry
        .get(&export_id)
        .await
        .ok_or_else(|| ApiError::session_not_found(&export_id))?;
    Ok(Json(session))
}

pub async fn stream_progress(
    State(state): State<AppState>,
    Path(export_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let subscription = state
        .registry
        .subscribe(&export_id)
        .await
        .ok_or_else(|| ApiError::session_not_found(&export_id))?;
    Ok(progress_stream(subscription))
}

pub async fn cancel_export(
    State(state): State<AppState>,
    Path(export_id): Path<String>,
) -> impl IntoResponse {
    if state.registry.cancel(&export_id).await {
        return (
            StatusCode::OK,
            Json(CancelResponse {
                success: true,
                error: None,
            }),
        );
    }

    let error = match state.registry.get(&export_id).await {
        None => ApiError::session_not_found(&export_id),
        Some(session) => {
            let verb = match session.status {
                ExportStatus::Error => "failed",
                _ => "completed",
            };
            ApiError::Conflict(format!("Export already {verb}"))
        }
    };

    (
        error.status(),
        Json(CancelResponse {
            success: false,
            error: Some(error.to_string()),
        }),
    )
}

pub async fn upload_strategy(
    State(state): State<AppState>,
    query: Result<Query<UploadStrategyQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    Ok(Json(UploadStrategyResponse {
        chunked: state.config.should_use_chunked_upload(query.file_size),
        threshold_bytes: state.config.chunked_upload_threshold,
        chunk_size_bytes: state.config.chunk_size,
    }))
}
