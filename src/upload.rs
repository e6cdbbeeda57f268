//! 分片上传 HTTP 处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json as JsonResponse;
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::UploadError;
use crate::manager::{
    ChunkAccepted, InitUploadRequest, InitUploadResponse, ResumeInfo, UploadSessionManager,
};
use crate::session::SessionSnapshot;

const CHUNK_INDEX_HEADER: &str = "x-chunk-index";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionQuery {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionRequest {
    session_id: String,
}

fn checked_session_id(session_id: &str) -> Result<&str, UploadError> {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return Err(UploadError::InvalidArgument("sessionId is required".into()));
    }
    if Uuid::parse_str(session_id).is_err() {
        return Err(UploadError::InvalidArgument("sessionId is invalid".into()));
    }
    Ok(session_id)
}

/// 初始化上传会话。
pub async fn init_upload(
    Extension(manager): Extension<Arc<UploadSessionManager>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(payload): Json<InitUploadRequest>,
) -> Result<JsonResponse<InitUploadResponse>, UploadError> {
    let response = manager.initialize_upload(&user_id, payload).await?;
    Ok(JsonResponse(response))
}

/// 上传单个分片；请求体按流写入暂存区。
pub async fn upload_chunk(
    Query(SessionQuery { session_id }): Query<SessionQuery>,
    headers: HeaderMap,
    Extension(manager): Extension<Arc<UploadSessionManager>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    body: AxumBody,
) -> Result<JsonResponse<ChunkAccepted>, UploadError> {
    let session_id = checked_session_id(&session_id)?;
    let chunk_index = headers
        .get(CHUNK_INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or_else(|| UploadError::InvalidArgument("X-Chunk-Index is required".into()))?;

    let stream = BodyExt::into_data_stream(body).map(|chunk| chunk.map_err(std::io::Error::other));
    let reader = StreamReader::new(stream);
    let accepted = manager
        .accept_chunk(session_id, &user_id, chunk_index, reader)
        .await?;
    Ok(JsonResponse(accepted))
}

pub async fn upload_status(
    Query(SessionQuery { session_id }): Query<SessionQuery>,
    Extension(manager): Extension<Arc<UploadSessionManager>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<JsonResponse<SessionSnapshot>, UploadError> {
    let session_id = checked_session_id(&session_id)?;
    Ok(JsonResponse(manager.get_status(session_id, &user_id).await?))
}

pub async fn pause_upload(
    Extension(manager): Extension<Arc<UploadSessionManager>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(payload): Json<SessionRequest>,
) -> Result<JsonResponse<SessionSnapshot>, UploadError> {
    let session_id = checked_session_id(&payload.session_id)?;
    Ok(JsonResponse(manager.pause(session_id, &user_id).await?))
}

/// 恢复上传，返回仍需上传的分片索引。
pub async fn resume_upload(
    Extension(manager): Extension<Arc<UploadSessionManager>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(payload): Json<SessionRequest>,
) -> Result<JsonResponse<ResumeInfo>, UploadError> {
    let session_id = checked_session_id(&payload.session_id)?;
    Ok(JsonResponse(manager.resume(session_id, &user_id).await?))
}

/// 取消上传并清理暂存目录。
pub async fn cancel_upload(
    Extension(manager): Extension<Arc<UploadSessionManager>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(payload): Json<SessionRequest>,
) -> Result<StatusCode, UploadError> {
    let session_id = checked_session_id(&payload.session_id)?;
    manager.cancel(session_id, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn complete_upload(
    Extension(manager): Extension<Arc<UploadSessionManager>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(payload): Json<SessionRequest>,
) -> Result<JsonResponse<ChunkAccepted>, UploadError> {
    let session_id = checked_session_id(&payload.session_id)?;
    Ok(JsonResponse(
        manager.finalize_upload(session_id, &user_id).await?,
    ))
}

pub async fn active_uploads(
    Extension(manager): Extension<Arc<UploadSessionManager>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<JsonResponse<Vec<SessionSnapshot>>, UploadError> {
    Ok(JsonResponse(manager.list_active(&user_id).await?))
}
