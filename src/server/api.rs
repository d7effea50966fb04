use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::auth::AuthUser;
use super::AppState;
use crate::chat::SendRequest;
use crate::error::ChatError;
use crate::metadata::{BatchRequest, LinkMetadata};
use crate::model::{Chat, Message};
use crate::search::{ChatSearchResult, MessageSearchResult};
use crate::storage::{ObjectStore, PresignedUpload, UserEvent};
use crate::stream::wire::{CONTENT_TYPE, STREAM_HEADER, STREAM_HEADER_VALUE};
use crate::stream::ChunkStream;

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Transient(_) | ChatError::Store(_) | ChatError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = if status.is_server_error() {
            tracing::error!(category = ?self.category(), "request failed: {self}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, message).into_response()
    }
}

type ApiResult<T> = Result<T, ChatError>;

/// A data-stream response body.
fn stream_response(body: ChunkStream) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::HeaderName::from_static(STREAM_HEADER), STREAM_HEADER_VALUE),
        ],
        Body::from_stream(body.map(Ok::<_, Infallible>)),
    )
        .into_response()
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|err| ChatError::validation(format!("Invalid body: {err}")))
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn send_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: Bytes,
) -> ApiResult<Response> {
    let request: SendRequest = parse_json(&body)?;
    let stream = state.service.send_message(&user, request).await?;
    Ok(stream_response(stream))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeParams {
    chat_id: Option<String>,
}

pub async fn resume(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<ResumeParams>,
) -> ApiResult<Response> {
    let outcome = state
        .service
        .resume(&user, params.chat_id.as_deref())
        .await?;
    match outcome.into_body()? {
        Some(body) => Ok(stream_response(body)),
        None => Err(ChatError::not_found("No streams found")),
    }
}

pub async fn create_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let chat = state.service.create_chat(&user).await?;
    Ok(Json(json!({ "chatId": chat.id })))
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    limit: Option<usize>,
}

pub async fn list_chats(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<LimitParams>,
) -> ApiResult<Json<Vec<Chat>>> {
    Ok(Json(state.service.list_chats(&user, params.limit).await?))
}

pub async fn get_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Chat>> {
    Ok(Json(state.service.get_chat(&user, &chat_id).await?))
}

pub async fn chat_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    Ok(Json(state.service.messages(&user, &chat_id).await?))
}

pub async fn chat_streams(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.service.stream_ids(&user, &chat_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    #[serde(default)]
    query: String,
    limit: Option<usize>,
    chat_id: Option<String>,
}

pub async fn search(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<ChatSearchResult>>> {
    let results = state
        .service
        .search_chats(&user, &params.query, params.limit)
        .await?;
    Ok(Json(results))
}

pub async fn search_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<MessageSearchResult>>> {
    let results = state
        .service
        .search_messages(&user, &params.query, params.limit, params.chat_id.as_deref())
        .await?;
    Ok(Json(results))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    file_name: String,
    content_type: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteUploadRequest {
    key: String,
}

fn object_store(state: &AppState) -> ApiResult<&ObjectStore> {
    state
        .objects
        .as_deref()
        .ok_or_else(|| ChatError::Config("object storage is not configured".to_string()))
}

pub async fn create_upload(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: Bytes,
) -> ApiResult<Json<PresignedUpload>> {
    let request: UploadRequest = parse_json(&body)?;
    if request.file_name.trim().is_empty() || request.content_type.trim().is_empty() {
        return Err(ChatError::validation("fileName and contentType are required"));
    }
    if request.size == 0 {
        return Err(ChatError::validation("size must be positive"));
    }

    let store = object_store(&state)?;
    let upload = store
        .presign_upload(&request.file_name, &request.content_type, request.size)
        .map_err(ChatError::Transient)?;
    tracing::info!(
        user = %user,
        key = %upload.key,
        content_type = %request.content_type,
        size = request.size,
        "presigned upload"
    );
    Ok(Json(upload))
}

pub async fn delete_upload(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let request: DeleteUploadRequest = parse_json(&body)?;
    if request.key.trim().is_empty() {
        return Err(ChatError::validation("key is required"));
    }

    let store = object_store(&state)?;
    store
        .delete_object(&request.key)
        .await
        .map_err(ChatError::Transient)?;
    tracing::info!(user = %user, key = %request.key, "deleted upload");
    Ok(Json(json!({ "success": true })))
}

pub async fn fetch_metadata(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    body: Bytes,
) -> ApiResult<Json<Vec<LinkMetadata>>> {
    let request: BatchRequest = parse_json(&body)?;
    let fetcher = state
        .metadata
        .as_deref()
        .ok_or_else(|| ChatError::Config("link metadata is not configured".to_string()))?;
    let results = fetcher.fetch_batch(&request.urls).await?;
    tracing::debug!(user = %user, urls = results.len(), "fetched link metadata");
    Ok(Json(results))
}

/// Header carrying the delivery id of an identity-provider webhook.
pub const WEBHOOK_ID_HEADER: &str = "svix-id";
/// Header carrying the shared secret configured for user webhooks.
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

/// Compares fixed-length digests so the comparison time does not depend on
/// how much of the presented secret matches.
fn secret_matches(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

/// User lifecycle events from the identity provider. The caller is the
/// provider, not a user, so no [`AuthUser`] is required.
pub async fn user_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<&'static str> {
    let expected = state
        .webhook_secret
        .as_deref()
        .ok_or(ChatError::Unauthorized)?;
    let presented = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(ChatError::Unauthorized)?;
    if !secret_matches(expected, presented) {
        tracing::warn!("rejected user webhook with a wrong secret");
        return Err(ChatError::Unauthorized);
    }

    let event_id = headers
        .get(WEBHOOK_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ChatError::validation("Invalid webhook data"))?
        .to_string();
    let event = UserEvent::from_payload(&body)?;
    state.service.handle_user_event(&event_id, event).await?;
    Ok("Webhook received")
}
