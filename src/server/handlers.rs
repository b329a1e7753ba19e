//! HTTP handlers

use super::AppState;
use crate::chat::ChatRequest;
use crate::messages::{self, ExportFormat, SettingsUpdate, UserId};
use crate::TangError;
use axum::async_trait;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{error, info, warn};

/// Header carrying the caller identity set by the fronting gateway
pub const USER_ID_HEADER: &str = "x-user-id";

/// Seconds between SSE keep-alive comments
const KEEP_ALIVE_SECS: u64 = 15;

type ApiResult<T> = std::result::Result<T, TangError>;

impl IntoResponse for TangError {
    fn into_response(self) -> Response {
        let status = match &self {
            TangError::NotFound(_) => StatusCode::NOT_FOUND,
            TangError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            TangError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            TangError::UpstreamError(_) | TangError::GenerationError(_) => StatusCode::BAD_GATEWAY,
            TangError::ConfigError(_)
            | TangError::StorageError(_)
            | TangError::IOError(_)
            | TangError::SinkClosed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if !self.is_recoverable() {
            error!("Request failed: {}", self);
        } else if status.is_server_error() {
            warn!("Request failed: {}", self);
        }

        (status, Json(json!({ "detail": self.user_message() }))).into_response()
    }
}

/// Authenticated caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurrentUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = TangError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> ApiResult<Self> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| TangError::Unauthorized("missing user id".into()))?;

        value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .filter(|id| *id > 0)
            .map(CurrentUser)
            .ok_or_else(|| {
                warn!("Rejected malformed {} header", USER_ID_HEADER);
                TangError::Unauthorized("invalid user id".into())
            })
    }
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

pub async fn api_info() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

/// `POST /api/chat`
pub async fn chat(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Response> {
    let prepared = state.chat.prepare(owner, &request).await?;

    if !request.stream {
        let reply = state.chat.complete(prepared).await?;
        return Ok(Json(reply).into_response());
    }

    let events = state
        .chat
        .stream(prepared)
        .into_stream()
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_json())));

    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEP_ALIVE_SECS))
            .text("keep-alive"),
    );

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response())
}

/// `GET /api/chat/models`
pub async fn list_models(
    State(state): State<AppState>,
    CurrentUser(_): CurrentUser,
) -> impl IntoResponse {
    let models = state.chat.llm().list_models().await;
    Json(json!({
        "models": models,
        "default": state.chat.llm().model_id(),
    }))
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// `GET /api/conversations`
pub async fn list_conversations(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Query(page): Query<Page>,
) -> impl IntoResponse {
    let conversations: Vec<_> = state
        .chat
        .store()
        .list(owner)
        .into_iter()
        .skip(page.skip)
        .take(page.limit)
        .collect();
    Json(conversations)
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversation {
    pub title: Option<String>,
    pub system_prompt: Option<String>,
}

/// `POST /api/conversations`
pub async fn create_conversation(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Json(body): Json<CreateConversation>,
) -> ApiResult<impl IntoResponse> {
    let conversation = state.chat.store().create_with(
        owner,
        body.title.as_deref(),
        body.system_prompt.as_deref(),
    )?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// `DELETE /api/conversations`
pub async fn delete_all_conversations(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
) -> impl IntoResponse {
    let deleted = state.chat.store().delete_all(owner);
    info!("User {} deleted {} conversations", owner, deleted);
    let message = if deleted == 0 {
        "No conversations to delete"
    } else {
        "All conversations deleted"
    };
    Json(json!({ "message": message, "deleted": deleted }))
}

/// `GET /api/conversations/:id`
pub async fn get_conversation(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let store = state.chat.store();
    let conversation = store.get(id, owner)?;
    let messages = store.history(id, owner)?;

    let mut body = serde_json::to_value(&conversation)
        .map_err(|e| TangError::StorageError(e.to_string()))?;
    body["messages"] = json!(messages);
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct RenameConversation {
    pub title: String,
}

/// `PUT /api/conversations/:id`
pub async fn rename_conversation(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Path(id): Path<i64>,
    Json(body): Json<RenameConversation>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.store().rename(id, owner, &body.title)?))
}

/// `DELETE /api/conversations/:id`
pub async fn delete_conversation(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.chat.store().delete(id, owner)?;
    Ok(Json(json!({ "message": "Conversation deleted" })))
}

#[derive(Debug, Deserialize)]
pub struct BranchConversation {
    pub message_id: i64,
    #[serde(default)]
    pub new_title: Option<String>,
}

/// `POST /api/conversations/:id/branch`
pub async fn branch_conversation(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Path(id): Path<i64>,
    Json(body): Json<BranchConversation>,
) -> ApiResult<impl IntoResponse> {
    let branch = state
        .chat
        .store()
        .branch(id, owner, body.message_id, body.new_title.as_deref())?;
    Ok(Json(branch))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

/// `GET /api/conversations/:id/export`
pub async fn export_conversation(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Path(id): Path<i64>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<impl IntoResponse> {
    let format = match query.format.as_deref() {
        Some(format) => format.parse()?,
        None => ExportFormat::default(),
    };
    let store = state.chat.store();
    let conversation = store.get(id, owner)?;
    let history = store.history(id, owner)?;
    Ok(Json(messages::export(&conversation, &history, format)))
}

/// `GET /api/settings`
pub async fn get_settings(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
) -> impl IntoResponse {
    Json(state.chat.settings().get(owner))
}

/// `PUT /api/settings`
pub async fn update_settings(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.settings().update(owner, update)?))
}

/// `POST /api/settings/reset`
pub async fn reset_settings(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
) -> impl IntoResponse {
    let settings = state.chat.settings().reset(owner);
    Json(json!({ "message": "Settings reset to defaults", "settings": settings }))
}

/// `GET /api/conversations/:id/messages`
pub async fn conversation_messages(
    State(state): State<AppState>,
    CurrentUser(owner): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.store().history(id, owner)?))
}

/// `GET /api/generation/health`
pub async fn generation_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.image.check_health().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> ApiResult<CurrentUser> {
        let mut builder = Request::builder().uri("/api/conversations");
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        CurrentUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_user_id_extraction() {
        assert_eq!(extract(Some("42")).await.unwrap(), CurrentUser(42));
        assert!(matches!(extract(None).await, Err(TangError::Unauthorized(_))));
        assert!(matches!(extract(Some("abc")).await, Err(TangError::Unauthorized(_))));
        assert!(matches!(extract(Some("-3")).await, Err(TangError::Unauthorized(_))));
    }

    #[test]
    fn test_error_status_mapping() {
        let response = TangError::NotFound("Conversation".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = TangError::Unauthorized("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = TangError::StorageError("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = TangError::UpstreamError("reset".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
