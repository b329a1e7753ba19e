//! HTTP surface of the backend

pub mod handlers;

use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::generation::{ArtifactStore, HttpDispatcher, ImageClient, SpeechClient};
use crate::llm::LLMClient;
use crate::messages::{ConversationStore, SettingsStore};
use crate::{Result, TangError};
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state of all handlers
#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub image: ImageClient,
}

impl AppState {
    /// Wire clients and stores from configuration
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.storage.upload_dir)?;
        let artifacts = ArtifactStore::new(&config.storage.upload_dir)?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TangError::ConfigError(format!("HTTP client: {}", e)))?;
        let image = ImageClient::new(config.t2i.clone(), http.clone(), artifacts.clone());
        let speech = SpeechClient::new(config.tts.clone(), http, artifacts.clone());
        let dispatcher = Arc::new(HttpDispatcher::new(image.clone(), speech));

        let llm = LLMClient::new(config.llm.clone())?;
        info!(
            "Model endpoint {} ({}), uploads in {}",
            config.llm.api_base,
            config.llm.model_id,
            config.storage.upload_dir.display()
        );

        let chat = ChatService::new(
            llm,
            dispatcher,
            ConversationStore::new(),
            SettingsStore::from_config(&config.llm),
            artifacts,
            config.filter.clone(),
        );

        Ok(Self { chat, image })
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the application router
pub fn router(state: AppState, config: &AppConfig) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api", get(handlers::api_info))
        .route("/api/chat", post(handlers::chat))
        .route("/api/chat/models", get(handlers::list_models))
        .route(
            "/api/conversations",
            get(handlers::list_conversations)
                .post(handlers::create_conversation)
                .delete(handlers::delete_all_conversations),
        )
        .route(
            "/api/conversations/:id",
            get(handlers::get_conversation)
                .put(handlers::rename_conversation)
                .delete(handlers::delete_conversation),
        )
        .route(
            "/api/conversations/:id/messages",
            get(handlers::conversation_messages),
        )
        .route(
            "/api/conversations/:id/branch",
            post(handlers::branch_conversation),
        )
        .route(
            "/api/conversations/:id/export",
            get(handlers::export_conversation),
        )
        .route(
            "/api/settings",
            get(handlers::get_settings).put(handlers::update_settings),
        )
        .route("/api/settings/reset", post(handlers::reset_settings))
        .route("/api/generation/health", get(handlers::generation_health))
        .nest_service("/api/files", ServeDir::new(&config.storage.upload_dir))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.server.cors_origins))
        .with_state(state)
}
