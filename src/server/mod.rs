pub mod api;
pub mod auth;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use colored::*;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::metadata::{FetchPolicy, MetadataFetcher};
use crate::provider::{EchoModel, LanguageModel, ModelRegistry, OpenAiCompatibleModel};
use crate::storage::{self, ObjectStore};
use crate::stream::StreamHub;

#[derive(Clone)]
pub struct AppState {
    pub service: ChatService,
    pub objects: Option<Arc<ObjectStore>>,
    pub metadata: Option<Arc<MetadataFetcher>>,
    pub webhook_secret: Option<Arc<String>>,
    pub auth_header: Arc<String>,
}

impl AppState {
    pub fn new(service: ChatService, auth_header: impl Into<String>) -> Self {
        Self {
            service,
            objects: None,
            metadata: None,
            webhook_secret: None,
            auth_header: Arc::new(auth_header.into().to_ascii_lowercase()),
        }
    }

    pub fn with_objects(mut self, objects: ObjectStore) -> Self {
        self.objects = Some(Arc::new(objects));
        self
    }

    pub fn with_metadata(mut self, fetcher: MetadataFetcher) -> Self {
        self.metadata = Some(Arc::new(fetcher));
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(Arc::new(secret.into()));
        self
    }
}

/// Models configured for this process. The offline `echo` model is always
/// available.
pub fn model_registry(config: &AppConfig) -> Result<ModelRegistry> {
    let mut registry = ModelRegistry::new();
    registry.register(Arc::new(EchoModel::new("echo")));

    if let Some(openai) = &config.openai {
        for model in &openai.models {
            let model = OpenAiCompatibleModel::new(openai, model)?
                .with_system_prompt(config.system_prompt.clone());
            registry.register(Arc::new(model) as Arc<dyn LanguageModel>);
        }
    }

    if registry.get(&config.default_model).is_none() {
        anyhow::bail!(
            "default model {} is not configured (available: {})",
            config.default_model,
            registry.ids().join(", ")
        );
    }
    Ok(registry)
}

pub async fn build_state(config: &AppConfig) -> Result<AppState> {
    let db = Arc::new(storage::init(&config.database_path).with_context(|| {
        format!("failed to open database {}", config.database_path.display())
    })?);

    let hub = Arc::new(StreamHub::new(config.replay_retention()));
    hub.spawn_collector(Duration::from_secs(1));

    let service = ChatService::new(db, hub, model_registry(config)?, config.grace_window())
        .with_smooth_delay(config.smooth_delay());
    let indexed = service
        .rebuild_search_index()
        .await
        .context("failed to rebuild search index")?;
    tracing::info!(documents = indexed, "search index rebuilt");

    let mut state = AppState::new(service, config.auth_header.clone())
        .with_metadata(MetadataFetcher::new(FetchPolicy::default())?);
    if let Some(objects) = &config.object_store {
        state = state.with_objects(ObjectStore::new(objects.clone())?);
    }
    match &config.webhook_secret {
        Some(secret) => state = state.with_webhook_secret(secret.clone()),
        None => tracing::warn!("no webhook secret configured; user webhooks are disabled"),
    }
    Ok(state)
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(api::health))
        .route("/api/chat", get(api::resume).post(api::send_message))
        .route("/api/chat/create", post(api::create_chat))
        .route("/api/chats", get(api::list_chats))
        .route("/api/chats/{chat_id}", get(api::get_chat))
        .route("/api/chats/{chat_id}/messages", get(api::chat_messages))
        .route("/api/chats/{chat_id}/streams", get(api::chat_streams))
        .route("/api/search", get(api::search))
        .route("/api/search/messages", get(api::search_messages))
        .route(
            "/api/uploads",
            post(api::create_upload).delete(api::delete_upload),
        )
        .route("/api/metadata", post(api::fetch_metadata))
        .route("/ws", get(ws::ws_handler));
    // Unauthenticated senders must not reach user deletion without a secret.
    if state.webhook_secret.is_some() {
        router = router.route("/api/webhooks/auth", post(api::user_webhook));
    }
    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new()),
        )
        .with_state(state)
}

pub async fn start(config: AppConfig) -> Result<()> {
    let state = build_state(&config).await?;
    tracing::info!(
        models = ?state.service.models().ids(),
        database = %config.database_path.display(),
        uploads = state.objects.is_some(),
        "chat relay starting"
    );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!(
        "{} Server running at {}",
        "✓".green(),
        format!("http://{}", addr).bright_blue()
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
