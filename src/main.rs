use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use braid::agent::make_generation_service;
use braid::config::Settings;
use braid::db::memory::MemoryStore;
use braid::db::pg::PgStore;
use braid::db::store::ChatStore;
use braid::routes::api_routes::{
    chat_handler, create_branch_handler, delete_branch_handler, delete_conversation_handler,
    health_handler, history_handler, list_branches_handler, list_conversations_handler,
    list_messages_handler, merge_handler, regenerate_handler, switch_branch_handler,
};
use braid::routes::ws_routes::ws_chat_handler;
use braid::routes::AppState;
use braid::service::branch_service::BranchService;
use braid::service::chat_service::ChatService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "braid=debug,tower_http=debug".into()),
        )
        .init();

    let settings = Settings::from_env()?;

    // ── Store selection ───────────────────────────────────────────────────────
    let store: Arc<dyn ChatStore> = match &settings.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("Failed to connect to PostgreSQL");

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .expect("Failed to run database migrations");

            info!("Database connection established and migrations applied");
            Arc::new(PgStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store (state is lost on restart)");
            Arc::new(MemoryStore::new())
        }
    };

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let agent = make_generation_service(&settings.generation);
    let chat_service = ChatService::new(store.clone(), agent, settings.generation.clone());
    let branch_service = BranchService::new(store);
    let state = AppState { chat: chat_service, branches: branch_service };

    // ── Router ────────────────────────────────────────────────────────────────
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/conversations", get(list_conversations_handler))
        .route("/api/conversations/{id}", delete(delete_conversation_handler))
        .route("/api/conversations/{id}/messages", get(list_messages_handler))
        .route(
            "/api/conversations/{id}/messages/{message_id}/regenerate",
            post(regenerate_handler),
        )
        .route(
            "/api/conversations/{id}/branches",
            get(list_branches_handler).post(create_branch_handler),
        )
        .route(
            "/api/conversations/{id}/branches/{name}/switch",
            post(switch_branch_handler),
        )
        .route(
            "/api/conversations/{id}/branches/{name}",
            delete(delete_branch_handler),
        )
        .route("/api/conversations/{id}/history", get(history_handler))
        .route("/api/conversations/{id}/merge", post(merge_handler))
        .route("/ws/chat", get(ws_chat_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}
