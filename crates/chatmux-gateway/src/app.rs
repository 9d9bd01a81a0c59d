use axum::{
    routing::{get, post},
    Router,
};
use chatmux_core::config::ChatmuxConfig;
use chatmux_credits::CreditLedger;
use chatmux_dispatch::ProviderRouter;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: ChatmuxConfig,
    pub router: ProviderRouter,
    pub ledger: CreditLedger,
}

impl AppState {
    pub fn from_config(config: ChatmuxConfig) -> Self {
        let router = ProviderRouter::from_config(&config);
        Self {
            config,
            router,
            ledger: CreditLedger::new(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/chat/completions", post(crate::http::chat::chat_completions))
        .route("/models", get(crate::http::models::list_models))
        .route("/v1/api-keys", post(crate::http::keys::create_api_key))
        .route("/v1/balance", get(crate::http::keys::balance))
        .route("/v1/add-credits", post(crate::http::keys::add_credits))
        .route("/v1/enable", post(crate::http::keys::enable_key))
        .route("/v1/disable", post(crate::http::keys::disable_key))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
