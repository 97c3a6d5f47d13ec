use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, Method},
    routing::get,
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};

use shared::types::ServerEntry;

use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

/// API router with the permissive CORS the browser UI expects.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/servers", get(get_servers).options(options_ok))
        .layer(cors)
        .with_state(state)
}

async fn get_servers(State(state): State<AppState>) -> Json<Vec<ServerEntry>> {
    Json(sorted_servers(&state.registry))
}

async fn options_ok() {}

/// Snapshot ordered the way the UI lists it: fullest first, online before
/// offline, address as the tiebreak.
fn sorted_servers(registry: &Registry) -> Vec<ServerEntry> {
    let mut list = registry.snapshot();
    list.sort_by(|a, b| {
        b.player_count
            .cmp(&a.player_count)
            .then(b.online.cmp(&a.online))
            .then(a.address.cmp(&b.address))
    });
    list
}
