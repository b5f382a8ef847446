//! HTTP/WebSocket strategy API.
//!
//! Thin transport over the registry: POST starts a strategy, DELETE stops it,
//! GET lists runtime snapshots scoped by sub-account. `/ws` fans the lifecycle
//! broadcast out to one account's subscribers.

pub mod routes;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::strategies::StrategyRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<StrategyRegistry>,
}

pub fn router(registry: Arc<StrategyRegistry>) -> Router {
    let state = ApiState { registry };
    Router::new()
        .route("/health", get(routes::health))
        .route("/twap", post(routes::start_twap))
        .route("/twap-basket", post(routes::start_twap_basket))
        .route("/trail-stop", post(routes::start_trail_stop))
        .route("/chase-limit", post(routes::start_chase))
        .route("/scalper", post(routes::start_scalper))
        .route("/agents", post(routes::start_agent))
        .route("/:kind/active/:sub_account", get(routes::list_active))
        .route("/:kind/:id", delete(routes::stop_strategy))
        .route("/ws", get(routes::ws_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
