use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::ApiState;
use crate::{
    agents::AgentParams,
    error::EngineError,
    models::{StrategyId, StrategyKind},
    strategies::{
        chase::ChaseParams, scalper::ScalperParams, trail_stop::TrailStopParams,
        twap::TwapParams, twap_basket::TwapBasketParams,
    },
};

fn kind_from_path(kind: &str) -> Result<StrategyKind, EngineError> {
    match kind {
        "twap" => Ok(StrategyKind::Twap),
        "twap-basket" => Ok(StrategyKind::TwapBasket),
        "trail-stop" => Ok(StrategyKind::TrailStop),
        "chase-limit" => Ok(StrategyKind::Chase),
        "scalper" => Ok(StrategyKind::Scalper),
        "agents" => Ok(StrategyKind::Agent),
        other => Err(EngineError::NotFound(format!("unknown strategy kind: {other}"))),
    }
}

pub async fn health(State(state): State<ApiState>) -> Json<Value> {
    let ctx = state.registry.ctx();
    Json(json!({
        "status": "ok",
        "engineReady": ctx.engine.is_ready(),
        "active": state.registry.active_counts(),
    }))
}

pub async fn start_twap(
    State(state): State<ApiState>,
    Json(params): Json<TwapParams>,
) -> Result<Json<Value>, EngineError> {
    let id = state.registry.start_twap(params)?;
    Ok(Json(json!({ "strategyId": id })))
}

pub async fn start_twap_basket(
    State(state): State<ApiState>,
    Json(params): Json<TwapBasketParams>,
) -> Result<Json<Value>, EngineError> {
    let id = state.registry.start_twap_basket(params)?;
    Ok(Json(json!({ "strategyId": id })))
}

pub async fn start_trail_stop(
    State(state): State<ApiState>,
    Json(params): Json<TrailStopParams>,
) -> Result<Json<Value>, EngineError> {
    let id = state.registry.start_trail_stop(params)?;
    Ok(Json(json!({ "strategyId": id })))
}

pub async fn start_chase(
    State(state): State<ApiState>,
    Json(params): Json<ChaseParams>,
) -> Result<Json<Value>, EngineError> {
    let id = state.registry.start_chase(params)?;
    Ok(Json(json!({ "strategyId": id })))
}

pub async fn start_scalper(
    State(state): State<ApiState>,
    Json(params): Json<ScalperParams>,
) -> Result<Json<Value>, EngineError> {
    let id = state.registry.start_scalper(params)?;
    Ok(Json(json!({ "strategyId": id })))
}

pub async fn start_agent(
    State(state): State<ApiState>,
    Json(params): Json<AgentParams>,
) -> Result<Json<Value>, EngineError> {
    let id = state.registry.start_agent(params)?;
    Ok(Json(json!({ "strategyId": id })))
}

pub async fn list_active(
    State(state): State<ApiState>,
    Path((kind, sub_account)): Path<(String, String)>,
) -> Result<Json<Value>, EngineError> {
    let kind = kind_from_path(&kind)?;
    let strategies = state.registry.list(Some(&sub_account), Some(kind));
    Ok(Json(json!({
        "count": strategies.len(),
        "strategies": strategies,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    /// `close=1` also flattens remaining inventory (scalper).
    #[serde(default)]
    pub close: Option<u8>,
    #[serde(rename = "subAccountId", default)]
    pub sub_account: Option<String>,
}

pub async fn stop_strategy(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, StrategyId)>,
    Query(query): Query<StopQuery>,
) -> Result<Json<Value>, EngineError> {
    kind_from_path(&kind)?;
    let close = query.close.unwrap_or(0) == 1;
    state
        .registry
        .stop(&id, "user_request", close, query.sub_account.as_deref())?;
    Ok(Json(json!({ "stopped": id, "close": close })))
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "subAccountId")]
    pub sub_account: String,
}

/// Fan lifecycle events out to one sub-account's subscribers.
pub async fn ws_events(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<ApiState>,
) -> Response {
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| handle_ws(socket, registry, query.sub_account))
        .into_response()
}

async fn handle_ws(
    mut socket: WebSocket,
    registry: std::sync::Arc<crate::strategies::StrategyRegistry>,
    sub_account: String,
) {
    let mut events = registry.ctx().events.subscribe();
    debug!(sub_account, "ws subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) if event.sub_account == sub_account => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(sub_account, missed = n, "ws subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                // Clients only listen; any close or error tears down.
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(sub_account, "ws subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_path_mapping() {
        assert_eq!(kind_from_path("twap").unwrap(), StrategyKind::Twap);
        assert_eq!(
            kind_from_path("twap-basket").unwrap(),
            StrategyKind::TwapBasket
        );
        assert_eq!(
            kind_from_path("trail-stop").unwrap(),
            StrategyKind::TrailStop
        );
        assert_eq!(kind_from_path("chase-limit").unwrap(), StrategyKind::Chase);
        assert_eq!(kind_from_path("scalper").unwrap(), StrategyKind::Scalper);
        assert_eq!(kind_from_path("agents").unwrap(), StrategyKind::Agent);
        assert!(kind_from_path("nope").is_err());
    }
}
