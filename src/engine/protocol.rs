//! Execution-channel wire protocol.
//!
//! Outbound commands are line-delimited JSON envelopes; inbound traffic is a
//! mix of request responses (correlated by `requestId`) and engine events.
//! The mutating op set is a fixed contract shared with the engine, checked via
//! [`verify_op_contract`]; violations are logged but traffic is never dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::models::{Position, Side};

pub const SCHEMA_VERSION: u32 = 1;

/// The fixed, ordered set of mutating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineOp {
    New,
    Trade,
    ExecuteTrade,
    Cancel,
    CancelOrder,
    UpsertAccount,
    UpsertRule,
    UpsertPosition,
    UpsertExchangePosition,
    Close,
    ClosePosition,
    CloseAll,
    CloseAllPositions,
    ChaseStart,
    ChaseCancel,
    ScalperStart,
    ScalperCancel,
    TwapStart,
    TwapStop,
    BasketStart,
    BasketStop,
    TrailStart,
    TrailCancel,
    SmartOrder,
    SmartOrderStop,
    AgentStart,
    AgentStop,
}

impl EngineOp {
    pub const ALL: [EngineOp; 27] = [
        EngineOp::New,
        EngineOp::Trade,
        EngineOp::ExecuteTrade,
        EngineOp::Cancel,
        EngineOp::CancelOrder,
        EngineOp::UpsertAccount,
        EngineOp::UpsertRule,
        EngineOp::UpsertPosition,
        EngineOp::UpsertExchangePosition,
        EngineOp::Close,
        EngineOp::ClosePosition,
        EngineOp::CloseAll,
        EngineOp::CloseAllPositions,
        EngineOp::ChaseStart,
        EngineOp::ChaseCancel,
        EngineOp::ScalperStart,
        EngineOp::ScalperCancel,
        EngineOp::TwapStart,
        EngineOp::TwapStop,
        EngineOp::BasketStart,
        EngineOp::BasketStop,
        EngineOp::TrailStart,
        EngineOp::TrailCancel,
        EngineOp::SmartOrder,
        EngineOp::SmartOrderStop,
        EngineOp::AgentStart,
        EngineOp::AgentStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineOp::New => "new",
            EngineOp::Trade => "trade",
            EngineOp::ExecuteTrade => "execute_trade",
            EngineOp::Cancel => "cancel",
            EngineOp::CancelOrder => "cancel_order",
            EngineOp::UpsertAccount => "upsert_account",
            EngineOp::UpsertRule => "upsert_rule",
            EngineOp::UpsertPosition => "upsert_position",
            EngineOp::UpsertExchangePosition => "upsert_exchange_position",
            EngineOp::Close => "close",
            EngineOp::ClosePosition => "close_position",
            EngineOp::CloseAll => "close_all",
            EngineOp::CloseAllPositions => "close_all_positions",
            EngineOp::ChaseStart => "chase_start",
            EngineOp::ChaseCancel => "chase_cancel",
            EngineOp::ScalperStart => "scalper_start",
            EngineOp::ScalperCancel => "scalper_cancel",
            EngineOp::TwapStart => "twap_start",
            EngineOp::TwapStop => "twap_stop",
            EngineOp::BasketStart => "basket_start",
            EngineOp::BasketStop => "basket_stop",
            EngineOp::TrailStart => "trail_start",
            EngineOp::TrailCancel => "trail_cancel",
            EngineOp::SmartOrder => "smart_order",
            EngineOp::SmartOrderStop => "smart_order_stop",
            EngineOp::AgentStart => "agent_start",
            EngineOp::AgentStop => "agent_stop",
        }
    }
}

/// Non-mutating query op: order-state polling. Not part of the mutating
/// contract set.
pub const QUERY_ORDER_STATUS: &str = "order_status";

/// Compare the engine-advertised mutating op set against ours. Violations are
/// logged but traffic is never dropped.
pub fn verify_op_contract(engine_ops: &[String]) {
    let ours: Vec<&str> = EngineOp::ALL.iter().map(|op| op.as_str()).collect();
    if engine_ops.len() != ours.len() || engine_ops.iter().zip(&ours).any(|(a, b)| a != b) {
        warn!(
            engine = ?engine_ops,
            client = ?ours,
            "mutating op contract mismatch between client and engine"
        );
    }
}

/// Outbound command envelope, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "requestId")]
    pub request_id: u64,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    pub op: String,
    pub payload: Value,
}

impl CommandEnvelope {
    pub fn new(request_id: u64, idempotency_key: String, op: &str, payload: Value) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            request_id,
            idempotency_key,
            op: op.to_string(),
            payload,
        }
    }
}

/// Order lifecycle status as reported by the venue via the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// The actor observes at most one terminal event per client order id.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "clientOrderId", default)]
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    #[serde(rename = "filledQty", default)]
    pub filled_qty: f64,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: f64,
    #[serde(default)]
    pub fee: f64,
    #[serde(rename = "reduceOnly", default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecution {
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "subAccountId")]
    pub sub_account: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    #[serde(default)]
    pub fee: f64,
    #[serde(rename = "reduceOnly", default)]
    pub reduce_only: bool,
    #[serde(rename = "positionId", default)]
    pub position_id: Option<String>,
    #[serde(default)]
    pub ts: i64,
}

/// Inbound engine traffic that is not a request response.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Heartbeat { ts: i64 },
    Ready { ops: Vec<String> },
    PositionsSnapshot(Vec<Position>),
    MarginSnapshot(Value),
    StatsSnapshot(Value),
    OrderUpdate(OrderUpdate),
    TradeExecution(TradeExecution),
    PositionUpdate(Position),
    Error { message: String },
    /// Typed progress streams, name prefixed `trail_`, `chase_`, `scalper_`,
    /// `twap_`, `smart_order_`.
    Progress { stream: String, payload: Value },
}

/// A correlated response to an outbound command.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "requestId")]
    pub request_id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

const PROGRESS_PREFIXES: [&str; 5] = ["trail_", "chase_", "scalper_", "twap_", "smart_order_"];

/// Parse one inbound line. Returns `Ok(Err(frame))` for request responses and
/// `Ok(Ok(event))` for events; unknown types map to `Error`.
pub fn parse_inbound(line: &str) -> anyhow::Result<Result<EngineEvent, ResponseFrame>> {
    let value: Value = serde_json::from_str(line)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if kind == "response" {
        return Ok(Err(serde_json::from_value(value)?));
    }

    let data = value.get("data").cloned().unwrap_or(Value::Null);
    let event = match kind.as_str() {
        "ENGINE_HEARTBEAT" => EngineEvent::Heartbeat {
            ts: value.get("ts").and_then(Value::as_i64).unwrap_or(0),
        },
        "ENGINE_READY" => EngineEvent::Ready {
            ops: value
                .get("ops")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        },
        "positions_snapshot" => EngineEvent::PositionsSnapshot(serde_json::from_value(data)?),
        "margin_snapshot" => EngineEvent::MarginSnapshot(data),
        "stats_snapshot" => EngineEvent::StatsSnapshot(data),
        "order_update" => EngineEvent::OrderUpdate(serde_json::from_value(data)?),
        "trade_execution" => EngineEvent::TradeExecution(serde_json::from_value(data)?),
        "position_update" => EngineEvent::PositionUpdate(serde_json::from_value(data)?),
        "error" => EngineEvent::Error {
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown engine error")
                .to_string(),
        },
        other if PROGRESS_PREFIXES.iter().any(|p| other.starts_with(p)) => EngineEvent::Progress {
            stream: other.to_string(),
            payload: data,
        },
        other => EngineEvent::Error {
            message: format!("unknown engine message type: {other}"),
        },
    };
    Ok(Ok(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_set_is_exactly_the_contract() {
        let names: Vec<&str> = EngineOp::ALL.iter().map(|op| op.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "new",
                "trade",
                "execute_trade",
                "cancel",
                "cancel_order",
                "upsert_account",
                "upsert_rule",
                "upsert_position",
                "upsert_exchange_position",
                "close",
                "close_position",
                "close_all",
                "close_all_positions",
                "chase_start",
                "chase_cancel",
                "scalper_start",
                "scalper_cancel",
                "twap_start",
                "twap_stop",
                "basket_start",
                "basket_stop",
                "trail_start",
                "trail_cancel",
                "smart_order",
                "smart_order_stop",
                "agent_start",
                "agent_stop",
            ]
        );
    }

    #[test]
    fn envelope_round_trip() {
        let env = CommandEnvelope::new(7, "k-1".into(), EngineOp::New.as_str(), serde_json::json!({"symbol": "BTCUSDT"}));
        let line = serde_json::to_string(&env).unwrap();
        assert!(line.contains("\"schemaVersion\":1"));
        assert!(line.contains("\"op\":\"new\""));
        let back: CommandEnvelope = serde_json::from_str(&line).unwrap();
        assert_eq!(back.request_id, 7);
        assert_eq!(back.idempotency_key, "k-1");
    }

    #[test]
    fn parse_response_and_events() {
        let resp = parse_inbound(r#"{"type":"response","requestId":3,"ok":true,"result":{"orderId":"o-1"}}"#)
            .unwrap();
        let frame = resp.err().expect("response frame");
        assert_eq!(frame.request_id, 3);
        assert!(frame.ok);

        let hb = parse_inbound(r#"{"type":"ENGINE_HEARTBEAT","ts":1712}"#).unwrap().ok().unwrap();
        assert!(matches!(hb, EngineEvent::Heartbeat { ts: 1712 }));

        let progress = parse_inbound(r#"{"type":"twap_progress","data":{"filledLots":3}}"#)
            .unwrap()
            .ok()
            .unwrap();
        match progress {
            EngineEvent::Progress { stream, payload } => {
                assert_eq!(stream, "twap_progress");
                assert_eq!(payload["filledLots"], 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn order_update_wire_format() {
        let raw = r#"{"type":"order_update","data":{
            "orderId":"o-9","symbol":"ETHUSDT","side":"long","status":"PARTIALLY_FILLED",
            "filledQty":0.5,"avgPrice":3000.1,"reduceOnly":false,"ts":1}}"#;
        let event = parse_inbound(raw).unwrap().ok().unwrap();
        match event {
            EngineEvent::OrderUpdate(u) => {
                assert_eq!(u.status, OrderStatus::PartiallyFilled);
                assert!(!u.status.is_terminal());
                assert_eq!(u.side, Side::Long);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
    }
}
