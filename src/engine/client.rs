//! Typed command surface over the raw engine link.
//!
//! Every mutating call owns a fresh idempotency key; retryable failures
//! (timeout, channel loss) may be replayed with the same key by the caller.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::link::EngineLink;
use super::protocol::{EngineEvent, EngineOp, OrderStatus, QUERY_ORDER_STATUS};
use crate::{
    error::{EngineError, EngineResult},
    models::Side,
};

/// Round to venue precision by price magnitude: >100 2dp, >1 4dp, else 6dp.
pub fn round_to_venue_precision(price: f64) -> f64 {
    let decimals = if price > 100.0 {
        2
    } else if price > 1.0 {
        4
    } else {
        6
    };
    let factor = 10f64.powi(decimals);
    (price * factor).round() / factor
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    #[serde(rename = "orderId")]
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(rename = "filledQty", default)]
    pub filled_qty: f64,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloseOutcome {
    #[serde(rename = "closedQty", default)]
    pub closed_qty: f64,
    #[serde(rename = "virtualOnly", default)]
    pub virtual_only: bool,
}

#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub sub_account: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    /// None places a market order.
    pub price: Option<f64>,
    pub leverage: f64,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

#[derive(Clone)]
pub struct ExecutionClient {
    link: Arc<dyn EngineLink>,
}

impl ExecutionClient {
    pub fn new(link: Arc<dyn EngineLink>) -> Self {
        Self { link }
    }

    pub fn is_ready(&self) -> bool {
        self.link.is_ready()
    }

    pub fn ensure_ready(&self) -> EngineResult<()> {
        if self.link.is_ready() {
            Ok(())
        } else {
            Err(EngineError::NotReady)
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.link.subscribe()
    }

    async fn execute(&self, op: &str, payload: Value) -> EngineResult<Value> {
        self.link
            .execute(op, &Uuid::new_v4().to_string(), payload)
            .await
    }

    pub async fn place_order(&self, req: &PlaceOrder) -> EngineResult<OrderAck> {
        if req.qty <= 0.0 || !req.qty.is_finite() {
            return Err(EngineError::validation("order qty must be positive"));
        }
        let mut payload = json!({
            "subAccountId": req.sub_account,
            "symbol": req.symbol,
            "side": req.side,
            "qty": req.qty,
            "leverage": req.leverage,
            "reduceOnly": req.reduce_only,
            "orderType": if req.price.is_some() { "limit" } else { "market" },
        });
        if let Some(price) = req.price {
            payload["price"] = json!(round_to_venue_precision(price));
        }
        if let Some(ref cid) = req.client_order_id {
            payload["clientOrderId"] = json!(cid);
        }
        let result = self.execute(EngineOp::New.as_str(), payload).await?;
        Ok(serde_json::from_value(result).map_err(|e| EngineError::Other(e.into()))?)
    }

    pub async fn order_status(&self, order_id: &str) -> EngineResult<OrderAck> {
        let result = self
            .execute(QUERY_ORDER_STATUS, json!({ "orderId": order_id }))
            .await?;
        Ok(serde_json::from_value(result).map_err(|e| EngineError::Other(e.into()))?)
    }

    /// Cancel a working order. The outcome may report FILLED when the cancel
    /// raced a fill; callers must treat that as the fill.
    pub async fn cancel_order(&self, order_id: &str) -> EngineResult<OrderAck> {
        let result = self
            .execute(EngineOp::CancelOrder.as_str(), json!({ "orderId": order_id }))
            .await?;
        Ok(serde_json::from_value(result).map_err(|e| EngineError::Other(e.into()))?)
    }

    /// Book a fill into the risk channel without touching the exchange, so the
    /// virtual position lands at the exact average.
    pub async fn book_fill(
        &self,
        sub_account: &str,
        symbol: &str,
        side: Side,
        qty: f64,
        fill_price: f64,
        fill_fee: f64,
    ) -> EngineResult<()> {
        self.execute(
            EngineOp::Trade.as_str(),
            json!({
                "subAccountId": sub_account,
                "symbol": symbol,
                "side": side,
                "qty": qty,
                "fillPrice": fill_price,
                "fillFee": fill_fee,
                "skipExchange": true,
            }),
        )
        .await?;
        Ok(())
    }

    /// Reduce-only market close for a virtual position.
    pub async fn close_position(
        &self,
        position_id: &str,
        qty: Option<f64>,
        reason: &str,
    ) -> EngineResult<CloseOutcome> {
        let mut payload = json!({ "positionId": position_id, "reason": reason });
        if let Some(qty) = qty {
            payload["qty"] = json!(qty);
        }
        let result = self
            .execute(EngineOp::ClosePosition.as_str(), payload)
            .await?;
        Ok(serde_json::from_value(result).map_err(|e| EngineError::Other(e.into()))?)
    }

    pub async fn close_all(&self, sub_account: &str) -> EngineResult<()> {
        self.execute(
            EngineOp::CloseAllPositions.as_str(),
            json!({ "subAccountId": sub_account }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_precision_heuristic() {
        assert_eq!(round_to_venue_precision(12345.6789), 12345.68);
        assert_eq!(round_to_venue_precision(12.345678), 12.3457);
        assert_eq!(round_to_venue_precision(0.12345678), 0.123457);
        // Boundary: exactly 100 uses 4 decimals, exactly 1 uses 6.
        assert_eq!(round_to_venue_precision(100.0), 100.0);
        assert_eq!(round_to_venue_precision(1.0), 1.0);
    }
}
