//! In-process execution simulator.
//!
//! Fills market orders at the cached touch, rests limit orders until the book
//! crosses them, keeps a virtual position ledger per (sub-account, symbol,
//! side), and emits the same event stream the live gateway would. Powers
//! `--paper` mode and the test suite.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use super::link::EngineLink;
use super::protocol::{EngineEvent, OrderStatus, OrderUpdate, TradeExecution};
use crate::{
    error::{EngineError, EngineResult},
    feeds::{BookTick, PriceFeed},
    models::{Position, Side},
};

#[derive(Debug, Clone)]
pub struct PaperEngineConfig {
    /// Simulated matching latency per command.
    pub latency_ms: u64,
    /// Probability a `new` order is rejected outright.
    pub reject_prob: f64,
    /// Taker fee rate applied to simulated fills.
    pub fee_rate: f64,
}

impl Default for PaperEngineConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            reject_prob: 0.0,
            fee_rate: 0.0004,
        }
    }
}

impl PaperEngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("PAPER_LATENCY_MS") {
            if let Ok(ms) = v.parse() {
                cfg.latency_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PAPER_REJECT_PROB") {
            if let Ok(p) = v.parse::<f64>() {
                if (0.0..=1.0).contains(&p) {
                    cfg.reject_prob = p;
                }
            }
        }
        if let Ok(v) = std::env::var("PAPER_FEE_RATE") {
            if let Ok(r) = v.parse() {
                cfg.fee_rate = r;
            }
        }
        cfg
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: String,
    sub_account: String,
    symbol: String,
    side: Side,
    qty: f64,
    /// None for market orders.
    limit_price: Option<f64>,
    filled_qty: f64,
    avg_price: f64,
    status: OrderStatus,
    reduce_only: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    /// (sub_account, symbol, side) -> open position.
    positions: HashMap<(String, String, Side), Position>,
}

pub struct PaperEngineLink {
    feed: Arc<PriceFeed>,
    cfg: PaperEngineConfig,
    orders: Mutex<HashMap<String, PaperOrder>>,
    ledger: Mutex<Ledger>,
    events: broadcast::Sender<EngineEvent>,
    /// Idempotency: key -> cached response.
    seen: Mutex<HashMap<String, Value>>,
}

impl PaperEngineLink {
    pub fn new(feed: Arc<PriceFeed>, cfg: PaperEngineConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(4096);
        let link = Arc::new(Self {
            feed,
            cfg,
            orders: Mutex::new(HashMap::new()),
            ledger: Mutex::new(Ledger::default()),
            events,
            seen: Mutex::new(HashMap::new()),
        });
        link.spawn_matcher();
        link
    }

    /// Background matcher: rested limit orders fill when the book crosses.
    fn spawn_matcher(self: &Arc<Self>) {
        let link = Arc::clone(self);
        let mut book_rx = self.feed.subscribe();
        tokio::spawn(async move {
            loop {
                match book_rx.recv().await {
                    Ok(update) => link.match_symbol(&update.symbol, update.tick),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(missed = n, "paper matcher lagged book updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn match_symbol(&self, symbol: &str, tick: BookTick) {
        let fillable: Vec<PaperOrder> = {
            let mut orders = self.orders.lock();
            let ids: Vec<String> = orders
                .values()
                .filter(|o| {
                    o.symbol == symbol
                        && o.status == OrderStatus::New
                        && match (o.side, o.limit_price) {
                            (Side::Long, Some(px)) => tick.ask <= px,
                            (Side::Short, Some(px)) => tick.bid >= px,
                            _ => false,
                        }
                })
                .map(|o| o.order_id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| {
                    let order = orders.get_mut(id)?;
                    order.status = OrderStatus::Filled;
                    order.filled_qty = order.qty;
                    order.avg_price = order.limit_price.unwrap_or(tick.mark);
                    Some(order.clone())
                })
                .collect()
        };

        for order in fillable {
            self.settle_fill(&order);
        }
    }

    fn settle_fill(&self, order: &PaperOrder) {
        let fee = order.filled_qty * order.avg_price * self.cfg.fee_rate;
        let position = self.apply_fill(
            &order.sub_account,
            &order.symbol,
            order.side,
            order.filled_qty,
            order.avg_price,
            order.reduce_only,
        );

        let _ = self.events.send(EngineEvent::OrderUpdate(OrderUpdate {
            order_id: order.order_id.clone(),
            client_order_id: None,
            symbol: order.symbol.clone(),
            side: order.side,
            status: OrderStatus::Filled,
            filled_qty: order.filled_qty,
            avg_price: order.avg_price,
            fee,
            reduce_only: order.reduce_only,
            ts: chrono::Utc::now().timestamp_millis(),
        }));
        let _ = self.events.send(EngineEvent::TradeExecution(TradeExecution {
            order_id: order.order_id.clone(),
            sub_account: order.sub_account.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.filled_qty,
            price: order.avg_price,
            fee,
            reduce_only: order.reduce_only,
            position_id: position.as_ref().map(|p| p.position_id.clone()),
            ts: chrono::Utc::now().timestamp_millis(),
        }));
        if let Some(position) = position {
            let _ = self.events.send(EngineEvent::PositionUpdate(position));
        }
    }

    /// Apply a fill to the virtual ledger. Returns the affected position.
    fn apply_fill(
        &self,
        sub_account: &str,
        symbol: &str,
        order_side: Side,
        qty: f64,
        price: f64,
        reduce_only: bool,
    ) -> Option<Position> {
        let mut ledger = self.ledger.lock();
        let position_side = if reduce_only {
            order_side.opposite()
        } else {
            order_side
        };
        let key = (
            sub_account.to_string(),
            symbol.to_string(),
            position_side,
        );

        if reduce_only {
            let position = ledger.positions.get_mut(&key)?;
            let closed = qty.min(position.quantity);
            position.quantity -= closed;
            position.notional = position.quantity * position.entry_price;
            let snapshot = position.clone();
            if position.quantity <= 1e-12 {
                ledger.positions.remove(&key);
            }
            return Some(snapshot);
        }

        let position = ledger.positions.entry(key).or_insert_with(|| Position {
            position_id: format!("{sub_account}:{symbol}:{}", position_side.as_str()),
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            side: position_side,
            quantity: 0.0,
            entry_price: 0.0,
            notional: 0.0,
            leverage: 1.0,
            liquidation_price: None,
        });
        let total = position.quantity + qty;
        if total > 0.0 {
            position.entry_price =
                (position.entry_price * position.quantity + price * qty) / total;
        }
        position.quantity = total;
        position.notional = position.quantity * position.entry_price;
        Some(position.clone())
    }

    pub fn position(&self, sub_account: &str, symbol: &str, side: Side) -> Option<Position> {
        self.ledger
            .lock()
            .positions
            .get(&(sub_account.to_string(), symbol.to_string(), side))
            .cloned()
    }

    pub fn open_order_count(&self, symbol: &str) -> usize {
        self.orders
            .lock()
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
            .count()
    }

    fn find_position_by_id(&self, position_id: &str) -> Option<Position> {
        self.ledger
            .lock()
            .positions
            .values()
            .find(|p| p.position_id == position_id)
            .cloned()
    }

    fn handle_new(&self, payload: &Value) -> EngineResult<Value> {
        let sub_account = str_field(payload, "subAccountId")?;
        let symbol = str_field(payload, "symbol")?;
        let side: Side = str_field(payload, "side")?
            .parse()
            .map_err(|_| EngineError::validation("bad side"))?;
        if side == Side::Neutral {
            return Err(EngineError::validation("neutral order side"));
        }
        let qty = num_field(payload, "qty")?;
        if qty <= 0.0 {
            return Err(EngineError::validation("qty must be positive"));
        }
        let reduce_only = payload
            .get("reduceOnly")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let limit_price = payload.get("price").and_then(Value::as_f64);

        if self.cfg.reject_prob > 0.0 && rand::random::<f64>() < self.cfg.reject_prob {
            return Err(EngineError::Rejected("paper venue rejected order".into()));
        }

        let tick = self
            .feed
            .latest(&symbol)
            .ok_or_else(|| EngineError::Rejected(format!("no market for {symbol}")))?;

        let order_id = format!("po-{}", Uuid::new_v4());
        let mut order = PaperOrder {
            order_id: order_id.clone(),
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            side,
            qty,
            limit_price,
            filled_qty: 0.0,
            avg_price: 0.0,
            status: OrderStatus::New,
            reduce_only,
        };

        let crossed = match (side, limit_price) {
            // Market orders cross by definition.
            (_, None) => true,
            (Side::Long, Some(px)) => tick.ask <= px,
            (_, Some(px)) => tick.bid >= px,
        };

        if crossed {
            order.status = OrderStatus::Filled;
            order.filled_qty = qty;
            order.avg_price = match (side, limit_price) {
                (Side::Long, None) => tick.ask,
                (Side::Short, None) => tick.bid,
                (_, Some(px)) => px,
                _ => tick.mark,
            };
            self.settle_fill(&order);
        }

        let response = json!({
            "orderId": order_id,
            "status": order.status,
            "filledQty": order.filled_qty,
            "avgPrice": order.avg_price,
        });
        self.orders.lock().insert(order_id, order);
        Ok(response)
    }

    fn handle_cancel(&self, payload: &Value) -> EngineResult<Value> {
        let order_id = str_field(payload, "orderId")?;
        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))?;

        // Cancel racing a fill: report the fill instead of cancelling.
        if order.status == OrderStatus::New {
            order.status = OrderStatus::Canceled;
        }
        Ok(json!({
            "orderId": order.order_id,
            "status": order.status,
            "filledQty": order.filled_qty,
            "avgPrice": order.avg_price,
        }))
    }

    fn handle_order_status(&self, payload: &Value) -> EngineResult<Value> {
        let order_id = str_field(payload, "orderId")?;
        let orders = self.orders.lock();
        let order = orders
            .get(order_id)
            .ok_or_else(|| EngineError::NotFound(format!("order {order_id}")))?;
        Ok(json!({
            "orderId": order.order_id,
            "status": order.status,
            "filledQty": order.filled_qty,
            "avgPrice": order.avg_price,
        }))
    }

    /// Book a fill directly into the virtual ledger (`skipExchange` path).
    fn handle_trade(&self, payload: &Value) -> EngineResult<Value> {
        let sub_account = str_field(payload, "subAccountId")?;
        let symbol = str_field(payload, "symbol")?;
        let side: Side = str_field(payload, "side")?
            .parse()
            .map_err(|_| EngineError::validation("bad side"))?;
        let qty = num_field(payload, "qty")?;
        let price = num_field(payload, "fillPrice")?;
        let reduce_only = payload
            .get("reduceOnly")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let position = self.apply_fill(sub_account, symbol, side, qty, price, reduce_only);
        if let Some(position) = position.clone() {
            let _ = self.events.send(EngineEvent::PositionUpdate(position));
        }
        Ok(json!({
            "booked": true,
            "positionId": position.map(|p| p.position_id),
        }))
    }

    fn handle_close_position(&self, payload: &Value) -> EngineResult<Value> {
        let position_id = str_field(payload, "positionId")?;
        let requested_qty = payload.get("qty").and_then(Value::as_f64);
        let reason = payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("CLOSE")
            .to_string();

        let Some(position) = self.find_position_by_id(position_id) else {
            // Desync path: nothing on the exchange side; caller marks the
            // virtual position closed locally.
            return Ok(json!({
                "closedQty": 0.0,
                "virtualOnly": true,
                "reason": format!("{reason}_VIRTUAL_ONLY"),
            }));
        };

        // Clamp to the exchange quantity.
        let close_qty = requested_qty
            .unwrap_or(position.quantity)
            .min(position.quantity);
        let tick = self
            .feed
            .latest(&position.symbol)
            .ok_or_else(|| EngineError::Rejected(format!("no market for {}", position.symbol)))?;

        let close_side = position.side.opposite();
        let price = match close_side {
            Side::Long => tick.ask,
            _ => tick.bid,
        };
        let order = PaperOrder {
            order_id: format!("po-{}", Uuid::new_v4()),
            sub_account: position.sub_account.clone(),
            symbol: position.symbol.clone(),
            side: close_side,
            qty: close_qty,
            limit_price: None,
            filled_qty: close_qty,
            avg_price: price,
            status: OrderStatus::Filled,
            reduce_only: true,
        };
        self.settle_fill(&order);

        Ok(json!({
            "closedQty": close_qty,
            "virtualOnly": false,
            "price": price,
            "reason": reason,
        }))
    }

    fn handle_close_all(&self, payload: &Value) -> EngineResult<Value> {
        let sub_account = str_field(payload, "subAccountId")?;
        let ids: Vec<String> = self
            .ledger
            .lock()
            .positions
            .values()
            .filter(|p| p.sub_account == sub_account)
            .map(|p| p.position_id.clone())
            .collect();
        let mut closed = 0usize;
        for position_id in ids {
            if self
                .handle_close_position(&json!({ "positionId": position_id, "reason": "CLOSE_ALL" }))
                .is_ok()
            {
                closed += 1;
            }
        }
        Ok(json!({ "closed": closed }))
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> EngineResult<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::validation(format!("missing field: {key}")))
}

fn num_field(payload: &Value, key: &str) -> EngineResult<f64> {
    payload
        .get(key)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .ok_or_else(|| EngineError::validation(format!("missing numeric field: {key}")))
}

#[async_trait]
impl EngineLink for PaperEngineLink {
    async fn execute(
        &self,
        op: &str,
        idempotency_key: &str,
        payload: Value,
    ) -> EngineResult<Value> {
        if let Some(cached) = self.seen.lock().get(idempotency_key).cloned() {
            debug!(op, idempotency_key, "replaying cached paper response");
            return Ok(cached);
        }
        if self.cfg.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.cfg.latency_ms)).await;
        }

        let result = match op {
            "new" => self.handle_new(&payload),
            "cancel" | "cancel_order" => self.handle_cancel(&payload),
            "order_status" => self.handle_order_status(&payload),
            "trade" | "execute_trade" => self.handle_trade(&payload),
            "close" | "close_position" => self.handle_close_position(&payload),
            "close_all" | "close_all_positions" => self.handle_close_all(&payload),
            other => {
                warn!(op = other, "paper engine acking unmodelled op");
                Ok(json!({ "ok": true }))
            }
        };

        if let Ok(value) = &result {
            self.seen
                .lock()
                .insert(idempotency_key.to_string(), value.clone());
        }
        result
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn is_ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(mid: f64) -> BookTick {
        BookTick {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            mark: mid,
            bid: mid - 0.5,
            ask: mid + 0.5,
        }
    }

    fn paper() -> (Arc<PriceFeed>, Arc<PaperEngineLink>) {
        let feed = PriceFeed::new("http://unused");
        let link = PaperEngineLink::new(Arc::clone(&feed), PaperEngineConfig::default());
        feed.push_tick("BTCUSDT", tick(100.0));
        (feed, link)
    }

    #[tokio::test]
    async fn market_order_fills_at_touch() {
        let (_feed, link) = paper();
        let result = link
            .execute(
                "new",
                "k1",
                json!({
                    "subAccountId": "acct", "symbol": "BTCUSDT", "side": "long",
                    "qty": 1.0, "orderType": "market",
                }),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "FILLED");
        assert_eq!(result["avgPrice"], 100.5);

        let pos = link.position("acct", "BTCUSDT", Side::Long).unwrap();
        assert!((pos.quantity - 1.0).abs() < 1e-12);
        assert!((pos.entry_price - 100.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn resting_limit_fills_when_book_crosses() {
        let (feed, link) = paper();
        let result = link
            .execute(
                "new",
                "k2",
                json!({
                    "subAccountId": "acct", "symbol": "BTCUSDT", "side": "long",
                    "qty": 2.0, "price": 99.0,
                }),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "NEW");
        let order_id = result["orderId"].as_str().unwrap().to_string();

        // Book drops through the limit.
        feed.push_tick("BTCUSDT", tick(98.0));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = link
            .execute("order_status", "k3", json!({ "orderId": order_id }))
            .await
            .unwrap();
        assert_eq!(status["status"], "FILLED");
        assert_eq!(status["avgPrice"], 99.0);
    }

    #[tokio::test]
    async fn cancel_tolerates_fill_race() {
        let (_feed, link) = paper();
        let result = link
            .execute(
                "new",
                "k4",
                json!({
                    "subAccountId": "acct", "symbol": "BTCUSDT", "side": "short",
                    "qty": 1.0, "price": 50.0,
                }),
            )
            .await
            .unwrap();
        // Short limit at 50 crosses immediately (bid 99.5 >= 50).
        assert_eq!(result["status"], "FILLED");
        let order_id = result["orderId"].as_str().unwrap();

        let cancel = link
            .execute("cancel_order", "k5", json!({ "orderId": order_id }))
            .await
            .unwrap();
        assert_eq!(cancel["status"], "FILLED");
        assert_eq!(cancel["filledQty"], 1.0);
    }

    #[tokio::test]
    async fn close_clamps_to_exchange_qty_and_flags_virtual_only() {
        let (_feed, link) = paper();
        link.execute(
            "trade",
            "k6",
            json!({
                "subAccountId": "acct", "symbol": "BTCUSDT", "side": "long",
                "qty": 1.0, "fillPrice": 100.0, "skipExchange": true,
            }),
        )
        .await
        .unwrap();

        let position_id = link
            .position("acct", "BTCUSDT", Side::Long)
            .unwrap()
            .position_id;

        // Request more than is open: clamped.
        let closed = link
            .execute(
                "close_position",
                "k7",
                json!({ "positionId": position_id, "qty": 5.0, "reason": "TRAIL_STOP" }),
            )
            .await
            .unwrap();
        assert_eq!(closed["closedQty"], 1.0);
        assert_eq!(closed["virtualOnly"], false);

        // Position is gone now: virtual-only outcome.
        let gone = link
            .execute(
                "close_position",
                "k8",
                json!({ "positionId": position_id, "reason": "TRAIL_STOP" }),
            )
            .await
            .unwrap();
        assert_eq!(gone["virtualOnly"], true);
        assert_eq!(gone["reason"], "TRAIL_STOP_VIRTUAL_ONLY");
    }

    #[tokio::test]
    async fn idempotency_key_replays_cached_response() {
        let (_feed, link) = paper();
        let first = link
            .execute(
                "new",
                "same-key",
                json!({
                    "subAccountId": "acct", "symbol": "BTCUSDT", "side": "long",
                    "qty": 1.0, "orderType": "market",
                }),
            )
            .await
            .unwrap();
        let second = link
            .execute(
                "new",
                "same-key",
                json!({
                    "subAccountId": "acct", "symbol": "BTCUSDT", "side": "long",
                    "qty": 1.0, "orderType": "market",
                }),
            )
            .await
            .unwrap();
        assert_eq!(first, second);
        // Only one fill reached the ledger.
        let pos = link.position("acct", "BTCUSDT", Side::Long).unwrap();
        assert!((pos.quantity - 1.0).abs() < 1e-12);
    }
}
