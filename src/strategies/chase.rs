//! Chase engine: one actor per working limit order, continuously repriced to
//! track the touch.
//!
//! The actor owns at most one venue order at any time. Cancel-then-place is
//! optimistic; a cancel that races a fill is treated as the fill and no
//! replacement is placed. Rejected replacements retry with capped exponential
//! backoff.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{SharedState, StopSignal, StrategyCtx};
use crate::{
    engine::{EngineEvent, OrderStatus, PlaceOrder},
    error::{EngineError, EngineResult},
    models::{Side, StrategyId, StrategyStatus},
};

pub const KIND: &str = "chase";

/// Maximum backoff between replacement attempts after a venue rejection.
const MAX_RETRY_BACKOFF_MS: u64 = 4_000;
const BASE_RETRY_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalkMode {
    None,
    Conservative,
    Aggressive,
}

impl Default for StalkMode {
    fn default() -> Self {
        StalkMode::Conservative
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaseParams {
    pub sub_account: String,
    pub symbol: String,
    pub side: Side,
    /// Base quantity; when absent, derived from `notional_usd` at start.
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub notional_usd: Option<f64>,
    pub leverage: f64,
    pub stalk_offset_pct: f64,
    #[serde(default)]
    pub stalk_mode: StalkMode,
    #[serde(default)]
    pub max_distance_pct: Option<f64>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub parent_scalper_id: Option<String>,
    #[serde(default)]
    pub layer_idx: Option<usize>,
}

pub fn validate(params: &ChaseParams) -> EngineResult<()> {
    if params.sub_account.is_empty() || params.symbol.is_empty() {
        return Err(EngineError::validation("subAccountId and symbol are required"));
    }
    if params.side == Side::Neutral {
        return Err(EngineError::validation("chase side must be long or short"));
    }
    if params.qty.is_none() && params.notional_usd.is_none() {
        return Err(EngineError::validation(
            "either qty or notionalUsd is required",
        ));
    }
    if let Some(qty) = params.qty {
        if !(qty.is_finite() && qty > 0.0) {
            return Err(EngineError::validation("qty must be positive"));
        }
    }
    if let Some(notional) = params.notional_usd {
        if !(notional.is_finite() && notional > 0.0) {
            return Err(EngineError::validation("notionalUsd must be positive"));
        }
    }
    if !(params.leverage > 0.0 && params.leverage <= 125.0) {
        return Err(EngineError::validation("leverage must be in (0, 125]"));
    }
    if !(params.stalk_offset_pct >= 0.0 && params.stalk_offset_pct.is_finite()) {
        return Err(EngineError::validation("stalkOffsetPct must be >= 0"));
    }
    if let Some(max_distance) = params.max_distance_pct {
        if !(max_distance > 0.0 && max_distance.is_finite()) {
            return Err(EngineError::validation("maxDistancePct must be positive"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaseRuntime {
    pub side: Side,
    pub stalk_offset_pct: f64,
    pub stalk_mode: StalkMode,
    pub max_distance_pct: Option<f64>,
    pub reduce_only: bool,
    pub parent_scalper_id: Option<String>,
    pub layer_idx: Option<usize>,
    pub qty: f64,
    pub current_order_price: Option<f64>,
    pub initial_price: f64,
    pub reprice_count: u64,
    pub paused: bool,
    pub retry_at: Option<i64>,
}

/// A fill observed by a chase, reported up to its parent.
#[derive(Debug, Clone)]
pub struct ChaseFill {
    pub chase_id: StrategyId,
    pub layer_idx: Option<usize>,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub reduce_only: bool,
}

#[derive(Debug, Clone)]
pub enum ChaseReport {
    Filled(ChaseFill),
    Stopped {
        chase_id: StrategyId,
        layer_idx: Option<usize>,
    },
}

/// Target price for the next working order. Offset 0 sits at the best quote.
pub fn target_price(side: Side, bid: f64, ask: f64, offset_pct: f64) -> f64 {
    match side {
        Side::Long => bid * (1.0 - offset_pct / 100.0),
        Side::Short => ask * (1.0 + offset_pct / 100.0),
        Side::Neutral => (bid + ask) / 2.0,
    }
}

/// Repricing dead-band at venue tick scale for this price magnitude.
pub fn reprice_dead_band(price: f64) -> f64 {
    if price > 100.0 {
        0.01
    } else if price > 1.0 {
        0.0001
    } else {
        0.000001
    }
}

/// Whether the target has drifted past the allowed distance from the anchor.
pub fn out_of_band(target: f64, initial_price: f64, max_distance_pct: Option<f64>) -> bool {
    match max_distance_pct {
        Some(max_pct) if initial_price > 0.0 => {
            (target - initial_price).abs() / initial_price * 100.0 > max_pct
        }
        _ => false,
    }
}

struct ChaseActor {
    ctx: StrategyCtx,
    id: StrategyId,
    params: ChaseParams,
    shared: Arc<SharedState>,
    parent_tx: Option<mpsc::UnboundedSender<ChaseReport>>,
    runtime: ChaseRuntime,
    working_order_id: Option<String>,
    reject_streak: u32,
    retry_at: Option<Instant>,
}

async fn init_runtime(ctx: &StrategyCtx, params: &ChaseParams) -> EngineResult<ChaseRuntime> {
    let tick = ctx
        .feed
        .resolve(&params.symbol)
        .await
        .map_err(EngineError::Other)?;

    let initial_price = target_price(params.side, tick.bid, tick.ask, params.stalk_offset_pct);
    let qty = match params.qty {
        Some(qty) => qty,
        None => params.notional_usd.unwrap_or(0.0) / tick.mark,
    };
    if qty <= 0.0 {
        return Err(EngineError::validation("derived qty is zero"));
    }

    Ok(ChaseRuntime {
        side: params.side,
        stalk_offset_pct: params.stalk_offset_pct,
        stalk_mode: params.stalk_mode,
        max_distance_pct: params.max_distance_pct,
        reduce_only: params.reduce_only,
        parent_scalper_id: params.parent_scalper_id.clone(),
        layer_idx: params.layer_idx,
        qty,
        current_order_price: None,
        initial_price,
        reprice_count: 0,
        paused: false,
        retry_at: None,
    })
}

pub async fn run(
    ctx: StrategyCtx,
    id: StrategyId,
    params: ChaseParams,
    stop: StopSignal,
    shared: Arc<SharedState>,
    parent_tx: Option<mpsc::UnboundedSender<ChaseReport>>,
) {
    let first_subscriber = ctx.feed.retain(&params.symbol);
    if first_subscriber {
        debug!(symbol = %params.symbol, "chase is first subscriber for symbol");
    }

    let runtime = match init_runtime(&ctx, &params).await {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(chase = %id, error = %e, "chase failed to start");
            shared.set_status(StrategyStatus::Stopped);
            ctx.emit_lifecycle(
                KIND,
                "error",
                &params.sub_account,
                &id,
                json!({ "error": e.to_string() }),
            );
            if let Some(tx) = &parent_tx {
                let _ = tx.send(ChaseReport::Stopped {
                    chase_id: id.clone(),
                    layer_idx: params.layer_idx,
                });
            }
            ctx.feed.release(&params.symbol);
            return;
        }
    };

    let mut actor = ChaseActor {
        ctx,
        id,
        params,
        shared,
        parent_tx,
        runtime,
        working_order_id: None,
        reject_streak: 0,
        retry_at: None,
    };
    actor.run_loop(stop).await;
    actor.ctx.feed.release(&actor.params.symbol);
}

impl ChaseActor {

    fn publish_snapshot(&self) {
        if let Ok(value) = serde_json::to_value(&self.runtime) {
            self.shared.update_snapshot(value);
        }
    }

    async fn run_loop(&mut self, mut stop: StopSignal) {
        self.shared.set_status(StrategyStatus::Active);
        self.ctx.emit_lifecycle(
            KIND,
            "started",
            &self.params.sub_account,
            &self.id,
            json!({ "symbol": self.params.symbol, "side": self.params.side }),
        );

        let mut book_rx = self.ctx.feed.subscribe();
        let mut engine_rx = self.ctx.engine.subscribe_events();

        // Initial placement at the current target.
        if let Some(tick) = self.ctx.feed.latest(&self.params.symbol) {
            let target = target_price(
                self.params.side,
                tick.bid,
                tick.ask,
                self.params.stalk_offset_pct,
            );
            if self.try_place(target).await {
                return;
            }
        }
        self.publish_snapshot();

        loop {
            let retry_deadline = self.retry_at;
            let retry_timer = async move {
                match retry_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                req = stop.wait() => {
                    self.shutdown(&req.reason).await;
                    return;
                }
                update = book_rx.recv() => {
                    match update {
                        Ok(update) if update.symbol == self.params.symbol => {
                            if self.on_book(update.tick.bid, update.tick.ask).await {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(chase = %self.id, missed = n, "chase lagged book updates");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.shutdown("feed_closed").await;
                            return;
                        }
                    }
                }
                event = engine_rx.recv() => {
                    if let Ok(EngineEvent::OrderUpdate(update)) = event {
                        if Some(&update.order_id) == self.working_order_id.as_ref()
                            && update.status == OrderStatus::Filled
                        {
                            self.on_filled(update.filled_qty, update.avg_price).await;
                            return;
                        }
                    }
                }
                _ = retry_timer => {
                    self.retry_at = None;
                    if let Some(tick) = self.ctx.feed.latest(&self.params.symbol) {
                        let target = target_price(
                            self.params.side, tick.bid, tick.ask, self.params.stalk_offset_pct,
                        );
                        if !self.runtime.paused {
                            if self.try_place(target).await {
                                return;
                            }
                            self.publish_snapshot();
                        }
                    }
                }
            }
        }
    }

    /// Handle one book update. Returns true when the actor reached terminal.
    async fn on_book(&mut self, bid: f64, ask: f64) -> bool {
        let target = target_price(self.params.side, bid, ask, self.params.stalk_offset_pct);

        // Distance guard: pause outside the band, resume when back inside.
        if out_of_band(target, self.runtime.initial_price, self.runtime.max_distance_pct) {
            if !self.runtime.paused {
                self.runtime.paused = true;
                if let Some(order_id) = self.working_order_id.take() {
                    match self.ctx.engine.cancel_order(&order_id).await {
                        Ok(ack) if ack.status == OrderStatus::Filled => {
                            self.on_filled(ack.filled_qty, ack.avg_price).await;
                            return true;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(chase = %self.id, error = %e, "pause-cancel failed"),
                    }
                }
                self.runtime.current_order_price = None;
                self.publish_snapshot();
            }
            return false;
        }
        if self.runtime.paused {
            self.runtime.paused = false;
            if self.try_place(target).await {
                return true;
            }
            self.publish_snapshot();
            return false;
        }

        match self.runtime.current_order_price {
            None if self.retry_at.is_none() => {
                if self.try_place(target).await {
                    return true;
                }
                self.publish_snapshot();
            }
            Some(current) if (target - current).abs() > reprice_dead_band(current) => {
                if self.reprice(target).await {
                    return true;
                }
                self.publish_snapshot();
            }
            _ => {}
        }
        false
    }

    /// Cancel-then-place toward `target`. Returns true on terminal (fill).
    async fn reprice(&mut self, target: f64) -> bool {
        let Some(order_id) = self.working_order_id.take() else {
            return self.try_place(target).await;
        };

        match self.ctx.engine.cancel_order(&order_id).await {
            Ok(ack) if ack.status == OrderStatus::Filled => {
                // The cancel raced a fill: take the fill, no replacement.
                self.on_filled(ack.filled_qty, ack.avg_price).await;
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(chase = %self.id, error = %e, "reprice cancel failed");
                // Unknown order state; next order event resolves it.
                self.working_order_id = Some(order_id);
                return false;
            }
        }

        self.runtime.current_order_price = None;
        if self.try_place(target).await {
            return true;
        }
        if self.working_order_id.is_some() {
            self.runtime.reprice_count += 1;
            self.ctx.emit_lifecycle(
                KIND,
                "progress",
                &self.params.sub_account,
                &self.id,
                json!({
                    "repriceCount": self.runtime.reprice_count,
                    "price": self.runtime.current_order_price,
                }),
            );
        }
        false
    }

    /// Place at `target`. Returns true when the order filled immediately and
    /// the actor reached terminal.
    async fn try_place(&mut self, target: f64) -> bool {
        let order = PlaceOrder {
            sub_account: self.params.sub_account.clone(),
            symbol: self.params.symbol.clone(),
            side: self.params.side,
            qty: self.runtime.qty,
            price: Some(target),
            leverage: self.params.leverage,
            reduce_only: self.params.reduce_only,
            client_order_id: Some(format!("chase-{}-{}", self.id, self.runtime.reprice_count)),
        };

        match self.ctx.engine.place_order(&order).await {
            Ok(ack) => {
                self.reject_streak = 0;
                self.retry_at = None;
                if ack.status == OrderStatus::Filled {
                    self.on_filled(ack.filled_qty, ack.avg_price).await;
                    return true;
                }
                self.runtime.current_order_price = Some(target);
                self.working_order_id = Some(ack.order_id);
                false
            }
            Err(e) => {
                self.reject_streak = self.reject_streak.saturating_add(1);
                let backoff_ms = (BASE_RETRY_BACKOFF_MS << self.reject_streak.min(6))
                    .min(MAX_RETRY_BACKOFF_MS);
                self.retry_at =
                    Some(Instant::now() + std::time::Duration::from_millis(backoff_ms));
                self.runtime.retry_at =
                    Some(chrono::Utc::now().timestamp_millis() + backoff_ms as i64);
                warn!(
                    chase = %self.id,
                    error = %e,
                    backoff_ms,
                    "order placement rejected; backing off"
                );
                false
            }
        }
    }

    async fn on_filled(&mut self, qty: f64, price: f64) {
        self.working_order_id = None;
        self.runtime.current_order_price = None;

        let fill = ChaseFill {
            chase_id: self.id.clone(),
            layer_idx: self.runtime.layer_idx,
            side: self.params.side,
            qty: if qty > 0.0 { qty } else { self.runtime.qty },
            price,
            reduce_only: self.params.reduce_only,
        };

        self.shared.set_status(StrategyStatus::Completed);
        self.publish_snapshot();
        self.ctx.emit_lifecycle(
            KIND,
            "completed",
            &self.params.sub_account,
            &self.id,
            json!({
                "qty": fill.qty,
                "price": fill.price,
                "reduceOnly": fill.reduce_only,
                "parentScalperId": self.runtime.parent_scalper_id,
                "layerIdx": self.runtime.layer_idx,
            }),
        );
        if let Some(tx) = &self.parent_tx {
            let _ = tx.send(ChaseReport::Filled(fill));
        }
    }

    async fn shutdown(&mut self, reason: &str) {
        if let Some(order_id) = self.working_order_id.take() {
            match self.ctx.engine.cancel_order(&order_id).await {
                Ok(ack) if ack.status == OrderStatus::Filled => {
                    // Last-moment fill during shutdown still counts.
                    self.on_filled(ack.filled_qty, ack.avg_price).await;
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(chase = %self.id, error = %e, "shutdown cancel failed"),
            }
        }

        if self.shared.set_status(StrategyStatus::Stopped) {
            self.ctx.emit_lifecycle(
                KIND,
                "cancelled",
                &self.params.sub_account,
                &self.id,
                json!({ "reason": reason }),
            );
        }
        self.publish_snapshot();
        if let Some(tx) = &self.parent_tx {
            let _ = tx.send(ChaseReport::Stopped {
                chase_id: self.id.clone(),
                layer_idx: self.runtime.layer_idx,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_tracks_touch_with_offset() {
        // Offset 0: sit at best quote.
        assert_eq!(target_price(Side::Long, 99.0, 101.0, 0.0), 99.0);
        assert_eq!(target_price(Side::Short, 99.0, 101.0, 0.0), 101.0);
        // 1% away from the touch.
        assert!((target_price(Side::Long, 100.0, 101.0, 1.0) - 99.0).abs() < 1e-12);
        assert!((target_price(Side::Short, 99.0, 100.0, 1.0) - 101.0).abs() < 1e-12);
    }

    #[test]
    fn dead_band_scales_with_price() {
        assert_eq!(reprice_dead_band(50_000.0), 0.01);
        assert_eq!(reprice_dead_band(12.0), 0.0001);
        assert_eq!(reprice_dead_band(0.5), 0.000001);
    }

    #[test]
    fn band_guard() {
        assert!(!out_of_band(100.4, 100.0, Some(0.5)));
        assert!(out_of_band(100.6, 100.0, Some(0.5)));
        assert!(out_of_band(99.4, 100.0, Some(0.5)));
        assert!(!out_of_band(150.0, 100.0, None));
    }

    #[test]
    fn validation_rejects_bad_params() {
        let base = ChaseParams {
            sub_account: "acct".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty: Some(1.0),
            notional_usd: None,
            leverage: 5.0,
            stalk_offset_pct: 0.1,
            stalk_mode: StalkMode::Conservative,
            max_distance_pct: Some(1.0),
            reduce_only: false,
            parent_scalper_id: None,
            layer_idx: None,
        };
        assert!(validate(&base).is_ok());

        let mut bad = base.clone();
        bad.side = Side::Neutral;
        assert!(validate(&bad).is_err());

        let mut bad = base.clone();
        bad.qty = None;
        assert!(validate(&bad).is_err());

        let mut bad = base.clone();
        bad.leverage = 126.0;
        assert!(validate(&bad).is_err());

        let mut bad = base;
        bad.max_distance_pct = Some(0.0);
        assert!(validate(&bad).is_err());
    }
}
