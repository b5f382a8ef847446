//! TWAP scheduler: slices a parent notional into lots, each executed as a
//! bounded limit-then-market attempt on a timer.
//!
//! Lot failures advance the lot counter and land in `errors[]`; a price-limit
//! breach skips the tick without advancing. State is persisted on every lot so
//! a restart resumes mid-schedule.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{SharedState, StopSignal, StrategyCtx};
use crate::{
    engine::{OrderStatus, PlaceOrder},
    error::{EngineError, EngineResult},
    models::{Side, StrategyId, StrategyStatus},
    store::snapshots::twap_key,
};

pub const KIND: &str = "twap";

/// Venue minimum per-lot notional.
pub const MIN_LOT_NOTIONAL_USD: f64 = 6.0;

/// Favourable limit offset applied to the touch, in fraction (2 bps).
const LIMIT_OFFSET: f64 = 2e-4;

/// Fill fraction at which a limit attempt counts as done.
const FILL_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwapParams {
    pub sub_account: String,
    pub symbol: String,
    pub side: Side,
    /// Total USD notional to execute.
    pub total_size: f64,
    pub lots: u32,
    pub duration_minutes: u32,
    pub leverage: f64,
    #[serde(default)]
    pub jitter: bool,
    #[serde(default)]
    pub irregular: bool,
    #[serde(default)]
    pub price_limit: Option<f64>,
}

pub fn validate(params: &TwapParams) -> EngineResult<()> {
    if params.sub_account.is_empty() || params.symbol.is_empty() {
        return Err(EngineError::validation("subAccountId and symbol are required"));
    }
    if params.side == Side::Neutral {
        return Err(EngineError::validation("twap side must be long or short"));
    }
    if !(params.total_size.is_finite() && params.total_size > 0.0) {
        return Err(EngineError::validation("totalSize must be positive"));
    }
    if !(2..=100).contains(&params.lots) {
        return Err(EngineError::validation("lots must be in [2, 100]"));
    }
    if !(1..=720).contains(&params.duration_minutes) {
        return Err(EngineError::validation("durationMinutes must be in [1, 720]"));
    }
    if !(params.leverage > 0.0 && params.leverage <= 125.0) {
        return Err(EngineError::validation("leverage must be in (0, 125]"));
    }
    let per_lot = params.total_size / params.lots as f64;
    if per_lot < MIN_LOT_NOTIONAL_USD {
        let max_lots = (params.total_size / MIN_LOT_NOTIONAL_USD).floor() as u32;
        return Err(EngineError::validation(format!(
            "per-lot notional {per_lot:.2} USD is below the {MIN_LOT_NOTIONAL_USD} USD minimum; \
             use at most {max_lots} lots"
        )));
    }
    Ok(())
}

/// Lot sizes summing to `total_size`. `irregular` draws i.i.d. weights at
/// +/-30% around uniform and renormalises.
pub fn build_lot_sizes(
    total_size: f64,
    lots: u32,
    irregular: bool,
    rng: &mut impl Rng,
) -> Vec<f64> {
    let n = lots as usize;
    if !irregular {
        return vec![total_size / n as f64; n];
    }
    let draws: Vec<f64> = (0..n)
        .map(|_| 1.0 + (rng.gen::<f64>() - 0.5) * 0.6)
        .collect();
    let sum: f64 = draws.iter().sum();
    draws.into_iter().map(|w| w * total_size / sum).collect()
}

pub fn base_interval_ms(duration_minutes: u32, lots: u32) -> u64 {
    (duration_minutes as u64 * 60_000) / lots.max(1) as u64
}

/// Realised interval with +/-20% jitter when enabled.
pub fn next_interval_ms(base_ms: u64, jitter: bool, rng: &mut impl Rng) -> u64 {
    if !jitter {
        return base_ms;
    }
    let factor = 1.0 + (rng.gen::<f64>() - 0.5) * 0.4;
    (base_ms as f64 * factor).round() as u64
}

/// Price-limit gate: a Short stops selling below the limit, a Long stops
/// buying above it.
pub fn should_skip(side: Side, mark: f64, price_limit: Option<f64>) -> bool {
    match (side, price_limit) {
        (Side::Short, Some(limit)) => mark < limit,
        (Side::Long, Some(limit)) => mark > limit,
        _ => false,
    }
}

/// Limit price with a 2 bps favourable offset off the touch.
pub fn lot_limit_price(side: Side, bid: f64, ask: f64) -> f64 {
    match side {
        Side::Long => ask * (1.0 - LIMIT_OFFSET),
        _ => bid * (1.0 + LIMIT_OFFSET),
    }
}

pub fn poll_timeout_ms(base_interval_ms: u64) -> u64 {
    ((base_interval_ms as f64 * 0.6) as u64).max(3_000)
}

pub fn poll_interval_ms(timeout_ms: u64) -> u64 {
    (timeout_ms / 3).min(3_000)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotResult {
    pub success: bool,
    /// "limit" or "market".
    pub order_type: String,
    pub price: f64,
    pub qty: f64,
    pub notional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwapRuntime {
    pub total_size: f64,
    pub total_lots: u32,
    pub filled_lots: u32,
    pub filled_size: f64,
    pub lot_sizes: Vec<f64>,
    pub interval_ms: u64,
    pub jitter: bool,
    pub irregular: bool,
    pub price_limit: Option<f64>,
    pub skipped_ticks: u32,
    pub results: Vec<LotResult>,
    pub errors: Vec<String>,
    pub next_order_at: i64,
    pub started_at: i64,
}

impl TwapRuntime {
    pub fn fresh(params: &TwapParams, rng: &mut impl Rng) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let interval_ms = base_interval_ms(params.duration_minutes, params.lots);
        Self {
            total_size: params.total_size,
            total_lots: params.lots,
            filled_lots: 0,
            filled_size: 0.0,
            lot_sizes: build_lot_sizes(params.total_size, params.lots, params.irregular, rng),
            interval_ms,
            jitter: params.jitter,
            irregular: params.irregular,
            price_limit: params.price_limit,
            skipped_ticks: 0,
            results: Vec::new(),
            errors: Vec::new(),
            // Lot k fires at k * interval from the start.
            next_order_at: now + interval_ms as i64,
            started_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.filled_lots >= self.total_lots
    }
}

/// Durable snapshot: params + runtime + status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwapSnapshot {
    pub id: StrategyId,
    pub params: TwapParams,
    pub runtime: TwapRuntime,
    pub status: StrategyStatus,
}

/// Outcome of one lot attempt.
pub(crate) enum LotOutcome {
    Done(LotResult),
    /// Stop requested mid-poll: no side effects on the lot counter.
    Aborted,
}

/// Execute one lot: resolve the book, place a favourably-offset limit, poll,
/// cancel-tolerating-a-fill, fall back to market. Shared with the basket.
pub(crate) async fn execute_lot(
    ctx: &StrategyCtx,
    sub_account: &str,
    symbol: &str,
    side: Side,
    leverage: f64,
    lot_size_usd: f64,
    interval_ms: u64,
    stop: &StopSignal,
) -> EngineResult<LotOutcome> {
    let tick = ctx
        .feed
        .resolve(symbol)
        .await
        .map_err(EngineError::Other)?;
    let qty = lot_size_usd / tick.mark;
    let limit_price = lot_limit_price(side, tick.bid, tick.ask);

    let ack = ctx
        .engine
        .place_order(&PlaceOrder {
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            side,
            qty,
            price: Some(limit_price),
            leverage,
            reduce_only: false,
            client_order_id: None,
        })
        .await?;

    let timeout_ms = poll_timeout_ms(interval_ms);
    let poll_ms = poll_interval_ms(timeout_ms);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

    let mut last = ack.clone();
    while !last.status.is_terminal() && last.filled_qty < FILL_THRESHOLD * qty {
        if stop.is_stopped() {
            return Ok(LotOutcome::Aborted);
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(poll_ms)).await;
        match ctx.engine.order_status(&ack.order_id).await {
            Ok(state) => last = state,
            Err(e) => {
                // Transient poll failure: one warning, next cycle retries.
                warn!(order = %ack.order_id, error = %e, "order poll failed");
            }
        }
    }

    let limit_filled = last.status == OrderStatus::Filled
        || last.filled_qty >= FILL_THRESHOLD * qty;

    if limit_filled {
        // Book the fill through the risk channel so the virtual position
        // lands at the exact average.
        let price = if last.avg_price > 0.0 {
            last.avg_price
        } else {
            limit_price
        };
        ctx.engine
            .book_fill(sub_account, symbol, side, last.filled_qty.max(qty), price, 0.0)
            .await?;
        return Ok(LotOutcome::Done(LotResult {
            success: true,
            order_type: "limit".to_string(),
            price,
            qty,
            notional: lot_size_usd,
        }));
    }

    // Not filled in time: cancel, tolerating a last-moment fill.
    if !last.status.is_terminal() {
        match ctx.engine.cancel_order(&ack.order_id).await {
            Ok(cancel_ack) => last = cancel_ack,
            Err(e) => warn!(order = %ack.order_id, error = %e, "lot cancel failed"),
        }
        if last.status == OrderStatus::Filled || last.filled_qty >= FILL_THRESHOLD * qty {
            let price = if last.avg_price > 0.0 { last.avg_price } else { limit_price };
            ctx.engine
                .book_fill(sub_account, symbol, side, last.filled_qty, price, 0.0)
                .await?;
            return Ok(LotOutcome::Done(LotResult {
                success: true,
                order_type: "limit".to_string(),
                price,
                qty,
                notional: lot_size_usd,
            }));
        }
    }

    // Market fallback for the remainder; this order settles on-exchange.
    let remaining = (qty - last.filled_qty).max(0.0);
    if remaining * tick.mark < 1e-9 {
        return Ok(LotOutcome::Done(LotResult {
            success: true,
            order_type: "limit".to_string(),
            price: last.avg_price,
            qty,
            notional: lot_size_usd,
        }));
    }

    let market_ack = ctx
        .engine
        .place_order(&PlaceOrder {
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            side,
            qty: remaining,
            price: None,
            leverage,
            reduce_only: false,
            client_order_id: None,
        })
        .await?;

    Ok(LotOutcome::Done(LotResult {
        success: true,
        order_type: "market".to_string(),
        price: market_ack.avg_price,
        qty,
        notional: lot_size_usd,
    }))
}

pub struct TwapActor {
    pub(crate) ctx: StrategyCtx,
    pub(crate) id: StrategyId,
    pub(crate) params: TwapParams,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) runtime: TwapRuntime,
}

#[derive(Debug)]
pub(crate) enum TickOutcome {
    Skipped,
    LotDone,
    Aborted,
    Complete,
}

impl TwapActor {
    pub fn new(
        ctx: StrategyCtx,
        id: StrategyId,
        params: TwapParams,
        shared: Arc<SharedState>,
        resume: Option<TwapRuntime>,
    ) -> Self {
        let runtime = resume
            .unwrap_or_else(|| TwapRuntime::fresh(&params, &mut rand::thread_rng()));
        Self {
            ctx,
            id,
            params,
            shared,
            runtime,
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = TwapSnapshot {
            id: self.id.clone(),
            params: self.params.clone(),
            runtime: self.runtime.clone(),
            status: self.shared.status(),
        };
        if let Ok(value) = serde_json::to_value(&snapshot) {
            self.shared.update_snapshot(value);
        }
    }

    async fn persist(&self) {
        let snapshot = TwapSnapshot {
            id: self.id.clone(),
            params: self.params.clone(),
            runtime: self.runtime.clone(),
            status: self.shared.status(),
        };
        if let Ok(value) = serde_json::to_value(&snapshot) {
            if let Err(e) = self
                .ctx
                .store
                .put(
                    &twap_key(&self.id),
                    KIND,
                    &self.params.sub_account,
                    &value,
                    self.ctx.config.twap_snapshot_ttl_hours,
                )
                .await
            {
                warn!(twap = %self.id, error = %e, "twap persist failed");
            }
        }
    }

    fn emit_progress(&self) {
        self.ctx.emit_lifecycle(
            KIND,
            "progress",
            &self.params.sub_account,
            &self.id,
            json!({
                "filledLots": self.runtime.filled_lots,
                "totalLots": self.runtime.total_lots,
                "skippedTicks": self.runtime.skipped_ticks,
                "filledSize": self.runtime.filled_size,
            }),
        );
    }

    /// One schedule tick: price-limit gate, then a lot attempt. Persists and
    /// broadcasts after every action.
    pub(crate) async fn tick(&mut self, stop: &StopSignal) -> TickOutcome {
        if stop.is_stopped() {
            return TickOutcome::Aborted;
        }
        let mark = match self.ctx.feed.resolve(&self.params.symbol).await {
            Ok(tick) => tick.mark,
            Err(e) => {
                // Treated like any other lot failure: advance and record.
                self.runtime.filled_lots += 1;
                self.runtime.errors.push(format!("price resolve: {e}"));
                self.persist().await;
                self.emit_progress();
                return self.after_lot();
            }
        };

        if should_skip(self.params.side, mark, self.runtime.price_limit) {
            self.runtime.skipped_ticks += 1;
            debug!(
                twap = %self.id,
                mark,
                limit = ?self.runtime.price_limit,
                "price limit breached; skipping tick"
            );
            self.persist().await;
            self.emit_progress();
            return TickOutcome::Skipped;
        }

        let lot_idx = self.runtime.filled_lots.min(self.runtime.total_lots - 1) as usize;
        let lot_size = self.runtime.lot_sizes[lot_idx];
        let outcome = execute_lot(
            &self.ctx,
            &self.params.sub_account,
            &self.params.symbol,
            self.params.side,
            self.params.leverage,
            lot_size,
            self.runtime.interval_ms,
            stop,
        )
        .await;

        match outcome {
            Ok(LotOutcome::Aborted) => return TickOutcome::Aborted,
            Ok(LotOutcome::Done(result)) => {
                self.runtime.filled_lots += 1;
                self.runtime.filled_size += result.notional;
                self.runtime.results.push(result);
            }
            Err(e) => {
                // Failures still advance the lot counter.
                self.runtime.filled_lots += 1;
                self.runtime.errors.push(e.to_string());
                warn!(twap = %self.id, error = %e, "lot execution failed");
            }
        }

        self.persist().await;
        self.emit_progress();
        self.after_lot()
    }

    fn after_lot(&self) -> TickOutcome {
        if self.runtime.is_complete() {
            TickOutcome::Complete
        } else {
            TickOutcome::LotDone
        }
    }

    async fn finish(&mut self, status: StrategyStatus, suffix: &str, reason: Option<&str>) {
        if !self.shared.set_status(status) {
            return;
        }
        self.publish_snapshot();
        // Terminal: the durable record is removed rather than kept.
        if let Err(e) = self.ctx.store.delete(&twap_key(&self.id)).await {
            warn!(twap = %self.id, error = %e, "terminal snapshot delete failed");
        }
        self.ctx.emit_lifecycle(
            KIND,
            suffix,
            &self.params.sub_account,
            &self.id,
            json!({
                "filledLots": self.runtime.filled_lots,
                "totalLots": self.runtime.total_lots,
                "skippedTicks": self.runtime.skipped_ticks,
                "reason": reason,
            }),
        );
    }

    pub async fn run(mut self, mut stop: StopSignal) {
        self.shared.set_status(StrategyStatus::Active);
        self.publish_snapshot();
        self.persist().await;
        self.ctx.feed.retain(&self.params.symbol);
        self.ctx.emit_lifecycle(
            KIND,
            "started",
            &self.params.sub_account,
            &self.id,
            json!({
                "symbol": self.params.symbol,
                "side": self.params.side,
                "totalSize": self.runtime.total_size,
                "totalLots": self.runtime.total_lots,
            }),
        );

        loop {
            if let Some(req) = stop.requested() {
                self.finish(StrategyStatus::Cancelled, "cancelled", Some(&req.reason)).await;
                break;
            }
            let now = chrono::Utc::now().timestamp_millis();
            let delay = Duration::from_millis((self.runtime.next_order_at - now).max(0) as u64);

            tokio::select! {
                req = stop.wait() => {
                    self.finish(StrategyStatus::Cancelled, "cancelled", Some(&req.reason)).await;
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.tick(&stop).await {
                TickOutcome::Complete => {
                    self.finish(StrategyStatus::Completed, "completed", None).await;
                    break;
                }
                TickOutcome::Aborted => {
                    // Stop arrived mid-poll; the next loop turn resolves it.
                    continue;
                }
                TickOutcome::Skipped | TickOutcome::LotDone => {
                    let interval = next_interval_ms(
                        self.runtime.interval_ms,
                        self.runtime.jitter,
                        &mut rand::thread_rng(),
                    );
                    self.runtime.next_order_at =
                        chrono::Utc::now().timestamp_millis() + interval as i64;
                    self.publish_snapshot();
                }
            }
        }

        self.ctx.feed.release(&self.params.symbol);
    }
}
