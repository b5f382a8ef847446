//! Multi-leg TWAP basket.
//!
//! One schedule tick fans out to every leg concurrently with all-settled
//! semantics: a failing leg is recorded and never blocks its siblings, and the
//! shared lot index advances once all legs have settled.

use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::twap::{
    base_interval_ms, build_lot_sizes, execute_lot, next_interval_ms, LotOutcome, LotResult,
    MIN_LOT_NOTIONAL_USD,
};
use super::{SharedState, StopSignal, StrategyCtx};
use crate::{
    error::{EngineError, EngineResult},
    models::{Side, StrategyId, StrategyStatus},
    store::snapshots::twap_basket_key,
};

pub const KIND: &str = "twap_basket";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasketLegParams {
    pub symbol: String,
    pub side: Side,
    pub size_usdt: f64,
    pub leverage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwapBasketParams {
    pub sub_account: String,
    pub basket_name: String,
    pub legs: Vec<BasketLegParams>,
    pub lots: u32,
    pub duration_minutes: u32,
    #[serde(default)]
    pub jitter: bool,
    #[serde(default)]
    pub irregular: bool,
}

pub fn validate(params: &TwapBasketParams) -> EngineResult<()> {
    if params.sub_account.is_empty() || params.basket_name.is_empty() {
        return Err(EngineError::validation(
            "subAccountId and basketName are required",
        ));
    }
    if params.legs.is_empty() {
        return Err(EngineError::validation("basket needs at least one leg"));
    }
    if !(2..=100).contains(&params.lots) {
        return Err(EngineError::validation("lots must be in [2, 100]"));
    }
    if !(1..=720).contains(&params.duration_minutes) {
        return Err(EngineError::validation("durationMinutes must be in [1, 720]"));
    }
    for leg in &params.legs {
        if leg.side == Side::Neutral {
            return Err(EngineError::validation(format!(
                "leg {}: side must be long or short",
                leg.symbol
            )));
        }
        if !(leg.leverage > 0.0 && leg.leverage <= 125.0) {
            return Err(EngineError::validation(format!(
                "leg {}: leverage must be in (0, 125]",
                leg.symbol
            )));
        }
        let per_lot = leg.size_usdt / params.lots as f64;
        if per_lot < MIN_LOT_NOTIONAL_USD {
            let max_lots = (leg.size_usdt / MIN_LOT_NOTIONAL_USD).floor() as u32;
            return Err(EngineError::validation(format!(
                "leg {}: per-lot notional {per_lot:.2} USD is below the \
                 {MIN_LOT_NOTIONAL_USD} USD minimum; use at most {max_lots} lots",
                leg.symbol
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasketLegRuntime {
    pub symbol: String,
    pub side: Side,
    pub leverage: f64,
    pub total_size: f64,
    pub filled_size: f64,
    pub lot_sizes: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwapBasketRuntime {
    pub total_lots: u32,
    /// Shared lot index; advances across all legs atomically per tick.
    pub filled_lots: u32,
    pub interval_ms: u64,
    pub jitter: bool,
    pub irregular: bool,
    pub legs: Vec<BasketLegRuntime>,
    pub results: Vec<LotResult>,
    pub errors: Vec<String>,
    pub next_order_at: i64,
    pub started_at: i64,
}

impl TwapBasketRuntime {
    pub fn fresh(params: &TwapBasketParams, rng: &mut impl Rng) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let interval_ms = base_interval_ms(params.duration_minutes, params.lots);
        Self {
            total_lots: params.lots,
            filled_lots: 0,
            interval_ms,
            jitter: params.jitter,
            irregular: params.irregular,
            legs: params
                .legs
                .iter()
                .map(|leg| BasketLegRuntime {
                    symbol: leg.symbol.clone(),
                    side: leg.side,
                    leverage: leg.leverage,
                    total_size: leg.size_usdt,
                    filled_size: 0.0,
                    lot_sizes: build_lot_sizes(leg.size_usdt, params.lots, params.irregular, rng),
                })
                .collect(),
            results: Vec::new(),
            errors: Vec::new(),
            next_order_at: now + interval_ms as i64,
            started_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.filled_lots >= self.total_lots
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwapBasketSnapshot {
    pub id: StrategyId,
    pub params: TwapBasketParams,
    pub runtime: TwapBasketRuntime,
    pub status: StrategyStatus,
}

pub struct TwapBasketActor {
    pub(crate) ctx: StrategyCtx,
    pub(crate) id: StrategyId,
    pub(crate) params: TwapBasketParams,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) runtime: TwapBasketRuntime,
}

pub(crate) enum BasketTickOutcome {
    Advanced,
    Aborted,
    Complete,
}

impl TwapBasketActor {
    pub fn new(
        ctx: StrategyCtx,
        id: StrategyId,
        params: TwapBasketParams,
        shared: Arc<SharedState>,
        resume: Option<TwapBasketRuntime>,
    ) -> Self {
        let runtime = resume
            .unwrap_or_else(|| TwapBasketRuntime::fresh(&params, &mut rand::thread_rng()));
        Self {
            ctx,
            id,
            params,
            shared,
            runtime,
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = TwapBasketSnapshot {
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
        let snapshot = TwapBasketSnapshot {
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
                    &twap_basket_key(&self.id),
                    KIND,
                    &self.params.sub_account,
                    &value,
                    self.ctx.config.twap_snapshot_ttl_hours,
                )
                .await
            {
                warn!(basket = %self.id, error = %e, "basket persist failed");
            }
        }
    }

    /// One tick: the current lot index on every leg, concurrently.
    pub(crate) async fn tick(&mut self, stop: &StopSignal) -> BasketTickOutcome {
        if stop.is_stopped() {
            return BasketTickOutcome::Aborted;
        }
        let lot_idx = self.runtime.filled_lots.min(self.runtime.total_lots - 1) as usize;

        let attempts = self.runtime.legs.iter().map(|leg| {
            let ctx = self.ctx.clone();
            let sub_account = self.params.sub_account.clone();
            let symbol = leg.symbol.clone();
            let side = leg.side;
            let leverage = leg.leverage;
            let lot_size = leg.lot_sizes[lot_idx];
            let interval_ms = self.runtime.interval_ms;
            let stop = stop.clone();
            async move {
                execute_lot(
                    &ctx, &sub_account, &symbol, side, leverage, lot_size, interval_ms, &stop,
                )
                .await
            }
        });

        let settled = join_all(attempts).await;

        let mut aborted = false;
        for (leg_idx, outcome) in settled.into_iter().enumerate() {
            let leg = &mut self.runtime.legs[leg_idx];
            match outcome {
                Ok(LotOutcome::Done(result)) => {
                    leg.filled_size += result.notional;
                    self.runtime.results.push(result);
                }
                Ok(LotOutcome::Aborted) => aborted = true,
                Err(e) => {
                    self.runtime
                        .errors
                        .push(format!("lot {lot_idx} leg {}: {e}", leg.symbol));
                    warn!(
                        basket = %self.id,
                        leg = %leg.symbol,
                        error = %e,
                        "basket leg failed"
                    );
                }
            }
        }

        if aborted {
            // Stop arrived mid-tick; the lot index is left untouched.
            return BasketTickOutcome::Aborted;
        }

        self.runtime.filled_lots += 1;
        self.persist().await;
        self.ctx.emit_lifecycle(
            KIND,
            "progress",
            &self.params.sub_account,
            &self.id,
            json!({
                "basketName": self.params.basket_name,
                "filledLots": self.runtime.filled_lots,
                "totalLots": self.runtime.total_lots,
            }),
        );

        if self.runtime.is_complete() {
            BasketTickOutcome::Complete
        } else {
            BasketTickOutcome::Advanced
        }
    }

    async fn finish(&mut self, status: StrategyStatus, suffix: &str, reason: Option<&str>) {
        if !self.shared.set_status(status) {
            return;
        }
        self.publish_snapshot();
        if let Err(e) = self.ctx.store.delete(&twap_basket_key(&self.id)).await {
            warn!(basket = %self.id, error = %e, "terminal snapshot delete failed");
        }
        self.ctx.emit_lifecycle(
            KIND,
            suffix,
            &self.params.sub_account,
            &self.id,
            json!({
                "basketName": self.params.basket_name,
                "filledLots": self.runtime.filled_lots,
                "totalLots": self.runtime.total_lots,
                "reason": reason,
            }),
        );
    }

    pub async fn run(mut self, mut stop: StopSignal) {
        self.shared.set_status(StrategyStatus::Active);
        self.publish_snapshot();
        self.persist().await;
        for leg in &self.runtime.legs {
            self.ctx.feed.retain(&leg.symbol);
        }
        self.ctx.emit_lifecycle(
            KIND,
            "started",
            &self.params.sub_account,
            &self.id,
            json!({
                "basketName": self.params.basket_name,
                "legs": self.runtime.legs.len(),
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
                BasketTickOutcome::Complete => {
                    self.finish(StrategyStatus::Completed, "completed", None).await;
                    break;
                }
                BasketTickOutcome::Aborted => continue,
                BasketTickOutcome::Advanced => {
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

        for leg in &self.runtime.legs {
            self.ctx.feed.release(&leg.symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn params() -> TwapBasketParams {
        TwapBasketParams {
            sub_account: "acct".into(),
            basket_name: "pair".into(),
            legs: vec![
                BasketLegParams {
                    symbol: "BTCUSDT".into(),
                    side: Side::Long,
                    size_usdt: 120.0,
                    leverage: 5.0,
                },
                BasketLegParams {
                    symbol: "ETHUSDT".into(),
                    side: Side::Short,
                    size_usdt: 120.0,
                    leverage: 5.0,
                },
            ],
            lots: 10,
            duration_minutes: 10,
            jitter: false,
            irregular: false,
        }
    }

    #[test]
    fn validation_checks_each_leg() {
        let p = params();
        assert!(validate(&p).is_ok());

        let mut bad = params();
        bad.legs.clear();
        assert!(validate(&bad).is_err());

        let mut bad = params();
        bad.legs[1].side = Side::Neutral;
        assert!(validate(&bad).is_err());

        let mut bad = params();
        bad.legs[0].size_usdt = 30.0; // 3 USD per lot over 10 lots
        let err = validate(&bad).unwrap_err().to_string();
        assert!(err.contains("BTCUSDT"), "{err}");
        assert!(err.contains("at most 5 lots"), "{err}");
    }

    #[test]
    fn fresh_runtime_builds_per_leg_schedules() {
        let mut p = params();
        p.irregular = true;
        let runtime = TwapBasketRuntime::fresh(&p, &mut ChaCha8Rng::seed_from_u64(9));
        assert_eq!(runtime.legs.len(), 2);
        for leg in &runtime.legs {
            assert_eq!(leg.lot_sizes.len(), 10);
            let sum: f64 = leg.lot_sizes.iter().sum();
            assert!((sum - leg.total_size).abs() <= 1e-9 * leg.total_size);
        }
        // The legs draw independently: schedules differ.
        assert_ne!(runtime.legs[0].lot_sizes, runtime.legs[1].lot_sizes);
    }
}
