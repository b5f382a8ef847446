//! Trailing stop: per-position actor tracking the price extreme and issuing a
//! reduce-only market close when the retrace exceeds the callback.
//!
//! State machine: waiting -> tracking -> triggered | cancelled. Termination is
//! exactly-once. Persistence is throttled to once per second; the terminal
//! write deletes the durable record.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{SharedState, StopSignal, StrategyCtx};
use crate::{
    error::{EngineError, EngineResult},
    models::{PositionId, Side, StrategyId, StrategyStatus},
    store::{snapshots::trail_stop_key, PersistThrottle},
};

pub const KIND: &str = "trail_stop";

/// How often the underlying position is re-verified against the risk book.
const POSITION_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailStopParams {
    pub sub_account: String,
    pub position_id: PositionId,
    pub callback_pct: f64,
    #[serde(default)]
    pub activation_price: Option<f64>,
}

pub fn validate(params: &TrailStopParams) -> EngineResult<()> {
    if params.sub_account.is_empty() || params.position_id.is_empty() {
        return Err(EngineError::validation(
            "subAccountId and positionId are required",
        ));
    }
    if !(params.callback_pct > 0.0 && params.callback_pct <= 50.0) {
        return Err(EngineError::validation("callbackPct must be in (0, 50]"));
    }
    if let Some(activation) = params.activation_price {
        if !(activation.is_finite() && activation > 0.0) {
            return Err(EngineError::validation("activationPrice must be positive"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailTransition {
    None,
    Activated,
    ExtremeAdvanced,
    Triggered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailStopRuntime {
    pub position_id: PositionId,
    pub symbol: String,
    pub side: Side,
    pub callback_pct: f64,
    pub activation_price: Option<f64>,
    pub activated: bool,
    pub extreme_price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub started_at: i64,
    pub triggered_at: Option<i64>,
    pub triggered_price: Option<f64>,
}

impl TrailStopRuntime {
    pub fn new(params: &TrailStopParams, symbol: String, side: Side) -> Self {
        Self {
            position_id: params.position_id.clone(),
            symbol,
            side,
            callback_pct: params.callback_pct,
            activation_price: params.activation_price,
            activated: false,
            extreme_price: None,
            trigger_price: None,
            started_at: chrono::Utc::now().timestamp_millis(),
            triggered_at: None,
            triggered_price: None,
        }
    }

    fn trigger_from(&self, extreme: f64) -> f64 {
        match self.side {
            Side::Long => extreme * (1.0 - self.callback_pct / 100.0),
            _ => extreme * (1.0 + self.callback_pct / 100.0),
        }
    }

    /// Feed one price observation through the state machine.
    pub fn on_price(&mut self, price: f64, now_ms: i64) -> TrailTransition {
        if self.triggered_at.is_some() {
            return TrailTransition::None;
        }

        if !self.activated {
            let reached = match self.activation_price {
                // No activation price: armed immediately.
                None => true,
                Some(activation) => match self.side {
                    Side::Long => price >= activation,
                    _ => price <= activation,
                },
            };
            if !reached {
                return TrailTransition::None;
            }
            self.activated = true;
            self.extreme_price = Some(price);
            self.trigger_price = Some(self.trigger_from(price));
            return TrailTransition::Activated;
        }

        let extreme = self.extreme_price.unwrap_or(price);
        let new_extreme = match self.side {
            Side::Long => extreme.max(price),
            _ => extreme.min(price),
        };
        let advanced = new_extreme != extreme;
        if advanced {
            self.extreme_price = Some(new_extreme);
            self.trigger_price = Some(self.trigger_from(new_extreme));
        }

        let trigger = self.trigger_price.unwrap_or(new_extreme);
        let hit = match self.side {
            Side::Long => price <= trigger,
            _ => price >= trigger,
        };
        if hit {
            self.triggered_at = Some(now_ms);
            self.triggered_price = Some(price);
            return TrailTransition::Triggered;
        }

        if advanced {
            TrailTransition::ExtremeAdvanced
        } else {
            TrailTransition::None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailStopSnapshot {
    pub id: StrategyId,
    pub params: TrailStopParams,
    pub runtime: TrailStopRuntime,
    pub status: StrategyStatus,
}

pub struct TrailStopActor {
    ctx: StrategyCtx,
    id: StrategyId,
    params: TrailStopParams,
    shared: Arc<SharedState>,
    runtime: TrailStopRuntime,
    throttle: PersistThrottle,
}

impl TrailStopActor {
    /// Build from fresh params, resolving the target position. Fails when the
    /// position is not open.
    pub fn create(
        ctx: StrategyCtx,
        id: StrategyId,
        params: TrailStopParams,
        shared: Arc<SharedState>,
    ) -> EngineResult<Self> {
        let position = ctx
            .risk
            .position_by_id(&params.position_id)
            .ok_or_else(|| {
                EngineError::validation(format!("position {} is not open", params.position_id))
            })?;
        let runtime = TrailStopRuntime::new(&params, position.symbol, position.side);
        Ok(Self {
            ctx,
            id,
            params,
            shared,
            runtime,
            throttle: PersistThrottle::new(Duration::from_secs(1)),
        })
    }

    /// Re-hydrate from a durable snapshot (resume path). The caller has
    /// already verified the position is still open.
    pub fn resume(
        ctx: StrategyCtx,
        id: StrategyId,
        params: TrailStopParams,
        runtime: TrailStopRuntime,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            ctx,
            id,
            params,
            shared,
            runtime,
            throttle: PersistThrottle::new(Duration::from_secs(1)),
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = TrailStopSnapshot {
            id: self.id.clone(),
            params: self.params.clone(),
            runtime: self.runtime.clone(),
            status: self.shared.status(),
        };
        if let Ok(value) = serde_json::to_value(&snapshot) {
            self.shared.update_snapshot(value);
        }
    }

    async fn persist(&mut self, force: bool) {
        if force {
            self.throttle.force();
        }
        if !self.throttle.should_persist() {
            return;
        }
        let snapshot = TrailStopSnapshot {
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
                    &trail_stop_key(&self.id),
                    KIND,
                    &self.params.sub_account,
                    &value,
                    self.ctx.config.trail_snapshot_ttl_hours,
                )
                .await
            {
                warn!(trail = %self.id, error = %e, "trail stop persist failed");
            }
        }
    }

    async fn finish(&mut self, status: StrategyStatus, suffix: &str, payload: serde_json::Value) {
        if !self.shared.set_status(status) {
            return;
        }
        self.publish_snapshot();
        if let Err(e) = self.ctx.store.delete(&trail_stop_key(&self.id)).await {
            warn!(trail = %self.id, error = %e, "terminal snapshot delete failed");
        }
        self.ctx
            .emit_lifecycle(KIND, suffix, &self.params.sub_account, &self.id, payload);
    }

    async fn trigger_close(&mut self) {
        let outcome = self
            .ctx
            .engine
            .close_position(&self.runtime.position_id, None, "TRAIL_STOP")
            .await;

        let payload = match outcome {
            Ok(close) if close.virtual_only => json!({
                "positionId": self.runtime.position_id,
                "triggeredPrice": self.runtime.triggered_price,
                "reason": "TRAIL_STOP_VIRTUAL_ONLY",
            }),
            Ok(close) => json!({
                "positionId": self.runtime.position_id,
                "triggeredPrice": self.runtime.triggered_price,
                "closedQty": close.closed_qty,
                "reason": "TRAIL_STOP",
            }),
            Err(e) => {
                warn!(trail = %self.id, error = %e, "trail stop close failed");
                json!({
                    "positionId": self.runtime.position_id,
                    "triggeredPrice": self.runtime.triggered_price,
                    "reason": "TRAIL_STOP",
                    "error": e.to_string(),
                })
            }
        };

        self.finish(StrategyStatus::Triggered, "triggered", payload)
            .await;
    }

    pub async fn run(mut self, mut stop: StopSignal) {
        self.shared.set_status(StrategyStatus::Active);
        self.publish_snapshot();
        self.persist(true).await;
        self.ctx.feed.retain(&self.runtime.symbol);
        self.ctx.emit_lifecycle(
            KIND,
            "started",
            &self.params.sub_account,
            &self.id,
            json!({
                "positionId": self.runtime.position_id,
                "symbol": self.runtime.symbol,
                "side": self.runtime.side,
                "callbackPct": self.runtime.callback_pct,
                "activationPrice": self.runtime.activation_price,
            }),
        );

        let mut book_rx = self.ctx.feed.subscribe();
        let mut position_check = tokio::time::interval(POSITION_CHECK_INTERVAL);
        position_check.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                req = stop.wait() => {
                    self.finish(
                        StrategyStatus::Cancelled,
                        "cancelled",
                        json!({ "positionId": self.runtime.position_id, "reason": req.reason }),
                    )
                    .await;
                    break;
                }
                update = book_rx.recv() => {
                    match update {
                        Ok(update) if update.symbol == self.runtime.symbol => {
                            let now_ms = update.tick.ts_ms;
                            match self.runtime.on_price(update.tick.mark, now_ms) {
                                TrailTransition::Triggered => {
                                    self.trigger_close().await;
                                    break;
                                }
                                TrailTransition::Activated | TrailTransition::ExtremeAdvanced => {
                                    self.publish_snapshot();
                                    self.persist(false).await;
                                    self.ctx.emit_lifecycle(
                                        KIND,
                                        "progress",
                                        &self.params.sub_account,
                                        &self.id,
                                        json!({
                                            "activated": self.runtime.activated,
                                            "extremePrice": self.runtime.extreme_price,
                                            "triggerPrice": self.runtime.trigger_price,
                                        }),
                                    );
                                }
                                TrailTransition::None => {}
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(trail = %self.id, missed = n, "trail stop lagged book updates");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.finish(
                                StrategyStatus::Stopped,
                                "cancelled",
                                json!({ "positionId": self.runtime.position_id, "reason": "feed_closed" }),
                            )
                            .await;
                            break;
                        }
                    }
                }
                _ = position_check.tick() => {
                    // The position can vanish elsewhere (manual close,
                    // liquidation). Discard the trail stop in that case.
                    if self.ctx.risk.position_by_id(&self.runtime.position_id).is_none() {
                        self.finish(
                            StrategyStatus::Stopped,
                            "cancelled",
                            json!({
                                "positionId": self.runtime.position_id,
                                "reason": "position_closed",
                            }),
                        )
                        .await;
                        break;
                    }
                }
            }
        }

        self.ctx.feed.release(&self.runtime.symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(side: Side, callback_pct: f64, activation: Option<f64>) -> TrailStopRuntime {
        TrailStopRuntime::new(
            &TrailStopParams {
                sub_account: "acct".into(),
                position_id: "vp-1".into(),
                callback_pct,
                activation_price: activation,
            },
            "BTCUSDT".into(),
            side,
        )
    }

    #[test]
    fn callback_bounds() {
        let mut p = TrailStopParams {
            sub_account: "acct".into(),
            position_id: "vp-1".into(),
            callback_pct: 2.0,
            activation_price: None,
        };
        assert!(validate(&p).is_ok());
        p.callback_pct = 50.0;
        assert!(validate(&p).is_ok());
        p.callback_pct = 50.1;
        assert!(validate(&p).is_err());
        p.callback_pct = 0.0;
        assert!(validate(&p).is_err());
    }

    #[test]
    fn long_trigger_scenario() {
        // entry 100, cb 2%, activation 105; tape [102, 106, 110, 108, 107.9]
        let mut rt = runtime(Side::Long, 2.0, Some(105.0));

        assert_eq!(rt.on_price(102.0, 1), TrailTransition::None);
        assert!(!rt.activated);

        assert_eq!(rt.on_price(106.0, 2), TrailTransition::Activated);
        assert_eq!(rt.extreme_price, Some(106.0));

        assert_eq!(rt.on_price(110.0, 3), TrailTransition::ExtremeAdvanced);
        assert_eq!(rt.extreme_price, Some(110.0));
        assert!((rt.trigger_price.unwrap() - 107.8).abs() < 1e-9);

        assert_eq!(rt.on_price(108.0, 4), TrailTransition::None);
        assert_eq!(rt.on_price(107.9, 5), TrailTransition::None);

        // 107.8 or lower fires.
        assert_eq!(rt.on_price(107.5, 6), TrailTransition::Triggered);
        assert_eq!(rt.triggered_price, Some(107.5));

        // Exactly-once: further prices are ignored.
        assert_eq!(rt.on_price(50.0, 7), TrailTransition::None);
    }

    #[test]
    fn trigger_boundary_is_inclusive() {
        let mut rt = runtime(Side::Long, 2.0, Some(105.0));
        rt.on_price(106.0, 1);
        rt.on_price(110.0, 2);
        assert_eq!(rt.on_price(107.8, 3), TrailTransition::Triggered);
    }

    #[test]
    fn short_side_tracks_low_water_mark() {
        let mut rt = runtime(Side::Short, 5.0, None);
        // No activation price: armed on the first tick.
        assert_eq!(rt.on_price(100.0, 1), TrailTransition::Activated);
        assert_eq!(rt.on_price(90.0, 2), TrailTransition::ExtremeAdvanced);
        assert!((rt.trigger_price.unwrap() - 94.5).abs() < 1e-9);
        // Retrace above trigger fires.
        assert_eq!(rt.on_price(95.0, 3), TrailTransition::Triggered);
    }

    #[test]
    fn activation_at_current_price_is_immediate() {
        let mut rt = runtime(Side::Long, 2.0, Some(100.0));
        assert_eq!(rt.on_price(100.0, 1), TrailTransition::Activated);
        assert_eq!(rt.extreme_price, Some(100.0));
    }

    #[test]
    fn extreme_is_monotone_for_long() {
        let mut rt = runtime(Side::Long, 10.0, None);
        rt.on_price(100.0, 1);
        let tape = [105.0, 103.0, 108.0, 102.0, 109.0];
        let mut last_extreme = rt.extreme_price.unwrap();
        for (i, price) in tape.iter().enumerate() {
            rt.on_price(*price, i as i64 + 2);
            let extreme = rt.extreme_price.unwrap();
            assert!(extreme >= last_extreme);
            last_extreme = extreme;
        }
        assert_eq!(last_extreme, 109.0);
    }
}
