//! Trend agent: EMA cross direction, gated by the regime classifier and the
//! composite signal, executing through directional scalpers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{AgentAction, AgentCx};
use crate::{
    error::{EngineError, EngineResult},
    feeds::{BookTick, TradeUpdate},
    models::{Position, Side},
    signals::{
        CompositeConfig, CompositeInputs, CompositeResult, CompositeSignal, Ema, EmaZScore,
        Regime, RegimeClassifier, RegimeConfig, RegimeResult, RollingQty,
    },
    strategies::scalper::{PnlFeedbackMode, ScalperParams},
};

fn default_leverage() -> f64 {
    5.0
}
fn default_child_count() -> usize {
    3
}
fn default_offset() -> f64 {
    0.25
}
fn default_half_life() -> u64 {
    30_000
}
fn default_refill_delay() -> u64 {
    2_000
}
fn default_max_fills() -> u32 {
    12
}
fn default_cooldown_ms() -> i64 {
    30_000
}
fn default_max_rv_ratio() -> f64 {
    2.5
}
fn default_toxic_threshold() -> f64 {
    0.4
}
fn default_liq_threshold() -> f64 {
    0.5
}
fn default_min_confidence() -> f64 {
    0.3
}
fn default_use_composite() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendParams {
    pub fast_period: u32,
    pub slow_period: u32,
    pub size_usd: f64,
    pub hard_stop_bps: f64,
    pub trailing_activate_bps: f64,
    pub trailing_offset_bps: f64,
    #[serde(default = "default_cooldown_ms")]
    pub min_flip_cooldown_ms: i64,
    #[serde(default = "default_max_rv_ratio")]
    pub max_rv_ratio: f64,
    #[serde(default = "default_toxic_threshold")]
    pub toxic_threshold: f64,
    #[serde(default = "default_liq_threshold")]
    pub liq_threshold: f64,
    #[serde(default = "default_use_composite")]
    pub use_composite: bool,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default = "default_offset")]
    pub long_offset_pct: f64,
    #[serde(default = "default_offset")]
    pub short_offset_pct: f64,
    #[serde(default = "default_child_count")]
    pub child_count: usize,
    #[serde(default)]
    pub skew: f64,
    #[serde(default = "default_half_life")]
    pub fill_decay_half_life_ms: u64,
    #[serde(default = "default_refill_delay")]
    pub min_refill_delay_ms: u64,
    #[serde(default = "default_max_fills")]
    pub max_fills_per_minute: u32,
}

pub fn validate(params: &TrendParams) -> EngineResult<()> {
    if params.fast_period == 0 || params.slow_period <= params.fast_period {
        return Err(EngineError::validation(
            "need 0 < fastPeriod < slowPeriod",
        ));
    }
    if !(params.size_usd > 0.0) {
        return Err(EngineError::validation("sizeUsd must be positive"));
    }
    if !(params.hard_stop_bps > 0.0) {
        return Err(EngineError::validation("hardStopBps must be positive"));
    }
    if !(params.trailing_offset_bps > 0.0) {
        return Err(EngineError::validation("trailingOffsetBps must be positive"));
    }
    Ok(())
}

pub struct TrendAgent {
    params: TrendParams,
    fast: Ema,
    slow: Ema,
    previous_signal: Option<Side>,
    last_flip_at_ms: i64,
    trailing_hwm_bps: f64,
    trailing_active: bool,
    regime: RegimeClassifier,
    composite: CompositeSignal,
    flow: RollingQty,
    /// z-scored tick velocity; extreme readings back the rv-ratio gate.
    velocity_z: EmaZScore,
    last_velocity_z: f64,
    last_regime: RegimeResult,
    last_composite: Option<CompositeResult>,
    last_position: Option<Position>,
}

impl TrendAgent {
    pub fn new(params: TrendParams) -> Self {
        let composite = CompositeSignal::new(CompositeConfig {
            min_confidence: params.min_confidence,
            ..CompositeConfig::default()
        });
        Self {
            fast: Ema::with_period(params.fast_period),
            slow: Ema::with_period(params.slow_period),
            previous_signal: None,
            last_flip_at_ms: 0,
            trailing_hwm_bps: 0.0,
            trailing_active: false,
            regime: RegimeClassifier::new(RegimeConfig::default()),
            composite,
            flow: RollingQty::new(60),
            velocity_z: EmaZScore::new(120.0, 1.0, 4.0),
            last_velocity_z: 0.0,
            last_regime: RegimeResult::warmup(),
            last_composite: None,
            last_position: None,
            params,
        }
    }

    pub fn on_trade(&mut self, trade: &TradeUpdate) {
        self.flow.push(trade.ts_ms, trade.qty, trade.is_buy);
    }

    pub fn on_position_update(&mut self, position: &Position) {
        self.last_position = Some(position.clone());
    }

    /// Regime-adaptive flip cooldown: quick in trends, patient in chop.
    fn cooldown_ms(&self) -> i64 {
        match self.last_regime.regime {
            Regime::Trending => self.params.min_flip_cooldown_ms.max(10_000),
            Regime::MeanRevert => self.params.min_flip_cooldown_ms.max(60_000),
            _ => self.params.min_flip_cooldown_ms,
        }
    }

    /// Hard and trailing PnL stops on the current position.
    fn check_stops(&mut self, cx: &AgentCx, mark: f64) -> Option<String> {
        let side = self.previous_signal?;
        let position = cx.ctx.risk.position(&cx.sub_account, &cx.symbol, side)?;
        let pnl_bps = position.unrealized_pnl_bps(mark);

        if pnl_bps <= -self.params.hard_stop_bps {
            return Some("hard_stop".to_string());
        }
        if self.trailing_active || pnl_bps >= self.params.trailing_activate_bps {
            self.trailing_active = true;
            self.trailing_hwm_bps = self.trailing_hwm_bps.max(pnl_bps);
            if self.trailing_hwm_bps - pnl_bps >= self.params.trailing_offset_bps {
                return Some("trailing_stop".to_string());
            }
        }
        None
    }

    fn ema_direction(&self, fast: f64, slow: f64) -> Option<Side> {
        if fast > slow {
            Some(Side::Long)
        } else if fast < slow {
            Some(Side::Short)
        } else {
            None
        }
    }

    fn main_scalper_params(
        &self,
        sub_account: &str,
        symbol: &str,
        direction: Side,
        size_usd: f64,
    ) -> ScalperParams {
        ScalperParams {
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            start_side: direction,
            leverage: self.params.leverage,
            long_offset_pct: self.params.long_offset_pct,
            short_offset_pct: self.params.short_offset_pct,
            child_count: self.params.child_count,
            skew: self.params.skew,
            long_size_usd: size_usd,
            short_size_usd: size_usd,
            neutral_mode: false,
            close_only: false,
            min_fill_spread_pct: 0.0,
            fill_decay_half_life_ms: self.params.fill_decay_half_life_ms,
            min_refill_delay_ms: self.params.min_refill_delay_ms,
            max_fills_per_minute: self.params.max_fills_per_minute,
            allow_loss: false,
            max_loss_per_close_bps: 10.0,
            pnl_feedback_mode: PnlFeedbackMode::Soft,
            long_max_price: None,
            short_min_price: None,
        }
    }

    fn close_scalper_params(
        &self,
        sub_account: &str,
        symbol: &str,
        inventory: &Position,
    ) -> ScalperParams {
        let size = inventory.notional.max(10.0);
        ScalperParams {
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            start_side: inventory.side,
            leverage: self.params.leverage,
            long_offset_pct: self.params.long_offset_pct,
            short_offset_pct: self.params.short_offset_pct,
            child_count: 1,
            skew: 0.0,
            long_size_usd: size,
            short_size_usd: size,
            neutral_mode: false,
            close_only: true,
            min_fill_spread_pct: 0.0,
            fill_decay_half_life_ms: self.params.fill_decay_half_life_ms,
            min_refill_delay_ms: 500,
            max_fills_per_minute: 60,
            allow_loss: true,
            max_loss_per_close_bps: 0.0,
            pnl_feedback_mode: PnlFeedbackMode::Off,
            long_max_price: None,
            short_min_price: None,
        }
    }

    pub async fn on_tick(&mut self, cx: &mut AgentCx, tick: &BookTick) -> AgentAction {
        let now_ms = tick.ts_ms;
        let price = tick.mark;

        let old_spread = self.regime.spread_ema_bps().unwrap_or(0.0);
        self.last_regime = self.regime.on_tick(now_ms, price, tick.bid, tick.ask);
        self.last_velocity_z = self.velocity_z.update(self.regime.velocity_bps());
        let fast = self.fast.update(price);
        let slow = self.slow.update(price);

        if cx.tick_count < self.params.slow_period as u64 {
            return AgentAction::Continue;
        }

        let new_spread = self.regime.spread_ema_bps().unwrap_or(old_spread);
        let composite = self.composite.evaluate(&CompositeInputs {
            fast_ema: fast,
            slow_ema: slow,
            velocity_bps: self.regime.velocity_bps(),
            persistence_signed: self.regime.persistence_signed(),
            regime: self.last_regime.clone(),
            old_spread_bps: old_spread,
            new_spread_bps: new_spread,
        });
        self.last_composite = Some(composite.clone());

        if let Some(reason) = self.check_stops(cx, price) {
            return AgentAction::StopSelf(reason);
        }

        // Direction: composite when enabled and confident, EMA cross otherwise.
        let ema_direction = self.ema_direction(fast, slow);
        let direction = if self.params.use_composite {
            composite.direction.or(ema_direction)
        } else {
            ema_direction
        };
        let Some(direction) = direction else {
            return AgentAction::Continue;
        };

        if Some(direction) == self.previous_signal {
            return AgentAction::Continue;
        }
        if now_ms - self.last_flip_at_ms < self.cooldown_ms() {
            return AgentAction::Continue;
        }

        // Volatility gate: elevated fast/slow RV, or a velocity reading at the
        // z-score cap (a dislocation, not a trend).
        if self.regime.rv_ratio() > self.params.max_rv_ratio
            || self.last_velocity_z.abs() >= self.velocity_z.z_cap
        {
            debug!(agent = %cx.agent_id, "volatility gate; skipping flip");
            return AgentAction::Continue;
        }
        // Regime gate.
        if self.last_regime.probs.toxic > self.params.toxic_threshold
            || self.last_regime.probs.liquidation > self.params.liq_threshold
        {
            debug!(agent = %cx.agent_id, "regime gate; skipping flip");
            return AgentAction::Continue;
        }

        // Flip: peel inverted inventory first with a short-lived close
        // scalper, then deploy the directional one.
        cx.kill_scalper("main", false);
        if let Some(inventory) =
            cx.ctx
                .risk
                .position(&cx.sub_account, &cx.symbol, direction.opposite())
        {
            let close_params = self.close_scalper_params(&cx.sub_account, &cx.symbol, &inventory);
            match cx.spawn_scalper("close", close_params) {
                Ok(_) => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    cx.kill_scalper("close", false);
                }
                Err(e) => warn!(agent = %cx.agent_id, error = %e, "close scalper failed"),
            }
        }

        let size = self.params.size_usd
            * self.last_regime.size_multiplier
            * composite.flow_multiplier;
        let main_params = self.main_scalper_params(&cx.sub_account, &cx.symbol, direction, size);
        match cx.spawn_scalper("main", main_params) {
            Ok(id) => {
                debug!(agent = %cx.agent_id, scalper = %id, ?direction, size, "flipped");
            }
            Err(e) => {
                warn!(agent = %cx.agent_id, error = %e, "directional scalper failed");
            }
        }

        self.previous_signal = Some(direction);
        self.last_flip_at_ms = now_ms;
        self.trailing_active = false;
        self.trailing_hwm_bps = 0.0;
        AgentAction::Continue
    }

    pub fn status(&self) -> Value {
        json!({
            "fastEma": self.fast.value(),
            "slowEma": self.slow.value(),
            "previousSignal": self.previous_signal,
            "lastFlipAt": self.last_flip_at_ms,
            "trailingHwm": self.trailing_hwm_bps,
            "trailingActive": self.trailing_active,
            "regime": self.last_regime,
            "compositeResult": self.last_composite,
            "flowImbalance": self.flow.imbalance(),
            "velocityZ": self.last_velocity_z,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> TrendParams {
        serde_json::from_value(json!({
            "fastPeriod": 5,
            "slowPeriod": 20,
            "sizeUsd": 100.0,
            "hardStopBps": 80.0,
            "trailingActivateBps": 40.0,
            "trailingOffsetBps": 20.0,
        }))
        .unwrap()
    }

    #[test]
    fn defaults_fill_in() {
        let p = params();
        assert!(validate(&p).is_ok());
        assert_eq!(p.child_count, 3);
        assert!(p.use_composite);
        assert_eq!(p.min_flip_cooldown_ms, 30_000);
    }

    #[test]
    fn validate_rejects_inverted_periods() {
        let mut p = params();
        p.slow_period = 5;
        p.fast_period = 20;
        assert!(validate(&p).is_err());
    }

    #[test]
    fn ema_direction_sign() {
        let agent = TrendAgent::new(params());
        assert_eq!(agent.ema_direction(101.0, 100.0), Some(Side::Long));
        assert_eq!(agent.ema_direction(99.0, 100.0), Some(Side::Short));
        assert_eq!(agent.ema_direction(100.0, 100.0), None);
    }

    #[test]
    fn cooldown_adapts_to_regime() {
        let mut agent = TrendAgent::new(params());
        agent.last_regime.regime = Regime::Trending;
        assert_eq!(agent.cooldown_ms(), 30_000);
        agent.last_regime.regime = Regime::MeanRevert;
        assert_eq!(agent.cooldown_ms(), 60_000);

        // A configured minimum above the floors wins.
        let mut p = params();
        p.min_flip_cooldown_ms = 90_000;
        let mut agent = TrendAgent::new(p);
        agent.last_regime.regime = Regime::Trending;
        assert_eq!(agent.cooldown_ms(), 90_000);
    }

    #[test]
    fn close_scalper_is_close_only_and_loss_tolerant() {
        let agent = TrendAgent::new(params());
        let inventory = Position {
            position_id: "vp".into(),
            sub_account: "acct".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            quantity: 1.0,
            entry_price: 100.0,
            notional: 100.0,
            leverage: 5.0,
            liquidation_price: None,
        };
        let p = agent.close_scalper_params("acct", "BTCUSDT", &inventory);
        assert!(p.close_only);
        assert!(p.allow_loss);
        assert_eq!(p.max_loss_per_close_bps, 0.0);
        assert_eq!(p.start_side, Side::Long);

        let main = agent.main_scalper_params("acct", "BTCUSDT", Side::Short, 80.0);
        assert!(!main.close_only);
        assert_eq!(main.start_side, Side::Short);
        assert_eq!(main.long_size_usd, 80.0);
    }
}
