//! Grid agent: keeps a neutral scalper deployed, pausing and re-deploying
//! with widened offsets after drawdown breaches.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{AgentAction, AgentCx};
use crate::{
    error::{EngineError, EngineResult},
    feeds::BookTick,
    models::{Position, Side},
    strategies::scalper::{PnlFeedbackMode, ScalperParams},
};

fn default_leverage() -> f64 {
    3.0
}
fn default_child_count() -> usize {
    4
}
fn default_cooldown_ms() -> i64 {
    60_000
}
fn default_widen_factor() -> f64 {
    1.5
}
fn default_max_widenings() -> u32 {
    3
}
fn default_half_life() -> u64 {
    30_000
}
fn default_refill_delay() -> u64 {
    1_500
}
fn default_max_fills() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridParams {
    pub size_usd: f64,
    pub offset_pct: f64,
    pub max_drawdown_usd: f64,
    #[serde(default = "default_child_count")]
    pub child_count: usize,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: i64,
    #[serde(default = "default_widen_factor")]
    pub widen_factor: f64,
    #[serde(default = "default_max_widenings")]
    pub max_widenings: u32,
    #[serde(default = "default_half_life")]
    pub fill_decay_half_life_ms: u64,
    #[serde(default = "default_refill_delay")]
    pub min_refill_delay_ms: u64,
    #[serde(default = "default_max_fills")]
    pub max_fills_per_minute: u32,
}

pub fn validate(params: &GridParams) -> EngineResult<()> {
    if !(params.size_usd > 0.0) {
        return Err(EngineError::validation("sizeUsd must be positive"));
    }
    if !(params.offset_pct > 0.0) {
        return Err(EngineError::validation("offsetPct must be positive"));
    }
    if !(params.max_drawdown_usd > 0.0) {
        return Err(EngineError::validation("maxDrawdownUsd must be positive"));
    }
    if params.widen_factor < 1.0 {
        return Err(EngineError::validation("widenFactor must be >= 1"));
    }
    Ok(())
}

pub struct GridAgent {
    params: GridParams,
    widening_count: u32,
    paused_at: Option<i64>,
    current_offset_pct: f64,
    net_pnl: f64,
}

impl GridAgent {
    pub fn new(params: GridParams) -> Self {
        Self {
            current_offset_pct: params.offset_pct,
            widening_count: 0,
            paused_at: None,
            net_pnl: 0.0,
            params,
        }
    }

    fn scalper_params(&self, sub_account: &str, symbol: &str) -> ScalperParams {
        ScalperParams {
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            start_side: Side::Neutral,
            leverage: self.params.leverage,
            long_offset_pct: self.current_offset_pct,
            short_offset_pct: self.current_offset_pct,
            child_count: self.params.child_count,
            skew: 0.0,
            long_size_usd: self.params.size_usd,
            short_size_usd: self.params.size_usd,
            neutral_mode: true,
            close_only: false,
            min_fill_spread_pct: 0.0,
            fill_decay_half_life_ms: self.params.fill_decay_half_life_ms,
            min_refill_delay_ms: self.params.min_refill_delay_ms,
            max_fills_per_minute: self.params.max_fills_per_minute,
            allow_loss: false,
            max_loss_per_close_bps: 10.0,
            pnl_feedback_mode: PnlFeedbackMode::Off,
            long_max_price: None,
            short_min_price: None,
        }
    }

    pub fn on_start(&mut self, cx: &mut AgentCx) -> EngineResult<()> {
        let params = self.scalper_params(&cx.sub_account, &cx.symbol);
        cx.spawn_scalper("grid", params).map(|_| ())
    }

    pub fn on_position_update(&mut self, _position: &Position) {}

    /// Unrealised drawdown across both sides of the symbol at `mark`.
    fn drawdown_usd(&self, cx: &AgentCx, mark: f64) -> f64 {
        let pnl: f64 = cx
            .ctx
            .risk
            .positions_for(&cx.sub_account)
            .iter()
            .filter(|p| p.symbol == cx.symbol)
            .map(|p| p.unrealized_pnl(mark))
            .sum();
        (-pnl).max(0.0)
    }

    pub fn on_tick(&mut self, cx: &mut AgentCx, tick: &BookTick) -> AgentAction {
        let now_ms = tick.ts_ms;

        if let Some(paused_at) = self.paused_at {
            if now_ms - paused_at < self.params.cooldown_ms {
                return AgentAction::Continue;
            }
            self.widening_count += 1;
            if self.widening_count > self.params.max_widenings {
                return AgentAction::StopSelf("max_widenings".to_string());
            }
            self.current_offset_pct *= self.params.widen_factor;
            self.paused_at = None;
            info!(
                agent = %cx.agent_id,
                widening = self.widening_count,
                offset_pct = self.current_offset_pct,
                "grid redeploying with widened offsets"
            );
            let params = self.scalper_params(&cx.sub_account, &cx.symbol);
            if let Err(e) = cx.spawn_scalper("grid", params) {
                warn!(agent = %cx.agent_id, error = %e, "grid redeploy failed");
            }
            return AgentAction::Continue;
        }

        let drawdown = self.drawdown_usd(cx, tick.mark);
        self.net_pnl = -drawdown;
        if drawdown >= self.params.max_drawdown_usd {
            debug!(
                agent = %cx.agent_id,
                drawdown,
                "grid drawdown breach; pausing"
            );
            cx.kill_scalper("grid", false);
            self.paused_at = Some(now_ms);
        }
        AgentAction::Continue
    }

    pub fn status(&self) -> Value {
        json!({
            "wideningCount": self.widening_count,
            "pausedAt": self.paused_at,
            "currentOffsetPct": self.current_offset_pct,
            "netPnl": self.net_pnl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> GridParams {
        serde_json::from_value(json!({
            "sizeUsd": 50.0,
            "offsetPct": 0.2,
            "maxDrawdownUsd": 25.0,
        }))
        .unwrap()
    }

    #[test]
    fn defaults_and_validation() {
        let p = params();
        assert!(validate(&p).is_ok());
        assert_eq!(p.widen_factor, 1.5);
        assert_eq!(p.max_widenings, 3);

        let mut bad = params();
        bad.widen_factor = 0.5;
        assert!(validate(&bad).is_err());
    }

    #[test]
    fn deployed_scalper_is_neutral() {
        let agent = GridAgent::new(params());
        let p = agent.scalper_params("acct", "BTCUSDT");
        assert!(p.neutral_mode);
        assert_eq!(p.start_side, Side::Neutral);
        assert_eq!(p.long_offset_pct, 0.2);
    }

    #[test]
    fn widening_compounds_offsets() {
        let mut agent = GridAgent::new(params());
        agent.current_offset_pct *= agent.params.widen_factor;
        agent.current_offset_pct *= agent.params.widen_factor;
        assert!((agent.current_offset_pct - 0.45).abs() < 1e-12);
    }
}
