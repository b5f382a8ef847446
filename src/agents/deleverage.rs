//! Deleverage agent: caps account notional on one symbol by running a
//! reduce-only unwind scalper whenever exposure breaches the limit, and
//! retiring it once exposure falls back below the re-entry band.

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

fn default_check_every() -> u64 {
    5
}
fn default_leverage() -> f64 {
    3.0
}
fn default_offset() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleverageParams {
    pub max_notional: f64,
    /// Unwinding retires once notional < reentryRatio * maxNotional.
    pub reentry_ratio: f64,
    /// Percent of current notional sized into the unwind scalper.
    pub unwind_pct: f64,
    #[serde(default = "default_check_every")]
    pub check_every_n_ticks: u64,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default = "default_offset")]
    pub offset_pct: f64,
}

impl Default for DeleverageParams {
    fn default() -> Self {
        Self {
            max_notional: 1_000.0,
            reentry_ratio: 0.8,
            unwind_pct: 30.0,
            check_every_n_ticks: default_check_every(),
            leverage: default_leverage(),
            offset_pct: default_offset(),
        }
    }
}

pub fn validate(params: &DeleverageParams) -> EngineResult<()> {
    if !(params.max_notional > 0.0) {
        return Err(EngineError::validation("maxNotional must be positive"));
    }
    if !(params.reentry_ratio > 0.0 && params.reentry_ratio < 1.0) {
        return Err(EngineError::validation("reentryRatio must be in (0, 1)"));
    }
    if !(params.unwind_pct > 0.0 && params.unwind_pct <= 100.0) {
        return Err(EngineError::validation("unwindPct must be in (0, 100]"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeleverageAction {
    None,
    SpawnUnwind { size_usd: f64 },
    KillUnwind,
}

/// Pure threshold logic: breach spawns, the re-entry band retires.
pub fn evaluate(
    deleveraging: bool,
    notional: f64,
    max_notional: f64,
    reentry_ratio: f64,
    unwind_pct: f64,
) -> DeleverageAction {
    if !deleveraging && notional >= max_notional {
        DeleverageAction::SpawnUnwind {
            size_usd: notional * unwind_pct / 100.0,
        }
    } else if deleveraging && notional < reentry_ratio * max_notional {
        DeleverageAction::KillUnwind
    } else {
        DeleverageAction::None
    }
}

pub struct DeleverageAgent {
    params: DeleverageParams,
    deleveraging: bool,
    last_notional: f64,
}

impl DeleverageAgent {
    pub fn new(params: DeleverageParams) -> Self {
        Self {
            params,
            deleveraging: false,
            last_notional: 0.0,
        }
    }

    pub fn on_position_update(&mut self, _position: &Position) {}

    fn unwind_params(
        &self,
        sub_account: &str,
        symbol: &str,
        dominant_side: Side,
        size_usd: f64,
    ) -> ScalperParams {
        ScalperParams {
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            start_side: dominant_side,
            leverage: self.params.leverage,
            long_offset_pct: self.params.offset_pct,
            short_offset_pct: self.params.offset_pct,
            child_count: 1,
            skew: 0.0,
            long_size_usd: size_usd,
            short_size_usd: size_usd,
            neutral_mode: false,
            close_only: true,
            min_fill_spread_pct: 0.0,
            fill_decay_half_life_ms: 30_000,
            min_refill_delay_ms: 1_000,
            max_fills_per_minute: 30,
            allow_loss: false,
            max_loss_per_close_bps: 10.0,
            pnl_feedback_mode: PnlFeedbackMode::Off,
            long_max_price: None,
            short_min_price: None,
        }
    }

    pub fn on_tick(&mut self, cx: &mut AgentCx, _tick: &BookTick) -> AgentAction {
        if cx.tick_count % self.params.check_every_n_ticks != 0 {
            return AgentAction::Continue;
        }

        let notional = cx.ctx.risk.symbol_notional(&cx.sub_account, &cx.symbol);
        self.last_notional = notional;

        match evaluate(
            self.deleveraging,
            notional,
            self.params.max_notional,
            self.params.reentry_ratio,
            self.params.unwind_pct,
        ) {
            DeleverageAction::SpawnUnwind { size_usd } => {
                // Unwind against the heavier side of the book.
                let dominant = cx
                    .ctx
                    .risk
                    .positions_for(&cx.sub_account)
                    .into_iter()
                    .filter(|p| p.symbol == cx.symbol)
                    .max_by(|a, b| {
                        a.notional
                            .partial_cmp(&b.notional)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|p| p.side)
                    .unwrap_or(Side::Long);

                info!(
                    agent = %cx.agent_id,
                    notional,
                    size_usd,
                    "notional cap breached; spawning unwind scalper"
                );
                let params = self.unwind_params(&cx.sub_account, &cx.symbol, dominant, size_usd);
                match cx.spawn_scalper("unwind", params) {
                    Ok(_) => self.deleveraging = true,
                    Err(e) => warn!(agent = %cx.agent_id, error = %e, "unwind spawn failed"),
                }
            }
            DeleverageAction::KillUnwind => {
                debug!(agent = %cx.agent_id, notional, "exposure back in band; retiring unwind");
                cx.kill_scalper("unwind", false);
                self.deleveraging = false;
            }
            DeleverageAction::None => {}
        }
        AgentAction::Continue
    }

    pub fn status(&self) -> Value {
        json!({
            "deleveraging": self.deleveraging,
            "maxNotional": self.params.max_notional,
            "reentryRatio": self.params.reentry_ratio,
            "lastNotional": self.last_notional,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_bounds() {
        let p = DeleverageParams::default();
        assert!(validate(&p).is_ok());

        let mut bad = DeleverageParams::default();
        bad.reentry_ratio = 1.0;
        assert!(validate(&bad).is_err());
        bad.reentry_ratio = 0.8;
        bad.unwind_pct = 0.0;
        assert!(validate(&bad).is_err());
    }

    #[test]
    fn notional_sequence_spawns_then_kills() {
        // maxNotional=500, reentryRatio=0.8, unwindPct=30:
        // [450, 520, 540, 480, 420] -> spawn at 520 (size 156), kill at 420.
        let tape = [450.0, 520.0, 540.0, 480.0, 420.0];
        let mut deleveraging = false;
        let mut actions = Vec::new();
        for notional in tape {
            let action = evaluate(deleveraging, notional, 500.0, 0.8, 30.0);
            match &action {
                DeleverageAction::SpawnUnwind { .. } => deleveraging = true,
                DeleverageAction::KillUnwind => deleveraging = false,
                DeleverageAction::None => {}
            }
            actions.push(action);
        }

        assert_eq!(actions[0], DeleverageAction::None);
        match &actions[1] {
            DeleverageAction::SpawnUnwind { size_usd } => {
                assert!((size_usd - 156.0).abs() < 1e-9);
            }
            other => panic!("expected spawn at 520, got {other:?}"),
        }
        // While unwinding, 540 and 480 change nothing (480 >= 400).
        assert_eq!(actions[2], DeleverageAction::None);
        assert_eq!(actions[3], DeleverageAction::None);
        assert_eq!(actions[4], DeleverageAction::KillUnwind);
    }

    #[test]
    fn unwind_scalper_shape() {
        let agent = DeleverageAgent::new(DeleverageParams::default());
        let p = agent.unwind_params("acct", "BTCUSDT", Side::Long, 156.0);
        assert!(p.close_only);
        assert!(!p.allow_loss);
        assert_eq!(p.long_size_usd, 156.0);
        assert_eq!(p.child_count, 1);
    }
}
