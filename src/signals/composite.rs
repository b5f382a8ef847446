//! Composite directional signal.
//!
//! Five weighted sub-scores, each clamped to [-1, 1] via tanh, summed into a
//! score in [-1, 1]. Confidence is `min(1, |score|)`; a direction is emitted
//! only when confidence clears the configured floor. A separate flow
//! multiplier in [0.5, 1.0] proxies informed-flow intensity from spread width
//! and velocity alignment.

use serde::{Deserialize, Serialize};

use super::regime::{Regime, RegimeResult};
use crate::models::Side;

#[derive(Debug, Clone)]
pub struct CompositeConfig {
    pub w_ema: f64,
    pub w_velocity: f64,
    pub w_persistence: f64,
    pub w_regime: f64,
    pub w_spread: f64,
    /// Confidence floor below which no direction is emitted.
    pub min_confidence: f64,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self {
            w_ema: 0.30,
            w_velocity: 0.25,
            w_persistence: 0.20,
            w_regime: 0.15,
            w_spread: 0.10,
            min_confidence: 0.3,
        }
    }
}

/// Inputs sampled by the owning agent at evaluation time.
#[derive(Debug, Clone)]
pub struct CompositeInputs {
    pub fast_ema: f64,
    pub slow_ema: f64,
    pub velocity_bps: f64,
    /// Signed persistence fraction in [-1, 1].
    pub persistence_signed: f64,
    pub regime: RegimeResult,
    pub old_spread_bps: f64,
    pub new_spread_bps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeResult {
    pub score: f64,
    pub confidence: f64,
    /// Present only when confidence cleared the floor.
    pub direction: Option<Side>,
    pub flow_multiplier: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CompositeSignal {
    cfg: CompositeConfig,
}

impl CompositeSignal {
    pub fn new(cfg: CompositeConfig) -> Self {
        Self { cfg }
    }

    pub fn evaluate(&self, inputs: &CompositeInputs) -> CompositeResult {
        let cfg = &self.cfg;

        let ema_delta_bps = if inputs.slow_ema.abs() > 1e-12 {
            (inputs.fast_ema - inputs.slow_ema) / inputs.slow_ema * 10_000.0
        } else {
            0.0
        };
        let ema_score = (ema_delta_bps / 20.0).tanh();
        let velocity_score = (inputs.velocity_bps / 15.0).tanh();
        let persistence_score = inputs.persistence_signed.clamp(-1.0, 1.0);

        // Direction the EMA and velocity components agree on; used to orient
        // the regime boost and the spread-contraction term.
        let lead = cfg.w_ema * ema_score + cfg.w_velocity * velocity_score;
        let signal_dir = if lead > 0.0 {
            1.0
        } else if lead < 0.0 {
            -1.0
        } else {
            0.0
        };

        let regime_score = match inputs.regime.regime {
            Regime::Trending => signal_dir * inputs.regime.probs.trending,
            Regime::MeanRevert | Regime::Warmup => 0.0,
            Regime::Toxic | Regime::Liquidation => -signal_dir * 0.05,
        };

        let spread_score =
            signal_dir * ((inputs.old_spread_bps - inputs.new_spread_bps) / 3.0).tanh();

        let score = (cfg.w_ema * ema_score
            + cfg.w_velocity * velocity_score
            + cfg.w_persistence * persistence_score
            + cfg.w_regime * regime_score
            + cfg.w_spread * spread_score)
            .clamp(-1.0, 1.0);

        let confidence = score.abs().min(1.0);
        let direction = if confidence >= cfg.min_confidence {
            if score > 0.0 {
                Some(Side::Long)
            } else {
                Some(Side::Short)
            }
        } else {
            None
        };

        CompositeResult {
            score,
            confidence,
            direction,
            flow_multiplier: flow_multiplier(inputs.new_spread_bps, inputs.velocity_bps),
        }
    }
}

/// Flow multiplier in [0.5, 1.0]: 60% narrow-spread score (0-10 bps maps to
/// 1..0) and 40% velocity strength.
pub fn flow_multiplier(spread_bps: f64, velocity_bps: f64) -> f64 {
    let spread_score = (1.0 - spread_bps / 10.0).clamp(0.0, 1.0);
    let velocity_score = (velocity_bps.abs() / 15.0).clamp(0.0, 1.0);
    0.5 + 0.5 * (0.6 * spread_score + 0.4 * velocity_score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::regime::RegimeProbs;

    fn trending_regime(p: f64) -> RegimeResult {
        RegimeResult {
            regime: Regime::Trending,
            probs: RegimeProbs {
                trending: p,
                mean_revert: (1.0 - p) / 2.0,
                liquidation: (1.0 - p) / 2.0,
                toxic: 0.0,
            },
            confidence: p,
            size_multiplier: 0.5 + 0.5 * p,
        }
    }

    #[test]
    fn trending_inputs_score_near_059() {
        // fast-slow = 0.001*slow, velocity 10bps aligned, persistence 0.8,
        // trending P=0.7, spread contracting by 1 bps.
        let sig = CompositeSignal::new(CompositeConfig::default());
        let inputs = CompositeInputs {
            fast_ema: 100.1,
            slow_ema: 100.0,
            velocity_bps: 10.0,
            persistence_signed: 0.8,
            regime: trending_regime(0.7),
            old_spread_bps: 3.0,
            new_spread_bps: 2.0,
        };
        let r = sig.evaluate(&inputs);
        let expected = 0.3 * (0.5f64).tanh()
            + 0.25 * (10.0f64 / 15.0).tanh()
            + 0.2 * 0.8
            + 0.15 * 0.7
            + 0.1 * (1.0f64 / 3.0).tanh();
        assert!((r.score - expected).abs() < 1e-9);
        assert!((r.score - 0.58).abs() < 0.02);
        assert_eq!(r.direction, Some(Side::Long));
        assert!((r.confidence - r.score.abs()).abs() < 1e-12);
    }

    #[test]
    fn no_direction_below_confidence_floor() {
        let sig = CompositeSignal::new(CompositeConfig::default());
        let inputs = CompositeInputs {
            fast_ema: 100.001,
            slow_ema: 100.0,
            velocity_bps: 0.5,
            persistence_signed: 0.1,
            regime: RegimeResult::warmup(),
            old_spread_bps: 2.0,
            new_spread_bps: 2.0,
        };
        let r = sig.evaluate(&inputs);
        assert!(r.confidence < 0.3);
        assert_eq!(r.direction, None);
    }

    #[test]
    fn toxic_regime_counters_the_signal() {
        let sig = CompositeSignal::new(CompositeConfig::default());
        let mut regime = trending_regime(0.7);
        regime.regime = Regime::Toxic;
        let bullish = CompositeInputs {
            fast_ema: 100.2,
            slow_ema: 100.0,
            velocity_bps: 12.0,
            persistence_signed: 0.9,
            regime,
            old_spread_bps: 2.0,
            new_spread_bps: 2.0,
        };
        let toxic_score = sig.evaluate(&bullish).score;
        let trending_score = sig
            .evaluate(&CompositeInputs {
                regime: trending_regime(0.7),
                ..bullish
            })
            .score;
        assert!(toxic_score < trending_score);
    }

    #[test]
    fn flow_multiplier_bounds() {
        // Wide spread, no velocity -> floor.
        assert!((flow_multiplier(50.0, 0.0) - 0.5).abs() < 1e-12);
        // Tight spread, strong velocity -> ceiling.
        assert!((flow_multiplier(0.0, 30.0) - 1.0).abs() < 1e-12);
        let mid = flow_multiplier(5.0, 7.5);
        assert!(mid > 0.5 && mid < 1.0);
    }

    #[test]
    fn short_direction_for_bearish_inputs() {
        let sig = CompositeSignal::new(CompositeConfig::default());
        let inputs = CompositeInputs {
            fast_ema: 99.8,
            slow_ema: 100.0,
            velocity_bps: -12.0,
            persistence_signed: -0.85,
            regime: trending_regime(0.6),
            old_spread_bps: 3.0,
            new_spread_bps: 2.5,
        };
        let r = sig.evaluate(&inputs);
        assert_eq!(r.direction, Some(Side::Short));
        assert!(r.score < 0.0);
    }
}
