//! Tick regime classifier.
//!
//! A lightweight per-symbol classifier producing a probability distribution
//! over {trending, mean_revert, liquidation, toxic} from book ticks. Three
//! sigmoid heads score the named regimes; when no head is confident the
//! residual mass is assigned to `toxic`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use super::rolling::{RollingMedian, RollingRv};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Trending,
    MeanRevert,
    Liquidation,
    Toxic,
    Warmup,
}

impl Regime {
    pub fn as_str(&self) -> &str {
        match self {
            Regime::Trending => "trending",
            Regime::MeanRevert => "mean_revert",
            Regime::Liquidation => "liquidation",
            Regime::Toxic => "toxic",
            Regime::Warmup => "warmup",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeProbs {
    pub trending: f64,
    pub mean_revert: f64,
    pub liquidation: f64,
    pub toxic: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeResult {
    pub regime: Regime,
    pub probs: RegimeProbs,
    /// Max regime probability.
    pub confidence: f64,
    /// `0.5 + 0.5 * confidence`, applied to agent sizing.
    pub size_multiplier: f64,
}

impl RegimeResult {
    pub fn warmup() -> Self {
        Self {
            regime: Regime::Warmup,
            probs: RegimeProbs {
                trending: 0.0,
                mean_revert: 0.0,
                liquidation: 0.0,
                toxic: 0.0,
            },
            confidence: 0.0,
            size_multiplier: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegimeConfig {
    /// Ticks observed before the classifier emits anything but warmup.
    pub warmup_ticks: u32,
    pub fast_window_sec: u64,
    pub slow_window_sec: u64,
    /// Max-prob floor below which the residual is assigned to toxic.
    pub min_head_prob: f64,
    /// Persistence lookback in ticks.
    pub persistence_len: usize,
    /// Price bucket width in bps, for dwell measurement.
    pub bucket_bps: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            warmup_ticks: 60,
            fast_window_sec: 30,
            slow_window_sec: 300,
            min_head_prob: 0.35,
            persistence_len: 20,
            bucket_bps: 5.0,
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    cfg: RegimeConfig,
    fast_rv: RollingRv,
    slow_rv: RollingRv,
    /// Last N tick direction signs (+1 / -1), zero ticks skipped.
    signs: VecDeque<i8>,
    last_price: Option<f64>,
    /// EWM spread (bps) and its rate of change (bps/sec).
    spread_ema_bps: Option<f64>,
    spread_rate_bps_s: f64,
    last_spread_ts_ms: Option<i64>,
    /// Baseline spread level; excess over the median feeds the heads.
    spread_median_bps: RollingMedian,
    /// Recent fast-RV samples for vol-of-vol.
    rv_samples: VecDeque<f64>,
    /// Consecutive ticks spent inside the current price bucket.
    bucket_key: Option<i64>,
    bucket_dwell: u32,
    tick_count: u32,
    last_result: RegimeResult,
}

impl RegimeClassifier {
    pub fn new(cfg: RegimeConfig) -> Self {
        let fast = RollingRv::new(cfg.fast_window_sec);
        let slow = RollingRv::new(cfg.slow_window_sec);
        Self {
            cfg,
            fast_rv: fast,
            slow_rv: slow,
            signs: VecDeque::new(),
            last_price: None,
            spread_ema_bps: None,
            spread_rate_bps_s: 0.0,
            last_spread_ts_ms: None,
            spread_median_bps: RollingMedian::new(120),
            rv_samples: VecDeque::new(),
            bucket_key: None,
            bucket_dwell: 0,
            tick_count: 0,
            last_result: RegimeResult::warmup(),
        }
    }

    pub fn tick_count(&self) -> u32 {
        self.tick_count
    }

    pub fn last(&self) -> &RegimeResult {
        &self.last_result
    }

    pub fn spread_ema_bps(&self) -> Option<f64> {
        self.spread_ema_bps
    }

    /// Signed direction persistence in [-1, 1]: fraction of the last N tick
    /// signs agreeing with the most recent sign, carrying that sign.
    pub fn persistence_signed(&self) -> f64 {
        let Some(&current) = self.signs.back() else {
            return 0.0;
        };
        let matching = self.signs.iter().filter(|&&s| s == current).count();
        let frac = matching as f64 / self.signs.len() as f64;
        frac * current as f64
    }

    pub fn velocity_bps(&self) -> f64 {
        self.fast_rv.velocity_bps()
    }

    pub fn on_tick(&mut self, ts_ms: i64, price: f64, bid: f64, ask: f64) -> RegimeResult {
        if !price.is_finite() || price <= 0.0 {
            return self.last_result.clone();
        }
        self.tick_count = self.tick_count.saturating_add(1);

        self.fast_rv.push(ts_ms, price);
        self.slow_rv.push(ts_ms, price);

        if let Some(prev) = self.last_price {
            let sign = if price > prev {
                1i8
            } else if price < prev {
                -1
            } else {
                0
            };
            if sign != 0 {
                if self.signs.len() >= self.cfg.persistence_len {
                    self.signs.pop_front();
                }
                self.signs.push_back(sign);
            }
        }
        self.last_price = Some(price);

        // Spread level and widening rate.
        if bid > 0.0 && ask > bid {
            let spread_bps = (ask - bid) / price * 10_000.0;
            self.spread_median_bps.push(spread_bps);
            let prev = self.spread_ema_bps.unwrap_or(spread_bps);
            let ema = prev + 0.2 * (spread_bps - prev);
            if let Some(prev_ts) = self.last_spread_ts_ms {
                let dt_s = ((ts_ms - prev_ts).max(1)) as f64 / 1000.0;
                self.spread_rate_bps_s = (ema - prev) / dt_s;
            }
            self.spread_ema_bps = Some(ema);
            self.last_spread_ts_ms = Some(ts_ms);
        }

        // Price-bucket dwell.
        let bucket = ((price.ln() * 10_000.0) / self.cfg.bucket_bps).floor() as i64;
        if self.bucket_key == Some(bucket) {
            self.bucket_dwell = self.bucket_dwell.saturating_add(1);
        } else {
            self.bucket_key = Some(bucket);
            self.bucket_dwell = 1;
        }

        // Vol-of-vol from recent fast-RV samples.
        if let Some(rv) = self.fast_rv.rv_per_sqrt_sec() {
            if self.rv_samples.len() >= 60 {
                self.rv_samples.pop_front();
            }
            self.rv_samples.push_back(rv);
        }

        if self.tick_count < self.cfg.warmup_ticks {
            self.last_result = RegimeResult::warmup();
            return self.last_result.clone();
        }

        self.last_result = self.classify();
        self.last_result.clone()
    }

    /// Fast-vs-slow realised-vol ratio; 1.0 until both windows are warm.
    pub fn rv_ratio(&self) -> f64 {
        match (self.fast_rv.rv_per_sqrt_sec(), self.slow_rv.rv_per_sqrt_sec()) {
            (Some(fast), Some(slow)) if slow > 1e-12 => fast / slow,
            _ => 1.0,
        }
    }

    /// Coefficient of variation of recent fast-RV samples.
    fn vol_of_vol(&self) -> f64 {
        if self.rv_samples.len() < 5 {
            return 0.0;
        }
        let mean = self.rv_samples.iter().mean();
        if mean <= 1e-12 {
            return 0.0;
        }
        self.rv_samples.iter().std_dev() / mean
    }

    fn classify(&self) -> RegimeResult {
        let rv_ratio = self.rv_ratio();
        let velocity = self.velocity_bps();
        let persistence = self.persistence_signed().abs();
        let spread_bps = self.spread_ema_bps.unwrap_or(1.0);
        // Spread excess over its rolling median, not its absolute level.
        let spread_excess = self
            .spread_median_bps
            .median()
            .map(|median| (spread_bps - median).max(0.0))
            .unwrap_or(0.0);
        let spread_rate = self.spread_rate_bps_s;
        let dwell = (self.bucket_dwell as f64 / 20.0).min(1.0);
        let vov = self.vol_of_vol();

        // Three sigmoid heads over hand-weighted features.
        let z_trend = 2.0 * (persistence - 0.5)
            + 0.06 * velocity.abs()
            + 0.5 * (rv_ratio - 1.0)
            - 0.5;
        let z_revert =
            1.2 * (1.0 - rv_ratio) + 1.5 * dwell - 0.05 * velocity.abs() - 0.15 * spread_excess;
        let z_liq = 1.0 * (rv_ratio - 1.5)
            + 0.04 * velocity.abs()
            + 0.6 * spread_rate.max(0.0)
            + 1.5 * vov
            - 1.8;

        let raw = [sigmoid(z_trend), sigmoid(z_revert), sigmoid(z_liq)];
        let sum: f64 = raw.iter().sum();
        let mut trending = raw[0] / sum;
        let mut mean_revert = raw[1] / sum;
        let mut liquidation = raw[2] / sum;
        let mut toxic = 0.0;

        let max_named = trending.max(mean_revert).max(liquidation);
        if max_named < self.cfg.min_head_prob {
            // No head is confident: the residual above the best head is toxic flow.
            toxic = 1.0 - max_named;
            let renorm = trending + mean_revert + liquidation + toxic;
            trending /= renorm;
            mean_revert /= renorm;
            liquidation /= renorm;
            toxic /= renorm;
        }

        let (regime, confidence) = [
            (Regime::Trending, trending),
            (Regime::MeanRevert, mean_revert),
            (Regime::Liquidation, liquidation),
            (Regime::Toxic, toxic),
        ]
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or((Regime::Toxic, 0.0));

        RegimeResult {
            regime,
            probs: RegimeProbs {
                trending,
                mean_revert,
                liquidation,
                toxic,
            },
            confidence,
            size_multiplier: 0.5 + 0.5 * confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(classifier: &mut RegimeClassifier, prices: &[f64]) -> RegimeResult {
        let mut last = RegimeResult::warmup();
        for (i, &p) in prices.iter().enumerate() {
            let spread = p * 0.0001;
            last = classifier.on_tick(i as i64 * 1_000, p, p - spread / 2.0, p + spread / 2.0);
        }
        last
    }

    #[test]
    fn warmup_emits_neutral_result() {
        let mut c = RegimeClassifier::new(RegimeConfig::default());
        let r = c.on_tick(0, 100.0, 99.99, 100.01);
        assert_eq!(r.regime, Regime::Warmup);
        assert_eq!(r.confidence, 0.0);
        assert!((r.size_multiplier - 0.5).abs() < 1e-12);
    }

    #[test]
    fn steady_uptrend_classified_as_trending() {
        let mut c = RegimeClassifier::new(RegimeConfig::default());
        let prices: Vec<f64> = (0..200).map(|i| 100.0 * (1.0 + 0.0004 * i as f64)).collect();
        let r = feed(&mut c, &prices);
        assert_eq!(r.regime, Regime::Trending, "probs: {:?}", r.probs);
        assert!(r.confidence >= r.probs.mean_revert);
        assert!(r.size_multiplier > 0.5 && r.size_multiplier <= 1.0);
    }

    #[test]
    fn flat_tape_leans_mean_revert() {
        let mut c = RegimeClassifier::new(RegimeConfig::default());
        let prices: Vec<f64> = (0..200)
            .map(|i| 100.0 + if i % 2 == 0 { 0.001 } else { -0.001 })
            .collect();
        let r = feed(&mut c, &prices);
        assert!(
            r.probs.mean_revert >= r.probs.trending,
            "probs: {:?}",
            r.probs
        );
    }

    #[test]
    fn probabilities_sum_to_one() {
        let mut c = RegimeClassifier::new(RegimeConfig::default());
        let prices: Vec<f64> = (0..150).map(|i| 100.0 + (i as f64 * 0.7).sin()).collect();
        let r = feed(&mut c, &prices);
        let total = r.probs.trending + r.probs.mean_revert + r.probs.liquidation + r.probs.toxic;
        assert!((total - 1.0).abs() < 1e-9);
        assert!((r.size_multiplier - (0.5 + 0.5 * r.confidence)).abs() < 1e-12);
    }
}
