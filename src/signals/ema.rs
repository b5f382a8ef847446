//! Exponentially-weighted mean/variance tracker with a capped z-score output.

/// EWM z-score over a numeric stream sampled roughly every `dt` seconds.
///
/// `alpha = 1 - exp(-ln2 * dt / halflife)`, so the mean's memory halves every
/// `halflife` seconds regardless of the sampling cadence chosen.
#[derive(Debug, Clone)]
pub struct EmaZScore {
    pub halflife: f64,
    pub dt: f64,
    pub z_cap: f64,
    alpha: f64,
    mean: f64,
    var: f64,
    warm_count: u32,
}

/// Updates required before the z-score is considered meaningful.
const WARMUP_SAMPLES: u32 = 10;

impl EmaZScore {
    pub fn new(halflife_sec: f64, dt_sec: f64, z_cap: f64) -> Self {
        let halflife = halflife_sec.max(1e-9);
        let dt = dt_sec.max(1e-9);
        let alpha = 1.0 - (-std::f64::consts::LN_2 * dt / halflife).exp();
        Self {
            halflife,
            dt,
            z_cap: z_cap.abs(),
            alpha,
            mean: 0.0,
            var: 0.0,
            warm_count: 0,
        }
    }

    /// Feed one observation; returns the capped z-score (0 while warming up).
    pub fn update(&mut self, x: f64) -> f64 {
        if !x.is_finite() {
            return 0.0;
        }
        if self.warm_count == 0 {
            self.mean = x;
            self.var = 0.0;
            self.warm_count = 1;
            return 0.0;
        }

        let delta = x - self.mean;
        self.mean += self.alpha * delta;
        self.var = (1.0 - self.alpha) * (self.var + self.alpha * delta * delta);
        self.warm_count = self.warm_count.saturating_add(1);

        self.score(x)
    }

    fn score(&self, x: f64) -> f64 {
        if self.warm_count < WARMUP_SAMPLES {
            return 0.0;
        }
        let sd = self.var.sqrt();
        if sd <= 1e-12 {
            return 0.0;
        }
        ((x - self.mean) / sd).clamp(-self.z_cap, self.z_cap)
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn is_warm(&self) -> bool {
        self.warm_count >= WARMUP_SAMPLES
    }
}

/// Plain EMA with period-derived smoothing, `alpha = 2 / (period + 1)`.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn with_period(period: u32) -> Self {
        Self {
            alpha: 2.0 / (period.max(1) as f64 + 1.0),
            value: None,
        }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        let next = match self.value {
            Some(v) => v + self.alpha * (x - v),
            None => x,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_reports_zero() {
        let mut z = EmaZScore::new(30.0, 1.0, 3.0);
        for _ in 0..(WARMUP_SAMPLES - 1) {
            assert_eq!(z.update(100.0), 0.0);
        }
        assert!(!z.is_warm() || z.update(100.0) == 0.0);
    }

    #[test]
    fn z_is_capped() {
        let mut z = EmaZScore::new(30.0, 1.0, 2.5);
        for _ in 0..50 {
            z.update(100.0);
        }
        // Inject noise so variance is nonzero, then a large outlier.
        for i in 0..50 {
            z.update(100.0 + if i % 2 == 0 { 0.1 } else { -0.1 });
        }
        let score = z.update(150.0);
        assert!(score <= 2.5 + 1e-12);
        assert!(score > 0.0);
    }

    #[test]
    fn ema_converges_toward_input() {
        let mut e = Ema::with_period(9);
        let mut last = 0.0;
        for _ in 0..200 {
            last = e.update(42.0);
        }
        assert!((last - 42.0).abs() < 1e-6);
    }

    #[test]
    fn ema_alpha_matches_period_formula() {
        let e = Ema::with_period(19);
        assert!((e.alpha - 0.1).abs() < 1e-12);
    }
}
