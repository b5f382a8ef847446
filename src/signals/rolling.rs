//! Time-windowed rolling trackers over tick streams.

use std::collections::VecDeque;

/// Rolling buy/sell quantity over a wall-clock window, with running sums so
/// reads are O(1) and eviction is amortised O(1).
#[derive(Debug, Clone)]
pub struct RollingQty {
    window_ms: i64,
    buys: VecDeque<(i64, f64)>,
    sells: VecDeque<(i64, f64)>,
    buy_sum: f64,
    sell_sum: f64,
}

impl RollingQty {
    pub fn new(window_sec: u64) -> Self {
        Self {
            window_ms: (window_sec as i64) * 1000,
            buys: VecDeque::new(),
            sells: VecDeque::new(),
            buy_sum: 0.0,
            sell_sum: 0.0,
        }
    }

    pub fn push(&mut self, ts_ms: i64, qty: f64, is_buy: bool) {
        if !qty.is_finite() || qty <= 0.0 {
            return;
        }
        if is_buy {
            self.buys.push_back((ts_ms, qty));
            self.buy_sum += qty;
        } else {
            self.sells.push_back((ts_ms, qty));
            self.sell_sum += qty;
        }
        self.evict(ts_ms);
    }

    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while let Some(&(ts, q)) = self.buys.front() {
            if ts >= cutoff {
                break;
            }
            self.buy_sum -= q;
            self.buys.pop_front();
        }
        while let Some(&(ts, q)) = self.sells.front() {
            if ts >= cutoff {
                break;
            }
            self.sell_sum -= q;
            self.sells.pop_front();
        }
        // Running sums drift under heavy churn; clamp at zero.
        if self.buys.is_empty() {
            self.buy_sum = 0.0;
        }
        if self.sells.is_empty() {
            self.sell_sum = 0.0;
        }
    }

    pub fn buy_qty(&self) -> f64 {
        self.buy_sum
    }

    pub fn sell_qty(&self) -> f64 {
        self.sell_sum
    }

    pub fn total_qty(&self) -> f64 {
        self.buy_sum + self.sell_sum
    }

    /// Signed flow imbalance in [-1, 1]; 0 when the window is empty.
    pub fn imbalance(&self) -> f64 {
        let total = self.total_qty();
        if total <= 0.0 {
            return 0.0;
        }
        (self.buy_sum - self.sell_sum) / total
    }
}

/// Rolling realised volatility from timestamped prices.
#[derive(Debug, Clone)]
pub struct RollingRv {
    window_ms: i64,
    points: VecDeque<(i64, f64)>,
    /// Sum of squared log returns across `points`.
    sq_sum: f64,
}

impl RollingRv {
    pub fn new(window_sec: u64) -> Self {
        Self {
            window_ms: (window_sec as i64) * 1000,
            points: VecDeque::new(),
            sq_sum: 0.0,
        }
    }

    pub fn push(&mut self, ts_ms: i64, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        if let Some(&(_, prev)) = self.points.back() {
            let r = (price / prev).ln();
            self.sq_sum += r * r;
        }
        self.points.push_back((ts_ms, price));

        let cutoff = ts_ms - self.window_ms;
        while self.points.len() > 1 {
            let (front_ts, front_px) = self.points[0];
            if front_ts >= cutoff {
                break;
            }
            let next_px = self.points[1].1;
            let r = (next_px / front_px).ln();
            self.sq_sum = (self.sq_sum - r * r).max(0.0);
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Realised vol normalised per sqrt-second across the observed span.
    pub fn rv_per_sqrt_sec(&self) -> Option<f64> {
        if self.points.len() < 2 {
            return None;
        }
        let span_ms = self.points.back()?.0 - self.points.front()?.0;
        if span_ms <= 0 {
            return None;
        }
        Some((self.sq_sum / (span_ms as f64 / 1000.0)).sqrt())
    }

    /// Window price velocity in bps: (last - first) / first.
    pub fn velocity_bps(&self) -> f64 {
        match (self.points.front(), self.points.back()) {
            (Some(&(_, first)), Some(&(_, last))) if first > 0.0 => {
                (last - first) / first * 10_000.0
            }
            _ => 0.0,
        }
    }

    pub fn last_price(&self) -> Option<f64> {
        self.points.back().map(|&(_, p)| p)
    }
}

/// Bounded-sample median tracker.
#[derive(Debug, Clone)]
pub struct RollingMedian {
    max_len: usize,
    samples: VecDeque<f64>,
}

impl RollingMedian {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.samples.len() >= self.max_len {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn median(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_qty_window_eviction() {
        let mut q = RollingQty::new(10);
        q.push(0, 5.0, true);
        q.push(2_000, 3.0, false);
        assert!((q.buy_qty() - 5.0).abs() < 1e-12);
        assert!((q.sell_qty() - 3.0).abs() < 1e-12);
        assert!((q.imbalance() - 0.25).abs() < 1e-12);

        // 11s later the first buy falls out of the window.
        q.push(11_000, 1.0, true);
        assert!((q.buy_qty() - 1.0).abs() < 1e-12);
        assert!((q.sell_qty() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn rolling_rv_velocity() {
        let mut rv = RollingRv::new(60);
        rv.push(0, 100.0);
        rv.push(1_000, 101.0);
        rv.push(2_000, 102.0);
        // (102 - 100) / 100 = 200 bps
        assert!((rv.velocity_bps() - 200.0).abs() < 1e-9);
        assert!(rv.rv_per_sqrt_sec().unwrap() > 0.0);
    }

    #[test]
    fn rolling_rv_eviction_keeps_sum_consistent() {
        let mut rv = RollingRv::new(5);
        for i in 0..20 {
            rv.push(i * 1_000, 100.0 + (i as f64) * 0.1);
        }
        // Recompute from surviving points and compare.
        let pts: Vec<(i64, f64)> = rv.points.iter().copied().collect();
        let mut expect = 0.0;
        for w in pts.windows(2) {
            let r = (w[1].1 / w[0].1).ln();
            expect += r * r;
        }
        assert!((rv.sq_sum - expect).abs() < 1e-12);
    }

    #[test]
    fn rolling_median_even_odd() {
        let mut m = RollingMedian::new(5);
        assert!(m.median().is_none());
        for v in [3.0, 1.0, 2.0] {
            m.push(v);
        }
        assert_eq!(m.median(), Some(2.0));
        m.push(4.0);
        assert_eq!(m.median(), Some(2.5));
    }

    #[test]
    fn rolling_median_bounded() {
        let mut m = RollingMedian::new(3);
        for v in [1.0, 2.0, 3.0, 100.0] {
            m.push(v);
        }
        assert_eq!(m.len(), 3);
        assert_eq!(m.median(), Some(3.0));
    }
}
