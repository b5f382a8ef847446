//! Exponential offset ladders and skew-weight generation for layered quoting.

/// Spread factor between the tightest and widest layer of a ladder.
pub const MAX_SPREAD_FACTOR: f64 = 2.0;

/// Exponential ladder of offsets (in percent) around `base_offset_pct`.
///
/// `offset[i] = base * exp(-ln(f)/2 + i * ln(f)/(n-1))` with `f = MAX_SPREAD_FACTOR`,
/// so the geometric mean of the two extremes equals the base offset and the
/// widest layer sits `f`x above the tightest.
pub fn exponential_offsets(base_offset_pct: f64, n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![base_offset_pct];
    }
    let ln_f = MAX_SPREAD_FACTOR.ln();
    (0..n)
        .map(|i| base_offset_pct * (-ln_f / 2.0 + (i as f64) * ln_f / ((n - 1) as f64)).exp())
        .collect()
}

/// Per-layer weight shares from a skew in [-100, 100].
///
/// With `s = skew / 100`, `w[i] ∝ 8^(s * (2i/(n-1) - 1))`, renormalised to sum
/// to 1. Positive skew loads the wider layers, negative the tighter ones;
/// zero skew is uniform.
pub fn skew_weights(skew: f64, n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0];
    }
    let s = (skew / 100.0).clamp(-1.0, 1.0);
    let raw: Vec<f64> = (0..n)
        .map(|i| {
            let x = 2.0 * (i as f64) / ((n - 1) as f64) - 1.0;
            8f64.powf(s * x)
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|w| w / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_matches_expected_three_layer_offsets() {
        // childCount=3, baseOffset=0.3% => ~{0.212%, 0.300%, 0.424%}
        let offsets = exponential_offsets(0.3, 3);
        assert!((offsets[0] - 0.2121).abs() < 1e-4);
        assert!((offsets[1] - 0.3000).abs() < 1e-4);
        assert!((offsets[2] - 0.4243).abs() < 1e-4);
    }

    #[test]
    fn ladder_geometric_mean_of_extremes_is_base() {
        for n in [2usize, 3, 5, 8] {
            let offsets = exponential_offsets(0.5, n);
            let gm = (offsets[0] * offsets[n - 1]).sqrt();
            assert!(
                (gm - 0.5).abs() < 1e-9,
                "n={n}: geometric mean {gm} != base"
            );
        }
    }

    #[test]
    fn ladder_midpoint_is_base_for_odd_n() {
        let offsets = exponential_offsets(0.3, 5);
        assert!((offsets[2] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn single_layer_uses_base_directly() {
        assert_eq!(exponential_offsets(0.7, 1), vec![0.7]);
        assert_eq!(skew_weights(35.0, 1), vec![1.0]);
    }

    #[test]
    fn weights_sum_to_one_and_zero_skew_is_uniform() {
        for skew in [-100.0, -40.0, 0.0, 25.0, 100.0] {
            let w = skew_weights(skew, 6);
            let sum: f64 = w.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12, "skew={skew}");
        }
        let uniform = skew_weights(0.0, 4);
        for w in uniform {
            assert!((w - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn positive_skew_loads_wider_layers() {
        let w = skew_weights(60.0, 5);
        assert!(w[4] > w[0]);
        let w = skew_weights(-60.0, 5);
        assert!(w[0] > w[4]);
    }
}
