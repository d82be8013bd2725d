// =============================================================================
// Vectorised indicator kernel
// =============================================================================
//
// All strategies run over plain `&[f64]` columns extracted from a bar
// series. The functions here mirror the TradingView-style recurrences the
// strategies were tuned against:
//
//   EMA:  ema_0 = series_0; ema_i = α·x_i + (1-α)·ema_{i-1}, α = 2/(n+1).
//         A NaN input carries the previous EMA value forward.
//   ATR:  Wilder smoothing with TR_0 = H_0 - L_0.
//   XSL:  difference between the OLS linear-regression value at the
//         current bar and at the previous bar.
//   XSA:  cumulative-moving-sum blend (src·w + prev·(len-w)) / len.
//
// Crossover checks treat any NaN operand as "no cross".
// =============================================================================

/// Exponential moving average seeded with the first element.
///
/// NaN/inf inputs are skipped by carrying the previous EMA value, so the
/// output never goes non-finite after a valid seed.
pub fn ema(series: &[f64], period: usize) -> Vec<f64> {
    if series.is_empty() || period == 0 {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = vec![0.0; series.len()];
    out[0] = if series[0].is_finite() { series[0] } else { 0.0 };

    for i in 1..series.len() {
        let current = if series[i].is_finite() {
            series[i]
        } else {
            out[i - 1]
        };
        let value = current * alpha + out[i - 1] * (1.0 - alpha);
        out[i] = if value.is_finite() { value } else { out[i - 1] };
    }
    out
}

/// Average True Range with Wilder smoothing (`1/n` blend), seeded with the
/// first bar's plain range.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let n = high.len().min(low.len()).min(close.len());
    if n == 0 || period == 0 {
        return Vec::new();
    }

    let mut tr = vec![0.0; n];
    tr[0] = high[0] - low[0];
    for i in 1..n {
        let hl = high[i] - low[i];
        let hc = (high[i] - close[i - 1]).abs();
        let lc = (low[i] - close[i - 1]).abs();
        tr[i] = hl.max(hc).max(lc);
    }

    let alpha = 1.0 / period as f64;
    let mut out = vec![0.0; n];
    out[0] = tr[0];
    for i in 1..n {
        out[i] = alpha * tr[i] + (1.0 - alpha) * out[i - 1];
    }
    out
}

/// OLS linear-regression value of `window` evaluated at its last point.
fn linreg_last(window: &[f64]) -> f64 {
    let n = window.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = window.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var = 0.0;
    for (i, y) in window.iter().enumerate() {
        let dx = i as f64 - x_mean;
        cov += dx * (y - y_mean);
        var += dx * dx;
    }
    if var == 0.0 {
        return y_mean;
    }
    let slope = cov / var;
    let intercept = y_mean - slope * x_mean;
    slope * (n - 1.0) + intercept
}

/// Linear-regression slope signal: the regression value at the current bar
/// minus the value at the previous bar. Windows containing NaN yield 0;
/// without a full previous window the delta is 0.
pub fn xsl(series: &[f64], length: usize, timeframe_multiplier: f64) -> Vec<f64> {
    if series.is_empty() || length == 0 {
        return Vec::new();
    }

    let mut out = vec![0.0; series.len()];
    for i in 0..series.len() {
        if i + 1 < length {
            continue;
        }
        let window = &series[i + 1 - length..=i];
        if window.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let lrc = linreg_last(window);

        let lrprev = if i >= length {
            let prev_window = &series[i - length..i];
            if prev_window.iter().any(|v| !v.is_finite()) {
                lrc
            } else {
                linreg_last(prev_window)
            }
        } else {
            lrc
        };

        out[i] = (lrc - lrprev) / timeframe_multiplier;
    }
    out
}

/// Cumulative-moving-sum weighted average: once a full window of valid
/// input exists, each bar blends `(src·w + prev·(len-w)) / len`.
pub fn xsa(src: &[f64], length: usize, weight: f64) -> Vec<f64> {
    if src.is_empty() || length == 0 {
        return Vec::new();
    }

    let nz = |v: f64| if v.is_finite() { v } else { 0.0 };

    let mut out = vec![f64::NAN; src.len()];
    let mut sums = vec![0.0; src.len()];

    for i in 0..src.len() {
        sums[i] = if i == 0 {
            nz(src[0])
        } else {
            let old = if i >= length { nz(src[i - length]) } else { 0.0 };
            nz(sums[i - 1]) - old + nz(src[i])
        };

        let ma = if i + 1 >= length {
            let check = i + 1 - length;
            if src[check].is_finite() {
                sums[i] / length as f64
            } else {
                f64::NAN
            }
        } else {
            f64::NAN
        };

        if i == 0 {
            out[i] = ma;
        } else if !out[i - 1].is_finite() {
            out[i] = ma;
        } else if src[i].is_finite() && ma.is_finite() {
            out[i] = (src[i] * weight + out[i - 1] * (length as f64 - weight)) / length as f64;
        } else {
            out[i] = out[i - 1];
        }
    }
    out
}

/// `a` crosses above `b` at index i: `a[i-1] <= b[i-1] && a[i] > b[i]`.
/// Any NaN operand makes the comparison false.
pub fn crossover(a: &[f64], b: &[f64]) -> Vec<bool> {
    let n = a.len().min(b.len());
    let mut out = vec![false; n];
    for i in 1..n {
        let finite = a[i - 1].is_finite()
            && b[i - 1].is_finite()
            && a[i].is_finite()
            && b[i].is_finite();
        if finite && a[i - 1] <= b[i - 1] && a[i] > b[i] {
            out[i] = true;
        }
    }
    out
}

/// `a` crosses below `b` at index i: `a[i-1] >= b[i-1] && a[i] < b[i]`.
pub fn crossunder(a: &[f64], b: &[f64]) -> Vec<bool> {
    let n = a.len().min(b.len());
    let mut out = vec![false; n];
    for i in 1..n {
        let finite = a[i - 1].is_finite()
            && b[i - 1].is_finite()
            && a[i].is_finite()
            && b[i].is_finite();
        if finite && a[i - 1] >= b[i - 1] && a[i] < b[i] {
            out[i] = true;
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn close(v: &[f64]) -> Vec<f64> {
        v.to_vec()
    }

    // ---- ema -------------------------------------------------------------

    #[test]
    fn ema_seeds_with_first_value() {
        let out = ema(&[100.0, 101.0, 102.0], 2);
        assert_eq!(out[0], 100.0);
        // α = 2/3: 101·(2/3) + 100·(1/3)
        assert!((out[1] - (101.0 * 2.0 / 3.0 + 100.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn ema_carries_previous_over_nan() {
        let out = ema(&[100.0, f64::NAN, 102.0], 3);
        assert_eq!(out[1], 100.0);
        assert!(out[2] > 100.0 && out[2] < 102.0);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn ema_empty_and_zero_period() {
        assert!(ema(&[], 5).is_empty());
        assert!(ema(&[1.0], 0).is_empty());
    }

    #[test]
    fn ema_converges_toward_constant() {
        let series = vec![50.0; 200];
        let out = ema(&series, 10);
        assert!((out.last().unwrap() - 50.0).abs() < 1e-9);
    }

    // ---- atr -------------------------------------------------------------

    #[test]
    fn atr_first_value_is_plain_range() {
        let high = [105.0, 106.0];
        let low = [95.0, 97.0];
        let close = [100.0, 101.0];
        let out = atr(&high, &low, &close, 10);
        assert_eq!(out[0], 10.0);
    }

    #[test]
    fn atr_uses_gap_against_previous_close() {
        // Gap up: |H - prevClose| dominates H - L.
        let high = [105.0, 120.0];
        let low = [95.0, 115.0];
        let close = [95.0, 118.0];
        let out = atr(&high, &low, &close, 10);
        // TR_1 = max(5, |120-95|=25, |115-95|=20) = 25
        let expected = 0.1 * 25.0 + 0.9 * 10.0;
        assert!((out[1] - expected).abs() < 1e-12);
    }

    #[test]
    fn atr_converges_to_constant_range() {
        let n = 300;
        let high: Vec<f64> = (0..n).map(|_| 105.0).collect();
        let low: Vec<f64> = (0..n).map(|_| 95.0).collect();
        let close: Vec<f64> = (0..n).map(|_| 100.0).collect();
        let out = atr(&high, &low, &close, 10);
        assert!((out.last().unwrap() - 10.0).abs() < 1e-6);
    }

    // ---- xsl -------------------------------------------------------------

    #[test]
    fn xsl_zero_before_full_window() {
        let series: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let out = xsl(&series, 21, 1.0);
        for v in &out[..20] {
            assert_eq!(*v, 0.0);
        }
    }

    #[test]
    fn xsl_linear_series_yields_slope() {
        // For y = 100 + 0.5·i the regression delta per bar is the slope.
        let series: Vec<f64> = (0..60).map(|i| 100.0 + 0.5 * i as f64).collect();
        let out = xsl(&series, 21, 1.0);
        for v in &out[21..] {
            assert!((v - 0.5).abs() < 1e-9, "expected slope 0.5, got {v}");
        }
    }

    #[test]
    fn xsl_flat_series_is_zero() {
        let series = vec![42.0; 50];
        let out = xsl(&series, 21, 1.0);
        assert!(out.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn xsl_nan_window_yields_zero() {
        let mut series: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
        series[30] = f64::NAN;
        let out = xsl(&series, 21, 1.0);
        // Every window containing index 30 emits 0.
        assert_eq!(out[30], 0.0);
        assert_eq!(out[35], 0.0);
        // Clean windows before and after still carry the slope.
        assert!((out[25] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn xsl_timeframe_multiplier_scales_output() {
        let series: Vec<f64> = (0..60).map(|i| 100.0 + 0.5 * i as f64).collect();
        let out = xsl(&series, 21, 2.0);
        assert!((out[40] - 0.25).abs() < 1e-9);
    }

    // ---- xsa -------------------------------------------------------------

    #[test]
    fn xsa_nan_until_full_window() {
        let series: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let out = xsa(&series, 5, 1.0);
        for v in &out[..4] {
            assert!(v.is_nan());
        }
        assert!(out[4].is_finite());
    }

    #[test]
    fn xsa_first_valid_is_window_mean() {
        let series = vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0];
        let out = xsa(&series, 5, 1.0);
        // sum of first 5 = 30, /5 = 6.
        assert!((out[4] - 6.0).abs() < 1e-12);
        // Next bar blends: (12·1 + 6·4) / 5 = 7.2
        assert!((out[5] - 7.2).abs() < 1e-12);
    }

    #[test]
    fn xsa_constant_series_is_fixed_point() {
        let series = vec![10.0; 50];
        let out = xsa(&series, 5, 1.0);
        assert!((out.last().unwrap() - 10.0).abs() < 1e-12);
    }

    // ---- crossover / crossunder -----------------------------------------

    #[test]
    fn crossover_detects_upward_cross() {
        let a = close(&[1.0, 1.0, 3.0, 3.0]);
        let b = close(&[2.0, 2.0, 2.0, 2.0]);
        let up = crossover(&a, &b);
        assert_eq!(up, vec![false, false, true, false]);
    }

    #[test]
    fn crossunder_detects_downward_cross() {
        let a = close(&[3.0, 3.0, 1.0, 1.0]);
        let b = close(&[2.0, 2.0, 2.0, 2.0]);
        let down = crossunder(&a, &b);
        assert_eq!(down, vec![false, false, true, false]);
    }

    #[test]
    fn touch_then_break_counts_as_cross() {
        // Equality on the previous bar satisfies the <= / >= side.
        let a = close(&[2.0, 3.0]);
        let b = close(&[2.0, 2.0]);
        assert_eq!(crossover(&a, &b), vec![false, true]);
    }

    #[test]
    fn nan_operands_never_cross() {
        let a = close(&[f64::NAN, 3.0, 3.0]);
        let b = close(&[2.0, 2.0, f64::NAN]);
        assert!(crossover(&a, &b).iter().all(|v| !v));
        assert!(crossunder(&a, &b).iter().all(|v| !v));
    }
}
