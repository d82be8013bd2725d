// =============================================================================
// Volatility-conservation strategy — ATR trailing stop
// =============================================================================
//
// A trailing stop derived from the Average True Range:
//
//   n_loss = key_value · ATR(high, low, close, atr_period)
//
// While price holds above the stop the stop only rises
// (`max(prev, close - n_loss)`); while below, it only falls
// (`min(prev, close + n_loss)`); a side change re-anchors it. Buy when
// the close crosses up through the stop, sell when it crosses down.
// =============================================================================

use std::collections::HashMap;

use crate::model::Bar;
use crate::strategy::indicators::atr;
use crate::strategy::{BarSignal, Strategy, StrategyOutcome};
use crate::types::SignalType;

#[derive(Debug, Clone)]
pub struct VolatilityConservationParams {
    /// Stop width in ATR multiples; larger values widen the stop.
    pub key_value: f64,
    pub atr_period: usize,
}

impl Default for VolatilityConservationParams {
    fn default() -> Self {
        Self {
            key_value: 1.0,
            atr_period: 10,
        }
    }
}

#[derive(Debug, Default)]
pub struct VolatilityConservation {
    pub params: VolatilityConservationParams,
}

impl Strategy for VolatilityConservation {
    fn code(&self) -> &'static str {
        "volatility_conservation"
    }

    fn name(&self) -> &'static str {
        "趋势追踪"
    }

    fn apply(&self, bars: &[Bar]) -> StrategyOutcome {
        let n = bars.len();
        let high: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let low: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let close: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let mut signals = Vec::new();
        let mut columns: HashMap<&'static str, Vec<f64>> = HashMap::new();
        if n == 0 {
            return StrategyOutcome { columns, signals };
        }

        let atr_values = atr(&high, &low, &close, self.params.atr_period);
        let n_loss: Vec<f64> = atr_values.iter().map(|v| v * self.params.key_value).collect();
        let src = &close;

        // Trailing stop recurrence.
        let mut stop = vec![0.0; n];
        stop[0] = src[0] - n_loss[0];
        for i in 1..n {
            let prev = stop[i - 1];
            stop[i] = if src[i] > prev && src[i - 1] > prev {
                prev.max(src[i] - n_loss[i])
            } else if src[i] < prev && src[i - 1] < prev {
                prev.min(src[i] + n_loss[i])
            } else if src[i] > prev {
                src[i] - n_loss[i]
            } else {
                src[i] + n_loss[i]
            };
        }

        // Position direction, carried for the chart overlay.
        let mut position = vec![0.0; n];
        for i in 1..n {
            position[i] = if src[i - 1] < stop[i - 1] && src[i] > stop[i] {
                1.0
            } else if src[i - 1] > stop[i - 1] && src[i] < stop[i] {
                -1.0
            } else {
                position[i - 1]
            };
        }

        for i in 1..n {
            let above = src[i - 1] <= stop[i - 1] && src[i] > stop[i];
            let below = src[i - 1] >= stop[i - 1] && src[i] < stop[i];

            if src[i] > stop[i] && above {
                signals.push(BarSignal {
                    index: i,
                    signal_type: SignalType::Buy,
                    price: src[i],
                    stop_loss: None,
                    take_profit: None,
                    reason: Some(format!("波动守恒买入 (ATR止损: {:.2})", stop[i])),
                });
            } else if src[i] < stop[i] && below {
                signals.push(BarSignal {
                    index: i,
                    signal_type: SignalType::Sell,
                    price: src[i],
                    stop_loss: None,
                    take_profit: None,
                    reason: Some(format!("波动守恒卖出 (ATR止损: {:.2})", stop[i])),
                });
            }
        }

        columns.insert("atr", atr_values);
        columns.insert("atr_trailing_stop", stop);
        columns.insert("position", position);

        StrategyOutcome { columns, signals }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                trade_date: format!("2025-{:02}-{:02}", 1 + i / 28, 1 + i % 28),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                vol: 1_000.0,
                amount: close * 1_000.0,
                pct_chg: 0.0,
                change: 0.0,
            })
            .collect()
    }

    /// 30 bars oscillating around 100, 10 bars falling 3/bar, 10 bars
    /// rising 4/bar.
    fn whipsaw() -> Vec<Bar> {
        let mut closes: Vec<f64> = (0..30)
            .map(|i| 100.0 + if i % 2 == 1 { 0.3 } else { -0.3 })
            .collect();
        let base_down = closes[29];
        closes.extend((0..10).map(|i| base_down - 3.0 * (i + 1) as f64));
        let base_up = *closes.last().unwrap();
        closes.extend((0..10).map(|i| base_up + 4.0 * (i + 1) as f64));
        bars(&closes)
    }

    #[test]
    fn breakdown_sells_and_recovery_buys() {
        let outcome = VolatilityConservation::default().apply(&whipsaw());
        let kinds: Vec<(SignalType, usize)> = outcome
            .signals
            .iter()
            .map(|s| (s.signal_type, s.index))
            .collect();
        assert_eq!(kinds, vec![(SignalType::Sell, 30), (SignalType::Buy, 40)]);
    }

    #[test]
    fn sell_reason_carries_stop_level() {
        let outcome = VolatilityConservation::default().apply(&whipsaw());
        let sell = &outcome.signals[0];
        let reason = sell.reason.as_deref().unwrap();
        assert!(reason.contains("ATR止损"), "reason: {reason}");
    }

    #[test]
    fn stop_only_rises_in_sustained_uptrend() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + 2.0 * i as f64).collect();
        let outcome = VolatilityConservation::default().apply(&bars(&closes));
        let stop = &outcome.columns["atr_trailing_stop"];
        // Skip the ATR warm-up, then the stop must be non-decreasing.
        for i in 5..stop.len() - 1 {
            assert!(
                stop[i + 1] >= stop[i],
                "trailing stop retreated at {i}: {} -> {}",
                stop[i],
                stop[i + 1]
            );
        }
        // No crossings in a pure uptrend that starts above the stop.
        assert!(outcome.signals.is_empty());
    }

    #[test]
    fn rerun_is_idempotent() {
        let strategy = VolatilityConservation::default();
        let input = whipsaw();
        let a = strategy.apply(&input);
        let b = strategy.apply(&input);
        assert_eq!(a.signals.len(), b.signals.len());
        for (x, y) in a.signals.iter().zip(&b.signals) {
            assert_eq!(x.index, y.index);
            assert_eq!(x.signal_type, y.signal_type);
            assert_eq!(x.price, y.price);
        }
    }

    #[test]
    fn empty_input_is_empty_output() {
        let outcome = VolatilityConservation::default().apply(&[]);
        assert!(outcome.signals.is_empty());
        assert!(outcome.columns.is_empty());
    }
}
