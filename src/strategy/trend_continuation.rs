// =============================================================================
// Trend-continuation strategy — "123" price pattern
// =============================================================================
//
// Tracks the most recent confirmed pivot high and pivot low (extrema over
// a `2·length + 1` trailing window, confirmed `length` bars later) with a
// direction flag that alternates as new pivots print.
//
// A buy fires on a breakout above the tracked high when the prior bar was
// still below it and the level was not touched in the previous ten bars;
// a sell fires on the symmetric breakdown through the tracked low.
// Buys carry `stop_loss = max(last_low, price·(1 - stop_loss_ratio))` and
// `take_profit = price + 1.5·(price - stop_loss)`; a sell means reduce or
// stand aside, so it carries neither.
// =============================================================================

use std::collections::HashMap;

use crate::model::Bar;
use crate::strategy::{BarSignal, Strategy, StrategyOutcome};
use crate::types::SignalType;

#[derive(Debug, Clone)]
pub struct TrendContinuationParams {
    /// Pivot confirmation half-window.
    pub length: usize,
    /// Cap on the stop distance as a fraction of the entry price.
    pub stop_loss_ratio: f64,
    /// Enter on the close instead of the bar extreme.
    pub use_close_candle: bool,
}

impl Default for TrendContinuationParams {
    fn default() -> Self {
        Self {
            length: 5,
            stop_loss_ratio: 0.05,
            use_close_candle: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct TrendContinuation {
    pub params: TrendContinuationParams,
}

impl Strategy for TrendContinuation {
    fn code(&self) -> &'static str {
        "trend_continuation"
    }

    fn name(&self) -> &'static str {
        "趋势延续"
    }

    fn apply(&self, bars: &[Bar]) -> StrategyOutcome {
        let length = self.params.length.max(1);
        let window = 2 * length + 1;
        let n = bars.len();

        let mut signals = Vec::new();
        let mut columns: HashMap<&'static str, Vec<f64>> = HashMap::new();
        if n < window {
            return StrategyOutcome { columns, signals };
        }

        let high: Vec<f64> = bars.iter().map(|b| b.high).collect();
        let low: Vec<f64> = bars.iter().map(|b| b.low).collect();
        let close: Vec<f64> = bars.iter().map(|b| b.close).collect();

        // Trailing extrema over `window` bars; undefined until a full
        // window exists.
        let rolling_max = |j: usize| -> Option<f64> {
            (j + 1 >= window).then(|| {
                high[j + 1 - window..=j]
                    .iter()
                    .fold(f64::NEG_INFINITY, |a, &b| a.max(b))
            })
        };
        let rolling_min = |j: usize| -> Option<f64> {
            (j + 1 >= window).then(|| {
                low[j + 1 - window..=j]
                    .iter()
                    .fold(f64::INFINITY, |a, &b| a.min(b))
            })
        };
        let is_pivot_high = |j: usize| j >= length && rolling_max(j) == Some(high[j]);
        let is_pivot_low = |j: usize| j >= length && rolling_min(j) == Some(low[j]);

        // Key-level state machine: the tracked high/low alternate as
        // pivots confirm (a pivot at j is confirmed at bar j + length).
        let mut dir_up = false;
        let mut last_high = high[0];
        let mut last_low = low[0];
        let mut tracked_high = vec![f64::NAN; n];
        let mut tracked_low = vec![f64::NAN; n];

        for i in length..n {
            let j = i - length;
            let pivot_high = is_pivot_high(j);
            let pivot_low = is_pivot_low(j);

            if dir_up {
                if pivot_low && low[j] < last_low {
                    last_low = low[j];
                }
                if pivot_high && high[j] > last_low {
                    last_high = high[j];
                    dir_up = false;
                }
            } else {
                if pivot_high && high[j] > last_high {
                    last_high = high[j];
                }
                if pivot_low && low[j] < last_high {
                    last_low = low[j];
                    dir_up = true;
                    if pivot_high && high[j] > last_low {
                        last_high = high[j];
                        dir_up = false;
                    }
                }
            }

            tracked_high[i] = last_high;
            tracked_low[i] = last_low;
        }

        // Whether either key level was touched within the prior ten bars;
        // a fresh breakout of an already-tested level is not taken.
        let recent_touch = |i: usize| -> bool {
            if i < 10 {
                return false;
            }
            for back in 1..10 {
                let idx = i - back;
                let Some(prev) = idx.checked_sub(1) else {
                    continue;
                };
                let low_touch = low[idx] <= tracked_low[idx] && low[prev] > tracked_low[prev];
                let high_touch = high[idx] >= tracked_high[idx] && high[prev] < tracked_high[prev];
                if low_touch || high_touch {
                    return true;
                }
            }
            false
        };

        for i in length..n {
            let touched = recent_touch(i);

            let long_entry = if self.params.use_close_candle {
                close[i]
            } else {
                high[i]
            };
            if long_entry >= tracked_high[i] && high[i - 1] < tracked_high[i - 1] && !touched {
                let price = tracked_high[i];
                let ratio_stop = price * (1.0 - self.params.stop_loss_ratio);
                let stop_loss = tracked_low[i].max(ratio_stop);
                let risk = price - stop_loss;
                signals.push(BarSignal {
                    index: i,
                    signal_type: SignalType::Buy,
                    price,
                    stop_loss: Some(stop_loss),
                    take_profit: Some(price + risk * 1.5),
                    reason: None,
                });
                continue;
            }

            let short_entry = if self.params.use_close_candle {
                close[i]
            } else {
                low[i]
            };
            if short_entry <= tracked_low[i] && low[i - 1] > tracked_low[i - 1] && !touched {
                signals.push(BarSignal {
                    index: i,
                    signal_type: SignalType::Sell,
                    price: tracked_low[i],
                    stop_loss: None,
                    take_profit: None,
                    reason: Some("减仓或空仓等待信号".to_string()),
                });
            }
        }

        columns.insert("last_high", tracked_high);
        columns.insert("last_low", tracked_low);

        StrategyOutcome { columns, signals }
    }
}
