// =============================================================================
// Volume-wave strategy — angel/devil EMA crossover
// =============================================================================
//
// Two derived lines over the close series:
//
//   angel = EMA(close, 2)
//   devil = EMA(XSL(close, 21) · 20 + close, 42)
//
// The slope-adjusted close feeding the devil line leads it on sustained
// trends, so on a clean linear move the two lines converge and only a
// change of curvature separates them. Buy on angel crossing above devil,
// sell on crossing below.
// =============================================================================

use std::collections::HashMap;

use crate::model::Bar;
use crate::strategy::indicators::{crossover, crossunder, ema, xsl};
use crate::strategy::{BarSignal, Strategy, StrategyOutcome};
use crate::types::SignalType;

#[derive(Debug, Clone)]
pub struct VolumeWaveParams {
    pub angel_period: usize,
    pub xsl_length: usize,
    pub xsl_multiplier: f64,
    pub devil_period: usize,
    pub timeframe_multiplier: f64,
}

impl Default for VolumeWaveParams {
    fn default() -> Self {
        Self {
            angel_period: 2,
            xsl_length: 21,
            xsl_multiplier: 20.0,
            devil_period: 42,
            timeframe_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct VolumeWave {
    pub params: VolumeWaveParams,
}

impl VolumeWave {
    pub fn with_params(params: VolumeWaveParams) -> Self {
        Self { params }
    }
}

impl Strategy for VolumeWave {
    fn code(&self) -> &'static str {
        "volume_wave"
    }

    fn name(&self) -> &'static str {
        "量能波动"
    }

    fn apply(&self, bars: &[Bar]) -> StrategyOutcome {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let angel = ema(&closes, self.params.angel_period);
        let slope = xsl(
            &closes,
            self.params.xsl_length,
            self.params.timeframe_multiplier,
        );
        let adjusted: Vec<f64> = closes
            .iter()
            .zip(&slope)
            .map(|(close, s)| s * self.params.xsl_multiplier + close)
            .collect();
        let devil = ema(&adjusted, self.params.devil_period);

        let long = crossover(&angel, &devil);
        let short = crossunder(&angel, &devil);

        let mut signals = Vec::new();
        for i in 0..closes.len() {
            if long.get(i).copied().unwrap_or(false) {
                signals.push(BarSignal {
                    index: i,
                    signal_type: SignalType::Buy,
                    price: closes[i],
                    stop_loss: None,
                    take_profit: None,
                    reason: None,
                });
            } else if short.get(i).copied().unwrap_or(false) {
                signals.push(BarSignal {
                    index: i,
                    signal_type: SignalType::Sell,
                    price: closes[i],
                    stop_loss: None,
                    take_profit: None,
                    reason: None,
                });
            }
        }

        let mut columns: HashMap<&'static str, Vec<f64>> = HashMap::new();
        columns.insert("angel", angel);
        columns.insert("devil", devil);
        columns.insert("ema6", ema(&closes, 6));
        columns.insert("ema18", ema(&closes, 18));

        StrategyOutcome { columns, signals }
    }
}
