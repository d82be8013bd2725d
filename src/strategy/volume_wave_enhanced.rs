// =============================================================================
// Volume-wave enhanced — EMA18 filter + single-position state machine
// =============================================================================
//
// Wraps the base volume-wave crossover and filters its signals:
//
//   * a buy survives only when no position is open AND the close sits
//     above EMA(close, 18),
//   * a sell survives only while a position is open,
//   * each surviving signal flips the position flag.
//
// The result is an alternating buy/sell sequence that never shorts.
// =============================================================================

use crate::model::Bar;
use crate::strategy::indicators::ema;
use crate::strategy::volume_wave::VolumeWave;
use crate::strategy::{Strategy, StrategyOutcome};
use crate::types::SignalType;

#[derive(Debug, Default)]
pub struct VolumeWaveEnhanced {
    inner: VolumeWave,
}

impl Strategy for VolumeWaveEnhanced {
    fn code(&self) -> &'static str {
        "volume_wave_enhanced"
    }

    fn name(&self) -> &'static str {
        "动量守恒增强版"
    }

    fn apply(&self, bars: &[Bar]) -> StrategyOutcome {
        let base = self.inner.apply(bars);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let ema18 = ema(&closes, 18);

        let mut has_position = false;
        let mut signals = Vec::new();

        for signal in base.signals {
            match signal.signal_type {
                SignalType::Buy => {
                    if has_position {
                        continue;
                    }
                    let Some(&filter) = ema18.get(signal.index) else {
                        continue;
                    };
                    if filter.is_finite() && closes[signal.index] > filter {
                        signals.push(signal);
                        has_position = true;
                    }
                }
                SignalType::Sell => {
                    if has_position {
                        signals.push(signal);
                        has_position = false;
                    }
                }
            }
        }

        StrategyOutcome {
            columns: base.columns,
            signals,
        }
    }
}
