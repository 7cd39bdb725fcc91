//! Anti-distribution filter. Starts from full marks and deducts for heavy
//! down candles, failed breakouts and OBV lagging price.

use std::collections::HashMap;

use super::{
    helpers::{all_finite, highest_high, mean, obv_series},
    ANTI_DISTRIBUTION,
};
use crate::{
    params::{get_factor, get_period, ParamMeta, ParameterizedModule},
    ModuleScore, OHLCVExt, Period, PriceWindow, Result, ScoreModule,
};

impl_with_defaults!(AntiDistributionModule);

const CANDLE_COST: f64 = 2.0;
const CANDLE_CAP: f64 = 8.0;
const FALSE_BREAKOUT_COST: f64 = 4.0;
const OBV_DIVERGENCE_COST: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct AntiDistributionModule {
    pub period: Period,
    /// Volume multiple of the trailing average that marks a heavy bar
    pub volume_factor: f64,
}

impl Default for AntiDistributionModule {
    fn default() -> Self {
        Self {
            period: Period::new_const(20),
            volume_factor: 1.5,
        }
    }
}

impl ScoreModule for AntiDistributionModule {
    fn name(&self) -> &'static str {
        ANTI_DISTRIBUTION
    }

    fn max_score(&self) -> f64 {
        15.0
    }

    fn min_bars(&self) -> usize {
        2 * self.period.get() + 1
    }

    fn feature_keys(&self) -> &'static [&'static str] {
        &["distribution_candles", "false_breakout", "obv_divergence"]
    }

    fn evaluate(&self, window: &PriceWindow) -> Option<ModuleScore> {
        let period = self.period.get();
        let all = window.bars();
        let n = all.len();
        if n < self.min_bars() {
            return None;
        }
        let bars = &all[n - self.min_bars()..];
        if !all_finite(bars) {
            return None;
        }
        let len = bars.len();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        let mut candles = 0usize;
        let mut pushes = 0usize;
        let mut failed = 0usize;
        for i in len - period..len {
            let bar = &bars[i];
            let avg_vol = mean(&volumes[i - period..i])?;
            let closed_down = bar.close < bars[i - 1].close;
            let weak_close = bar.close_position().is_some_and(|p| p < 1.0 / 3.0);
            if closed_down && weak_close && avg_vol > 0.0 && bar.volume >= self.volume_factor * avg_vol
            {
                candles += 1;
            }

            let prior_high = highest_high(&bars[i - period..i])?;
            if bar.high > prior_high {
                pushes += 1;
                if bar.close < prior_high {
                    failed += 1;
                }
            }
        }
        let false_breakout = if pushes > 0 {
            failed as f64 / pushes as f64
        } else {
            0.0
        };

        let obv = obv_series(bars);
        let price_change = bars[len - 1].close - bars[len - 1 - period].close;
        let obv_change = obv[len - 1] - obv[len - 1 - period];
        let obv_divergence = if price_change > 0.0 && obv_change < 0.0 {
            -1.0
        } else if price_change < 0.0 && obv_change > 0.0 {
            1.0
        } else {
            0.0
        };

        let candle_penalty = (CANDLE_COST * candles as f64).min(CANDLE_CAP);
        let obv_penalty = if obv_divergence < 0.0 { OBV_DIVERGENCE_COST } else { 0.0 };
        let score = self.max_score()
            - candle_penalty
            - FALSE_BREAKOUT_COST * false_breakout
            - obv_penalty;

        let mut out = ModuleScore::new(ANTI_DISTRIBUTION, score, self.max_score());
        out.status = out.score >= 0.6 * self.max_score();
        out.insert_meta("distribution_candles", candles);
        out.insert_meta("false_breakout", false_breakout);
        out.insert_meta("obv_divergence", obv_divergence);

        if out.status {
            out.signals.push("No distribution detected".to_string());
        }
        if obv_divergence > 0.0 {
            out.signals.push("OBV rising against falling price".to_string());
        }
        if candles > 0 {
            out.warnings.push(format!("{candles} distribution candle(s)"));
        }
        if false_breakout >= 0.5 {
            out.warnings.push(format!(
                "{failed} of {pushes} breakout attempts failed"
            ));
        }
        if obv_divergence < 0.0 {
            out.warnings.push("OBV falling while price rises".to_string());
        }
        Some(out)
    }
}

static ANTI_DISTRIBUTION_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("period", 20.0, (10.0, 30.0, 5.0), "Bars checked for distribution"),
    ParamMeta::factor("volume_factor", 1.5, (1.2, 2.5, 0.1), "Heavy-volume multiple"),
];

impl ParameterizedModule for AntiDistributionModule {
    fn param_meta() -> &'static [ParamMeta] {
        ANTI_DISTRIBUTION_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        Ok(Self {
            period: get_period(params, "period", 20)?,
            volume_factor: get_factor(params, "volume_factor", 1.5)?,
        })
    }

    fn module_name() -> &'static str {
        ANTI_DISTRIBUTION
    }
}
