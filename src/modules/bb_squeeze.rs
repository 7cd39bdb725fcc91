//! Bollinger band squeeze: band width at the low end of its own history.

use std::collections::HashMap;

use super::{
    helpers::{all_finite, bollinger, percentile_rank, scaled},
    BB_SQUEEZE,
};
use crate::{
    params::{get_factor, get_period, get_ratio, ParamMeta, ParameterizedModule},
    ModuleScore, Period, PriceWindow, Ratio, Result, SaptaError, ScoreModule,
};

impl_with_defaults!(BbSqueezeModule);

/// Fewest width samples worth ranking against
const MIN_WIDTH_HISTORY: usize = 20;

#[derive(Debug, Clone)]
pub struct BbSqueezeModule {
    pub bb_period: Period,
    pub num_std: f64,
    /// Width samples to rank against
    pub lookback: Period,
    pub squeeze_percentile: Ratio,
}

impl Default for BbSqueezeModule {
    fn default() -> Self {
        Self {
            bb_period: Period::new_const(20),
            num_std: 2.0,
            lookback: Period::new_const(100),
            squeeze_percentile: Ratio::new_const(0.2),
        }
    }
}

impl ScoreModule for BbSqueezeModule {
    fn name(&self) -> &'static str {
        BB_SQUEEZE
    }

    fn max_score(&self) -> f64 {
        15.0
    }

    fn min_bars(&self) -> usize {
        self.bb_period.get() + MIN_WIDTH_HISTORY - 1
    }

    fn feature_keys(&self) -> &'static [&'static str] {
        &[
            "bb_width_current",
            "bb_width_percentile",
            "squeeze_duration",
            "price_position_in_bb",
        ]
    }

    fn evaluate(&self, window: &PriceWindow) -> Option<ModuleScore> {
        let bars = window.bars();
        let n = bars.len();
        let span = (self.bb_period.get() + self.lookback.get() - 1).min(n);
        if n < self.min_bars() || !all_finite(&bars[n - span..]) {
            return None;
        }
        let closes: Vec<f64> = bars[n - span..].iter().map(|b| b.close).collect();
        let bands = bollinger(&closes, self.bb_period.get(), self.num_std);
        let widths = bands.iter().map(|b| b.width()).collect::<Option<Vec<f64>>>()?;
        let current_band = bands.last()?;
        let current = *widths.last()?;

        let cutoff = self.squeeze_percentile.get() * 100.0;
        let percentile = percentile_rank(&widths, current)?;
        let squeeze_duration = widths
            .iter()
            .rev()
            .take_while(|w| percentile_rank(&widths, **w).is_some_and(|p| p <= cutoff))
            .count();
        let close = bars[n - 1].close;
        let position = current_band.position(close).unwrap_or(0.5);

        let width_points = if percentile <= cutoff {
            4.0 + 3.0 * (1.0 - scaled(percentile, 0.0, cutoff))
        } else if percentile < 50.0 {
            4.0 * (50.0 - percentile) / (50.0 - cutoff).max(1.0)
        } else {
            0.0
        };
        let position_points = if (0.5..=1.0).contains(&position) {
            4.0 * scaled(position, 0.5, 0.8)
        } else {
            0.0
        };
        let score =
            width_points + 4.0 * (squeeze_duration as f64 / 10.0).min(1.0) + position_points;

        let in_squeeze = percentile <= cutoff;
        let mut out = ModuleScore::new(BB_SQUEEZE, score, self.max_score());
        out.status = in_squeeze;
        out.insert_meta("bb_width_current", current);
        out.insert_meta("bb_width_percentile", percentile);
        out.insert_meta("squeeze_duration", squeeze_duration);
        out.insert_meta("price_position_in_bb", position);

        if in_squeeze {
            out.signals.push(format!(
                "Band width in bottom {percentile:.0}% for {squeeze_duration} bars"
            ));
        }
        if position > 1.0 {
            out.warnings.push("Close already above upper band".to_string());
        } else if position < 0.0 {
            out.warnings.push("Close below lower band".to_string());
        }
        Some(out)
    }

    fn validate_config(&self) -> Result<()> {
        if !self.num_std.is_finite() || self.num_std <= 0.0 {
            return Err(SaptaError::InvalidValue("bb num_std must be positive"));
        }
        if self.lookback.get() < MIN_WIDTH_HISTORY {
            return Err(SaptaError::InvalidConfig(format!(
                "bb_squeeze lookback must be >= {MIN_WIDTH_HISTORY}"
            )));
        }
        Ok(())
    }
}

static BB_SQUEEZE_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("bb_period", 20.0, (10.0, 30.0, 5.0), "Bollinger averaging length"),
    ParamMeta::factor("num_std", 2.0, (1.5, 3.0, 0.5), "Band distance in standard deviations"),
    ParamMeta::period("lookback", 100.0, (50.0, 150.0, 25.0), "Width history for ranking"),
    ParamMeta::ratio("squeeze_percentile", 0.2, (0.1, 0.3, 0.05), "Percentile cutoff for a squeeze"),
];

impl ParameterizedModule for BbSqueezeModule {
    fn param_meta() -> &'static [ParamMeta] {
        BB_SQUEEZE_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        Ok(Self {
            bb_period: get_period(params, "bb_period", 20)?,
            num_std: get_factor(params, "num_std", 2.0)?,
            lookback: get_period(params, "lookback", 100)?,
            squeeze_percentile: get_ratio(params, "squeeze_percentile", 0.2)?,
        })
    }

    fn module_name() -> &'static str {
        BB_SQUEEZE
    }
}
