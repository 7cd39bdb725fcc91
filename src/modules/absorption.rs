//! Supply absorption: volume-backed accumulation above a held support level.

use std::collections::HashMap;

use super::{
    helpers::{all_finite, lowest_low, mean, safe_div, scaled},
    ABSORPTION,
};
use crate::{
    params::{get_period, ParamMeta, ParameterizedModule},
    ModuleScore, OHLCVExt, Period, PriceWindow, Result, SaptaError, ScoreModule,
};

impl_with_defaults!(AbsorptionModule);

/// Bars per block when hunting for rising swing lows
const SWING_BLOCK: usize = 5;

#[derive(Debug, Clone)]
pub struct AbsorptionModule {
    pub period: Period,
    pub volume_period: Period,
}

impl Default for AbsorptionModule {
    fn default() -> Self {
        Self {
            period: Period::new_const(20),
            volume_period: Period::new_const(50),
        }
    }
}

impl ScoreModule for AbsorptionModule {
    fn name(&self) -> &'static str {
        ABSORPTION
    }

    fn max_score(&self) -> f64 {
        20.0
    }

    fn min_bars(&self) -> usize {
        self.volume_period.get().max(2 * self.period.get())
    }

    fn feature_keys(&self) -> &'static [&'static str] {
        &[
            "volume_spike_ratio",
            "price_held",
            "higher_lows_count",
            "avg_close_strength",
        ]
    }

    fn evaluate(&self, window: &PriceWindow) -> Option<ModuleScore> {
        let period = self.period.get();
        let bars = window.bars();
        let n = bars.len();
        if n < self.min_bars() || !all_finite(&bars[n - self.min_bars()..]) {
            return None;
        }
        let volumes = window.volumes();

        let recent_vol = mean(&volumes[n - period..])?;
        let base_vol = mean(&volumes[n - self.volume_period.get()..])?;
        let spike = safe_div(recent_vol, base_vol)?;

        let support = lowest_low(&bars[n - 2 * period..n - period])?;
        let recent = &bars[n - period..];
        let held = recent.iter().filter(|b| b.close >= support).count() as f64 / period as f64;

        let block_lows: Vec<f64> = recent
            .chunks(SWING_BLOCK)
            .filter_map(lowest_low)
            .collect();
        let higher_lows = block_lows
            .windows(2)
            .rev()
            .take_while(|w| w[1] > w[0])
            .count();

        let positions: Vec<f64> = recent.iter().filter_map(|b| b.close_position()).collect();
        let strength = mean(&positions)?;

        let max_rises = (block_lows.len().saturating_sub(1)).max(1) as f64;
        let score = 6.0 * scaled(spike, 1.0, 1.5)
            + 5.0 * scaled(held, 0.5, 1.0)
            + 5.0 * (higher_lows as f64 / max_rises).min(1.0)
            + 4.0 * scaled(strength, 0.4, 0.6);

        let mut out = ModuleScore::new(ABSORPTION, score, self.max_score());
        out.status = out.score >= 0.5 * self.max_score();
        out.insert_meta("volume_spike_ratio", spike);
        out.insert_meta("price_held", held);
        out.insert_meta("higher_lows_count", higher_lows);
        out.insert_meta("avg_close_strength", strength);

        if spike >= 1.5 {
            out.signals.push(format!("Volume {spike:.2}x above average"));
        }
        if held >= 0.9 {
            out.signals.push(format!("Support at {support:.2} held"));
        }
        if higher_lows >= 2 {
            out.signals.push(format!("{higher_lows} consecutive higher lows"));
        }
        if held < 0.5 {
            out.warnings.push("Support broken repeatedly".to_string());
        }
        Some(out)
    }

    fn validate_config(&self) -> Result<()> {
        if self.volume_period.get() < self.period.get() {
            return Err(SaptaError::InvalidConfig(
                "absorption volume_period must be >= period".into(),
            ));
        }
        Ok(())
    }
}

static ABSORPTION_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("period", 20.0, (10.0, 30.0, 5.0), "Accumulation lookback"),
    ParamMeta::period("volume_period", 50.0, (30.0, 100.0, 10.0), "Baseline volume average"),
];

impl ParameterizedModule for AbsorptionModule {
    fn param_meta() -> &'static [ParamMeta] {
        ABSORPTION_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        Ok(Self {
            period: get_period(params, "period", 20)?,
            volume_period: get_period(params, "volume_period", 50)?,
        })
    }

    fn module_name() -> &'static str {
        ABSORPTION
    }
}
