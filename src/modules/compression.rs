//! Volatility compression: ATR and range contracting into a tight coil.

use std::collections::HashMap;

use super::{
    helpers::{all_finite, atr_series, highest_high, lowest_low, mean, safe_div, scaled},
    COMPRESSION,
};
use crate::{
    params::{get_period, ParamMeta, ParameterizedModule},
    ModuleScore, OHLCVExt, Period, PriceWindow, Result, ScoreModule,
};

impl_with_defaults!(CompressionModule);

#[derive(Debug, Clone)]
pub struct CompressionModule {
    pub period: Period,
    pub atr_period: Period,
}

impl Default for CompressionModule {
    fn default() -> Self {
        Self {
            period: Period::new_const(20),
            atr_period: Period::new_const(14),
        }
    }
}

impl ScoreModule for CompressionModule {
    fn name(&self) -> &'static str {
        COMPRESSION
    }

    fn max_score(&self) -> f64 {
        15.0
    }

    fn min_bars(&self) -> usize {
        self.period.get() + self.atr_period.get() + 1
    }

    fn feature_keys(&self) -> &'static [&'static str] {
        &[
            "atr_slope",
            "range_contraction",
            "higher_lows",
            "lower_highs",
            "avg_body_ratio",
        ]
    }

    fn evaluate(&self, window: &PriceWindow) -> Option<ModuleScore> {
        let period = self.period.get();
        let bars = window.bars();
        let n = bars.len();
        if n < self.min_bars() || !all_finite(&bars[n - self.min_bars()..]) {
            return None;
        }

        let atr = atr_series(&bars[n - self.min_bars()..], self.atr_period.get());
        let atr_now = *atr.last()?;
        let atr_then = *atr.get(atr.len().checked_sub(period + 1)?)?;
        let atr_slope = safe_div(atr_now - atr_then, atr_then)?;

        let half = (period / 2).max(1);
        let recent = &bars[n - half..];
        let prior = &bars[n - 2 * half..n - half];
        let recent_range = highest_high(recent)? - lowest_low(recent)?;
        let prior_range = highest_high(prior)? - lowest_low(prior)?;
        let range_contraction = safe_div(recent_range, prior_range)?;

        let higher_lows = lowest_low(recent)? > lowest_low(prior)?;
        let lower_highs = highest_high(recent)? < highest_high(prior)?;

        let bodies: Vec<f64> = recent.iter().filter_map(|b| b.body_ratio()).collect();
        let avg_body_ratio = mean(&bodies).unwrap_or(0.0);

        let score = 5.0 * scaled(-atr_slope, 0.0, 0.3)
            + 4.0 * scaled(1.0 - range_contraction, 0.0, 0.5)
            + if higher_lows { 2.0 } else { 0.0 }
            + if lower_highs { 2.0 } else { 0.0 }
            + 2.0 * scaled(0.6 - avg_body_ratio, 0.0, 0.3);

        let mut out = ModuleScore::new(COMPRESSION, score, self.max_score());
        out.status = out.score >= 0.5 * self.max_score();
        out.insert_meta("atr_slope", atr_slope);
        out.insert_meta("range_contraction", range_contraction);
        out.insert_meta("higher_lows", higher_lows);
        out.insert_meta("lower_highs", lower_highs);
        out.insert_meta("avg_body_ratio", avg_body_ratio);

        if atr_slope < -0.15 {
            out.signals.push(format!("ATR contracting ({:.0}%)", atr_slope * 100.0));
        }
        if higher_lows && lower_highs {
            out.signals.push("Symmetrical coil forming".to_string());
        }
        if atr_slope > 0.3 {
            out.warnings.push("Volatility expanding".to_string());
        }
        Some(out)
    }
}

static COMPRESSION_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("period", 20.0, (10.0, 40.0, 5.0), "Contraction lookback"),
    ParamMeta::period("atr_period", 14.0, (7.0, 21.0, 7.0), "ATR averaging length"),
];

impl ParameterizedModule for CompressionModule {
    fn param_meta() -> &'static [ParamMeta] {
        COMPRESSION_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        Ok(Self {
            period: get_period(params, "period", 20)?,
            atr_period: get_period(params, "atr_period", 14)?,
        })
    }

    fn module_name() -> &'static str {
        COMPRESSION
    }
}
