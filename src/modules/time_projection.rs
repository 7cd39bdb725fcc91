//! Time projection: Fibonacci day counts since the last major low, with a
//! lunar-cycle nudge when the last bar carries a date.

use std::collections::HashMap;

use chrono::NaiveDate;

use super::{helpers::all_finite, TIME_PROJECTION};
use crate::{
    params::{get_period, ParamMeta, ParameterizedModule},
    ModuleScore, Period, PriceWindow, Result, ScoreModule,
};

impl_with_defaults!(TimeProjectionModule);

pub const FIB_WINDOWS: [usize; 5] = [13, 21, 34, 55, 89];

/// Horizon used when neither the module nor the engine config sets one
pub const DEFAULT_TARGET_DAYS: usize = 20;

/// Mean synodic month in days
pub const SYNODIC_MONTH: f64 = 29.530588;

/// Fractional day of the reference new moon (2000-01-06 18:14 UTC)
const NEW_MOON_DAY_FRACTION: f64 = (18.0 + 14.0 / 60.0) / 24.0;

/// Phase of the moon in `[0, 1)` for a date taken at noon UTC. 0 is new moon.
pub fn lunar_phase(date: NaiveDate) -> Option<f64> {
    let epoch = NaiveDate::from_ymd_opt(2000, 1, 6)?;
    let days = (date - epoch).num_days() as f64 + 0.5 - NEW_MOON_DAY_FRACTION;
    Some((days / SYNODIC_MONTH).rem_euclid(1.0))
}

/// Closeness of `days` to any Fibonacci count: 1 on the count, falling to 0
/// at `tolerance + 1` bars away.
pub fn fib_window_proximity(days: usize, tolerance: usize) -> f64 {
    let reach = (tolerance + 1) as f64;
    FIB_WINDOWS
        .iter()
        .map(|f| 1.0 - (days as f64 - *f as f64).abs() / reach)
        .fold(0.0, f64::max)
}

#[derive(Debug, Clone)]
pub struct TimeProjectionModule {
    pub tolerance: Period,
    /// `None` takes `Config::target_days` when the engine is built.
    pub target_days: Option<Period>,
}

impl Default for TimeProjectionModule {
    fn default() -> Self {
        Self {
            tolerance: Period::new_const(2),
            target_days: None,
        }
    }
}

impl TimeProjectionModule {
    pub fn with_target_days(mut self, days: Period) -> Self {
        self.target_days = Some(days);
        self
    }

    /// Fill in the horizon from the engine config unless one was set explicitly.
    pub(crate) fn seed_target_days(&mut self, days: Period) {
        self.target_days.get_or_insert(days);
    }

    pub fn effective_target_days(&self) -> usize {
        self.target_days.map_or(DEFAULT_TARGET_DAYS, Period::get)
    }
}

impl ScoreModule for TimeProjectionModule {
    fn name(&self) -> &'static str {
        TIME_PROJECTION
    }

    fn max_score(&self) -> f64 {
        15.0
    }

    fn min_bars(&self) -> usize {
        FIB_WINDOWS[1]
    }

    fn feature_keys(&self) -> &'static [&'static str] {
        &["days_since_low", "in_fib_window", "lunar_phase"]
    }

    fn evaluate(&self, window: &PriceWindow) -> Option<ModuleScore> {
        let bars = window.bars();
        if bars.len() < self.min_bars() || !all_finite(bars) {
            return None;
        }
        // Last occurrence wins so a retested low restarts the count.
        let (low_idx, _) = bars
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (i, b)| match best {
                Some((_, low)) if b.low > low => best,
                _ => Some((i, b.low)),
            })?;
        let days_since_low = bars.len() - 1 - low_idx;
        let proximity = fib_window_proximity(days_since_low, self.tolerance.get());

        let target = self.effective_target_days();
        let in_target = days_since_low >= target / 2 && days_since_low <= target * 3;

        let phase = bars.last().and_then(|b| b.date).and_then(lunar_phase);
        let near_new_moon = phase.is_some_and(|p| !(0.1..=0.9).contains(&p));

        let score = 9.0 * proximity
            + if in_target { 3.0 } else { 0.0 }
            + if near_new_moon { 3.0 } else { 0.0 };

        let mut out = ModuleScore::new(TIME_PROJECTION, score, self.max_score());
        out.status = proximity >= 0.5;
        out.insert_meta("days_since_low", days_since_low);
        out.insert_meta("in_fib_window", proximity);
        out.insert_meta("lunar_phase", phase.unwrap_or(0.0));

        if proximity >= 0.5 {
            out.signals.push(format!("{days_since_low} bars since low, inside a Fibonacci window"));
        }
        if near_new_moon {
            out.signals.push("Near new moon".to_string());
        }
        if days_since_low > target * 3 {
            out.warnings.push("Base is stale".to_string());
        }
        Some(out)
    }
}

static TIME_PROJECTION_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("tolerance", 2.0, (1.0, 5.0, 1.0), "Bars of slack around each count"),
    ParamMeta::period("target_days", 20.0, (10.0, 40.0, 5.0), "Expected markup horizon"),
];

impl ParameterizedModule for TimeProjectionModule {
    fn param_meta() -> &'static [ParamMeta] {
        TIME_PROJECTION_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        Ok(Self {
            tolerance: get_period(params, "tolerance", 2)?,
            target_days: if params.contains_key("target_days") {
                Some(get_period(params, "target_days", DEFAULT_TARGET_DAYS)?)
            } else {
                None
            },
        })
    }

    fn module_name() -> &'static str {
        TIME_PROJECTION
    }
}
