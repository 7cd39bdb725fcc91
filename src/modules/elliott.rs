//! Wave position: where price sits inside the last swing, read through
//! Fibonacci retracements, trend context and a simple ABC correction check.

use std::collections::HashMap;

use super::{
    helpers::{all_finite, highest_high, lowest_low, rsi_series, sma_at},
    ELLIOTT,
};
use crate::{
    params::{get_period, ParamMeta, ParameterizedModule},
    ModuleScore, Period, PriceWindow, Result, SaptaError, ScoreModule,
};

impl_with_defaults!(ElliottModule);

/// Recent bars excluded when locating the prior swing
const RECENT_BARS: usize = 5;
const ABC_BARS: usize = 30;
const DIVERGENCE_BARS: usize = 20;
const FAST_SMA: usize = 50;
const SLOW_SMA: usize = 100;
const VIOLATION_COST: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct ElliottModule {
    pub swing_lookback: Period,
    pub rsi_period: Period,
}

impl Default for ElliottModule {
    fn default() -> Self {
        Self {
            swing_lookback: Period::new_const(60),
            rsi_period: Period::new_const(14),
        }
    }
}

/// Points for a retracement depth.
fn fib_points(retracement: f64) -> f64 {
    if (0.382..=0.618).contains(&retracement) {
        8.0
    } else if (0.236..0.382).contains(&retracement) || (0.618..=0.786).contains(&retracement) {
        4.0
    } else {
        0.0
    }
}

/// High, lower low, then a higher low inside three equal segments.
fn has_abc(bars: &[crate::Bar]) -> Option<bool> {
    let seg = bars.len() / 3;
    if seg == 0 {
        return None;
    }
    let (a, rest) = bars.split_at(seg);
    let (b, c) = rest.split_at(seg);
    let b_low = lowest_low(b)?;
    Some(highest_high(b)? < highest_high(a)? && lowest_low(c)? > b_low && b_low < lowest_low(a)?)
}

impl ScoreModule for ElliottModule {
    fn name(&self) -> &'static str {
        ELLIOTT
    }

    fn max_score(&self) -> f64 {
        20.0
    }

    fn min_bars(&self) -> usize {
        self.swing_lookback
            .get()
            .max(ABC_BARS)
            .max(DIVERGENCE_BARS + self.rsi_period.get() + 1)
            .max(RECENT_BARS + 2)
    }

    fn feature_keys(&self) -> &'static [&'static str] {
        &[
            "fib_retracement",
            "trend_context",
            "abc_pattern",
            "rule_violations",
            "rsi_divergence",
        ]
    }

    fn evaluate(&self, window: &PriceWindow) -> Option<ModuleScore> {
        let bars = window.bars();
        let n = bars.len();
        let lookback = self.swing_lookback.get();
        if lookback <= RECENT_BARS || n < self.min_bars() {
            return None;
        }
        if !all_finite(bars.get(n - self.min_bars()..)?) {
            return None;
        }
        let close = bars.last()?.close;

        let swing = bars.get(n - lookback..)?;
        let swing_high = highest_high(swing)?;
        let swing_low = lowest_low(swing)?;
        let range = swing_high - swing_low;
        if range <= f64::EPSILON {
            return None;
        }
        let retracement = (swing_high - close) / range;

        let prior = bars.get(n - lookback..n - RECENT_BARS)?;
        let prior_high = highest_high(prior)?;
        let prior_low = lowest_low(prior)?;
        let recent_low = lowest_low(bars.get(n - RECENT_BARS..)?)?;
        let close_below_origin = close < prior_low;
        let undercut_origin = recent_low < prior_low;
        let violations = close_below_origin as usize + undercut_origin as usize;

        let closes = window.closes();
        let trend = match (
            sma_at(&closes, n - 1, FAST_SMA),
            sma_at(&closes, n - 1, SLOW_SMA),
        ) {
            (Some(fast), Some(slow)) if fast > slow => 1.0,
            (Some(fast), Some(slow)) if fast < slow => -1.0,
            _ => 0.0,
        };

        let abc = has_abc(bars.get(n - ABC_BARS..)?)?;

        let tail = closes.get(n - DIVERGENCE_BARS - self.rsi_period.get() - 1..)?;
        let rsi = rsi_series(tail, self.rsi_period.get());
        let rsi = &rsi[rsi.len().checked_sub(DIVERGENCE_BARS)?..];
        let price = bars.get(n - DIVERGENCE_BARS..)?;
        let half = DIVERGENCE_BARS / 2;
        let divergence = lowest_low(&price[half..])? < lowest_low(&price[..half])?
            && rsi[half..].iter().copied().reduce(f64::min)?
                > rsi[..half].iter().copied().reduce(f64::min)?;

        let phase = if violations > 0 || retracement > 0.786 {
            "Wave C"
        } else if close >= prior_high {
            "Wave 3"
        } else if (0.382..=0.618).contains(&retracement) && trend > 0.0 {
            "Wave 2"
        } else if (0.236..0.382).contains(&retracement) {
            "Wave 4"
        } else {
            "Unclear"
        };

        let score = fib_points(retracement)
            + if trend > 0.0 { 4.0 } else { 0.0 }
            + if abc { 4.0 } else { 0.0 }
            + if divergence { 4.0 } else { 0.0 }
            - VIOLATION_COST * violations as f64;

        let mut out = ModuleScore::new(ELLIOTT, score, self.max_score());
        out.status = out.score >= 0.5 * self.max_score() && violations == 0;
        out.insert_meta("fib_retracement", retracement);
        out.insert_meta("trend_context", trend);
        out.insert_meta("abc_pattern", abc);
        out.insert_meta("rule_violations", violations);
        out.insert_meta("rsi_divergence", divergence);
        out.insert_meta("wave_phase", phase);

        if (0.382..=0.618).contains(&retracement) {
            out.signals.push(format!("Golden retracement at {:.1}%", retracement * 100.0));
        }
        if abc {
            out.signals.push("ABC correction completed".to_string());
        }
        if divergence {
            out.signals.push("Bullish RSI divergence".to_string());
        }
        if close_below_origin {
            out.warnings.push("Close below wave origin".to_string());
        }
        if undercut_origin {
            out.warnings.push("Retracement exceeded 100%".to_string());
        }
        Some(out)
    }

    fn validate_config(&self) -> Result<()> {
        if self.swing_lookback.get() <= RECENT_BARS {
            return Err(SaptaError::InvalidConfig(format!(
                "elliott swing_lookback must be > {RECENT_BARS}"
            )));
        }
        Ok(())
    }
}

static ELLIOTT_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("swing_lookback", 60.0, (30.0, 120.0, 15.0), "Bars scanned for the swing"),
    ParamMeta::period("rsi_period", 14.0, (7.0, 21.0, 7.0), "RSI length for divergence"),
];

impl ParameterizedModule for ElliottModule {
    fn param_meta() -> &'static [ParamMeta] {
        ELLIOTT_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        Ok(Self {
            swing_lookback: get_period(params, "swing_lookback", 60)?,
            rsi_period: get_period(params, "rsi_period", 14)?,
        })
    }

    fn module_name() -> &'static str {
        ELLIOTT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bar;

    fn window_from_closes(closes: &[f64]) -> PriceWindow {
        closes
            .iter()
            .map(|c| Bar::new(*c, c + 0.5, c - 0.5, *c, 1_000.0))
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn test_fib_points_bands() {
        assert_eq!(fib_points(0.5), 8.0);
        assert_eq!(fib_points(0.3), 4.0);
        assert_eq!(fib_points(0.7), 4.0);
        assert_eq!(fib_points(0.1), 0.0);
        assert_eq!(fib_points(0.9), 0.0);
    }

    #[test]
    fn test_golden_pullback_in_uptrend() {
        // Long rise from 50 to 150, then a pullback to the middle of the last leg.
        let mut closes: Vec<f64> = (0..150).map(|i| 50.0 + i as f64 * (100.0 / 149.0)).collect();
        let top = *closes.last().unwrap();
        for i in 1..=10 {
            closes.push(top - i as f64 * 2.0);
        }
        let s = ElliottModule::default().analyze(&window_from_closes(&closes));
        let retr = s.meta_f64("fib_retracement").unwrap();
        assert!((0.382..=0.618).contains(&retr), "retracement {retr}");
        assert_eq!(s.meta_f64("trend_context"), Some(1.0));
        assert_eq!(s.meta_f64("rule_violations"), Some(0.0));
        assert_eq!(s.meta_str("wave_phase"), Some("Wave 2"));
        assert!(s.score >= 12.0);
    }

    #[test]
    fn test_breakdown_counts_violations() {
        let mut closes: Vec<f64> = vec![100.0; 80];
        closes.extend([99.0, 97.0, 94.0, 90.0, 85.0]);
        let s = ElliottModule::default().analyze(&window_from_closes(&closes));
        assert_eq!(s.meta_f64("rule_violations"), Some(2.0));
        assert_eq!(s.meta_str("wave_phase"), Some("Wave C"));
        assert!(!s.status);
        assert!(s.score >= 0.0);
    }

    #[test]
    fn test_abc_shape() {
        let mut bars = Vec::new();
        for h in [10.0, 12.0, 11.0] {
            bars.push(Bar::new(h, h, h - 1.0, h, 1.0));
        }
        for l in [8.0, 7.0, 9.0] {
            bars.push(Bar::new(l, l + 1.0, l, l, 1.0));
        }
        for l in [8.5, 9.0, 10.0] {
            bars.push(Bar::new(l, l + 1.0, l, l, 1.0));
        }
        assert_eq!(has_abc(&bars), Some(true));
        assert_eq!(has_abc(&bars[..2]), None);
    }

    #[test]
    fn test_short_swing_lookback_rejected() {
        let params = HashMap::from([("swing_lookback", 3.0)]);
        let m = ElliottModule::with_params(&params).unwrap();
        assert!(m.validate_config().is_err());
        assert!(ElliottModule::default().validate_config().is_ok());
    }

    #[test]
    fn test_short_swing_lookback_degrades_to_zero() {
        let m = ElliottModule {
            swing_lookback: Period::new_const(3),
            rsi_period: Period::new_const(14),
        };
        let closes: Vec<f64> = (0..200).map(|i| 100.0 + (i as f64 * 0.2).sin()).collect();
        let s = m.analyze(&window_from_closes(&closes));
        assert_eq!(s.score, 0.0);
        assert!(!s.status);
    }
}
