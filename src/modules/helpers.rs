//! Indicator math shared across score modules
//!
//! Everything returns `Option` so that empty slices, zero denominators and
//! non-finite input fall through to a zero module score instead of a panic.

use crate::{Bar, OHLCVExt};

/// Denominators below this are treated as zero
pub const EPSILON: f64 = 1e-12;

// ============================================================
// BASIC STATISTICS
// ============================================================

#[inline]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let m = values.iter().sum::<f64>() / values.len() as f64;
    m.is_finite().then_some(m)
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    let sd = var.sqrt();
    sd.is_finite().then_some(sd)
}

#[inline]
pub fn safe_div(num: f64, den: f64) -> Option<f64> {
    if den.abs() <= EPSILON || !num.is_finite() {
        return None;
    }
    let v = num / den;
    v.is_finite().then_some(v)
}

/// Linear credit: 0 at `lo`, 1 at `hi`, clamped.
#[inline]
pub fn scaled(value: f64, lo: f64, hi: f64) -> f64 {
    if !value.is_finite() || (hi - lo).abs() <= EPSILON {
        return 0.0;
    }
    ((value - lo) / (hi - lo)).clamp(0.0, 1.0)
}

/// Simple moving average of the `period` values ending at `end` (inclusive).
pub fn sma_at(values: &[f64], end: usize, period: usize) -> Option<f64> {
    if period == 0 || end >= values.len() || end + 1 < period {
        return None;
    }
    mean(&values[end + 1 - period..=end])
}

/// Percentage (0..=100) of `history` strictly below `value`.
pub fn percentile_rank(history: &[f64], value: f64) -> Option<f64> {
    if history.is_empty() || !value.is_finite() {
        return None;
    }
    let below = history.iter().filter(|h| **h < value).count();
    Some(below as f64 / history.len() as f64 * 100.0)
}

pub fn lowest_low(bars: &[Bar]) -> Option<f64> {
    bars.iter().map(|b| b.low).reduce(f64::min)
}

pub fn highest_high(bars: &[Bar]) -> Option<f64> {
    bars.iter().map(|b| b.high).reduce(f64::max)
}

pub fn all_finite(bars: &[Bar]) -> bool {
    bars.iter().all(|b| b.is_finite())
}

// ============================================================
// INDICATORS
// ============================================================

pub fn true_range(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, b)| match i.checked_sub(1).and_then(|p| bars.get(p)) {
            Some(prev) => (b.high - b.low)
                .max((b.high - prev.close).abs())
                .max((b.low - prev.close).abs()),
            None => b.high - b.low,
        })
        .collect()
}

/// Simple-average ATR. Element `k` covers bars `k..k+period`.
pub fn atr_series(bars: &[Bar], period: usize) -> Vec<f64> {
    if period == 0 || bars.len() < period {
        return Vec::new();
    }
    let tr = true_range(bars);
    tr.windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
}

impl Band {
    /// Relative band width `(upper - lower) / middle`
    pub fn width(&self) -> Option<f64> {
        safe_div(self.upper - self.lower, self.middle)
    }

    /// Where `price` sits between the bands: 0 = lower, 1 = upper.
    pub fn position(&self, price: f64) -> Option<f64> {
        safe_div(price - self.lower, self.upper - self.lower)
    }
}

/// Bollinger bands. Element `k` covers closes `k..k+period`.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Vec<Band> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    closes
        .windows(period)
        .filter_map(|w| {
            let middle = mean(w)?;
            let sd = std_dev(w)?;
            Some(Band {
                lower: middle - k * sd,
                middle,
                upper: middle + k * sd,
            })
        })
        .collect()
}

/// Wilder RSI. Element `k` is the RSI at close index `k + period`.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }
    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let p = period as f64;
    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / p;
    let mut avg_loss = changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / p;

    let rsi = |gain: f64, loss: f64| {
        if loss <= EPSILON {
            if gain <= EPSILON {
                50.0
            } else {
                100.0
            }
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        }
    };

    let mut out = Vec::with_capacity(changes.len() - period + 1);
    out.push(rsi(avg_gain, avg_loss));
    for c in &changes[period..] {
        avg_gain = (avg_gain * (p - 1.0) + c.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-c).max(0.0)) / p;
        out.push(rsi(avg_gain, avg_loss));
    }
    out
}

/// On-balance volume, starting at 0 on the first bar.
pub fn obv_series(bars: &[Bar]) -> Vec<f64> {
    let mut out = Vec::with_capacity(bars.len());
    let mut acc = 0.0;
    for (i, b) in bars.iter().enumerate() {
        if i > 0 {
            let prev = bars[i - 1].close;
            if b.close > prev {
                acc += b.volume;
            } else if b.close < prev {
                acc -= b.volume;
            }
        }
        out.push(acc);
    }
    out
}
