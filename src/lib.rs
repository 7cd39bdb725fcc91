//! # SAPTA - pre-markup pattern scoring engine
//!
//! Scores a fixed-length OHLCV window with six independent analyzers, combines
//! their sub-scores under a weighted configuration, applies cross-module
//! penalties and classifies the result into an ordered status with a
//! confidence level. An optional learned-model overlay and an async batch
//! scanner sit on top.
//!
//! ## Quick Start
//!
//! ```rust
//! use sapta::prelude::*;
//!
//! let engine = EngineBuilder::new()
//!     .with_default_modules()
//!     .config(Config::default())
//!     .build()
//!     .unwrap();
//!
//! let bars: Vec<Bar> = (0..200)
//!     .map(|i| {
//!         let p = 100.0 + (i as f64 * 0.1).sin();
//!         Bar::new(p, p + 1.0, p - 1.0, p + 0.2, 1_000_000.0)
//!     })
//!     .collect();
//! let window = PriceWindow::new(bars);
//!
//! if let Some(result) = engine.analyze("2330", &window) {
//!     println!("{}", engine.format_result(&result, false));
//! }
//! ```

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod logging;
pub mod modules;
pub mod overlay;
pub mod params;
pub mod report;
pub mod scanner;

use overlay::{FeatureExtractor, ModelSlot};

pub mod prelude {
    pub use crate::{
        // Modules
        modules::*,
        // Overlay
        overlay::{FeatureExtractor, ModelSlot, OverlayError, TreeEnsemble},
        // Parameters
        params::{get_period, get_ratio, ParamMeta, ParamType, ParameterizedModule},
        // Scanner
        scanner::{
            DataProvider, FetchRange, ProviderError, ScanOptions, ScanReport, TickerOutcome,
        },
        // Types
        Bar,
        BuiltinModule,
        Confidence,
        ConfidenceConfig,
        Config,
        Engine,
        EngineBuilder,
        EngineResult,
        MetaValue,
        ModuleScore,
        OHLCVExt,
        PenaltyConfig,
        Period,
        PriceWindow,
        Ratio,
        Result,
        SaptaError,
        // Core traits
        ScoreModule,
        Status,
        OHLCV,
    };
}

// ============================================================
// ERRORS
// ============================================================

pub type Result<T> = std::result::Result<T, SaptaError>;

/// Errors raised while building or configuring the engine.
///
/// Data-dependent problems never surface here: short windows yield `None`,
/// module failures yield a zero score and overlay failures only degrade
/// confidence.
#[derive(Debug, thiserror::Error)]
pub enum SaptaError {
    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("{field} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================
// VALIDATED TYPES
// ============================================================

/// Normalized value in range 0.0..=1.0
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Ratio(f64);

impl Ratio {
    /// Create a new Ratio, validating the value is in [0.0, 1.0]
    pub fn new(value: f64) -> Result<Self> {
        if value.is_nan() || value.is_infinite() {
            return Err(SaptaError::InvalidValue("Ratio cannot be NaN or infinite"));
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(SaptaError::OutOfRange {
                field: "Ratio",
                value,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(Self(value))
    }

    /// Create a Ratio from a compile-time constant (library internal use)
    #[doc(hidden)]
    pub const fn new_const(value: f64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> f64 {
        self.0
    }
}

impl Serialize for Ratio {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> Deserialize<'de> for Ratio {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = f64::deserialize(d)?;
        Ratio::new(value).map_err(serde::de::Error::custom)
    }
}

/// Lookback length in bars (must be > 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Period(usize);

impl Period {
    /// Create a new Period, validating value is > 0
    pub fn new(value: usize) -> Result<Self> {
        if value == 0 {
            return Err(SaptaError::InvalidValue("Period must be > 0"));
        }
        Ok(Self(value))
    }

    #[doc(hidden)]
    pub const fn new_const(value: usize) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = usize::deserialize(d)?;
        Period::new(value).map_err(serde::de::Error::custom)
    }
}

// ============================================================
// OHLCV TRAITS
// ============================================================

/// Core OHLCV data trait
pub trait OHLCV {
    fn open(&self) -> f64;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
    fn volume(&self) -> f64;

    fn date(&self) -> Option<NaiveDate> {
        None
    }
}

/// Extension trait with computed properties for OHLCV data
pub trait OHLCVExt: OHLCV {
    #[inline]
    fn body(&self) -> f64 {
        (self.close() - self.open()).abs()
    }

    #[inline]
    fn range(&self) -> f64 {
        self.high() - self.low()
    }

    #[inline]
    fn is_bullish(&self) -> bool {
        self.close() > self.open()
    }

    #[inline]
    fn is_bearish(&self) -> bool {
        self.close() < self.open()
    }

    /// Body as ratio of range. Returns None if range is ~0
    #[inline]
    fn body_ratio(&self) -> Option<f64> {
        let range = self.range();
        (range > f64::EPSILON).then(|| self.body() / range)
    }

    /// Where the close sits inside the bar: 0 = at the low, 1 = at the high.
    #[inline]
    fn close_position(&self) -> Option<f64> {
        let range = self.range();
        (range > f64::EPSILON).then(|| (self.close() - self.low()) / range)
    }

    fn is_finite(&self) -> bool {
        self.open().is_finite()
            && self.high().is_finite()
            && self.low().is_finite()
            && self.close().is_finite()
            && self.volume().is_finite()
    }
}

impl<T: OHLCV> OHLCVExt for T {}

/// One daily row of a price window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            date: None,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }
}

impl OHLCV for Bar {
    fn open(&self) -> f64 {
        self.open
    }

    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }

    fn close(&self) -> f64 {
        self.close
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn date(&self) -> Option<NaiveDate> {
        self.date
    }
}

/// Time-ordered OHLCV history for one symbol, oldest bar first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceWindow {
    bars: Vec<Bar>,
}

impl PriceWindow {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self { bars }
    }

    /// Copy rows from any OHLCV source.
    pub fn from_ohlcv<T: OHLCV>(rows: &[T]) -> Self {
        let bars = rows
            .iter()
            .map(|r| Bar {
                date: r.date(),
                open: r.open(),
                high: r.high(),
                low: r.low(),
                close: r.close(),
                volume: r.volume(),
            })
            .collect();
        Self { bars }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    #[inline]
    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.low).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume).collect()
    }
}

impl From<Vec<Bar>> for PriceWindow {
    fn from(bars: Vec<Bar>) -> Self {
        Self::new(bars)
    }
}

// ============================================================
// MODULE SCORE - result of one analyzer
// ============================================================

/// Diagnostic value attached to a module score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl MetaValue {
    /// Numeric encoding used by the feature extractor. Text has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Number(v) => Some(*v),
            MetaValue::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            MetaValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Number(v)
    }
}

impl From<usize> for MetaValue {
    fn from(v: usize) -> Self {
        MetaValue::Number(v as f64)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Flag(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Text(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Text(v)
    }
}

/// Bounded sub-score produced by one analyzer. `0 <= score <= max_score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleScore {
    pub module_name: String,
    pub score: f64,
    pub max_score: f64,
    /// Whether the module considers its pattern present
    pub status: bool,
    pub metadata: BTreeMap<String, MetaValue>,
    pub signals: Vec<String>,
    pub warnings: Vec<String>,
}

impl ModuleScore {
    /// Zero score with no metadata: the outcome for short or unusable windows.
    pub fn empty(module_name: &str, max_score: f64) -> Self {
        Self {
            module_name: module_name.to_string(),
            score: 0.0,
            max_score,
            status: false,
            metadata: BTreeMap::new(),
            signals: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Score clamped into `[0, max_score]`; NaN collapses to zero.
    pub fn new(module_name: &str, score: f64, max_score: f64) -> Self {
        let score = if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, max_score)
        };
        Self {
            score,
            ..Self::empty(module_name, max_score)
        }
    }

    pub fn with_status(mut self, status: bool) -> Self {
        self.status = status;
        self
    }

    pub fn insert_meta(&mut self, key: &str, value: impl Into<MetaValue>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(MetaValue::as_f64)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(MetaValue::as_str)
    }

    /// Score as a fraction of the maximum (0 when max is 0).
    pub fn fraction(&self) -> f64 {
        if self.max_score > 0.0 {
            self.score / self.max_score
        } else {
            0.0
        }
    }
}

// ============================================================
// STATUS & CONFIDENCE
// ============================================================

/// Classification bucket, declared weakest first so `Ord` follows strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "ABAIKAN")]
    Abaikan,
    #[serde(rename = "WATCHLIST")]
    Watchlist,
    #[serde(rename = "SIAP")]
    Siap,
    #[serde(rename = "PRE-MARKUP")]
    PreMarkup,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Abaikan,
        Status::Watchlist,
        Status::Siap,
        Status::PreMarkup,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Status::Abaikan => "ABAIKAN",
            Status::Watchlist => "WATCHLIST",
            Status::Siap => "SIAP",
            Status::PreMarkup => "PRE-MARKUP",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Confidence {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
}

impl Confidence {
    pub fn label(self) -> &'static str {
        match self {
            Confidence::Low => "LOW",
            Confidence::Medium => "MEDIUM",
            Confidence::High => "HIGH",
        }
    }

    pub fn upgrade(self) -> Self {
        match self {
            Confidence::Low => Confidence::Medium,
            _ => Confidence::High,
        }
    }

    pub fn downgrade(self) -> Self {
        match self {
            Confidence::High => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================
// CONFIGURATION
// ============================================================

/// Deductions applied when module outputs contradict each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyConfig {
    /// Anti-distribution flagged while another module reads bullish
    pub distribution_override: f64,
    /// Compression or squeeze present without accumulation behind it
    pub compression_without_absorption: f64,
    /// Per broken wave rule reported by the wave module
    pub wave_violation: f64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            distribution_override: 10.0,
            compression_without_absorption: 5.0,
            wave_violation: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub high_margin: f64,
    pub medium_margin: f64,
    /// Max gap between model probability and `final_score / max` to count as agreement
    pub ml_agreement_tolerance: Ratio,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            high_margin: 10.0,
            medium_margin: 5.0,
            ml_agreement_tolerance: Ratio::new_const(0.15),
        }
    }
}

/// Engine configuration. Read-only once the engine is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-module multiplier keyed by module name; missing entries weigh 1.0
    pub weights: BTreeMap<String, f64>,
    pub threshold_pre_markup: f64,
    pub threshold_siap: f64,
    pub threshold_watchlist: f64,
    /// Gain that counts as a successful markup when labelling overlay
    /// training data. Calibration only; scoring never reads it.
    pub target_gain_pct: f64,
    /// Markup horizon in bars; seeds the time-projection module unless it
    /// was given its own horizon.
    pub target_days: usize,
    pub min_history_days: usize,
    pub penalties: PenaltyConfig,
    pub confidence: ConfidenceConfig,
    /// Share of the model estimate in `blended_score`
    pub ml_blend_weight: Ratio,
}

impl Default for Config {
    fn default() -> Self {
        let weights = modules::DEFAULT_MODULE_NAMES
            .iter()
            .map(|name| (name.to_string(), 1.0))
            .collect();
        Self {
            weights,
            threshold_pre_markup: 80.0,
            threshold_siap: 65.0,
            threshold_watchlist: 50.0,
            target_gain_pct: 10.0,
            target_days: 20,
            min_history_days: 120,
            penalties: PenaltyConfig::default(),
            confidence: ConfidenceConfig::default(),
            ml_blend_weight: Ratio::new_const(0.3),
        }
    }
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn with_thresholds(mut self, pre_markup: f64, siap: f64, watchlist: f64) -> Self {
        self.threshold_pre_markup = pre_markup;
        self.threshold_siap = siap;
        self.threshold_watchlist = watchlist;
        self
    }

    pub fn with_weight(mut self, module: &str, weight: f64) -> Self {
        self.weights.insert(module.to_string(), weight);
        self
    }

    pub fn with_min_history(mut self, days: usize) -> Self {
        self.min_history_days = days;
        self
    }

    #[inline]
    pub fn weight(&self, module: &str) -> f64 {
        self.weights.get(module).copied().unwrap_or(1.0)
    }

    /// Map a final score onto its status bucket. Monotonic in `score`.
    pub fn classify(&self, score: f64) -> Status {
        if score >= self.threshold_pre_markup {
            Status::PreMarkup
        } else if score >= self.threshold_siap {
            Status::Siap
        } else if score >= self.threshold_watchlist {
            Status::Watchlist
        } else {
            Status::Abaikan
        }
    }

    /// Rule-based confidence from the distance to the nearest lower threshold.
    /// Below the watchlist line the distance is measured downward instead.
    pub fn base_confidence(&self, score: f64) -> Confidence {
        let margin = match self.classify(score) {
            Status::PreMarkup => score - self.threshold_pre_markup,
            Status::Siap => score - self.threshold_siap,
            Status::Watchlist => score - self.threshold_watchlist,
            Status::Abaikan => self.threshold_watchlist - score,
        };
        if margin >= self.confidence.high_margin {
            Confidence::High
        } else if margin >= self.confidence.medium_margin {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            self.threshold_pre_markup,
            self.threshold_siap,
            self.threshold_watchlist,
        ];
        if thresholds.iter().any(|t| !t.is_finite()) {
            return Err(SaptaError::InvalidConfig("thresholds must be finite".into()));
        }
        if !(self.threshold_pre_markup > self.threshold_siap
            && self.threshold_siap > self.threshold_watchlist)
        {
            return Err(SaptaError::InvalidConfig(format!(
                "thresholds must be strictly descending: pre_markup={} siap={} watchlist={}",
                self.threshold_pre_markup, self.threshold_siap, self.threshold_watchlist
            )));
        }
        if self.threshold_watchlist < 0.0 {
            return Err(SaptaError::OutOfRange {
                field: "threshold_watchlist",
                value: self.threshold_watchlist,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        for (name, weight) in &self.weights {
            if !weight.is_finite() || *weight <= 0.0 {
                return Err(SaptaError::InvalidConfig(format!(
                    "weight for {name} must be positive and finite, got {weight}"
                )));
            }
        }
        if self.min_history_days == 0 {
            return Err(SaptaError::InvalidValue("min_history_days must be > 0"));
        }
        if self.target_days == 0 {
            return Err(SaptaError::InvalidValue("target_days must be > 0"));
        }
        if !self.target_gain_pct.is_finite() || self.target_gain_pct <= 0.0 {
            return Err(SaptaError::InvalidValue("target_gain_pct must be positive"));
        }
        let p = &self.penalties;
        for (field, value) in [
            ("distribution_override", p.distribution_override),
            ("compression_without_absorption", p.compression_without_absorption),
            ("wave_violation", p.wave_violation),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SaptaError::OutOfRange {
                    field,
                    value,
                    min: 0.0,
                    max: f64::INFINITY,
                });
            }
        }
        let c = &self.confidence;
        if !(c.medium_margin >= 0.0 && c.high_margin >= c.medium_margin) {
            return Err(SaptaError::InvalidConfig(
                "confidence margins must satisfy 0 <= medium <= high".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================
// ENGINE RESULT
// ============================================================

/// Outcome of one `analyze` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResult {
    pub ticker: String,
    pub total_score: f64,
    pub weighted_score: f64,
    pub penalty_score: f64,
    pub final_score: f64,
    pub status: Status,
    pub confidence: Confidence,
    pub module_scores: Vec<ModuleScore>,
    pub notes: Vec<String>,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub penalties: Vec<String>,
    pub features: BTreeMap<String, f64>,
    pub max_possible_score: f64,
    pub wave_phase: Option<String>,
    pub ml_probability: Option<f64>,
    pub blended_score: Option<f64>,
}

impl EngineResult {
    /// Build a result from aggregate scores, deriving final score, status and
    /// base confidence under `config`.
    pub fn from_scores(
        ticker: &str,
        total_score: f64,
        weighted_score: f64,
        penalty_score: f64,
        max_possible_score: f64,
        config: &Config,
    ) -> Self {
        let final_score = (weighted_score - penalty_score).clamp(0.0, max_possible_score);
        Self {
            ticker: ticker.to_string(),
            total_score,
            weighted_score,
            penalty_score,
            final_score,
            status: config.classify(final_score),
            confidence: config.base_confidence(final_score),
            module_scores: Vec::new(),
            notes: Vec::new(),
            reasons: Vec::new(),
            warnings: Vec::new(),
            penalties: Vec::new(),
            features: BTreeMap::new(),
            max_possible_score,
            wave_phase: None,
            ml_probability: None,
            blended_score: None,
        }
    }

    /// Final score as a percentage of the maximum possible score.
    pub fn score_pct(&self) -> f64 {
        if self.max_possible_score > 0.0 {
            self.final_score / self.max_possible_score * 100.0
        } else {
            0.0
        }
    }

    pub fn module(&self, name: &str) -> Option<&ModuleScore> {
        self.module_scores.iter().find(|m| m.module_name == name)
    }

    pub fn modules_active(&self) -> usize {
        self.module_scores.iter().filter(|m| m.score > 0.0).count()
    }
}

// ============================================================
// SCORE MODULE TRAIT
// ============================================================

/// One pluggable analyzer over a price window.
///
/// Implementors provide `evaluate`, which may bail out with `None` on any
/// numeric problem; `analyze` wraps it so callers always get a bounded score.
pub trait ScoreModule: Send + Sync {
    fn name(&self) -> &'static str;
    fn max_score(&self) -> f64;
    fn min_bars(&self) -> usize;
    /// Metadata keys exported as model features, in fixed order
    fn feature_keys(&self) -> &'static [&'static str];
    fn evaluate(&self, window: &PriceWindow) -> Option<ModuleScore>;

    fn analyze(&self, window: &PriceWindow) -> ModuleScore {
        if window.len() < self.min_bars() {
            return ModuleScore::empty(self.name(), self.max_score());
        }
        match self.evaluate(window) {
            Some(score) => {
                let mut checked = ModuleScore::new(self.name(), score.score, self.max_score());
                checked.status = score.status;
                checked.metadata = score.metadata;
                checked.signals = score.signals;
                checked.warnings = score.warnings;
                checked
            }
            None => {
                debug!(module = self.name(), bars = window.len(), "module degraded to zero score");
                ModuleScore::empty(self.name(), self.max_score())
            }
        }
    }

    fn validate_config(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================
// BUILTIN MODULES - generated via macro
// ============================================================

use modules::*;

/// Macro to generate BuiltinModule enum without boilerplate
macro_rules! define_builtin_modules {
    (
        $(
            $variant:ident($module:ty)
        ),* $(,)?
    ) => {
        /// All builtin modules - static dispatch, no vtable
        #[derive(Debug, Clone)]
        pub enum BuiltinModule {
            $($variant($module)),*
        }

        impl BuiltinModule {
            #[inline]
            pub fn analyze(&self, window: &PriceWindow) -> ModuleScore {
                match self {
                    $(Self::$variant(m) => ScoreModule::analyze(m, window)),*
                }
            }

            #[inline]
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant(m) => ScoreModule::name(m)),*
                }
            }

            #[inline]
            pub fn max_score(&self) -> f64 {
                match self {
                    $(Self::$variant(m) => ScoreModule::max_score(m)),*
                }
            }

            #[inline]
            pub fn min_bars(&self) -> usize {
                match self {
                    $(Self::$variant(m) => ScoreModule::min_bars(m)),*
                }
            }

            pub fn feature_keys(&self) -> &'static [&'static str] {
                match self {
                    $(Self::$variant(m) => ScoreModule::feature_keys(m)),*
                }
            }

            pub fn validate_config(&self) -> Result<()> {
                match self {
                    $(Self::$variant(m) => ScoreModule::validate_config(m)),*
                }
            }
        }
    };
}

define_builtin_modules! {
    Absorption(AbsorptionModule),
    Compression(CompressionModule),
    BbSqueeze(BbSqueezeModule),
    Elliott(ElliottModule),
    TimeProjection(TimeProjectionModule),
    AntiDistribution(AntiDistributionModule),
}

// ============================================================
// ENGINE
// ============================================================

/// Run a caller-supplied module. A panic inside it scores zero instead of
/// unwinding through `analyze` and the scan around it.
fn analyze_custom(module: &dyn ScoreModule, window: &PriceWindow) -> ModuleScore {
    match std::panic::catch_unwind(AssertUnwindSafe(|| module.analyze(window))) {
        Ok(score) => score,
        Err(_) => {
            warn!(module = module.name(), "custom module panicked, scored as zero");
            ModuleScore::empty(module.name(), module.max_score())
        }
    }
}

/// Scores price windows with the registered modules.
///
/// Stateless across calls: every `analyze` works only on its arguments, the
/// shared read-only config and the (optional) loaded model.
pub struct Engine {
    builtin: Vec<BuiltinModule>,
    custom: Vec<Box<dyn ScoreModule>>,
    config: Arc<Config>,
    extractor: FeatureExtractor,
    model: Arc<ModelSlot>,
    lazy_model_path: Option<PathBuf>,
    max_possible_score: f64,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Registered module names in scoring order (builtin first, then custom).
    pub fn module_names(&self) -> Vec<&'static str> {
        self.builtin
            .iter()
            .map(BuiltinModule::name)
            .chain(self.custom.iter().map(|m| m.name()))
            .collect()
    }

    pub fn max_possible_score(&self) -> f64 {
        self.max_possible_score
    }

    pub fn feature_extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn model_slot(&self) -> &ModelSlot {
        &self.model
    }

    /// Run one module over the window without aggregation.
    pub fn analyze_module(&self, name: &str, window: &PriceWindow) -> Option<ModuleScore> {
        if let Some(m) = self.builtin.iter().find(|m| m.name() == name) {
            return Some(m.analyze(window));
        }
        self.custom
            .iter()
            .find(|m| m.name() == name)
            .map(|m| analyze_custom(m.as_ref(), window))
    }

    /// Score a window. `None` means the window is shorter than
    /// `min_history_days`, which is not the same thing as a weak score.
    pub fn analyze(&self, ticker: &str, window: &PriceWindow) -> Option<EngineResult> {
        if window.len() < self.config.min_history_days {
            debug!(
                ticker,
                bars = window.len(),
                required = self.config.min_history_days,
                "insufficient history"
            );
            return None;
        }

        let module_scores: Vec<ModuleScore> = self
            .builtin
            .iter()
            .map(|m| m.analyze(window))
            .chain(self.custom.iter().map(|m| analyze_custom(m.as_ref(), window)))
            .collect();

        let total_score: f64 = module_scores.iter().map(|m| m.score).sum();
        let weighted_score: f64 = module_scores
            .iter()
            .map(|m| m.score * self.config.weight(&m.module_name))
            .sum();
        let (penalty_score, penalties) = self.compute_penalties(&module_scores);

        let mut result = EngineResult::from_scores(
            ticker,
            total_score,
            weighted_score,
            penalty_score,
            self.max_possible_score,
            &self.config,
        );
        result.penalties = penalties;

        for m in &module_scores {
            result.reasons.extend(
                m.signals
                    .iter()
                    .map(|s| format!("{}: {}", m.module_name, s)),
            );
            result.warnings.extend(
                m.warnings
                    .iter()
                    .map(|w| format!("{}: {}", m.module_name, w)),
            );
        }
        result.wave_phase = module_scores
            .iter()
            .find_map(|m| m.meta_str("wave_phase"))
            .map(str::to_string);
        result.module_scores = module_scores;

        match self.extractor.extract(&result) {
            Ok(vector) => {
                result.features = self.extractor.named(&vector);
                self.apply_overlay(&mut result, &vector);
            }
            Err(e) => warn!(ticker, error = %e, "feature extraction failed"),
        }

        Some(result)
    }

    /// Analyze already-fetched windows on the rayon pool. Output keeps input order.
    pub fn analyze_parallel<'a, I>(&self, windows: I) -> Vec<(String, Option<EngineResult>)>
    where
        I: IntoParallelIterator<Item = (&'a str, &'a PriceWindow)>,
    {
        windows
            .into_par_iter()
            .map(|(ticker, window)| (ticker.to_string(), self.analyze(ticker, window)))
            .collect()
    }

    /// Load a model artifact into this engine's slot. Returns `false` on any
    /// failure and leaves the slot as it was. A successful call replaces a
    /// model already in the slot; the engine itself never reloads.
    pub fn load_ml_model(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match overlay::load_model(path, &self.extractor) {
            Ok(model) => {
                self.model.install(model);
                info!(path = %path.display(), "learned model loaded");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "learned model unavailable, scoring rule-only");
                false
            }
        }
    }

    pub fn format_result(&self, result: &EngineResult, detailed: bool) -> String {
        report::format_result(result, detailed)
    }

    pub fn format_scan_results(&self, results: &[EngineResult]) -> String {
        report::format_scan_results(results)
    }

    // ===========================================
    // Internal helpers
    // ===========================================

    fn compute_penalties(&self, scores: &[ModuleScore]) -> (f64, Vec<String>) {
        let cfg = &self.config.penalties;
        let find = |name: &str| scores.iter().find(|m| m.module_name == name);
        let mut total = 0.0;
        let mut reasons = Vec::new();

        if let Some(anti) = find(ANTI_DISTRIBUTION) {
            let flagged = !anti.status && anti.metadata.contains_key("distribution_candles");
            let bullish_elsewhere = scores
                .iter()
                .any(|m| m.module_name != ANTI_DISTRIBUTION && m.status);
            if flagged && bullish_elsewhere && cfg.distribution_override > 0.0 {
                total += cfg.distribution_override;
                reasons.push(format!(
                    "Distribution detected against bullish modules (-{:.1})",
                    cfg.distribution_override
                ));
            }
        }

        let compressed = [COMPRESSION, BB_SQUEEZE]
            .iter()
            .filter_map(|n| find(n))
            .any(|m| m.status);
        if let Some(absorption) = find(ABSORPTION) {
            if compressed
                && absorption.fraction() < 0.25
                && cfg.compression_without_absorption > 0.0
            {
                total += cfg.compression_without_absorption;
                reasons.push(format!(
                    "Compression without accumulation (-{:.1})",
                    cfg.compression_without_absorption
                ));
            }
        }

        if let Some(violations) = find(ELLIOTT).and_then(|m| m.meta_f64("rule_violations")) {
            if violations > 0.0 && cfg.wave_violation > 0.0 {
                let amount = violations * cfg.wave_violation;
                total += amount;
                reasons.push(format!(
                    "{violations:.0} wave rule violation(s) (-{amount:.1})"
                ));
            }
        }

        (total, reasons)
    }

    fn apply_overlay(&self, result: &mut EngineResult, vector: &[f64]) {
        if let Some(path) = &self.lazy_model_path {
            if !self.model.is_loaded() && self.model.begin_lazy_load() {
                self.load_ml_model(path);
            }
        }
        let Some(model) = self.model.get() else {
            return;
        };
        let probability = match model.predict_probability(vector) {
            Ok(p) => p,
            Err(e) => {
                debug!(ticker = %result.ticker, error = %e, "overlay unavailable for this call");
                return;
            }
        };

        let expected = if result.max_possible_score > 0.0 {
            result.final_score / result.max_possible_score
        } else {
            0.0
        };
        let tolerance = self.config.confidence.ml_agreement_tolerance.get();
        if (probability - expected).abs() <= tolerance {
            result.confidence = result.confidence.upgrade();
            result.notes.push(format!(
                "Model agrees with rule-based score (p={probability:.2})"
            ));
        } else {
            result.confidence = result.confidence.downgrade();
            result.notes.push(format!(
                "Model disagrees with rule-based score (p={probability:.2}, expected {expected:.2})"
            ));
        }

        let w = self.config.ml_blend_weight.get();
        result.ml_probability = Some(probability);
        result.blended_score =
            Some((1.0 - w) * result.final_score + w * probability * result.max_possible_score);
    }

    fn validate(&self) -> Result<()> {
        self.config.validate()?;
        let mut seen = std::collections::BTreeSet::new();
        for name in self.module_names() {
            if !seen.insert(name) {
                return Err(SaptaError::InvalidConfig(format!(
                    "module {name} registered twice"
                )));
            }
        }
        for name in self.config.weights.keys() {
            if !seen.contains(name.as_str()) {
                return Err(SaptaError::InvalidConfig(format!(
                    "weight given for unknown module {name}"
                )));
            }
        }
        for m in &self.builtin {
            m.validate_config()?;
        }
        for m in &self.custom {
            m.validate_config()?;
        }
        Ok(())
    }
}

// ============================================================
// BUILDER
// ============================================================

/// Builder for creating Engine instances
pub struct EngineBuilder {
    builtin: Vec<BuiltinModule>,
    custom: Vec<Box<dyn ScoreModule>>,
    config: Config,
    model: Option<Arc<ModelSlot>>,
    lazy_model_path: Option<PathBuf>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate an array of `BuiltinModule` variants using `Default::default()` for each inner type.
macro_rules! builtin_defaults {
  ($($variant:ident),* $(,)?) => {
    [$(BuiltinModule::$variant(Default::default())),*]
  };
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            builtin: Vec::new(),
            custom: Vec::new(),
            config: Config::default(),
            model: None,
            lazy_model_path: None,
        }
    }

    /// Register the six standard modules in their canonical order
    pub fn with_default_modules(mut self) -> Self {
        self.builtin.extend(builtin_defaults![
            Absorption,
            Compression,
            BbSqueeze,
            Elliott,
            TimeProjection,
            AntiDistribution,
        ]);
        self
    }

    /// Add a builtin module
    #[allow(clippy::should_implement_trait)]
    pub fn add(mut self, module: BuiltinModule) -> Self {
        self.builtin.push(module);
        self
    }

    /// Add with config validation
    pub fn add_checked(mut self, module: BuiltinModule) -> Result<Self> {
        module.validate_config()?;
        self.builtin.push(module);
        Ok(self)
    }

    /// Add a custom module (scored after all builtin modules). A panic in
    /// the module is caught and scored as zero, like any other module failure.
    pub fn add_custom<M: ScoreModule + 'static>(mut self, module: M) -> Self {
        self.custom.push(Box::new(module));
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a private model slot instead of the process-wide one
    pub fn model_slot(mut self, slot: Arc<ModelSlot>) -> Self {
        self.model = Some(slot);
        self
    }

    /// Try loading this artifact once, on the first `analyze` call
    pub fn lazy_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.lazy_model_path = Some(path.into());
        self
    }

    /// Build the engine
    pub fn build(mut self) -> Result<Engine> {
        let target_days = Period::new(self.config.target_days)?;
        for module in &mut self.builtin {
            if let BuiltinModule::TimeProjection(m) = module {
                m.seed_target_days(target_days);
            }
        }

        let mut layout: Vec<(&'static str, &'static [&'static str])> = self
            .builtin
            .iter()
            .map(|m| (m.name(), m.feature_keys()))
            .collect();
        layout.extend(self.custom.iter().map(|m| (m.name(), m.feature_keys())));

        let max_possible_score = self
            .builtin
            .iter()
            .map(BuiltinModule::max_score)
            .chain(self.custom.iter().map(|m| m.max_score()))
            .sum();

        let engine = Engine {
            builtin: self.builtin,
            custom: self.custom,
            config: Arc::new(self.config),
            extractor: FeatureExtractor::new(&layout),
            model: self.model.unwrap_or_else(ModelSlot::global),
            lazy_model_path: self.lazy_model_path,
            max_possible_score,
        };
        engine.validate()?;
        Ok(engine)
    }
}

// ============================================================
// TESTS
// ============================================================
