//! Offline calibration helpers: feature importance grouped by module and a
//! sanity report on the status thresholds. Read-only; nothing here writes
//! to disk.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{features::AGGREGATE_FEATURES, OverlayError, TreeEnsemble};
use crate::Config;

const TOP_FEATURES: usize = 15;
const RULE: &str = "============================================================";
const THIN_RULE: &str = "------------------------------------------------------------";

pub const MODULE_DESCRIPTIONS: &[(&str, &str)] = &[
    ("absorption", "Supply Absorption - smart money accumulation"),
    ("compression", "Compression - volatility contraction"),
    ("bb_squeeze", "BB Squeeze - Bollinger band squeeze"),
    ("elliott", "Elliott Wave - wave position and Fibonacci"),
    ("time_projection", "Time Projection - Fibonacci time windows"),
    ("anti_distribution", "Anti-Distribution - distribution filter"),
];

pub const FEATURE_DESCRIPTIONS: &[(&str, &str)] = &[
    ("absorption_score", "Raw absorption score (0-20)"),
    ("absorption_score_pct", "Absorption score as percent of max"),
    ("absorption_volume_spike_ratio", "Recent volume vs baseline average"),
    ("absorption_price_held", "Share of closes above support"),
    ("absorption_higher_lows_count", "Consecutive rising swing lows"),
    ("absorption_avg_close_strength", "Mean close position in bar range"),
    ("compression_score", "Raw compression score (0-15)"),
    ("compression_score_pct", "Compression score as percent of max"),
    ("compression_atr_slope", "ATR change, negative when contracting"),
    ("compression_range_contraction", "Recent range over prior range"),
    ("compression_higher_lows", "Higher lows (1 = yes)"),
    ("compression_lower_highs", "Lower highs (1 = yes)"),
    ("compression_avg_body_ratio", "Mean body to range ratio"),
    ("bb_squeeze_score", "Raw squeeze score (0-15)"),
    ("bb_squeeze_score_pct", "Squeeze score as percent of max"),
    ("bb_squeeze_bb_width_current", "Current band width"),
    ("bb_squeeze_bb_width_percentile", "Band width percentile, lower is tighter"),
    ("bb_squeeze_squeeze_duration", "Bars spent in squeeze"),
    ("bb_squeeze_price_position_in_bb", "Close position inside the bands"),
    ("elliott_score", "Raw wave score (0-20)"),
    ("elliott_score_pct", "Wave score as percent of max"),
    ("elliott_fib_retracement", "Retracement of the last swing"),
    ("elliott_trend_context", "SMA50 vs SMA100 (+1/0/-1)"),
    ("elliott_abc_pattern", "ABC correction present"),
    ("elliott_rule_violations", "Broken wave rules"),
    ("elliott_rsi_divergence", "Bullish RSI divergence present"),
    ("time_projection_score", "Raw time score (0-15)"),
    ("time_projection_score_pct", "Time score as percent of max"),
    ("time_projection_days_since_low", "Bars since the window low"),
    ("time_projection_in_fib_window", "Closeness to a Fibonacci count"),
    ("time_projection_lunar_phase", "Lunar phase of the last bar"),
    ("anti_distribution_score", "Raw anti-distribution score (0-15)"),
    ("anti_distribution_score_pct", "Anti-distribution score as percent of max"),
    ("anti_distribution_distribution_candles", "Heavy down candles"),
    ("anti_distribution_false_breakout", "Failed breakout share"),
    ("anti_distribution_obv_divergence", "OBV vs price direction"),
    ("total_score", "Sum of raw module scores"),
    ("weighted_score", "Weighted sum of module scores"),
    ("modules_active", "Modules with a positive score"),
    ("penalty_score", "Cross-module penalty total"),
];

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

pub fn feature_description(feature: &str) -> Option<&'static str> {
    lookup(FEATURE_DESCRIPTIONS, feature)
}

/// Group a feature belongs to: its module, `aggregate` or `other`.
/// Module names contain underscores, so the longest matching prefix wins.
pub fn feature_group(feature: &str) -> &'static str {
    if AGGREGATE_FEATURES.contains(&feature) {
        return "aggregate";
    }
    MODULE_DESCRIPTIONS
        .iter()
        .map(|(m, _)| *m)
        .filter(|m| {
            feature
                .strip_prefix(m)
                .is_some_and(|rest| rest.starts_with('_'))
        })
        .max_by_key(|m| m.len())
        .unwrap_or("other")
}

// ============================================================
// FEATURE IMPORTANCE
// ============================================================

pub fn importances_from_model(model: &TreeEnsemble) -> Option<BTreeMap<String, f64>> {
    let values = model.feature_importances.as_ref()?;
    Some(model.feature_names.iter().cloned().zip(values.iter().copied()).collect())
}

/// Importances stored in a model artifact, or `None` if unreadable or absent.
pub fn load_importances(path: impl AsRef<Path>) -> Option<BTreeMap<String, f64>> {
    let path = path.as_ref();
    let read = || -> Result<TreeEnsemble, OverlayError> {
        TreeEnsemble::from_json_str(&std::fs::read_to_string(path)?)
    };
    match read() {
        Ok(model) => importances_from_model(&model),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot load feature importances");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
    pub description: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportanceAnalysis {
    pub top_features: Vec<(String, f64)>,
    /// Per group, features sorted by importance
    pub module_features: BTreeMap<String, Vec<FeatureImportance>>,
    /// Groups sorted by summed importance, highest first
    pub module_totals: Vec<(String, f64)>,
    pub total_features: usize,
}

fn by_importance(a: &(String, f64), b: &(String, f64)) -> std::cmp::Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

pub fn analyze_importance(importance: &BTreeMap<String, f64>) -> ImportanceAnalysis {
    let mut sorted: Vec<(String, f64)> =
        importance.iter().map(|(k, v)| (k.clone(), *v)).collect();
    sorted.sort_by(by_importance);

    let mut module_features: BTreeMap<String, Vec<FeatureImportance>> = BTreeMap::new();
    for (feature, value) in &sorted {
        module_features
            .entry(feature_group(feature).to_string())
            .or_default()
            .push(FeatureImportance {
                feature: feature.clone(),
                importance: *value,
                description: feature_description(feature).unwrap_or("No description"),
            });
    }

    let mut module_totals: Vec<(String, f64)> = module_features
        .iter()
        .map(|(m, fs)| (m.clone(), fs.iter().map(|f| f.importance).sum()))
        .collect();
    module_totals.sort_by(by_importance);

    ImportanceAnalysis {
        top_features: sorted.iter().take(TOP_FEATURES).cloned().collect(),
        module_features,
        module_totals,
        total_features: sorted.len(),
    }
}

pub fn format_importance_report(analysis: &ImportanceAnalysis) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{RULE}\nSAPTA Feature Importance Analysis\n{RULE}\n");

    let _ = writeln!(out, "TOP {TOP_FEATURES} FEATURES\n{THIN_RULE}");
    for (i, (feature, value)) in analysis.top_features.iter().enumerate() {
        let _ = writeln!(out, "{:2}. {feature:<40} {value:.4}", i + 1);
        if let Some(desc) = feature_description(feature) {
            let _ = writeln!(out, "    - {desc}");
        }
    }

    let _ = writeln!(out, "\nIMPORTANCE BY MODULE\n{THIN_RULE}");
    for (module, total) in &analysis.module_totals {
        let label = lookup(MODULE_DESCRIPTIONS, module).unwrap_or(module.as_str());
        let _ = writeln!(out, "{label:<45} {total:.4} ({:.1}%)", total * 100.0);
        for f in analysis.module_features.get(module).into_iter().flatten().take(3) {
            let _ = writeln!(out, "  + {:<40} {:.4}", f.feature, f.importance);
        }
    }

    let _ = writeln!(out, "\nRECOMMENDATIONS\n{THIN_RULE}");
    let low: Vec<_> = analysis.top_features.iter().filter(|f| f.1 < 0.01).take(5).collect();
    if !low.is_empty() {
        let _ = writeln!(out, "Low importance features (consider removing):");
        for (feature, value) in low {
            let _ = writeln!(out, "  - {feature} ({value:.4})");
        }
    }
    let high: Vec<_> = analysis.top_features.iter().filter(|f| f.1 > 0.05).take(5).collect();
    if !high.is_empty() {
        let _ = writeln!(out, "High importance features (focus on these):");
        for (feature, value) in high {
            let _ = writeln!(out, "  - {feature} ({value:.4})");
        }
    }
    let _ = write!(out, "\n{RULE}");
    out
}

// ============================================================
// THRESHOLDS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub pre_markup: f64,
    pub siap: f64,
    pub watchlist: f64,
}

impl From<&Config> for Thresholds {
    fn from(c: &Config) -> Self {
        Self {
            pre_markup: c.threshold_pre_markup,
            siap: c.threshold_siap,
            watchlist: c.threshold_watchlist,
        }
    }
}

/// Read `thresholds.json` (`{pre_markup, siap, watchlist}`).
pub fn load_thresholds(path: impl AsRef<Path>) -> Option<Thresholds> {
    let path = path.as_ref();
    let parsed = std::fs::read_to_string(path)
        .map_err(OverlayError::from)
        .and_then(|text| serde_json::from_str::<Thresholds>(&text).map_err(OverlayError::from));
    match parsed {
        Ok(t) => Some(t),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot load thresholds");
            None
        }
    }
}

pub fn analyze_thresholds(t: &Thresholds) -> String {
    let pre_range = 100.0 - t.pre_markup;
    let siap_range = t.pre_markup - t.siap;
    let watch_range = t.siap - t.watchlist;

    let mut out = String::new();
    let _ = writeln!(out, "{RULE}\nSAPTA Threshold Analysis\n{RULE}\n");
    let _ = writeln!(out, "CURRENT THRESHOLDS\n{THIN_RULE}");
    let _ = writeln!(out, "PRE-MARKUP:  score >= {:.1}", t.pre_markup);
    let _ = writeln!(out, "SIAP:        score >= {:.1}", t.siap);
    let _ = writeln!(out, "WATCHLIST:   score >= {:.1}\n", t.watchlist);

    let _ = writeln!(out, "SCORE RANGES\n{THIN_RULE}");
    let _ = writeln!(out, "PRE-MARKUP zone:  {:.1} - 100.0 ({pre_range:.1} range)", t.pre_markup);
    let _ = writeln!(
        out,
        "SIAP zone:        {:.1} - {:.1} ({siap_range:.1} range)",
        t.siap, t.pre_markup
    );
    let _ = writeln!(
        out,
        "WATCHLIST zone:   {:.1} - {:.1} ({watch_range:.1} range)",
        t.watchlist, t.siap
    );
    let _ = writeln!(out, "SKIP zone:        0 - {:.1} ({:.1} range)\n", t.watchlist, t.watchlist);

    let _ = writeln!(out, "BALANCE\n{THIN_RULE}");
    if pre_range < 10.0 {
        let _ = writeln!(out, "PRE-MARKUP zone is very tight (<10 range)");
        let _ = writeln!(out, "    Consider lowering pre_markup threshold");
    } else if pre_range > 30.0 {
        let _ = writeln!(out, "PRE-MARKUP zone is wide (>30 range)");
        let _ = writeln!(out, "    Consider raising pre_markup threshold");
    }
    if watch_range > 30.0 {
        let _ = writeln!(out, "WATCHLIST zone is very wide (>30 range)");
        let _ = writeln!(out, "    Consider lowering watchlist threshold");
    }

    let _ = writeln!(out, "\nRECOMMENDATIONS\n{THIN_RULE}");
    if pre_range < 15.0 {
        let _ = writeln!(out, "Lower PRE-MARKUP threshold by 5-10 points");
    }
    if watch_range > 40.0 {
        let _ = writeln!(out, "Raise WATCHLIST threshold by 10-15 points");
    }
    if (siap_range - watch_range).abs() > 20.0 {
        let _ = writeln!(out, "Balance SIAP and WATCHLIST zones");
    }
    let _ = write!(out, "{RULE}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_group_prefers_longest_module() {
        assert_eq!(feature_group("bb_squeeze_squeeze_duration"), "bb_squeeze");
        assert_eq!(feature_group("anti_distribution_score"), "anti_distribution");
        assert_eq!(feature_group("time_projection_lunar_phase"), "time_projection");
        assert_eq!(feature_group("modules_active"), "aggregate");
        assert_eq!(feature_group("mystery"), "other");
    }

    #[test]
    fn test_descriptions_cover_default_layout() {
        assert_eq!(FEATURE_DESCRIPTIONS.len(), 40);
    }

    #[test]
    fn test_analyze_importance_groups_and_sorts() {
        let mut imp = BTreeMap::new();
        imp.insert("absorption_score".to_string(), 0.3);
        imp.insert("absorption_price_held".to_string(), 0.1);
        imp.insert("elliott_score".to_string(), 0.25);
        imp.insert("penalty_score".to_string(), 0.005);
        let a = analyze_importance(&imp);

        assert_eq!(a.total_features, 4);
        assert_eq!(a.top_features[0].0, "absorption_score");
        assert_eq!(a.module_totals[0].0, "absorption");
        assert!((a.module_totals[0].1 - 0.4).abs() < 1e-12);
        assert_eq!(a.module_features["aggregate"].len(), 1);

        let report = format_importance_report(&a);
        assert!(report.contains("SAPTA Feature Importance Analysis"));
        assert!(report.contains("penalty_score (0.0050)"));
    }

    #[test]
    fn test_threshold_report_flags_tight_zone() {
        let t = Thresholds {
            pre_markup: 95.0,
            siap: 65.0,
            watchlist: 20.0,
        };
        let report = analyze_thresholds(&t);
        assert!(report.contains("very tight"));
        assert!(report.contains("WATCHLIST zone is very wide"));
        assert!(report.contains("Lower PRE-MARKUP threshold"));
        assert!(report.contains("Raise WATCHLIST threshold"));
    }

    #[test]
    fn test_default_thresholds_are_balanced() {
        let report = analyze_thresholds(&Thresholds::from(&Config::default()));
        assert!(!report.contains("very tight"));
        assert!(!report.contains("Balance SIAP"));
    }
}
