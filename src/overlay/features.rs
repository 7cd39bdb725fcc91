//! Flattens an engine result into the fixed-order vector the model was
//! trained on.

use std::collections::BTreeMap;

use super::OverlayError;
use crate::{EngineResult, ModuleScore};

pub const AGGREGATE_FEATURES: [&str; 4] =
    ["total_score", "weighted_score", "modules_active", "penalty_score"];

#[derive(Debug, Clone)]
struct ModuleLayout {
    name: &'static str,
    keys: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    layout: Vec<ModuleLayout>,
    names: Vec<String>,
}

impl FeatureExtractor {
    /// `modules` lists `(module name, metadata keys)` in registration order.
    pub fn new(modules: &[(&'static str, &'static [&'static str])]) -> Self {
        let layout: Vec<ModuleLayout> = modules
            .iter()
            .map(|&(name, keys)| ModuleLayout { name, keys })
            .collect();
        let mut names = Vec::new();
        for m in &layout {
            names.push(format!("{}_score", m.name));
            names.push(format!("{}_score_pct", m.name));
            names.extend(m.keys.iter().map(|k| format!("{}_{}", m.name, k)));
        }
        names.extend(AGGREGATE_FEATURES.iter().map(|s| s.to_string()));
        Self { layout, names }
    }

    pub fn feature_names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Fails on the first name that differs in value or position.
    pub fn check_names(&self, found: &[String]) -> Result<(), OverlayError> {
        for position in 0..self.names.len().max(found.len()) {
            let expected = self.names.get(position);
            let got = found.get(position);
            if expected != got {
                return Err(OverlayError::FeatureMismatch {
                    position,
                    expected: expected.cloned().unwrap_or_else(|| "<end>".into()),
                    found: got.cloned().unwrap_or_else(|| "<end>".into()),
                });
            }
        }
        Ok(())
    }

    pub fn extract_features(
        &self,
        module_scores: &[ModuleScore],
        total_score: f64,
        weighted_score: f64,
        penalty_score: f64,
    ) -> Result<Vec<f64>, OverlayError> {
        if module_scores.len() != self.layout.len() {
            return Err(OverlayError::Shape {
                expected: self.layout.len(),
                found: module_scores.len(),
            });
        }
        let mut out = Vec::with_capacity(self.names.len());
        for (position, (layout, score)) in self.layout.iter().zip(module_scores).enumerate() {
            if layout.name != score.module_name {
                return Err(OverlayError::FeatureMismatch {
                    position,
                    expected: layout.name.to_string(),
                    found: score.module_name.clone(),
                });
            }
            out.push(score.score);
            out.push(score.fraction() * 100.0);
            out.extend(layout.keys.iter().map(|k| score.meta_f64(k).unwrap_or(0.0)));
        }
        let active = module_scores.iter().filter(|m| m.score > 0.0).count();
        out.extend([total_score, weighted_score, active as f64, penalty_score]);
        Ok(out)
    }

    pub fn extract(&self, result: &EngineResult) -> Result<Vec<f64>, OverlayError> {
        self.extract_features(
            &result.module_scores,
            result.total_score,
            result.weighted_score,
            result.penalty_score,
        )
    }

    pub fn named(&self, vector: &[f64]) -> BTreeMap<String, f64> {
        self.names.iter().cloned().zip(vector.iter().copied()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FeatureExtractor {
        let modules: [(&'static str, &'static [&'static str]); 2] =
            [("alpha", &["x", "flag"]), ("beta", &[])];
        FeatureExtractor::new(&modules)
    }

    #[test]
    fn test_name_order() {
        let names = extractor().feature_names().to_vec();
        assert_eq!(
            names,
            vec![
                "alpha_score",
                "alpha_score_pct",
                "alpha_x",
                "alpha_flag",
                "beta_score",
                "beta_score_pct",
                "total_score",
                "weighted_score",
                "modules_active",
                "penalty_score",
            ]
        );
    }

    #[test]
    fn test_extract_encodes_missing_and_flags() {
        let mut alpha = ModuleScore::new("alpha", 5.0, 10.0);
        alpha.insert_meta("flag", true);
        let beta = ModuleScore::empty("beta", 5.0);
        let v = extractor()
            .extract_features(&[alpha, beta], 5.0, 6.0, 1.0)
            .unwrap();
        assert_eq!(v, vec![5.0, 50.0, 0.0, 1.0, 0.0, 0.0, 5.0, 6.0, 1.0, 1.0]);
    }

    #[test]
    fn test_module_order_mismatch() {
        let a = ModuleScore::empty("beta", 5.0);
        let b = ModuleScore::empty("alpha", 10.0);
        assert!(matches!(
            extractor().extract_features(&[a, b], 0.0, 0.0, 0.0),
            Err(OverlayError::FeatureMismatch { position: 0, .. })
        ));
    }

    #[test]
    fn test_check_names() {
        let ex = extractor();
        assert!(ex.check_names(ex.feature_names()).is_ok());
        let mut swapped = ex.feature_names().to_vec();
        swapped.swap(2, 3);
        assert!(matches!(
            ex.check_names(&swapped),
            Err(OverlayError::FeatureMismatch { position: 2, .. })
        ));
        let short = &ex.feature_names()[..4];
        assert!(ex.check_names(short).is_err());
    }
}
