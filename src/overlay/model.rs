//! Gradient-boosted tree ensemble stored as JSON.
//!
//! Each tree is a flat node table. Child indices `>= 0` point at another
//! internal node, negative ones at leaf `-(c + 1)` (that is `!c`).

use serde::{Deserialize, Serialize};

use super::OverlayError;

fn one() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub split_feature: Vec<usize>,
    pub threshold: Vec<f64>,
    pub left_child: Vec<i32>,
    pub right_child: Vec<i32>,
    pub leaf_value: Vec<f64>,
    #[serde(default = "one")]
    pub shrinkage: f64,
}

impl Tree {
    fn validate(&self, index: usize, feature_count: usize) -> Result<(), OverlayError> {
        let internal = self.split_feature.len();
        if self.threshold.len() != internal
            || self.left_child.len() != internal
            || self.right_child.len() != internal
        {
            return Err(OverlayError::Format(format!(
                "tree {index}: split/threshold/child lengths differ"
            )));
        }
        if self.leaf_value.is_empty() {
            return Err(OverlayError::Format(format!("tree {index}: no leaves")));
        }
        if !self.shrinkage.is_finite()
            || self.threshold.iter().chain(&self.leaf_value).any(|v| v.is_nan())
        {
            return Err(OverlayError::Format(format!("tree {index}: non-finite values")));
        }
        if let Some(f) = self.split_feature.iter().find(|f| **f >= feature_count) {
            return Err(OverlayError::Format(format!(
                "tree {index}: split on feature {f} of {feature_count}"
            )));
        }
        for (node, child) in self
            .left_child
            .iter()
            .chain(&self.right_child)
            .enumerate()
            .map(|(i, c)| (i % internal.max(1), *c))
        {
            let ok = if child < 0 {
                ((!child) as usize) < self.leaf_value.len()
            } else {
                // Internal children must be numbered after their parent.
                (child as usize) < internal && child as usize > node
            };
            if !ok {
                return Err(OverlayError::Format(format!(
                    "tree {index}: node {node} has invalid child {child}"
                )));
            }
        }
        Ok(())
    }

    /// `None` only for a table that would fail `validate`.
    fn predict(&self, features: &[f64]) -> Option<f64> {
        if self.split_feature.is_empty() {
            return Some(self.leaf_value.first()? * self.shrinkage);
        }
        let mut node = 0usize;
        for _ in 0..self.split_feature.len() {
            let value = *features.get(*self.split_feature.get(node)?)?;
            let child = if value <= *self.threshold.get(node)? {
                *self.left_child.get(node)?
            } else {
                *self.right_child.get(node)?
            };
            if child < 0 {
                return Some(self.leaf_value.get((!child) as usize)? * self.shrinkage);
            }
            node = child as usize;
        }
        None
    }
}

/// Binary classifier: `probability = 1 / (1 + exp(-sigmoid * (base + Σ trees)))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub feature_names: Vec<String>,
    pub trees: Vec<Tree>,
    #[serde(default)]
    pub base_score: f64,
    #[serde(default = "one")]
    pub sigmoid: f64,
    #[serde(default)]
    pub feature_importances: Option<Vec<f64>>,
}

impl TreeEnsemble {
    pub fn from_json_str(text: &str) -> Result<Self, OverlayError> {
        let model: TreeEnsemble = serde_json::from_str(text)?;
        model.validate()?;
        Ok(model)
    }

    pub fn feature_count(&self) -> usize {
        self.feature_names.len()
    }

    /// Structural checks; a model that passes can be evaluated without
    /// out-of-bounds access or endless traversal.
    pub fn validate(&self) -> Result<(), OverlayError> {
        if self.feature_names.is_empty() {
            return Err(OverlayError::Format("model lists no features".into()));
        }
        if !self.base_score.is_finite() || !self.sigmoid.is_finite() {
            return Err(OverlayError::Format("base_score and sigmoid must be finite".into()));
        }
        if let Some(imp) = &self.feature_importances {
            if imp.len() != self.feature_names.len() {
                return Err(OverlayError::Format(format!(
                    "{} importances for {} features",
                    imp.len(),
                    self.feature_names.len()
                )));
            }
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(i, self.feature_count())?;
        }
        Ok(())
    }

    pub fn raw_score(&self, features: &[f64]) -> Result<f64, OverlayError> {
        if features.len() != self.feature_count() {
            return Err(OverlayError::Shape {
                expected: self.feature_count(),
                found: features.len(),
            });
        }
        let mut sum = self.base_score;
        for (i, tree) in self.trees.iter().enumerate() {
            sum += tree
                .predict(features)
                .ok_or_else(|| OverlayError::Format(format!("tree {i} is not traversable")))?;
        }
        Ok(sum)
    }

    pub fn predict_probability(&self, features: &[f64]) -> Result<f64, OverlayError> {
        let logit = self.raw_score(features)? * self.sigmoid;
        let p = 1.0 / (1.0 + (-logit).exp());
        if !p.is_finite() {
            return Err(OverlayError::NonFinite);
        }
        Ok(p.clamp(0.0, 1.0))
    }
}
