//! Parameter metadata for score modules
//!
//! This module describes the tunable knobs of each analyzer, enabling:
//! - Grid search over lookbacks and ratios
//! - Parameter documentation
//! - Construction of modules from loose key/value maps
//!
//! # Example
//!
//! ```rust
//! use sapta::params::{ParamMeta, ParamType, ParameterizedModule};
//! use sapta::prelude::*;
//!
//! let params = BbSqueezeModule::param_meta();
//! for param in params {
//!     println!("{}: {:?} (default: {})", param.name, param.param_type, param.default);
//! }
//! ```

use std::collections::HashMap;

use crate::{Period, Ratio, Result, SaptaError};

// ============================================================
// PARAMETER TYPES
// ============================================================

/// Type of parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
  /// Ratio value (0.0..=1.0)
  Ratio,
  /// Period value (positive integer)
  Period,
  /// Unbounded positive multiplier (e.g. Bollinger band width in std-devs)
  Factor,
}

/// Metadata for a single module parameter
#[derive(Debug, Clone)]
pub struct ParamMeta {
  /// Parameter name (e.g., "bb_period")
  pub name: &'static str,
  pub param_type: ParamType,
  pub default: f64,
  /// Range for optimization: (min, max, step)
  pub range: (f64, f64, f64),
  pub description: &'static str,
}

impl ParamMeta {
  pub const fn ratio(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Ratio, default, range, description }
  }

  pub const fn period(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Period, default, range, description }
  }

  pub const fn factor(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Factor, default, range, description }
  }

  /// Generate all values for grid search. Empty when the step is not
  /// positive or the range is not finite.
  pub fn generate_grid(&self) -> Vec<f64> {
    let (min, max, step) = self.range;
    let mut values = Vec::new();
    if step <= 0.0 || !step.is_finite() || !min.is_finite() || !max.is_finite() {
      return values;
    }
    let mut i = 0usize;
    loop {
      let v = min + step * i as f64;
      if v > max + 1e-9 {
        break;
      }
      values.push(v);
      i += 1;
    }
    values
  }

  /// Validate a value for this parameter
  pub fn validate(&self, value: f64) -> Result<()> {
    let (min, max, _) = self.range;
    if !value.is_finite() || value < min - 1e-9 || value > max + 1e-9 {
      return Err(SaptaError::OutOfRange { field: self.name, value, min, max });
    }
    match self.param_type {
      ParamType::Ratio => Ratio::new(value).map(|_| ()),
      ParamType::Period => {
        if value < 1.0 || value.fract() != 0.0 {
          return Err(SaptaError::InvalidValue("Period must be a positive integer"));
        }
        Ok(())
      },
      ParamType::Factor => {
        if value <= 0.0 {
          return Err(SaptaError::InvalidValue("Factor must be positive"));
        }
        Ok(())
      },
    }
  }
}

// ============================================================
// PARAMETERIZED MODULE TRAIT
// ============================================================

/// Trait for modules that expose tunable parameters
pub trait ParameterizedModule: Sized {
  /// Returns metadata for all configurable parameters
  fn param_meta() -> &'static [ParamMeta];

  /// Creates a module with parameters from a HashMap
  ///
  /// Missing parameters use their default values.
  fn with_params(params: &HashMap<&str, f64>) -> Result<Self>;

  fn module_name() -> &'static str;

  /// Validates every supplied key and value before construction
  fn with_params_checked(params: &HashMap<&str, f64>) -> Result<Self> {
    let meta = Self::param_meta();
    for (key, value) in params {
      let m = meta.iter().find(|m| m.name == *key).ok_or_else(|| {
        SaptaError::InvalidConfig(format!("unknown parameter {key} for {}", Self::module_name()))
      })?;
      m.validate(*value)?;
    }
    Self::with_params(params)
  }
}

// ============================================================
// PARAMETER VALUE HELPERS
// ============================================================

/// Helper to get a Ratio from params with default fallback
pub fn get_ratio(params: &HashMap<&str, f64>, key: &str, default: f64) -> Result<Ratio> {
  let value = params.get(key).copied().unwrap_or(default);
  Ratio::new(value)
}

/// Helper to get a Period from params with default fallback
pub fn get_period(params: &HashMap<&str, f64>, key: &str, default: usize) -> Result<Period> {
  let value = params.get(key).copied().unwrap_or(default as f64);
  if value < 0.0 || value.fract() != 0.0 {
    return Err(SaptaError::InvalidValue("Period must be a positive integer"));
  }
  Period::new(value as usize)
}

/// Helper to get a positive factor from params with default fallback
pub fn get_factor(params: &HashMap<&str, f64>, key: &str, default: f64) -> Result<f64> {
  let value = params.get(key).copied().unwrap_or(default);
  if !value.is_finite() || value <= 0.0 {
    return Err(SaptaError::InvalidValue("Factor must be positive and finite"));
  }
  Ok(value)
}

// ============================================================
// TESTS
// ============================================================
