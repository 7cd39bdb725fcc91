//! Learned-model overlay
//!
//! An optional tree-ensemble classifier that refines confidence on top of the
//! rule-based score. The model never decides status; when it is missing or
//! fails, the engine simply scores rule-only.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

pub mod features;
pub mod importance;
pub mod model;

pub use features::{FeatureExtractor, AGGREGATE_FEATURES};
pub use model::{Tree, TreeEnsemble};

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("cannot read model artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed model artifact: {0}")]
    Format(String),

    #[error("feature mismatch at position {position}: expected {expected}, found {found}")]
    FeatureMismatch {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("expected {expected} values, got {found}")]
    Shape { expected: usize, found: usize },

    #[error("model produced a non-finite probability")]
    NonFinite,
}

impl From<serde_json::Error> for OverlayError {
    fn from(e: serde_json::Error) -> Self {
        OverlayError::Format(e.to_string())
    }
}

/// Read, validate and feature-check a model artifact.
pub fn load_model(path: &Path, extractor: &FeatureExtractor) -> Result<TreeEnsemble, OverlayError> {
    let text = std::fs::read_to_string(path)?;
    let model = TreeEnsemble::from_json_str(&text)?;
    extractor.check_names(&model.feature_names)?;
    Ok(model)
}

// ============================================================
// MODEL SLOT
// ============================================================

/// Holder for the loaded model. Readers clone the inner `Arc` and never
/// block each other.
#[derive(Debug, Default)]
pub struct ModelSlot {
    model: RwLock<Option<Arc<TreeEnsemble>>>,
    lazy_attempted: AtomicBool,
}

static GLOBAL_SLOT: OnceLock<Arc<ModelSlot>> = OnceLock::new();

impl ModelSlot {
    pub const fn new() -> Self {
        Self {
            model: RwLock::new(None),
            lazy_attempted: AtomicBool::new(false),
        }
    }

    /// The process-wide slot shared by engines built without a private one.
    pub fn global() -> Arc<ModelSlot> {
        Arc::clone(GLOBAL_SLOT.get_or_init(|| Arc::new(ModelSlot::new())))
    }

    pub fn get(&self) -> Option<Arc<TreeEnsemble>> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.get().is_some()
    }

    /// Replace whatever model the slot holds. Lazy loading only fills an
    /// empty slot, so this is the one way a loaded model changes.
    pub fn install(&self, model: TreeEnsemble) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(model));
    }

    /// Claims the single lazy-load attempt. Returns `true` for exactly one caller.
    pub fn begin_lazy_load(&self) -> bool {
        !self.lazy_attempted.swap(true, Ordering::AcqRel)
    }

    /// Drop the model and re-arm lazy loading.
    pub fn reset(&self) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.lazy_attempted.store(false, Ordering::Release);
    }
}
