//! Score modules
//!
//! Six independent analyzers over a price window. Each returns a bounded
//! [`ModuleScore`](crate::ModuleScore); their maxima sum to 100.
//!
//! | Module              | Max | Looks for                                   |
//! |---------------------|-----|---------------------------------------------|
//! | `absorption`        | 20  | volume-backed accumulation above support    |
//! | `compression`       | 15  | shrinking ATR and range, small bodies       |
//! | `bb_squeeze`        | 15  | Bollinger width at a historical low         |
//! | `elliott`           | 20  | corrective position inside an uptrend       |
//! | `time_projection`   | 15  | Fibonacci day counts since the last low     |
//! | `anti_distribution` | 15  | absence of distribution (deduction-based)   |

pub mod helpers;

/// Generate `with_defaults()` -> `Self::default()` for multiple module types.
macro_rules! impl_with_defaults {
  ($($module:ty),* $(,)?) => {
    $(impl $module {
      pub fn with_defaults() -> Self { Self::default() }
    })*
  };
}

pub mod absorption;
pub mod anti_distribution;
pub mod bb_squeeze;
pub mod compression;
pub mod elliott;
pub mod time_projection;

pub use absorption::*;
pub use anti_distribution::*;
pub use bb_squeeze::*;
pub use compression::*;
pub use elliott::*;
pub use time_projection::*;

pub const ABSORPTION: &str = "absorption";
pub const COMPRESSION: &str = "compression";
pub const BB_SQUEEZE: &str = "bb_squeeze";
pub const ELLIOTT: &str = "elliott";
pub const TIME_PROJECTION: &str = "time_projection";
pub const ANTI_DISTRIBUTION: &str = "anti_distribution";

/// Canonical registration order of the builtin modules.
pub const DEFAULT_MODULE_NAMES: [&str; 6] = [
    ABSORPTION,
    COMPRESSION,
    BB_SQUEEZE,
    ELLIOTT,
    TIME_PROJECTION,
    ANTI_DISTRIBUTION,
];
