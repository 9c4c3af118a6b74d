//! Run configuration, loaded from JSON and validated before any worker starts.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{ImageShape, Intrinsics};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("capture mode '{0}' is not supported")]
    UnsupportedMode(Mode),
    #[error("optimizing intrinsics together with prior scales and poses is ill-posed; disable store.opt_intr or store.optimize_scales")]
    IntrinsicsWithScales,
    #[error("mapping with non-keyframes requires mapping.refinement_iters > 0")]
    NonKeyframesWithoutRefinement,
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Input modality. Depth is only forwarded to the optimizer in the depth modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Mono,
    Rgbd,
    /// Monocular with an external (predicted) depth prior.
    Prgbd,
    Stereo,
}

impl Mode {
    pub fn uses_depth(&self) -> bool {
        matches!(self, Mode::Rgbd | Mode::Prgbd)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mode::Mono => "mono",
            Mode::Rgbd => "rgbd",
            Mode::Prgbd => "prgbd",
            Mode::Stereo => "stereo",
        };
        write!(f, "{}", name)
    }
}

/// Keyframe store layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of keyframes.
    pub buffer: usize,
    pub height: usize,
    pub width: usize,
    /// Optimize intrinsics (unsupported together with prior scales).
    pub opt_intr: bool,
    /// Optimize per-frame prior scale/shift in prgbd mode.
    pub optimize_scales: bool,
    /// Disparity for new keyframes without a usable prior.
    pub initial_disparity: f64,
    /// Per-pixel structure damping (eta) of new keyframes.
    pub damping: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            buffer: 512,
            height: 24,
            width: 32,
            opt_intr: false,
            optimize_scales: false,
            initial_disparity: 1.0,
            damping: 1e-6,
        }
    }
}

impl StoreConfig {
    pub fn shape(&self) -> ImageShape {
        ImageShape::new(self.height, self.width)
    }
}

/// Local optimization run by the tracking front end on each new keyframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Number of most recent keyframes optimized.
    pub window: usize,
    pub iters: usize,
    /// Edges connect keyframes at most this far apart.
    pub edge_radius: usize,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            window: 5,
            iters: 4,
            edge_radius: 2,
        }
    }
}

/// Windowed global optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Number of most recent keyframes in the sliding window.
    pub window: usize,
    /// Correspondence refreshes per cycle.
    pub steps: usize,
    /// Solver iterations per refresh.
    pub iters: usize,
    pub lm: f64,
    pub ep: f64,
    /// Prior weight; each variant's default when unset.
    pub alpha: Option<f64>,
    pub edge_radius: usize,
    /// Run full-range refinement after tracking finished.
    pub do_refinement: bool,
    pub refinement_passes: usize,
    pub refinement_steps: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            window: 25,
            steps: 2,
            iters: 4,
            lm: 1e-4,
            ep: 0.1,
            alpha: None,
            edge_radius: 3,
            do_refinement: true,
            refinement_passes: 2,
            refinement_steps: 6,
        }
    }
}

/// Dense mapping stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Also map frames that were not selected as keyframes.
    pub use_non_keyframes: bool,
    /// Frames re-fused per final refinement pass.
    pub refinement_iters: usize,
    /// Pixel sampling stride of the dense map.
    pub stride: usize,
    /// Frames fused per normal mapping step.
    pub batch: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            use_non_keyframes: false,
            refinement_iters: 0,
            stride: 2,
            batch: 4,
        }
    }
}

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub mode: Mode,
    pub run_backend: bool,
    pub run_mapping: bool,
    pub run_visualization: bool,
    pub run_mapping_gui: bool,
    pub show_stream: bool,
    pub evaluate: bool,
    /// Pause between backend cycles.
    pub sleep_delay_ms: u64,
    /// First frame index fed to tracking.
    pub t_start: usize,
    /// Tracking stops after this frame index.
    pub t_stop: Option<usize>,
    /// Backend is torn down above this used-memory fraction.
    pub max_ram_usage: f64,
    /// Backend is rebuilt at or below this used-memory fraction.
    pub min_ram_usage: f64,
    pub intrinsics: Intrinsics,
    pub store: StoreConfig,
    pub frontend: FrontendConfig,
    pub backend: BackendConfig,
    pub mapping: MappingConfig,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Mono,
            run_backend: true,
            run_mapping: true,
            run_visualization: false,
            run_mapping_gui: false,
            show_stream: false,
            evaluate: false,
            sleep_delay_ms: 3000,
            t_start: 0,
            t_stop: None,
            max_ram_usage: 0.9,
            min_ram_usage: 0.5,
            intrinsics: Intrinsics::new(24.0, 24.0, 15.5, 11.5),
            store: StoreConfig::default(),
            frontend: FrontendConfig::default(),
            backend: BackendConfig::default(),
            mapping: MappingConfig::default(),
        }
    }
}

impl SlamConfig {
    /// Load and validate a JSON config. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject ill-posed or unsupported combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == Mode::Stereo {
            return Err(ConfigError::UnsupportedMode(self.mode));
        }
        if self.mode == Mode::Prgbd && self.store.optimize_scales && self.store.opt_intr {
            return Err(ConfigError::IntrinsicsWithScales);
        }
        if self.run_mapping && self.mapping.use_non_keyframes && self.mapping.refinement_iters == 0 {
            return Err(ConfigError::NonKeyframesWithoutRefinement);
        }

        for (field, value) in [("max_ram_usage", self.max_ram_usage), ("min_ram_usage", self.min_ram_usage)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("{} is not in (0, 1]", value),
                });
            }
        }
        if self.min_ram_usage > self.max_ram_usage {
            return Err(ConfigError::InvalidValue {
                field: "min_ram_usage",
                reason: format!("{} exceeds max_ram_usage {}", self.min_ram_usage, self.max_ram_usage),
            });
        }
        if self.store.height == 0 || self.store.width == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store",
                reason: "image shape must be non-empty".to_string(),
            });
        }
        if self.store.initial_disparity <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "store.initial_disparity",
                reason: "must be positive".to_string(),
            });
        }
        for (field, value) in [
            ("frontend.window", self.frontend.window),
            ("frontend.iters", self.frontend.iters),
            ("backend.window", self.backend.window),
            ("backend.steps", self.backend.steps),
            ("backend.iters", self.backend.iters),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        for (field, value) in [("backend.lm", self.backend.lm), ("backend.ep", self.backend.ep)] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("{} is not a finite non-negative damping", value),
                });
            }
        }
        if self.mapping.stride == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mapping.stride",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(t_stop) = self.t_stop {
            if t_stop < self.t_start {
                return Err(ConfigError::InvalidValue {
                    field: "t_stop",
                    reason: format!("{} is before t_start {}", t_stop, self.t_start),
                });
            }
        }
        Ok(())
    }

    /// The mapping GUI only runs with mapping enabled and outside evaluation.
    pub fn mapping_gui_enabled(&self) -> bool {
        self.run_mapping_gui && self.run_mapping && !self.evaluate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SlamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_ram_usage, 0.9);
        assert_eq!(config.min_ram_usage, 0.5);
        assert_eq!(config.backend.refinement_passes, 2);
        assert_eq!(config.backend.refinement_steps, 6);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SlamConfig::from_json(r#"{ "mode": "rgbd", "backend": { "window": 8 } }"#).unwrap();
        assert_eq!(config.mode, Mode::Rgbd);
        assert_eq!(config.backend.window, 8);
        assert_eq!(config.backend.iters, 4);
        assert!(config.run_backend);
    }

    #[test]
    fn test_stereo_is_rejected() {
        let err = SlamConfig::from_json(r#"{ "mode": "stereo" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedMode(Mode::Stereo)));
    }

    #[test]
    fn test_intrinsics_with_scales_is_rejected() {
        let mut config = SlamConfig {
            mode: Mode::Prgbd,
            ..SlamConfig::default()
        };
        config.store.optimize_scales = true;
        config.store.opt_intr = true;
        assert!(matches!(config.validate(), Err(ConfigError::IntrinsicsWithScales)));

        // Fine in rgbd mode, where scales are never optimized.
        config.mode = Mode::Rgbd;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_non_keyframes_require_refinement() {
        let mut config = SlamConfig::default();
        config.mapping.use_non_keyframes = true;
        assert!(matches!(config.validate(), Err(ConfigError::NonKeyframesWithoutRefinement)));

        config.mapping.refinement_iters = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ram_thresholds_are_ordered() {
        let config = SlamConfig {
            max_ram_usage: 0.4,
            min_ram_usage: 0.6,
            ..SlamConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "min_ram_usage", .. })
        ));
    }

    #[test]
    fn test_empty_windows_are_rejected_at_startup() {
        let mut config = SlamConfig::default();
        config.backend.window = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "backend.window", .. })
        ));

        let mut config = SlamConfig::default();
        config.frontend.window = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "frontend.window", .. })
        ));

        let err = SlamConfig::from_json(r#"{ "backend": { "steps": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "backend.steps", .. }));
    }

    #[test]
    fn test_negative_damping_is_rejected() {
        let mut config = SlamConfig::default();
        config.backend.lm = -1e-4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "backend.lm", .. })
        ));
    }

    #[test]
    fn test_unknown_mode_fails_to_parse() {
        assert!(matches!(
            SlamConfig::from_json(r#"{ "mode": "lidar" }"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
