//! Configuration types and loading for the preprocessing pipeline.
//!
//! This module provides the merged configuration consumed by the orchestrator
//! and the processing engines, a validation trait mirrored by every option
//! block, and a loader for TOML and JSON files with format detection by
//! extension. Validation failures always surface the offending key.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::errors::{Result, SpineError};
use crate::core::validation::{validate_finite, validate_range};

/// A trait for configuration blocks that can validate themselves.
///
/// Every option block implements this so that the top-level configuration can
/// validate before execution and surface the offending key on failure.
pub trait ConfigValidator {
    /// Validates the configuration block.
    fn validate(&self) -> Result<()>;

    /// Returns the recommended defaults for this block.
    fn get_defaults() -> Self
    where
        Self: Sized;
}

/// Motion-correction engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionEngine {
    /// Slice-wise correction via the slice-motion tool.
    #[serde(rename = "slice-wise")]
    SliceWise,
    /// Volume-wise rigid-body correction via the volume-motion tool.
    #[serde(rename = "rigid-3d")]
    Rigid3d,
    /// Slice-wise followed by rigid-3d, parameters summed component-wise.
    #[serde(rename = "hybrid")]
    Hybrid,
    /// Slice-wise over a concatenated motion group.
    #[serde(rename = "grouped")]
    Grouped,
}

impl std::fmt::Display for MotionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MotionEngine::SliceWise => "slice-wise",
            MotionEngine::Rigid3d => "rigid-3d",
            MotionEngine::Hybrid => "hybrid",
            MotionEngine::Grouped => "grouped",
        };
        write!(f, "{s}")
    }
}

/// Axis along which slices are acquired, for slice-wise engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceAxis {
    /// Left-right.
    X,
    /// Anterior-posterior.
    Y,
    /// Superior-inferior.
    Z,
}

impl std::fmt::Display for SliceAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SliceAxis::X => "x",
            SliceAxis::Y => "y",
            SliceAxis::Z => "z",
        };
        write!(f, "{s}")
    }
}

/// Where tissue masks come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskSource {
    /// Generated by the segmentation tool.
    Tool,
    /// Provided alongside the dataset.
    Provided,
    /// No masks; mask-consuming steps degrade gracefully.
    None,
}

/// Temporal crop detection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalCropOptions {
    /// Whether crop detection runs at all.
    pub enable: bool,
    /// Detection method identifier.
    pub method: String,
    /// Maximum number of volumes trimmed from the start.
    pub max_trim_start: usize,
    /// Maximum number of volumes trimmed from the end.
    pub max_trim_end: usize,
    /// Robust z-score threshold for outlier volumes.
    pub z_thresh: f64,
}

impl Default for TemporalCropOptions {
    fn default() -> Self {
        Self {
            enable: true,
            method: "cord_mean_robust_z".to_string(),
            max_trim_start: 10,
            max_trim_end: 10,
            z_thresh: 2.5,
        }
    }
}

impl ConfigValidator for TemporalCropOptions {
    fn validate(&self) -> Result<()> {
        if self.method != "cord_mean_robust_z" {
            return Err(SpineError::config(
                "options.temporal_crop.method",
                format!("unknown method '{}'", self.method),
            ));
        }
        validate_finite(self.z_thresh, "options.temporal_crop.z_thresh")?;
        validate_range(self.z_thresh, 0.0, 100.0, "options.temporal_crop.z_thresh")?;
        Ok(())
    }

    fn get_defaults() -> Self {
        Self::default()
    }
}

/// Motion-correction options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionOptions {
    /// Engine selection.
    pub engine: MotionEngine,
    /// Slice axis for slice-wise engines.
    pub slice_axis: SliceAxis,
    /// Grouping mode for the grouped engine: `none`, `subject`, `session`,
    /// or `session+task`.
    pub group_mode: String,
    /// Fields that must match within a motion group.
    pub require_same: Vec<String>,
}

impl Default for MotionOptions {
    fn default() -> Self {
        Self {
            engine: MotionEngine::Rigid3d,
            slice_axis: SliceAxis::Z,
            group_mode: "none".to_string(),
            require_same: vec!["task".to_string()],
        }
    }
}

impl ConfigValidator for MotionOptions {
    fn validate(&self) -> Result<()> {
        match self.group_mode.as_str() {
            "none" | "subject" | "session" | "session+task" => Ok(()),
            other => Err(SpineError::config(
                "options.motion.group_mode",
                format!("unknown grouping mode '{other}'"),
            )),
        }
    }

    fn get_defaults() -> Self {
        Self::default()
    }
}

/// Frame censoring options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CensorOptions {
    /// Whether censoring columns are computed.
    pub enable: bool,
    /// FD threshold in millimeters (strict `>`).
    pub fd_thresh_mm: f64,
    /// DVARS threshold (strict `>`).
    pub dvars_thresh: f64,
    /// Minimum length of a kept contiguous segment.
    pub min_contig_vols: usize,
    /// Symmetric padding around flagged volumes.
    pub pad_vols: usize,
}

impl Default for CensorOptions {
    fn default() -> Self {
        Self {
            enable: true,
            fd_thresh_mm: 0.5,
            dvars_thresh: 1.5,
            min_contig_vols: 5,
            pad_vols: 0,
        }
    }
}

impl ConfigValidator for CensorOptions {
    fn validate(&self) -> Result<()> {
        validate_finite(self.fd_thresh_mm, "options.censor.fd_thresh_mm")?;
        validate_finite(self.dvars_thresh, "options.censor.dvars_thresh")?;
        if self.min_contig_vols < 1 {
            return Err(SpineError::config(
                "options.censor.min_contig_vols",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    fn get_defaults() -> Self {
        Self::default()
    }
}

/// Anatomical CompCor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcompcorOptions {
    /// Whether aCompCor regressors are computed.
    pub enable: bool,
    /// Tissues, in output column order (e.g. `["cord", "wm", "csf"]`).
    pub tissues: Vec<String>,
    /// Maximum principal components per tissue.
    pub n_components_per_tissue: usize,
    /// High-pass cutoff in Hz applied before PCA (0 disables).
    pub highpass_hz: f64,
    /// Whether to linearly detrend voxel time series before PCA.
    pub detrend: bool,
    /// Whether to z-score each voxel time series before PCA.
    pub standardize: bool,
}

impl Default for AcompcorOptions {
    fn default() -> Self {
        Self {
            enable: true,
            tissues: vec!["cord".to_string(), "wm".to_string(), "csf".to_string()],
            n_components_per_tissue: 5,
            highpass_hz: 0.008,
            detrend: true,
            standardize: true,
        }
    }
}

impl ConfigValidator for AcompcorOptions {
    fn validate(&self) -> Result<()> {
        if self.enable && self.tissues.is_empty() {
            return Err(SpineError::config(
                "options.acompcor.tissues",
                "must name at least one tissue when enabled",
            ));
        }
        if self.n_components_per_tissue == 0 {
            return Err(SpineError::config(
                "options.acompcor.n_components_per_tissue",
                "must be at least 1",
            ));
        }
        validate_finite(self.highpass_hz, "options.acompcor.highpass_hz")?;
        validate_range(self.highpass_hz, 0.0, 10.0, "options.acompcor.highpass_hz")?;
        Ok(())
    }

    fn get_defaults() -> Self {
        Self::default()
    }
}

/// Tissue mask options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskOptions {
    /// Whether masks are produced and consumed at all.
    pub enable: bool,
    /// Mask provenance.
    pub source: MaskSource,
    /// Threshold for binarizing probabilistic masks.
    pub binarize_thr: f64,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            enable: true,
            source: MaskSource::Tool,
            binarize_thr: 0.5,
        }
    }
}

impl ConfigValidator for MaskOptions {
    fn validate(&self) -> Result<()> {
        validate_finite(self.binarize_thr, "options.masks.binarize_thr")?;
        validate_range(self.binarize_thr, 0.0, 1.0, "options.masks.binarize_thr")?;
        Ok(())
    }

    fn get_defaults() -> Self {
        Self::default()
    }
}

/// Template registration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationOptions {
    /// Whether registration and mask-warp stages are planned.
    pub enable: bool,
    /// Template identifier.
    pub template: String,
    /// Vertebral levels covered by the acquisition (e.g. `"C3:C7"`).
    pub levels: String,
    /// Whether GM/WM masks steer the registration.
    pub use_gm_wm_masks: bool,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            enable: false,
            template: "PAM50".to_string(),
            levels: String::new(),
            use_gm_wm_masks: false,
        }
    }
}

impl ConfigValidator for RegistrationOptions {
    fn validate(&self) -> Result<()> {
        if self.enable && self.template.is_empty() {
            return Err(SpineError::config(
                "registration.template",
                "must be set when registration is enabled",
            ));
        }
        Ok(())
    }

    fn get_defaults() -> Self {
        Self::default()
    }
}

/// Dataset and derivatives locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathOptions {
    /// Root of the input dataset.
    pub bids_dir: PathBuf,
    /// Root of the derivatives tree.
    pub deriv_dir: PathBuf,
}

impl ConfigValidator for PathOptions {
    fn validate(&self) -> Result<()> {
        if self.bids_dir.as_os_str().is_empty() {
            return Err(SpineError::config("paths.bids_dir", "must be set"));
        }
        if self.deriv_dir.as_os_str().is_empty() {
            return Err(SpineError::config("paths.deriv_dir", "must be set"));
        }
        Ok(())
    }

    fn get_defaults() -> Self {
        Self::default()
    }
}

/// Per-invocation processing options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    /// Temporal crop detection.
    pub temporal_crop: TemporalCropOptions,
    /// Motion correction.
    pub motion: MotionOptions,
    /// Frame censoring.
    pub censor: CensorOptions,
    /// Anatomical CompCor.
    pub acompcor: AcompcorOptions,
    /// Tissue masks.
    pub masks: MaskOptions,
}

/// The merged configuration for one pipeline invocation.
///
/// Taken by value everywhere; the orchestrator never mutates process-wide
/// state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpineConfig {
    /// Dataset and derivatives locations.
    pub paths: PathOptions,
    /// Processing options.
    pub options: ProcessingOptions,
    /// Template registration.
    pub registration: RegistrationOptions,
}

impl SpineConfig {
    /// Validates every option block, surfacing the first offending key.
    pub fn validate(&self) -> Result<()> {
        self.paths.validate()?;
        self.options.temporal_crop.validate()?;
        self.options.motion.validate()?;
        self.options.censor.validate()?;
        self.options.acompcor.validate()?;
        self.options.masks.validate()?;
        self.registration.validate()?;
        Ok(())
    }
}

/// Configuration file format.
#[derive(Debug, Clone, Copy)]
pub enum ConfigFormat {
    /// TOML format.
    Toml,
    /// JSON format.
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file, auto-detecting the format from the
    /// extension.
    pub fn load_from_file(path: &Path) -> Result<SpineConfig> {
        let format = ConfigFormat::from_extension(path).ok_or_else(|| {
            SpineError::config(
                "config",
                format!("unsupported config file extension: {:?}", path.extension()),
            )
        })?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            SpineError::config(
                "config",
                format!("failed to read config file {}: {e}", path.display()),
            )
        })?;
        Self::load_from_string(&content, format)
    }

    /// Load configuration from a string with the given format.
    pub fn load_from_string(content: &str, format: ConfigFormat) -> Result<SpineConfig> {
        let config: SpineConfig = match format {
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| {
                SpineError::config("config", format!("failed to parse TOML config: {e}"))
            })?,
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| {
                SpineError::config("config", format!("failed to parse JSON config: {e}"))
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Serialize the effective configuration to pretty JSON for echoing.
    pub fn to_json_string(config: &SpineConfig) -> Result<String> {
        Ok(serde_json::to_string_pretty(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let mut config = SpineConfig::default();
        config.paths.bids_dir = PathBuf::from("/data/bids");
        config.paths.deriv_dir = PathBuf::from("/data/derivatives/spineprep");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_key_is_named() {
        let mut config = SpineConfig::default();
        config.paths.bids_dir = PathBuf::from("/data/bids");
        config.paths.deriv_dir = PathBuf::from("/data/out");
        config.options.censor.min_contig_vols = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("options.censor.min_contig_vols"));
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_str = r#"
[paths]
bids_dir = "/data/bids"
deriv_dir = "/data/derivatives/spineprep"

[options.motion]
engine = "hybrid"
slice_axis = "z"

[options.censor]
fd_thresh_mm = 0.4

[registration]
enable = true
template = "PAM50"
"#;
        let config = ConfigLoader::load_from_string(toml_str, ConfigFormat::Toml).unwrap();
        assert_eq!(config.options.motion.engine, MotionEngine::Hybrid);
        assert!((config.options.censor.fd_thresh_mm - 0.4).abs() < 1e-12);
        // Untouched blocks keep their defaults.
        assert!((config.options.acompcor.highpass_hz - 0.008).abs() < 1e-12);
        assert!(config.registration.enable);
    }

    #[test]
    fn test_json_engine_names() {
        let json = r#"{
            "paths": {"bids_dir": "/b", "deriv_dir": "/d"},
            "options": {"motion": {"engine": "slice-wise", "slice_axis": "y"}}
        }"#;
        let config = ConfigLoader::load_from_string(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.options.motion.engine, MotionEngine::SliceWise);
        assert_eq!(config.options.motion.slice_axis, SliceAxis::Y);
    }

    #[test]
    fn test_format_detection() {
        assert!(matches!(
            ConfigFormat::from_extension(Path::new("spineprep.toml")),
            Some(ConfigFormat::Toml)
        ));
        assert!(matches!(
            ConfigFormat::from_extension(Path::new("spineprep.json")),
            Some(ConfigFormat::Json)
        ));
        assert!(ConfigFormat::from_extension(Path::new("spineprep.yaml")).is_none());
    }
}
