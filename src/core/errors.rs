//! Error types for the preprocessing pipeline.
//!
//! This module defines the error taxonomy used across the pipeline. Errors are
//! discriminated by kind rather than by origin: a step that hits a recoverable
//! kind (missing tool, tool failure, degenerate numerics) is downgraded to a
//! graceful skip with placeholder outputs, while fatal kinds (invalid
//! configuration, missing required input, failed output commit) abort the
//! invocation.

use std::path::PathBuf;
use thiserror::Error;

/// Enum representing the stages of the preprocessing pipeline.
///
/// Used to identify which stage an error or a build step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Temporal crop detection.
    CropDetect,
    /// MP-PCA denoising.
    Mppca,
    /// Motion correction.
    Motion,
    /// Confounds extraction.
    Confounds,
    /// Cord segmentation (anatomical).
    CordSeg,
    /// Vertebral labeling (anatomical).
    VertebralLabels,
    /// Template registration (anatomical).
    TemplateReg,
    /// Warping tissue masks into functional space.
    MaskWarp,
}

impl Stage {
    /// All functional per-run stages in execution order.
    pub const RUN_ORDER: [Stage; 4] = [
        Stage::CropDetect,
        Stage::Mppca,
        Stage::Motion,
        Stage::Confounds,
    ];

    /// Short identifier used in step ids, log lines, and DAG labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CropDetect => "crop_detect",
            Stage::Mppca => "mppca",
            Stage::Motion => "motion",
            Stage::Confounds => "confounds",
            Stage::CordSeg => "cord_seg",
            Stage::VertebralLabels => "vertebral_labels",
            Stage::TemplateReg => "template_reg",
            Stage::MaskWarp => "mask_warp",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur in the preprocessing pipeline.
///
/// Recoverable kinds (`ToolUnavailable`, `ToolFailure`, `Degenerate`) are
/// caught at the step level and downgraded to a skip; the remaining kinds
/// propagate and fail the invocation.
#[derive(Error, Debug)]
pub enum SpineError {
    /// Invalid configuration, surfacing the offending key.
    #[error("configuration key '{key}': {message}")]
    Config {
        /// The configuration key that failed validation.
        key: String,
        /// A message describing the problem.
        message: String,
    },

    /// A required input file is missing.
    #[error("missing required input: {path}")]
    MissingInput {
        /// The path that was expected to exist.
        path: PathBuf,
    },

    /// An external tool is not installed or not on PATH.
    #[error("tool unavailable: {tool}")]
    ToolUnavailable {
        /// The tool binary name.
        tool: String,
    },

    /// An external tool ran but exited unsuccessfully.
    #[error("tool '{tool}' failed with status {status}")]
    ToolFailure {
        /// The tool binary name.
        tool: String,
        /// Exit status of the process (-1 when terminated by signal).
        status: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// Degenerate numerical input (empty mask, zero variance, zero rank).
    #[error("degenerate input: {context}")]
    Degenerate {
        /// Description of what was degenerate.
        context: String,
    },

    /// Committing an output via rename failed; no partial artifact is visible.
    #[error("atomic commit failed for {path}")]
    CommitFailed {
        /// The destination path of the failed commit.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Error while reading or writing a NIfTI image.
    #[error("image i/o")]
    Image(#[from] nifti::NiftiError),

    /// Error from array shape operations.
    #[error("array shape")]
    Shape(#[from] ndarray::ShapeError),

    /// Error from JSON (de)serialization.
    #[error("json")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

impl SpineError {
    /// Creates a configuration error for the given key.
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a missing-input error.
    pub fn missing_input(path: impl Into<PathBuf>) -> Self {
        Self::MissingInput { path: path.into() }
    }

    /// Creates a degenerate-input error.
    pub fn degenerate(context: impl Into<String>) -> Self {
        Self::Degenerate {
            context: context.into(),
        }
    }

    /// Whether a step may downgrade this error to a graceful skip.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SpineError::ToolUnavailable { .. }
                | SpineError::ToolFailure { .. }
                | SpineError::Degenerate { .. }
        )
    }
}

/// Convenient result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, SpineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(SpineError::ToolUnavailable {
            tool: "sct_deepseg_sc".into()
        }
        .is_recoverable());
        assert!(SpineError::degenerate("empty mask").is_recoverable());
        assert!(!SpineError::config("options.censor.pad_vols", "negative").is_recoverable());
        assert!(!SpineError::missing_input("/nope/bold.nii.gz").is_recoverable());
    }

    #[test]
    fn test_stage_order_and_labels() {
        let labels: Vec<&str> = Stage::RUN_ORDER.iter().map(|s| s.as_str()).collect();
        assert_eq!(labels, ["crop_detect", "mppca", "motion", "confounds"]);
        assert_eq!(Stage::MaskWarp.to_string(), "mask_warp");
    }

    #[test]
    fn test_config_error_names_key() {
        let err = SpineError::config("options.motion.engine", "unknown engine 'warp'");
        assert!(err.to_string().contains("options.motion.engine"));
    }
}
