//! MP-PCA denoising adapter.
//!
//! Wraps the Marchenko-Pastur PCA denoiser. When the denoiser is unavailable
//! the series is copied through unchanged, which preserves every downstream
//! contract (same shape, same header).

use std::path::PathBuf;

use crate::adapters::command::run_tool;
use crate::adapters::ToolAdapter;
use crate::core::errors::Result;

/// Denoising tool binary.
pub const DENOISE_TOOL: &str = "dwidenoise";

/// Adapter producing the denoised series.
#[derive(Debug)]
pub struct MppcaAdapter {
    /// Input 4-D series.
    pub bold_path: PathBuf,
    /// Output denoised series.
    pub out_path: PathBuf,
}

impl ToolAdapter for MppcaAdapter {
    fn step_name(&self) -> &str {
        "mppca"
    }

    fn tool(&self) -> &str {
        DENOISE_TOOL
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.bold_path.clone()]
    }

    fn primary_output(&self) -> PathBuf {
        self.out_path.clone()
    }

    fn run_tool(&self) -> Result<()> {
        if let Some(parent) = self.out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        run_tool(
            DENOISE_TOOL,
            &[
                self.bold_path.to_str().unwrap_or_default(),
                self.out_path.to_str().unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    fn write_placeholder(&self) -> Result<()> {
        if let Some(parent) = self.out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&self.bold_path, &self.out_path)?;
        Ok(())
    }
}
