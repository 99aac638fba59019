//! Cord segmentation adapter.
//!
//! Wraps the deep-learning cord segmentation tool. When the tool is absent
//! the adapter emits a zero-valued mask with the anatomical image's header,
//! so mask-consuming steps observe an empty mask and degrade (empty aCompCor)
//! instead of failing.

use std::path::PathBuf;

use crate::adapters::command::run_tool;
use crate::adapters::ToolAdapter;
use crate::core::errors::Result;
use crate::image::{Mask3d, Volume4d};

/// Segmentation tool binary.
pub const SEGMENTATION_TOOL: &str = "sct_deepseg_sc";

/// Adapter producing the cord mask from a T2w image.
#[derive(Debug)]
pub struct CordSegAdapter {
    /// Input anatomical image.
    pub t2w_path: PathBuf,
    /// Output cord mask.
    pub out_mask: PathBuf,
    /// Contrast passed to the tool.
    pub contrast: String,
}

impl CordSegAdapter {
    /// Creates the adapter with the default T2 contrast.
    pub fn new(t2w_path: PathBuf, out_mask: PathBuf) -> Self {
        Self {
            t2w_path,
            out_mask,
            contrast: "t2".to_string(),
        }
    }
}

impl ToolAdapter for CordSegAdapter {
    fn step_name(&self) -> &str {
        "cord_seg"
    }

    fn tool(&self) -> &str {
        SEGMENTATION_TOOL
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.t2w_path.clone()]
    }

    fn primary_output(&self) -> PathBuf {
        self.out_mask.clone()
    }

    fn params(&self) -> serde_json::Value {
        serde_json::json!({ "contrast": self.contrast })
    }

    fn run_tool(&self) -> Result<()> {
        if let Some(parent) = self.out_mask.parent() {
            std::fs::create_dir_all(parent)?;
        }
        run_tool(
            SEGMENTATION_TOOL,
            &[
                "-i",
                self.t2w_path.to_str().unwrap_or_default(),
                "-c",
                &self.contrast,
                "-o",
                self.out_mask.to_str().unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    fn write_placeholder(&self) -> Result<()> {
        let reference = Volume4d::read(&self.t2w_path)?;
        let (x, y, z, _) = reference.data.dim();
        Mask3d::zeros((x, y, z)).write(&self.out_mask, &reference.header)
    }
}
