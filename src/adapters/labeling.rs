//! Vertebral labeling adapter.
//!
//! Wraps the vertebral labeling tool, which assigns level labels to the cord
//! mask. The placeholder is a zero-valued label image with the cord mask's
//! geometry.

use std::path::PathBuf;

use crate::adapters::command::run_tool;
use crate::adapters::ToolAdapter;
use crate::core::errors::Result;
use crate::image::Volume4d;

/// Labeling tool binary.
pub const LABELING_TOOL: &str = "sct_label_vertebrae";

/// Adapter producing the labeled-levels image.
#[derive(Debug)]
pub struct VertebralLabelsAdapter {
    /// Input anatomical image.
    pub t2w_path: PathBuf,
    /// Input cord mask (possibly a placeholder).
    pub cord_mask: PathBuf,
    /// Output labeled image.
    pub out_labels: PathBuf,
}

impl ToolAdapter for VertebralLabelsAdapter {
    fn step_name(&self) -> &str {
        "vertebral_labels"
    }

    fn tool(&self) -> &str {
        LABELING_TOOL
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.t2w_path.clone(), self.cord_mask.clone()]
    }

    fn primary_output(&self) -> PathBuf {
        self.out_labels.clone()
    }

    fn run_tool(&self) -> Result<()> {
        if let Some(parent) = self.out_labels.parent() {
            std::fs::create_dir_all(parent)?;
        }
        run_tool(
            LABELING_TOOL,
            &[
                "-i",
                self.t2w_path.to_str().unwrap_or_default(),
                "-s",
                self.cord_mask.to_str().unwrap_or_default(),
                "-c",
                "t2",
                "-o",
                self.out_labels.to_str().unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    fn write_placeholder(&self) -> Result<()> {
        let reference = Volume4d::read(&self.cord_mask)?;
        reference.zeros_like().write(&self.out_labels)
    }
}
