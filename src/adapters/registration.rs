//! Template registration and mask warping adapters.
//!
//! Registration aligns the subject anatomy to the template and produces a
//! warp field; mask warping applies the warp to bring template tissue masks
//! into the subject's functional space. Placeholders are a zero warp field
//! and a copy-through of the input mask, both of which keep downstream mask
//! consumers functional.

use std::path::PathBuf;

use crate::adapters::command::run_tool;
use crate::adapters::ToolAdapter;
use crate::core::errors::Result;
use crate::image::Volume4d;

/// Registration tool binary.
pub const REGISTRATION_TOOL: &str = "sct_register_to_template";
/// Warp application tool binary.
pub const WARP_TOOL: &str = "sct_apply_transfo";

/// Adapter producing the subject-to-template warp.
#[derive(Debug)]
pub struct TemplateRegAdapter {
    /// Input anatomical image.
    pub t2w_path: PathBuf,
    /// Input cord mask.
    pub cord_mask: PathBuf,
    /// Template identifier.
    pub template: String,
    /// Output warp field.
    pub out_warp: PathBuf,
}

impl ToolAdapter for TemplateRegAdapter {
    fn step_name(&self) -> &str {
        "template_reg"
    }

    fn tool(&self) -> &str {
        REGISTRATION_TOOL
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![self.t2w_path.clone(), self.cord_mask.clone()]
    }

    fn primary_output(&self) -> PathBuf {
        self.out_warp.clone()
    }

    fn params(&self) -> serde_json::Value {
        serde_json::json!({ "template": self.template })
    }

    fn run_tool(&self) -> Result<()> {
        if let Some(parent) = self.out_warp.parent() {
            std::fs::create_dir_all(parent)?;
        }
        run_tool(
            REGISTRATION_TOOL,
            &[
                "-i",
                self.t2w_path.to_str().unwrap_or_default(),
                "-s",
                self.cord_mask.to_str().unwrap_or_default(),
                "-owarp",
                self.out_warp.to_str().unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    fn write_placeholder(&self) -> Result<()> {
        let reference = Volume4d::read(&self.t2w_path)?;
        reference.zeros_like().write(&self.out_warp)
    }
}

/// Adapter warping one mask through the registration warp.
#[derive(Debug)]
pub struct MaskWarpAdapter {
    /// Input mask in template or anatomical space.
    pub mask_path: PathBuf,
    /// The warp field (possibly a placeholder).
    pub warp_path: PathBuf,
    /// Destination-space reference image.
    pub dest_ref: PathBuf,
    /// Output warped mask.
    pub out_mask: PathBuf,
}

impl ToolAdapter for MaskWarpAdapter {
    fn step_name(&self) -> &str {
        "mask_warp"
    }

    fn tool(&self) -> &str {
        WARP_TOOL
    }

    fn inputs(&self) -> Vec<PathBuf> {
        vec![
            self.mask_path.clone(),
            self.warp_path.clone(),
            self.dest_ref.clone(),
        ]
    }

    fn primary_output(&self) -> PathBuf {
        self.out_mask.clone()
    }

    fn run_tool(&self) -> Result<()> {
        if let Some(parent) = self.out_mask.parent() {
            std::fs::create_dir_all(parent)?;
        }
        run_tool(
            WARP_TOOL,
            &[
                "-i",
                self.mask_path.to_str().unwrap_or_default(),
                "-w",
                self.warp_path.to_str().unwrap_or_default(),
                "-d",
                self.dest_ref.to_str().unwrap_or_default(),
                "-o",
                self.out_mask.to_str().unwrap_or_default(),
                "-x",
                "nn",
            ],
        )?;
        Ok(())
    }

    fn write_placeholder(&self) -> Result<()> {
        // Copy-through keeps the mask consumable in its original space.
        if let Some(parent) = self.out_mask.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&self.mask_path, &self.out_mask)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{execute, AdapterOutcome};
    use ndarray::Array4;

    #[test]
    fn test_mask_warp_placeholder_copies_through() {
        let dir = tempfile::tempdir().unwrap();
        let mask = dir.path().join("mask.nii.gz");
        Volume4d::from_array(Array4::from_elem((2, 2, 2, 1), 1.0), 0.0)
            .write(&mask)
            .unwrap();
        let warp = dir.path().join("warp.nii.gz");
        Volume4d::from_array(Array4::zeros((2, 2, 2, 1)), 0.0)
            .write(&warp)
            .unwrap();
        let adapter = MaskWarpAdapter {
            mask_path: mask.clone(),
            warp_path: warp,
            dest_ref: mask.clone(),
            out_mask: dir.path().join("warped.nii.gz"),
        };
        let outcome = execute(&adapter).unwrap();
        assert!(matches!(outcome, AdapterOutcome::Skipped(_)));
        // Placeholder content equals the input mask byte-for-byte.
        assert_eq!(
            std::fs::read(&mask).unwrap(),
            std::fs::read(adapter.primary_output()).unwrap()
        );
    }
}
