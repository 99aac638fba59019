//! The confounds frame and its descriptor.
//!
//! The frame is an append-only, column-ordered table keyed by post-crop
//! volume index. Column order is fixed: the six motion parameters, then
//! `framewise_displacement`, `dvars`, `frame_censor`, then per-tissue
//! aCompCor columns `acomp_{tissue}_pc{NN}` in configured tissue order.

use std::collections::BTreeMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SpineError};

/// Fixed motion-parameter column names.
pub const MOTION_COLUMNS: [&str; 6] = ["trans_x", "trans_y", "trans_z", "rot_x", "rot_y", "rot_z"];

/// Per-tissue aCompCor columns attached to a frame.
#[derive(Debug, Clone)]
pub struct TissueComponents {
    /// Tissue label (column prefix).
    pub tissue: String,
    /// Component time courses, shape (T, k).
    pub components: Array2<f64>,
}

/// The assembled confounds table for one run.
#[derive(Debug, Clone)]
pub struct ConfoundsFrame {
    /// Motion parameters, shape (T, 6).
    pub motion_params: Array2<f64>,
    /// Framewise displacement, length T.
    pub fd: Vec<f64>,
    /// DVARS, length T.
    pub dvars: Vec<f64>,
    /// Frame censor vector, length T, values 0/1.
    pub censor: Vec<u8>,
    /// aCompCor columns in configured tissue order.
    pub acompcor: Vec<TissueComponents>,
}

impl ConfoundsFrame {
    /// Validates internal length agreement and returns the frame.
    pub fn new(
        motion_params: Array2<f64>,
        fd: Vec<f64>,
        dvars: Vec<f64>,
        censor: Vec<u8>,
        acompcor: Vec<TissueComponents>,
    ) -> Result<Self> {
        let n = fd.len();
        if motion_params.nrows() != n || dvars.len() != n || censor.len() != n {
            return Err(SpineError::degenerate(format!(
                "confounds columns disagree on length: params={}, fd={}, dvars={}, censor={}",
                motion_params.nrows(),
                n,
                dvars.len(),
                censor.len()
            )));
        }
        if motion_params.ncols() != 6 {
            return Err(SpineError::degenerate(format!(
                "expected 6 motion parameter columns, got {}",
                motion_params.ncols()
            )));
        }
        for tissue in &acompcor {
            if tissue.components.nrows() != n {
                return Err(SpineError::degenerate(format!(
                    "aCompCor '{}' has {} rows, expected {n}",
                    tissue.tissue,
                    tissue.components.nrows()
                )));
            }
        }
        Ok(Self {
            motion_params,
            fd,
            dvars,
            censor,
            acompcor,
        })
    }

    /// Number of rows (post-crop volumes).
    pub fn n_rows(&self) -> usize {
        self.fd.len()
    }

    /// The header in canonical column order.
    pub fn header(&self) -> Vec<String> {
        let mut cols: Vec<String> = MOTION_COLUMNS.iter().map(|c| c.to_string()).collect();
        cols.push("framewise_displacement".to_string());
        cols.push("dvars".to_string());
        cols.push("frame_censor".to_string());
        for tissue in &self.acompcor {
            for pc in 0..tissue.components.ncols() {
                cols.push(format!("acomp_{}_pc{:02}", tissue.tissue, pc + 1));
            }
        }
        cols
    }
}

/// Per-tissue metadata recorded in the descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TissueMeta {
    /// Number of emitted components.
    pub n_components: usize,
    /// Variance ratio per component.
    pub explained_variance: Vec<f64>,
}

/// Censor configuration and counts recorded in the descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CensorMeta {
    /// Whether censoring ran.
    pub enabled: bool,
    /// FD threshold in millimeters.
    pub fd_thresh_mm: f64,
    /// DVARS threshold.
    pub dvars_thresh: f64,
    /// Minimum kept-segment length.
    pub min_contig_vols: usize,
    /// Symmetric padding.
    pub pad_vols: usize,
    /// Number of kept volumes.
    pub n_kept: usize,
    /// Number of censored volumes.
    pub n_censored: usize,
}

/// The descriptor record written beside the confounds table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfoundsDescriptor {
    /// Schema version of this record.
    #[serde(rename = "SchemaVersion")]
    pub schema_version: String,
    /// Producing software.
    #[serde(rename = "SoftwareName")]
    pub software_name: String,
    /// Software version.
    #[serde(rename = "SoftwareVersion")]
    pub software_version: String,
    /// Input paths that fed the computation.
    #[serde(rename = "Sources")]
    pub sources: Vec<String>,
    /// FD method identifier.
    #[serde(rename = "FramewiseDisplacementMethod")]
    pub fd_method: String,
    /// Where the motion parameters came from
    /// (`motion_params` or `fallback_zeros`).
    #[serde(rename = "FramewiseDisplacementSource")]
    pub fd_source: String,
    /// DVARS method identifier.
    #[serde(rename = "DvarsMethod")]
    pub dvars_method: String,
    /// How the DVARS mask was chosen.
    #[serde(rename = "DvarsMaskSource")]
    pub dvars_mask_source: String,
    /// Sampling period (repetition time) in seconds.
    #[serde(rename = "SamplingPeriod")]
    pub sampling_period_s: f64,
    /// First kept volume index of the applied crop.
    #[serde(rename = "CropFrom")]
    pub crop_from: usize,
    /// One past the last kept volume index of the applied crop.
    #[serde(rename = "CropTo")]
    pub crop_to: usize,
    /// Censor configuration and counts.
    #[serde(rename = "Censor")]
    pub censor: CensorMeta,
    /// Per-tissue aCompCor metadata, keyed by tissue label.
    #[serde(rename = "Acompcor")]
    pub acompcor: BTreeMap<String, TissueMeta>,
    /// Recoverable degradations recorded verbatim.
    #[serde(rename = "Notes")]
    pub notes: Vec<String>,
}
