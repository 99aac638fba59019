//! Quality-control input collection.
//!
//! The collector consumes the manifest, crop sidecars, and confounds
//! descriptors and emits one machine-readable record per run for the report
//! renderer. Rendering itself lives outside this crate; only the inputs are
//! produced here.

use serde::{Deserialize, Serialize};

use crate::bids::{DerivativeLayout, Desc, Manifest, Space};
use crate::core::errors::Result;
use crate::crop;
use crate::pipeline::provenance::prov_path;
use crate::utils::atomic_write_json;

/// One QC input row per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcRunRecord {
    /// The run key.
    pub run: String,
    /// Crop bounds, when a sidecar exists.
    pub crop_from: Option<usize>,
    /// Crop upper bound.
    pub crop_to: Option<usize>,
    /// Crop reason string.
    pub crop_reason: Option<String>,
    /// Kept volume count from the confounds descriptor.
    pub n_kept: Option<usize>,
    /// Censored volume count from the confounds descriptor.
    pub n_censored: Option<usize>,
    /// Provenance record paths for this run's artifacts.
    pub provenance: Vec<String>,
}

/// The collected QC inputs for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcInputs {
    /// Per-run records in manifest order.
    pub runs: Vec<QcRunRecord>,
}

/// Collects QC inputs from whatever artifacts exist.
///
/// Missing artifacts leave their fields empty; collection never fails an
/// invocation.
pub fn collect(manifest: &Manifest, layout: &DerivativeLayout) -> QcInputs {
    let mut runs = Vec::with_capacity(manifest.runs.len());
    for record in &manifest.runs {
        let e = &record.entities;
        let sidecar = crop::read_sidecar(&layout.func(e, Desc::Crop, Space::Native)).ok();
        let descriptor: Option<serde_json::Value> =
            std::fs::read_to_string(layout.func(e, Desc::ConfoundsMeta, Space::Native))
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok());

        let mut provenance = Vec::new();
        for desc in [Desc::Crop, Desc::Mppca, Desc::Motion, Desc::Confounds] {
            let p = prov_path(&layout.func(e, desc, Space::Native));
            if p.exists() {
                provenance.push(p.display().to_string());
            }
        }

        runs.push(QcRunRecord {
            run: e.run_key(),
            crop_from: sidecar.map(|s| s.from),
            crop_to: sidecar.map(|s| s.to),
            crop_reason: sidecar.map(|s| s.reason.as_str().to_string()),
            n_kept: descriptor
                .as_ref()
                .and_then(|d| d["Censor"]["n_kept"].as_u64())
                .map(|v| v as usize),
            n_censored: descriptor
                .as_ref()
                .and_then(|d| d["Censor"]["n_censored"].as_u64())
                .map(|v| v as usize),
            provenance,
        });
    }
    QcInputs { runs }
}

/// Writes the collected inputs under the derivatives log directory.
pub fn write(inputs: &QcInputs, layout: &DerivativeLayout) -> Result<()> {
    atomic_write_json(&layout.logs().join("qc_inputs.json"), inputs)
}

/// Collects and writes in one call.
pub fn collect_and_write(manifest: &Manifest, layout: &DerivativeLayout) -> Result<()> {
    write(&collect(manifest, layout), layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::{EntityTuple, RunRecord};
    use std::path::PathBuf;

    #[test]
    fn test_collect_with_missing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DerivativeLayout::new(dir.path());
        let manifest = Manifest::new(
            vec![RunRecord {
                entities: EntityTuple::new("sub-01", "rest", "01"),
                bold_path: PathBuf::from("/bids/bold.nii.gz"),
                tr_s: 2.0,
                pe_dir: None,
                voxel_dims_mm: None,
                nvols: 4,
                motion_group: None,
            }],
            Vec::new(),
        )
        .unwrap();
        let inputs = collect(&manifest, &layout);
        assert_eq!(inputs.runs.len(), 1);
        assert!(inputs.runs[0].crop_from.is_none());
        assert!(inputs.runs[0].provenance.is_empty());
    }

    #[test]
    fn test_collect_reads_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DerivativeLayout::new(dir.path());
        let e = EntityTuple::new("sub-01", "rest", "01");
        crop::write_sidecar(
            &layout.func(&e, Desc::Crop, Space::Native),
            &crop::CropSidecar {
                from: 2,
                to: 9,
                nvols: 10,
                reason: crop::CropReason::RobustZ,
            },
        )
        .unwrap();
        let manifest = Manifest::new(
            vec![RunRecord {
                entities: e,
                bold_path: PathBuf::from("/bids/bold.nii.gz"),
                tr_s: 2.0,
                pe_dir: None,
                voxel_dims_mm: None,
                nvols: 10,
                motion_group: None,
            }],
            Vec::new(),
        )
        .unwrap();
        let inputs = collect(&manifest, &layout);
        assert_eq!(inputs.runs[0].crop_from, Some(2));
        assert_eq!(inputs.runs[0].crop_reason.as_deref(), Some("robust-z"));
        write(&inputs, &layout).unwrap();
        assert!(layout.logs().join("qc_inputs.json").exists());
    }
}
