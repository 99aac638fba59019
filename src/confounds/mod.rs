//! Confounds engine.
//!
//! Given a motion-corrected (and possibly cropped) series, a motion-parameter
//! table, and optional tissue masks, the engine assembles the confounds frame
//! and its descriptor: framewise displacement, DVARS, the frame-censor
//! vector, and per-tissue aCompCor regressors.
//!
//! Failure semantics: a missing 4-D image is fatal; a missing or unreadable
//! parameter table degrades FD to zeros; DVARS degrades to zeros; a mask
//! failure skips that tissue's PCA only. Every degradation is recorded in the
//! descriptor notes.

pub mod censor;
pub mod compcor;
pub mod frame;
pub mod motion_metrics;
pub mod writer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use tracing::{debug, warn};

use crate::core::config::ProcessingOptions;
use crate::core::errors::Result;
use crate::crop::CropSidecar;
use crate::image::{Mask3d, Volume4d};
use crate::motion::read_params_tsv;

pub use censor::{build_censor, CensorResult};
pub use compcor::{fit_compcor, CompcorResult};
pub use frame::{CensorMeta, ConfoundsDescriptor, ConfoundsFrame, TissueComponents, TissueMeta};
pub use motion_metrics::{dvars, fd_power, DvarsMaskSource};

/// Inputs to one confounds extraction.
#[derive(Debug, Clone)]
pub struct ConfoundsInputs {
    /// The motion-corrected series (post-crop).
    pub bold_path: PathBuf,
    /// The motion-parameter table; `None` forces the zero fallback.
    pub motion_params_path: Option<PathBuf>,
    /// The effective crop for descriptor bookkeeping.
    pub crop: CropSidecar,
    /// Tissue label to mask path, in configured tissue order.
    pub tissue_masks: Vec<(String, PathBuf)>,
}

/// The confounds engine, parameterized by the processing options.
#[derive(Debug)]
pub struct ConfoundsEngine<'a> {
    opts: &'a ProcessingOptions,
}

impl<'a> ConfoundsEngine<'a> {
    /// Creates an engine over the given options.
    pub fn new(opts: &'a ProcessingOptions) -> Self {
        Self { opts }
    }

    /// Computes the confounds frame and descriptor for one run.
    pub fn compute(&self, inputs: &ConfoundsInputs) -> Result<(ConfoundsFrame, ConfoundsDescriptor)> {
        let mut notes: Vec<String> = Vec::new();

        // A missing series is the one fatal input.
        let volume = Volume4d::read(&inputs.bold_path)?;
        let t = volume.nvols();
        if t != inputs.crop.kept() {
            notes.push(format!(
                "series has {t} volumes but crop sidecar keeps {}; proceeding with the series",
                inputs.crop.kept()
            ));
        }

        let (params, fd_source) = self.load_motion_params(inputs, t, &mut notes);
        let fd = fd_power(params.view())?;

        let (dvars_mask, mask_note) = self.dvars_mask(inputs);
        if let Some(note) = mask_note {
            notes.push(note);
        }
        let (dvars_vec, dvars_source) = dvars(volume.data.view(), dvars_mask.as_ref());

        let censor_result = if self.opts.censor.enable {
            build_censor(&fd, &dvars_vec, &self.opts.censor)?
        } else {
            CensorResult {
                censor: vec![0; t],
                kept_segments: if t > 0 { vec![(0, t)] } else { Vec::new() },
                n_kept: t,
                n_censored: 0,
            }
        };

        let mut acompcor_cols: Vec<TissueComponents> = Vec::new();
        let mut acompcor_meta: BTreeMap<String, TissueMeta> = BTreeMap::new();
        if self.opts.acompcor.enable {
            for tissue in &self.opts.acompcor.tissues {
                let mask_path = inputs
                    .tissue_masks
                    .iter()
                    .find(|(label, _)| label == tissue)
                    .map(|(_, path)| path.clone());
                let result = self.tissue_components(&volume, tissue, mask_path, &mut notes);
                acompcor_meta.insert(
                    tissue.clone(),
                    TissueMeta {
                        n_components: result.n_components(),
                        explained_variance: result.explained_variance.clone(),
                    },
                );
                if result.n_components() > 0 {
                    acompcor_cols.push(TissueComponents {
                        tissue: tissue.clone(),
                        components: result.components,
                    });
                }
            }
        }

        let descriptor = ConfoundsDescriptor {
            schema_version: "1.0".to_string(),
            software_name: "SpinePrep".to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            sources: self.sources(inputs),
            fd_method: "power".to_string(),
            fd_source: fd_source.to_string(),
            dvars_method: "rms_temporal_diff".to_string(),
            dvars_mask_source: dvars_source.as_str().to_string(),
            sampling_period_s: volume.tr_s(),
            crop_from: inputs.crop.from,
            crop_to: inputs.crop.to,
            censor: CensorMeta {
                enabled: self.opts.censor.enable,
                fd_thresh_mm: self.opts.censor.fd_thresh_mm,
                dvars_thresh: self.opts.censor.dvars_thresh,
                min_contig_vols: self.opts.censor.min_contig_vols,
                pad_vols: self.opts.censor.pad_vols,
                n_kept: censor_result.n_kept,
                n_censored: censor_result.n_censored,
            },
            acompcor: acompcor_meta,
            notes,
        };

        let frame = ConfoundsFrame::new(params, fd, dvars_vec, censor_result.censor, acompcor_cols)?;
        debug!(
            rows = frame.n_rows(),
            columns = frame.header().len(),
            "confounds frame assembled"
        );
        Ok((frame, descriptor))
    }

    fn load_motion_params(
        &self,
        inputs: &ConfoundsInputs,
        t: usize,
        notes: &mut Vec<String>,
    ) -> (Array2<f64>, &'static str) {
        let Some(path) = &inputs.motion_params_path else {
            notes.push("no motion parameter table; FD degraded to zeros".to_string());
            return (motion_metrics::zero_motion_params(t), "fallback_zeros");
        };
        match read_params_tsv(path) {
            Ok(params) if params.nrows() == t => (params, "motion_params"),
            Ok(params) => {
                warn!(
                    path = %path.display(),
                    rows = params.nrows(),
                    expected = t,
                    "motion parameter table length mismatch; FD degraded to zeros"
                );
                notes.push(format!(
                    "motion parameter table has {} rows, expected {t}; FD degraded to zeros",
                    params.nrows()
                ));
                (motion_metrics::zero_motion_params(t), "fallback_zeros")
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "motion parameter read failed");
                notes.push(format!("motion parameter read failed: {e}; FD degraded to zeros"));
                (motion_metrics::zero_motion_params(t), "fallback_zeros")
            }
        }
    }

    /// The DVARS mask: the first readable, non-empty configured tissue mask.
    fn dvars_mask(&self, inputs: &ConfoundsInputs) -> (Option<Mask3d>, Option<String>) {
        if !self.opts.masks.enable {
            return (None, None);
        }
        for (tissue, path) in &inputs.tissue_masks {
            if !path.exists() {
                continue;
            }
            match Mask3d::read(path, self.opts.masks.binarize_thr) {
                Ok(mask) if !mask.is_empty() => return (Some(mask), None),
                Ok(_) => {}
                Err(e) => {
                    return (
                        None,
                        Some(format!(
                            "mask '{tissue}' unreadable for DVARS ({e}); default mask used"
                        )),
                    )
                }
            }
        }
        (None, None)
    }

    fn tissue_components(
        &self,
        volume: &Volume4d,
        tissue: &str,
        mask_path: Option<PathBuf>,
        notes: &mut Vec<String>,
    ) -> CompcorResult {
        let t = volume.nvols();
        let Some(path) = mask_path else {
            notes.push(format!("no mask configured for tissue '{tissue}'"));
            return CompcorResult::empty(t);
        };
        let mask = match Mask3d::read(&path, self.opts.masks.binarize_thr) {
            Ok(mask) => mask,
            Err(e) => {
                warn!(tissue, path = %path.display(), error = %e, "mask read failed");
                notes.push(format!("mask read failed for tissue '{tissue}': {e}"));
                return CompcorResult::empty(t);
            }
        };
        if mask.is_empty() {
            notes.push(format!("mask for tissue '{tissue}' is empty"));
            return CompcorResult::empty(t);
        }
        let mut ts = match compcor::extract_timeseries(volume.data.view(), &mask) {
            Ok(ts) => ts,
            Err(e) => {
                notes.push(format!("time-series extraction failed for '{tissue}': {e}"));
                return CompcorResult::empty(t);
            }
        };
        if self.opts.acompcor.detrend {
            compcor::detrend_linear(&mut ts);
        }
        if self.opts.acompcor.highpass_hz > 0.0 {
            compcor::highpass_butterworth(&mut ts, self.opts.acompcor.highpass_hz, volume.tr_s());
        }
        if self.opts.acompcor.standardize {
            compcor::standardize(&mut ts);
        }
        fit_compcor(&ts, self.opts.acompcor.n_components_per_tissue)
    }

    fn sources(&self, inputs: &ConfoundsInputs) -> Vec<String> {
        let mut sources = vec![inputs.bold_path.display().to_string()];
        if let Some(p) = &inputs.motion_params_path {
            sources.push(p.display().to_string());
        }
        for (_, p) in &inputs.tissue_masks {
            sources.push(p.display().to_string());
        }
        sources
    }
}

/// Writes both confounds artifacts for a run.
pub fn write_outputs(
    tsv_path: &Path,
    json_path: &Path,
    frame: &ConfoundsFrame,
    descriptor: &ConfoundsDescriptor,
) -> Result<()> {
    writer::write_tsv(tsv_path, frame)?;
    writer::write_descriptor(json_path, descriptor)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crop::CropReason;
    use ndarray::{Array3, Array4};

    fn write_bold(dir: &Path, nvols: usize) -> PathBuf {
        let path = dir.join("bold.nii.gz");
        let mut data = Array4::<f32>::zeros((4, 4, 2, nvols));
        for t in 0..nvols {
            for x in 0..4 {
                data[[x, 0, 0, t]] = (x as f32) + (t as f32) * 0.3;
            }
        }
        Volume4d::from_array(data, 2.0).write(&path).unwrap();
        path
    }

    fn crop_full(nvols: usize) -> CropSidecar {
        CropSidecar {
            from: 0,
            to: nvols,
            nvols,
            reason: CropReason::NoCrop,
        }
    }

    fn default_opts() -> ProcessingOptions {
        ProcessingOptions::default()
    }

    #[test]
    fn test_smoke_without_params_or_masks() {
        let dir = tempfile::tempdir().unwrap();
        let bold_path = write_bold(dir.path(), 4);
        let opts = default_opts();
        let engine = ConfoundsEngine::new(&opts);
        let inputs = ConfoundsInputs {
            bold_path,
            motion_params_path: None,
            crop: crop_full(4),
            tissue_masks: Vec::new(),
        };
        let (frame, descriptor) = engine.compute(&inputs).unwrap();
        assert_eq!(frame.n_rows(), 4);
        assert_eq!(frame.header().len(), 9);
        assert!(frame.fd.iter().all(|&v| v == 0.0));
        assert!(frame.censor.iter().all(|&c| c == 0));
        assert_eq!(descriptor.fd_source, "fallback_zeros");
        assert_eq!(descriptor.censor.n_kept, 4);
        // Every configured tissue reports zero components.
        for tissue in &opts.acompcor.tissues {
            assert_eq!(descriptor.acompcor[tissue].n_components, 0);
            assert!(descriptor.acompcor[tissue].explained_variance.is_empty());
        }
    }

    #[test]
    fn test_row_count_follows_cropped_series() {
        let dir = tempfile::tempdir().unwrap();
        // Series already cropped to 3 volumes; sidecar says {1, 4, 4}.
        let bold_path = write_bold(dir.path(), 3);
        let opts = default_opts();
        let engine = ConfoundsEngine::new(&opts);
        let inputs = ConfoundsInputs {
            bold_path,
            motion_params_path: None,
            crop: CropSidecar {
                from: 1,
                to: 4,
                nvols: 4,
                reason: CropReason::RobustZ,
            },
            tissue_masks: Vec::new(),
        };
        let (frame, descriptor) = engine.compute(&inputs).unwrap();
        assert_eq!(frame.n_rows(), 3);
        assert_eq!(descriptor.crop_from, 1);
        assert_eq!(descriptor.crop_to, 4);
    }

    #[test]
    fn test_fd_from_real_params() {
        let dir = tempfile::tempdir().unwrap();
        let bold_path = write_bold(dir.path(), 4);
        let params_path = dir.path().join("params.tsv");
        let mut params = motion_metrics::zero_motion_params(4);
        params[[2, 0]] = 1.0;
        params[[3, 0]] = 1.0;
        crate::motion::write_params_tsv(&params_path, &params).unwrap();

        let opts = default_opts();
        let engine = ConfoundsEngine::new(&opts);
        let inputs = ConfoundsInputs {
            bold_path,
            motion_params_path: Some(params_path),
            crop: crop_full(4),
            tissue_masks: Vec::new(),
        };
        let (frame, descriptor) = engine.compute(&inputs).unwrap();
        assert_eq!(descriptor.fd_source, "motion_params");
        assert!((frame.fd[2] - 1.0).abs() < 1e-9);
        assert_eq!(frame.fd[0], 0.0);
    }

    #[test]
    fn test_params_length_mismatch_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let bold_path = write_bold(dir.path(), 4);
        let params_path = dir.path().join("params.tsv");
        crate::motion::write_params_tsv(&params_path, &motion_metrics::zero_motion_params(7))
            .unwrap();

        let opts = default_opts();
        let engine = ConfoundsEngine::new(&opts);
        let inputs = ConfoundsInputs {
            bold_path,
            motion_params_path: Some(params_path),
            crop: crop_full(4),
            tissue_masks: Vec::new(),
        };
        let (frame, descriptor) = engine.compute(&inputs).unwrap();
        assert_eq!(descriptor.fd_source, "fallback_zeros");
        assert!(!descriptor.notes.is_empty());
        assert_eq!(frame.n_rows(), 4);
    }

    #[test]
    fn test_missing_bold_is_fatal() {
        let opts = default_opts();
        let engine = ConfoundsEngine::new(&opts);
        let inputs = ConfoundsInputs {
            bold_path: PathBuf::from("/nope/missing.nii.gz"),
            motion_params_path: None,
            crop: crop_full(4),
            tissue_masks: Vec::new(),
        };
        let err = engine.compute(&inputs).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_acompcor_with_mask_emits_columns() {
        let dir = tempfile::tempdir().unwrap();
        let bold_path = dir.path().join("bold.nii.gz");
        let mut data = Array4::<f32>::zeros((4, 4, 2, 8));
        for t in 0..8 {
            for x in 0..4 {
                for y in 0..4 {
                    data[[x, y, 0, t]] =
                        ((t as f32) * 0.9 + (x as f32)).sin() + 0.2 * (y as f32);
                }
            }
        }
        Volume4d::from_array(data, 2.0).write(&bold_path).unwrap();

        let mask_path = dir.path().join("cordmask.nii.gz");
        let mask = Array3::from_elem((4, 4, 2), 1.0f32);
        let vol = Volume4d::from_array(mask.insert_axis(ndarray::Axis(3)), 2.0);
        vol.write(&mask_path).unwrap();

        let mut opts = default_opts();
        opts.acompcor.tissues = vec!["cord".to_string()];
        opts.acompcor.n_components_per_tissue = 2;
        let engine = ConfoundsEngine::new(&opts);
        let inputs = ConfoundsInputs {
            bold_path,
            motion_params_path: None,
            crop: crop_full(8),
            tissue_masks: vec![("cord".to_string(), mask_path)],
        };
        let (frame, descriptor) = engine.compute(&inputs).unwrap();
        let meta = &descriptor.acompcor["cord"];
        assert!(meta.n_components >= 1);
        assert_eq!(meta.explained_variance.len(), meta.n_components);
        let header = frame.header();
        assert!(header.contains(&"acomp_cord_pc01".to_string()));
    }

    #[test]
    fn test_empty_mask_skips_tissue_only() {
        let dir = tempfile::tempdir().unwrap();
        let bold_path = write_bold(dir.path(), 5);
        let mask_path = dir.path().join("cordmask.nii.gz");
        let zeros = Array3::<f32>::zeros((4, 4, 2));
        Volume4d::from_array(zeros.insert_axis(ndarray::Axis(3)), 2.0)
            .write(&mask_path)
            .unwrap();

        let mut opts = default_opts();
        opts.acompcor.tissues = vec!["cord".to_string()];
        let engine = ConfoundsEngine::new(&opts);
        let inputs = ConfoundsInputs {
            bold_path,
            motion_params_path: None,
            crop: crop_full(5),
            tissue_masks: vec![("cord".to_string(), mask_path)],
        };
        let (frame, descriptor) = engine.compute(&inputs).unwrap();
        assert_eq!(descriptor.acompcor["cord"].n_components, 0);
        assert!(descriptor.acompcor["cord"].explained_variance.is_empty());
        assert!(!frame.header().iter().any(|h| h.starts_with("acomp_cord")));
    }
}
