//! Motion correction coordinator.
//!
//! The coordinator applies the run's temporal crop to the 4-D series, invokes
//! the configured engine, and always emits a six-column parameter table whose
//! length equals the post-crop volume count. Slice-wise engines report no
//! rigid-body parameters, so their table is synthesized as zeros; rigid-3d
//! parses the tool output; the hybrid engine sums the two tables
//! component-wise, recorded in the parameter metadata.

use std::collections::BTreeMap;
use std::path::Path;

use ndarray::{concatenate, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapters::command::{run_tool, scratch_dir, tool_on_path, tool_versions};
use crate::confounds::motion_metrics::{split_motion_params, zero_motion_params};
use crate::core::config::{MotionEngine, MotionOptions, SliceAxis};
use crate::core::errors::{Result, SpineError};
use crate::crop::CropSidecar;
use crate::image::Volume4d;
use crate::utils::atomic_write;

/// Slice-motion tool binary.
pub const SLICE_TOOL: &str = "sct_fmri_moco";
/// Volume-motion tool binary.
pub const VOLUME_TOOL: &str = "mcflirt";

/// The parameter-table header, tab-joined.
pub const PARAMS_HEADER: &str = "trans_x\ttrans_y\ttrans_z\trot_x\trot_y\trot_z";

/// Completion status of a motion-correction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionStatus {
    /// The configured engine ran to completion.
    Completed,
    /// Required tools were absent; placeholder outputs were emitted.
    SkippedMissingTools,
    /// The image was copied through unchanged with zero parameters.
    FallbackCopy,
    /// Hybrid degraded to rigid-3d only.
    FallbackRigidOnly,
}

impl MotionStatus {
    /// The wire string, identical to the serde rename.
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionStatus::Completed => "completed",
            MotionStatus::SkippedMissingTools => "skipped_missing_tools",
            MotionStatus::FallbackCopy => "fallback_copy",
            MotionStatus::FallbackRigidOnly => "fallback_rigid_only",
        }
    }

    /// Whether outputs are placeholders (step should mark `.skip`).
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            MotionStatus::SkippedMissingTools | MotionStatus::FallbackCopy
        )
    }
}

/// Metadata accompanying a parameter table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionParamsMeta {
    /// Engine identifier as configured.
    pub engine: String,
    /// Slice axis for slice-wise engines.
    pub slice_axis: String,
    /// Completion status.
    pub status: MotionStatus,
    /// How multiple parameter tables were composed, if they were.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composition: Option<String>,
    /// Tool name to version string.
    pub tool_versions: BTreeMap<String, String>,
}

/// The outcome of motion correction for one run.
#[derive(Debug)]
pub struct MotionOutcome {
    /// Corrected (or placeholder) series, post-crop length.
    pub image: Volume4d,
    /// Parameter table, shape (post-crop T, 6).
    pub params: Array2<f64>,
    /// Parameter metadata.
    pub meta: MotionParamsMeta,
}

/// Engine backends, abstracted for testability.
///
/// The external implementation shells out through the command adapter; tests
/// substitute deterministic stubs.
pub trait MotionBackend {
    /// Whether the slice-motion tool is available.
    fn slice_wise_available(&self) -> bool;
    /// Whether the volume-motion tool is available.
    fn rigid3d_available(&self) -> bool;
    /// Runs slice-wise correction, returning the corrected series.
    fn run_slice_wise(&self, input: &Volume4d, axis: SliceAxis) -> Result<Volume4d>;
    /// Runs rigid-3d correction, returning the corrected series and the
    /// parsed parameter table (trans mm, rot radians).
    fn run_rigid3d(&self, input: &Volume4d) -> Result<(Volume4d, Array2<f64>)>;
    /// Tool versions for provenance.
    fn versions(&self) -> BTreeMap<String, String>;
}

/// Backend that invokes the real external tools.
#[derive(Debug, Default)]
pub struct ExternalBackend;

impl MotionBackend for ExternalBackend {
    fn slice_wise_available(&self) -> bool {
        tool_on_path(SLICE_TOOL)
    }

    fn rigid3d_available(&self) -> bool {
        tool_on_path(VOLUME_TOOL)
    }

    fn run_slice_wise(&self, input: &Volume4d, axis: SliceAxis) -> Result<Volume4d> {
        let (_guard, dir) = scratch_dir("moco")?;
        let in_path = dir.join("in.nii.gz");
        input.write(&in_path)?;
        run_tool(
            SLICE_TOOL,
            &[
                "-i",
                in_path.to_str().unwrap_or_default(),
                "-x",
                &axis.to_string(),
                "-ofolder",
                dir.to_str().unwrap_or_default(),
            ],
        )?;
        let out_path = dir.join("in_moco.nii.gz");
        Volume4d::read(&out_path)
    }

    fn run_rigid3d(&self, input: &Volume4d) -> Result<(Volume4d, Array2<f64>)> {
        let (_guard, dir) = scratch_dir("mcflirt")?;
        let in_path = dir.join("in.nii.gz");
        input.write(&in_path)?;
        let out_base = dir.join("out");
        run_tool(
            VOLUME_TOOL,
            &[
                "-in",
                in_path.to_str().unwrap_or_default(),
                "-out",
                out_base.to_str().unwrap_or_default(),
                "-plots",
            ],
        )?;
        let image = Volume4d::read(&dir.join("out.nii.gz"))?;
        let params = parse_fsl_par(&std::fs::read_to_string(dir.join("out.par"))?)?;
        Ok((image, params))
    }

    fn versions(&self) -> BTreeMap<String, String> {
        tool_versions(&[SLICE_TOOL, VOLUME_TOOL])
    }
}

/// Parses an FSL `.par` table (rot_x rot_y rot_z trans_x trans_y trans_z per
/// row) into the trans-first column order used everywhere in this crate.
pub fn parse_fsl_par(content: &str) -> Result<Array2<f64>> {
    let mut rows: Vec<[f64; 6]> = Vec::new();
    for line in content.lines() {
        let fields: Vec<f64> = line
            .split_whitespace()
            .map(|f| f.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| SpineError::degenerate("unparseable motion parameter row"))?;
        if fields.is_empty() {
            continue;
        }
        if fields.len() != 6 {
            return Err(SpineError::degenerate(format!(
                "expected 6 motion parameters per row, got {}",
                fields.len()
            )));
        }
        rows.push([
            fields[3], fields[4], fields[5], fields[0], fields[1], fields[2],
        ]);
    }
    let mut params = Array2::zeros((rows.len(), 6));
    for (r, row) in rows.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            params[[r, c]] = v;
        }
    }
    Ok(params)
}

/// Coordinates crop application and engine dispatch for one run.
#[derive(Debug)]
pub struct MotionCoordinator<'a, B: MotionBackend> {
    opts: &'a MotionOptions,
    backend: &'a B,
}

impl<'a, B: MotionBackend> MotionCoordinator<'a, B> {
    /// Creates a coordinator over the configured engine and backend.
    pub fn new(opts: &'a MotionOptions, backend: &'a B) -> Self {
        Self { opts, backend }
    }

    fn meta(&self, status: MotionStatus, composition: Option<&str>) -> MotionParamsMeta {
        MotionParamsMeta {
            engine: self.opts.engine.to_string(),
            slice_axis: self.opts.slice_axis.to_string(),
            status,
            composition: composition.map(str::to_string),
            tool_versions: self.backend.versions(),
        }
    }

    /// Applies the crop and runs the configured engine.
    ///
    /// Always yields a parameter table of post-crop length; tool absence and
    /// tool failure degrade per engine instead of erroring.
    pub fn correct(&self, bold: &Volume4d, crop: &CropSidecar) -> Result<MotionOutcome> {
        let cropped = bold.crop(crop.from, crop.to)?;
        let t = cropped.nvols();
        match self.opts.engine {
            MotionEngine::SliceWise => self.slice_wise(cropped, t),
            MotionEngine::Rigid3d => self.rigid3d(cropped, t),
            MotionEngine::Hybrid => self.hybrid(cropped, t),
            MotionEngine::Grouped => self.slice_wise(cropped, t),
        }
    }

    fn slice_wise(&self, cropped: Volume4d, t: usize) -> Result<MotionOutcome> {
        if !self.backend.slice_wise_available() {
            warn!(tool = SLICE_TOOL, "slice-motion tool missing; skipping");
            return Ok(MotionOutcome {
                image: cropped,
                params: zero_motion_params(t),
                meta: self.meta(MotionStatus::SkippedMissingTools, None),
            });
        }
        match self.backend.run_slice_wise(&cropped, self.opts.slice_axis) {
            Ok(image) => Ok(MotionOutcome {
                image,
                // Slice-wise engines expose no rigid-body parameters.
                params: zero_motion_params(t),
                meta: self.meta(MotionStatus::Completed, None),
            }),
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "slice-wise correction failed; skipping");
                Ok(MotionOutcome {
                    image: cropped,
                    params: zero_motion_params(t),
                    meta: self.meta(MotionStatus::SkippedMissingTools, None),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn rigid3d(&self, cropped: Volume4d, t: usize) -> Result<MotionOutcome> {
        if !self.backend.rigid3d_available() {
            warn!(tool = VOLUME_TOOL, "volume-motion tool missing; copying through");
            return Ok(MotionOutcome {
                image: cropped,
                params: zero_motion_params(t),
                meta: self.meta(MotionStatus::FallbackCopy, None),
            });
        }
        match self.backend.run_rigid3d(&cropped) {
            Ok((image, params)) => {
                if params.nrows() != t {
                    return Err(SpineError::degenerate(format!(
                        "rigid-3d produced {} parameter rows for {t} volumes",
                        params.nrows()
                    )));
                }
                Ok(MotionOutcome {
                    image,
                    params,
                    meta: self.meta(MotionStatus::Completed, None),
                })
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "rigid-3d correction failed; copying through");
                Ok(MotionOutcome {
                    image: cropped,
                    params: zero_motion_params(t),
                    meta: self.meta(MotionStatus::FallbackCopy, None),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn hybrid(&self, cropped: Volume4d, t: usize) -> Result<MotionOutcome> {
        if !self.backend.slice_wise_available() {
            // Degrade to rigid-3d only.
            let outcome = self.rigid3d(cropped, t)?;
            let status = if outcome.meta.status == MotionStatus::Completed {
                MotionStatus::FallbackRigidOnly
            } else {
                outcome.meta.status
            };
            info!(status = status.as_str(), "hybrid engine degraded");
            return Ok(MotionOutcome {
                meta: self.meta(status, None),
                ..outcome
            });
        }
        let slice_pass = self.slice_wise(cropped, t)?;
        if slice_pass.meta.status != MotionStatus::Completed {
            let outcome = self.rigid3d(slice_pass.image, t)?;
            let status = if outcome.meta.status == MotionStatus::Completed {
                MotionStatus::FallbackRigidOnly
            } else {
                outcome.meta.status
            };
            return Ok(MotionOutcome {
                meta: self.meta(status, None),
                ..outcome
            });
        }
        let slice_params = slice_pass.params;
        let rigid = self.rigid3d(slice_pass.image, t)?;
        // Approximation: the two tables are summed component-wise.
        let params = &slice_params + &rigid.params;
        let status = rigid.meta.status;
        Ok(MotionOutcome {
            image: rigid.image,
            params,
            meta: self.meta(status, Some("componentwise_sum")),
        })
    }

    /// Grouped correction: concatenate runs along time, correct slice-wise,
    /// split back per run. Tool absence skips the whole group.
    pub fn correct_group(
        &self,
        cropped_runs: &[Volume4d],
    ) -> Result<(Vec<Volume4d>, Vec<Array2<f64>>, MotionParamsMeta)> {
        let lengths: Vec<usize> = cropped_runs.iter().map(Volume4d::nvols).collect();
        if cropped_runs.is_empty() {
            return Err(SpineError::degenerate("empty motion group"));
        }
        if !self.backend.slice_wise_available() {
            warn!(tool = SLICE_TOOL, "slice-motion tool missing; skipping group");
            let params = lengths.iter().map(|&l| zero_motion_params(l)).collect();
            return Ok((
                cropped_runs.to_vec(),
                params,
                self.meta(MotionStatus::SkippedMissingTools, None),
            ));
        }
        let views: Vec<_> = cropped_runs.iter().map(|v| v.data.view()).collect();
        let data = concatenate(Axis(3), &views)?;
        let concatenated = Volume4d {
            data,
            header: cropped_runs[0].header.clone(),
        };
        match self.backend.run_slice_wise(&concatenated, self.opts.slice_axis) {
            Ok(corrected) => {
                let total: usize = lengths.iter().sum();
                let zero = zero_motion_params(total);
                let params = split_motion_params(&zero, &lengths)?;
                let mut images = Vec::with_capacity(lengths.len());
                let mut offset = 0;
                for &len in &lengths {
                    images.push(corrected.crop(offset, offset + len)?);
                    offset += len;
                }
                Ok((images, params, self.meta(MotionStatus::Completed, None)))
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "grouped correction failed; skipping group");
                let params = lengths.iter().map(|&l| zero_motion_params(l)).collect();
                Ok((
                    cropped_runs.to_vec(),
                    params,
                    self.meta(MotionStatus::SkippedMissingTools, None),
                ))
            }
            Err(e) => Err(e),
        }
    }
}

/// Writes a parameter table as TSV with the fixed header.
pub fn write_params_tsv(path: &Path, params: &Array2<f64>) -> Result<()> {
    let mut out = String::from(PARAMS_HEADER);
    out.push('\n');
    for row in params.rows() {
        let fields: Vec<String> = row.iter().map(|v| format!("{v:.6}")).collect();
        out.push_str(&fields.join("\t"));
        out.push('\n');
    }
    atomic_write(path, out.as_bytes())
}

/// Reads a parameter table written by [`write_params_tsv`].
pub fn read_params_tsv(path: &Path) -> Result<Array2<f64>> {
    let content = std::fs::read_to_string(path).map_err(|_| SpineError::missing_input(path))?;
    let mut lines = content.lines();
    let header = lines
        .next()
        .ok_or_else(|| SpineError::degenerate("empty motion parameter table"))?;
    if header != PARAMS_HEADER {
        return Err(SpineError::degenerate(format!(
            "unexpected motion parameter header: {header}"
        )));
    }
    let mut rows: Vec<[f64; 6]> = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<f64> = line
            .split('\t')
            .map(|f| f.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| SpineError::degenerate("unparseable motion parameter row"))?;
        if fields.len() != 6 {
            return Err(SpineError::degenerate(format!(
                "expected 6 columns, got {}",
                fields.len()
            )));
        }
        rows.push([
            fields[0], fields[1], fields[2], fields[3], fields[4], fields[5],
        ]);
    }
    let mut params = Array2::zeros((rows.len(), 6));
    for (r, row) in rows.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            params[[r, c]] = v;
        }
    }
    Ok(params)
}
