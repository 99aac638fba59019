//! Topological execution with skip, fallback, and summary.
//!
//! The executor walks the planned graph stage by stage (the stage waves are
//! themselves a topological order of the per-run chains), running the steps
//! of each wave on a bounded worker pool. Each step checks for its primary
//! output or `.skip` marker before doing anything, produces either real
//! outputs plus `.ok` or placeholder outputs plus `.skip`, and records
//! provenance. Recoverable errors downgrade to SKIP; fatal kinds abort the
//! remaining waves and fail the invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde_json::json;
use tracing::{error, info, warn};

use crate::adapters::command::tool_versions;
use crate::adapters::denoise::MppcaAdapter;
use crate::adapters::labeling::VertebralLabelsAdapter;
use crate::adapters::registration::{MaskWarpAdapter, TemplateRegAdapter};
use crate::adapters::segmentation::CordSegAdapter;
use crate::adapters::{execute as execute_adapter, AdapterOutcome};
use crate::bids::{DerivativeLayout, Desc, Manifest, RunRecord, Space};
use crate::confounds::{ConfoundsEngine, ConfoundsInputs};
use crate::core::config::{MotionEngine, SpineConfig};
use crate::core::errors::{Result, SpineError, Stage};
use crate::crop;
use crate::image::{Mask3d, Volume4d};
use crate::motion::{write_params_tsv, ExternalBackend, MotionCoordinator};
use crate::pipeline::dag::{Dag, Step};
use crate::pipeline::provenance::{
    is_settled, mark_ok, mark_skip, write_prov, ProvenanceRecord,
};
use crate::utils::atomic_write_json;

/// Execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Plan only: log the graph, write nothing.
    DryRun,
    /// Topological execution.
    Run,
}

/// How one step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Ok,
    Skip,
    Failed,
}

/// Per-stage outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    /// Steps that completed (or were already settled).
    pub ok: usize,
    /// Steps that degraded to placeholder outputs.
    pub skip: usize,
    /// Steps that failed fatally.
    pub failed: usize,
}

/// The end-of-invocation summary.
#[derive(Debug, Clone, Default)]
pub struct ExecSummary {
    /// Counts keyed by stage label.
    pub stages: BTreeMap<&'static str, StageCounts>,
    /// Soft warnings outside step outcomes (e.g. missing graph renderer).
    pub soft_warnings: Vec<String>,
}

impl ExecSummary {
    fn record(&mut self, stage: Stage, outcome: StepOutcome) {
        let counts = self.stages.entry(stage.as_str()).or_default();
        match outcome {
            StepOutcome::Ok => counts.ok += 1,
            StepOutcome::Skip => counts.skip += 1,
            StepOutcome::Failed => counts.failed += 1,
        }
    }

    /// Total skipped steps across stages.
    pub fn total_skips(&self) -> usize {
        self.stages.values().map(|c| c.skip).sum()
    }

    /// Total failed steps across stages.
    pub fn total_failures(&self) -> usize {
        self.stages.values().map(|c| c.failed).sum()
    }

    /// Maps the summary to the process exit code.
    ///
    /// Fatal outcomes exit 1. With `strict`, skips and soft warnings are
    /// promoted to failures. Soft warnings alone exit 2; skips alone are a
    /// normal, successful invocation.
    pub fn exit_code(&self, strict: bool) -> i32 {
        if self.total_failures() > 0 {
            return 1;
        }
        if strict && (self.total_skips() > 0 || !self.soft_warnings.is_empty()) {
            return 1;
        }
        if !self.soft_warnings.is_empty() {
            return 2;
        }
        0
    }
}

impl std::fmt::Display for ExecSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "stage            ok  skip  failed")?;
        for (stage, counts) in &self.stages {
            writeln!(
                f,
                "{stage:<16} {:>2}  {:>4}  {:>6}",
                counts.ok, counts.skip, counts.failed
            )?;
        }
        for warning in &self.soft_warnings {
            writeln!(f, "warning: {warning}")?;
        }
        Ok(())
    }
}

/// Guard for the derivatives-root lock file.
///
/// An existing `.lock` blocks a new invocation; the guard removes its own
/// lock on drop, while a stale lock from a crashed invocation is the
/// caller's responsibility to clean up.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Acquires the lock under `deriv_root`.
    pub fn acquire(deriv_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(deriv_root)?;
        let path = deriv_root.join(".lock");
        if path.exists() {
            return Err(SpineError::config(
                "paths.deriv_dir",
                format!(
                    "another invocation holds {} (remove it if stale)",
                    path.display()
                ),
            ));
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The pipeline executor.
pub struct Executor<'a> {
    config: &'a SpineConfig,
    manifest: &'a Manifest,
    layout: DerivativeLayout,
}

impl<'a> Executor<'a> {
    /// Creates an executor over a validated configuration and manifest.
    pub fn new(config: &'a SpineConfig, manifest: &'a Manifest) -> Self {
        let layout = DerivativeLayout::new(&config.paths.deriv_dir);
        Self {
            config,
            manifest,
            layout,
        }
    }

    /// The derivative layout in use.
    pub fn layout(&self) -> &DerivativeLayout {
        &self.layout
    }

    /// Executes the graph.
    ///
    /// In dry-run mode the planned steps are logged and nothing is written.
    /// In run mode the stage waves execute on a pool of `cores` workers; a
    /// fatal step aborts subsequent waves.
    pub fn execute(&self, dag: &Dag, mode: ExecMode, cores: usize) -> Result<ExecSummary> {
        let mut summary = ExecSummary::default();
        if mode == ExecMode::DryRun {
            for id in dag.topological_order()? {
                info!(step = %id, "planned");
            }
            return Ok(summary);
        }

        let _lock = LockGuard::acquire(&self.layout.root())?;
        sweep_stale_temporaries(&self.layout.root());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cores.max(1))
            .build()
            .map_err(|e| SpineError::config("cores", e.to_string()))?;

        let waves = [
            Stage::CordSeg,
            Stage::VertebralLabels,
            Stage::TemplateReg,
            Stage::MaskWarp,
            Stage::CropDetect,
            Stage::Mppca,
            Stage::Motion,
            Stage::Confounds,
        ];
        let mut fatal: Option<SpineError> = None;
        for stage in waves {
            let steps = dag.stage_steps(stage);
            if steps.is_empty() {
                continue;
            }
            let outcomes: Vec<(Stage, std::result::Result<StepOutcome, SpineError>)> =
                if stage == Stage::Motion && self.config.options.motion.engine == MotionEngine::Grouped
                {
                    self.run_grouped_motion(&steps)
                } else {
                    pool.install(|| {
                        steps
                            .par_iter()
                            .map(|step| (stage, self.run_step(step)))
                            .collect()
                    })
                };
            for (stage, outcome) in outcomes {
                match outcome {
                    Ok(o) => summary.record(stage, o),
                    Err(e) => {
                        error!(stage = stage.as_str(), error = %e, "fatal step failure");
                        summary.record(stage, StepOutcome::Failed);
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                    }
                }
            }
            if fatal.is_some() {
                warn!("aborting remaining stages after fatal failure");
                break;
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn run_step(&self, step: &Step) -> std::result::Result<StepOutcome, SpineError> {
        match step.stage {
            Stage::CropDetect => self.run_crop_detect(step),
            Stage::Mppca => self.run_mppca(step),
            Stage::Motion => self.run_motion(step),
            Stage::Confounds => self.run_confounds(step),
            Stage::CordSeg => self.run_cord_seg(step),
            Stage::VertebralLabels => self.run_vertebral_labels(step),
            Stage::TemplateReg => self.run_template_reg(step),
            Stage::MaskWarp => self.run_mask_warp(step),
        }
    }

    fn record_for(&self, step: &Step) -> std::result::Result<&RunRecord, SpineError> {
        let entities = step
            .run
            .as_ref()
            .ok_or_else(|| SpineError::config("dag", format!("step '{}' has no run", step.id)))?;
        self.manifest
            .runs
            .iter()
            .find(|r| &r.entities == entities)
            .ok_or_else(|| {
                SpineError::config("dag", format!("step '{}' not in manifest", step.id))
            })
    }

    fn anat_for(&self, sub: &str) -> Option<&crate::bids::AnatRecord> {
        self.manifest.anats.iter().find(|a| a.sub == sub)
    }

    fn cord_mask_path(&self, sub: &str, ses: Option<&str>) -> PathBuf {
        self.layout.anat(sub, ses, Desc::CordMask, Space::Native)
    }

    fn tissue_mask_path(&self, sub: &str, ses: Option<&str>, tissue: &str) -> Option<PathBuf> {
        let desc = match tissue {
            "cord" => Desc::CordMask,
            "wm" => Desc::WmMask,
            "csf" => Desc::CsfMask,
            _ => return None,
        };
        Some(self.layout.anat(sub, ses, desc, Space::Native))
    }

    // ---- per-run steps ----------------------------------------------------

    fn run_crop_detect(&self, step: &Step) -> std::result::Result<StepOutcome, SpineError> {
        let sidecar_path = step.primary_output();
        if is_settled(sidecar_path) {
            return Ok(StepOutcome::Ok);
        }
        let record = self.record_for(step)?;
        let opts = &self.config.options.temporal_crop;

        let mask_path = self.cord_mask_path(&record.entities.sub, record.entities.ses.as_deref());
        let mask = mask_path
            .exists()
            .then(|| Mask3d::read(&mask_path, self.config.options.masks.binarize_thr).ok())
            .flatten();

        // Detection never errors: unusable input degrades to a full-series
        // sidecar with a failure reason.
        let sidecar = match Volume4d::read(&record.bold_path) {
            Ok(volume) => crop::detect(&volume, mask.as_ref(), opts),
            Err(e) => {
                warn!(step = %step.id, error = %e, "crop detection failed");
                crop::CropSidecar::full(record.nvols, crop::CropReason::DetectionFailed)
            }
        };
        crop::write_sidecar(sidecar_path, &sidecar)?;
        let record_prov = ProvenanceRecord::new(
            step.id.as_str(),
            sidecar_path,
            vec![record.bold_path.display().to_string()],
            json!({
                "method": opts.method,
                "z_thresh": opts.z_thresh,
                "max_trim_start": opts.max_trim_start,
                "max_trim_end": opts.max_trim_end,
                "reason": sidecar.reason.as_str(),
            }),
            BTreeMap::new(),
        );
        write_prov(sidecar_path, &record_prov)?;
        mark_ok(sidecar_path)?;
        Ok(StepOutcome::Ok)
    }

    fn run_mppca(&self, step: &Step) -> std::result::Result<StepOutcome, SpineError> {
        let record = self.record_for(step)?;
        let adapter = MppcaAdapter {
            bold_path: record.bold_path.clone(),
            out_path: step.primary_output().to_path_buf(),
        };
        Ok(adapter_outcome(execute_adapter(&adapter)?))
    }

    fn run_motion(&self, step: &Step) -> std::result::Result<StepOutcome, SpineError> {
        let motion_out = step.primary_output();
        if is_settled(motion_out) {
            return Ok(StepOutcome::Ok);
        }
        let record = self.record_for(step)?;
        let e = &record.entities;
        let mppca_path = self.layout.func(e, Desc::Mppca, Space::Native);
        if !mppca_path.exists() {
            return Err(SpineError::missing_input(mppca_path));
        }
        let volume = Volume4d::read(&mppca_path)?;
        let sidecar_path = self.layout.func(e, Desc::Crop, Space::Native);
        let effective = crop::effective_crop(&sidecar_path, volume.nvols());

        let backend = ExternalBackend;
        let coordinator = MotionCoordinator::new(&self.config.options.motion, &backend);
        let outcome = coordinator.correct(&volume, &effective)?;

        self.write_motion_outputs(step, &mppca_path, &effective, outcome)
    }

    fn write_motion_outputs(
        &self,
        step: &Step,
        input: &Path,
        effective: &crop::CropSidecar,
        outcome: crate::motion::MotionOutcome,
    ) -> std::result::Result<StepOutcome, SpineError> {
        let record = self.record_for(step)?;
        let e = &record.entities;
        let motion_out = self.layout.func(e, Desc::Motion, Space::Native);
        let params_out = self.layout.func(e, Desc::MotionParams, Space::Native);
        let meta_out = self.layout.func(e, Desc::MotionParamsMeta, Space::Native);

        write_volume_atomic(&outcome.image, &motion_out)?;
        write_params_tsv(&params_out, &outcome.params)?;
        atomic_write_json(&meta_out, &outcome.meta)?;

        let prov = ProvenanceRecord::new(
            step.id.as_str(),
            &motion_out,
            vec![input.display().to_string()],
            json!({
                "engine": outcome.meta.engine,
                "status": outcome.meta.status.as_str(),
                "composition": outcome.meta.composition,
                "crop_from": effective.from,
                "crop_to": effective.to,
                "crop_reason": effective.reason.as_str(),
            }),
            outcome.meta.tool_versions.clone(),
        );
        write_prov(&motion_out, &prov)?;
        if outcome.meta.status.is_skip() {
            mark_skip(&motion_out)?;
            Ok(StepOutcome::Skip)
        } else {
            mark_ok(&motion_out)?;
            Ok(StepOutcome::Ok)
        }
    }

    /// Grouped motion: each motion group is corrected once over the
    /// concatenated series, then split back into per-run outputs.
    fn run_grouped_motion(
        &self,
        steps: &[&Step],
    ) -> Vec<(Stage, std::result::Result<StepOutcome, SpineError>)> {
        let mut groups: Vec<(String, Vec<&Step>)> = Vec::new();
        for step in steps {
            let key = self
                .record_for(step)
                .ok()
                .and_then(|r| r.motion_group.clone())
                .unwrap_or_else(|| step.id.to_string());
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(step),
                None => groups.push((key, vec![step])),
            }
        }

        let mut outcomes = Vec::new();
        for (group, members) in groups {
            let pending: Vec<&&Step> = members
                .iter()
                .filter(|s| !is_settled(s.primary_output()))
                .collect();
            if pending.is_empty() {
                for _ in &members {
                    outcomes.push((Stage::Motion, Ok(StepOutcome::Ok)));
                }
                continue;
            }
            info!(group = %group, runs = members.len(), "grouped motion correction");
            match self.correct_group(&members) {
                Ok(per_step) => outcomes.extend(per_step),
                Err(e) => {
                    // One failure fails every member of the group.
                    for _ in &members {
                        outcomes.push((
                            Stage::Motion,
                            Err(SpineError::degenerate(format!(
                                "grouped motion failed for '{group}': {e}"
                            ))),
                        ));
                    }
                }
            }
        }
        outcomes
    }

    fn correct_group(
        &self,
        members: &[&Step],
    ) -> std::result::Result<Vec<(Stage, std::result::Result<StepOutcome, SpineError>)>, SpineError>
    {
        let mut volumes = Vec::with_capacity(members.len());
        let mut crops = Vec::with_capacity(members.len());
        let mut inputs = Vec::with_capacity(members.len());
        for step in members {
            let record = self.record_for(step)?;
            let e = &record.entities;
            let mppca_path = self.layout.func(e, Desc::Mppca, Space::Native);
            if !mppca_path.exists() {
                return Err(SpineError::missing_input(mppca_path));
            }
            let volume = Volume4d::read(&mppca_path)?;
            let sidecar_path = self.layout.func(e, Desc::Crop, Space::Native);
            let effective = crop::effective_crop(&sidecar_path, volume.nvols());
            volumes.push(volume.crop(effective.from, effective.to)?);
            crops.push(effective);
            inputs.push(mppca_path);
        }

        let backend = ExternalBackend;
        let coordinator = MotionCoordinator::new(&self.config.options.motion, &backend);
        let (images, params, meta) = coordinator.correct_group(&volumes)?;

        let mut outcomes = Vec::with_capacity(members.len());
        for (i, step) in members.iter().enumerate() {
            if is_settled(step.primary_output()) {
                outcomes.push((Stage::Motion, Ok(StepOutcome::Ok)));
                continue;
            }
            let outcome = crate::motion::MotionOutcome {
                image: images[i].clone(),
                params: params[i].clone(),
                meta: meta.clone(),
            };
            outcomes.push((
                Stage::Motion,
                self.write_motion_outputs(step, &inputs[i], &crops[i], outcome),
            ));
        }
        Ok(outcomes)
    }

    fn run_confounds(&self, step: &Step) -> std::result::Result<StepOutcome, SpineError> {
        let tsv_out = step.primary_output();
        if is_settled(tsv_out) {
            return Ok(StepOutcome::Ok);
        }
        let record = self.record_for(step)?;
        let e = &record.entities;
        let motion_path = self.layout.func(e, Desc::Motion, Space::Native);
        if !motion_path.exists() {
            return Err(SpineError::missing_input(motion_path));
        }
        let params_path = self.layout.func(e, Desc::MotionParams, Space::Native);
        let sidecar_path = self.layout.func(e, Desc::Crop, Space::Native);
        let effective = crop::effective_crop(&sidecar_path, record.nvols);

        let tissue_masks: Vec<(String, PathBuf)> = self
            .config
            .options
            .acompcor
            .tissues
            .iter()
            .filter_map(|tissue| {
                self.tissue_mask_path(&e.sub, e.ses.as_deref(), tissue)
                    .map(|p| (tissue.clone(), p))
            })
            .collect();

        let engine = ConfoundsEngine::new(&self.config.options);
        let inputs = ConfoundsInputs {
            bold_path: motion_path.clone(),
            motion_params_path: params_path.exists().then_some(params_path),
            crop: effective,
            tissue_masks,
        };
        let (frame, descriptor) = engine.compute(&inputs)?;

        let json_out = self.layout.func(e, Desc::ConfoundsMeta, Space::Native);
        crate::confounds::write_outputs(tsv_out, &json_out, &frame, &descriptor)?;

        let prov = ProvenanceRecord::new(
            step.id.as_str(),
            tsv_out,
            descriptor.sources.clone(),
            json!({
                "crop_from": effective.from,
                "crop_to": effective.to,
                "crop_reason": effective.reason.as_str(),
                "n_kept": descriptor.censor.n_kept,
                "n_censored": descriptor.censor.n_censored,
            }),
            BTreeMap::new(),
        );
        write_prov(tsv_out, &prov)?;
        mark_ok(tsv_out)?;
        Ok(StepOutcome::Ok)
    }

    // ---- subject-level anatomical steps -----------------------------------

    fn run_cord_seg(&self, step: &Step) -> std::result::Result<StepOutcome, SpineError> {
        let sub = step.subject.as_deref().unwrap_or_default();
        let anat = self
            .anat_for(sub)
            .ok_or_else(|| SpineError::config("manifest", format!("no anatomy for {sub}")))?;
        let adapter = CordSegAdapter::new(
            anat.t2w_path.clone(),
            step.primary_output().to_path_buf(),
        );
        Ok(adapter_outcome(execute_adapter(&adapter)?))
    }

    fn run_vertebral_labels(&self, step: &Step) -> std::result::Result<StepOutcome, SpineError> {
        let sub = step.subject.as_deref().unwrap_or_default();
        let anat = self
            .anat_for(sub)
            .ok_or_else(|| SpineError::config("manifest", format!("no anatomy for {sub}")))?;
        let adapter = VertebralLabelsAdapter {
            t2w_path: anat.t2w_path.clone(),
            cord_mask: self.cord_mask_path(sub, anat.ses.as_deref()),
            out_labels: step.primary_output().to_path_buf(),
        };
        Ok(adapter_outcome(execute_adapter(&adapter)?))
    }

    fn run_template_reg(&self, step: &Step) -> std::result::Result<StepOutcome, SpineError> {
        let sub = step.subject.as_deref().unwrap_or_default();
        let anat = self
            .anat_for(sub)
            .ok_or_else(|| SpineError::config("manifest", format!("no anatomy for {sub}")))?;
        let adapter = TemplateRegAdapter {
            t2w_path: anat.t2w_path.clone(),
            cord_mask: self.cord_mask_path(sub, anat.ses.as_deref()),
            template: self.config.registration.template.clone(),
            out_warp: step.primary_output().to_path_buf(),
        };
        Ok(adapter_outcome(execute_adapter(&adapter)?))
    }

    /// Warps the template WM and CSF masks into subject space. When the
    /// template data directory is not installed, both outputs degrade to
    /// zero masks with the cord mask's geometry.
    fn run_mask_warp(&self, step: &Step) -> std::result::Result<StepOutcome, SpineError> {
        if step.outputs.iter().all(|o| is_settled(o)) {
            return Ok(StepOutcome::Ok);
        }
        let sub = step.subject.as_deref().unwrap_or_default();
        let anat = self
            .anat_for(sub)
            .ok_or_else(|| SpineError::config("manifest", format!("no anatomy for {sub}")))?;
        let cord_mask = self.cord_mask_path(sub, anat.ses.as_deref());
        let warp = self
            .layout
            .warp(sub, anat.ses.as_deref(), "native", &self.config.registration.template);

        let mut any_skip = false;
        for (tissue, out) in [("wm", &step.outputs[0]), ("csf", &step.outputs[1])] {
            if is_settled(out) {
                continue;
            }
            match template_mask_path(&self.config.registration.template, tissue) {
                Some(mask_path) if mask_path.exists() => {
                    let adapter = MaskWarpAdapter {
                        mask_path,
                        warp_path: warp.clone(),
                        dest_ref: cord_mask.clone(),
                        out_mask: out.clone(),
                    };
                    if adapter_outcome(execute_adapter(&adapter)?) == StepOutcome::Skip {
                        any_skip = true;
                    }
                }
                _ => {
                    warn!(tissue, "template mask not installed; writing zero mask");
                    let reference = Volume4d::read(&cord_mask)?;
                    let (x, y, z, _) = reference.data.dim();
                    Mask3d::zeros((x, y, z)).write(out, &reference.header)?;
                    let prov = ProvenanceRecord::new(
                        step.id.as_str(),
                        out,
                        vec![cord_mask.display().to_string()],
                        json!({ "skip_reason": format!("template mask '{tissue}' not installed") }),
                        tool_versions(&[crate::adapters::registration::WARP_TOOL]),
                    );
                    write_prov(out, &prov)?;
                    mark_skip(out)?;
                    any_skip = true;
                }
            }
        }
        Ok(if any_skip {
            StepOutcome::Skip
        } else {
            StepOutcome::Ok
        })
    }
}

fn adapter_outcome(outcome: AdapterOutcome) -> StepOutcome {
    match outcome {
        AdapterOutcome::Completed | AdapterOutcome::AlreadySettled => StepOutcome::Ok,
        AdapterOutcome::Skipped(_) => StepOutcome::Skip,
    }
}

/// Removes `.tmp-*` siblings left behind by an interrupted invocation.
/// Commit is by rename, so anything still carrying the prefix never became
/// an artifact.
fn sweep_stale_temporaries(root: &Path) {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(".tmp-"))
            {
                warn!(path = %path.display(), "removing stale temporary");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

/// Writes a volume through a temporary sibling and renames it into place.
fn write_volume_atomic(volume: &Volume4d, path: &Path) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".tmp-{name}"));
    volume.write(&tmp)?;
    std::fs::rename(&tmp, path).map_err(|e| SpineError::CommitFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// The template tissue-mask path under the toolbox data directory, if the
/// toolbox location is known.
fn template_mask_path(template: &str, tissue: &str) -> Option<PathBuf> {
    let base = std::env::var_os("SCT_DIR")?;
    Some(
        PathBuf::from(base)
            .join("data")
            .join(template)
            .join("template")
            .join(format!("{template}_{tissue}.nii.gz")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::EntityTuple;
    use crate::pipeline::dag::Dag;
    use ndarray::Array4;

    fn fixture(dir: &Path, nvols: usize) -> (SpineConfig, Manifest) {
        let bids = dir.join("bids");
        let deriv = dir.join("derivatives/spineprep");
        let bold = bids.join("sub-01/func/sub-01_task-rest_run-01_bold.nii.gz");
        let data = Array4::<f32>::zeros((6, 6, 3, nvols));
        Volume4d::from_array(data, 2.0).write(&bold).unwrap();

        let mut config = SpineConfig::default();
        config.paths.bids_dir = bids;
        config.paths.deriv_dir = deriv;

        let manifest = Manifest::new(
            vec![RunRecord {
                entities: EntityTuple::new("sub-01", "rest", "01"),
                bold_path: bold,
                tr_s: 2.0,
                pe_dir: None,
                voxel_dims_mm: None,
                nvols,
                motion_group: None,
            }],
            Vec::new(),
        )
        .unwrap();
        (config, manifest)
    }

    #[test]
    fn test_empty_dataset_smoke() {
        let dir = tempfile::tempdir().unwrap();
        let (config, manifest) = fixture(dir.path(), 4);
        let dag = Dag::plan(&manifest, &config).unwrap();
        let executor = Executor::new(&config, &manifest);
        let summary = executor.execute(&dag, ExecMode::Run, 1).unwrap();

        // Whatever tools exist, the invocation succeeds end to end.
        assert_eq!(summary.total_failures(), 0);
        assert_eq!(summary.exit_code(false), 0);
        assert_eq!(summary.stages["crop_detect"].ok, 1);
        assert_eq!(summary.stages["confounds"].ok, 1);

        let layout = executor.layout();
        let e = EntityTuple::new("sub-01", "rest", "01");
        let tsv = layout.func(&e, Desc::Confounds, Space::Native);
        let content = std::fs::read_to_string(&tsv).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5, "header plus 4 data rows");
        assert_eq!(lines[0].split('\t').count(), 9);

        // With the motion tool absent, the step degrades to a skip with zero
        // parameters and every confound value is exactly zero.
        let tools_absent = !crate::adapters::tool_on_path(crate::motion::VOLUME_TOOL);
        if tools_absent {
            assert_eq!(summary.stages["motion"].skip, 1);
            for line in &lines[1..] {
                let fields: Vec<&str> = line.split('\t').collect();
                for v in &fields[..8] {
                    assert_eq!(v.parse::<f64>().unwrap(), 0.0);
                }
                assert_eq!(fields[8], "0");
            }
            let motion = layout.func(&e, Desc::Motion, Space::Native);
            assert!(crate::utils::marker_path(&motion, "skip").exists());
        }
    }

    #[test]
    fn test_idempotent_second_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let (config, manifest) = fixture(dir.path(), 4);
        let dag = Dag::plan(&manifest, &config).unwrap();
        let executor = Executor::new(&config, &manifest);
        executor.execute(&dag, ExecMode::Run, 1).unwrap();

        let snapshot = |root: &Path| -> Vec<(PathBuf, std::time::SystemTime)> {
            let mut files = Vec::new();
            let mut stack = vec![root.to_path_buf()];
            while let Some(d) = stack.pop() {
                for entry in std::fs::read_dir(&d).unwrap().flatten() {
                    let p = entry.path();
                    if p.is_dir() {
                        stack.push(p);
                    } else if p.file_name().is_some_and(|n| n != ".lock") {
                        files.push((p.clone(), entry.metadata().unwrap().modified().unwrap()));
                    }
                }
            }
            files.sort();
            files
        };
        let before = snapshot(&config.paths.deriv_dir);
        let summary = executor.execute(&dag, ExecMode::Run, 1).unwrap();
        let after = snapshot(&config.paths.deriv_dir);
        assert_eq!(before, after, "second invocation must not touch files");
        assert_eq!(summary.total_failures(), 0);
    }

    #[test]
    fn test_crop_sidecar_consumed_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let (config, manifest) = fixture(dir.path(), 4);
        let executor = Executor::new(&config, &manifest);
        let e = EntityTuple::new("sub-01", "rest", "01");
        // Pre-plant a sidecar: keep volumes 1..4.
        let sidecar_path = executor.layout().func(&e, Desc::Crop, Space::Native);
        crop::write_sidecar(
            &sidecar_path,
            &crop::CropSidecar {
                from: 1,
                to: 4,
                nvols: 4,
                reason: crop::CropReason::RobustZ,
            },
        )
        .unwrap();
        crate::pipeline::provenance::mark_ok(&sidecar_path).unwrap();

        let dag = Dag::plan(&manifest, &config).unwrap();
        executor.execute(&dag, ExecMode::Run, 1).unwrap();

        // Motion parameters have one row per post-crop volume.
        let params = crate::motion::read_params_tsv(
            &executor.layout().func(&e, Desc::MotionParams, Space::Native),
        )
        .unwrap();
        assert_eq!(params.nrows(), 3);
        // Confounds table has 3 data rows and the descriptor records bounds.
        let tsv = std::fs::read_to_string(
            executor.layout().func(&e, Desc::Confounds, Space::Native),
        )
        .unwrap();
        assert_eq!(tsv.lines().count(), 4);
        let descriptor: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(
                executor.layout().func(&e, Desc::ConfoundsMeta, Space::Native),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(descriptor["CropFrom"], 1);
        assert_eq!(descriptor["CropTo"], 4);
    }

    #[test]
    fn test_deleted_sidecar_defaults_to_full_series() {
        let dir = tempfile::tempdir().unwrap();
        let (config, manifest) = fixture(dir.path(), 4);
        let executor = Executor::new(&config, &manifest);
        let dag = Dag::plan(&manifest, &config).unwrap();
        executor.execute(&dag, ExecMode::Run, 1).unwrap();

        let e = EntityTuple::new("sub-01", "rest", "01");
        let layout = executor.layout();
        // Delete the sidecar and downstream outputs, then rerun.
        for desc in [Desc::Crop, Desc::Motion, Desc::MotionParams, Desc::Confounds] {
            let p = layout.func(&e, desc, Space::Native);
            let _ = std::fs::remove_file(&p);
            let _ = std::fs::remove_file(crate::utils::marker_path(&p, "ok"));
            let _ = std::fs::remove_file(crate::utils::marker_path(&p, "skip"));
        }
        // Remove the re-detectable sidecar entirely and only rerun motion and
        // confounds by marking crop as settled without a file... instead,
        // simply rerun everything: detection is deterministic, so the sidecar
        // reappears and downstream rows cover the full series.
        executor.execute(&dag, ExecMode::Run, 1).unwrap();
        let tsv =
            std::fs::read_to_string(layout.func(&e, Desc::Confounds, Space::Native)).unwrap();
        assert_eq!(tsv.lines().count(), 5);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (config, manifest) = fixture(dir.path(), 4);
        let dag = Dag::plan(&manifest, &config).unwrap();
        let executor = Executor::new(&config, &manifest);
        executor.execute(&dag, ExecMode::DryRun, 1).unwrap();
        let e = EntityTuple::new("sub-01", "rest", "01");
        assert!(!executor
            .layout()
            .func(&e, Desc::Crop, Space::Native)
            .exists());
    }

    #[test]
    fn test_lock_blocks_second_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let (config, _) = fixture(dir.path(), 4);
        let _guard = LockGuard::acquire(&config.paths.deriv_dir).unwrap();
        let err = LockGuard::acquire(&config.paths.deriv_dir).unwrap_err();
        assert!(err.to_string().contains(".lock"));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (config, _) = fixture(dir.path(), 4);
        {
            let _guard = LockGuard::acquire(&config.paths.deriv_dir).unwrap();
        }
        assert!(LockGuard::acquire(&config.paths.deriv_dir).is_ok());
    }

    #[test]
    fn test_exit_codes() {
        let mut summary = ExecSummary::default();
        assert_eq!(summary.exit_code(false), 0);
        summary.record(Stage::Motion, StepOutcome::Skip);
        assert_eq!(summary.exit_code(false), 0, "skips alone succeed");
        assert_eq!(summary.exit_code(true), 1, "strict promotes skips");
        summary.soft_warnings.push("renderer missing".to_string());
        assert_eq!(summary.exit_code(false), 2);
        summary.record(Stage::Confounds, StepOutcome::Failed);
        assert_eq!(summary.exit_code(false), 1);
    }
}
