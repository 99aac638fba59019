//! Build-graph construction and export.
//!
//! `Dag::plan` converts the manifest plus the merged configuration into a
//! directed acyclic graph of build steps: one step per (run, stage) in the
//! fixed stage order, plus subject-level anatomical steps when registration
//! is enabled. Steps bind to run identifiers as wildcards: the graph records
//! only identities and output paths, never per-run input closures, so crop
//! sidecars written mid-execution never force a graph rebuild.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapters::command::{run_tool, tool_on_path};
use crate::bids::{DerivativeLayout, Desc, EntityTuple, Manifest, Space};
use crate::core::config::SpineConfig;
use crate::core::errors::{Result, SpineError, Stage};
use crate::utils::atomic_write;

/// Unique identifier for a build step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    /// Creates a step id from a stage and a wildcard key.
    pub fn new(stage: Stage, key: &str) -> Self {
        Self(format!("{}_{key}", stage.as_str()))
    }

    /// The string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One build step in the graph.
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique id (`{stage}_{key}`).
    pub id: StepId,
    /// The stage this step belongs to.
    pub stage: Stage,
    /// The run identity for per-run steps.
    pub run: Option<EntityTuple>,
    /// The subject for subject-level anatomical steps.
    pub subject: Option<String>,
    /// Declared outputs; the first is the primary output.
    pub outputs: Vec<PathBuf>,
    /// Steps that must settle before this one runs.
    pub deps: Vec<StepId>,
}

impl Step {
    /// The primary output used for settled checks and markers.
    pub fn primary_output(&self) -> &Path {
        &self.outputs[0]
    }
}

/// The build graph for one invocation.
#[derive(Debug)]
pub struct Dag {
    steps: Vec<Step>,
    index: HashMap<StepId, usize>,
}

impl Dag {
    /// Plans the graph from the manifest and configuration.
    pub fn plan(manifest: &Manifest, config: &SpineConfig) -> Result<Dag> {
        let layout = DerivativeLayout::new(&config.paths.deriv_dir);
        let mut dag = Dag {
            steps: Vec::new(),
            index: HashMap::new(),
        };

        // Subject-level anatomical stages, conditional on registration.
        if config.registration.enable {
            for anat in &manifest.anats {
                let sub = anat.sub.clone();
                let ses = anat.ses.as_deref();
                let seg_id = dag.push(Step {
                    id: StepId::new(Stage::CordSeg, &sub),
                    stage: Stage::CordSeg,
                    run: None,
                    subject: Some(sub.clone()),
                    outputs: vec![layout.anat(&sub, ses, Desc::CordMask, Space::Native)],
                    deps: Vec::new(),
                })?;
                let labels_out = layout
                    .anat(&sub, ses, Desc::CordMask, Space::Native)
                    .with_file_name(format!("{sub}_desc-labels_dseg.nii.gz"));
                dag.push(Step {
                    id: StepId::new(Stage::VertebralLabels, &sub),
                    stage: Stage::VertebralLabels,
                    run: None,
                    subject: Some(sub.clone()),
                    outputs: vec![labels_out],
                    deps: vec![seg_id.clone()],
                })?;
                let reg_id = dag.push(Step {
                    id: StepId::new(Stage::TemplateReg, &sub),
                    stage: Stage::TemplateReg,
                    run: None,
                    subject: Some(sub.clone()),
                    outputs: vec![layout.warp(
                        &sub,
                        ses,
                        "native",
                        &config.registration.template,
                    )],
                    deps: vec![seg_id],
                })?;
                dag.push(Step {
                    id: StepId::new(Stage::MaskWarp, &sub),
                    stage: Stage::MaskWarp,
                    run: None,
                    subject: Some(sub.clone()),
                    outputs: vec![
                        layout.anat(&sub, ses, Desc::WmMask, Space::Native),
                        layout.anat(&sub, ses, Desc::CsfMask, Space::Native),
                    ],
                    deps: vec![reg_id],
                })?;
            }
        }

        // Per-run stages in fixed order.
        for run in &manifest.runs {
            let e = &run.entities;
            let key = e.run_key();
            let crop_id = dag.push(Step {
                id: StepId::new(Stage::CropDetect, &key),
                stage: Stage::CropDetect,
                run: Some(e.clone()),
                subject: None,
                outputs: vec![layout.func(e, Desc::Crop, Space::Native)],
                deps: Vec::new(),
            })?;
            let mppca_id = dag.push(Step {
                id: StepId::new(Stage::Mppca, &key),
                stage: Stage::Mppca,
                run: Some(e.clone()),
                subject: None,
                outputs: vec![layout.func(e, Desc::Mppca, Space::Native)],
                deps: vec![crop_id.clone()],
            })?;
            let motion_id = dag.push(Step {
                id: StepId::new(Stage::Motion, &key),
                stage: Stage::Motion,
                run: Some(e.clone()),
                subject: None,
                outputs: vec![
                    layout.func(e, Desc::Motion, Space::Native),
                    layout.func(e, Desc::MotionParams, Space::Native),
                    layout.func(e, Desc::MotionParamsMeta, Space::Native),
                ],
                deps: vec![crop_id, mppca_id],
            })?;
            let mut confounds_deps = vec![motion_id];
            if config.registration.enable {
                let warp_id = StepId::new(Stage::MaskWarp, &e.sub);
                if dag.index.contains_key(&warp_id) {
                    confounds_deps.push(warp_id);
                }
            }
            dag.push(Step {
                id: StepId::new(Stage::Confounds, &key),
                stage: Stage::Confounds,
                run: Some(e.clone()),
                subject: None,
                outputs: vec![
                    layout.func(e, Desc::Confounds, Space::Native),
                    layout.func(e, Desc::ConfoundsMeta, Space::Native),
                ],
                deps: confounds_deps,
            })?;
        }

        info!(steps = dag.steps.len(), "plan complete");
        Ok(dag)
    }

    fn push(&mut self, step: Step) -> Result<StepId> {
        if self.index.contains_key(&step.id) {
            return Err(SpineError::config(
                "manifest",
                format!("duplicate step id '{}'", step.id),
            ));
        }
        for dep in &step.deps {
            if !self.index.contains_key(dep) {
                return Err(SpineError::config(
                    "manifest",
                    format!("step '{}' depends on unknown step '{dep}'", step.id),
                ));
            }
        }
        let id = step.id.clone();
        self.index.insert(id.clone(), self.steps.len());
        self.steps.push(step);
        Ok(id)
    }

    /// All steps in insertion order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Looks up a step by id.
    pub fn get(&self, id: &StepId) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// Steps of one stage, in manifest order.
    pub fn stage_steps(&self, stage: Stage) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.stage == stage).collect()
    }

    /// A topological ordering (Kahn's algorithm, stable by insertion order).
    pub fn topological_order(&self) -> Result<Vec<StepId>> {
        let mut in_degree: HashMap<&StepId, usize> = self
            .steps
            .iter()
            .map(|s| (&s.id, s.deps.len()))
            .collect();
        let mut dependents: HashMap<&StepId, Vec<&StepId>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.deps {
                dependents.entry(dep).or_default().push(&step.id);
            }
        }
        let mut order = Vec::with_capacity(self.steps.len());
        let mut settled: HashSet<&StepId> = HashSet::new();
        while order.len() < self.steps.len() {
            let mut progressed = false;
            for step in &self.steps {
                if settled.contains(&step.id) {
                    continue;
                }
                if in_degree[&step.id] == 0 {
                    settled.insert(&step.id);
                    order.push(step.id.clone());
                    if let Some(children) = dependents.get(&step.id) {
                        for child in children {
                            *in_degree.get_mut(child).expect("known step") -= 1;
                        }
                    }
                    progressed = true;
                }
            }
            if !progressed {
                return Err(SpineError::config("manifest", "dependency cycle in DAG"));
            }
        }
        Ok(order)
    }

    /// Renders the graph in DOT format.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph spineprep {\n  rankdir=LR;\n");
        for step in &self.steps {
            let _ = writeln!(
                out,
                "  \"{}\" [label=\"{}\", shape=box];",
                step.id, step.id
            );
        }
        for step in &self.steps {
            for dep in &step.deps {
                let _ = writeln!(out, "  \"{dep}\" -> \"{}\";", step.id);
            }
        }
        out.push_str("}\n");
        out
    }

    /// Exports the graph for offline visualization.
    ///
    /// An `.svg` destination is rendered through the `dot` binary when it is
    /// available; otherwise (and for every other extension) the DOT text is
    /// written. Returns whether the SVG fallback was taken.
    pub fn export(&self, path: &Path) -> Result<bool> {
        let dot = self.to_dot();
        let wants_svg = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("svg"));
        if wants_svg && tool_on_path("dot") {
            let (_guard, dir) = crate::adapters::command::scratch_dir("dag")?;
            let dot_path = dir.join("dag.dot");
            std::fs::write(&dot_path, &dot)?;
            let output = run_tool(
                "dot",
                &["-Tsvg", dot_path.to_str().unwrap_or_default()],
            )?;
            atomic_write(path, output.stdout.as_bytes())?;
            debug!(path = %path.display(), "DAG rendered to SVG");
            return Ok(false);
        }
        atomic_write(path, dot.as_bytes())?;
        debug!(path = %path.display(), "DAG written as DOT");
        Ok(wants_svg)
    }
}
