//! Per-invocation manifest of runs and anatomical records.
//!
//! The manifest is an ordered sequence of run descriptors plus anatomical
//! records. Ordering is deterministic by (subject, session, task, run), the
//! identity tuple is unique, and run records are immutable after creation.
//! One manifest exists per pipeline invocation; discovery creates it and
//! every downstream component consumes it read-only.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bids::entities::EntityTuple;
use crate::core::errors::{Result, SpineError};

/// One functional acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Identity tuple.
    pub entities: EntityTuple,
    /// Path to the 4-D image.
    pub bold_path: PathBuf,
    /// Repetition time in seconds.
    pub tr_s: f64,
    /// Phase-encode direction, e.g. `AP`.
    pub pe_dir: Option<String>,
    /// Voxel dimensions in millimeters.
    pub voxel_dims_mm: Option<[f64; 3]>,
    /// Number of volumes in the 4-D image.
    pub nvols: usize,
    /// Motion-group key for grouped motion correction.
    pub motion_group: Option<String>,
}

/// One anatomical acquisition (T2-weighted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnatRecord {
    /// Subject identifier, e.g. `sub-01`.
    pub sub: String,
    /// Session identifier, e.g. `ses-01`.
    pub ses: Option<String>,
    /// Path to the T2w image.
    pub t2w_path: PathBuf,
}

/// The ordered manifest for one invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Functional runs, ordered by (subject, session, task, run).
    pub runs: Vec<RunRecord>,
    /// Anatomical records, ordered by (subject, session).
    pub anats: Vec<AnatRecord>,
}

impl Manifest {
    /// Builds a manifest, enforcing the ordering and uniqueness invariants.
    pub fn new(mut runs: Vec<RunRecord>, mut anats: Vec<AnatRecord>) -> Result<Self> {
        runs.sort_by_key(|r| r.entities.order_key());
        anats.sort_by(|a, b| (&a.sub, &a.ses).cmp(&(&b.sub, &b.ses)));

        let mut seen = HashSet::new();
        for run in &runs {
            if !seen.insert(run.entities.clone()) {
                return Err(SpineError::config(
                    "manifest",
                    format!("duplicate run identity: {}", run.entities),
                ));
            }
        }
        debug!(runs = runs.len(), anats = anats.len(), "manifest assembled");
        Ok(Self { runs, anats })
    }

    /// Verifies that every imaging path exists and is readable.
    pub fn verify_readable(&self) -> Result<()> {
        for run in &self.runs {
            std::fs::File::open(&run.bold_path)
                .map_err(|_| SpineError::missing_input(&run.bold_path))?;
        }
        for anat in &self.anats {
            std::fs::File::open(&anat.t2w_path)
                .map_err(|_| SpineError::missing_input(&anat.t2w_path))?;
        }
        Ok(())
    }

    /// Subjects present in the manifest, in order, without duplicates.
    pub fn subjects(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for run in &self.runs {
            if out.last().map(String::as_str) != Some(run.entities.sub.as_str()) {
                out.push(run.entities.sub.clone());
            }
        }
        out.dedup();
        out
    }

    /// Assigns motion-group keys to every run.
    ///
    /// Modes mirror the concatenated-correction grouping: `none` keys each run
    /// by itself; `subject`, `session`, and `session+task` group accordingly.
    /// Fields named in `require_same` must be identical within a group of two
    /// or more runs.
    pub fn assign_motion_groups(&mut self, mode: &str, require_same: &[String]) -> Result<()> {
        if mode == "none" {
            for run in &mut self.runs {
                run.motion_group = Some(format!(
                    "per-run-{}-{}",
                    run.entities.sub, run.entities.run
                ));
            }
            return Ok(());
        }

        let group_key = |e: &EntityTuple| -> Result<String> {
            let ses = e.ses.clone().unwrap_or_default();
            match mode {
                "subject" => Ok(e.sub.clone()),
                "session" => Ok(if ses.is_empty() {
                    e.sub.clone()
                } else {
                    format!("{}_{}", e.sub, ses)
                }),
                "session+task" => Ok(if ses.is_empty() {
                    format!("{}_task-{}", e.sub, e.task)
                } else {
                    format!("{}_{}_task-{}", e.sub, ses, e.task)
                }),
                other => Err(SpineError::config(
                    "options.motion.group_mode",
                    format!("unknown grouping mode '{other}'"),
                )),
            }
        };

        // Collect group membership first so requirement checks see whole groups.
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, run) in self.runs.iter().enumerate() {
            let key = group_key(&run.entities)?;
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(idx),
                None => groups.push((key, vec![idx])),
            }
        }

        for (key, members) in &groups {
            if members.len() < 2 {
                // Single-run groups fall back to per-run keys.
                let run = &mut self.runs[members[0]];
                run.motion_group = Some(format!(
                    "per-run-{}-{}",
                    run.entities.sub, run.entities.run
                ));
                continue;
            }
            for field in require_same {
                let values: HashSet<String> = members
                    .iter()
                    .map(|&i| {
                        let e = &self.runs[i].entities;
                        match field.as_str() {
                            "task" => e.task.clone(),
                            "acq" => e.acq.clone().unwrap_or_default(),
                            "pe_dir" => self.runs[i].pe_dir.clone().unwrap_or_default(),
                            _ => String::new(),
                        }
                    })
                    .collect();
                if values.len() > 1 {
                    return Err(SpineError::config(
                        "options.motion.require_same",
                        format!(
                            "field '{field}' differs within motion group '{key}': {values:?}"
                        ),
                    ));
                }
            }
            for &i in members {
                self.runs[i].motion_group = Some(key.clone());
            }
        }
        Ok(())
    }

    /// Writes the manifest as a TSV table.
    pub fn to_tsv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(path)?;
        writeln!(
            out,
            "sub\tses\ttask\tacq\trun\tbold_path\ttr_s\tpe_dir\tnvols\tmotion_group"
        )?;
        for run in &self.runs {
            let e = &run.entities;
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{:.6}\t{}\t{}\t{}",
                e.sub,
                e.ses.as_deref().unwrap_or(""),
                e.task,
                e.acq.as_deref().unwrap_or(""),
                e.run,
                run.bold_path.display(),
                run.tr_s,
                run.pe_dir.as_deref().unwrap_or(""),
                run.nvols,
                run.motion_group.as_deref().unwrap_or(""),
            )?;
        }
        Ok(())
    }

    /// Reads a manifest TSV written by [`Manifest::to_tsv`].
    pub fn from_tsv(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SpineError::missing_input(path))?;
        let mut lines = content.lines();
        let header = lines
            .next()
            .ok_or_else(|| SpineError::config("manifest", "empty manifest TSV"))?;
        if !header.starts_with("sub\t") {
            return Err(SpineError::config(
                "manifest",
                format!("unexpected manifest header: {header}"),
            ));
        }
        let mut runs = Vec::new();
        for (lineno, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() != 10 {
                return Err(SpineError::config(
                    "manifest",
                    format!("line {}: expected 10 columns, got {}", lineno + 2, cols.len()),
                ));
            }
            let mut entities = EntityTuple::new(cols[0], cols[2], cols[4]);
            if !cols[1].is_empty() {
                entities = entities.with_ses(cols[1]);
            }
            if !cols[3].is_empty() {
                entities = entities.with_acq(cols[3]);
            }
            let tr_s: f64 = cols[6].parse().map_err(|_| {
                SpineError::config("manifest", format!("line {}: bad tr_s", lineno + 2))
            })?;
            let nvols: usize = cols[8].parse().map_err(|_| {
                SpineError::config("manifest", format!("line {}: bad nvols", lineno + 2))
            })?;
            runs.push(RunRecord {
                entities,
                bold_path: PathBuf::from(cols[5]),
                tr_s,
                pe_dir: (!cols[7].is_empty()).then(|| cols[7].to_string()),
                voxel_dims_mm: None,
                nvols,
                motion_group: (!cols[9].is_empty()).then(|| cols[9].to_string()),
            });
        }
        Manifest::new(runs, Vec::new())
    }
}
