//! Per-artifact provenance records and status markers.
//!
//! Every produced artifact gets a `.prov.json` sibling recording the step,
//! its inputs, parameters, tool versions, and a UTC timestamp. Zero-byte
//! `.ok` and `.skip` siblings mark successful completion or graceful skip.
//! All writes commit atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::Result;
use crate::utils::{atomic_write_json, marker_path, touch_marker};

/// One provenance record per produced artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Step name.
    pub step: String,
    /// The produced artifact.
    pub output: String,
    /// Input paths consumed by the step.
    pub inputs: Vec<String>,
    /// Parameter record (step-specific shape).
    pub params: serde_json::Value,
    /// Tool name to version string.
    pub tool_versions: BTreeMap<String, String>,
    /// ISO-8601 UTC timestamp of the record.
    pub timestamp: String,
    /// Producing software version.
    pub software_version: String,
}

impl ProvenanceRecord {
    /// Builds a record stamped with the current UTC time.
    pub fn new(
        step: impl Into<String>,
        output: &Path,
        inputs: Vec<String>,
        params: serde_json::Value,
        tool_versions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            step: step.into(),
            output: output.display().to_string(),
            inputs,
            params,
            tool_versions,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// The `.prov.json` sibling of an artifact.
///
/// Multi-part extensions are kept intact: `bold.nii.gz` maps to
/// `bold.nii.gz.prov.json`.
pub fn prov_path(artifact: &Path) -> PathBuf {
    let mut name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".prov.json");
    artifact.with_file_name(name)
}

/// Writes the provenance record next to its artifact.
pub fn write_prov(artifact: &Path, record: &ProvenanceRecord) -> Result<()> {
    atomic_write_json(&prov_path(artifact), record)
}

/// Marks an artifact as successfully completed.
pub fn mark_ok(artifact: &Path) -> Result<()> {
    mark(artifact, "ok")
}

/// Marks an artifact as gracefully skipped.
pub fn mark_skip(artifact: &Path) -> Result<()> {
    mark(artifact, "skip")
}

fn mark(artifact: &Path, marker: &str) -> Result<()> {
    // A step flipping between outcomes must not leave both markers behind.
    let other = if marker == "ok" { "skip" } else { "ok" };
    let stale = marker_path(artifact, other);
    if stale.exists() {
        let _ = std::fs::remove_file(&stale);
    }
    touch_marker(artifact, marker)
}

/// Whether an artifact is already settled: real output, or a `.skip` marker.
pub fn is_settled(artifact: &Path) -> bool {
    artifact.exists() || marker_path(artifact, "skip").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prov_path_multipart_extension() {
        assert_eq!(
            prov_path(Path::new("/d/sub-01_desc-motion_bold.nii.gz")),
            PathBuf::from("/d/sub-01_desc-motion_bold.nii.gz.prov.json")
        );
        assert_eq!(
            prov_path(Path::new("/d/x.tsv")),
            PathBuf::from("/d/x.tsv.prov.json")
        );
    }

    #[test]
    fn test_write_prov_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("out.tsv");
        let record = ProvenanceRecord::new(
            "confounds",
            &artifact,
            vec!["/in/bold.nii.gz".to_string()],
            serde_json::json!({"fd_thresh_mm": 0.5}),
            BTreeMap::new(),
        );
        write_prov(&artifact, &record).unwrap();
        let loaded: ProvenanceRecord =
            serde_json::from_str(&std::fs::read_to_string(prov_path(&artifact)).unwrap()).unwrap();
        assert_eq!(loaded.step, "confounds");
        assert_eq!(loaded.inputs.len(), 1);
        // Timestamps are UTC with a trailing Z.
        assert!(loaded.timestamp.ends_with('Z'));
    }

    #[test]
    fn test_markers_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("out.json");
        mark_skip(&artifact).unwrap();
        assert!(marker_path(&artifact, "skip").exists());
        mark_ok(&artifact).unwrap();
        assert!(marker_path(&artifact, "ok").exists());
        assert!(!marker_path(&artifact, "skip").exists());
    }

    #[test]
    fn test_is_settled() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("out.json");
        assert!(!is_settled(&artifact));
        mark_skip(&artifact).unwrap();
        assert!(is_settled(&artifact));
    }
}
