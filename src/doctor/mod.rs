//! Environment doctor.
//!
//! Probes every external tool the pipeline can use and reports availability
//! and versions as a machine-readable record. Missing tools are soft
//! warnings: the pipeline degrades to placeholders, but surfacing them up
//! front saves a surprising run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::adapters::command::{tool_on_path, tool_version};
use crate::adapters::denoise::DENOISE_TOOL;
use crate::adapters::labeling::LABELING_TOOL;
use crate::adapters::registration::{REGISTRATION_TOOL, WARP_TOOL};
use crate::adapters::segmentation::SEGMENTATION_TOOL;
use crate::motion::{SLICE_TOOL, VOLUME_TOOL};

/// Availability record for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStatus {
    /// Whether the tool resolves on PATH.
    pub available: bool,
    /// Probed version string (`"unknown"` when unavailable).
    pub version: String,
}

/// The full doctor report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    /// Tool name to status.
    pub tools: BTreeMap<String, ToolStatus>,
}

impl DoctorReport {
    /// Probes every tool the pipeline knows about.
    pub fn probe() -> Self {
        let names = [
            SLICE_TOOL,
            VOLUME_TOOL,
            SEGMENTATION_TOOL,
            LABELING_TOOL,
            REGISTRATION_TOOL,
            WARP_TOOL,
            DENOISE_TOOL,
            "dot",
        ];
        let tools = names
            .iter()
            .map(|&name| {
                let available = tool_on_path(name);
                let version = if available {
                    tool_version(name, "--version")
                } else {
                    "unknown".to_string()
                };
                (name.to_string(), ToolStatus { available, version })
            })
            .collect();
        Self { tools }
    }

    /// Names of missing tools.
    pub fn missing(&self) -> Vec<&str> {
        self.tools
            .iter()
            .filter(|(_, s)| !s.available)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Renders the report as pretty JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_covers_all_tools() {
        let report = DoctorReport::probe();
        assert!(report.tools.contains_key(SLICE_TOOL));
        assert!(report.tools.contains_key(SEGMENTATION_TOOL));
        assert!(report.tools.contains_key(DENOISE_TOOL));
        let json = report.to_json();
        assert!(json.contains("available"));
    }

    #[test]
    fn test_missing_lists_unavailable() {
        let report = DoctorReport::probe();
        for name in report.missing() {
            assert!(!report.tools[name].available);
        }
    }
}
