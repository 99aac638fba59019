//! External-tool adapters.
//!
//! Every adapter follows the same shape: declared inputs, declared outputs,
//! a pre-check that returns early when the primary output or its `.skip`
//! marker already exists, an attempt to run the external tool, and on failure
//! a shape-preserving placeholder plus a `.skip` marker. A `.prov.json`
//! record is always written. Placeholders keep downstream dependency
//! resolution valid: images are zero-valued or copies of the input with a
//! matching header; small files are empty but well-formed.

pub mod command;
pub mod denoise;
pub mod labeling;
pub mod registration;
pub mod segmentation;

use std::path::PathBuf;

use tracing::{info, warn};

use crate::core::errors::{Result, SpineError};
use crate::pipeline::provenance::{
    is_settled, mark_ok, mark_skip, write_prov, ProvenanceRecord,
};

pub use command::{run_tool, tool_on_path, tool_version, tool_versions};

/// How an adapter invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterOutcome {
    /// Real outputs were produced and marked `.ok`.
    Completed,
    /// Placeholder outputs were produced and marked `.skip`.
    Skipped(String),
    /// The output (or its `.skip` marker) already existed; nothing ran.
    AlreadySettled,
}

/// The uniform wrapper contract for external tools.
pub trait ToolAdapter {
    /// Step name for provenance and logging.
    fn step_name(&self) -> &str;

    /// The external tool binary this adapter wraps.
    fn tool(&self) -> &str;

    /// Required input paths; a missing one is fatal.
    fn inputs(&self) -> Vec<PathBuf>;

    /// The primary output used for settled checks and markers.
    fn primary_output(&self) -> PathBuf;

    /// Parameter record for provenance.
    fn params(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Attempts the real tool run, producing all declared outputs.
    fn run_tool(&self) -> Result<()>;

    /// Produces placeholder outputs that preserve downstream validity.
    fn write_placeholder(&self) -> Result<()>;
}

/// Executes an adapter under the uniform contract.
///
/// Recoverable tool errors downgrade to a skip with placeholders; a failure
/// to produce the placeholder itself is fatal.
pub fn execute(adapter: &dyn ToolAdapter) -> Result<AdapterOutcome> {
    let output = adapter.primary_output();
    if is_settled(&output) {
        return Ok(AdapterOutcome::AlreadySettled);
    }
    for input in adapter.inputs() {
        if !input.exists() {
            return Err(SpineError::missing_input(input));
        }
    }

    let inputs: Vec<String> = adapter
        .inputs()
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let versions = tool_versions(&[adapter.tool()]);

    match adapter.run_tool() {
        Ok(()) => {
            let record = ProvenanceRecord::new(
                adapter.step_name(),
                &output,
                inputs,
                adapter.params(),
                versions,
            );
            write_prov(&output, &record)?;
            mark_ok(&output)?;
            info!(step = adapter.step_name(), output = %output.display(), "completed");
            Ok(AdapterOutcome::Completed)
        }
        Err(e) if e.is_recoverable() => {
            warn!(step = adapter.step_name(), error = %e, "tool degraded; writing placeholder");
            adapter.write_placeholder()?;
            let mut params = adapter.params();
            if let Some(map) = params.as_object_mut() {
                map.insert(
                    "skip_reason".to_string(),
                    serde_json::Value::String(e.to_string()),
                );
            }
            let record =
                ProvenanceRecord::new(adapter.step_name(), &output, inputs, params, versions);
            write_prov(&output, &record)?;
            mark_skip(&output)?;
            Ok(AdapterOutcome::Skipped(e.to_string()))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::marker_path;
    use std::path::Path;

    struct FakeAdapter {
        dir: PathBuf,
        tool_present: bool,
        input_exists: bool,
    }

    impl FakeAdapter {
        fn input(&self) -> PathBuf {
            self.dir.join("input.nii.gz")
        }
    }

    impl ToolAdapter for FakeAdapter {
        fn step_name(&self) -> &str {
            "fake_step"
        }

        fn tool(&self) -> &str {
            "definitely-not-a-real-tool-xyz"
        }

        fn inputs(&self) -> Vec<PathBuf> {
            if self.input_exists {
                vec![self.input()]
            } else {
                vec![self.dir.join("missing.nii.gz")]
            }
        }

        fn primary_output(&self) -> PathBuf {
            self.dir.join("output.nii.gz")
        }

        fn run_tool(&self) -> Result<()> {
            if !self.tool_present {
                return Err(SpineError::ToolUnavailable {
                    tool: self.tool().to_string(),
                });
            }
            std::fs::write(self.primary_output(), b"real")?;
            Ok(())
        }

        fn write_placeholder(&self) -> Result<()> {
            std::fs::write(self.primary_output(), b"")?;
            Ok(())
        }
    }

    fn setup(tool_present: bool, input_exists: bool) -> (tempfile::TempDir, FakeAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FakeAdapter {
            dir: dir.path().to_path_buf(),
            tool_present,
            input_exists,
        };
        if input_exists {
            std::fs::write(adapter.input(), b"in").unwrap();
        }
        (dir, adapter)
    }

    fn has_marker(output: &Path, marker: &str) -> bool {
        marker_path(output, marker).exists()
    }

    #[test]
    fn test_missing_tool_skips_with_placeholder() {
        let (_guard, adapter) = setup(false, true);
        let outcome = execute(&adapter).unwrap();
        assert!(matches!(outcome, AdapterOutcome::Skipped(_)));
        let output = adapter.primary_output();
        assert!(output.exists());
        assert!(has_marker(&output, "skip"));
        assert!(!has_marker(&output, "ok"));
        // Provenance records the reason.
        let prov = std::fs::read_to_string(
            crate::pipeline::provenance::prov_path(&output),
        )
        .unwrap();
        assert!(prov.contains("skip_reason"));
    }

    #[test]
    fn test_success_marks_ok() {
        let (_guard, adapter) = setup(true, true);
        let outcome = execute(&adapter).unwrap();
        assert_eq!(outcome, AdapterOutcome::Completed);
        assert!(has_marker(&adapter.primary_output(), "ok"));
    }

    #[test]
    fn test_missing_input_is_fatal() {
        let (_guard, adapter) = setup(true, false);
        let err = execute(&adapter).unwrap_err();
        assert!(matches!(err, SpineError::MissingInput { .. }));
    }

    #[test]
    fn test_settled_output_early_returns() {
        let (_guard, adapter) = setup(false, true);
        execute(&adapter).unwrap();
        // Second invocation observes the skip marker and does nothing.
        let outcome = execute(&adapter).unwrap();
        assert_eq!(outcome, AdapterOutcome::AlreadySettled);
    }
}
