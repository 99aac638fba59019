//! External command execution with version capture.
//!
//! All external tools run through this module so that availability checks,
//! exit-status handling, and tool-version probes are uniform. Version probes
//! are cached for the lifetime of the process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::core::errors::{Result, SpineError};

static VERSION_CACHE: Lazy<Mutex<BTreeMap<String, String>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

/// Whether `tool` resolves to an executable on PATH.
pub fn tool_on_path(tool: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(tool)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Output of a completed external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status (`-1` when terminated by a signal).
    pub status: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Runs an external tool, mapping absence and failure to the error taxonomy.
///
/// # Arguments
///
/// * `tool` - The binary name; must be first in `args` resolution.
/// * `args` - Arguments passed to the tool.
///
/// # Returns
///
/// The captured output on success, `ToolUnavailable` when the binary cannot
/// be spawned, or `ToolFailure` on a non-zero exit.
pub fn run_tool(tool: &str, args: &[&str]) -> Result<CommandOutput> {
    debug!(%tool, ?args, "invoking external tool");
    let output = Command::new(tool).args(args).output().map_err(|_| {
        SpineError::ToolUnavailable {
            tool: tool.to_string(),
        }
    })?;
    let status = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if status != 0 {
        return Err(SpineError::ToolFailure {
            tool: tool.to_string(),
            status,
            stderr,
        });
    }
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}

/// Probes a tool's version string, caching the answer per process.
///
/// Returns `"unknown"` when the probe fails or the tool is absent; version
/// probing never fails a step.
pub fn tool_version(tool: &str, version_arg: &str) -> String {
    if let Some(v) = VERSION_CACHE.lock().unwrap().get(tool) {
        return v.clone();
    }
    let version = Command::new(tool)
        .arg(version_arg)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| {
            String::from_utf8_lossy(&o.stdout)
                .lines()
                .next()
                .unwrap_or("unknown")
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    VERSION_CACHE
        .lock()
        .unwrap()
        .insert(tool.to_string(), version.clone());
    version
}

/// Version records for a set of tools, suitable for provenance.
pub fn tool_versions(tools: &[&str]) -> BTreeMap<String, String> {
    tools
        .iter()
        .map(|&t| (t.to_string(), tool_version(t, "--version")))
        .collect()
}

/// A scratch directory for tool invocations that need file handoff.
pub fn scratch_dir(label: &str) -> Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::Builder::new()
        .prefix(&format!("spineprep-{label}-"))
        .tempdir()?;
    let path = dir.path().to_path_buf();
    Ok((dir, path))
}
