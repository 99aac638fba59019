//! Filesystem utilities shared across the pipeline.
//!
//! Every text or small-file artifact is committed atomically: content is
//! written to a temporary sibling in the destination directory and renamed
//! into place. The rename is the commit point, so a reader never observes a
//! partial file and interrupted invocations leave only temporaries that the
//! next invocation ignores.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::core::errors::{Result, SpineError};

/// Atomically writes `content` to `path` (temp sibling + rename).
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| SpineError::CommitFailed {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Atomically writes a serializable value as pretty JSON.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &content)
}

/// Creates a zero-byte marker file (`.ok` / `.skip`) next to an artifact.
pub fn touch_marker(artifact: &Path, marker: &str) -> Result<()> {
    let path = marker_path(artifact, marker);
    atomic_write(&path, b"")
}

/// The path of a marker sibling for an artifact.
pub fn marker_path(artifact: &Path, marker: &str) -> std::path::PathBuf {
    let mut name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(marker);
    artifact.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");
        atomic_write(&path, b"hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn test_atomic_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn test_marker_paths() {
        let artifact = Path::new("/d/sub-01_desc-motion_bold.nii.gz");
        assert_eq!(
            marker_path(artifact, "skip"),
            Path::new("/d/sub-01_desc-motion_bold.nii.gz.skip")
        );
        assert_eq!(
            marker_path(artifact, "ok"),
            Path::new("/d/sub-01_desc-motion_bold.nii.gz.ok")
        );
    }

    #[test]
    fn test_touch_marker_zero_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("out.tsv");
        touch_marker(&artifact, "ok").unwrap();
        let meta = std::fs::metadata(dir.path().join("out.tsv.ok")).unwrap();
        assert_eq!(meta.len(), 0);
    }
}
