//! Confounds table and descriptor writers.
//!
//! The table is tab-separated with the canonical header as the first row.
//! Continuous values print with six decimals; `frame_censor` prints as an
//! integer. Both files commit atomically.

use std::fmt::Write as _;
use std::path::Path;

use crate::confounds::frame::{ConfoundsDescriptor, ConfoundsFrame};
use crate::core::errors::Result;
use crate::utils::{atomic_write, atomic_write_json};

/// Renders the confounds frame as TSV text.
pub fn render_tsv(frame: &ConfoundsFrame) -> String {
    let header = frame.header();
    let mut out = String::new();
    out.push_str(&header.join("\t"));
    out.push('\n');
    for t in 0..frame.n_rows() {
        let mut row: Vec<String> = Vec::with_capacity(header.len());
        for c in 0..6 {
            row.push(format_float(frame.motion_params[[t, c]]));
        }
        row.push(format_float(frame.fd[t]));
        row.push(format_float(frame.dvars[t]));
        row.push(frame.censor[t].to_string());
        for tissue in &frame.acompcor {
            for pc in 0..tissue.components.ncols() {
                row.push(format_float(tissue.components[[t, pc]]));
            }
        }
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    out
}

fn format_float(v: f64) -> String {
    let mut s = String::new();
    let _ = write!(s, "{v:.6}");
    s
}

/// Writes the TSV table atomically.
pub fn write_tsv(path: &Path, frame: &ConfoundsFrame) -> Result<()> {
    atomic_write(path, render_tsv(frame).as_bytes())
}

/// Writes the descriptor JSON atomically.
pub fn write_descriptor(path: &Path, descriptor: &ConfoundsDescriptor) -> Result<()> {
    atomic_write_json(path, descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confounds::frame::TissueComponents;
    use ndarray::Array2;

    #[test]
    fn test_tsv_formatting() {
        let mut params = Array2::zeros((2, 6));
        params[[1, 0]] = 1.25;
        let frame = ConfoundsFrame::new(
            params,
            vec![0.0, 1.25],
            vec![0.0, 0.5],
            vec![0, 1],
            Vec::new(),
        )
        .unwrap();
        let tsv = render_tsv(&frame);
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("trans_x\t"));
        assert!(lines[0].ends_with("frame_censor"));
        let row: Vec<&str> = lines[2].split('\t').collect();
        assert_eq!(row[0], "1.250000");
        assert_eq!(row[6], "1.250000");
        assert_eq!(row[8], "1", "censor must print as an integer");
    }

    #[test]
    fn test_tsv_row_and_field_counts() {
        let frame = ConfoundsFrame::new(
            Array2::zeros((4, 6)),
            vec![0.0; 4],
            vec![0.0; 4],
            vec![0; 4],
            vec![TissueComponents {
                tissue: "cord".to_string(),
                components: Array2::zeros((4, 3)),
            }],
        )
        .unwrap();
        let tsv = render_tsv(&frame);
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines.len(), 5);
        for line in &lines {
            assert_eq!(line.split('\t').count(), 12);
        }
    }

    #[test]
    fn test_write_tsv_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub-01_desc-confounds_timeseries.tsv");
        let frame = ConfoundsFrame::new(
            Array2::zeros((2, 6)),
            vec![0.0; 2],
            vec![0.0; 2],
            vec![0; 2],
            Vec::new(),
        )
        .unwrap();
        write_tsv(&path, &frame).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        // No temporary sibling remains after the commit.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != path.file_name().unwrap())
            .collect();
        assert!(leftovers.is_empty());
    }
}
