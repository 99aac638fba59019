//! Contiguity-aware frame censoring.
//!
//! Censoring runs in three passes: strict-threshold flagging on FD and DVARS,
//! symmetric dilation of the flags, and removal of kept segments shorter than
//! the configured minimum. Every maximal kept run is subject to the minimum,
//! including runs touching either end of the series.

use crate::core::config::CensorOptions;
use crate::core::errors::Result;
use crate::core::validation::validate_same_length;

/// Result of the censoring pass.
#[derive(Debug, Clone)]
pub struct CensorResult {
    /// Binary vector: 0 kept, 1 censored.
    pub censor: Vec<u8>,
    /// Maximal kept segments as `[start, end)` index pairs.
    pub kept_segments: Vec<(usize, usize)>,
    /// Number of kept volumes.
    pub n_kept: usize,
    /// Number of censored volumes.
    pub n_censored: usize,
}

/// Builds the frame-censor vector from FD and DVARS.
///
/// Thresholds are strict `>`; the padding is clamped to T-1; kept runs
/// shorter than `min_contig_vols` are flagged in a final pass.
pub fn build_censor(fd: &[f64], dvars: &[f64], opts: &CensorOptions) -> Result<CensorResult> {
    validate_same_length(fd, dvars, "fd", "dvars")?;
    let n = fd.len();
    let mut censor = vec![0u8; n];
    if n == 0 {
        return Ok(CensorResult {
            censor,
            kept_segments: Vec::new(),
            n_kept: 0,
            n_censored: 0,
        });
    }

    for t in 0..n {
        if fd[t] > opts.fd_thresh_mm || dvars[t] > opts.dvars_thresh {
            censor[t] = 1;
        }
    }

    let pad = opts.pad_vols.min(n.saturating_sub(1));
    if pad > 0 {
        let flagged: Vec<usize> = (0..n).filter(|&t| censor[t] == 1).collect();
        for t in flagged {
            let lo = t.saturating_sub(pad);
            let hi = (t + pad + 1).min(n);
            for item in censor.iter_mut().take(hi).skip(lo) {
                *item = 1;
            }
        }
    }

    if opts.min_contig_vols > 1 {
        for (start, end) in kept_runs(&censor) {
            if end - start < opts.min_contig_vols {
                for item in censor.iter_mut().take(end).skip(start) {
                    *item = 1;
                }
            }
        }
    }

    let kept_segments = kept_runs(&censor);
    let n_censored = censor.iter().filter(|&&c| c == 1).count();
    Ok(CensorResult {
        n_kept: n - n_censored,
        n_censored,
        kept_segments,
        censor,
    })
}

/// Maximal runs of kept frames as `[start, end)` pairs.
fn kept_runs(censor: &[u8]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for (t, &c) in censor.iter().enumerate() {
        match (c, start) {
            (0, None) => start = Some(t),
            (1, Some(s)) => {
                runs.push((s, t));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, censor.len()));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(fd: f64, dvars: f64, min_contig: usize, pad: usize) -> CensorOptions {
        CensorOptions {
            enable: true,
            fd_thresh_mm: fd,
            dvars_thresh: dvars,
            min_contig_vols: min_contig,
            pad_vols: pad,
        }
    }

    #[test]
    fn test_quiet_series_keeps_everything() {
        let fd = vec![0.0; 10];
        let dvars = vec![0.0; 10];
        let result = build_censor(&fd, &dvars, &opts(1.0, 2.0, 5, 0)).unwrap();
        assert_eq!(result.n_kept, 10);
        assert_eq!(result.n_censored, 0);
        assert_eq!(result.kept_segments, vec![(0, 10)]);
    }

    #[test]
    fn test_strict_threshold() {
        // Exactly at the threshold is kept; strictly above is censored.
        let fd = vec![0.0, 0.5, 0.51];
        let dvars = vec![0.0; 3];
        let result = build_censor(&fd, &dvars, &opts(0.5, 9.9, 1, 0)).unwrap();
        assert_eq!(result.censor, vec![0, 0, 1]);
    }

    #[test]
    fn test_padding_symmetric() {
        let mut fd = vec![0.0; 7];
        fd[3] = 0.6;
        let dvars = vec![0.0; 7];
        let result = build_censor(&fd, &dvars, &opts(0.5, 9.9, 1, 1)).unwrap();
        assert_eq!(result.censor, vec![0, 0, 1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_min_contig_flags_short_runs_everywhere() {
        // Two outliers with p=1 and k=3 leave only segments of length 2 at
        // both ends; all frames end up censored.
        let fd = vec![0.0, 0.0, 0.0, 0.6, 0.0, 0.0, 0.6, 0.0, 0.0, 0.0];
        let dvars = vec![0.0; 10];
        let result = build_censor(&fd, &dvars, &opts(0.5, 1.5, 3, 1)).unwrap();
        assert_eq!(result.censor, vec![1; 10]);
        assert_eq!(result.n_kept, 0);
        assert_eq!(result.n_censored, 10);
        assert!(result.kept_segments.is_empty());
    }

    #[test]
    fn test_short_interior_segments_removed() {
        let fd = vec![0.0, 0.0, 0.6, 0.0, 0.0, 0.0, 0.6, 0.0, 0.0];
        let dvars = vec![0.0; 9];
        let result = build_censor(&fd, &dvars, &opts(0.5, 9.9, 3, 0)).unwrap();
        // Only the middle length-3 segment survives.
        assert_eq!(result.kept_segments, vec![(3, 6)]);
        assert_eq!(result.n_kept, 3);
    }

    #[test]
    fn test_no_kept_run_shorter_than_min() {
        let fd = vec![0.0, 0.6, 0.0, 0.0, 0.6, 0.0, 0.0, 0.0, 0.0, 0.0, 0.6, 0.0];
        let dvars = vec![0.0; 12];
        let result = build_censor(&fd, &dvars, &opts(0.5, 9.9, 5, 1)).unwrap();
        for (start, end) in &result.kept_segments {
            assert!(end - start >= 5, "kept run [{start}, {end}) shorter than 5");
        }
        // Every flagged volume carries its padded neighbors.
        for t in 0..12 {
            if fd[t] > 0.5 {
                assert_eq!(result.censor[t], 1);
                if t > 0 {
                    assert_eq!(result.censor[t - 1], 1);
                }
                if t + 1 < 12 {
                    assert_eq!(result.censor[t + 1], 1);
                }
            }
        }
    }

    #[test]
    fn test_min_contig_one_keeps_singletons() {
        let fd = vec![0.0, 0.6, 0.0, 0.6, 0.0];
        let dvars = vec![0.0; 5];
        let result = build_censor(&fd, &dvars, &opts(0.5, 9.9, 1, 0)).unwrap();
        assert_eq!(result.n_kept, 3);
        assert_eq!(result.n_censored, 2);
    }

    #[test]
    fn test_dvars_censoring() {
        let fd = vec![0.0; 4];
        let dvars = vec![0.0, 2.0, 0.0, 0.0];
        let result = build_censor(&fd, &dvars, &opts(0.5, 1.5, 1, 0)).unwrap();
        assert_eq!(result.censor, vec![0, 1, 0, 0]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        assert!(build_censor(&[0.0; 3], &[0.0; 4], &opts(0.5, 1.5, 1, 0)).is_err());
    }

    #[test]
    fn test_pad_clamped_to_series() {
        let fd = vec![0.6, 0.0];
        let dvars = vec![0.0; 2];
        // Padding beyond T-1 must not panic and censors the whole series.
        let result = build_censor(&fd, &dvars, &opts(0.5, 9.9, 1, 10)).unwrap();
        assert_eq!(result.censor, vec![1, 1]);
    }
}
