//! Temporal crop detection and the sidecar contract.
//!
//! Crop detection publishes a small per-run sidecar `{from, to, nvols,
//! reason}` which is the sole authority for which volumes downstream steps
//! process. The crop-detect step is the only writer; motion correction and
//! the confounds engine hold read-only references and default to the full
//! series when the sidecar is missing. An environment variable can override
//! the effective crop in emergencies, but the override is always logged and
//! recorded in provenance.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::config::TemporalCropOptions;
use crate::core::errors::Result;
use crate::image::{Mask3d, Volume4d};
use crate::utils::atomic_write_json;

/// Environment variable for the emergency crop override (`FROM:TO`).
pub const CROP_OVERRIDE_ENV: &str = "SPINEPREP_CROP_OVERRIDE";

/// Why the crop came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CropReason {
    /// No outlier volumes (or detection disabled, or MAD was zero).
    #[serde(rename = "no-crop")]
    NoCrop,
    /// Robust-z detection trimmed at least one volume.
    #[serde(rename = "robust-z")]
    RobustZ,
    /// No cord mask available; detection ran over the whole field of view.
    #[serde(rename = "fallback-no-mask")]
    FallbackNoMask,
    /// Detection failed; the full series is kept.
    #[serde(rename = "detection-failed")]
    DetectionFailed,
    /// A trim exceeded its configured maximum and was clamped.
    #[serde(rename = "out-of-bounds-clamped")]
    OutOfBoundsClamped,
    /// Used by readers when no sidecar exists; never written to disk.
    #[serde(rename = "no-sidecar")]
    NoSidecar,
}

impl CropReason {
    /// The wire string, identical to the serde rename.
    pub fn as_str(&self) -> &'static str {
        match self {
            CropReason::NoCrop => "no-crop",
            CropReason::RobustZ => "robust-z",
            CropReason::FallbackNoMask => "fallback-no-mask",
            CropReason::DetectionFailed => "detection-failed",
            CropReason::OutOfBoundsClamped => "out-of-bounds-clamped",
            CropReason::NoSidecar => "no-sidecar",
        }
    }
}

/// The per-run crop record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropSidecar {
    /// First kept volume index.
    pub from: usize,
    /// One past the last kept volume index.
    pub to: usize,
    /// Original volume count of the 4-D image.
    pub nvols: usize,
    /// Reason code.
    pub reason: CropReason,
}

impl CropSidecar {
    /// A full-series sidecar.
    pub fn full(nvols: usize, reason: CropReason) -> Self {
        Self {
            from: 0,
            to: nvols,
            nvols,
            reason,
        }
    }

    /// Number of volumes that survive cropping.
    pub fn kept(&self) -> usize {
        self.to - self.from
    }

    /// Whether the bounds invariant `0 <= from <= to <= nvols` holds.
    pub fn is_valid(&self) -> bool {
        self.from <= self.to && self.to <= self.nvols
    }
}

/// Robust z-scores of a per-volume statistic using median and MAD.
///
/// MAD of zero yields all-zero scores (no volume can be flagged).
pub fn robust_z(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }
    let median = median_of(signal);
    let deviations: Vec<f64> = signal.iter().map(|&s| (s - median).abs()).collect();
    let mad = median_of(&deviations);
    if mad < 1e-12 {
        return vec![0.0; n];
    }
    signal
        .iter()
        .map(|&s| (s - median) / (1.4826 * mad))
        .collect()
}

fn median_of(values: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Detects crop indices from a per-volume signal.
///
/// Contiguous leading and trailing volumes whose |robust z| exceeds the
/// threshold are trimmed; each side is clamped to its configured maximum.
/// `had_mask` feeds the reason code when a crop was found without a mask.
pub fn detect_from_signal(
    signal: &[f64],
    opts: &TemporalCropOptions,
    had_mask: bool,
) -> CropSidecar {
    let nvols = signal.len();
    if nvols == 0 {
        return CropSidecar::full(0, CropReason::DetectionFailed);
    }
    if !opts.enable {
        return CropSidecar::full(nvols, CropReason::NoCrop);
    }
    let z = robust_z(signal);
    if z.iter().all(|&v| v == 0.0) {
        return CropSidecar::full(nvols, CropReason::NoCrop);
    }

    // Unclamped walks first, so clamping is observable in the reason code.
    let mut raw_from = 0;
    for (i, &zi) in z.iter().enumerate() {
        if zi.abs() > opts.z_thresh {
            raw_from = i + 1;
        } else {
            break;
        }
    }
    let mut raw_trim_end = 0;
    for i in 0..nvols {
        let idx = nvols - 1 - i;
        if idx < raw_from {
            break;
        }
        if z[idx].abs() > opts.z_thresh {
            raw_trim_end = i + 1;
        } else {
            break;
        }
    }

    let from = raw_from.min(opts.max_trim_start).min(nvols);
    let trim_end = raw_trim_end.min(opts.max_trim_end);
    let to = nvols.saturating_sub(trim_end).max(from);
    let clamped = from < raw_from || trim_end < raw_trim_end;

    let reason = if clamped {
        CropReason::OutOfBoundsClamped
    } else if from == 0 && to == nvols {
        CropReason::NoCrop
    } else if had_mask {
        CropReason::RobustZ
    } else {
        CropReason::FallbackNoMask
    };
    CropSidecar {
        from,
        to,
        nvols,
        reason,
    }
}

/// Detects the crop for a 4-D image with an optional cord mask.
///
/// Empty or unusable inputs yield a full-series sidecar with reason
/// `detection-failed` without erroring.
pub fn detect(volume: &Volume4d, mask: Option<&Mask3d>, opts: &TemporalCropOptions) -> CropSidecar {
    let nvols = volume.nvols();
    if nvols == 0 {
        return CropSidecar::full(0, CropReason::DetectionFailed);
    }
    let (signal, had_mask) = match mask {
        Some(mask) => match volume.masked_volume_means(mask) {
            Some(signal) => (signal, true),
            None => (volume.volume_means(), false),
        },
        None => (volume.volume_means(), false),
    };
    if signal.len() != nvols || signal.iter().any(|v| !v.is_finite()) {
        return CropSidecar::full(nvols, CropReason::DetectionFailed);
    }
    detect_from_signal(&signal, opts, had_mask)
}

/// Writes the sidecar atomically. Crop-detect is the only caller.
pub fn write_sidecar(path: &Path, sidecar: &CropSidecar) -> Result<()> {
    debug!(path = %path.display(), from = sidecar.from, to = sidecar.to, "writing crop sidecar");
    atomic_write_json(path, sidecar)
}

/// Reads a sidecar from disk.
pub fn read_sidecar(path: &Path) -> Result<CropSidecar> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// The effective crop for a downstream reader.
///
/// Precedence: environment override (logged), then the sidecar, then the
/// full-series default with reason `no-sidecar`. An unreadable or invalid
/// sidecar also falls back to the default.
pub fn effective_crop(sidecar_path: &Path, nvols: usize) -> CropSidecar {
    if let Ok(spec) = std::env::var(CROP_OVERRIDE_ENV) {
        if let Some(over) = parse_override(&spec, nvols) {
            warn!(
                %spec,
                from = over.from,
                to = over.to,
                "crop override from {CROP_OVERRIDE_ENV}; sidecar ignored"
            );
            return over;
        }
        warn!(%spec, "ignoring malformed {CROP_OVERRIDE_ENV}");
    }
    match read_sidecar(sidecar_path) {
        Ok(sidecar) if sidecar.is_valid() && sidecar.nvols == nvols => sidecar,
        Ok(sidecar) => {
            warn!(
                path = %sidecar_path.display(),
                from = sidecar.from,
                to = sidecar.to,
                nvols = sidecar.nvols,
                "sidecar invalid for {nvols} volumes; defaulting to full series"
            );
            CropSidecar::full(nvols, CropReason::NoSidecar)
        }
        Err(_) => CropSidecar::full(nvols, CropReason::NoSidecar),
    }
}

fn parse_override(spec: &str, nvols: usize) -> Option<CropSidecar> {
    let (from, to) = spec.split_once(':')?;
    let from: usize = from.trim().parse().ok()?;
    let to: usize = to.trim().parse().ok()?;
    let sidecar = CropSidecar {
        from,
        to,
        nvols,
        reason: CropReason::RobustZ,
    };
    sidecar.is_valid().then_some(sidecar)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(z_thresh: f64, max_start: usize, max_end: usize) -> TemporalCropOptions {
        TemporalCropOptions {
            enable: true,
            method: "cord_mean_robust_z".to_string(),
            max_trim_start: max_start,
            max_trim_end: max_end,
            z_thresh,
        }
    }

    /// A quiet signal with outliers at the given leading/trailing positions.
    fn signal_with_edges(n: usize, lead: usize, trail: usize) -> Vec<f64> {
        let mut signal: Vec<f64> = (0..n).map(|i| 100.0 + 0.1 * ((i % 5) as f64)).collect();
        for item in signal.iter_mut().take(lead) {
            *item = 500.0;
        }
        for item in signal.iter_mut().rev().take(trail) {
            *item = 500.0;
        }
        signal
    }

    #[test]
    fn test_quiet_signal_no_crop() {
        let sidecar = detect_from_signal(&signal_with_edges(20, 0, 0), &opts(2.5, 10, 10), true);
        assert_eq!(sidecar.from, 0);
        assert_eq!(sidecar.to, 20);
        assert_eq!(sidecar.reason, CropReason::NoCrop);
        assert!(sidecar.is_valid());
    }

    #[test]
    fn test_leading_and_trailing_trim() {
        let sidecar = detect_from_signal(&signal_with_edges(20, 2, 1), &opts(2.5, 10, 10), true);
        assert_eq!(sidecar.from, 2);
        assert_eq!(sidecar.to, 19);
        assert_eq!(sidecar.kept(), 17);
        assert_eq!(sidecar.reason, CropReason::RobustZ);
    }

    #[test]
    fn test_trim_clamped_to_max() {
        let sidecar = detect_from_signal(&signal_with_edges(20, 5, 0), &opts(2.5, 3, 3), true);
        assert_eq!(sidecar.from, 3);
        assert_eq!(sidecar.reason, CropReason::OutOfBoundsClamped);
        assert!(sidecar.is_valid());
    }

    #[test]
    fn test_constant_signal_mad_zero() {
        let signal = vec![7.0; 12];
        let sidecar = detect_from_signal(&signal, &opts(2.5, 10, 10), true);
        assert_eq!(sidecar.reason, CropReason::NoCrop);
        assert_eq!(sidecar.kept(), 12);
    }

    #[test]
    fn test_no_mask_reason() {
        let sidecar = detect_from_signal(&signal_with_edges(20, 2, 0), &opts(2.5, 10, 10), false);
        assert_eq!(sidecar.reason, CropReason::FallbackNoMask);
        assert_eq!(sidecar.from, 2);
    }

    #[test]
    fn test_disabled_detection() {
        let mut options = opts(2.5, 10, 10);
        options.enable = false;
        let sidecar = detect_from_signal(&signal_with_edges(10, 3, 0), &options, true);
        assert_eq!(sidecar.kept(), 10);
        assert_eq!(sidecar.reason, CropReason::NoCrop);
    }

    #[test]
    fn test_empty_signal_detection_failed() {
        let sidecar = detect_from_signal(&[], &opts(2.5, 10, 10), true);
        assert_eq!(sidecar.reason, CropReason::DetectionFailed);
        assert_eq!(sidecar.nvols, 0);
    }

    #[test]
    fn test_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub-01_task-rest_run-01_desc-crop.json");
        let sidecar = CropSidecar {
            from: 1,
            to: 4,
            nvols: 4,
            reason: CropReason::RobustZ,
        };
        write_sidecar(&path, &sidecar).unwrap();
        let loaded = read_sidecar(&path).unwrap();
        assert_eq!(loaded, sidecar);
        // Wire format uses the kebab-case reason strings.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"robust-z\""));
    }

    #[test]
    fn test_effective_crop_defaults_without_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let crop = effective_crop(&path, 7);
        assert_eq!(crop.from, 0);
        assert_eq!(crop.to, 7);
        assert_eq!(crop.reason, CropReason::NoSidecar);
    }

    #[test]
    fn test_effective_crop_rejects_stale_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.json");
        // Written for a different volume count than the image now has.
        write_sidecar(
            &path,
            &CropSidecar {
                from: 1,
                to: 4,
                nvols: 4,
                reason: CropReason::RobustZ,
            },
        )
        .unwrap();
        let crop = effective_crop(&path, 9);
        assert_eq!(crop, CropSidecar::full(9, CropReason::NoSidecar));
    }
}
