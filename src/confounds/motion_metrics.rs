//! Framewise displacement and DVARS.
//!
//! Both metrics follow Power et al. (2012). FD sums the absolute first
//! differences of the six rigid-body parameters, with rotations converted to
//! millimeters on a 50 mm sphere. DVARS is the root-mean-square of the
//! volumewise temporal difference within a voxel mask. Both are zero at the
//! first volume by definition.

use ndarray::{Array2, ArrayView2, ArrayView4, Axis};

use crate::core::errors::{Result, SpineError};
use crate::image::Mask3d;

/// Rotation-to-displacement radius in millimeters.
pub const FD_RADIUS_MM: f64 = 50.0;

/// Computes framewise displacement (Power method).
///
/// # Arguments
///
/// * `motion_params` - Table of shape (T, 6) with columns
///   trans_x, trans_y, trans_z (mm), rot_x, rot_y, rot_z (radians).
///
/// # Returns
///
/// FD vector of length T with `fd[0] = 0`.
pub fn fd_power(motion_params: ArrayView2<f64>) -> Result<Vec<f64>> {
    if motion_params.ncols() != 6 {
        return Err(SpineError::degenerate(format!(
            "expected 6 motion parameters, got {}",
            motion_params.ncols()
        )));
    }
    let n = motion_params.nrows();
    let mut fd = vec![0.0; n];
    for t in 1..n {
        let mut trans = 0.0;
        let mut rot = 0.0;
        for c in 0..3 {
            trans += (motion_params[[t, c]] - motion_params[[t - 1, c]]).abs();
        }
        for c in 3..6 {
            rot += (motion_params[[t, c]] - motion_params[[t - 1, c]]).abs();
        }
        fd[t] = trans + FD_RADIUS_MM * rot;
    }
    Ok(fd)
}

/// How the DVARS voxel mask was chosen, for the descriptor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DvarsMaskSource {
    /// A provided tissue/cord mask was used.
    Provided,
    /// The default mask: voxels above the median of the first volume.
    Default,
    /// No usable voxels; DVARS degraded to zeros.
    Degenerate,
}

impl DvarsMaskSource {
    /// Identifier written into the confounds descriptor.
    pub fn as_str(&self) -> &'static str {
        match self {
            DvarsMaskSource::Provided => "provided_mask",
            DvarsMaskSource::Default => "median_first_volume_mask",
            DvarsMaskSource::Degenerate => "degenerate_zeros",
        }
    }
}

/// Computes DVARS within a mask.
///
/// Mask precedence: a provided mask wins; otherwise the default mask keeps
/// voxels above the median of the first volume. With no usable voxels the
/// result is all zeros and the source records the degradation.
///
/// # Returns
///
/// `(dvars, mask_source)` with `dvars[0] = 0`.
pub fn dvars(data: ArrayView4<f32>, mask: Option<&Mask3d>) -> (Vec<f64>, DvarsMaskSource) {
    let (_, _, _, nt) = data.dim();
    let mut out = vec![0.0; nt];
    if nt < 2 {
        return (out, DvarsMaskSource::Degenerate);
    }

    // Collect member voxel coordinates once; the per-volume loop then only
    // touches members.
    let mut members: Vec<(usize, usize, usize)> = Vec::new();
    let source = match mask {
        Some(mask) if !mask.is_empty() => {
            for ((x, y, z), &m) in mask.data.indexed_iter() {
                if m {
                    members.push((x, y, z));
                }
            }
            DvarsMaskSource::Provided
        }
        _ => {
            let first = data.index_axis(Axis(3), 0);
            let threshold = median_f32(first.iter().copied().filter(|v| v.is_finite()));
            if let Some(threshold) = threshold {
                for ((x, y, z), &v) in first.indexed_iter() {
                    if v.is_finite() && v > threshold {
                        members.push((x, y, z));
                    }
                }
            }
            DvarsMaskSource::Default
        }
    };

    if members.is_empty() {
        return (out, DvarsMaskSource::Degenerate);
    }

    for t in 1..nt {
        let mut sum_sq = 0.0f64;
        let mut count = 0usize;
        for &(x, y, z) in &members {
            let a = data[[x, y, z, t]] as f64;
            let b = data[[x, y, z, t - 1]] as f64;
            if a.is_finite() && b.is_finite() {
                let d = a - b;
                sum_sq += d * d;
                count += 1;
            }
        }
        out[t] = if count > 0 {
            (sum_sq / count as f64).sqrt()
        } else {
            0.0
        };
    }
    (out, source)
}

fn median_f32(values: impl Iterator<Item = f32>) -> Option<f32> {
    let mut sorted: Vec<f32> = values.collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    Some(if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    })
}

/// A zero motion-parameter table of the given length, for the fallback path
/// when no parameter file exists.
pub fn zero_motion_params(n_timepoints: usize) -> Array2<f64> {
    Array2::zeros((n_timepoints, 6))
}

/// Splits a concatenated parameter table back into per-run tables.
pub fn split_motion_params(params: &Array2<f64>, lengths: &[usize]) -> Result<Vec<Array2<f64>>> {
    let total: usize = lengths.iter().sum();
    if total != params.nrows() {
        return Err(SpineError::degenerate(format!(
            "cannot split {} rows into segments summing to {total}",
            params.nrows()
        )));
    }
    let mut out = Vec::with_capacity(lengths.len());
    let mut offset = 0;
    for &len in lengths {
        out.push(
            params
                .slice_axis(Axis(0), ndarray::Slice::from(offset..offset + len))
                .to_owned(),
        );
        offset += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array4};

    #[test]
    fn test_fd_first_volume_zero() {
        let params = Array2::<f64>::zeros((5, 6));
        let fd = fd_power(params.view()).unwrap();
        assert_eq!(fd, vec![0.0; 5]);
    }

    #[test]
    fn test_fd_pure_translation() {
        // 1 mm jump in x between frames 2 and 3, zero elsewhere.
        let mut params = Array2::<f64>::zeros((5, 6));
        params[[3, 0]] = 1.0;
        params[[4, 0]] = 1.0;
        let fd = fd_power(params.view()).unwrap();
        assert!((fd[3] - 1.0).abs() < 1e-12);
        for (t, v) in fd.iter().enumerate() {
            if t != 3 {
                assert_eq!(*v, 0.0, "fd[{t}] should be 0");
            }
        }
    }

    #[test]
    fn test_fd_rotation_scaled_by_radius() {
        let mut params = Array2::<f64>::zeros((2, 6));
        params[[1, 3]] = 0.01;
        let fd = fd_power(params.view()).unwrap();
        assert!((fd[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_fd_wrong_width() {
        let params = Array2::<f64>::zeros((3, 5));
        assert!(fd_power(params.view()).is_err());
    }

    #[test]
    fn test_dvars_constant_volume_is_zero() {
        let data = Array4::<f32>::from_elem((3, 3, 2, 5), 7.0);
        let (dvars, source) = dvars(data.view(), None);
        assert_eq!(dvars, vec![0.0; 5]);
        // No voxel of a constant first volume exceeds its median.
        assert_eq!(source, DvarsMaskSource::Degenerate);
    }

    #[test]
    fn test_dvars_default_mask_is_median_of_first_volume() {
        // Bright voxels (x = 1) sit above the first-volume median of 1.5 and
        // form the default mask; dark voxels are excluded.
        let mut data = Array4::<f32>::zeros((2, 2, 1, 4));
        for t in 0..4 {
            for y in 0..2 {
                data[[0, y, 0, t]] = 1.0;
                data[[1, y, 0, t]] = 2.0;
            }
        }
        // A jump confined to the dark voxels is invisible to DVARS.
        data[[0, 0, 0, 2]] = 9.0;
        let (dvars, source) = dvars(data.view(), None);
        assert_eq!(source, DvarsMaskSource::Default);
        assert_eq!(dvars, vec![0.0; 4]);
    }

    #[test]
    fn test_dvars_single_jump() {
        // Bright voxels step from 2.0 to 5.0 at t = 2 and stay there, so
        // only the transition frame shows a nonzero DVARS.
        let mut data = Array4::<f32>::zeros((2, 2, 1, 4));
        for t in 0..4 {
            for y in 0..2 {
                data[[0, y, 0, t]] = 1.0;
                data[[1, y, 0, t]] = if t < 2 { 2.0 } else { 5.0 };
            }
        }
        let (dvars, source) = dvars(data.view(), None);
        assert_eq!(source, DvarsMaskSource::Default);
        assert_eq!(dvars[0], 0.0);
        assert_eq!(dvars[1], 0.0);
        assert!((dvars[2] - 3.0).abs() < 1e-9);
        assert_eq!(dvars[3], 0.0);
    }

    #[test]
    fn test_dvars_provided_mask_precedence() {
        let mut data = Array4::<f32>::zeros((2, 1, 1, 3));
        data[[0, 0, 0, 1]] = 3.0;
        // Mask selects only the quiet voxel; DVARS must ignore the noisy one.
        let mut mask = Array3::from_elem((2, 1, 1), false);
        mask[[1, 0, 0]] = true;
        let mask = Mask3d::from_array(mask);
        let (dvars, source) = dvars(data.view(), Some(&mask));
        assert_eq!(source, DvarsMaskSource::Provided);
        assert_eq!(dvars, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_split_motion_params() {
        let params = Array2::<f64>::from_shape_fn((6, 6), |(r, _)| r as f64);
        let parts = split_motion_params(&params, &[2, 4]).unwrap();
        assert_eq!(parts[0].nrows(), 2);
        assert_eq!(parts[1].nrows(), 4);
        assert_eq!(parts[1][[0, 0]], 2.0);
        assert!(split_motion_params(&params, &[2, 2]).is_err());
    }
}
