//! Anatomical CompCor: principal components over tissue-mask time series.
//!
//! The extraction chain is: mask time-series extraction, optional linear
//! detrend, optional Butterworth high-pass (forward-backward, zero phase),
//! optional per-voxel standardization, then centered PCA by singular value
//! decomposition. The decomposition is deterministic: for identical inputs it
//! produces bit-identical components. Sign ambiguity is resolved by making
//! the loading with the largest absolute value in each component positive
//! (ties broken by the earliest index).
//!
//! Reference: Behzadi Y et al. (2007). A component based noise correction
//! method (CompCor) for BOLD and perfusion based fMRI. NeuroImage 37:90-101.

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView4};

use crate::core::errors::{Result, SpineError};
use crate::image::Mask3d;

/// Components and explained variance for one tissue.
#[derive(Debug, Clone)]
pub struct CompcorResult {
    /// Component time courses, shape (T, k).
    pub components: Array2<f64>,
    /// Variance ratio explained by each component, length k.
    pub explained_variance: Vec<f64>,
}

impl CompcorResult {
    /// An empty result (degenerate mask or zero rank).
    pub fn empty(n_timepoints: usize) -> Self {
        Self {
            components: Array2::zeros((n_timepoints, 0)),
            explained_variance: Vec::new(),
        }
    }

    /// Number of emitted components.
    pub fn n_components(&self) -> usize {
        self.components.ncols()
    }
}

/// Extracts the T x V time-series matrix over the mask voxels.
///
/// Voxels iterate in (x, y, z) index order, so extraction is deterministic.
pub fn extract_timeseries(data: ArrayView4<f32>, mask: &Mask3d) -> Result<Array2<f64>> {
    let (nx, ny, nz, nt) = data.dim();
    if mask.data.dim() != (nx, ny, nz) {
        return Err(SpineError::degenerate(format!(
            "mask shape {:?} does not match image spatial shape {:?}",
            mask.data.dim(),
            (nx, ny, nz)
        )));
    }
    let members: Vec<(usize, usize, usize)> = mask
        .data
        .indexed_iter()
        .filter_map(|(idx, &m)| m.then_some(idx))
        .collect();
    if members.is_empty() {
        return Err(SpineError::degenerate("mask contains no voxels"));
    }
    let mut ts = Array2::zeros((nt, members.len()));
    for (v, &(x, y, z)) in members.iter().enumerate() {
        for t in 0..nt {
            ts[[t, v]] = data[[x, y, z, t]] as f64;
        }
    }
    Ok(ts)
}

/// Removes the per-voxel linear trend by least squares on the time index.
pub fn detrend_linear(ts: &mut Array2<f64>) {
    let n = ts.nrows();
    if n < 2 {
        return;
    }
    let t_mean = (n as f64 - 1.0) / 2.0;
    let denom: f64 = (0..n).map(|t| (t as f64 - t_mean).powi(2)).sum();
    if denom == 0.0 {
        return;
    }
    for mut col in ts.columns_mut() {
        let y_mean = col.iter().sum::<f64>() / n as f64;
        let slope: f64 = col
            .iter()
            .enumerate()
            .map(|(t, &y)| (t as f64 - t_mean) * (y - y_mean))
            .sum::<f64>()
            / denom;
        for (t, y) in col.iter_mut().enumerate() {
            *y -= y_mean + slope * (t as f64 - t_mean);
        }
    }
}

/// Second-order Butterworth high-pass coefficients (bilinear transform).
fn highpass_coefficients(cutoff_hz: f64, sample_rate_hz: f64) -> Option<([f64; 3], [f64; 2])> {
    if cutoff_hz <= 0.0 || cutoff_hz >= sample_rate_hz / 2.0 {
        return None;
    }
    let k = (std::f64::consts::PI * cutoff_hz / sample_rate_hz).tan();
    let q = std::f64::consts::FRAC_1_SQRT_2;
    let norm = 1.0 / (1.0 + k / q + k * k);
    let b = [norm, -2.0 * norm, norm];
    let a = [2.0 * (k * k - 1.0) * norm, (1.0 - k / q + k * k) * norm];
    Some((b, a))
}

fn biquad_filter(x: &[f64], b: [f64; 3], a: [f64; 2]) -> Vec<f64> {
    let mut y = vec![0.0; x.len()];
    let (mut x1, mut x2, mut y1, mut y2) = (0.0, 0.0, 0.0, 0.0);
    for (i, &xi) in x.iter().enumerate() {
        let yi = b[0] * xi + b[1] * x1 + b[2] * x2 - a[0] * y1 - a[1] * y2;
        x2 = x1;
        x1 = xi;
        y2 = y1;
        y1 = yi;
        y[i] = yi;
    }
    y
}

/// Applies the high-pass forward and backward for zero phase.
///
/// A cutoff at or above Nyquist, or a non-positive cutoff, is a no-op.
pub fn highpass_butterworth(ts: &mut Array2<f64>, cutoff_hz: f64, tr_s: f64) {
    let sample_rate = if tr_s > 0.0 { 1.0 / tr_s } else { 1.0 };
    let Some((b, a)) = highpass_coefficients(cutoff_hz, sample_rate) else {
        return;
    };
    for mut col in ts.columns_mut() {
        let series: Vec<f64> = col.iter().copied().collect();
        let forward = biquad_filter(&series, b, a);
        let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
        reversed = biquad_filter(&reversed, b, a);
        for (y, v) in col.iter_mut().zip(reversed.into_iter().rev()) {
            *y = v;
        }
    }
}

/// Z-scores each voxel time series in place; zero-variance voxels divide by 1.
pub fn standardize(ts: &mut Array2<f64>) {
    let n = ts.nrows();
    if n == 0 {
        return;
    }
    for mut col in ts.columns_mut() {
        let mean = col.iter().sum::<f64>() / n as f64;
        let var = col.iter().map(|&y| (y - mean).powi(2)).sum::<f64>() / n as f64;
        let std = if var > 0.0 { var.sqrt() } else { 1.0 };
        for y in col.iter_mut() {
            *y = (*y - mean) / std;
        }
    }
}

/// Fits CompCor by deterministic SVD-based PCA.
///
/// The matrix is centered per voxel; components are the left singular vectors
/// in time. The emitted count is limited by `n_components`, the matrix rank,
/// and `min(V, T-1)`.
pub fn fit_compcor(ts: &Array2<f64>, n_components: usize) -> CompcorResult {
    let (nt, nv) = ts.dim();
    let max_components = n_components.min(nv).min(nt.saturating_sub(1));
    if max_components == 0 {
        return CompcorResult::empty(nt);
    }

    // Center each voxel's series.
    let mut centered = ts.clone();
    for mut col in centered.columns_mut() {
        let mean = col.iter().sum::<f64>() / nt as f64;
        for y in col.iter_mut() {
            *y -= mean;
        }
    }

    let m = DMatrix::from_fn(nt, nv, |r, c| centered[[r, c]]);
    let svd = m.svd(true, false);
    let u = match svd.u {
        Some(u) => u,
        None => return CompcorResult::empty(nt),
    };
    let s = svd.singular_values;

    let total_variance: f64 = s.iter().map(|&v| v * v).sum();
    if total_variance <= 0.0 {
        return CompcorResult::empty(nt);
    }
    // Numerical rank: singular values above a scale-relative tolerance.
    let tol = s[0] * (nt.max(nv) as f64) * f64::EPSILON;
    let rank = s.iter().filter(|&&v| v > tol).count();
    let k = max_components.min(rank);
    if k == 0 {
        return CompcorResult::empty(nt);
    }

    let mut components = Array2::zeros((nt, k));
    let mut explained = Vec::with_capacity(k);
    for c in 0..k {
        for t in 0..nt {
            components[[t, c]] = u[(t, c)];
        }
        explained.push(s[c] * s[c] / total_variance);
    }
    normalize_signs(&mut components);
    CompcorResult {
        components,
        explained_variance: explained,
    }
}

/// Makes the loading of largest absolute value in each component positive;
/// ties resolved by the earliest index.
fn normalize_signs(components: &mut Array2<f64>) {
    for mut col in components.columns_mut() {
        let mut max_abs = 0.0;
        let mut max_val = 0.0;
        for &v in col.iter() {
            if v.abs() > max_abs {
                max_abs = v.abs();
                max_val = v;
            }
        }
        if max_val < 0.0 {
            for v in col.iter_mut() {
                *v = -*v;
            }
        }
    }
}
