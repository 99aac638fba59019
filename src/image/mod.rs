//! In-memory volumes and NIfTI I/O.
//!
//! This module wraps the NIfTI reader/writer behind two small types: a 4-D
//! functional series and a 3-D binary mask. All array math elsewhere in the
//! crate operates on `ndarray` views obtained from these types; headers ride
//! along so derived images keep the acquisition geometry.

use std::path::Path;

use ndarray::{Array3, Array4, Axis, Ix3, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::core::errors::{Result, SpineError};

/// A 4-D functional series with its header.
#[derive(Debug, Clone)]
pub struct Volume4d {
    /// Voxel data, indexed (x, y, z, t).
    pub data: Array4<f32>,
    /// The NIfTI header of the source image.
    pub header: NiftiHeader,
}

impl Volume4d {
    /// Reads a 4-D NIfTI image.
    ///
    /// A 3-D image is promoted to a single-volume series so that downstream
    /// per-volume math stays uniform.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SpineError::missing_input(path));
        }
        let obj = ReaderOptions::new().read_file(path)?;
        let header = obj.header().clone();
        let data = obj.into_volume().into_ndarray::<f32>()?;
        let data = match data.ndim() {
            4 => data.into_dimensionality::<Ix4>()?,
            3 => data.into_dimensionality::<Ix3>()?.insert_axis(Axis(3)),
            n => {
                return Err(SpineError::degenerate(format!(
                    "expected a 3-D or 4-D image, got {n}-D: {}",
                    path.display()
                )))
            }
        };
        Ok(Self { data, header })
    }

    /// Builds a series from an in-memory array with a synthetic header.
    pub fn from_array(data: Array4<f32>, tr_s: f32) -> Self {
        let (x, y, z, t) = data.dim();
        let mut header = NiftiHeader::default();
        header.dim = [4, x as u16, y as u16, z as u16, t as u16, 1, 1, 1];
        header.pixdim = [1.0, 1.0, 1.0, 1.0, tr_s, 0.0, 0.0, 0.0];
        header.datatype = 16; // float32
        header.bitpix = 32;
        Self { data, header }
    }

    /// Writes the series; `.gz` extensions are compressed by the writer.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        WriterOptions::new(path)
            .reference_header(&self.header)
            .write_nifti(&self.data)?;
        Ok(())
    }

    /// Number of volumes.
    pub fn nvols(&self) -> usize {
        self.data.dim().3
    }

    /// Repetition time in seconds, from the header time step.
    pub fn tr_s(&self) -> f64 {
        let tr = self.header.pixdim[4] as f64;
        if tr > 0.0 {
            tr
        } else {
            1.0
        }
    }

    /// Returns the sub-series of volumes in `[from, to)`.
    pub fn crop(&self, from: usize, to: usize) -> Result<Self> {
        let nvols = self.nvols();
        if from > to || to > nvols {
            return Err(SpineError::degenerate(format!(
                "crop bounds [{from}, {to}) invalid for {nvols} volumes"
            )));
        }
        let data = self
            .data
            .slice_axis(Axis(3), ndarray::Slice::from(from..to))
            .to_owned();
        Ok(Self {
            data,
            header: self.header.clone(),
        })
    }

    /// A zero-valued series with the same shape and header, for placeholder
    /// outputs.
    pub fn zeros_like(&self) -> Self {
        Self {
            data: Array4::zeros(self.data.dim()),
            header: self.header.clone(),
        }
    }

    /// Per-volume mean over the whole field of view.
    pub fn volume_means(&self) -> Vec<f64> {
        (0..self.nvols())
            .map(|t| {
                let vol = self.data.index_axis(Axis(3), t);
                vol.iter().map(|&v| v as f64).sum::<f64>() / vol.len().max(1) as f64
            })
            .collect()
    }

    /// Per-volume mean within a mask. Returns `None` if the mask is empty.
    pub fn masked_volume_means(&self, mask: &Mask3d) -> Option<Vec<f64>> {
        let n = mask.n_voxels();
        if n == 0 {
            return None;
        }
        Some(
            (0..self.nvols())
                .map(|t| {
                    let vol = self.data.index_axis(Axis(3), t);
                    let mut sum = 0.0f64;
                    ndarray::Zip::from(&vol).and(&mask.data).for_each(|&v, &m| {
                        if m {
                            sum += v as f64;
                        }
                    });
                    sum / n as f64
                })
                .collect(),
        )
    }
}

/// A 3-D binary mask aligned to the functional space.
#[derive(Debug, Clone)]
pub struct Mask3d {
    /// Voxel membership, indexed (x, y, z).
    pub data: Array3<bool>,
}

impl Mask3d {
    /// Reads a mask image and binarizes it at `threshold`.
    ///
    /// A 4-D image with a single volume is accepted and squeezed.
    pub fn read(path: &Path, threshold: f64) -> Result<Self> {
        if !path.exists() {
            return Err(SpineError::missing_input(path));
        }
        let obj = ReaderOptions::new().read_file(path)?;
        let data = obj.into_volume().into_ndarray::<f32>()?;
        let data = match data.ndim() {
            3 => data.into_dimensionality::<Ix3>()?,
            4 => {
                let four = data.into_dimensionality::<Ix4>()?;
                four.index_axis(Axis(3), 0).to_owned()
            }
            n => {
                return Err(SpineError::degenerate(format!(
                    "expected a 3-D mask, got {n}-D: {}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            data: data.mapv(|v| (v as f64) > threshold),
        })
    }

    /// Builds a mask from an in-memory boolean array.
    pub fn from_array(data: Array3<bool>) -> Self {
        Self { data }
    }

    /// An all-false mask of the given spatial shape, for placeholder outputs.
    pub fn zeros(shape: (usize, usize, usize)) -> Self {
        Self {
            data: Array3::from_elem(shape, false),
        }
    }

    /// Number of voxels inside the mask.
    pub fn n_voxels(&self) -> usize {
        self.data.iter().filter(|&&m| m).count()
    }

    /// Whether the mask selects no voxels.
    pub fn is_empty(&self) -> bool {
        self.n_voxels() == 0
    }

    /// Writes the mask as an 8-bit image with the given reference header.
    pub fn write(&self, path: &Path, header: &NiftiHeader) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let as_u8 = self.data.mapv(|m| u8::from(m));
        WriterOptions::new(path)
            .reference_header(header)
            .write_nifti(&as_u8)?;
        Ok(())
    }
}
