//! Displacement-field serialization.
//!
//! On disk, warps hold physical displacements in RAS convention: voxel
//! offsets mapped through `R·diag(s)` of the reference geometry and
//! sign-flipped on the first two axes. Components are optionally quantized
//! to a multiple of the warp precision (in voxels) before conversion, which
//! makes gzip compression effective at a bounded accuracy cost.

use anyhow::{bail, Context, Result};
use std::path::Path;

use greedyreg_core::spatial::lps_to_ras_flip;
use greedyreg_core::{Field, Image};
use nalgebra::SVector;

use crate::nifti_io::{read_image, write_image};

/// Write a voxel-unit warp in physical RAS convention.
///
/// `precision` is the quantization step in voxels; 0 disables quantization.
pub fn write_warp<const D: usize, P: AsRef<Path>>(
    path: P,
    warp: &Field<D>,
    precision: f64,
) -> Result<()> {
    let geometry = warp.geometry().clone();
    let to_physical = geometry.voxel_to_physical_matrix();
    let flip = lps_to_ras_flip::<D>();
    let to_ras = flip * to_physical;

    let mut out = Image::<D>::new(geometry.clone(), D);
    for voxel in 0..geometry.num_voxels() {
        let u = warp.vec(voxel);
        let mut v = SVector::<f64, D>::zeros();
        for d in 0..D {
            let c = u[d] as f64;
            v[d] = if precision > 0.0 {
                (c / precision).round() * precision
            } else {
                c
            };
        }
        let phys = to_ras * v;
        for d in 0..D {
            out.voxel_mut(voxel)[d] = phys[d] as f32;
        }
    }
    write_image(path, &out)
}

/// Read a warp file back into voxel units of its own grid.
pub fn read_warp_voxel<const D: usize, P: AsRef<Path>>(path: P) -> Result<Field<D>> {
    let image = read_image::<D, _>(path.as_ref())
        .with_context(|| format!("failed to read warp {}", path.as_ref().display()))?;
    if image.channels() != D {
        bail!(
            "warp file {} has {} components, expected {}",
            path.as_ref().display(),
            image.channels(),
            D
        );
    }
    let geometry = image.geometry().clone();
    let from_ras = (lps_to_ras_flip::<D>() * geometry.voxel_to_physical_matrix())
        .try_inverse()
        .context("warp geometry is singular")?;

    let mut field = Field::<D>::new(geometry.clone());
    for voxel in 0..geometry.num_voxels() {
        let mut v = SVector::<f64, D>::zeros();
        for d in 0..D {
            v[d] = image.voxel(voxel)[d] as f64;
        }
        let u = from_ras * v;
        let mut frame = [0.0f32; D];
        for d in 0..D {
            frame[d] = u[d] as f32;
        }
        field.set_vec(voxel, frame);
    }
    Ok(field)
}

/// Read a warp file as physical LPS displacements (used by the transform
/// chain, which composes in physical units).
pub fn read_warp_physical<const D: usize, P: AsRef<Path>>(path: P) -> Result<Field<D>> {
    let image = read_image::<D, _>(path.as_ref())
        .with_context(|| format!("failed to read warp {}", path.as_ref().display()))?;
    if image.channels() != D {
        bail!(
            "warp file {} has {} components, expected {}",
            path.as_ref().display(),
            image.channels(),
            D
        );
    }
    let geometry = image.geometry().clone();
    let flip = lps_to_ras_flip::<D>();

    let mut field = Field::<D>::new(geometry.clone());
    for voxel in 0..geometry.num_voxels() {
        let mut v = SVector::<f64, D>::zeros();
        for d in 0..D {
            v[d] = image.voxel(voxel)[d] as f64;
        }
        let lps = flip * v;
        let mut frame = [0.0f32; D];
        for d in 0..D {
            frame[d] = lps[d] as f32;
        }
        field.set_vec(voxel, frame);
    }
    Ok(field)
}
