//! NIfTI image reading and writing.
//!
//! Geometry is decoded from the header's sform when present, then the
//! qform, then plain pixdim scaling. The NIfTI affine maps voxel indices to
//! RAS; the engine works in LPS, so the first two axes are sign-flipped on
//! both read and write. Trailing axes beyond the spatial dimension are
//! treated as channels.

use anyhow::{bail, Context, Result};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

use greedyreg_core::spatial::lps_to_ras_flip;
use greedyreg_core::{Direction, Geometry, Image, Point, Spacing};
use nalgebra::{SMatrix, SVector};

/// Voxel-to-RAS affine of the header: three rows of `[R·S | t]`.
fn header_affine(header: &NiftiHeader) -> [[f64; 4]; 4] {
    if header.sform_code > 0 {
        let r0 = header.srow_x;
        let r1 = header.srow_y;
        let r2 = header.srow_z;
        [
            [r0[0] as f64, r0[1] as f64, r0[2] as f64, r0[3] as f64],
            [r1[0] as f64, r1[1] as f64, r1[2] as f64, r1[3] as f64],
            [r2[0] as f64, r2[1] as f64, r2[2] as f64, r2[3] as f64],
            [0.0, 0.0, 0.0, 1.0],
        ]
    } else if header.qform_code > 0 {
        let b = header.quatern_b as f64;
        let c = header.quatern_c as f64;
        let d = header.quatern_d as f64;
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if header.pixdim[0] == 0.0 {
            1.0
        } else {
            header.pixdim[0] as f64
        };

        let r11 = a * a + b * b - c * c - d * d;
        let r12 = 2.0 * b * c - 2.0 * a * d;
        let r13 = 2.0 * b * d + 2.0 * a * c;
        let r21 = 2.0 * b * c + 2.0 * a * d;
        let r22 = a * a + c * c - b * b - d * d;
        let r23 = 2.0 * c * d - 2.0 * a * b;
        let r31 = 2.0 * b * d - 2.0 * a * c;
        let r32 = 2.0 * c * d + 2.0 * a * b;
        let r33 = a * a + d * d - c * c - b * b;

        let dx = header.pixdim[1] as f64;
        let dy = header.pixdim[2] as f64;
        let dz = header.pixdim[3] as f64 * qfac;

        [
            [r11 * dx, r12 * dy, r13 * dz, header.quatern_x as f64],
            [r21 * dx, r22 * dy, r23 * dz, header.quatern_y as f64],
            [r31 * dx, r32 * dy, r33 * dz, header.quatern_z as f64],
            [0.0, 0.0, 0.0, 1.0],
        ]
    } else {
        let dx = header.pixdim[1].max(1e-6) as f64;
        let dy = header.pixdim[2].max(1e-6) as f64;
        let dz = header.pixdim[3].max(1e-6) as f64;
        [
            [dx, 0.0, 0.0, 0.0],
            [0.0, dy, 0.0, 0.0],
            [0.0, 0.0, dz, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }
}

/// Decode the LPS geometry of the first `D` axes.
fn geometry_from_header<const D: usize>(
    header: &NiftiHeader,
    size: [usize; D],
) -> Result<Geometry<D>> {
    let affine = header_affine(header);
    let flip = lps_to_ras_flip::<D>();

    // RAS columns and offset for the spatial axes covered by the header.
    let spatial = D.min(3);
    let mut a = SMatrix::<f64, D, D>::identity();
    let mut b = SVector::<f64, D>::zeros();
    for i in 0..spatial {
        b[i] = affine[i][3];
        for j in 0..spatial {
            a[(i, j)] = affine[i][j];
        }
    }
    // A fourth (e.g. temporal) axis takes its pixdim spacing.
    if D > 3 {
        a[(3, 3)] = header.pixdim[4].max(1e-6) as f64;
    }

    // Back to LPS, then split into spacing, direction and origin.
    let a_lps = flip * a;
    let origin = flip * b;

    let mut spacing = [0.0f64; D];
    let mut dir = SMatrix::<f64, D, D>::identity();
    for j in 0..D {
        let col = a_lps.column(j);
        let norm = col.norm();
        if norm <= 1e-9 {
            bail!("degenerate voxel-to-physical transform in NIfTI header");
        }
        spacing[j] = norm;
        for i in 0..D {
            dir[(i, j)] = col[i] / norm;
        }
    }

    Ok(Geometry::new(
        size,
        Point::new(origin.into()),
        Spacing::new(spacing),
        Direction(dir),
    ))
}

/// Read a NIfTI file as a D-dimensional (possibly multi-channel) image.
pub fn read_image<const D: usize, P: AsRef<Path>>(path: P) -> Result<Image<D>> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("failed to read NIfTI file {}", path.display()))?;
    let header = obj.header().clone();
    let volume = obj.into_volume();
    let array = volume
        .into_ndarray::<f32>()
        .context("failed to decode NIfTI volume")?;

    let shape = array.shape().to_vec();
    let (size, channels) = if shape.len() == D {
        let mut s = [0usize; D];
        s.copy_from_slice(&shape);
        (s, 1usize)
    } else if shape.len() == D + 1 {
        let mut s = [0usize; D];
        s.copy_from_slice(&shape[..D]);
        (s, shape[D])
    } else {
        bail!(
            "expected a {}- or {}-dimensional volume in {}, found {} dimensions",
            D,
            D + 1,
            path.display(),
            shape.len()
        );
    };

    let geometry = geometry_from_header::<D>(&header, size)?;
    let mut image = Image::<D>::new(geometry.clone(), channels);
    let n = geometry.num_voxels();
    for voxel in 0..n {
        let index = geometry.index_of(voxel);
        for c in 0..channels {
            let mut ix = Vec::with_capacity(shape.len());
            ix.extend_from_slice(&index);
            if channels > 1 {
                ix.push(c);
            }
            image.voxel_mut(voxel)[c] = array[IxDyn(&ix)];
        }
    }
    Ok(image)
}

/// Header for the given geometry: sform rows from the voxel-to-RAS map.
fn header_for_geometry<const D: usize>(geometry: &Geometry<D>, channels: usize) -> NiftiHeader {
    let (a, b) = geometry.voxel_to_ras();
    let size = geometry.size();
    let spacing = geometry.spacing().to_array();

    let ndim = if channels > 1 { D + 1 } else { D };
    let mut dim = [1u16; 8];
    dim[0] = ndim as u16;
    for d in 0..D {
        dim[d + 1] = size[d] as u16;
    }
    if channels > 1 {
        dim[D + 1] = channels as u16;
    }

    let mut pixdim = [1.0f32; 8];
    for d in 0..D {
        pixdim[d + 1] = spacing[d] as f32;
    }

    let mut srow_x = [0.0f32; 4];
    let mut srow_y = [0.0f32; 4];
    let mut srow_z = [0.0f32; 4];
    let spatial = D.min(3);
    for j in 0..spatial {
        srow_x[j] = a[(0, j)] as f32;
        if spatial > 1 {
            srow_y[j] = a[(1, j)] as f32;
        }
        if spatial > 2 {
            srow_z[j] = a[(2, j)] as f32;
        }
    }
    if spatial < 3 {
        srow_z[2] = 1.0;
    }
    srow_x[3] = b[0] as f32;
    if spatial > 1 {
        srow_y[3] = b[1] as f32;
    }
    if spatial > 2 {
        srow_z[3] = b[2] as f32;
    }

    NiftiHeader {
        dim,
        pixdim,
        srow_x,
        srow_y,
        srow_z,
        sform_code: 1,
        qform_code: 0,
        ..Default::default()
    }
}

/// Write an image (channels ride the trailing axis).
pub fn write_image<const D: usize, P: AsRef<Path>>(path: P, image: &Image<D>) -> Result<()> {
    let path = path.as_ref();
    let geometry = image.geometry();
    let channels = image.channels();
    let size = geometry.size();
    let n = geometry.num_voxels();

    // The engine stores channels interleaved; the file layout wants the
    // channel axis slowest, matching Fortran order over [size..., channels].
    let mut shape: Vec<usize> = size.to_vec();
    if channels > 1 {
        shape.push(channels);
    }
    let mut data = vec![0.0f32; n * channels];
    for voxel in 0..n {
        for c in 0..channels {
            data[c * n + voxel] = image.voxel(voxel)[c];
        }
    }

    let array = ArrayD::from_shape_vec(IxDyn(&shape).f(), data)
        .context("failed to shape output volume")?;
    let header = header_for_geometry(geometry, channels);
    nifti::writer::WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&array)
        .with_context(|| format!("failed to write NIfTI file {}", path.display()))?;
    Ok(())
}
