//! Jacobian determinant of a deformation `id + u`, for reporting.

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::image::{Field, Image};

/// Compute the per-voxel Jacobian determinant of `id + u` into `out`.
///
/// Partial derivatives are central differences in the interior and one-sided
/// at the image faces.
pub fn jacobian_determinant<const D: usize>(u: &Field<D>, out: &mut Image<D>) {
    assert_eq!(out.channels(), 1);
    assert_eq!(out.geometry().size(), u.geometry().size());

    let geom = u.geometry().clone();
    let size = geom.size();
    let strides = geom.strides();
    let n = geom.num_voxels();
    let chunk = n.div_ceil(rayon::current_num_threads().max(1)).max(1);
    let data = u.data();

    out.data_mut()
        .par_chunks_mut(chunk)
        .enumerate()
        .for_each(|(c, slab)| {
            let first = c * chunk;
            for (local, o) in slab.iter_mut().enumerate() {
                let voxel = first + local;
                let index = geom.index_of(voxel);
                let mut jac = DMatrix::<f64>::identity(D, D);
                for axis in 0..D {
                    let (lo, hi, scale) = if size[axis] == 1 {
                        (voxel, voxel, 1.0)
                    } else if index[axis] == 0 {
                        (voxel, voxel + strides[axis], 1.0)
                    } else if index[axis] == size[axis] - 1 {
                        (voxel - strides[axis], voxel, 1.0)
                    } else {
                        (voxel - strides[axis], voxel + strides[axis], 0.5)
                    };
                    for comp in 0..D {
                        let d = (data[hi * D + comp] as f64 - data[lo * D + comp] as f64) * scale;
                        jac[(comp, axis)] += d;
                    }
                }
                *o = jac.determinant() as f32;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_field_has_unit_jacobian() {
        let geom = Geometry::<2>::unit([6, 6]);
        let u = Field::<2>::new(geom.clone());
        let mut det = Image::<2>::new(geom, 1);
        jacobian_determinant(&u, &mut det);
        for &v in det.data() {
            assert_relative_eq!(v, 1.0);
        }
    }

    #[test]
    fn test_uniform_expansion() {
        // u(x) = 0.5 x expands the grid by 1.5 per axis: det = 1.5^2
        let geom = Geometry::<2>::unit([8, 8]);
        let mut u = Field::<2>::new(geom.clone());
        for i in 0..geom.num_voxels() {
            let idx = geom.index_of(i);
            u.set_vec(i, [0.5 * idx[0] as f32, 0.5 * idx[1] as f32]);
        }
        let mut det = Image::<2>::new(geom, 1);
        jacobian_determinant(&u, &mut det);
        for &v in det.data() {
            assert_relative_eq!(v, 2.25, epsilon = 1e-5);
        }
    }
}
