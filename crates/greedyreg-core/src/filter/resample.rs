//! Resampling of images through displacement fields.

use rayon::prelude::*;

use crate::image::{Field, Image};
use crate::interpolation::{LinearSampler, NearestSampler, Sampler};

/// Interpolation scheme used when resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interp {
    Linear,
    Nearest,
}

/// Warp `src` through the displacement field: `out(i) = src(i + u(i))`.
///
/// With `physical` set, the displacement values are physical (LPS) offsets
/// and the sampled point is mapped into `src` voxel coordinates through the
/// source's own geometry; otherwise the displacement is in `src` voxel units
/// directly. Boundary values are replicated.
pub fn warp_image<const D: usize>(
    src: &Image<D>,
    warp: &Field<D>,
    out: &mut Image<D>,
    interp: Interp,
    physical: bool,
) {
    assert_eq!(out.channels(), src.channels());
    assert_eq!(out.geometry().size(), warp.geometry().size());

    let comps = src.channels();
    let out_geom = out.geometry().clone();
    let src_geom = src.geometry().clone();
    let n = out_geom.num_voxels();
    let chunk = n.div_ceil(rayon::current_num_threads().max(1)).max(1);
    let warp_data = warp.data();

    let linear = LinearSampler::new(src);
    let nearest = NearestSampler::new(src);

    out.data_mut()
        .par_chunks_mut(chunk * comps)
        .enumerate()
        .for_each(|(c, slab)| {
            let first = c * chunk;
            for (local, frame) in slab.chunks_exact_mut(comps).enumerate() {
                let voxel = first + local;
                let index = out_geom.index_of(voxel);
                let u = &warp_data[voxel * D..voxel * D + D];
                let x = if physical {
                    let mut fi = [0.0f64; D];
                    for d in 0..D {
                        fi[d] = index[d] as f64;
                    }
                    let p = out_geom.voxel_to_physical(fi).displaced_by(u);
                    src_geom.physical_to_voxel(&p)
                } else {
                    let mut x = [0.0f64; D];
                    for d in 0..D {
                        x[d] = index[d] as f64 + u[d] as f64;
                    }
                    x
                };
                match interp {
                    Interp::Linear => linear.sample_clamped(x, frame),
                    Interp::Nearest => nearest.sample_clamped(x, frame),
                }
            }
        });
}

/// Identity-resample a displacement field onto the geometry of `out`.
///
/// Each output voxel takes the linearly interpolated field value at the
/// source voxel coordinates of the same physical point; the displacement
/// values themselves are untouched (they stay in the source level's units,
/// so a level-step caller follows this with a scale by 2).
pub fn resample_field_identity<const D: usize>(src: &Field<D>, out: &mut Field<D>) {
    let out_geom = out.geometry().clone();
    let src_geom = src.geometry().clone();
    let n = out_geom.num_voxels();
    let chunk = n.div_ceil(rayon::current_num_threads().max(1)).max(1);

    let sampler =
        LinearSampler::<D>::from_parts(src.data(), src_geom.size(), src_geom.strides(), D);

    out.data_mut()
        .par_chunks_mut(chunk * D)
        .enumerate()
        .for_each(|(c, slab)| {
            let first = c * chunk;
            for (local, frame) in slab.chunks_exact_mut(D).enumerate() {
                let voxel = first + local;
                let index = out_geom.index_of(voxel);
                let mut fi = [0.0f64; D];
                for d in 0..D {
                    fi[d] = index[d] as f64;
                }
                let p = out_geom.voxel_to_physical(fi);
                let x = src_geom.physical_to_voxel(&p);
                sampler.sample_clamped(x, frame);
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use approx::assert_relative_eq;

    #[test]
    fn test_warp_by_integer_offset() {
        let geom = Geometry::<2>::unit([5, 5]);
        let mut src = Image::<2>::new(geom.clone(), 1);
        src.set([3, 2], 0, 7.0);
        let mut warp = Field::<2>::new(geom.clone());
        warp.fill_vec([1.0, 1.0]);
        let mut out = Image::<2>::new(geom, 1);
        warp_image(&src, &warp, &mut out, Interp::Linear, false);
        assert_eq!(out.get([2, 1], 0), 7.0);
    }

    #[test]
    fn test_nearest_warp_keeps_labels() {
        let geom = Geometry::<2>::unit([4, 4]);
        let mut src = Image::<2>::new(geom.clone(), 1);
        src.set([2, 2], 0, 3.0);
        let mut warp = Field::<2>::new(geom.clone());
        warp.fill_vec([0.4, 0.4]);
        let mut out = Image::<2>::new(geom, 1);
        warp_image(&src, &warp, &mut out, Interp::Nearest, false);
        // 2 + 0.4 rounds back to 2: label passes through unblended
        assert_eq!(out.get([2, 2], 0), 3.0);
    }

    #[test]
    fn test_identity_resample_refines_grid() {
        // Coarse 4x4 field with spacing 2 resampled onto a fine 8x8 grid.
        let coarse = Geometry::<2>::unit([4, 4]).downsample(1);
        let coarse = Geometry::<2>::new(
            coarse.size(),
            *coarse.origin(),
            crate::spatial::Spacing::new([2.0, 2.0]),
            *coarse.direction(),
        );
        let mut src = Field::<2>::new(coarse);
        src.fill_vec([1.5, -0.5]);
        let mut out = Field::<2>::new(Geometry::<2>::unit([8, 8]));
        resample_field_identity(&src, &mut out);
        for i in 0..out.geometry().num_voxels() {
            let v = out.vec(i);
            assert_relative_eq!(v[0], 1.5, epsilon = 1e-6);
            assert_relative_eq!(v[1], -0.5, epsilon = 1e-6);
        }
    }
}
