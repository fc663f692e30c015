//! Displacement-field composition.
//!
//! `(u ∘ v)(i) = v(i) + u(i + v(i))` with linear sampling of `u` and
//! boundary replication. Composing with the zero field on either side
//! returns the other field unchanged.

use rayon::prelude::*;

use crate::geometry::Geometry;
use crate::image::Field;
use crate::interpolation::{LinearSampler, Sampler};

/// Compute `out = u ∘ v` in voxel units: `out(i) = v(i) + u(i + v(i))`.
///
/// All three fields must share a geometry. `out` must be distinct from both
/// inputs.
pub fn compose<const D: usize>(u: &Field<D>, v: &Field<D>, out: &mut Field<D>) {
    let geom = v.geometry().clone();
    assert_eq!(u.geometry().size(), geom.size());
    assert_eq!(out.geometry().size(), geom.size());

    let sampler = LinearSampler::<D>::from_parts(
        u.data(),
        u.geometry().size(),
        u.geometry().strides(),
        D,
    );
    let n = geom.num_voxels();
    let chunk = n.div_ceil(rayon::current_num_threads().max(1)).max(1);
    let v_data = v.data();

    out.data_mut()
        .par_chunks_mut(chunk * D)
        .enumerate()
        .for_each(|(c, slab)| {
            let first = c * chunk;
            let mut sample = [0.0f32; D];
            for (local, frame) in slab.chunks_exact_mut(D).enumerate() {
                let voxel = first + local;
                let index = geom.index_of(voxel);
                let vi = &v_data[voxel * D..voxel * D + D];
                let mut x = [0.0f64; D];
                for d in 0..D {
                    x[d] = index[d] as f64 + vi[d] as f64;
                }
                sampler.sample_clamped(x, &mut sample);
                for d in 0..D {
                    frame[d] = vi[d] + sample[d];
                }
            }
        });
}

/// Physical-unit composition used by the transform chain: both fields hold
/// physical (LPS) displacements, and the new warp `u_new` (on its own grid)
/// is applied after the running composite `u_cur` (on the reference grid):
/// `out(i) = u_cur(i) + u_new(p(i) + u_cur(i))` where `p` is the reference
/// voxel-to-physical map and `u_new` is sampled at its own voxel
/// coordinates of that displaced physical point.
pub fn compose_physical<const D: usize>(
    u_new: &Field<D>,
    u_cur: &Field<D>,
    reference: &Geometry<D>,
    out: &mut Field<D>,
) {
    assert_eq!(u_cur.geometry().size(), reference.size());
    assert_eq!(out.geometry().size(), reference.size());

    let new_geom = u_new.geometry().clone();
    let sampler =
        LinearSampler::<D>::from_parts(u_new.data(), new_geom.size(), new_geom.strides(), D);
    let n = reference.num_voxels();
    let chunk = n.div_ceil(rayon::current_num_threads().max(1)).max(1);
    let cur_data = u_cur.data();

    out.data_mut()
        .par_chunks_mut(chunk * D)
        .enumerate()
        .for_each(|(c, slab)| {
            let first = c * chunk;
            let mut sample = [0.0f32; D];
            for (local, frame) in slab.chunks_exact_mut(D).enumerate() {
                let voxel = first + local;
                let index = reference.index_of(voxel);
                let cur = &cur_data[voxel * D..voxel * D + D];
                let mut fi = [0.0f64; D];
                for d in 0..D {
                    fi[d] = index[d] as f64;
                }
                let p = reference.voxel_to_physical(fi).displaced_by(cur);
                let x = new_geom.physical_to_voxel(&p);
                sampler.sample_clamped(x, &mut sample);
                for d in 0..D {
                    frame[d] = cur[d] + sample[d];
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use approx::assert_relative_eq;

    #[test]
    fn test_compose_with_zero_is_identity() {
        let geom = Geometry::<2>::unit([6, 6]);
        let mut u = Field::<2>::new(geom.clone());
        for i in 0..geom.num_voxels() {
            let idx = geom.index_of(i);
            u.set_vec(i, [0.1 * idx[0] as f32, -0.05 * idx[1] as f32]);
        }
        let zero = Field::<2>::new(geom.clone());
        let mut out = Field::<2>::new(geom.clone());

        // u ∘ 0 = u
        compose(&u, &zero, &mut out);
        for i in 0..geom.num_voxels() {
            let a = u.vec(i);
            let b = out.vec(i);
            assert_relative_eq!(a[0], b[0], epsilon = 1e-6);
            assert_relative_eq!(a[1], b[1], epsilon = 1e-6);
        }

        // 0 ∘ u = u
        compose(&zero, &u, &mut out);
        for i in 0..geom.num_voxels() {
            let a = u.vec(i);
            let b = out.vec(i);
            assert_relative_eq!(a[0], b[0], epsilon = 1e-6);
            assert_relative_eq!(a[1], b[1], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_compose_constant_translations_add() {
        let geom = Geometry::<2>::unit([8, 8]);
        let mut u = Field::<2>::new(geom.clone());
        u.fill_vec([1.0, 0.0]);
        let mut v = Field::<2>::new(geom.clone());
        v.fill_vec([0.0, 2.0]);
        let mut out = Field::<2>::new(geom.clone());
        compose(&u, &v, &mut out);
        for i in 0..geom.num_voxels() {
            assert_eq!(out.vec(i), [1.0, 2.0]);
        }
    }
}
