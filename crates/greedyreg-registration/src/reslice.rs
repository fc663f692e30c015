//! Transform-chain composition and image reslicing.
//!
//! The chain is composed into one displacement field over the reference
//! grid, holding physical (LPS) offsets. Warp entries are applied after the
//! running composite; matrix entries (physical RAS) are applied pointwise
//! with the sign flips hidden behind the geometry helpers.

use nalgebra::DMatrix;
use rayon::prelude::*;

use greedyreg_core::filter::{compose_physical, warp_image, GaussianFilter, Interp};
use greedyreg_core::parallel;
use greedyreg_core::{Field, Geometry, Image, Point};

use crate::error::{GreedyError, Result};

/// Interpolation mode for one reslice output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResliceInterp {
    Linear,
    Nearest,
    /// Labelwise voting; sigma is the per-label smoothing in voxel units of
    /// the label image.
    Label { sigma: f64 },
}

/// One entry of a transform chain, already materialized from its file.
pub enum ChainEntry<const D: usize> {
    /// Displacement field in physical LPS units on its own grid.
    Warp(Field<D>),
    /// Homogeneous `(D+1)×(D+1)` matrix in physical RAS convention, with
    /// any exponent already applied.
    Matrix(DMatrix<f64>),
}

/// Maximum number of distinct labels supported by labelwise reslicing.
pub const MAX_LABELS: usize = 1000;

/// Compose a transform chain into a single physical-unit displacement field
/// over the reference grid. The identity chain is the zero field.
pub fn compose_chain<const D: usize>(
    entries: &[ChainEntry<D>],
    reference: &Geometry<D>,
) -> Result<Field<D>> {
    let mut warp = Field::<D>::new(reference.clone());
    let mut scratch = Field::<D>::new(reference.clone());

    for entry in entries {
        match entry {
            ChainEntry::Warp(w) => {
                compose_physical(w, &warp, reference, &mut scratch);
                std::mem::swap(&mut warp, &mut scratch);
            }
            ChainEntry::Matrix(q) => {
                if q.nrows() != D + 1 || q.ncols() != D + 1 {
                    return Err(GreedyError::input(format!(
                        "expected a {}x{} matrix in transform chain, got {}x{}",
                        D + 1,
                        D + 1,
                        q.nrows(),
                        q.ncols()
                    )));
                }
                apply_matrix_to_chain(q, reference, &mut warp);
            }
        }
    }
    Ok(warp)
}

/// Pointwise update of the running chain by a physical RAS matrix:
/// `u(i) ← A·(p(i) + u(i)) − p(i)` with the RAS↔LPS flips around `A`.
fn apply_matrix_to_chain<const D: usize>(
    q: &DMatrix<f64>,
    reference: &Geometry<D>,
    warp: &mut Field<D>,
) {
    let n = reference.num_voxels();
    let chunk = n.div_ceil(rayon::current_num_threads().max(1)).max(1);

    warp.data_mut()
        .par_chunks_mut(chunk * D)
        .enumerate()
        .for_each(|(c, slab)| {
            let first = c * chunk;
            for (local, frame) in slab.chunks_exact_mut(D).enumerate() {
                let voxel = first + local;
                let index = reference.index_of(voxel);
                let mut fi = [0.0f64; D];
                for d in 0..D {
                    fi[d] = index[d] as f64;
                }
                let pt = reference.voxel_to_physical(fi);

                // Displaced point, expressed in the matrix's convention.
                let ras = pt.displaced_by(frame).flip_convention();
                let mut mapped = [0.0f64; D];
                for i in 0..D {
                    let mut acc = q[(i, D)];
                    for j in 0..D {
                        acc += q[(i, j)] * ras[j];
                    }
                    mapped[i] = acc;
                }
                let lps = Point::new(mapped).flip_convention();
                frame.copy_from_slice(&pt.offset_to(&lps));
            }
        });
}

/// Reslice a moving image through a composed physical-unit warp.
pub fn reslice_image<const D: usize>(
    moving: &Image<D>,
    warp: &Field<D>,
    reference: &Geometry<D>,
    nearest: bool,
) -> Image<D> {
    let mut out = Image::<D>::new(reference.clone(), moving.channels());
    let interp = if nearest {
        Interp::Nearest
    } else {
        Interp::Linear
    };
    warp_image(moving, warp, &mut out, interp, true);
    out
}

/// Labelwise reslicing: per-label indicator smoothing, warping and N-ary
/// voting. The output voxel takes the label with the maximal smoothed
/// probability; ties break toward the smallest label index. Output labels
/// are always a subset of the input's label set.
pub fn reslice_labels<const D: usize>(
    moving: &Image<D>,
    warp: &Field<D>,
    reference: &Geometry<D>,
    sigma: f64,
) -> Result<Image<D>> {
    if moving.channels() != 1 {
        return Err(GreedyError::input(
            "labelwise reslicing expects a scalar label image",
        ));
    }

    // Collect the sorted unique label set.
    let mut labels: Vec<i16> = Vec::new();
    {
        let mut set = std::collections::BTreeSet::new();
        for &v in moving.data() {
            set.insert(v.round() as i16);
            if set.len() > MAX_LABELS {
                return Err(GreedyError::configuration(format!(
                    "labelwise interpolation not supported for images with over {} distinct labels",
                    MAX_LABELS
                )));
            }
        }
        labels.extend(set);
    }

    let label_geom = moving.geometry().clone();
    let smoother = GaussianFilter::<D>::new([sigma; D]);
    let mut indicator = Image::<D>::new(label_geom.clone(), 1);
    let mut smoothed = Image::<D>::new(label_geom.clone(), 1);
    let mut smooth_tmp = Image::<D>::new(label_geom, 1);
    let mut warped = Image::<D>::new(reference.clone(), 1);

    let mut out = Image::<D>::new(reference.clone(), 1);
    let mut best_prob = Image::<D>::new(reference.clone(), 1);
    best_prob.fill(f32::NEG_INFINITY);

    for &label in &labels {
        for (dst, &src) in indicator.data_mut().iter_mut().zip(moving.data()) {
            *dst = if src.round() as i16 == label { 1.0 } else { 0.0 };
        }
        smoother.apply_image(&indicator, &mut smoothed, &mut smooth_tmp);
        warp_image(&smoothed, warp, &mut warped, Interp::Linear, true);

        let ranges = parallel::chunk_ranges(reference.num_voxels());
        let out_slabs = parallel::split_frames_mut(out.data_mut(), &ranges, 1);
        let best_slabs = parallel::split_frames_mut(best_prob.data_mut(), &ranges, 1);
        let probs = warped.data();
        ranges
            .par_iter()
            .zip(out_slabs)
            .zip(best_slabs)
            .for_each(|((range, out_slab), best_slab)| {
                for (local, voxel) in range.clone().enumerate() {
                    if probs[voxel] > best_slab[local] {
                        best_slab[local] = probs[voxel];
                        out_slab[local] = label as f32;
                    }
                }
            });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_chain_is_zero() {
        let geom = Geometry::<2>::unit([8, 8]);
        let warp = compose_chain::<2>(&[], &geom).unwrap();
        assert_eq!(warp.max_norm(), 0.0);
    }

    #[test]
    fn test_matrix_entry_translation() {
        // A RAS translation by (+1, +2) is an LPS translation by (-1, -2).
        let geom = Geometry::<2>::unit([8, 8]);
        let mut q = DMatrix::<f64>::identity(3, 3);
        q[(0, 2)] = 1.0;
        q[(1, 2)] = 2.0;
        let warp = compose_chain(&[ChainEntry::Matrix(q)], &geom).unwrap();
        for i in 0..geom.num_voxels() {
            let v = warp.vec(i);
            assert_relative_eq!(v[0], -1.0, epsilon = 1e-5);
            assert_relative_eq!(v[1], -2.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_chain_of_two_warps_matches_single_composition() {
        // S5: applying warp_a then warp_b through the chain equals the
        // composed field applied once, for constant fields exactly.
        let geom = Geometry::<2>::unit([10, 10]);
        let mut a = Field::<2>::new(geom.clone());
        a.fill_vec([0.5, 0.0]);
        let mut b = Field::<2>::new(geom.clone());
        b.fill_vec([0.0, -0.75]);

        let chained = compose_chain(
            &[ChainEntry::Warp(a.clone()), ChainEntry::Warp(b.clone())],
            &geom,
        )
        .unwrap();
        for i in 0..geom.num_voxels() {
            let v = chained.vec(i);
            assert_relative_eq!(v[0], 0.5, epsilon = 1e-5);
            assert_relative_eq!(v[1], -0.75, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_labelwise_output_is_subset() {
        let geom = Geometry::<2>::unit([12, 12]);
        let mut labels = Image::<2>::new(geom.clone(), 1);
        for y in 0..12 {
            for x in 0..12 {
                let v = if x < 6 { 3.0 } else { 7.0 };
                labels.set([x, y], 0, v);
            }
        }
        let warp = Field::<2>::new(geom.clone());
        let out = reslice_labels(&labels, &warp, &geom, 0.8).unwrap();
        for &v in out.data() {
            assert!(v == 3.0 || v == 7.0);
        }
        // Far from the boundary, labels survive untouched.
        assert_eq!(out.get([1, 6], 0), 3.0);
        assert_eq!(out.get([10, 6], 0), 7.0);
    }
}
