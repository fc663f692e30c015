//! Brute-force integer-offset search.
//!
//! Enumerates every integer offset within a radius, evaluates the windowed
//! NCC map for the constant field at that offset, and keeps the per-voxel
//! argmax. The output is a discrete displacement field.

use rayon::prelude::*;
use tracing::info;

use greedyreg_core::parallel;
use greedyreg_core::{Field, Image};

use crate::error::{GreedyError, Result};
use crate::metric::{Metric, MetricWorkspace, PatchNcc};
use crate::params::{GreedyParams, MetricKind};
use crate::pyramid::Pyramid;

/// Initial "worse than anything" metric value.
const METRIC_FLOOR: f32 = -100.0;

/// Exhaustive search over offsets in `[-r, r]` per axis.
///
/// Returns the best-offset field and the best-metric image. Only the NCC
/// metric is supported, and the search radius must match the image
/// dimension.
pub fn run_brute<const D: usize>(
    pyramid: &Pyramid<D>,
    params: &GreedyParams,
    search_radius: &[i64],
) -> Result<(Field<D>, Image<D>)> {
    let metric = match &params.metric {
        MetricKind::Ncc { radius } => {
            if radius.len() != D {
                return Err(GreedyError::configuration(format!(
                    "NCC radius has {} components for {}-dimensional images",
                    radius.len(),
                    D
                )));
            }
            let mut r = [0usize; D];
            r.copy_from_slice(radius);
            PatchNcc::new(r)
        }
        _ => {
            return Err(GreedyError::configuration(
                "brute force search requires the NCC metric",
            ));
        }
    };
    if search_radius.len() != D {
        return Err(GreedyError::configuration(
            "brute force search radius must have one component per image dimension",
        ));
    }

    let refspace = pyramid.reference_space(0).clone();
    let level = pyramid.level(0);
    let weights = pyramid.channel_weights();
    let n = refspace.num_voxels();

    let mut u_best = Field::<D>::new(refspace.clone());
    let mut u_curr = Field::<D>::new(refspace.clone());
    let mut m_best = Image::<D>::new(refspace.clone(), 1);
    m_best.fill(METRIC_FLOOR);
    let mut ws = MetricWorkspace::new(&refspace);

    // Odometer over all offsets in the search box.
    let mut offset = [0i64; D];
    for d in 0..D {
        offset[d] = -search_radius[d];
    }
    loop {
        let mut vec = [0.0f32; D];
        for d in 0..D {
            vec[d] = offset[d] as f32;
        }
        u_curr.fill_vec(vec);
        metric.dense(level, weights, &u_curr, &mut ws, false)?;

        // Keep the better of the two metric values per voxel.
        let ranges = parallel::chunk_ranges(n);
        let best_slabs = parallel::split_frames_mut(m_best.data_mut(), &ranges, 1);
        let u_slabs = parallel::split_frames_mut(u_best.data_mut(), &ranges, D);
        let curr = ws.metric_image.data();
        let updates: usize = ranges
            .par_iter()
            .zip(best_slabs)
            .zip(u_slabs)
            .map(|((range, best_slab), u_slab)| {
                let mut count = 0usize;
                for (local, voxel) in range.clone().enumerate() {
                    if curr[voxel] > best_slab[local] {
                        best_slab[local] = curr[voxel];
                        u_slab[local * D..(local + 1) * D].copy_from_slice(&vec);
                        count += 1;
                    }
                }
                count
            })
            .sum();
        info!(?offset, updates, "brute force offset evaluated");

        // Advance the odometer.
        let mut done = true;
        for d in 0..D {
            offset[d] += 1;
            if offset[d] <= search_radius[d] {
                done = false;
                break;
            }
            offset[d] = -search_radius[d];
        }
        if done {
            break;
        }
    }

    Ok((u_best, m_best))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pyramid::ImagePair;
    use greedyreg_core::Geometry;

    #[test]
    fn test_brute_finds_known_offset() {
        // Single bright pixel at (10, 10) fixed, (12, 9) moving: the
        // displacement at the bright pixel must be (2, -1).
        let geom = Geometry::<2>::unit([32, 32]);
        let mut fixed = Image::<2>::new(geom.clone(), 1);
        fixed.set([10, 10], 0, 1.0);
        let mut moving = Image::<2>::new(geom.clone(), 1);
        moving.set([12, 9], 0, 1.0);

        let pair = ImagePair {
            fixed,
            moving,
            weight: 1.0,
        };
        let pyramid = Pyramid::build(&[pair], None, 1, Some(1e-4)).unwrap();
        let params = GreedyParams {
            metric: MetricKind::Ncc {
                radius: vec![1, 1],
            },
            ..Default::default()
        };
        let (u, m) = run_brute(&pyramid, &params, &[4, 4]).unwrap();
        let at = geom.offset([10, 10]);
        assert_eq!(u.vec(at), [2.0, -1.0]);
        assert!(m.get([10, 10], 0) > 0.5);
    }

    #[test]
    fn test_brute_rejects_ssd() {
        let geom = Geometry::<2>::unit([8, 8]);
        let pair = ImagePair {
            fixed: Image::<2>::new(geom.clone(), 1),
            moving: Image::<2>::new(geom, 1),
            weight: 1.0,
        };
        let pyramid = Pyramid::build(&[pair], None, 1, None).unwrap();
        let params = GreedyParams::default();
        let err = run_brute(&pyramid, &params, &[2, 2]).unwrap_err();
        assert!(matches!(err, GreedyError::Configuration(_)));
    }

    #[test]
    fn test_brute_rejects_bad_radius_dimension() {
        let geom = Geometry::<2>::unit([8, 8]);
        let pair = ImagePair {
            fixed: Image::<2>::new(geom.clone(), 1),
            moving: Image::<2>::new(geom, 1),
            weight: 1.0,
        };
        let pyramid = Pyramid::build(&[pair], None, 1, None).unwrap();
        let params = GreedyParams {
            metric: MetricKind::Ncc {
                radius: vec![1, 1],
            },
            ..Default::default()
        };
        let err = run_brute(&pyramid, &params, &[4]).unwrap_err();
        assert!(matches!(err, GreedyError::Configuration(_)));
    }
}
