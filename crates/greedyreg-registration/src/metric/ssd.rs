//! Sum-of-squared-differences metric.

use greedyreg_core::interpolation::{LinearSampler, Sampler};
use greedyreg_core::parallel;
use greedyreg_core::Field;
use rayon::prelude::*;

use crate::error::{GreedyError, Result};
use crate::pyramid::PyramidLevel;
use super::trait_::{Metric, MetricReport, MetricWorkspace};

/// SSD: `m(i) = Σ_k w_k · (F_k(i) − M_k(i + u(i)))²`.
///
/// Samples outside the moving image contribute zero metric and zero
/// gradient; the validity fraction is written to the workspace mask.
pub struct Ssd;

impl<const D: usize> Metric<D> for Ssd {
    fn name(&self) -> &'static str {
        "SSD"
    }

    fn dense(
        &self,
        level: &PyramidLevel<D>,
        weights: &[f64],
        u: &Field<D>,
        ws: &mut MetricWorkspace<D>,
        compute_grad: bool,
    ) -> Result<MetricReport> {
        let reference = level.fixed.geometry().clone();
        let channels = level.fixed.channels();
        if weights.len() != channels {
            return Err(GreedyError::dimension_mismatch(format!(
                "{} weights for {} channels",
                weights.len(),
                channels
            )));
        }
        if u.geometry().size() != reference.size() {
            return Err(GreedyError::GeometryMismatch {
                expected: reference.size().to_vec(),
                actual: u.geometry().size().to_vec(),
            });
        }

        let n = reference.num_voxels();
        let ranges = parallel::chunk_ranges(n);
        let sampler = LinearSampler::new(&level.moving);
        let fixed_data = level.fixed.data();
        let u_data = u.data();

        let grad_slabs = parallel::split_frames_mut(ws.grad.data_mut(), &ranges, D);
        let metric_slabs = parallel::split_frames_mut(ws.metric_image.data_mut(), &ranges, 1);
        let mask_slabs = parallel::split_frames_mut(ws.mask.data_mut(), &ranges, 1);

        let partials: Vec<Vec<f64>> = ranges
            .par_iter()
            .zip(grad_slabs)
            .zip(metric_slabs.into_par_iter().zip(mask_slabs))
            .map(|((range, grad_slab), (metric_slab, mask_slab))| {
                let mut per_channel = vec![0.0f64; channels];
                let mut mov = vec![0.0f32; channels];
                let mut mov_grad = vec![[0.0f64; D]; channels];
                let mut frac_grad = [0.0f64; D];

                for (local, voxel) in range.clone().enumerate() {
                    let index = reference.index_of(voxel);
                    let mut x = [0.0f64; D];
                    for d in 0..D {
                        x[d] = index[d] as f64 + u_data[voxel * D + d] as f64;
                    }

                    let frac = if compute_grad {
                        sampler.sample_masked_with_gradient(
                            x,
                            &mut mov,
                            &mut mov_grad,
                            &mut frac_grad,
                        )
                    } else {
                        sampler.sample_masked(x, &mut mov)
                    };

                    let fix = &fixed_data[voxel * channels..(voxel + 1) * channels];
                    let mut m = 0.0f64;
                    for k in 0..channels {
                        let diff = fix[k] as f64 - mov[k] as f64;
                        let contrib = frac * weights[k] * diff * diff;
                        per_channel[k] += contrib;
                        m += contrib;
                    }
                    metric_slab[local] = m as f32;
                    mask_slab[local] = frac as f32;

                    if compute_grad {
                        // m = frac·S with S the weighted squared residual:
                        // −∂m/∂u = frac·2Σw·diff·∇M − S·∇frac. The second
                        // term only fires at the moving-image border.
                        let residual: f64 = (0..channels)
                            .map(|k| {
                                let diff = fix[k] as f64 - mov[k] as f64;
                                weights[k] * diff * diff
                            })
                            .sum();
                        let frame = &mut grad_slab[local * D..(local + 1) * D];
                        for (d, g) in frame.iter_mut().enumerate() {
                            let mut acc = 0.0f64;
                            for k in 0..channels {
                                let diff = fix[k] as f64 - mov[k] as f64;
                                acc += 2.0 * weights[k] * diff * mov_grad[k][d];
                            }
                            *g = (frac * acc - residual * frac_grad[d]) as f32;
                        }
                    }
                }
                per_channel
            })
            .collect();

        let reducer = parallel::VecSumReducer(channels);
        let mut per_channel = vec![0.0f64; channels];
        for p in partials {
            parallel::Reducer::combine(&reducer, &mut per_channel, p);
        }

        Ok(MetricReport::from_channels(per_channel))
    }
}
