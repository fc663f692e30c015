//! Windowed normalized cross-correlation with a box patch.
//!
//! Implemented with running sums so both the per-voxel cost and its exact
//! gradient are O(1) after separable box accumulations:
//!
//! 1. accumulate `{valid, F, M, F², M², F·M}` (validity-weighted) over the
//!    patch around every voxel,
//! 2. turn the sums into the per-voxel correlation and the coefficient maps
//!    `(α, β, γ)` of `∂ncc/∂M(x) = α·F(x) + β·M(x) + γ`,
//! 3. box-accumulate the coefficients and contract with `∇M` at each voxel.
//!
//! The per-voxel similarity is the squared correlation `C²/(V_F·V_M)`; the
//! reported objective is its negated sum so the solvers minimize.

use greedyreg_core::interpolation::{LinearSampler, Sampler};
use greedyreg_core::parallel;
use greedyreg_core::Field;
use rayon::prelude::*;

use crate::error::{GreedyError, Result};
use crate::pyramid::PyramidLevel;
use super::trait_::{Metric, MetricReport, MetricWorkspace};

const VARIANCE_FLOOR: f64 = 1e-10;

/// Patch NCC metric with a per-axis window radius.
pub struct PatchNcc<const D: usize> {
    radius: [usize; D],
}

impl<const D: usize> PatchNcc<D> {
    pub fn new(radius: [usize; D]) -> Self {
        Self { radius }
    }

    pub fn radius(&self) -> [usize; D] {
        self.radius
    }
}

impl<const D: usize> Metric<D> for PatchNcc<D> {
    fn name(&self) -> &'static str {
        "NCC"
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

        let n = reference.num_voxels();
        let size = reference.size();
        let strides = reference.strides();
        let ranges = parallel::chunk_ranges(n);
        let sampler = LinearSampler::new(&level.moving);
        let fixed_data = level.fixed.data();
        let u_data = u.data();

        // Pass 1: per-voxel terms, validity-weighted.
        let acc_comps = 1 + 5 * channels;
        {
            let acc = MetricWorkspace::accumulator(&mut ws.acc, &reference, acc_comps);
            let acc_slabs = parallel::split_frames_mut(acc.data_mut(), &ranges, acc_comps);
            let mask_slabs = parallel::split_frames_mut(ws.mask.data_mut(), &ranges, 1);
            ranges
                .par_iter()
                .zip(acc_slabs)
                .zip(mask_slabs)
                .for_each(|((range, acc_slab), mask_slab)| {
                    let mut mov = vec![0.0f32; channels];
                    for (local, voxel) in range.clone().enumerate() {
                        let index = reference.index_of(voxel);
                        let mut x = [0.0f64; D];
                        for d in 0..D {
                            x[d] = index[d] as f64 + u_data[voxel * D + d] as f64;
                        }
                        let frac = sampler.sample_masked(x, &mut mov) as f32;
                        mask_slab[local] = frac;

                        let fix = &fixed_data[voxel * channels..(voxel + 1) * channels];
                        let frame = &mut acc_slab[local * acc_comps..(local + 1) * acc_comps];
                        frame[0] = frac;
                        for k in 0..channels {
                            let f = fix[k];
                            let m = mov[k];
                            let base = 1 + 5 * k;
                            frame[base] = frac * f;
                            frame[base + 1] = frac * m;
                            frame[base + 2] = frac * f * f;
                            frame[base + 3] = frac * m * m;
                            frame[base + 4] = frac * f * m;
                        }
                    }
                });
        }

        // Pass 2: separable box accumulation of the term image.
        box_accumulate::<D>(
            ws.acc.as_mut().unwrap(),
            MetricWorkspace::accumulator(&mut ws.acc_tmp, &reference, acc_comps),
            size,
            strides,
            self.radius,
        );

        // Pass 3: correlation and coefficient maps from the window sums.
        let coeff_comps = 3 * channels;
        let per_channel = {
            let acc_data = ws.acc.as_ref().unwrap().data();
            let coeff = MetricWorkspace::accumulator(&mut ws.coeff, &reference, coeff_comps);
            let coeff_slabs = parallel::split_frames_mut(coeff.data_mut(), &ranges, coeff_comps);
            let metric_slabs =
                parallel::split_frames_mut(ws.metric_image.data_mut(), &ranges, 1);

            let partials: Vec<Vec<f64>> = ranges
                .par_iter()
                .zip(coeff_slabs)
                .zip(metric_slabs)
                .map(|((range, coeff_slab), metric_slab)| {
                    let mut local_sums = vec![0.0f64; channels];
                    for (local, voxel) in range.clone().enumerate() {
                        let sums = &acc_data[voxel * acc_comps..(voxel + 1) * acc_comps];
                        let count = sums[0] as f64;
                        let coeffs =
                            &mut coeff_slab[local * coeff_comps..(local + 1) * coeff_comps];
                        let mut m = 0.0f64;
                        if count > 1.0 {
                            for k in 0..channels {
                                let base = 1 + 5 * k;
                                let sf = sums[base] as f64;
                                let sm = sums[base + 1] as f64;
                                let sff = sums[base + 2] as f64;
                                let smm = sums[base + 3] as f64;
                                let sfm = sums[base + 4] as f64;

                                let cov = sfm - sf * sm / count;
                                let var_f = sff - sf * sf / count;
                                let var_m = smm - sm * sm / count;

                                if var_f > VARIANCE_FLOOR && var_m > VARIANCE_FLOOR {
                                    let ncc2 = cov * cov / (var_f * var_m);
                                    local_sums[k] -= weights[k] * ncc2;
                                    m += weights[k] * ncc2;
                                    if compute_grad {
                                        let alpha = 2.0 * cov / (var_f * var_m);
                                        let beta = -2.0 * ncc2 / var_m;
                                        let mu_f = sf / count;
                                        let mu_m = sm / count;
                                        let gamma = -alpha * mu_f - beta * mu_m;
                                        let w = weights[k];
                                        coeffs[3 * k] = (w * alpha) as f32;
                                        coeffs[3 * k + 1] = (w * beta) as f32;
                                        coeffs[3 * k + 2] = (w * gamma) as f32;
                                        continue;
                                    }
                                }
                                coeffs[3 * k] = 0.0;
                                coeffs[3 * k + 1] = 0.0;
                                coeffs[3 * k + 2] = 0.0;
                            }
                        } else {
                            coeffs.fill(0.0);
                        }
                        metric_slab[local] = m as f32;
                    }
                    local_sums
                })
                .collect();

            let reducer = parallel::VecSumReducer(channels);
            let mut folded = vec![0.0f64; channels];
            for p in partials {
                parallel::Reducer::combine(&reducer, &mut folded, p);
            }
            folded
        };

        if compute_grad {
            // Pass 4: box accumulation of the coefficients; a patch's
            // coefficients reach every voxel inside it.
            box_accumulate::<D>(
                ws.coeff.as_mut().unwrap(),
                MetricWorkspace::accumulator(&mut ws.coeff_tmp, &reference, coeff_comps),
                size,
                strides,
                self.radius,
            );

            // Pass 5: contract with the moving gradient at each voxel.
            let coeff_data = ws.coeff.as_ref().unwrap().data();
            let grad_slabs = parallel::split_frames_mut(ws.grad.data_mut(), &ranges, D);
            ranges
                .par_iter()
                .zip(grad_slabs)
                .for_each(|(range, grad_slab)| {
                    let mut mov = vec![0.0f32; channels];
                    let mut mov_grad = vec![[0.0f64; D]; channels];
                    let mut frac_grad = [0.0f64; D];
                    for (local, voxel) in range.clone().enumerate() {
                        let index = reference.index_of(voxel);
                        let mut x = [0.0f64; D];
                        for d in 0..D {
                            x[d] = index[d] as f64 + u_data[voxel * D + d] as f64;
                        }
                        let frac = sampler.sample_masked_with_gradient(
                            x,
                            &mut mov,
                            &mut mov_grad,
                            &mut frac_grad,
                        );
                        let fix = &fixed_data[voxel * channels..(voxel + 1) * channels];
                        let coeffs = &coeff_data[voxel * coeff_comps..(voxel + 1) * coeff_comps];

                        let frame = &mut grad_slab[local * D..(local + 1) * D];
                        frame.fill(0.0);
                        if frac == 0.0 {
                            continue;
                        }
                        for k in 0..channels {
                            let sum_alpha = coeffs[3 * k] as f64;
                            let sum_beta = coeffs[3 * k + 1] as f64;
                            let sum_gamma = coeffs[3 * k + 2] as f64;
                            let factor =
                                frac * (fix[k] as f64 * sum_alpha
                                    + mov[k] as f64 * sum_beta
                                    + sum_gamma);
                            for d in 0..D {
                                frame[d] += (factor * mov_grad[k][d]) as f32;
                            }
                        }
                    }
                });
        }

        Ok(MetricReport::from_channels(per_channel))
    }
}

/// Separable truncated box sums over a multi-component image: after all
/// passes, each voxel holds the sum of the input over the window
/// `[i − r, i + r]` per axis, clipped at the image faces.
fn box_accumulate<const D: usize>(
    image: &mut greedyreg_core::Image<D>,
    scratch: &mut greedyreg_core::Image<D>,
    size: [usize; D],
    strides: [usize; D],
    radius: [usize; D],
) {
    let comps = image.channels();
    let n: usize = size.iter().product();
    let chunk = n.div_ceil(rayon::current_num_threads().max(1)).max(1);

    let mut src_is_image = true;
    for axis in 0..D {
        if radius[axis] == 0 {
            continue;
        }
        let (src, dst): (&[f32], &mut [f32]) = if src_is_image {
            (image.data(), scratch.data_mut())
        } else {
            (scratch.data(), image.data_mut())
        };
        let r = radius[axis] as isize;
        let axis_len = size[axis] as isize;
        let axis_stride = strides[axis];
        dst.par_chunks_mut(chunk * comps)
            .enumerate()
            .for_each(|(c, slab)| {
                let first = c * chunk;
                for (local, frame) in slab.chunks_exact_mut(comps).enumerate() {
                    let voxel = first + local;
                    let coord = ((voxel / axis_stride) % size[axis]) as isize;
                    let lo = (-r).max(-coord);
                    let hi = r.min(axis_len - 1 - coord);
                    for (comp, o) in frame.iter_mut().enumerate() {
                        let mut acc = 0.0f64;
                        for t in lo..=hi {
                            let off = (voxel as isize + t * axis_stride as isize) as usize;
                            acc += src[off * comps + comp] as f64;
                        }
                        *o = acc as f32;
                    }
                }
            });
        src_is_image = !src_is_image;
    }
    if !src_is_image {
        // Result landed in the scratch buffer.
        image.swap_data(scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pyramid::{ImagePair, Pyramid};
    use approx::assert_relative_eq;
    use greedyreg_core::{Geometry, Image};

    fn textured(size: usize, scale: f32, offset: f32) -> Image<2> {
        let geom = Geometry::<2>::unit([size, size]);
        let mut img = Image::<2>::new(geom, 1);
        for y in 0..size {
            for x in 0..size {
                let v = (x as f32 * 0.7).sin() + (y as f32 * 0.45).cos()
                    + 0.2 * ((x * 31 + y * 17) % 13) as f32 / 13.0;
                img.set([x, y], 0, scale * v + offset);
            }
        }
        img
    }

    #[test]
    fn test_ncc_invariant_to_affine_intensity() {
        let fixed = textured(20, 1.0, 0.0);
        let moving = textured(20, 2.0, 5.0);
        let pair = ImagePair {
            fixed,
            moving,
            weight: 1.0,
        };
        let pyramid = Pyramid::build(&[pair], None, 1, None).unwrap();
        let geom = pyramid.reference_space(0).clone();
        let u = Field::<2>::new(geom.clone());
        let mut ws = MetricWorkspace::new(&geom);
        let metric = PatchNcc::new([2, 2]);
        metric
            .dense(pyramid.level(0), pyramid.channel_weights(), &u, &mut ws, false)
            .unwrap();
        // Identical structure under an affine intensity map: correlation 1
        // at every interior voxel, up to f32 cancellation in the window
        // sums.
        let v = ws.metric_image.get([10, 10], 0);
        assert_relative_eq!(v, 1.0, epsilon = 0.05);
    }

    #[test]
    fn test_ncc_gradient_matches_numeric() {
        let fixed = textured(18, 1.0, 0.0);
        let moving = textured(18, 1.3, -0.4);
        let pair = ImagePair {
            fixed,
            moving,
            weight: 1.0,
        };
        let pyramid = Pyramid::build(&[pair], None, 1, None).unwrap();
        let geom = pyramid.reference_space(0).clone();
        let metric = PatchNcc::new([2, 2]);
        let mut ws = MetricWorkspace::new(&geom);

        let mut u = Field::<2>::new(geom.clone());
        u.fill_vec([0.3, -0.2]);
        metric
            .dense(pyramid.level(0), pyramid.channel_weights(), &u, &mut ws, true)
            .unwrap();
        let analytic_field = ws.grad.clone();

        // The window sums live in f32 buffers, so the probe step must stay
        // well above the rounding noise of the totals.
        let eps = 5e-3;
        for &voxel in &[9 * 18 + 8, 8 * 18 + 10] {
            for d in 0..2 {
                let mut probe = |delta: f64| -> f64 {
                    let mut v = u.clone();
                    let mut vec = v.vec(voxel);
                    vec[d] += delta as f32;
                    v.set_vec(voxel, vec);
                    metric
                        .dense(pyramid.level(0), pyramid.channel_weights(), &v, &mut ws, false)
                        .unwrap()
                        .total
                };
                let f1 = probe(-2.0 * eps);
                let f2 = probe(-eps);
                let f3 = probe(eps);
                let f4 = probe(2.0 * eps);
                let numeric = (f1 - 8.0 * f2 + 8.0 * f3 - f4) / (12.0 * eps);
                let analytic = -(analytic_field.vec(voxel)[d] as f64);
                assert_relative_eq!(analytic, numeric, epsilon = 0.02, max_relative = 0.02);
            }
        }
    }

    #[test]
    fn test_box_accumulate_counts_window() {
        let geom = Geometry::<2>::unit([5, 5]);
        let mut img = Image::<2>::new(geom.clone(), 1);
        img.fill(1.0);
        let mut tmp = Image::<2>::new(geom.clone(), 1);
        box_accumulate::<2>(
            &mut img,
            &mut tmp,
            geom.size(),
            geom.strides(),
            [1, 1],
        );
        // Interior: 3x3 window; corner: 2x2.
        assert_eq!(img.get([2, 2], 0), 9.0);
        assert_eq!(img.get([0, 0], 0), 4.0);
    }
}
