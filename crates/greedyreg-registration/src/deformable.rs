//! Greedy deformable registration.
//!
//! Per level, the fixed-point loop: evaluate the metric gradient, weight by
//! the gradient mask, smooth (pre), apply the step-size policy, compose the
//! running field with the update, smooth (post). Stepping to a finer level
//! resamples the field and doubles its components.

use nalgebra::DMatrix;
use tracing::{info, warn};

use greedyreg_core::filter::{compose, jacobian_determinant, resample_field_identity, GaussianFilter};
use greedyreg_core::{Field, Image};

use crate::affine::{map_ras_to_affine, transform_to_field};
use crate::error::Result;
use crate::metric::{make_metric, MetricWorkspace};
use crate::params::GreedyParams;
use crate::pyramid::Pyramid;

/// Fixed-point iterations per inversion attempt.
const INVERSE_ITERATIONS: usize = 20;
/// Residual threshold (voxels, infinity norm) for the inverse warp.
const INVERSE_TOLERANCE: f64 = 1e-4;
/// Iterations of the square-root refinement.
const SQRT_ITERATIONS: usize = 20;

/// Observer for intermediate fields (`gradient`, `optflow`, `update`),
/// called every `frequency` iterations.
pub struct DumpOptions<'a, const D: usize> {
    pub frequency: usize,
    pub sink: &'a mut dyn FnMut(&str, usize, usize, &Field<D>),
}

/// Run the greedy solver over the pyramid and return the forward warp in
/// voxel units of the finest level.
pub fn run_deformable<const D: usize>(
    pyramid: &Pyramid<D>,
    params: &GreedyParams,
    initial_affine: Option<&DMatrix<f64>>,
    mut dump: Option<DumpOptions<'_, D>>,
) -> Result<Field<D>> {
    let metric = make_metric::<D>(&params.metric)?;
    let nlevels = pyramid.num_levels();
    let weights = pyramid.channel_weights();
    let mut u_level: Option<Field<D>> = None;

    for level in 0..nlevels {
        let refspace = pyramid.reference_space(level).clone();
        let level_data = pyramid.level(level);
        let sigma_pre = pyramid.sigma_in_voxel_units(level, &params.sigma_pre);
        let sigma_post = pyramid.sigma_in_voxel_units(level, &params.sigma_post);
        info!(
            level = level + 1,
            nlevels,
            ?sigma_pre,
            ?sigma_post,
            "starting level"
        );

        let mut uk = Field::<D>::new(refspace.clone());
        let mut uk1 = Field::<D>::new(refspace.clone());
        let mut vtmp = Field::<D>::new(refspace.clone());
        let mut itmp = Image::<D>::new(refspace.clone(), 1);
        let mut ws = MetricWorkspace::new(&refspace);

        // Initialize from the previous level, the initial affine, or zero.
        if let Some(prev) = &u_level {
            resample_field_identity(prev, &mut uk);
            uk.scale_in_place(2.0);
        } else if let Some(q) = initial_affine {
            let t = map_ras_to_affine(
                &refspace,
                pyramid.moving_reference_space(level),
                q,
            )?;
            transform_to_field(&t, &mut uk);
        }

        let pre_filter = GaussianFilter::new(sigma_pre);
        let post_filter = GaussianFilter::new(sigma_post);

        for iter in 0..params.iter_per_level[level] {
            let report = metric.dense(level_data, weights, &uk, &mut ws, true)?;
            let per_pair = pyramid.fold_channels_to_pairs(&report.per_channel);
            info!(
                level,
                iter,
                total = report.total,
                per_pair = ?per_pair,
                "iteration"
            );

            if let Some(mask) = &level_data.mask {
                ws.grad.weight_by(mask);
            }
            if let Some(d) = dump.as_mut() {
                if iter % d.frequency.max(1) == 0 {
                    (d.sink)("gradient", level, iter, &ws.grad);
                }
            }

            // Smooth the gradient and apply the step policy.
            pre_filter.apply_field(&ws.grad, &mut uk1, &mut vtmp);
            uk1.apply_scaling(params.time_step_mode, params.epsilon);
            if let Some(d) = dump.as_mut() {
                if iter % d.frequency.max(1) == 0 {
                    (d.sink)("optflow", level, iter, &uk1);
                }
            }

            // u ← (u ∘ g̃) + g̃, then fluid-like regularization.
            compose(&uk, &uk1, &mut vtmp);
            if let Some(d) = dump.as_mut() {
                if iter % d.frequency.max(1) == 0 {
                    (d.sink)("update", level, iter, &vtmp);
                }
            }
            post_filter.apply_field(&vtmp, &mut uk, &mut uk1);
        }

        jacobian_determinant(&uk, &mut itmp);
        let (jac_min, jac_max) = itmp.min_max();
        info!(level, jac_min, jac_max, "end of level, det(Jac) range");

        u_level = Some(uk);
    }

    // The pyramid guarantees at least one level.
    Ok(u_level.expect("pyramid has no levels"))
}

/// Compute the inverse warp by the fixed-point iteration `v ← −u(i + v(i))`.
///
/// When the iteration stalls, the forward field is replaced by an
/// approximate square root (up to `exponent` times) and the inverse of the
/// root is squared back at the end. Non-convergence produces a warning and
/// the best field found, never an error.
pub fn compute_inverse<const D: usize>(u: &Field<D>, exponent: usize) -> (Field<D>, bool) {
    let geom = u.geometry().clone();
    let mut base = u.clone();
    let mut v = Field::<D>::new(geom.clone());
    let mut tmp = Field::<D>::new(geom.clone());
    let mut converged = false;
    let mut roots_taken = 0usize;

    loop {
        v.clear();
        let mut residual = f64::INFINITY;
        for _ in 0..INVERSE_ITERATIONS {
            // tmp = (base ∘ v): the residual of the inversion.
            compose(&base, &v, &mut tmp);
            residual = tmp.max_norm();
            if residual < INVERSE_TOLERANCE {
                converged = true;
                break;
            }
            // v ← v − (base ∘ v) = −base(i + v(i))
            tmp.scale_in_place(-1.0);
            v.add_in_place(&tmp);
        }
        if converged || roots_taken >= exponent {
            if !converged {
                warn!(
                    residual,
                    roots_taken, "inverse warp iteration did not converge; using best estimate"
                );
            }
            break;
        }

        // Stalled: halve the transform via an approximate square root
        // (w ∘ w ≈ base) and invert the root instead.
        let mut w = base.clone();
        w.scale_in_place(0.5);
        for _ in 0..SQRT_ITERATIONS {
            compose(&w, &w, &mut tmp);
            // w += 0.5 (base − w∘w)
            let w_data = w.data_mut();
            let base_data = base.data();
            let tmp_data = tmp.data();
            for i in 0..w_data.len() {
                w_data[i] += 0.5 * (base_data[i] - tmp_data[i]);
            }
        }
        base = w;
        roots_taken += 1;
        info!(roots_taken, "inverse warp stalled; taking square root");
    }

    // Square the inverse back up: (u^(1/2))⁻¹ ∘ (u^(1/2))⁻¹ = u⁻¹.
    for _ in 0..roots_taken {
        compose(&v.clone(), &v, &mut tmp);
        std::mem::swap(&mut v, &mut tmp);
    }

    (v, converged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::MetricKind;
    use crate::pyramid::ImagePair;
    use greedyreg_core::image::ScalingMode;
    use greedyreg_core::Geometry;

    fn gaussian_blob(size: usize, cx: f64, cy: f64) -> Image<2> {
        let geom = Geometry::<2>::unit([size, size]);
        let mut img = Image::<2>::new(geom, 1);
        let sigma2 = (size as f64 / 6.0).powi(2);
        for y in 0..size {
            for x in 0..size {
                let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                img.set([x, y], 0, (-r2 / (2.0 * sigma2)).exp() as f32);
            }
        }
        img
    }

    #[test]
    fn test_identical_inputs_stay_at_identity() {
        // S1: fixed == moving must keep the displacement at (numerically)
        // zero through the whole schedule.
        let img = gaussian_blob(64, 32.0, 32.0);
        let pair = ImagePair {
            fixed: img.clone(),
            moving: img,
            weight: 1.0,
        };
        let pyramid = Pyramid::build(&[pair], None, 2, None).unwrap();
        let params = GreedyParams {
            iter_per_level: vec![20, 20],
            metric: MetricKind::Ssd,
            time_step_mode: ScalingMode::ScaleDown,
            ..Default::default()
        };
        let warp = run_deformable(&pyramid, &params, None, None).unwrap();
        assert!(
            warp.max_norm() < 1e-3,
            "max displacement {} for identical inputs",
            warp.max_norm()
        );
    }

    #[test]
    fn test_deformable_recovers_small_shift() {
        let fixed = gaussian_blob(48, 24.0, 24.0);
        let moving = gaussian_blob(48, 26.0, 23.0);
        let pair = ImagePair {
            fixed: fixed.clone(),
            moving: moving.clone(),
            weight: 1.0,
        };
        let pyramid = Pyramid::build(&[pair], None, 2, None).unwrap();
        let params = GreedyParams {
            iter_per_level: vec![40, 40],
            epsilon: 0.5,
            ..Default::default()
        };
        let warp = run_deformable(&pyramid, &params, None, None).unwrap();

        // Warping the moving image back should now match the fixed image
        // much better than the unregistered pair does.
        let mut warped = Image::<2>::new(fixed.geometry().clone(), 1);
        greedyreg_core::filter::warp_image(
            &moving,
            &warp,
            &mut warped,
            greedyreg_core::filter::Interp::Linear,
            false,
        );
        let err_after: f64 = fixed
            .data()
            .iter()
            .zip(warped.data())
            .map(|(a, b)| ((a - b) as f64).powi(2))
            .sum();
        let err_before: f64 = fixed
            .data()
            .iter()
            .zip(moving.data())
            .map(|(a, b)| ((a - b) as f64).powi(2))
            .sum();
        assert!(
            err_after < 0.2 * err_before,
            "after {} vs before {}",
            err_after,
            err_before
        );
    }

    #[test]
    fn test_ncc_contrast_invariance() {
        // NCC is invariant to affine intensity maps: registering an image
        // against 2·itself + 5 must not move anything appreciably.
        let fixed = gaussian_blob(32, 16.0, 16.0);
        let mut moving = fixed.clone();
        for v in moving.data_mut().iter_mut() {
            *v = 2.0 * *v + 5.0;
        }
        let pair = ImagePair {
            fixed,
            moving,
            weight: 1.0,
        };
        let pyramid = Pyramid::build(&[pair], None, 2, None).unwrap();
        let params = GreedyParams {
            metric: MetricKind::Ncc {
                radius: vec![2, 2],
            },
            iter_per_level: vec![20, 20],
            time_step_mode: ScalingMode::ScaleDown,
            ..Default::default()
        };
        let warp = run_deformable(&pyramid, &params, None, None).unwrap();
        assert!(
            warp.max_norm() < 0.5,
            "max displacement {} under pure contrast change",
            warp.max_norm()
        );
    }

    #[test]
    fn test_inverse_of_small_translation() {
        // S6-style: a small constant field inverts to its negation.
        let geom = Geometry::<2>::unit([24, 24]);
        let mut u = Field::<2>::new(geom.clone());
        u.fill_vec([0.8, -0.5]);
        let (v, converged) = compute_inverse(&u, 2);
        assert!(converged);
        let mut residual = Field::<2>::new(geom);
        compose(&u, &v, &mut residual);
        assert!(
            residual.max_norm() < 0.05,
            "residual {}",
            residual.max_norm()
        );
    }
}
