//! Affine registration: parameterization, RAS mapping and the solver loop.
//!
//! A voxel-space linear transform maps fixed voxel indices to moving voxel
//! coordinates, `y = M·i + b`. Serialized matrices are homogeneous
//! `(D+1)×(D+1)` in physical RAS convention; the conversions between the two
//! anchor the transform to a level's fixed and moving geometries.

use nalgebra::{DMatrix, SMatrix, SVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use greedyreg_core::parallel::{self, VecSumReducer};
use greedyreg_core::{Field, Geometry};

use crate::error::{GreedyError, Result};
use crate::metric::{make_metric, Metric, MetricWorkspace};
use crate::optimizer::{Lbfgs, Minimizer, OptimizerSettings, Powell, Problem};
use crate::params::{GreedyParams, MetricKind};
use crate::pyramid::{Pyramid, PyramidLevel};

/// Seed for the identity-jitter initialization.
const JITTER_SEED: u64 = 12345;
/// Jitter half-range in scaled parameter space.
const JITTER_RANGE: f64 = 0.4;
/// Objective scaling for similarity metrics (NCC, MI) so the default
/// optimizer tolerances behave sensibly.
const SIMILARITY_SCALE: f64 = 10000.0;

/// Linear transform in voxel coordinates: `y = M·i + b`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearTransform<const D: usize> {
    pub matrix: SMatrix<f64, D, D>,
    pub offset: SVector<f64, D>,
}

impl<const D: usize> LinearTransform<D> {
    pub fn identity() -> Self {
        Self {
            matrix: SMatrix::identity(),
            offset: SVector::zeros(),
        }
    }

    /// Apply to a continuous voxel index.
    pub fn apply(&self, index: [f64; D]) -> [f64; D] {
        let x = SVector::<f64, D>::from(index);
        let y = self.matrix * x + self.offset;
        let mut out = [0.0; D];
        for d in 0..D {
            out[d] = y[d];
        }
        out
    }

    /// Flatten to the parameter layout `(offset_i, row_i of M)` per axis.
    pub fn flatten(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(D * (D + 1));
        for i in 0..D {
            flat.push(self.offset[i]);
            for j in 0..D {
                flat.push(self.matrix[(i, j)]);
            }
        }
        flat
    }

    /// Rebuild from the flat parameter layout.
    pub fn unflatten(flat: &[f64]) -> Self {
        assert_eq!(flat.len(), D * (D + 1));
        let mut t = Self::identity();
        let mut pos = 0;
        for i in 0..D {
            t.offset[i] = flat[pos];
            pos += 1;
            for j in 0..D {
                t.matrix[(i, j)] = flat[pos];
                pos += 1;
            }
        }
        t
    }
}

/// Parameter scaling built from the reference size: a unit change in any
/// scaled parameter displaces a domain-corner point on the order of one
/// voxel, making the optimizer tolerances uniform across parameters.
pub fn parameter_scaling<const D: usize>(reference: &Geometry<D>) -> Vec<f64> {
    let size = reference.size();
    let mut t = LinearTransform::<D>::identity();
    for i in 0..D {
        t.offset[i] = 1.0;
        for j in 0..D {
            t.matrix[(i, j)] = size[j] as f64;
        }
    }
    t.flatten()
}

/// Expand a linear transform into the equivalent displacement field
/// `u(i) = M·i + b − i`.
pub fn transform_to_field<const D: usize>(t: &LinearTransform<D>, field: &mut Field<D>) {
    let geom = field.geometry().clone();
    let n = geom.num_voxels();
    for voxel in 0..n {
        let index = geom.index_of(voxel);
        let mut x = [0.0f64; D];
        for d in 0..D {
            x[d] = index[d] as f64;
        }
        let y = t.apply(x);
        let mut u = [0.0f32; D];
        for d in 0..D {
            u[d] = (y[d] - x[d]) as f32;
        }
        field.set_vec(voxel, u);
    }
}

/// Map a voxel-space transform to a homogeneous RAS matrix:
/// `Q = T_mov·M·T_fix⁻¹`, `p = T_mov·b + s_mov − Q·s_fix` with `(T, s)` the
/// voxel-to-RAS transforms of the two geometries.
pub fn map_affine_to_ras<const D: usize>(
    fixed: &Geometry<D>,
    moving: &Geometry<D>,
    t: &LinearTransform<D>,
) -> Result<DMatrix<f64>> {
    let (t_fix, s_fix) = fixed.voxel_to_ras();
    let (t_mov, s_mov) = moving.voxel_to_ras();
    let t_fix_inv = t_fix
        .try_inverse()
        .ok_or_else(|| GreedyError::numerical("fixed voxel-to-RAS transform is singular"))?;

    let q = t_mov * t.matrix * t_fix_inv;
    let p = t_mov * t.offset + s_mov - q * s_fix;

    let mut out = DMatrix::<f64>::identity(D + 1, D + 1);
    for i in 0..D {
        out[(i, D)] = p[i];
        for j in 0..D {
            out[(i, j)] = q[(i, j)];
        }
    }
    Ok(out)
}

/// Inverse of [`map_affine_to_ras`]: anchor a RAS matrix to a level's
/// geometries, producing the voxel-space transform.
pub fn map_ras_to_affine<const D: usize>(
    fixed: &Geometry<D>,
    moving: &Geometry<D>,
    ras: &DMatrix<f64>,
) -> Result<LinearTransform<D>> {
    if ras.nrows() != D + 1 || ras.ncols() != D + 1 {
        return Err(GreedyError::input(format!(
            "expected a {}x{} matrix, got {}x{}",
            D + 1,
            D + 1,
            ras.nrows(),
            ras.ncols()
        )));
    }
    let (t_fix, s_fix) = fixed.voxel_to_ras();
    let (t_mov, s_mov) = moving.voxel_to_ras();
    let t_mov_inv = t_mov
        .try_inverse()
        .ok_or_else(|| GreedyError::numerical("moving voxel-to-RAS transform is singular"))?;

    let mut q = SMatrix::<f64, D, D>::zeros();
    let mut p = SVector::<f64, D>::zeros();
    for i in 0..D {
        p[i] = ras[(i, D)];
        for j in 0..D {
            q[(i, j)] = ras[(i, j)];
        }
    }

    Ok(LinearTransform {
        matrix: t_mov_inv * q * t_fix,
        offset: t_mov_inv * (p - s_mov + q * s_fix),
    })
}

/// Scalar cost function over the scaled affine parameters.
pub struct AffineCost<'a, const D: usize> {
    metric: &'a dyn Metric<D>,
    level: &'a PyramidLevel<D>,
    weights: &'a [f64],
    reference: Geometry<D>,
    scaling: Vec<f64>,
    similarity_scale: f64,
    ws: MetricWorkspace<D>,
    phi: Field<D>,
}

impl<'a, const D: usize> AffineCost<'a, D> {
    pub fn new(
        metric: &'a dyn Metric<D>,
        level: &'a PyramidLevel<D>,
        weights: &'a [f64],
        metric_kind: &MetricKind,
    ) -> Self {
        let reference = level.fixed.geometry().clone();
        let scaling = parameter_scaling(&reference);
        let similarity_scale = match metric_kind {
            MetricKind::Ssd => 1.0,
            _ => SIMILARITY_SCALE,
        };
        Self {
            metric,
            level,
            weights,
            scaling,
            similarity_scale,
            ws: MetricWorkspace::new(&reference),
            phi: Field::new(reference.clone()),
            reference,
        }
    }

    /// Scaled parameter vector of a transform.
    pub fn coefficients(&self, t: &LinearTransform<D>) -> Vec<f64> {
        t.flatten()
            .iter()
            .zip(&self.scaling)
            .map(|(v, s)| v * s)
            .collect()
    }

    /// Transform of a scaled parameter vector.
    pub fn transform(&self, x: &[f64]) -> LinearTransform<D> {
        let unscaled: Vec<f64> = x.iter().zip(&self.scaling).map(|(v, s)| v / s).collect();
        LinearTransform::unflatten(&unscaled)
    }
}

impl<const D: usize> Problem for AffineCost<'_, D> {
    fn dimension(&self) -> usize {
        D * (D + 1)
    }

    fn evaluate(&mut self, x: &[f64], grad: Option<&mut [f64]>) -> f64 {
        let t = self.transform(x);
        transform_to_field(&t, &mut self.phi);

        let compute_grad = grad.is_some();
        let report = self
            .metric
            .dense(self.level, self.weights, &self.phi, &mut self.ws, compute_grad)
            .expect("metric evaluation failed inside affine cost function");
        let f = report.total * self.similarity_scale;

        if let Some(out) = grad {
            if let Some(mask) = &self.level.mask {
                self.ws.grad.weight_by(mask);
            }
            // Reduce the dense gradient to the D·(D+1) parameter gradient:
            // ∂f/∂u(i) summed against [1; i] per axis. The workspace holds
            // the negative objective gradient, hence the sign flip.
            let reference = &self.reference;
            let grad_data = self.ws.grad.data();
            let n = reference.num_voxels();
            let reducer = VecSumReducer(D * (D + 1));
            let reduced = parallel::reduce_voxels(n, &reducer, |range| {
                let mut partial = vec![0.0f64; D * (D + 1)];
                for voxel in range {
                    let index = reference.index_of(voxel);
                    for i in 0..D {
                        let df = -(grad_data[voxel * D + i] as f64);
                        let base = i * (D + 1);
                        partial[base] += df;
                        for j in 0..D {
                            partial[base + 1 + j] += df * index[j] as f64;
                        }
                    }
                }
                partial
            });
            for ((o, r), s) in out.iter_mut().zip(&reduced).zip(&self.scaling) {
                *o = r * self.similarity_scale / s;
            }
        }

        f
    }
}

/// Run the affine solver over the pyramid, returning the physical RAS
/// matrix of the final transform.
pub fn run_affine<const D: usize>(
    pyramid: &Pyramid<D>,
    params: &GreedyParams,
    initial: Option<&DMatrix<f64>>,
) -> Result<DMatrix<f64>> {
    let metric = make_metric::<D>(&params.metric)?;
    let nlevels = pyramid.num_levels();
    let mut ras = DMatrix::<f64>::identity(D + 1, D + 1);
    let mut optimized = false;

    for level in 0..nlevels {
        let level_data = pyramid.level(level);
        let fixed_geom = pyramid.reference_space(level);
        let moving_geom = pyramid.moving_reference_space(level);
        let mut cost =
            AffineCost::new(metric.as_ref(), level_data, pyramid.channel_weights(), &params.metric);

        let t_level = if level == 0 {
            match initial {
                Some(q) => map_ras_to_affine(fixed_geom, moving_geom, q)?,
                None => {
                    // Identity with deterministic jitter in scaled space.
                    let mut x = cost.coefficients(&LinearTransform::identity());
                    let mut rng = StdRng::seed_from_u64(JITTER_SEED);
                    for v in x.iter_mut() {
                        *v += rng.gen_range(-JITTER_RANGE..JITTER_RANGE);
                    }
                    cost.transform(&x)
                }
            }
        } else {
            // Re-anchor the previous level's RAS matrix to the finer grid.
            map_ras_to_affine(fixed_geom, moving_geom, &ras)?
        };

        let mut x = cost.coefficients(&t_level);

        if params.debug_deriv {
            check_derivative(&mut cost, &x, params.deriv_epsilon);
        }

        let iterations = params.iter_per_level[level];
        if iterations > 0 {
            let settings = OptimizerSettings::default().with_max_evaluations(iterations);
            let outcome = if params.use_powell {
                Powell::new(settings).minimize(&mut cost, &mut x)
            } else {
                Lbfgs::new(settings).minimize(&mut cost, &mut x)
            };
            info!(
                level,
                value = outcome.value,
                evaluations = outcome.evaluations,
                converged = outcome.converged,
                "affine level finished"
            );
            let t_final = cost.transform(&x);
            ras = map_affine_to_ras(fixed_geom, moving_geom, &t_final)?;
            optimized = true;
        } else if level == 0 {
            ras = map_affine_to_ras(fixed_geom, moving_geom, &t_level)?;
        }

        info!(level, "final RAS transform:\n{}", format_matrix(&ras));
    }

    if !optimized {
        info!("no iterations requested; returning the initial transform");
    }
    Ok(ras)
}

/// Compare the analytic parameter gradient against a four-point central
/// difference at `x`. Logged, not asserted; this is a developer aid.
pub fn check_derivative<const D: usize>(cost: &mut AffineCost<'_, D>, x: &[f64], eps: f64) {
    let n = x.len();
    let mut analytic = vec![0.0f64; n];
    let f0 = cost.evaluate(x, Some(&mut analytic));

    let mut numeric = vec![0.0f64; n];
    for i in 0..n {
        let mut probe = |delta: f64| -> f64 {
            let mut xp = x.to_vec();
            xp[i] += delta;
            cost.evaluate(&xp, None)
        };
        let f1 = probe(-2.0 * eps);
        let f2 = probe(-eps);
        let f3 = probe(eps);
        let f4 = probe(2.0 * eps);
        numeric[i] = (f1 - 8.0 * f2 + 8.0 * f3 - f4) / (12.0 * eps);
    }

    info!(f = f0, "derivative check");
    info!("ANL gradient: {:?}", analytic);
    info!("NUM gradient: {:?}", numeric);
}

fn format_matrix(m: &DMatrix<f64>) -> String {
    let mut out = String::new();
    for i in 0..m.nrows() {
        for j in 0..m.ncols() {
            out.push_str(&format!("{:12.6} ", m[(i, j)]));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use greedyreg_core::{Direction, Point, Spacing};

    #[test]
    fn test_flatten_roundtrip() {
        let mut t = LinearTransform::<2>::identity();
        t.matrix[(0, 1)] = 0.25;
        t.offset[1] = -3.0;
        let flat = t.flatten();
        assert_eq!(flat.len(), 6);
        assert_eq!(flat[0], 0.0); // offset_0
        assert_eq!(flat[1], 1.0); // M(0,0)
        assert_eq!(flat[2], 0.25); // M(0,1)
        assert_eq!(flat[3], -3.0); // offset_1
        let back = LinearTransform::<2>::unflatten(&flat);
        assert_eq!(back, t);
    }

    #[test]
    fn test_ras_voxel_roundtrip() {
        let fixed = Geometry::<3>::new(
            [32, 28, 20],
            Point::new([4.0, -7.0, 2.5]),
            Spacing::new([1.5, 1.5, 2.0]),
            Direction::identity(),
        );
        let moving = Geometry::<3>::new(
            [30, 30, 22],
            Point::new([-1.0, 3.0, 0.0]),
            Spacing::new([1.0, 1.2, 1.8]),
            Direction::identity(),
        );
        let mut t = LinearTransform::<3>::identity();
        t.matrix[(0, 0)] = 1.1;
        t.matrix[(0, 1)] = 0.05;
        t.matrix[(2, 1)] = -0.08;
        t.offset = SVector::from([3.0, -2.0, 0.7]);

        let ras = map_affine_to_ras(&fixed, &moving, &t).unwrap();
        let back = map_ras_to_affine(&fixed, &moving, &ras).unwrap();

        for i in 0..3 {
            assert!((back.offset[i] - t.offset[i]).abs() < 1e-12);
            for j in 0..3 {
                assert!((back.matrix[(i, j)] - t.matrix[(i, j)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_parameter_scaling_layout() {
        let geom = Geometry::<2>::unit([40, 30]);
        let s = parameter_scaling(&geom);
        assert_eq!(s, vec![1.0, 40.0, 30.0, 1.0, 40.0, 30.0]);
    }

    #[test]
    fn test_transform_to_field_identity_is_zero() {
        let geom = Geometry::<2>::unit([5, 5]);
        let mut field = Field::<2>::new(geom);
        transform_to_field(&LinearTransform::identity(), &mut field);
        assert_eq!(field.max_norm(), 0.0);
    }

    #[test]
    fn test_transform_to_field_translation() {
        let geom = Geometry::<2>::unit([5, 5]);
        let mut field = Field::<2>::new(geom);
        let mut t = LinearTransform::<2>::identity();
        t.offset = SVector::from([2.0, -1.0]);
        transform_to_field(&t, &mut field);
        for i in 0..25 {
            assert_eq!(field.vec(i), [2.0, -1.0]);
        }
    }
}
