//! Powell's direction-set method with golden-section line minimization.
//!
//! Derivative-free alternative to L-BFGS; the cost function is only ever
//! evaluated, never differentiated.

use super::trait_::{MinimizeOutcome, Minimizer, OptimizerSettings, Problem};

const GOLDEN: f64 = 1.618033988749895;
const GOLDEN_SECTION: f64 = 0.381966011250105;
const TINY: f64 = 1e-25;

/// Powell direction-set minimizer.
pub struct Powell {
    pub settings: OptimizerSettings,
}

impl Powell {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self { settings }
    }

    /// Minimize along `x + t·direction`, updating `x` and returning the new
    /// value.
    fn line_minimize(
        &self,
        problem: &mut dyn Problem,
        x: &mut [f64],
        direction: &[f64],
        f0: f64,
        evaluations: &mut usize,
    ) -> f64 {
        let budget = self.settings.max_evaluations;
        let mut eval_at = |t: f64, evals: &mut usize| -> f64 {
            let probe: Vec<f64> = x
                .iter()
                .zip(direction)
                .map(|(&xi, &di)| xi + t * di)
                .collect();
            *evals += 1;
            problem.evaluate(&probe, None)
        };

        // Bracket a minimum starting from t = 0.
        let (mut ta, mut fa) = (0.0, f0);
        let (mut tb, mut fb) = (1.0, eval_at(1.0, evaluations));
        if fb > fa {
            std::mem::swap(&mut ta, &mut tb);
            std::mem::swap(&mut fa, &mut fb);
        }
        let mut tc = tb + GOLDEN * (tb - ta);
        let mut fc = eval_at(tc, evaluations);
        while fc < fb && *evaluations < budget {
            ta = tb;
            fa = fb;
            tb = tc;
            fb = fc;
            tc = tb + GOLDEN * (tb - ta);
            fc = eval_at(tc, evaluations);
        }
        let _ = fa;

        // Golden-section refinement inside [ta, tc].
        let (mut lo, mut hi) = if ta < tc { (ta, tc) } else { (tc, ta) };
        let mut t1 = lo + GOLDEN_SECTION * (hi - lo);
        let mut t2 = hi - GOLDEN_SECTION * (hi - lo);
        let mut f1 = eval_at(t1, evaluations);
        let mut f2 = eval_at(t2, evaluations);
        while (hi - lo).abs() > self.settings.x_tolerance * (t1.abs() + t2.abs() + 1.0)
            && *evaluations < budget
        {
            if f1 < f2 {
                hi = t2;
                t2 = t1;
                f2 = f1;
                t1 = lo + GOLDEN_SECTION * (hi - lo);
                f1 = eval_at(t1, evaluations);
            } else {
                lo = t1;
                t1 = t2;
                f1 = f2;
                t2 = hi - GOLDEN_SECTION * (hi - lo);
                f2 = eval_at(t2, evaluations);
            }
        }

        let (t_best, f_best) = if f1 < f2 { (t1, f1) } else { (t2, f2) };
        if f_best < f0 {
            for (xi, &di) in x.iter_mut().zip(direction) {
                *xi += t_best * di;
            }
            f_best
        } else {
            f0
        }
    }
}

impl Minimizer for Powell {
    fn minimize(&self, problem: &mut dyn Problem, x: &mut [f64]) -> MinimizeOutcome {
        let n = problem.dimension();
        assert_eq!(x.len(), n);
        let budget = self.settings.max_evaluations.max(1);

        let mut directions: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                let mut d = vec![0.0; n];
                d[i] = 1.0;
                d
            })
            .collect();

        let mut f = problem.evaluate(x, None);
        let mut evaluations = 1usize;
        let mut converged = false;

        while evaluations < budget {
            let f_start = f;
            let x_start = x.to_vec();
            let mut biggest_drop = 0.0f64;
            let mut biggest_index = 0usize;

            for (i, direction) in directions.iter().enumerate() {
                let before = f;
                f = self.line_minimize(problem, x, direction, f, &mut evaluations);
                if before - f > biggest_drop {
                    biggest_drop = before - f;
                    biggest_index = i;
                }
                if evaluations >= budget {
                    break;
                }
            }

            if 2.0 * (f_start - f)
                <= self.settings.f_tolerance * (f_start.abs() + f.abs()) + TINY
            {
                converged = true;
                break;
            }
            if evaluations >= budget {
                break;
            }

            // Powell's criterion for replacing the direction of largest
            // decrease with the average step.
            let extrapolated: Vec<f64> = x
                .iter()
                .zip(&x_start)
                .map(|(&a, &b)| 2.0 * a - b)
                .collect();
            let f_extrapolated = problem.evaluate(&extrapolated, None);
            evaluations += 1;

            if f_extrapolated < f_start {
                let t = 2.0 * (f_start - 2.0 * f + f_extrapolated)
                    * (f_start - f - biggest_drop).powi(2)
                    - biggest_drop * (f_start - f_extrapolated).powi(2);
                if t < 0.0 {
                    let new_direction: Vec<f64> = x
                        .iter()
                        .zip(&x_start)
                        .map(|(&a, &b)| a - b)
                        .collect();
                    f = self.line_minimize(problem, x, &new_direction, f, &mut evaluations);
                    directions[biggest_index] = new_direction;
                }
            }
        }

        MinimizeOutcome {
            value: f,
            evaluations,
            converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic;

    impl Problem for Quadratic {
        fn dimension(&self) -> usize {
            2
        }

        fn evaluate(&mut self, x: &[f64], _grad: Option<&mut [f64]>) -> f64 {
            // Coupled quadratic so the direction-set update matters.
            (x[0] - 2.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2) + 0.5 * (x[0] - 2.0) * (x[1] + 1.0)
        }
    }

    #[test]
    fn test_powell_quadratic() {
        let mut x = vec![10.0, -10.0];
        let settings = OptimizerSettings {
            max_evaluations: 500,
            ..Default::default()
        };
        let outcome = Powell::new(settings).minimize(&mut Quadratic, &mut x);
        assert!(outcome.value < 1e-5, "value = {}", outcome.value);
        assert!((x[0] - 2.0).abs() < 1e-2);
        assert!((x[1] + 1.0).abs() < 1e-2);
    }
}
