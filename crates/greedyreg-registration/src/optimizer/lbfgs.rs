//! Limited-memory BFGS with backtracking line search.

use std::collections::VecDeque;

use super::trait_::{dot, norm_inf, MinimizeOutcome, Minimizer, OptimizerSettings, Problem};

const ARMIJO_C1: f64 = 1e-4;
const MIN_STEP: f64 = 1e-20;
const CURVATURE_FLOOR: f64 = 1e-10;

/// Quasi-Newton minimizer with a bounded update history.
pub struct Lbfgs {
    pub settings: OptimizerSettings,
    pub history: usize,
}

impl Lbfgs {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self {
            settings,
            history: 10,
        }
    }
}

impl Minimizer for Lbfgs {
    fn minimize(&self, problem: &mut dyn Problem, x: &mut [f64]) -> MinimizeOutcome {
        let n = problem.dimension();
        assert_eq!(x.len(), n);
        let budget = self.settings.max_evaluations.max(1);

        let mut g = vec![0.0f64; n];
        let mut f = problem.evaluate(x, Some(&mut g));
        let mut evaluations = 1usize;

        let mut s_hist: VecDeque<Vec<f64>> = VecDeque::new();
        let mut y_hist: VecDeque<Vec<f64>> = VecDeque::new();
        let mut rho_hist: VecDeque<f64> = VecDeque::new();

        let mut converged = false;
        let mut first_step = true;

        while evaluations < budget {
            if norm_inf(&g) < self.settings.g_tolerance {
                converged = true;
                break;
            }

            // Two-loop recursion: r ≈ H⁻¹·g.
            let mut q = g.clone();
            let mut alphas = Vec::with_capacity(s_hist.len());
            for i in (0..s_hist.len()).rev() {
                let alpha = rho_hist[i] * dot(&s_hist[i], &q);
                for (qj, yj) in q.iter_mut().zip(&y_hist[i]) {
                    *qj -= alpha * yj;
                }
                alphas.push(alpha);
            }
            if let (Some(s), Some(y)) = (s_hist.back(), y_hist.back()) {
                let gamma = dot(s, y) / dot(y, y).max(CURVATURE_FLOOR);
                for qj in q.iter_mut() {
                    *qj *= gamma;
                }
            }
            for i in 0..s_hist.len() {
                let beta = rho_hist[i] * dot(&y_hist[i], &q);
                let alpha = alphas[s_hist.len() - 1 - i];
                for (qj, sj) in q.iter_mut().zip(&s_hist[i]) {
                    *qj += (alpha - beta) * sj;
                }
            }

            let mut direction: Vec<f64> = q.iter().map(|&v| -v).collect();
            let mut descent = dot(&g, &direction);
            if descent >= 0.0 {
                // History produced an ascent direction: fall back to
                // steepest descent.
                s_hist.clear();
                y_hist.clear();
                rho_hist.clear();
                direction = g.iter().map(|&v| -v).collect();
                descent = -dot(&g, &g);
            }

            // Backtracking Armijo line search.
            let mut step = if first_step {
                (1.0 / norm_inf(&g).max(1.0)).min(1.0)
            } else {
                1.0
            };
            let mut x_new = vec![0.0f64; n];
            let mut g_new = vec![0.0f64; n];
            let mut f_new;
            loop {
                for ((xn, &xi), &di) in x_new.iter_mut().zip(x.iter()).zip(&direction) {
                    *xn = xi + step * di;
                }
                f_new = problem.evaluate(&x_new, Some(&mut g_new));
                evaluations += 1;
                if f_new <= f + ARMIJO_C1 * step * descent {
                    break;
                }
                step *= 0.5;
                if step < MIN_STEP || evaluations >= budget {
                    break;
                }
            }
            if f_new > f {
                // No decrease within the budget.
                break;
            }

            // Curvature-guarded history update.
            let s: Vec<f64> = x_new.iter().zip(x.iter()).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = g_new.iter().zip(g.iter()).map(|(a, b)| a - b).collect();
            let ys = dot(&y, &s);
            if ys > CURVATURE_FLOOR {
                if s_hist.len() >= self.history {
                    s_hist.pop_front();
                    y_hist.pop_front();
                    rho_hist.pop_front();
                }
                rho_hist.push_back(1.0 / ys);
                s_hist.push_back(s.clone());
                y_hist.push_back(y);
            }

            let dx = norm_inf(&s);
            let df = f - f_new;
            x.copy_from_slice(&x_new);
            g.copy_from_slice(&g_new);
            f = f_new;
            first_step = false;

            if dx < self.settings.x_tolerance {
                converged = true;
                break;
            }
            if df.abs() <= self.settings.f_tolerance * (f.abs() + self.settings.f_tolerance) {
                converged = true;
                break;
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

    struct Quadratic {
        center: Vec<f64>,
    }

    impl Problem for Quadratic {
        fn dimension(&self) -> usize {
            self.center.len()
        }

        fn evaluate(&mut self, x: &[f64], grad: Option<&mut [f64]>) -> f64 {
            let mut f = 0.0;
            if let Some(g) = grad {
                for i in 0..x.len() {
                    let d = x[i] - self.center[i];
                    f += (i + 1) as f64 * d * d;
                    g[i] = 2.0 * (i + 1) as f64 * d;
                }
            } else {
                for i in 0..x.len() {
                    let d = x[i] - self.center[i];
                    f += (i + 1) as f64 * d * d;
                }
            }
            f
        }
    }

    #[test]
    fn test_lbfgs_quadratic() {
        let mut problem = Quadratic {
            center: vec![5.0, -3.0, 1.5],
        };
        let mut x = vec![0.0, 0.0, 0.0];
        let settings = OptimizerSettings {
            max_evaluations: 200,
            ..Default::default()
        };
        let outcome = Lbfgs::new(settings).minimize(&mut problem, &mut x);
        assert!(outcome.converged);
        assert!((x[0] - 5.0).abs() < 1e-3, "x[0] = {}", x[0]);
        assert!((x[1] + 3.0).abs() < 1e-3);
        assert!((x[2] - 1.5).abs() < 1e-3);
    }

    struct Rosenbrock;

    impl Problem for Rosenbrock {
        fn dimension(&self) -> usize {
            2
        }

        fn evaluate(&mut self, x: &[f64], grad: Option<&mut [f64]>) -> f64 {
            let (a, b) = (x[0], x[1]);
            let f = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
            if let Some(g) = grad {
                g[0] = -2.0 * (1.0 - a) - 400.0 * a * (b - a * a);
                g[1] = 200.0 * (b - a * a);
            }
            f
        }
    }

    #[test]
    fn test_lbfgs_rosenbrock() {
        let mut x = vec![-1.2, 1.0];
        let settings = OptimizerSettings {
            max_evaluations: 2000,
            x_tolerance: 1e-10,
            f_tolerance: 1e-14,
            ..Default::default()
        };
        let outcome = Lbfgs::new(settings).minimize(&mut Rosenbrock, &mut x);
        assert!(outcome.value < 1e-6, "value = {}", outcome.value);
        assert!((x[0] - 1.0).abs() < 1e-2);
        assert!((x[1] - 1.0).abs() < 1e-2);
    }
}
