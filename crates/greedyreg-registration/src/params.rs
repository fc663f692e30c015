//! Registration parameters.
//!
//! Defaults match the engine's command-line defaults: SSD metric, two
//! 100-iteration levels, step size 1.0 under the SCALE policy, smoothing
//! sigmas √3 and √0.5 voxels.

use greedyreg_core::image::ScalingMode;

/// Similarity metric selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricKind {
    /// Sum of squared differences.
    Ssd,
    /// Windowed normalized cross-correlation with a per-axis patch radius.
    Ncc { radius: Vec<usize> },
    /// Histogram-based mutual information.
    Mi,
}

impl MetricKind {
    pub fn is_ncc(&self) -> bool {
        matches!(self, MetricKind::Ncc { .. })
    }
}

/// A smoothing sigma with its unit: millimeters (physical) or voxels of the
/// current level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SigmaSpec {
    pub sigma: f64,
    pub physical_units: bool,
}

impl SigmaSpec {
    pub fn voxels(sigma: f64) -> Self {
        Self {
            sigma,
            physical_units: false,
        }
    }

    pub fn millimeters(sigma: f64) -> Self {
        Self {
            sigma,
            physical_units: true,
        }
    }
}

/// Parameters shared by the deformable and affine solvers.
#[derive(Debug, Clone)]
pub struct GreedyParams {
    pub metric: MetricKind,
    /// Step size ε.
    pub epsilon: f64,
    /// Step-size policy applied to the smoothed update.
    pub time_step_mode: ScalingMode,
    /// Pre-update smoothing of the gradient field.
    pub sigma_pre: SigmaSpec,
    /// Post-update smoothing of the accumulated field.
    pub sigma_post: SigmaSpec,
    /// Iterations per pyramid level, coarse to fine. The length also fixes
    /// the number of levels.
    pub iter_per_level: Vec<usize>,
    /// Square roots taken of the forward transform when the inverse-warp
    /// iteration stalls.
    pub inverse_exponent: usize,
    /// Quantization step for serialized warps, in voxels (0 disables).
    pub warp_precision: f64,
    /// Use Powell's method instead of L-BFGS in the affine solver.
    pub use_powell: bool,
    /// Epsilon for the affine derivative check.
    pub deriv_epsilon: f64,
    /// Run the affine derivative check at each level's starting point.
    pub debug_deriv: bool,
}

impl Default for GreedyParams {
    fn default() -> Self {
        Self {
            metric: MetricKind::Ssd,
            epsilon: 1.0,
            time_step_mode: ScalingMode::Scale,
            sigma_pre: SigmaSpec::voxels(3.0f64.sqrt()),
            sigma_post: SigmaSpec::voxels(0.5f64.sqrt()),
            iter_per_level: vec![100, 100],
            inverse_exponent: 2,
            warp_precision: 0.1,
            use_powell: false,
            deriv_epsilon: 1e-4,
            debug_deriv: false,
        }
    }
}

impl GreedyParams {
    pub fn num_levels(&self) -> usize {
        self.iter_per_level.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_command_surface() {
        let p = GreedyParams::default();
        assert_eq!(p.metric, MetricKind::Ssd);
        assert_eq!(p.epsilon, 1.0);
        assert_eq!(p.iter_per_level, vec![100, 100]);
        assert_eq!(p.inverse_exponent, 2);
        assert!((p.sigma_pre.sigma * p.sigma_pre.sigma - 3.0).abs() < 1e-12);
        assert!((p.sigma_post.sigma * p.sigma_post.sigma - 0.5).abs() < 1e-12);
    }
}
