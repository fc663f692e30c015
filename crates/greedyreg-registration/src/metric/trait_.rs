//! Metric trait and shared evaluation state.

use greedyreg_core::{Field, Geometry, Image};

use crate::error::Result;
use crate::pyramid::PyramidLevel;

/// Outcome of one dense metric evaluation.
#[derive(Debug, Clone)]
pub struct MetricReport {
    /// Objective contribution of each composite channel (the quantity being
    /// minimized, so NCC and MI channels report negated similarity).
    pub per_channel: Vec<f64>,
    /// Sum over channels.
    pub total: f64,
}

impl MetricReport {
    pub fn from_channels(per_channel: Vec<f64>) -> Self {
        let total = per_channel.iter().sum();
        Self { per_channel, total }
    }
}

/// Scratch buffers reused across metric evaluations of one level.
///
/// Evaluators write the update field into `grad`, the per-voxel similarity
/// into `metric_image` and the sampling validity fraction into `mask`. The
/// remaining buffers are metric-specific accumulators allocated on first
/// use.
pub struct MetricWorkspace<const D: usize> {
    pub grad: Field<D>,
    pub metric_image: Image<D>,
    pub mask: Image<D>,
    pub(crate) acc: Option<Image<D>>,
    pub(crate) acc_tmp: Option<Image<D>>,
    pub(crate) coeff: Option<Image<D>>,
    pub(crate) coeff_tmp: Option<Image<D>>,
}

impl<const D: usize> MetricWorkspace<D> {
    /// Allocate a workspace over the reference space of a level.
    pub fn new(reference: &Geometry<D>) -> Self {
        Self {
            grad: Field::new(reference.clone()),
            metric_image: Image::new(reference.clone(), 1),
            mask: Image::new(reference.clone(), 1),
            acc: None,
            acc_tmp: None,
            coeff: None,
            coeff_tmp: None,
        }
    }

    /// Get-or-allocate a named accumulator with the given channel count.
    pub(crate) fn accumulator<'a>(
        slot: &'a mut Option<Image<D>>,
        reference: &Geometry<D>,
        channels: usize,
    ) -> &'a mut Image<D> {
        match slot {
            Some(img) if img.channels() == channels => {}
            _ => *slot = Some(Image::new(reference.clone(), channels)),
        }
        slot.as_mut().unwrap()
    }
}

/// Per-voxel similarity metric.
///
/// The dense shape evaluates value and gradient at a displacement field.
/// `grad` receives the update direction for the greedy solver: the negative
/// gradient of the minimized objective with respect to `u(i)`, so callers
/// only ever add it. The affine shape is derived from the dense one by the
/// solver (`crate::affine`).
pub trait Metric<const D: usize>: Sync {
    fn name(&self) -> &'static str;

    /// Evaluate at displacement `u` over a pyramid level.
    ///
    /// `weights` carries one weight per composite channel. With
    /// `compute_grad` unset only the value buffers are filled; `ws.grad` is
    /// left untouched.
    fn dense(
        &self,
        level: &PyramidLevel<D>,
        weights: &[f64],
        u: &Field<D>,
        ws: &mut MetricWorkspace<D>,
        compute_grad: bool,
    ) -> Result<MetricReport>;
}
