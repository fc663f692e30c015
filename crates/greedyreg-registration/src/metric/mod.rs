//! Similarity metrics: per-voxel value and displacement-space gradient.

mod mi;
mod ncc;
mod ssd;
mod trait_;

pub use mi::MutualInformation;
pub use ncc::PatchNcc;
pub use ssd::Ssd;
pub use trait_::{Metric, MetricReport, MetricWorkspace};

use crate::error::{GreedyError, Result};
use crate::params::MetricKind;

/// Instantiate the metric selected by the parameters.
pub fn make_metric<const D: usize>(kind: &MetricKind) -> Result<Box<dyn Metric<D>>> {
    match kind {
        MetricKind::Ssd => Ok(Box::new(Ssd)),
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
            Ok(Box::new(PatchNcc::new(r)))
        }
        MetricKind::Mi => Ok(Box::new(MutualInformation::default())),
    }
}
