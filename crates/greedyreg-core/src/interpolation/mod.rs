//! Interpolated sampling of dense buffers at continuous voxel coordinates.

mod linear;
mod nearest;
mod trait_;

pub use linear::LinearSampler;
pub use nearest::NearestSampler;
pub use trait_::{SampleStatus, Sampler};
