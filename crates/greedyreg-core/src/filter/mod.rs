//! Image-wide kernels: smoothing, resampling, composition, Jacobian,
//! downsampling. Every kernel partitions its output across the rayon pool
//! and acts as a barrier.

mod compose;
mod downsample;
mod gaussian;
mod jacobian;
mod resample;

pub use compose::{compose, compose_physical};
pub use downsample::downsample_average;
pub use gaussian::GaussianFilter;
pub use jacobian::jacobian_determinant;
pub use resample::{resample_field_identity, warp_image, Interp};
