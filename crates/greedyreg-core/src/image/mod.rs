//! Dense N-D buffers: scalar/composite images and displacement fields.

mod field;
#[allow(clippy::module_inception)]
mod image;

pub use field::{Field, ScalingMode};
pub use image::Image;
