//! Spatial types shared by images, transforms and solvers.
//!
//! Thin wrappers around nalgebra's stack-allocated vectors and matrices,
//! providing the domain vocabulary (points, displacement vectors, voxel
//! spacings, direction cosine matrices) without hiding the underlying
//! linear algebra.

mod direction;
mod point;
mod spacing;
mod vector;

pub use direction::{lps_to_ras_flip, Direction};
pub use point::Point;
pub use spacing::Spacing;
pub use vector::Vector;

/// Convenience aliases for the common dimensionalities.
pub type Point2 = Point<2>;
pub type Point3 = Point<3>;
pub type Vector2 = Vector<2>;
pub type Vector3 = Vector<3>;
pub type Spacing2 = Spacing<2>;
pub type Spacing3 = Spacing<3>;
pub type Direction2 = Direction<2>;
pub type Direction3 = Direction<3>;
