pub mod geometry;
pub mod image;
pub mod interpolation;
pub mod filter;
pub mod parallel;
pub mod spatial;

pub use geometry::Geometry;
pub use image::{Field, Image};
pub use spatial::{Direction, Point, Spacing, Vector};
