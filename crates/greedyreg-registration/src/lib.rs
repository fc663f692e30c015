//! Multi-resolution greedy diffeomorphic and affine registration.
//!
//! The engine consumes image pairs through a resolution [`pyramid`], drives
//! one of three solvers ([`deformable`], [`affine`], [`brute`]) against a
//! similarity [`metric`], and composes/applies transform chains through
//! [`reslice`]. All coordinate bookkeeping between voxel, physical-LPS and
//! physical-RAS space is centralized in `greedyreg-core::geometry` and
//! [`affine`].

pub mod affine;
pub mod brute;
pub mod deformable;
pub mod error;
pub mod metric;
pub mod optimizer;
pub mod params;
pub mod pyramid;
pub mod reslice;

pub use error::{GreedyError, Result};
pub use params::{GreedyParams, MetricKind, SigmaSpec};
pub use pyramid::{ImagePair, Pyramid};
