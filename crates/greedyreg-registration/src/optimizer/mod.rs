//! Nonlinear minimizers driving the affine solver.
//!
//! The coupling is deliberately minimal: a [`Problem`] yields `(value,
//! gradient)` at a parameter vector and the minimizer drives the vector, so
//! the algorithm stays pluggable.

mod lbfgs;
mod powell;
mod trait_;

pub use lbfgs::Lbfgs;
pub use powell::Powell;
pub use trait_::{MinimizeOutcome, Minimizer, OptimizerSettings, Problem};
