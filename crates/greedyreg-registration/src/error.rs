//! Error types for registration operations.

use thiserror::Error;

/// Main error type for registration operations.
#[derive(Error, Debug)]
pub enum GreedyError {
    /// Malformed or missing input (files, matrices, metric names).
    #[error("Input error: {0}")]
    Input(String),

    /// Inconsistent configuration (radii, exponents, label counts).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Dimension mismatch between inputs.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Geometry mismatch between buffers that must share a grid.
    #[error("Geometry mismatch: expected size {expected:?}, got {actual:?}")]
    GeometryMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Numerical failure (singular matrix, degenerate transform).
    #[error("Numerical error: {0}")]
    Numerical(String),
}

/// Result type for registration operations.
pub type Result<T> = std::result::Result<T, GreedyError>;

impl GreedyError {
    /// Create an input error.
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a dimension mismatch error.
    pub fn dimension_mismatch(msg: impl Into<String>) -> Self {
        Self::DimensionMismatch(msg.into())
    }

    /// Create a numerical error.
    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GreedyError::input("missing file");
        assert_eq!(err.to_string(), "Input error: missing file");
    }

    #[test]
    fn test_geometry_mismatch_display() {
        let err = GreedyError::GeometryMismatch {
            expected: vec![10, 10],
            actual: vec![5, 5],
        };
        assert!(err.to_string().contains("expected"));
        assert!(err.to_string().contains("got"));
    }
}
