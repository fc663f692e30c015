//! Affine matrix text files.
//!
//! Two formats are recognized: an ITK transform file (probed by its
//! `#Insight Transform File` header line) and a plain whitespace-separated
//! `(D+1)×(D+1)` matrix. Both store the transform in physical RAS
//! convention. The transform-spec exponent is applied on read: −1 inverts
//! the matrix, +1 is the identity, anything else is rejected (square roots
//! are reserved).

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::DMatrix;
use std::io::Write;
use std::path::Path;

const ITK_HEADER: &str = "#Insight Transform File";

/// Read an affine matrix for `d`-dimensional images and apply the spec
/// exponent.
pub fn read_matrix<P: AsRef<Path>>(path: P, d: usize, exponent: f64) -> Result<DMatrix<f64>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read transform file {}", path.display()))?;

    let matrix = if text.starts_with(ITK_HEADER) {
        parse_itk_transform(&text, d)
            .with_context(|| format!("malformed ITK transform file {}", path.display()))?
    } else {
        parse_plain_matrix(&text, d)
            .with_context(|| format!("malformed matrix file {}", path.display()))?
    };

    if exponent == 1.0 {
        Ok(matrix)
    } else if exponent == -1.0 {
        matrix
            .clone()
            .try_inverse()
            .ok_or_else(|| anyhow!("transform matrix in {} is singular", path.display()))
    } else {
        bail!("transform exponent values of +1 and -1 are the only ones currently supported")
    }
}

/// Write a plain `(D+1)×(D+1)` RAS matrix.
pub fn write_matrix<P: AsRef<Path>>(path: P, matrix: &DMatrix<f64>) -> Result<()> {
    let path = path.as_ref();
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for i in 0..matrix.nrows() {
        let row: Vec<String> = (0..matrix.ncols())
            .map(|j| format!("{:.12}", matrix[(i, j)]))
            .collect();
        writeln!(file, "{}", row.join(" "))?;
    }
    Ok(())
}

fn parse_plain_matrix(text: &str, d: usize) -> Result<DMatrix<f64>> {
    let values: Vec<f64> = text
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| anyhow!("expected a number, got '{}'", tok))
        })
        .collect::<Result<_>>()?;
    let n = d + 1;
    if values.len() < n * n {
        bail!("expected {} matrix entries, found {}", n * n, values.len());
    }
    let mut matrix = DMatrix::<f64>::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            matrix[(i, j)] = values[i * n + j];
        }
    }
    Ok(matrix)
}

/// Parse an ITK `MatrixOffsetTransformBase` text serialization.
///
/// `Parameters:` holds the row-major D×D matrix followed by the
/// translation; `FixedParameters:` holds the rotation center. The ITK
/// matrix is stored in LPS; the RAS form needs sign fix-ups on the first
/// two rows and columns in 3-D.
fn parse_itk_transform(text: &str, d: usize) -> Result<DMatrix<f64>> {
    let mut parameters: Option<Vec<f64>> = None;
    let mut fixed: Option<Vec<f64>> = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Parameters:") {
            parameters = Some(parse_numbers(rest)?);
        } else if let Some(rest) = line.strip_prefix("FixedParameters:") {
            fixed = Some(parse_numbers(rest)?);
        }
    }
    let parameters = parameters.ok_or_else(|| anyhow!("missing Parameters line"))?;
    if parameters.len() < d * d + d {
        bail!(
            "expected {} transform parameters, found {}",
            d * d + d,
            parameters.len()
        );
    }
    let center = fixed.unwrap_or_else(|| vec![0.0; d]);
    if center.len() < d {
        bail!("expected {} fixed parameters, found {}", d, center.len());
    }

    // offset = t + c − M·c
    let n = d + 1;
    let mut matrix = DMatrix::<f64>::identity(n, n);
    for i in 0..d {
        for j in 0..d {
            matrix[(i, j)] = parameters[i * d + j];
        }
    }
    for i in 0..d {
        let mut offset = parameters[d * d + i] + center[i];
        for j in 0..d {
            offset -= matrix[(i, j)] * center[j];
        }
        matrix[(i, n - 1)] = offset;
    }

    // LPS to RAS fix-up, as for any 3-D matrix moved between conventions.
    if d == 3 {
        matrix[(2, 0)] *= -1.0;
        matrix[(2, 1)] *= -1.0;
        matrix[(0, 2)] *= -1.0;
        matrix[(1, 2)] *= -1.0;
        matrix[(0, 3)] *= -1.0;
        matrix[(1, 3)] *= -1.0;
    }

    Ok(matrix)
}

fn parse_numbers(text: &str) -> Result<Vec<f64>> {
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| anyhow!("expected a number, got '{}'", tok))
        })
        .collect()
}
