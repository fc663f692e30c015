//! Dense displacement field: one D-vector per voxel.
//!
//! The value at voxel `i` is the offset `u(i)` such that the sampled point
//! in the moving image is `i + u(i)`. Components are in voxel units unless
//! stated otherwise; the identity transform is the zero field.

use rayon::prelude::*;

use crate::geometry::Geometry;
use crate::image::Image;
use crate::parallel;

/// Step-size policy applied to an update field before composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    /// Use the field as-is.
    Const,
    /// Rescale so the maximum vector norm equals the step size.
    Scale,
    /// Rescale only when the maximum vector norm exceeds the step size.
    ScaleDown,
}

/// Dense vector field with D interleaved f32 components per voxel.
#[derive(Debug, Clone)]
pub struct Field<const D: usize> {
    geometry: Geometry<D>,
    data: Vec<f32>,
}

impl<const D: usize> Field<D> {
    /// Allocate a zero (identity) field over the given geometry.
    pub fn new(geometry: Geometry<D>) -> Self {
        let data = vec![0.0; geometry.num_voxels() * D];
        Self { geometry, data }
    }

    pub fn geometry(&self) -> &Geometry<D> {
        &self.geometry
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Displacement vector at a linear voxel index.
    #[inline]
    pub fn vec(&self, linear: usize) -> [f32; D] {
        let base = linear * D;
        let mut out = [0.0; D];
        out.copy_from_slice(&self.data[base..base + D]);
        out
    }

    #[inline]
    pub fn set_vec(&mut self, linear: usize, v: [f32; D]) {
        let base = linear * D;
        self.data[base..base + D].copy_from_slice(&v);
    }

    /// Fill every voxel with the same displacement.
    pub fn fill_vec(&mut self, v: [f32; D]) {
        for frame in self.data.chunks_exact_mut(D) {
            frame.copy_from_slice(&v);
        }
    }

    /// Reset to the identity (zero) field.
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    /// Multiply every component in place.
    pub fn scale_in_place(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }

    /// Add another field of identical shape in place.
    pub fn add_in_place(&mut self, other: &Field<D>) {
        assert_eq!(self.data.len(), other.data.len());
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += *b;
        }
    }

    /// Multiply each vector by the corresponding sample of a scalar image.
    /// Used to weight a gradient field by a mask.
    pub fn weight_by(&mut self, mask: &Image<D>) {
        assert_eq!(mask.channels(), 1);
        assert_eq!(mask.geometry().size(), self.geometry.size());
        for (frame, &w) in self.data.chunks_exact_mut(D).zip(mask.data()) {
            for c in frame {
                *c *= w;
            }
        }
    }

    /// Maximum Euclidean vector norm over the field.
    pub fn max_norm(&self) -> f64 {
        let n = self.geometry.num_voxels();
        parallel::chunk_ranges(n)
            .into_par_iter()
            .map(|range| {
                let mut local: f64 = 0.0;
                for frame in self.data[range.start * D..range.end * D].chunks_exact(D) {
                    let sq: f64 = frame.iter().map(|&c| (c as f64) * (c as f64)).sum();
                    local = local.max(sq);
                }
                local
            })
            .collect::<Vec<_>>()
            .into_iter()
            .fold(0.0f64, f64::max)
            .sqrt()
    }

    /// Apply a step-size policy with step `epsilon`, returning the max norm
    /// that was found before scaling.
    pub fn apply_scaling(&mut self, mode: ScalingMode, epsilon: f64) -> f64 {
        let max = self.max_norm();
        match mode {
            ScalingMode::Const => {
                self.scale_in_place(epsilon as f32);
            }
            ScalingMode::Scale => {
                if max > 0.0 {
                    self.scale_in_place((epsilon / max) as f32);
                }
            }
            ScalingMode::ScaleDown => {
                if max > epsilon {
                    self.scale_in_place((epsilon / max) as f32);
                }
            }
        }
        max
    }
}
