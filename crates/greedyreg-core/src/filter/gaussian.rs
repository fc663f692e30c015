//! Separable Gaussian smoothing with border handling.
//!
//! Sigmas are given per axis in voxel units. Taps outside the image read the
//! replicated edge voxel, which matches the infinite-domain response of a
//! replicate-padded input near the boundary.

use rayon::prelude::*;

use crate::image::{Field, Image};

/// Separable Gaussian smoothing filter.
pub struct GaussianFilter<const D: usize> {
    sigmas: [f64; D],
    max_kernel_width: usize,
}

impl<const D: usize> GaussianFilter<D> {
    /// Create a filter with per-axis standard deviations in voxel units.
    pub fn new(sigmas: [f64; D]) -> Self {
        Self {
            sigmas,
            max_kernel_width: 32,
        }
    }

    /// Cap the kernel width (2·radius + 1).
    pub fn with_max_kernel_width(mut self, width: usize) -> Self {
        self.max_kernel_width = width.max(3);
        self
    }

    fn kernel(&self, sigma: f64) -> Vec<f32> {
        let radius = ((3.0 * sigma).ceil() as usize).min((self.max_kernel_width - 1) / 2);
        let two_sigma2 = 2.0 * sigma * sigma;
        let mut kernel = Vec::with_capacity(2 * radius + 1);
        let mut sum = 0.0;
        for i in 0..=(2 * radius) {
            let x = i as f64 - radius as f64;
            let val = (-x * x / two_sigma2).exp();
            kernel.push(val);
            sum += val;
        }
        kernel.iter().map(|v| (v / sum) as f32).collect()
    }

    /// Smooth a multi-channel buffer. `src`, `dst` and `tmp` must all have
    /// `num_voxels · comps` elements; `tmp` is scratch so callers can reuse
    /// allocations across iterations.
    pub fn apply(
        &self,
        src: &[f32],
        dst: &mut [f32],
        tmp: &mut [f32],
        size: [usize; D],
        comps: usize,
    ) {
        assert_eq!(src.len(), dst.len());
        assert_eq!(src.len(), tmp.len());

        let mut strides = [1usize; D];
        for d in 1..D {
            strides[d] = strides[d - 1] * size[d - 1];
        }

        let active: Vec<usize> = (0..D).filter(|&d| self.sigmas[d] > 1e-6).collect();
        if active.is_empty() {
            dst.copy_from_slice(src);
            return;
        }

        // Alternate between dst and tmp so the final pass lands in dst.
        let (mut write, mut read): (&mut [f32], &mut [f32]) = if active.len() % 2 == 1 {
            (&mut *dst, &mut *tmp)
        } else {
            (&mut *tmp, &mut *dst)
        };
        for (pass, &axis) in active.iter().enumerate() {
            let kernel = self.kernel(self.sigmas[axis]);
            if pass == 0 {
                smooth_axis::<D>(src, &mut *write, size, strides, comps, axis, &kernel);
            } else {
                smooth_axis::<D>(&*read, &mut *write, size, strides, comps, axis, &kernel);
            }
            std::mem::swap(&mut write, &mut read);
        }
    }

    /// Smooth a field into `dst`, using `tmp` as scratch.
    pub fn apply_field(&self, src: &Field<D>, dst: &mut Field<D>, tmp: &mut Field<D>) {
        let size = src.geometry().size();
        self.apply(src.data(), dst.data_mut(), tmp.data_mut(), size, D);
    }

    /// Smooth an image into `dst`, using `tmp` as scratch.
    pub fn apply_image(&self, src: &Image<D>, dst: &mut Image<D>, tmp: &mut Image<D>) {
        let size = src.geometry().size();
        let comps = src.channels();
        self.apply(src.data(), dst.data_mut(), tmp.data_mut(), size, comps);
    }
}

fn smooth_axis<const D: usize>(
    src: &[f32],
    dst: &mut [f32],
    size: [usize; D],
    strides: [usize; D],
    comps: usize,
    axis: usize,
    kernel: &[f32],
) {
    let radius = (kernel.len() - 1) / 2;
    let n = src.len() / comps;
    let chunk_voxels = n.div_ceil(rayon::current_num_threads().max(1)).max(1);
    let axis_len = size[axis] as isize;
    let axis_stride = strides[axis];

    dst.par_chunks_mut(chunk_voxels * comps)
        .enumerate()
        .for_each(|(chunk, out)| {
            let first = chunk * chunk_voxels;
            for (local, frame) in out.chunks_exact_mut(comps).enumerate() {
                let voxel = first + local;
                let coord = ((voxel / axis_stride) % size[axis]) as isize;
                for (c, o) in frame.iter_mut().enumerate() {
                    let mut acc = 0.0f64;
                    for (t, &k) in kernel.iter().enumerate() {
                        let j = (coord + t as isize - radius as isize).clamp(0, axis_len - 1);
                        let off = (voxel as isize + (j - coord) * axis_stride as isize) as usize;
                        acc += k as f64 * src[off * comps + c] as f64;
                    }
                    *o = acc as f32;
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use approx::assert_relative_eq;

    #[test]
    fn test_smoothing_preserves_constant() {
        let geom = Geometry::<2>::unit([8, 8]);
        let mut src = Image::<2>::new(geom.clone(), 1);
        src.fill(3.5);
        let mut dst = Image::<2>::new(geom.clone(), 1);
        let mut tmp = Image::<2>::new(geom, 1);
        GaussianFilter::new([1.5, 1.5]).apply_image(&src, &mut dst, &mut tmp);
        for &v in dst.data() {
            assert_relative_eq!(v, 3.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_smoothing_mass_preserved_in_interior() {
        let geom = Geometry::<2>::unit([17, 17]);
        let mut src = Image::<2>::new(geom.clone(), 1);
        src.set([8, 8], 0, 1.0);
        let mut dst = Image::<2>::new(geom.clone(), 1);
        let mut tmp = Image::<2>::new(geom, 1);
        GaussianFilter::new([1.0, 1.0]).apply_image(&src, &mut dst, &mut tmp);
        let total: f64 = dst.data().iter().map(|&v| v as f64).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-4);
        let center = dst.get([8, 8], 0);
        assert!(center > dst.get([7, 8], 0));
    }

    #[test]
    fn test_zero_sigma_is_identity() {
        let geom = Geometry::<2>::unit([4, 4]);
        let mut src = Image::<2>::new(geom.clone(), 1);
        for (i, v) in src.data_mut().iter_mut().enumerate() {
            *v = i as f32;
        }
        let mut dst = Image::<2>::new(geom.clone(), 1);
        let mut tmp = Image::<2>::new(geom, 1);
        GaussianFilter::new([0.0, 0.0]).apply_image(&src, &mut dst, &mut tmp);
        assert_eq!(src.data(), dst.data());
    }

    #[test]
    fn test_single_axis_smoothing() {
        let geom = Geometry::<2>::unit([9, 3]);
        let mut src = Image::<2>::new(geom.clone(), 1);
        src.set([4, 1], 0, 1.0);
        let mut dst = Image::<2>::new(geom.clone(), 1);
        let mut tmp = Image::<2>::new(geom, 1);
        GaussianFilter::new([1.0, 0.0]).apply_image(&src, &mut dst, &mut tmp);
        // No smoothing across rows
        assert_eq!(dst.get([4, 0], 0), 0.0);
        assert!(dst.get([4, 1], 0) > 0.0);
        assert!(dst.get([3, 1], 0) > 0.0);
    }
}
