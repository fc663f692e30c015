//! Multi-linear interpolation over a multi-channel image.

use crate::image::Image;
use super::trait_::Sampler;

/// Multi-linear (bi/tri/quad-linear) sampler.
///
/// Interpolates over the 2^D voxel corners surrounding the sample point.
/// The masked variants also provide the spatial gradient of the interpolant,
/// which the metric evaluators chain into displacement-space gradients.
pub struct LinearSampler<'a, const D: usize> {
    data: &'a [f32],
    size: [usize; D],
    strides: [usize; D],
    channels: usize,
}

impl<'a, const D: usize> LinearSampler<'a, D> {
    pub fn new(image: &'a Image<D>) -> Self {
        Self::from_parts(
            image.data(),
            image.geometry().size(),
            image.geometry().strides(),
            image.channels(),
        )
    }

    /// Sample an arbitrary interleaved buffer (e.g. the D components of a
    /// displacement field).
    pub fn from_parts(
        data: &'a [f32],
        size: [usize; D],
        strides: [usize; D],
        channels: usize,
    ) -> Self {
        debug_assert_eq!(data.len(), size.iter().product::<usize>() * channels);
        Self {
            data,
            size,
            strides,
            channels,
        }
    }

    #[inline]
    fn split(&self, x: [f64; D]) -> ([isize; D], [f64; D]) {
        let mut base = [0isize; D];
        let mut frac = [0.0f64; D];
        for d in 0..D {
            let f = x[d].floor();
            base[d] = f as isize;
            frac[d] = x[d] - f;
        }
        (base, frac)
    }

    /// Zero-padded sample with per-channel spatial gradient.
    ///
    /// `out` receives one value per channel, `grad[k][d]` the derivative of
    /// channel `k` with respect to coordinate `d`, and `frac_grad` the
    /// spatial gradient of the in-domain weight fraction (nonzero only at
    /// the image border). Returns the in-domain weight fraction.
    pub fn sample_masked_with_gradient(
        &self,
        x: [f64; D],
        out: &mut [f32],
        grad: &mut [[f64; D]],
        frac_grad: &mut [f64; D],
    ) -> f64 {
        debug_assert_eq!(out.len(), self.channels);
        debug_assert_eq!(grad.len(), self.channels);
        out.fill(0.0);
        for g in grad.iter_mut() {
            g.fill(0.0);
        }
        frac_grad.fill(0.0);

        let (base, frac) = self.split(x);
        let mut inside_weight = 0.0;

        for corner in 0..(1usize << D) {
            let mut offset = 0usize;
            let mut inside = true;
            // Per-axis weight factors for this corner and their signs for the
            // gradient terms.
            let mut w_axis = [0.0f64; D];
            let mut sign = [0.0f64; D];
            for d in 0..D {
                let bit = (corner >> d) & 1;
                let c = base[d] + bit as isize;
                if c < 0 || c >= self.size[d] as isize {
                    inside = false;
                    break;
                }
                offset += c as usize * self.strides[d];
                if bit == 1 {
                    w_axis[d] = frac[d];
                    sign[d] = 1.0;
                } else {
                    w_axis[d] = 1.0 - frac[d];
                    sign[d] = -1.0;
                }
            }
            if !inside {
                continue;
            }

            let weight: f64 = w_axis.iter().product();
            inside_weight += weight;

            // Weight product with each axis in turn replaced by its
            // derivative.
            let mut dw = [0.0f64; D];
            for d in 0..D {
                let mut v = sign[d];
                for e in 0..D {
                    if e != d {
                        v *= w_axis[e];
                    }
                }
                dw[d] = v;
                frac_grad[d] += v;
            }

            let samples = &self.data[offset * self.channels..(offset + 1) * self.channels];
            for (k, &s) in samples.iter().enumerate() {
                out[k] += (weight * s as f64) as f32;
                for d in 0..D {
                    grad[k][d] += dw[d] * s as f64;
                }
            }
        }

        inside_weight
    }
}

impl<const D: usize> Sampler<D> for LinearSampler<'_, D> {
    fn sample_clamped(&self, x: [f64; D], out: &mut [f32]) {
        debug_assert_eq!(out.len(), self.channels);
        out.fill(0.0);
        let (base, frac) = self.split(x);

        for corner in 0..(1usize << D) {
            let mut offset = 0usize;
            let mut weight = 1.0f64;
            for d in 0..D {
                let bit = (corner >> d) & 1;
                let c = (base[d] + bit as isize).clamp(0, self.size[d] as isize - 1);
                offset += c as usize * self.strides[d];
                weight *= if bit == 1 { frac[d] } else { 1.0 - frac[d] };
            }
            if weight == 0.0 {
                continue;
            }
            let samples = &self.data[offset * self.channels..(offset + 1) * self.channels];
            for (o, &s) in out.iter_mut().zip(samples) {
                *o += (weight * s as f64) as f32;
            }
        }
    }

    fn sample_masked(&self, x: [f64; D], out: &mut [f32]) -> f64 {
        debug_assert_eq!(out.len(), self.channels);
        out.fill(0.0);
        let (base, frac) = self.split(x);
        let mut inside_weight = 0.0;

        for corner in 0..(1usize << D) {
            let mut offset = 0usize;
            let mut weight = 1.0f64;
            let mut inside = true;
            for d in 0..D {
                let bit = (corner >> d) & 1;
                let c = base[d] + bit as isize;
                if c < 0 || c >= self.size[d] as isize {
                    inside = false;
                    break;
                }
                offset += c as usize * self.strides[d];
                weight *= if bit == 1 { frac[d] } else { 1.0 - frac[d] };
            }
            if !inside || weight == 0.0 {
                continue;
            }
            inside_weight += weight;
            let samples = &self.data[offset * self.channels..(offset + 1) * self.channels];
            for (o, &s) in out.iter_mut().zip(samples) {
                *o += (weight * s as f64) as f32;
            }
        }

        inside_weight
    }
}
