//! Multi-resolution pyramid of composite images.
//!
//! The channels of all input pairs are stacked into one composite buffer per
//! side so every metric pass walks a single cache-friendly array. Levels run
//! coarse to fine with power-of-two averaging factors (factor 1 at the
//! finest). Per-level state is immutable once built.

use greedyreg_core::filter::downsample_average;
use greedyreg_core::{Geometry, Image};

use crate::error::{GreedyError, Result};
use crate::params::SigmaSpec;

/// A fixed/moving input pair with its metric weight.
#[derive(Debug, Clone)]
pub struct ImagePair<const D: usize> {
    pub fixed: Image<D>,
    pub moving: Image<D>,
    pub weight: f64,
}

/// Composite buffers of one resolution level.
#[derive(Debug)]
pub struct PyramidLevel<const D: usize> {
    /// Stacked fixed channels in the level's reference space.
    pub fixed: Image<D>,
    /// Stacked moving channels in the moving image's own (downsampled)
    /// space.
    pub moving: Image<D>,
    /// Gradient mask resampled to the reference space, if any.
    pub mask: Option<Image<D>>,
}

/// Resolution pyramid over all input pairs.
#[derive(Debug)]
pub struct Pyramid<const D: usize> {
    levels: Vec<PyramidLevel<D>>,
    /// Per-channel weight (the owning pair's weight).
    channel_weights: Vec<f64>,
    /// Half-open channel span of each pair inside the composite.
    pair_spans: Vec<(usize, usize)>,
    factors: Vec<usize>,
}

/// Relative amplitude of the deterministic noise injected into composites
/// when NCC is the metric. Scaled by each channel's intensity range; keeps
/// the windowed-variance denominator away from zero on flat patches while
/// staying below genuine image variation.
pub const DEFAULT_NOISE_AMPLITUDE: f64 = 1e-4;

impl<const D: usize> Pyramid<D> {
    /// Build a pyramid with `num_levels` levels. `noise_amplitude` enables
    /// deterministic composite noise (pass
    /// [`DEFAULT_NOISE_AMPLITUDE`] for NCC runs, `None` otherwise).
    pub fn build(
        pairs: &[ImagePair<D>],
        mask: Option<&Image<D>>,
        num_levels: usize,
        noise_amplitude: Option<f64>,
    ) -> Result<Self> {
        if pairs.is_empty() {
            return Err(GreedyError::input("at least one image pair is required"));
        }
        if num_levels == 0 {
            return Err(GreedyError::configuration(
                "iteration schedule must have at least one level",
            ));
        }

        let reference = pairs[0].fixed.geometry().clone();
        let mut channel_weights = Vec::new();
        let mut pair_spans = Vec::new();
        for pair in pairs {
            if pair.fixed.geometry().size() != reference.size() {
                return Err(GreedyError::GeometryMismatch {
                    expected: reference.size().to_vec(),
                    actual: pair.fixed.geometry().size().to_vec(),
                });
            }
            if pair.moving.geometry().size() != pairs[0].moving.geometry().size() {
                return Err(GreedyError::GeometryMismatch {
                    expected: pairs[0].moving.geometry().size().to_vec(),
                    actual: pair.moving.geometry().size().to_vec(),
                });
            }
            if pair.fixed.channels() != pair.moving.channels() {
                return Err(GreedyError::dimension_mismatch(format!(
                    "pair has {} fixed but {} moving channels",
                    pair.fixed.channels(),
                    pair.moving.channels()
                )));
            }
            if pair.weight <= 0.0 {
                return Err(GreedyError::configuration("pair weight must be positive"));
            }
            let start = channel_weights.len();
            channel_weights.extend(std::iter::repeat(pair.weight).take(pair.fixed.channels()));
            pair_spans.push((start, channel_weights.len()));
        }
        if let Some(m) = mask {
            if m.geometry().size() != reference.size() || m.channels() != 1 {
                return Err(GreedyError::input(
                    "gradient mask must be a scalar image in the reference space",
                ));
            }
        }

        // Default factors: 1 at the finest level, doubling towards the
        // coarsest.
        let factors: Vec<usize> = (0..num_levels)
            .map(|level| 1usize << (num_levels - 1 - level))
            .collect();

        let fixed_full = stack_channels(pairs, true, channel_weights.len());
        let moving_full = stack_channels(pairs, false, channel_weights.len());

        let mut levels = Vec::with_capacity(num_levels);
        for &factor in &factors {
            let mut fixed = downsample_average(&fixed_full, factor);
            let mut moving = downsample_average(&moving_full, factor);
            if let Some(amplitude) = noise_amplitude {
                inject_noise(&mut fixed, amplitude, 0x9e3779b97f4a7c15);
                inject_noise(&mut moving, amplitude, 0xbf58476d1ce4e5b9);
            }
            let mask = mask.map(|m| downsample_average(m, factor));
            levels.push(PyramidLevel {
                fixed,
                moving,
                mask,
            });
        }

        Ok(Self {
            levels,
            channel_weights,
            pair_spans,
            factors,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &PyramidLevel<D> {
        &self.levels[level]
    }

    /// Geometry of the fixed composite at a level.
    pub fn reference_space(&self, level: usize) -> &Geometry<D> {
        self.levels[level].fixed.geometry()
    }

    /// Geometry of the moving composite at a level.
    pub fn moving_reference_space(&self, level: usize) -> &Geometry<D> {
        self.levels[level].moving.geometry()
    }

    pub fn channel_weights(&self) -> &[f64] {
        &self.channel_weights
    }

    pub fn downsampling_factor(&self, level: usize) -> usize {
        self.factors[level]
    }

    /// Fold per-channel metric values into per-pair totals.
    pub fn fold_channels_to_pairs(&self, per_channel: &[f64]) -> Vec<f64> {
        self.pair_spans
            .iter()
            .map(|&(a, b)| per_channel[a..b].iter().sum())
            .collect()
    }

    /// Per-axis smoothing sigma at a level, in voxel units of that level.
    ///
    /// A voxel-unit spec is the same count at every level; a millimeter spec
    /// is divided by the level spacing per axis.
    pub fn sigma_in_voxel_units(&self, level: usize, spec: &SigmaSpec) -> [f64; D] {
        let spacing = self.reference_space(level).spacing().to_array();
        let mut out = [0.0; D];
        for d in 0..D {
            out[d] = if spec.physical_units {
                spec.sigma / spacing[d]
            } else {
                spec.sigma
            };
        }
        out
    }
}

fn stack_channels<const D: usize>(
    pairs: &[ImagePair<D>],
    fixed_side: bool,
    total_channels: usize,
) -> Image<D> {
    let geom = if fixed_side {
        pairs[0].fixed.geometry().clone()
    } else {
        pairs[0].moving.geometry().clone()
    };
    let n = geom.num_voxels();
    let mut out = Image::<D>::new(geom, total_channels);
    let mut channel = 0;
    for pair in pairs {
        let src = if fixed_side { &pair.fixed } else { &pair.moving };
        let k = src.channels();
        for voxel in 0..n {
            let frame = src.voxel(voxel);
            out.voxel_mut(voxel)[channel..channel + k].copy_from_slice(frame);
        }
        channel += k;
    }
    out
}

/// splitmix64, mapped to [-1, 1].
fn hash_unit(mut z: u64) -> f64 {
    z = z.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^= z >> 31;
    (z as f64 / u64::MAX as f64) * 2.0 - 1.0
}

fn inject_noise<const D: usize>(image: &mut Image<D>, relative_amplitude: f64, salt: u64) {
    let channels = image.channels();
    let amplitudes: Vec<f64> = (0..channels)
        .map(|c| {
            let (min, max) = image.channel_min_max(c);
            relative_amplitude * (max - min) as f64
        })
        .collect();
    for (i, v) in image.data_mut().iter_mut().enumerate() {
        let amp = amplitudes[i % channels];
        if amp > 0.0 {
            *v += (amp * hash_unit(salt ^ i as u64)) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greedyreg_core::Geometry;

    fn pair_8x8() -> ImagePair<2> {
        let geom = Geometry::<2>::unit([8, 8]);
        let mut fixed = Image::<2>::new(geom.clone(), 1);
        for (i, v) in fixed.data_mut().iter_mut().enumerate() {
            *v = (i % 7) as f32;
        }
        let moving = fixed.clone();
        ImagePair {
            fixed,
            moving,
            weight: 1.0,
        }
    }

    #[test]
    fn test_default_factors() {
        let pyramid = Pyramid::build(&[pair_8x8()], None, 3, None).unwrap();
        assert_eq!(pyramid.downsampling_factor(0), 4);
        assert_eq!(pyramid.downsampling_factor(1), 2);
        assert_eq!(pyramid.downsampling_factor(2), 1);
        assert_eq!(pyramid.reference_space(2).size(), [8, 8]);
        assert_eq!(pyramid.reference_space(0).size(), [2, 2]);
    }

    #[test]
    fn test_channel_weights_follow_pairs() {
        let mut pair2 = pair_8x8();
        pair2.weight = 2.5;
        let pyramid = Pyramid::build(&[pair_8x8(), pair2], None, 1, None).unwrap();
        assert_eq!(pyramid.channel_weights(), &[1.0, 2.5]);
        assert_eq!(pyramid.fold_channels_to_pairs(&[3.0, 4.0]), vec![3.0, 4.0]);
    }

    #[test]
    fn test_noise_is_deterministic_and_small() {
        let a = Pyramid::build(&[pair_8x8()], None, 1, Some(1e-3)).unwrap();
        let b = Pyramid::build(&[pair_8x8()], None, 1, Some(1e-3)).unwrap();
        assert_eq!(a.level(0).fixed.data(), b.level(0).fixed.data());
        let clean = Pyramid::build(&[pair_8x8()], None, 1, None).unwrap();
        let max_delta = a
            .level(0)
            .fixed
            .data()
            .iter()
            .zip(clean.level(0).fixed.data())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max);
        assert!(max_delta > 0.0);
        assert!(max_delta <= 6.0 * 1e-3 + 1e-6);
    }

    #[test]
    fn test_mismatched_pair_rejected() {
        let geom_a = Geometry::<2>::unit([8, 8]);
        let geom_b = Geometry::<2>::unit([6, 6]);
        let pair_bad = ImagePair {
            fixed: Image::<2>::new(geom_b, 1),
            moving: Image::<2>::new(geom_a, 1),
            weight: 1.0,
        };
        let err = Pyramid::build(&[pair_8x8(), pair_bad], None, 1, None).unwrap_err();
        assert!(matches!(err, GreedyError::GeometryMismatch { .. }));
    }

    #[test]
    fn test_sigma_units() {
        let geom = Geometry::<2>::new(
            [8, 8],
            greedyreg_core::Point::origin(),
            greedyreg_core::Spacing::new([2.0, 2.0]),
            greedyreg_core::Direction::identity(),
        );
        let pair = ImagePair {
            fixed: Image::<2>::new(geom.clone(), 1),
            moving: Image::<2>::new(geom, 1),
            weight: 1.0,
        };
        let pyramid = Pyramid::build(&[pair], None, 2, None).unwrap();
        // Voxel units: unchanged at every level.
        let vox = pyramid.sigma_in_voxel_units(0, &SigmaSpec::voxels(1.5));
        assert_eq!(vox, [1.5, 1.5]);
        // Physical units: level 0 spacing is 4.0mm.
        let mm = pyramid.sigma_in_voxel_units(0, &SigmaSpec::millimeters(8.0));
        assert_eq!(mm, [2.0, 2.0]);
    }
}
