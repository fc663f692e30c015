//! Physical-space points.
//!
//! A point is an absolute position in one of the two physical conventions
//! the engine juggles: LPS (internal, what image geometries produce) or RAS
//! (what persisted matrices use). Switching conventions and moving points by
//! displacement-field samples both live here, so solver and reslicer code
//! never touches raw sign flips or f32/f64 component mixing.

use nalgebra::Point as NaPoint;
use super::Vector;

/// A position in D-dimensional physical space.
///
/// Differences between points are [`Vector`]s; offsets stored in
/// displacement fields are plain `f32` component arrays and go through
/// [`Point::displaced_by`] / [`Point::offset_to`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point<const D: usize>(pub NaPoint<f64, D>);

impl<const D: usize> Point<D> {
    pub fn new(coords: [f64; D]) -> Self {
        Self(NaPoint::from(coords))
    }

    pub fn origin() -> Self {
        Self(NaPoint::origin())
    }

    /// The same location expressed in the other physical convention.
    ///
    /// LPS and RAS differ by negation of the first two axes, so this map is
    /// its own inverse.
    pub fn flip_convention(&self) -> Self {
        let mut out = *self;
        if D >= 1 {
            out.0.coords[0] = -out.0.coords[0];
        }
        if D >= 2 {
            out.0.coords[1] = -out.0.coords[1];
        }
        out
    }

    /// This point moved by one displacement-field sample.
    pub fn displaced_by(&self, offset: &[f32]) -> Self {
        debug_assert_eq!(offset.len(), D);
        let mut out = *self;
        for d in 0..D {
            out.0.coords[d] += offset[d] as f64;
        }
        out
    }

    /// The displacement carrying this point onto `target`, in the
    /// component type displacement fields store.
    pub fn offset_to(&self, target: &Point<D>) -> [f32; D] {
        let mut out = [0.0f32; D];
        for d in 0..D {
            out[d] = (target.0.coords[d] - self.0.coords[d]) as f32;
        }
        out
    }

    pub fn to_array(&self) -> [f64; D] {
        let mut out = [0.0; D];
        for d in 0..D {
            out[d] = self.0.coords[d];
        }
        out
    }
}

impl<const D: usize> std::ops::Index<usize> for Point<D> {
    type Output = f64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0.coords[index]
    }
}

impl<const D: usize> std::ops::IndexMut<usize> for Point<D> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0.coords[index]
    }
}

impl<const D: usize> std::ops::Sub for Point<D> {
    type Output = Vector<D>;

    fn sub(self, other: Self) -> Self::Output {
        Vector(self.0.coords - other.0.coords)
    }
}

impl<const D: usize> std::ops::Add<Vector<D>> for Point<D> {
    type Output = Self;

    fn add(self, vector: Vector<D>) -> Self::Output {
        Self(self.0 + vector.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_convention_is_involution() {
        let p = Point::<3>::new([4.0, -7.0, 2.5]);
        let ras = p.flip_convention();
        assert_eq!(ras.to_array(), [-4.0, 7.0, 2.5]);
        assert_eq!(ras.flip_convention(), p);
    }

    #[test]
    fn test_flip_convention_2d_touches_both_axes() {
        let p = Point::<2>::new([1.0, 2.0]);
        assert_eq!(p.flip_convention().to_array(), [-1.0, -2.0]);
    }

    #[test]
    fn test_displaced_by_field_sample() {
        let p = Point::<2>::new([10.0, -4.0]);
        let q = p.displaced_by(&[0.5f32, -1.5f32]);
        assert_eq!(q.to_array(), [10.5, -5.5]);
    }

    #[test]
    fn test_offset_to_recovers_displacement() {
        let p = Point::<3>::new([1.0, 2.0, 3.0]);
        let q = p.displaced_by(&[2.0f32, -1.0, 0.25]);
        assert_eq!(p.offset_to(&q), [2.0, -1.0, 0.25]);
        // Difference of points is a vector with the same components.
        let v = q - p;
        assert_eq!(v.to_array(), [2.0, -1.0, 0.25]);
    }
}
