//! Deterministic data-parallel helpers for image-wide kernels.
//!
//! Kernels partition the output voxel range into one contiguous chunk per
//! worker and run the chunks on the rayon pool. Each kernel is a barrier:
//! the caller waits for all workers. Per-chunk partial results are collected
//! into an indexed vector and combined serially in chunk order, so repeated
//! runs with the same thread count produce bit-identical results regardless
//! of scheduling. Different thread counts may differ in the last float bits
//! due to associativity.

use std::ops::Range;

use rayon::prelude::*;

/// Split `len` items into one contiguous range per rayon worker.
pub fn chunk_ranges(len: usize) -> Vec<Range<usize>> {
    let workers = rayon::current_num_threads().max(1);
    let chunks = workers.min(len.max(1));
    let base = len / chunks;
    let rem = len % chunks;
    let mut ranges = Vec::with_capacity(chunks);
    let mut start = 0;
    for k in 0..chunks {
        let extent = base + usize::from(k < rem);
        ranges.push(start..start + extent);
        start += extent;
    }
    ranges
}

/// Per-thread accumulator for a parallel reduction.
///
/// One `Partial` is produced per chunk of the voxel range; partials are
/// merged in chunk order on the calling thread.
pub trait Reducer: Sync {
    type Partial: Send;

    /// The neutral accumulator.
    fn identity(&self) -> Self::Partial;

    /// Fold one partial into another.
    fn combine(&self, into: &mut Self::Partial, other: Self::Partial);
}

/// Run `kernel` over each chunk of `0..len` in parallel and reduce the
/// per-chunk partials deterministically.
pub fn reduce_voxels<R, F>(len: usize, reducer: &R, kernel: F) -> R::Partial
where
    R: Reducer,
    F: Fn(Range<usize>) -> R::Partial + Sync + Send,
{
    let partials: Vec<R::Partial> = chunk_ranges(len).into_par_iter().map(kernel).collect();
    let mut acc = reducer.identity();
    for p in partials {
        reducer.combine(&mut acc, p);
    }
    acc
}

/// Split an interleaved buffer (`comps` values per item) into one mutable
/// slab per range. The ranges must be contiguous and ascending, as produced
/// by [`chunk_ranges`].
pub fn split_frames_mut<'a>(
    data: &'a mut [f32],
    ranges: &[Range<usize>],
    comps: usize,
) -> Vec<&'a mut [f32]> {
    let mut out = Vec::with_capacity(ranges.len());
    let mut rest = data;
    for range in ranges {
        let take = range.len() * comps;
        let (head, tail) = rest.split_at_mut(take);
        out.push(head);
        rest = tail;
    }
    debug_assert!(rest.is_empty());
    out
}

/// A [`Reducer`] summing `f64` partials.
pub struct SumReducer;

impl Reducer for SumReducer {
    type Partial = f64;

    fn identity(&self) -> f64 {
        0.0
    }

    fn combine(&self, into: &mut f64, other: f64) {
        *into += other;
    }
}

/// A [`Reducer`] summing fixed-length `f64` vectors element-wise.
pub struct VecSumReducer(pub usize);

impl Reducer for VecSumReducer {
    type Partial = Vec<f64>;

    fn identity(&self) -> Vec<f64> {
        vec![0.0; self.0]
    }

    fn combine(&self, into: &mut Vec<f64>, other: Vec<f64>) {
        for (a, b) in into.iter_mut().zip(other) {
            *a += b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ranges_cover_everything() {
        let ranges = chunk_ranges(103);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges.last().unwrap().end, 103);
        let total: usize = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(total, 103);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_reduce_voxels_sum() {
        let total = reduce_voxels(1000, &SumReducer, |range| {
            range.map(|i| i as f64).sum::<f64>()
        });
        assert_eq!(total, 999.0 * 1000.0 / 2.0);
    }

    #[test]
    fn test_vec_sum_reducer() {
        let r = VecSumReducer(2);
        let out = reduce_voxels(10, &r, |range| {
            let mut p = r.identity();
            for i in range {
                p[0] += 1.0;
                p[1] += i as f64;
            }
            p
        });
        assert_eq!(out[0], 10.0);
        assert_eq!(out[1], 45.0);
    }
}
