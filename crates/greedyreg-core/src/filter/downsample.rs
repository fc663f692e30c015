//! Integer-factor downsampling by block averaging.

use rayon::prelude::*;

use crate::image::Image;

/// Downsample by averaging `factor`-sized blocks along every axis.
///
/// Blocks at the far faces may be clipped; their averages use only the
/// voxels that exist. The output geometry comes from
/// [`crate::geometry::Geometry::downsample`].
pub fn downsample_average<const D: usize>(src: &Image<D>, factor: usize) -> Image<D> {
    assert!(factor >= 1);
    if factor == 1 {
        return src.clone();
    }

    let src_geom = src.geometry().clone();
    let src_size = src_geom.size();
    let src_strides = src_geom.strides();
    let out_geom = src_geom.downsample(factor);
    let out_size = out_geom.size();
    let comps = src.channels();
    let mut out = Image::<D>::new(out_geom.clone(), comps);

    let n = out_geom.num_voxels();
    let chunk = n.div_ceil(rayon::current_num_threads().max(1)).max(1);
    let src_data = src.data();

    out.data_mut()
        .par_chunks_mut(chunk * comps)
        .enumerate()
        .for_each(|(c, slab)| {
            let first = c * chunk;
            let mut acc = vec![0.0f64; comps];
            for (local, frame) in slab.chunks_exact_mut(comps).enumerate() {
                let voxel = first + local;
                let mut out_index = [0usize; D];
                let mut rem = voxel;
                for d in 0..D {
                    out_index[d] = rem % out_size[d];
                    rem /= out_size[d];
                }

                acc.fill(0.0);
                let mut count = 0usize;
                // Walk the source block with an odometer over block-local
                // coordinates.
                let mut block = [0usize; D];
                'blocks: loop {
                    let mut offset = 0usize;
                    let mut inside = true;
                    for d in 0..D {
                        let s = out_index[d] * factor + block[d];
                        if s >= src_size[d] {
                            inside = false;
                            break;
                        }
                        offset += s * src_strides[d];
                    }
                    if inside {
                        let frame_src = &src_data[offset * comps..(offset + 1) * comps];
                        for (a, &v) in acc.iter_mut().zip(frame_src) {
                            *a += v as f64;
                        }
                        count += 1;
                    }
                    for d in 0..D {
                        block[d] += 1;
                        if block[d] < factor {
                            continue 'blocks;
                        }
                        block[d] = 0;
                    }
                    break;
                }

                let norm = 1.0 / count.max(1) as f64;
                for (o, &a) in frame.iter_mut().zip(acc.iter()) {
                    *o = (a * norm) as f32;
                }
            }
        });

    out
}
