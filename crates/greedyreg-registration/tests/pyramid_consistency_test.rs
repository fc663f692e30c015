use greedyreg_core::filter::resample_field_identity;
use greedyreg_core::{Field, Geometry, Image};
use greedyreg_registration::metric::{Metric, MetricWorkspace, Ssd};
use greedyreg_registration::pyramid::{ImagePair, Pyramid};

fn wavy(size: usize) -> Image<2> {
    let geom = Geometry::<2>::unit([size, size]);
    let mut img = Image::<2>::new(geom, 1);
    for y in 0..size {
        for x in 0..size {
            let v = (x as f32 * 0.31).sin() + (y as f32 * 0.17).cos();
            img.set([x, y], 0, v);
        }
    }
    img
}

/// Stepping from a coarse level to the next finer one with the resampled,
/// doubled field must keep the (per-voxel mean) metric consistent up to
/// resampling error.
#[test]
fn test_level_step_preserves_metric() {
    let fixed = wavy(32);
    let mut moving = wavy(32);
    for v in moving.data_mut().iter_mut() {
        *v = 0.9 * *v + 0.05;
    }
    let pair = ImagePair {
        fixed,
        moving,
        weight: 1.0,
    };
    let pyramid = Pyramid::build(&[pair], None, 2, None).unwrap();

    // A smooth non-trivial field at the coarse level.
    let coarse_geom = pyramid.reference_space(0).clone();
    let mut u_coarse = Field::<2>::new(coarse_geom.clone());
    for i in 0..coarse_geom.num_voxels() {
        let idx = coarse_geom.index_of(i);
        u_coarse.set_vec(
            i,
            [
                0.3 * (idx[0] as f32 * 0.2).sin(),
                0.2 * (idx[1] as f32 * 0.15).cos(),
            ],
        );
    }

    let mut ws0 = MetricWorkspace::new(&coarse_geom);
    let coarse_total = Ssd
        .dense(pyramid.level(0), pyramid.channel_weights(), &u_coarse, &mut ws0, false)
        .unwrap()
        .total;
    let coarse_mean = coarse_total / coarse_geom.num_voxels() as f64;

    // Step down: identity-resample onto the finer grid, scale by 2.
    let fine_geom = pyramid.reference_space(1).clone();
    let mut u_fine = Field::<2>::new(fine_geom.clone());
    resample_field_identity(&u_coarse, &mut u_fine);
    u_fine.scale_in_place(2.0);

    let mut ws1 = MetricWorkspace::new(&fine_geom);
    let fine_total = Ssd
        .dense(pyramid.level(1), pyramid.channel_weights(), &u_fine, &mut ws1, false)
        .unwrap()
        .total;
    let fine_mean = fine_total / fine_geom.num_voxels() as f64;

    // Same alignment seen at two resolutions: the per-voxel metric agrees
    // up to downsampling/resampling error.
    let scale = coarse_mean.abs().max(fine_mean.abs()).max(1e-12);
    assert!(
        ((coarse_mean - fine_mean) / scale).abs() < 0.35,
        "coarse mean {} vs fine mean {}",
        coarse_mean,
        fine_mean
    );
}
