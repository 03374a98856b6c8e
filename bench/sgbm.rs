use criterion::{black_box, criterion_group, criterion_main, Criterion};

use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use stereo_depth::{config::{SgbmParams, WlsParams}, prelude::*, sgbm::SemiGlobal};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const SHIFT: u32 = 12;

fn sgbm_bench(c: &mut Criterion) {
    let _ = pretty_env_logger::try_init();

    // Build a textured pair with a constant shift
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
    let scene = RgbImage::from_fn(WIDTH + SHIFT, HEIGHT, |_, _| {
        let v = rng.gen();
        Rgb([v, v, v])
    });
    let left = RgbImage::from_fn(WIDTH, HEIGHT, |x, y| *scene.get_pixel(x, y));
    let right = RgbImage::from_fn(WIDTH, HEIGHT, |x, y| *scene.get_pixel(x + SHIFT, y));

    let frame = StereoFrame::from_color(&left, &right, Alignment::Raw).unwrap();

    // Build disparity alg
    let disp = SemiGlobal::new(
        SgbmParams {
            num_disparities: 64,
            ..Default::default()
        },
        WlsParams::default()
    ).unwrap();

    // Benchmark compute function
    c.bench_function("sgbm 320x240 64 disparities", |b| b.iter(|| disp.compute(black_box(&frame))));
}

criterion_group!(benches, sgbm_bench);
criterion_main!(benches);
