//! Shared helpers for the integration tests

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use stereo_depth::config::{CameraParams, Params, SgbmParams};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

pub const WIDTH: u32 = 96;
pub const HEIGHT: u32 = 48;

/// Disparity between the synthetic views, in pixels.
pub const SHIFT: u32 = 6;

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

/// A rectified pair of a random grey texture, the right view sees every point `SHIFT` pixels
/// further left than the left view.
pub fn shifted_pair(seed: u64) -> (RgbImage, RgbImage) {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let scene = RgbImage::from_fn(WIDTH + SHIFT, HEIGHT, |_, _| {
        let v = rng.gen();
        Rgb([v, v, v])
    });

    let left = RgbImage::from_fn(WIDTH, HEIGHT, |x, y| *scene.get_pixel(x, y));
    let right = RgbImage::from_fn(WIDTH, HEIGHT, |x, y| *scene.get_pixel(x + SHIFT, y));

    (left, right)
}

pub fn camera() -> CameraParams {
    CameraParams {
        target_width: WIDTH,
        ..Default::default()
    }
}

/// Small search range and window suited to the synthetic pair.
pub fn params() -> Params {
    Params {
        sgbm: SgbmParams {
            num_disparities: 16,
            block_size: 5,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Size of the two layer scene.
pub const LAYERED_WIDTH: u32 = 320;
pub const LAYERED_HEIGHT: u32 = 240;

/// Disparities of the background and of the foreground rectangle in the two layer scene.
pub const BACKGROUND_SHIFT: u32 = 4;
pub const FOREGROUND_SHIFT: u32 = 16;

/// A pair of two fronto-parallel layers of random grey blocks. The foreground rectangle sits
/// closer to the cameras than the background, so the correspondences span two depths.
pub fn layered_pair(seed: u64) -> (RgbImage, RgbImage) {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let background = blocks(&mut rng, LAYERED_WIDTH + FOREGROUND_SHIFT, LAYERED_HEIGHT);
    let foreground = blocks(&mut rng, LAYERED_WIDTH + FOREGROUND_SHIFT, LAYERED_HEIGHT);

    let in_foreground = |x: u32, y: u32| (110..230).contains(&x) && (60..180).contains(&y);

    let left = RgbImage::from_fn(LAYERED_WIDTH, LAYERED_HEIGHT, |x, y| {
        if in_foreground(x, y) { foreground(x, y) } else { background(x, y) }
    });
    let right = RgbImage::from_fn(LAYERED_WIDTH, LAYERED_HEIGHT, |x, y| {
        if in_foreground(x + FOREGROUND_SHIFT, y) {
            foreground(x + FOREGROUND_SHIFT, y)
        }
        else {
            background(x + BACKGROUND_SHIFT, y)
        }
    });

    (left, right)
}

/// Texture of 10 pixel square cells, each a random grey.
fn blocks(rng: &mut Xoshiro256PlusPlus, width: u32, height: u32) -> impl Fn(u32, u32) -> Rgb<u8> {
    const CELL: u32 = 10;
    let cols = (width + CELL - 1) / CELL;
    let rows = (height + CELL - 1) / CELL;
    let greys: Vec<u8> = (0..cols * rows).map(|_| rng.gen()).collect();

    move |x, y| {
        let v = greys[((y / CELL) * cols + x / CELL) as usize];
        Rgb([v, v, v])
    }
}
