//! # Keypoints and descriptor matching
//!
//! Oriented FAST corners on an image pyramid, described by a rotated binary descriptor and matched
//! across the stereo pair with Lowe's ratio test.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::cmp::Ordering;

use image::{imageops, GrayImage};
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use nalgebra::Point2;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

use crate::config::FeatureParams;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Number of bytes in a descriptor (256 binary tests).
pub const DESCRIPTOR_BYTES: usize = 32;

/// Radius of the patch used to orient a keypoint.
const PATCH_RADIUS: i32 = 15;

/// Sample offsets are drawn from `[-PATTERN_RADIUS, PATTERN_RADIUS]`, so rotated samples stay
/// inside the orientation patch.
const PATTERN_RADIUS: i32 = 10;

/// Keypoints closer than this to the image edge are discarded.
const BORDER: u32 = PATCH_RADIUS as u32 + 1;

/// Smoothing applied before sampling binary tests.
const DESCRIPTOR_SIGMA: f32 = 2.0;

const PATTERN_SEED: u64 = 0x0b1e_f5a3_91c2_d7e4;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// 256 bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

/// A located, oriented and described feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Position in full resolution pixel coordinates.
    pub x: f32,
    pub y: f32,

    /// Orientation in radians.
    pub angle: f32,

    /// Pyramid level the keypoint was detected on.
    pub level: usize,

    /// FAST corner score.
    pub response: f32,

    pub descriptor: Descriptor
}

/// A left keypoint paired with its accepted right match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub left: Keypoint,
    pub right: Keypoint,

    /// Hamming distance between the two descriptors.
    pub distance: u32
}

/// Ordered matches surviving the ratio test.
pub type CorrespondenceSet = Vec<Correspondence>;

/// Oriented FAST detector and rotated binary descriptor extractor.
pub struct FeatureDetector {
    params: FeatureParams,
    pattern: Vec<[i32; 4]>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Descriptor {
    /// Hamming distance to another descriptor.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl Keypoint {
    pub fn point(&self) -> Point2<f64> {
        Point2::new(self.x as f64, self.y as f64)
    }
}

impl Correspondence {
    /// The `(left, right)` positions of the pair.
    pub fn points(&self) -> (Point2<f64>, Point2<f64>) {
        (self.left.point(), self.right.point())
    }
}

impl FeatureDetector {
    pub fn new(params: FeatureParams) -> Self {
        Self {
            params,
            pattern: sampling_pattern()
        }
    }

    /// Detect and describe keypoints, strongest first.
    ///
    /// The order is fully determined by the image: ties in response are broken by level and
    /// position.
    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let (width, height) = image.dimensions();
        let mut keypoints = Vec::new();
        let mut scale = 1.0f32;

        for level in 0..self.params.levels {
            let level_width = (width as f32 / scale).round() as u32;
            let level_height = (height as f32 / scale).round() as u32;

            if level_width <= 2 * BORDER || level_height <= 2 * BORDER {
                break;
            }

            let level_img = if level == 0 {
                image.clone()
            }
            else {
                imageops::resize(image, level_width, level_height, imageops::FilterType::Triangle)
            };

            // Level to full resolution coordinates
            let sx = width as f32 / level_width as f32;
            let sy = height as f32 / level_height as f32;

            let corners = suppress_non_maxima(
                corners_fast9(&level_img, self.params.fast_threshold),
                level_width,
                level_height
            );
            let smoothed = gaussian_blur_f32(&level_img, DESCRIPTOR_SIGMA);

            for c in corners {
                if c.x < BORDER
                    || c.y < BORDER
                    || c.x + BORDER >= level_width
                    || c.y + BORDER >= level_height
                {
                    continue;
                }

                let angle = orientation(&level_img, c.x, c.y);

                keypoints.push(Keypoint {
                    x: c.x as f32 * sx,
                    y: c.y as f32 * sy,
                    angle,
                    level,
                    response: c.score,
                    descriptor: describe(&smoothed, c.x, c.y, angle, &self.pattern)
                });
            }

            scale *= self.params.scale_factor;
        }

        keypoints.sort_by(|a, b| {
            b.response
                .partial_cmp(&a.response)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.level.cmp(&b.level))
                .then_with(|| a.y.partial_cmp(&b.y).unwrap_or(Ordering::Equal))
                .then_with(|| a.x.partial_cmp(&b.x).unwrap_or(Ordering::Equal))
        });
        keypoints.truncate(self.params.max_features);

        keypoints
    }
}

/// Match every left keypoint to its nearest right keypoint, keeping the match only if
/// `best < ratio * second_best`.
///
/// Left keypoints whose two nearest neighbours cannot both be found are dropped. Equal distances
/// resolve to the lowest right index.
pub fn match_descriptors(left: &[Keypoint], right: &[Keypoint], ratio: f32) -> CorrespondenceSet {
    if right.len() < 2 {
        return Vec::new();
    }

    left.par_iter()
        .filter_map(|l| {
            let mut best = (usize::MAX, u32::MAX);
            let mut second = u32::MAX;

            for (idx, r) in right.iter().enumerate() {
                let dist = l.descriptor.distance(&r.descriptor);

                if dist < best.1 {
                    second = best.1;
                    best = (idx, dist);
                }
                else if dist < second {
                    second = dist;
                }
            }

            if (best.1 as f32) < ratio * second as f32 {
                Some(Correspondence {
                    left: *l,
                    right: right[best.0],
                    distance: best.1
                })
            }
            else {
                None
            }
        })
        .collect()
}

/// Keep only corners whose score is a strict maximum of their 3x3 neighbourhood, earlier corners
/// in scan order winning equal scores.
fn suppress_non_maxima(corners: Vec<Corner>, width: u32, height: u32) -> Vec<Corner> {
    let mut scores = vec![0.0f32; (width * height) as usize];
    for c in &corners {
        scores[(c.y * width + c.x) as usize] = c.score;
    }

    corners
        .into_iter()
        .filter(|c| {
            let own = c.y * width + c.x;

            for ny in c.y.saturating_sub(1)..(c.y + 2).min(height) {
                for nx in c.x.saturating_sub(1)..(c.x + 2).min(width) {
                    let idx = ny * width + nx;
                    if idx == own {
                        continue;
                    }

                    let other = scores[idx as usize];
                    if other > c.score || (other == c.score && idx < own) {
                        return false;
                    }
                }
            }

            true
        })
        .collect()
}

/// Intensity centroid orientation over a circular patch.
fn orientation(image: &GrayImage, cx: u32, cy: u32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;

    for dy in -PATCH_RADIUS..=PATCH_RADIUS {
        for dx in -PATCH_RADIUS..=PATCH_RADIUS {
            if dx * dx + dy * dy > PATCH_RADIUS * PATCH_RADIUS {
                continue;
            }

            let px = (cx as i32 + dx) as u32;
            let py = (cy as i32 + dy) as u32;
            let intensity = image.get_pixel(px, py)[0] as f32;

            m10 += dx as f32 * intensity;
            m01 += dy as f32 * intensity;
        }
    }

    m01.atan2(m10)
}

/// Evaluate the rotated binary tests around a keypoint.
fn describe(smoothed: &GrayImage, cx: u32, cy: u32, angle: f32, pattern: &[[i32; 4]]) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let sample = |x: i32, y: i32| -> u8 {
        let rx = (cos * x as f32 - sin * y as f32).round() as i32;
        let ry = (sin * x as f32 + cos * y as f32).round() as i32;
        smoothed.get_pixel((cx as i32 + rx) as u32, (cy as i32 + ry) as u32)[0]
    };

    let mut bytes = [0u8; DESCRIPTOR_BYTES];
    for (bit, p) in pattern.iter().enumerate() {
        if sample(p[0], p[1]) < sample(p[2], p[3]) {
            bytes[bit / 8] |= 1 << (bit % 8);
        }
    }

    Descriptor(bytes)
}

/// The fixed set of point pairs compared by the descriptor.
fn sampling_pattern() -> Vec<[i32; 4]> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(PATTERN_SEED);

    (0..DESCRIPTOR_BYTES * 8)
        .map(|_| {
            let mut pair = [0i32; 4];
            for v in pair.iter_mut() {
                *v = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            }
            pair
        })
        .collect()
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
