//! # Stereo frames and float images
//!
//! Dense floating point grids used for disparity and depth, and the stereo frame handed to the
//! dense correspondence engine.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{imageops, DynamicImage, GrayImage, RgbImage};

use crate::error::*;
use crate::rectify::RectifyingHomographyPair;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A row-major grid of `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayFloatImage {
    buffer: Vec<f32>,
    width: usize,
    height: usize
}

/// How the images of a `StereoFrame` relate to the captured pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Alignment {
    /// Both images were warped by the given rectifying transforms.
    Rectified(RectifyingHomographyPair),

    /// The captured images are used unchanged, either because rectification was skipped on
    /// request or because it fell back after a recoverable failure.
    Raw
}

/// A stereo pair ready for dense matching.
#[derive(Debug, Clone)]
pub struct StereoFrame {
    pub left: GrayImage,
    pub right: GrayImage,

    /// Colour left image, used as the edge guide for refinement and to colour the point cloud.
    pub guide: RgbImage,

    pub alignment: Alignment
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl GrayFloatImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, 0.0)
    }

    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        GrayFloatImage {
            buffer: vec![value; width * height],
            width,
            height
        }
    }

    /// Wrap an existing row-major buffer. Returns `None` if the length does not match.
    pub fn from_vec(width: usize, height: usize, buffer: Vec<f32>) -> Option<Self> {
        if buffer.len() != width * height {
            return None;
        }

        Some(GrayFloatImage { buffer, width, height })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.buffer[self.width * y + x]
    }

    pub fn put(&mut self, x: usize, y: usize, val: f32) {
        self.buffer[self.width * y + x] = val;
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.buffer
    }

    /// Iterate over `(x, y, value)` in scan order.
    pub fn enumerate(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        let width = self.width;
        self.buffer
            .iter()
            .enumerate()
            .map(move |(i, &v)| (i % width, i / width, v))
    }
}

impl StereoFrame {
    /// Build a frame from a colour pair, deriving the grayscale images used for matching.
    pub fn from_color(left: &RgbImage, right: &RgbImage, alignment: Alignment) -> Result<Self> {
        check_dimensions(left.dimensions(), right.dimensions())?;

        Ok(StereoFrame {
            left: imageops::grayscale(left),
            right: imageops::grayscale(right),
            guide: left.clone(),
            alignment
        })
    }

    pub fn width(&self) -> u32 {
        self.left.width()
    }

    pub fn height(&self) -> u32 {
        self.left.height()
    }

    pub fn is_rectified(&self) -> bool {
        matches!(self.alignment, Alignment::Rectified(_))
    }
}

/// Fail with `ImageDimensionMismatch` unless both dimensions agree.
pub fn check_dimensions(left: (u32, u32), right: (u32, u32)) -> Result<()> {
    if left != right {
        return Err(Error::ImageDimensionMismatch { left, right });
    }

    Ok(())
}

/// Resize an image to the processing width, preserving its aspect ratio.
pub fn resize_to_width(img: &DynamicImage, target_width: u32) -> RgbImage {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();

    if w == target_width {
        return rgb;
    }

    let scale = target_width as f64 / w as f64;
    let target_height = ((h as f64 * scale) as u32).max(1);

    imageops::resize(&rgb, target_width, target_height, imageops::FilterType::Triangle)
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
