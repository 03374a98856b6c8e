//! # General disparity objects
//!
//! This module provides the disparity trait and map shared by the dense matcher and the depth
//! reconstruction.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::GrayImage;

use crate::error::*;
use crate::frame::{GrayFloatImage, StereoFrame};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// A floating point disparity map in pixel units.
///
/// Cells without a confident correspondence hold [`DisparityMap::INVALID`]. Only strictly positive
/// values are valid disparities.
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityMap {
    data: GrayFloatImage,
    pub max_disp: Option<f32>,
    pub min_disp: Option<f32>
}

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

pub trait DisparityAlgorithm {
    /// Compute the disparity map of the given stereo frame.
    fn compute(&self, frame: &StereoFrame) -> Result<DisparityMap>;
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl DisparityMap {
    /// Marker stored in cells without a disparity.
    pub const INVALID: f32 = -1.0;

    /// An entirely invalid map.
    pub fn new(width: usize, height: usize) -> Self {
        DisparityMap {
            data: GrayFloatImage::filled(width, height, Self::INVALID),
            min_disp: None,
            max_disp: None
        }
    }

    /// Wrap a grid of disparities, recording the range of the valid ones.
    pub fn from_image(data: GrayFloatImage) -> Self {
        let mut map = DisparityMap {
            data,
            min_disp: None,
            max_disp: None
        };
        map.update_range();
        map
    }

    pub fn width(&self) -> usize {
        self.data.width()
    }

    pub fn height(&self) -> usize {
        self.data.height()
    }

    /// The disparity at the given pixel, `None` if the cell is invalid.
    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        let d = self.data.get(x, y);

        if d > 0.0 && d.is_finite() { Some(d) } else { None }
    }

    /// Store a disparity, non-positive values mark the cell invalid.
    pub fn put(&mut self, x: usize, y: usize, val: f32) {
        let val = if val > 0.0 && val.is_finite() { val } else { Self::INVALID };
        self.data.put(x, y, val);
    }

    pub fn valid_count(&self) -> usize {
        self.data.as_slice().iter().filter(|&&d| d > 0.0 && d.is_finite()).count()
    }

    /// The underlying grid, invalid cells hold [`DisparityMap::INVALID`].
    pub fn as_image(&self) -> &GrayFloatImage {
        &self.data
    }

    /// Recompute `min_disp` and `max_disp` over the valid cells.
    pub fn update_range(&mut self) {
        let mut range: Option<(f32, f32)> = None;

        for &d in self.data.as_slice() {
            if d > 0.0 && d.is_finite() {
                range = Some(match range {
                    Some((lo, hi)) => (lo.min(d), hi.max(d)),
                    None => (d, d)
                });
            }
        }

        self.min_disp = range.map(|r| r.0);
        self.max_disp = range.map(|r| r.1);
    }

    /// Converts the map into a Luma8 image, invalid cells are black.
    pub fn to_luma(&self) -> GrayImage {
        self.render(1.0)
    }

    /// Converts the map to a normalised GrayImage.
    ///
    /// Normalises by the maximum observed disparity in the map. If the maximum disparity is not
    /// set then the function is equivalent to `.to_luma()`.
    pub fn to_luma_normalised(&self) -> GrayImage {
        let mult = match self.max_disp {
            Some(d) => 255.0 / d,
            None => 1.0
        };

        self.render(mult)
    }

    fn render(&self, mult: f32) -> GrayImage {
        let mut new = GrayImage::new(self.data.width() as u32, self.data.height() as u32);

        for (x, y, val) in self.data.enumerate() {
            let val = (val * mult).max(0.0).min(255.0);
            new.put_pixel(x as u32, y as u32, image::Luma([val as u8]));
        }

        new
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
