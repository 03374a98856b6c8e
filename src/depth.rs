//! # Depth maps
//!
//! Conversion of disparity into absolute depth with `depth = f_pixel * baseline / disparity`.
//! Depth is in the unit the baseline is given in.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use crate::disparity::DisparityMap;
use crate::frame::GrayFloatImage;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Dense depth co-located with the disparity map it was computed from. Cells without a valid
/// disparity hold zero.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthMap {
    data: GrayFloatImage,
    focal_pixels: f64,
    baseline: f64
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl DepthMap {
    pub fn from_disparity(disparity: &DisparityMap, focal_pixels: f64, baseline: f64) -> Self {
        let (w, h) = (disparity.width(), disparity.height());
        let mut data = GrayFloatImage::new(w, h);

        for y in 0..h {
            for x in 0..w {
                if let Some(d) = disparity.get(x, y) {
                    data.put(x, y, depth_from_disparity(d, focal_pixels, baseline));
                }
            }
        }

        DepthMap {
            data,
            focal_pixels,
            baseline
        }
    }

    pub fn width(&self) -> usize {
        self.data.width()
    }

    pub fn height(&self) -> usize {
        self.data.height()
    }

    pub fn focal_pixels(&self) -> f64 {
        self.focal_pixels
    }

    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    /// Depth at the given pixel, `None` where the disparity was invalid.
    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        let z = self.data.get(x, y);

        if z > 0.0 { Some(z) } else { None }
    }

    /// Depth at the given pixel, zero where the disparity was invalid.
    pub fn depth_at(&self, x: usize, y: usize) -> f32 {
        self.data.get(x, y)
    }

    pub fn valid_count(&self) -> usize {
        self.data.as_slice().iter().filter(|&&z| z > 0.0).count()
    }

    pub fn as_image(&self) -> &GrayFloatImage {
        &self.data
    }
}

/// `f_pixel * baseline / d`, zero unless `d` is positive.
pub fn depth_from_disparity(d: f32, focal_pixels: f64, baseline: f64) -> f32 {
    if d > 0.0 {
        (focal_pixels * baseline / d as f64) as f32
    }
    else {
        0.0
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn depth_is_inverse_to_disparity() {
        let mut disp = DisparityMap::new(3, 1);
        disp.put(0, 0, 10.0);
        disp.put(1, 0, 20.0);

        let depth = DepthMap::from_disparity(&disp, 500.0, 15.0);

        assert_relative_eq!(depth.get(0, 0).unwrap(), 750.0);
        assert_relative_eq!(depth.get(1, 0).unwrap(), 375.0);
        assert_eq!(depth.get(2, 0), None);
        assert_eq!(depth.depth_at(2, 0), 0.0);
        assert_eq!(depth.valid_count(), 2);
    }

    #[test]
    fn non_positive_disparity_has_no_depth() {
        assert_eq!(depth_from_disparity(0.0, 500.0, 15.0), 0.0);
        assert_eq!(depth_from_disparity(-3.0, 500.0, 15.0), 0.0);
    }
}
