//! # Point clouds
//!
//! Back-projection of a depth map into coloured 3D points with a pinhole camera centred on the
//! image midpoint:
//!
//! ```text
//! x = (i - w / 2) * z / f_pixel
//! y = (j - h / 2) * z / f_pixel
//! ```
//!
//! Points are in camera coordinates, `x` right, `y` down (increasing image row) and `z` forward.
//! Viewers using a right handed, `y` up convention want [`PointCloud::to_viewer_frame`].

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::io::Write;

use image::{Rgb, RgbImage};
use log::debug;
use nalgebra::Point3;

use crate::depth::DepthMap;
use crate::error::*;
use crate::frame::check_dimensions;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloudPoint {
    pub position: Point3<f32>,
    pub color: Rgb<u8>,

    /// Source pixel `(i, j)`.
    pub pixel: (u32, u32)
}

/// Coloured points in image scan order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointCloud {
    points: Vec<CloudPoint>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl PointCloud {
    /// Back-project every pixel with `0 < depth < far_plane`, coloured from `guide`.
    pub fn from_depth(
        depth: &DepthMap,
        guide: &RgbImage,
        focal_pixels: f64,
        far_plane: f64
    ) -> Result<Self> {
        check_dimensions(
            (depth.width() as u32, depth.height() as u32),
            guide.dimensions()
        )?;

        let half_w = depth.width() as f64 / 2.0;
        let half_h = depth.height() as f64 / 2.0;
        let mut points = Vec::new();

        for j in 0..depth.height() {
            for i in 0..depth.width() {
                let z = depth.depth_at(i, j) as f64;
                if !(z > 0.0 && z < far_plane) {
                    continue;
                }

                let x = (i as f64 - half_w) * z / focal_pixels;
                let y = (j as f64 - half_h) * z / focal_pixels;

                points.push(CloudPoint {
                    position: Point3::new(x as f32, y as f32, z as f32),
                    color: *guide.get_pixel(i as u32, j as u32),
                    pixel: (i as u32, j as u32)
                });
            }
        }

        debug!("Back-projected {} points", points.len());

        Ok(PointCloud { points })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[CloudPoint] {
        &self.points
    }

    pub fn iter(&self) -> impl Iterator<Item = &CloudPoint> {
        self.points.iter()
    }

    /// Flip `y` and `z` so up is positive and the camera looks down negative `z`.
    pub fn to_viewer_frame(&self) -> PointCloud {
        let points = self
            .points
            .iter()
            .map(|p| CloudPoint {
                position: Point3::new(p.position.x, -p.position.y, -p.position.z),
                ..*p
            })
            .collect();

        PointCloud { points }
    }

    /// Write the cloud as ASCII PLY, one vertex per line with two decimal coordinates.
    pub fn write_ply<W: Write>(&self, mut writer: W) -> Result<()> {
        write!(
            writer,
            "ply\n\
             format ascii 1.0\n\
             element vertex {}\n\
             property float x\n\
             property float y\n\
             property float z\n\
             property uchar red\n\
             property uchar green\n\
             property uchar blue\n\
             end_header\n",
            self.points.len()
        )?;

        for p in &self.points {
            let [r, g, b] = p.color.0;
            writeln!(
                writer,
                "{:.2} {:.2} {:.2} {} {} {}",
                p.position.x, p.position.y, p.position.z, r, g, b
            )?;
        }

        writer.flush()?;

        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disparity::DisparityMap;
    use approx::assert_relative_eq;

    fn cloud() -> PointCloud {
        let mut disp = DisparityMap::new(4, 2);
        disp.put(0, 0, 10.0);
        disp.put(3, 1, 2.0);
        disp.put(2, 0, 0.5);

        // Depths 50, 250 and 1000
        let depth = DepthMap::from_disparity(&disp, 100.0, 5.0);
        let guide = RgbImage::from_fn(4, 2, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 7]));

        PointCloud::from_depth(&depth, &guide, 100.0, 1000.0).unwrap()
    }

    #[test]
    fn back_projects_valid_pixels_in_scan_order() {
        let cloud = cloud();
        assert_eq!(cloud.len(), 2);

        let first = cloud.points()[0];
        assert_eq!(first.pixel, (0, 0));
        assert_eq!(first.color, Rgb([0, 0, 7]));
        assert_relative_eq!(first.position.x, -1.0);
        assert_relative_eq!(first.position.y, -0.5);
        assert_relative_eq!(first.position.z, 50.0);

        let second = cloud.points()[1];
        assert_eq!(second.pixel, (3, 1));
        assert_relative_eq!(second.position.x, 2.5);
        assert_relative_eq!(second.position.y, 0.0);
    }

    #[test]
    fn far_plane_is_exclusive() {
        assert!(cloud().iter().all(|p| p.position.z < 1000.0));
    }

    #[test]
    fn viewer_frame_flips_y_and_z() {
        let flipped = cloud().to_viewer_frame();
        let p = flipped.points()[0];

        assert_relative_eq!(p.position.x, -1.0);
        assert_relative_eq!(p.position.y, 0.5);
        assert_relative_eq!(p.position.z, -50.0);
    }

    #[test]
    fn ply_is_ascii_with_two_decimals() {
        let mut out = Vec::new();
        cloud().write_ply(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(
            text,
            "ply\n\
             format ascii 1.0\n\
             element vertex 2\n\
             property float x\n\
             property float y\n\
             property float z\n\
             property uchar red\n\
             property uchar green\n\
             property uchar blue\n\
             end_header\n\
             -1.00 -0.50 50.00 0 0 7\n\
             2.50 0.00 250.00 30 10 7\n"
        );
    }

    #[test]
    fn mismatched_guide_is_rejected() {
        let depth = DepthMap::from_disparity(&DisparityMap::new(4, 2), 100.0, 5.0);
        let guide = RgbImage::new(5, 2);

        assert!(matches!(
            PointCloud::from_depth(&depth, &guide, 100.0, 1000.0),
            Err(Error::ImageDimensionMismatch { .. })
        ));
    }
}
