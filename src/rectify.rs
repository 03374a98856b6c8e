//! # Uncalibrated rectification
//!
//! Derives a pair of projective transforms that send epipolar lines to image rows, following
//! Hartley's construction ("Theory and Practice of Projective Rectification", IJCV 1999):
//!
//! 1. The right transform translates the image centre to the origin, rotates the right epipole
//!    onto the positive x axis and then maps it to infinity.
//! 2. The left transform is the right one composed with a matching transform derived from `F`,
//!    followed by the affine row correction which minimises the horizontal distance between the
//!    transformed correspondences.
//!
//! Both images are then resampled at their captured resolution with bilinear interpolation.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use nalgebra::{Matrix3, Point2, RowVector3, Vector3};

use crate::error::*;
use crate::frame::check_dimensions;
use crate::geometry::FundamentalMatrix;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Smallest acceptable magnitude of a homogeneous scale or determinant.
const SINGULAR_TOLERANCE: f64 = 1e-12;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Projective transforms from captured to rectified pixel coordinates, one per view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectifyingHomographyPair {
    pub left: Matrix3<f64>,
    pub right: Matrix3<f64>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl RectifyingHomographyPair {
    /// Derive the rectifying transforms of a `width` x `height` image pair from the fundamental
    /// matrix and the inlier correspondences it was fit on.
    pub fn estimate(
        fundamental: &FundamentalMatrix,
        pairs: &[(Point2<f64>, Point2<f64>)],
        width: u32,
        height: u32
    ) -> Result<Self> {
        if pairs.len() < 3 {
            return Err(Error::RectificationFailed(format!(
                "{} correspondences cannot fix the row alignment",
                pairs.len()
            )));
        }

        let epipole = fundamental
            .right_epipole()
            .ok_or_else(|| Error::RectificationFailed("right epipole is undefined".into()))?;

        let cx = (width as f64 - 1.0) / 2.0;
        let cy = (height as f64 - 1.0) / 2.0;
        let to_centre = translation(-cx, -cy);
        let from_centre = translation(cx, cy);

        // Rotate the centred epipole onto the x axis
        let centred = to_centre * epipole;
        let mirror = centred.x < 0.0;
        let d = (centred.x * centred.x + centred.y * centred.y).sqrt();

        if d <= SINGULAR_TOLERANCE * centred.norm() {
            return Err(Error::RectificationFailed("epipole lies at the image centre".into()));
        }

        let (alpha, beta) = (centred.x / d, centred.y / d);
        let rotation = Matrix3::new(
            alpha, beta, 0.0,
            -beta, alpha, 0.0,
            0.0, 0.0, 1.0
        );

        // Send (d, 0, z) to infinity
        let rotated = rotation * centred;
        let inv_f = if rotated.z.abs() < 1e-6 * rotated.x.abs() {
            0.0
        }
        else {
            -rotated.z / rotated.x
        };
        let to_infinity = Matrix3::new(
            1.0, 0.0, 0.0,
            0.0, 1.0, 0.0,
            inv_f, 0.0, 1.0
        );

        let right = from_centre * to_infinity * rotation * to_centre;

        // Matching transform for the left view
        let m = epipole.cross_matrix() * fundamental.0
            + epipole * RowVector3::new(1.0, 1.0, 1.0);
        let left_base = right * m;

        let row_fit = fit_row_alignment(&left_base, &right, pairs)?;
        let mut left = row_fit * left_base;
        let mut right = right;

        if mirror {
            let rotate_half_turn = Matrix3::new(
                -1.0, 0.0, 2.0 * cx,
                0.0, -1.0, 2.0 * cy,
                0.0, 0.0, 1.0
            );
            left = rotate_half_turn * left;
            right = rotate_half_turn * right;
        }

        let pair = RectifyingHomographyPair {
            left: normalise_homography(left)?,
            right: normalise_homography(right)?
        };

        pair.check_image_plane(width, height)?;

        Ok(pair)
    }

    /// Map a left image point into rectified coordinates.
    pub fn map_left(&self, p: &Point2<f64>) -> Option<Point2<f64>> {
        apply(&self.left, p)
    }

    /// Map a right image point into rectified coordinates.
    pub fn map_right(&self, p: &Point2<f64>) -> Option<Point2<f64>> {
        apply(&self.right, p)
    }

    /// Resample both images through their transforms, keeping their dimensions. Pixels mapping
    /// from outside the source are black.
    pub fn warp(&self, left: &RgbImage, right: &RgbImage) -> Result<(RgbImage, RgbImage)> {
        check_dimensions(left.dimensions(), right.dimensions())?;

        Ok((warp_image(left, &self.left)?, warp_image(right, &self.right)?))
    }

    /// Every corner of the image must stay on the same side of the line sent to infinity,
    /// otherwise the warp would fold the image over itself.
    fn check_image_plane(&self, width: u32, height: u32) -> Result<()> {
        let corners = [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(width as f64 - 1.0, 0.0, 1.0),
            Vector3::new(0.0, height as f64 - 1.0, 1.0),
            Vector3::new(width as f64 - 1.0, height as f64 - 1.0, 1.0)
        ];

        for (name, h) in [("left", &self.left), ("right", &self.right)].iter() {
            let scales: Vec<f64> = corners.iter().map(|c| (*h * c).z).collect();
            let positive = scales.iter().all(|&w| w > SINGULAR_TOLERANCE);
            let negative = scales.iter().all(|&w| w < -SINGULAR_TOLERANCE);

            if !(positive || negative) {
                return Err(Error::RectificationFailed(format!(
                    "{} transform sends part of the image to infinity",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Least squares affine correction `x' = a x + b y + c` aligning the transformed left points with
/// the transformed right points horizontally.
fn fit_row_alignment(
    left_base: &Matrix3<f64>,
    right: &Matrix3<f64>,
    pairs: &[(Point2<f64>, Point2<f64>)]
) -> Result<Matrix3<f64>> {
    let mut ata = Matrix3::<f64>::zeros();
    let mut atb = Vector3::<f64>::zeros();

    for (l, r) in pairs {
        let lp = apply(left_base, l).ok_or_else(|| {
            Error::RectificationFailed("correspondence mapped to infinity".into())
        })?;
        let rp = apply(right, r).ok_or_else(|| {
            Error::RectificationFailed("correspondence mapped to infinity".into())
        })?;

        let row = Vector3::new(lp.x, lp.y, 1.0);
        ata += row * row.transpose();
        atb += row * rp.x;
    }

    let coeffs = ata
        .cholesky()
        .map(|c| c.solve(&atb))
        .ok_or_else(|| Error::RectificationFailed("row alignment system is singular".into()))?;

    Ok(Matrix3::new(
        coeffs.x, coeffs.y, coeffs.z,
        0.0, 1.0, 0.0,
        0.0, 0.0, 1.0
    ))
}

fn translation(tx: f64, ty: f64) -> Matrix3<f64> {
    Matrix3::new(
        1.0, 0.0, tx,
        0.0, 1.0, ty,
        0.0, 0.0, 1.0
    )
}

fn apply(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let q = h * p.to_homogeneous();

    if q.z.abs() <= SINGULAR_TOLERANCE {
        return None;
    }

    Some(Point2::new(q.x / q.z, q.y / q.z))
}

/// Scale a transform so its bottom right entry is one (or its norm is one if that entry
/// vanishes), rejecting non-finite or singular transforms.
fn normalise_homography(h: Matrix3<f64>) -> Result<Matrix3<f64>> {
    let scale = if h[(2, 2)].abs() > SINGULAR_TOLERANCE { h[(2, 2)] } else { h.norm() };
    let h = h / scale;

    if !h.iter().all(|v| v.is_finite()) {
        return Err(Error::RectificationFailed("transform is not finite".into()));
    }
    if h.determinant().abs() <= SINGULAR_TOLERANCE * h.norm().powi(3) {
        return Err(Error::RectificationFailed("transform is singular".into()));
    }

    Ok(h)
}

fn warp_image(img: &RgbImage, h: &Matrix3<f64>) -> Result<RgbImage> {
    let mut m = [0f32; 9];
    for (i, v) in m.iter_mut().enumerate() {
        *v = h[(i / 3, i % 3)] as f32;
    }

    let projection = Projection::from_matrix(m)
        .ok_or_else(|| Error::RectificationFailed("transform cannot be inverted".into()))?;

    Ok(warp(img, &projection, Interpolation::Bilinear, Rgb([0, 0, 0])))
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Rotation3};
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    const WIDTH: u32 = 640;
    const HEIGHT: u32 = 480;

    fn project(p: &Point3<f64>) -> Point2<f64> {
        Point2::new(500.0 * p.x / p.z + 320.0, 500.0 * p.y / p.z + 240.0)
    }

    fn synthetic_pairs(baseline: f64, seed: u64) -> Vec<(Point2<f64>, Point2<f64>)> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let rotation = Rotation3::from_euler_angles(0.01, 0.03, -0.02);
        let translation = Vector3::new(-baseline, 0.04, 0.03);

        (0..60)
            .map(|_| {
                let p = Point3::new(
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(6.0..12.0)
                );
                (project(&p), project(&(rotation * p + translation)))
            })
            .collect()
    }

    fn rectified_row_error(pairs: &[(Point2<f64>, Point2<f64>)]) -> (RectifyingHomographyPair, f64) {
        let f = FundamentalMatrix::from_points(pairs).unwrap();
        let h = RectifyingHomographyPair::estimate(&f, pairs, WIDTH, HEIGHT).unwrap();

        let worst = pairs
            .iter()
            .map(|(l, r)| {
                let l = h.map_left(l).unwrap();
                let r = h.map_right(r).unwrap();
                (l.y - r.y).abs()
            })
            .fold(0.0, f64::max);

        (h, worst)
    }

    #[test]
    fn correspondences_share_rows_after_rectification() {
        let (_, worst) = rectified_row_error(&synthetic_pairs(1.0, 7));
        assert!(worst < 1e-3, "row error {}", worst);
    }

    #[test]
    fn opposite_baseline_is_not_mirrored() {
        let (h, worst) = rectified_row_error(&synthetic_pairs(-1.0, 8));
        assert!(worst < 1e-3, "row error {}", worst);

        // Left to right order of the image is preserved in both views
        let y = HEIGHT as f64 / 2.0;
        for map in [RectifyingHomographyPair::map_left, RectifyingHomographyPair::map_right].iter() {
            let a = map(&h, &Point2::new(0.0, y)).unwrap();
            let b = map(&h, &Point2::new(WIDTH as f64 - 1.0, y)).unwrap();
            assert!(a.x < b.x);
        }
    }

    #[test]
    fn epipole_at_centre_fails() {
        let e = Vector3::new((WIDTH as f64 - 1.0) / 2.0, (HEIGHT as f64 - 1.0) / 2.0, 1.0);
        let f = FundamentalMatrix(e.cross_matrix());
        let pairs = synthetic_pairs(1.0, 9);

        assert!(matches!(
            RectifyingHomographyPair::estimate(&f, &pairs, WIDTH, HEIGHT),
            Err(Error::RectificationFailed(_))
        ));
    }

    #[test]
    fn identity_warp_preserves_image() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(10);
        let img = RgbImage::from_fn(40, 30, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]));
        let pair = RectifyingHomographyPair {
            left: Matrix3::identity(),
            right: Matrix3::identity()
        };

        let (l, r) = pair.warp(&img, &img).unwrap();
        assert_eq!(l.dimensions(), (40, 30));

        // Bilinear sampling needs both neighbours, so the last row and column may be black
        for y in 0..29 {
            for x in 0..39 {
                assert_eq!(l.get_pixel(x, y), img.get_pixel(x, y));
                assert_eq!(r.get_pixel(x, y), img.get_pixel(x, y));
            }
        }
    }
}
