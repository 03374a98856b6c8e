//! # Epipolar geometry
//!
//! Robust estimation of the fundamental matrix relating the two views, from keypoint
//! correspondences found by [`crate::features`].
//!
//! The matrix follows the convention `pR^T F pL = 0` for homogeneous left/right pixel positions.
//! Estimation uses the normalised eight-point algorithm inside a RANSAC loop whose sampling RNG is
//! seeded from [`GeometryParams::seed`], so identical inputs always give identical models.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::GrayImage;
use log::{debug, info};
use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector3};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::config::{FeatureParams, GeometryParams};
use crate::error::*;
use crate::features::{match_descriptors, CorrespondenceSet, FeatureDetector};
use crate::frame::check_dimensions;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Minimum number of correspondences that determine a fundamental matrix.
pub const MIN_SAMPLES: usize = 8;

/// Ratio of the two largest singular values below which a matrix is considered rank 1.
const RANK_TOLERANCE: f64 = 1e-6;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Rank 2 matrix satisfying `pR^T F pL = 0`, normalised to unit Frobenius norm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FundamentalMatrix(pub Matrix3<f64>);

/// Output of the geometry estimator.
#[derive(Debug, Clone)]
pub struct EpipolarGeometry {
    pub correspondences: CorrespondenceSet,
    pub fundamental: FundamentalMatrix,

    /// `inliers[i]` is true if `correspondences[i]` agrees with `fundamental`.
    pub inliers: Vec<bool>
}

/// Detects and matches keypoints, then fits the fundamental matrix.
pub struct GeometryEstimator {
    detector: FeatureDetector,
    params: GeometryParams
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl FundamentalMatrix {
    /// Least squares fit over at least eight `(left, right)` correspondences.
    ///
    /// Fails with `DegenerateGeometry` when the points do not constrain a unique rank 2 matrix,
    /// for instance when they coincide.
    pub fn from_points(pairs: &[(Point2<f64>, Point2<f64>)]) -> Result<Self> {
        if pairs.len() < MIN_SAMPLES {
            return Err(Error::DegenerateGeometry(format!(
                "{} correspondences cannot determine a fundamental matrix",
                pairs.len()
            )));
        }

        let (left, t_left) = normalise(pairs.iter().map(|p| p.0))
            .ok_or_else(|| Error::DegenerateGeometry("left points coincide".into()))?;
        let (right, t_right) = normalise(pairs.iter().map(|p| p.1))
            .ok_or_else(|| Error::DegenerateGeometry("right points coincide".into()))?;

        // Accumulate A^T A of the epipolar constraint rows
        let mut ata = SMatrix::<f64, 9, 9>::zeros();
        for (l, r) in left.iter().zip(right.iter()) {
            let row = SVector::<f64, 9>::from_column_slice(&[
                r.x * l.x, r.x * l.y, r.x,
                r.y * l.x, r.y * l.y, r.y,
                l.x, l.y, 1.0
            ]);
            ata += row * row.transpose();
        }

        let eigen = ata
            .try_symmetric_eigen(1e-12, 1000)
            .ok_or_else(|| Error::DegenerateGeometry("eigen decomposition did not converge".into()))?;

        let mut order: Vec<usize> = (0..9).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[a]
                .partial_cmp(&eigen.eigenvalues[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // A second (near) null direction means the sample leaves F undetermined
        let largest = eigen.eigenvalues[order[8]].abs().max(f64::MIN_POSITIVE);
        if eigen.eigenvalues[order[1]].abs() <= 1e-12 * largest {
            return Err(Error::DegenerateGeometry(
                "correspondences do not constrain a unique matrix".into()
            ));
        }

        let f = eigen.eigenvectors.column(order[0]);
        let normalised = Matrix3::new(
            f[0], f[1], f[2],
            f[3], f[4], f[5],
            f[6], f[7], f[8]
        );

        let rank2 = enforce_rank2(normalised)?;
        let denormalised = t_right.transpose() * rank2 * t_left;

        let norm = denormalised.norm();
        if !norm.is_finite() || norm <= f64::EPSILON {
            return Err(Error::DegenerateGeometry("matrix vanished after denormalisation".into()));
        }

        Ok(FundamentalMatrix(denormalised / norm))
    }

    /// Algebraic residual `pR^T F pL`.
    pub fn residual(&self, left: &Point2<f64>, right: &Point2<f64>) -> f64 {
        right.to_homogeneous().dot(&(self.0 * left.to_homogeneous()))
    }

    /// Larger of the two point to epipolar line distances, in pixels.
    pub fn epipolar_distance(&self, left: &Point2<f64>, right: &Point2<f64>) -> f64 {
        let pl = left.to_homogeneous();
        let pr = right.to_homogeneous();

        // Line in the right image of the left point, and vice versa
        let line_r = self.0 * pl;
        let line_l = self.0.transpose() * pr;
        let residual = pr.dot(&line_r);

        let dr = residual * residual / (line_r.x * line_r.x + line_r.y * line_r.y);
        let dl = residual * residual / (line_l.x * line_l.x + line_l.y * line_l.y);
        let d = dr.max(dl).sqrt();

        if d.is_finite() { d } else { f64::INFINITY }
    }

    /// Epipole in the right image, `F^T e = 0`.
    pub fn right_epipole(&self) -> Option<Vector3<f64>> {
        null_vector(self.0.transpose())
    }

    /// Epipole in the left image, `F e = 0`.
    pub fn left_epipole(&self) -> Option<Vector3<f64>> {
        null_vector(self.0)
    }
}

impl EpipolarGeometry {
    /// Positions of the correspondences flagged as inliers.
    pub fn inlier_points(&self) -> Vec<(Point2<f64>, Point2<f64>)> {
        self.correspondences
            .iter()
            .zip(self.inliers.iter())
            .filter(|(_, &inlier)| inlier)
            .map(|(c, _)| c.points())
            .collect()
    }

    pub fn inlier_count(&self) -> usize {
        self.inliers.iter().filter(|&&i| i).count()
    }
}

impl GeometryEstimator {
    pub fn new(features: FeatureParams, params: GeometryParams) -> Self {
        Self {
            detector: FeatureDetector::new(features),
            params
        }
    }

    /// Find correspondences between the two images and fit the fundamental matrix.
    ///
    /// Returns `InsufficientCorrespondence` if fewer than `min_matches` pairs survive the ratio
    /// test and `DegenerateGeometry` if no stable matrix can be fit. Both are recoverable by
    /// using the images unrectified.
    pub fn estimate(&self, left: &GrayImage, right: &GrayImage) -> Result<EpipolarGeometry> {
        check_dimensions(left.dimensions(), right.dimensions())?;

        let left_kps = self.detector.detect(left);
        let right_kps = self.detector.detect(right);
        debug!("Detected {} left and {} right keypoints", left_kps.len(), right_kps.len());

        let correspondences = match_descriptors(&left_kps, &right_kps, self.params.ratio_threshold);
        info!("{} correspondences passed the ratio test", correspondences.len());

        if correspondences.len() < self.params.min_matches {
            return Err(Error::InsufficientCorrespondence {
                found: correspondences.len(),
                required: self.params.min_matches
            });
        }

        let pairs: Vec<_> = correspondences.iter().map(|c| c.points()).collect();
        let (fundamental, inliers) = self.fit(&pairs)?;

        Ok(EpipolarGeometry {
            correspondences,
            fundamental,
            inliers
        })
    }

    /// RANSAC fit of the fundamental matrix, returning the model refit on its inliers and the
    /// final inlier mask.
    pub fn fit(&self, pairs: &[(Point2<f64>, Point2<f64>)]) -> Result<(FundamentalMatrix, Vec<bool>)> {
        if pairs.len() < MIN_SAMPLES {
            return Err(Error::DegenerateGeometry(format!(
                "{} correspondences cannot determine a fundamental matrix",
                pairs.len()
            )));
        }

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.params.seed);
        let mut best: Option<(FundamentalMatrix, usize)> = None;
        let mut iterations = self.params.max_iterations;
        let mut i = 0;

        while i < iterations {
            i += 1;

            let sample: Vec<_> = rand::seq::index::sample(&mut rng, pairs.len(), MIN_SAMPLES)
                .iter()
                .map(|k| pairs[k])
                .collect();

            // Degenerate samples are simply skipped
            let model = match FundamentalMatrix::from_points(&sample) {
                Ok(f) => f,
                Err(_) => continue
            };

            let count = self.inlier_mask(&model, pairs).iter().filter(|&&m| m).count();

            if best.map_or(true, |(_, c)| count > c) {
                best = Some((model, count));
                iterations = iterations.min(self.required_iterations(count, pairs.len()).max(i));
            }
        }

        let (model, count) = best.ok_or_else(|| {
            Error::DegenerateGeometry("no sample produced a valid fundamental matrix".into())
        })?;
        debug!("RANSAC: {} of {} inliers after {} iterations", count, pairs.len(), i);

        if count < MIN_SAMPLES {
            return Err(Error::DegenerateGeometry(format!("only {} inliers", count)));
        }

        // Refit on all inliers
        let mask = self.inlier_mask(&model, pairs);
        let inlier_pairs: Vec<_> = pairs
            .iter()
            .zip(mask.iter())
            .filter(|(_, &m)| m)
            .map(|(p, _)| *p)
            .collect();
        let refit = FundamentalMatrix::from_points(&inlier_pairs)?;
        let refit_mask = self.inlier_mask(&refit, pairs);

        if refit_mask.iter().filter(|&&m| m).count() < MIN_SAMPLES {
            return Err(Error::DegenerateGeometry("refit model lost its inliers".into()));
        }

        Ok((refit, refit_mask))
    }

    fn inlier_mask(&self, model: &FundamentalMatrix, pairs: &[(Point2<f64>, Point2<f64>)]) -> Vec<bool> {
        pairs
            .iter()
            .map(|(l, r)| model.epipolar_distance(l, r) <= self.params.ransac_threshold)
            .collect()
    }

    /// Number of iterations needed to draw one all-inlier sample with the configured confidence.
    fn required_iterations(&self, inliers: usize, total: usize) -> usize {
        let ratio = inliers as f64 / total as f64;
        let p_good = ratio.powi(MIN_SAMPLES as i32);

        if p_good >= 1.0 - f64::EPSILON {
            return 1;
        }
        if p_good <= f64::EPSILON {
            return self.params.max_iterations;
        }

        let k = (1.0 - self.params.confidence).ln() / (1.0 - p_good).ln();

        if k.is_finite() {
            (k.ceil() as usize).min(self.params.max_iterations)
        }
        else {
            self.params.max_iterations
        }
    }
}

/// Translate points to their centroid and scale them to a mean distance of sqrt(2).
fn normalise(points: impl Iterator<Item = Point2<f64>>) -> Option<(Vec<Point2<f64>>, Matrix3<f64>)> {
    let pts: Vec<_> = points.collect();
    let n = pts.len() as f64;

    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>() / n;

    if !(mean_dist > 1e-10) {
        return None;
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(
        s, 0.0, -s * cx,
        0.0, s, -s * cy,
        0.0, 0.0, 1.0
    );
    let normalised = pts
        .iter()
        .map(|p| Point2::new((p.x - cx) * s, (p.y - cy) * s))
        .collect();

    Some((normalised, t))
}

/// Zero the smallest singular value, rejecting matrices that are already close to rank 1.
fn enforce_rank2(m: Matrix3<f64>) -> Result<Matrix3<f64>> {
    let mut svd = m.svd(true, true);
    let s = svd.singular_values;

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| s[b].partial_cmp(&s[a]).unwrap_or(std::cmp::Ordering::Equal));

    if !(s[order[0]] > 0.0) || s[order[1]] / s[order[0]] < RANK_TOLERANCE {
        return Err(Error::DegenerateGeometry("matrix is close to rank 1".into()));
    }

    svd.singular_values[order[2]] = 0.0;
    svd.recompose()
        .map_err(|e| Error::DegenerateGeometry(format!("could not recompose matrix: {}", e)))
}

/// Unit vector spanning the (approximate) null space of `m`.
fn null_vector(m: Matrix3<f64>) -> Option<Vector3<f64>> {
    let eigen = (m.transpose() * m).try_symmetric_eigen(1e-14, 1000)?;
    let idx = eigen.eigenvalues.imin();
    let v = eigen.eigenvectors.column(idx).into_owned();

    if v.iter().all(|x| x.is_finite()) { Some(v) } else { None }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Rotation3};
    use rand::Rng;

    const FOCAL: f64 = 500.0;

    fn project(p: &Point3<f64>) -> Point2<f64> {
        Point2::new(FOCAL * p.x / p.z + 320.0, FOCAL * p.y / p.z + 240.0)
    }

    /// Exact correspondences of random points seen by two cameras one unit apart.
    fn synthetic_pairs(n: usize, seed: u64) -> Vec<(Point2<f64>, Point2<f64>)> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let rotation = Rotation3::from_euler_angles(0.02, -0.04, 0.01);
        let translation = Vector3::new(-1.0, 0.05, 0.02);

        (0..n)
            .map(|_| {
                let p = Point3::new(
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(6.0..12.0)
                );
                let q = rotation * p + translation;
                (project(&p), project(&q))
            })
            .collect()
    }

    fn estimator() -> GeometryEstimator {
        GeometryEstimator::new(FeatureParams::default(), GeometryParams::default())
    }

    #[test]
    fn eight_point_fits_exact_data() {
        let pairs = synthetic_pairs(40, 1);
        let f = FundamentalMatrix::from_points(&pairs).unwrap();

        for (l, r) in &pairs {
            assert!(f.epipolar_distance(l, r) < 1e-6);
        }
        approx::assert_relative_eq!(f.0.norm(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn fitted_matrix_is_rank_2() {
        let f = FundamentalMatrix::from_points(&synthetic_pairs(20, 2)).unwrap();
        assert!(f.0.determinant().abs() < 1e-9);

        let e = f.right_epipole().unwrap();
        assert!((f.0.transpose() * e).norm() < 1e-9);
    }

    #[test]
    fn coincident_points_are_degenerate() {
        let p = (Point2::new(10.0, 10.0), Point2::new(12.0, 10.0));
        let pairs = vec![p; 12];
        assert!(matches!(
            FundamentalMatrix::from_points(&pairs),
            Err(Error::DegenerateGeometry(_))
        ));
        assert!(matches!(estimator().fit(&pairs), Err(Error::DegenerateGeometry(_))));
    }

    #[test]
    fn too_few_points_are_degenerate() {
        let pairs = synthetic_pairs(7, 3);
        assert!(matches!(estimator().fit(&pairs), Err(Error::DegenerateGeometry(_))));
    }

    #[test]
    fn ransac_rejects_outliers() {
        let mut pairs = synthetic_pairs(70, 4);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(99);
        for _ in 0..30 {
            pairs.push((
                Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)),
                Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0))
            ));
        }

        let (f, mask) = estimator().fit(&pairs).unwrap();
        assert_eq!(mask.len(), 100);
        assert!(mask[..70].iter().all(|&m| m));

        let rejected = mask[70..].iter().filter(|&&m| !m).count();
        assert!(rejected >= 24, "only {} of 30 outliers rejected", rejected);

        for (l, r) in &pairs[..70] {
            assert!(f.epipolar_distance(l, r) < 1.0);
        }
    }

    #[test]
    fn ransac_is_reproducible() {
        let mut pairs = synthetic_pairs(50, 5);
        pairs.push((Point2::new(5.0, 5.0), Point2::new(600.0, 400.0)));

        let a = estimator().fit(&pairs).unwrap();
        let b = estimator().fit(&pairs).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn flat_images_have_insufficient_correspondence() {
        let img = GrayImage::from_pixel(160, 120, image::Luma([90]));
        match estimator().estimate(&img, &img) {
            Err(Error::InsufficientCorrespondence { found, required }) => {
                assert_eq!(found, 0);
                assert_eq!(required, 10);
            }
            other => panic!("expected insufficient correspondence, got {:?}", other.map(|_| ()))
        }
    }
}
