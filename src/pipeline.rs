//! # Reconstruction pipeline
//!
//! Chains the stages of a reconstruction: geometry estimation and rectification, dense
//! matching, depth and point cloud. Every stage completes before the next one starts.
//!
//! Rectification has two operating modes, recorded as the [`Alignment`] of the frame handed to the
//! matcher:
//!
//! - `Rectified`: the pair was warped by the estimated homographies.
//! - `Raw`: the captured pair is used unchanged. This is the mode when `skip_rectification` is
//!   set, and the fallback when geometry estimation or rectification fails recoverably.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{imageops, RgbImage};
use log::{debug, info, warn};

use crate::cloud::PointCloud;
use crate::config::{CameraParams, Config, Params};
use crate::depth::DepthMap;
use crate::disparity::{DisparityAlgorithm, DisparityMap};
use crate::error::*;
use crate::frame::{check_dimensions, Alignment, StereoFrame};
use crate::geometry::GeometryEstimator;
use crate::rectify::RectifyingHomographyPair;
use crate::sgbm::SemiGlobal;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

pub struct StereoPipeline {
    camera: CameraParams,
    params: Params,
    focal_pixels: f64,
    estimator: GeometryEstimator,
    matcher: SemiGlobal
}

/// Everything produced by one reconstruction.
#[derive(Debug)]
pub struct Reconstruction {
    pub alignment: Alignment,
    pub disparity: DisparityMap,
    pub depth: DepthMap,
    pub cloud: PointCloud,

    /// Recoverable conditions met on the way, in the order they occurred.
    pub warnings: Vec<Error>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl StereoPipeline {
    /// Validate the configuration and build every stage.
    pub fn new(camera: CameraParams, params: Params) -> Result<Self> {
        camera.validate()?;
        params.validate()?;
        params.sgbm.check_width(camera.target_width as usize)?;

        let focal_pixels = camera.focal_pixels();
        debug!("Focal length is {:.2} px at width {}", focal_pixels, camera.target_width);

        Ok(StereoPipeline {
            estimator: GeometryEstimator::new(params.features.clone(), params.geometry.clone()),
            matcher: SemiGlobal::new(params.sgbm.clone(), params.wls.clone())?,
            camera,
            params,
            focal_pixels
        })
    }

    pub fn from_config(config: Config) -> Result<Self> {
        Self::new(config.camera, config.params)
    }

    pub fn camera(&self) -> &CameraParams {
        &self.camera
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Focal length in pixels at the processing width.
    pub fn focal_pixels(&self) -> f64 {
        self.focal_pixels
    }

    /// Build the frame for dense matching, rectifying the pair unless disabled.
    ///
    /// Recoverable failures fall back to the raw pair and are returned alongside the frame.
    pub fn rectify_images(
        &self,
        left: &RgbImage,
        right: &RgbImage
    ) -> Result<(StereoFrame, Option<Error>)> {
        self.check_input(left, right)?;

        if self.params.skip_rectification {
            info!("Rectification disabled, using the raw pair");
            return Ok((StereoFrame::from_color(left, right, Alignment::Raw)?, None));
        }

        match self.rectify(left, right) {
            Ok(frame) => Ok((frame, None)),
            Err(e) if e.is_recoverable() => {
                warn!("{}, using the raw pair", e);
                Ok((StereoFrame::from_color(left, right, Alignment::Raw)?, Some(e)))
            }
            Err(e) => Err(e)
        }
    }

    pub fn compute_disparity(&self, frame: &StereoFrame) -> Result<DisparityMap> {
        self.matcher.compute(frame)
    }

    pub fn calculate_depth(&self, disparity: &DisparityMap) -> DepthMap {
        DepthMap::from_disparity(disparity, self.focal_pixels, self.camera.baseline)
    }

    /// Back-project the depth map, colouring points from `guide`.
    pub fn point_cloud(&self, depth: &DepthMap, guide: &RgbImage) -> Result<PointCloud> {
        PointCloud::from_depth(depth, guide, self.focal_pixels, self.params.far_plane)
    }

    /// Run every stage on a colour pair already resized to `target_width`.
    pub fn reconstruct(&self, left: &RgbImage, right: &RgbImage) -> Result<Reconstruction> {
        let mut warnings = Vec::new();

        let (frame, warning) = self.rectify_images(left, right)?;
        warnings.extend(warning);

        let disparity = self.compute_disparity(&frame)?;
        let depth = self.calculate_depth(&disparity);
        let cloud = self.point_cloud(&depth, &frame.guide)?;

        if cloud.is_empty() {
            warn!("No pixel has a depth inside the far plane");
            warnings.push(Error::NoValidDepth);
        }

        info!(
            "Reconstructed {} points from {} valid disparities",
            cloud.len(),
            disparity.valid_count()
        );

        Ok(Reconstruction {
            alignment: frame.alignment,
            disparity,
            depth,
            cloud,
            warnings
        })
    }

    fn check_input(&self, left: &RgbImage, right: &RgbImage) -> Result<()> {
        check_dimensions(left.dimensions(), right.dimensions())?;

        if left.width() != self.camera.target_width {
            return Err(Error::invalid(
                "target_width",
                format!(
                    "images are {} pixels wide but the focal length assumes {}",
                    left.width(),
                    self.camera.target_width
                )
            ));
        }

        Ok(())
    }

    fn rectify(&self, left: &RgbImage, right: &RgbImage) -> Result<StereoFrame> {
        info!("Estimating epipolar geometry");

        let geometry = self
            .estimator
            .estimate(&imageops::grayscale(left), &imageops::grayscale(right))?;

        let homographies = RectifyingHomographyPair::estimate(
            &geometry.fundamental,
            &geometry.inlier_points(),
            left.width(),
            left.height()
        )?;
        debug!("Rectifying homographies {:?}", homographies);

        let (left, right) = homographies.warp(left, right)?;

        StereoFrame::from_color(&left, &right, Alignment::Rectified(homographies))
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
