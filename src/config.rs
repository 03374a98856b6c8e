//! # Configuration
//!
//! Camera parameters and per-stage tunables for the reconstruction pipeline. Every struct
//! deserialises from TOML, with missing fields taking the documented defaults.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use serde::Deserialize;

use crate::error::*;
use crate::sgbm::DISP_SCALE;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Largest search range whose fixed point disparities still fit in an `i16`.
pub const MAX_NUM_DISPARITIES: usize = (i16::MAX as usize + 1) / DISP_SCALE as usize;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Full configuration: camera description plus algorithm tunables.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraParams,

    #[serde(default)]
    pub params: Params
}

/// Physical description of the capture setup.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct CameraParams {
    /// Lens focal length in millimetres.
    pub focal_length_mm: f64,

    /// Sensor width in millimetres.
    pub sensor_width_mm: f64,

    /// Distance between the two camera positions, in the unit depth is reported in.
    pub baseline: f64,

    /// Processing width in pixels, both images are resized to this before reconstruction.
    pub target_width: u32
}

/// Algorithm tunables for every stage.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Params {
    /// Bypass geometry estimation and rectification, the pair is already row aligned.
    pub skip_rectification: bool,

    /// Depths at or beyond this value are excluded from the point cloud.
    pub far_plane: f64,

    pub features: FeatureParams,
    pub geometry: GeometryParams,
    pub sgbm: SgbmParams,
    pub wls: WlsParams
}

/// Keypoint detection parameters.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FeatureParams {
    /// Maximum number of keypoints kept per image.
    pub max_features: usize,

    /// Number of pyramid levels.
    pub levels: usize,

    /// Downscale factor between consecutive pyramid levels.
    pub scale_factor: f32,

    /// FAST intensity threshold.
    pub fast_threshold: u8
}

/// Correspondence filtering and robust fundamental matrix fitting.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GeometryParams {
    /// Lowe ratio: accept a match only if `best < ratio * second_best`.
    pub ratio_threshold: f32,

    /// Minimum number of accepted matches before rectification is attempted.
    pub min_matches: usize,

    /// Maximum point to epipolar line distance of an inlier, in pixels.
    pub ransac_threshold: f64,

    /// Desired probability that at least one sample is outlier free.
    pub confidence: f64,

    pub max_iterations: usize,

    /// Seed of the sampling RNG, fixed so that estimation is reproducible.
    pub seed: u64
}

/// Semi-global block matching parameters.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SgbmParams {
    /// Size of the disparity search range `[0, num_disparities)`, a positive multiple of 16.
    pub num_disparities: usize,

    /// Odd matching window size.
    pub block_size: usize,

    /// Maximum allowed difference between the left and right disparity, in whole pixels.
    pub disp12_max_diff: i32,

    /// Margin in percent by which the best cost must beat any non-adjacent candidate.
    pub uniqueness_ratio: u32,

    /// Connected regions of at most this many pixels are removed as speckles.
    pub speckle_window_size: usize,

    /// Maximum disparity variation within a connected region, in whole pixels.
    pub speckle_range: i32,

    /// Clipping value of the horizontal gradient pre-filter.
    pub pre_filter_cap: i32
}

/// Edge-aware weighted least squares refinement parameters.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WlsParams {
    /// Regularisation strength.
    pub lambda: f32,

    /// Edge sensitivity to the colour guide.
    pub sigma: f32,

    /// Left-right disagreement (1/16 px) at which confidence drops to zero.
    pub lrc_threshold: i32,

    /// Number of alternating row/column passes.
    pub iterations: usize,

    /// Per-pass decay of the regularisation strength.
    pub attenuation: f32
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Config {
    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.camera.validate()?;
        self.params.validate()?;
        self.params.sgbm.check_width(self.camera.target_width as usize)
    }
}

impl CameraParams {
    /// Focal length in pixels at the processing resolution.
    pub fn focal_pixels(&self) -> f64 {
        (self.focal_length_mm * self.target_width as f64) / self.sensor_width_mm
    }

    pub fn validate(&self) -> Result<()> {
        positive("focal_length_mm", self.focal_length_mm)?;
        positive("sensor_width_mm", self.sensor_width_mm)?;
        positive("baseline", self.baseline)?;

        if self.target_width == 0 {
            return Err(Error::invalid("target_width", "must be at least one pixel"));
        }

        Ok(())
    }
}

impl Params {
    pub fn validate(&self) -> Result<()> {
        positive("far_plane", self.far_plane)?;
        self.features.validate()?;
        self.geometry.validate()?;
        self.sgbm.validate()?;
        self.wls.validate()
    }
}

impl FeatureParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_features == 0 {
            return Err(Error::invalid("max_features", "must be positive"));
        }
        if self.levels == 0 {
            return Err(Error::invalid("levels", "must be positive"));
        }
        if !(self.scale_factor > 1.0) || !self.scale_factor.is_finite() {
            return Err(Error::invalid(
                "scale_factor",
                format!("{} must be finite and greater than one", self.scale_factor)
            ));
        }

        Ok(())
    }
}

impl GeometryParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.ratio_threshold > 0.0 && self.ratio_threshold <= 1.0) {
            return Err(Error::invalid(
                "ratio_threshold",
                format!("{} is outside (0, 1]", self.ratio_threshold)
            ));
        }
        if self.min_matches < 8 {
            return Err(Error::invalid(
                "min_matches",
                format!("{} is below the 8 correspondences a fundamental matrix needs", self.min_matches)
            ));
        }
        positive("ransac_threshold", self.ransac_threshold)?;
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(Error::invalid(
                "confidence",
                format!("{} is outside (0, 1)", self.confidence)
            ));
        }
        if self.max_iterations == 0 {
            return Err(Error::invalid("max_iterations", "must be positive"));
        }

        Ok(())
    }
}

impl SgbmParams {
    /// Small smoothness penalty, applied to disparity changes of one pixel.
    pub fn p1(&self) -> u32 {
        (8 * 3 * self.block_size * self.block_size) as u32
    }

    /// Large smoothness penalty, applied to larger disparity jumps.
    pub fn p2(&self) -> u32 {
        (32 * 3 * self.block_size * self.block_size) as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_disparities == 0 || self.num_disparities % 16 != 0 {
            return Err(Error::invalid(
                "num_disparities",
                format!("{} is not a positive multiple of 16", self.num_disparities)
            ));
        }
        if self.num_disparities > MAX_NUM_DISPARITIES {
            return Err(Error::invalid(
                "num_disparities",
                format!(
                    "{} is above the maximum of {}",
                    self.num_disparities, MAX_NUM_DISPARITIES
                )
            ));
        }
        if self.block_size == 0 || self.block_size % 2 == 0 {
            return Err(Error::invalid(
                "block_size",
                format!("{} is not a positive odd number", self.block_size)
            ));
        }
        if self.disp12_max_diff < 0 {
            return Err(Error::invalid("disp12_max_diff", "must not be negative"));
        }
        if self.uniqueness_ratio >= 100 {
            return Err(Error::invalid("uniqueness_ratio", "must be below 100 percent"));
        }
        if self.speckle_range < 0 {
            return Err(Error::invalid("speckle_range", "must not be negative"));
        }
        if self.pre_filter_cap < 1 || self.pre_filter_cap > 63 {
            return Err(Error::invalid(
                "pre_filter_cap",
                format!("{} is outside [1, 63]", self.pre_filter_cap)
            ));
        }

        Ok(())
    }

    /// Reject a search range that leaves no column of an image `width` pixels wide to match.
    pub fn check_width(&self, width: usize) -> Result<()> {
        if self.num_disparities >= width {
            return Err(Error::invalid(
                "num_disparities",
                format!(
                    "{} leaves no columns to match in an image {} pixels wide",
                    self.num_disparities, width
                )
            ));
        }

        Ok(())
    }
}

impl WlsParams {
    pub fn validate(&self) -> Result<()> {
        positive("wls_lambda", self.lambda as f64)?;
        positive("wls_sigma", self.sigma as f64)?;

        if self.lrc_threshold <= 0 {
            return Err(Error::invalid("lrc_threshold", "must be positive"));
        }
        if self.iterations == 0 {
            return Err(Error::invalid("iterations", "must be positive"));
        }
        if !(self.attenuation > 0.0 && self.attenuation < 1.0) {
            return Err(Error::invalid(
                "attenuation",
                format!("{} is outside (0, 1)", self.attenuation)
            ));
        }

        Ok(())
    }
}

fn positive(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    }
    else {
        Err(Error::invalid(name, format!("{} is not a positive finite number", value)))
    }
}

// -----------------------------------------------------------------------------------------------
// DEFAULTS
// -----------------------------------------------------------------------------------------------

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            focal_length_mm: 4.76,
            sensor_width_mm: 6.40,
            baseline: 15.0,
            target_width: 1000
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Self {
            skip_rectification: true,
            far_plane: 1000.0,
            features: FeatureParams::default(),
            geometry: GeometryParams::default(),
            sgbm: SgbmParams::default(),
            wls: WlsParams::default()
        }
    }
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            max_features: 2000,
            levels: 4,
            scale_factor: 1.2,
            fast_threshold: 20
        }
    }
}

impl Default for GeometryParams {
    fn default() -> Self {
        Self {
            ratio_threshold: 0.75,
            min_matches: 10,
            ransac_threshold: 3.0,
            confidence: 0.99,
            max_iterations: 2000,
            seed: 0
        }
    }
}

impl Default for SgbmParams {
    fn default() -> Self {
        Self {
            num_disparities: 256,
            block_size: 7,
            disp12_max_diff: 1,
            uniqueness_ratio: 5,
            speckle_window_size: 200,
            speckle_range: 2,
            pre_filter_cap: 63
        }
    }
}

impl Default for WlsParams {
    fn default() -> Self {
        Self {
            lambda: 8000.0,
            sigma: 1.5,
            lrc_threshold: 24,
            iterations: 3,
            attenuation: 0.25
        }
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
