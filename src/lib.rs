//! # Stereo Depth
//!
//! This crate recovers a metric depth map and a coloured point cloud from an uncalibrated,
//! horizontally offset image pair.
//!
//! The stages are, in order:
//!
//! 1. [`geometry`]: keypoint matching and a robust fundamental matrix fit.
//! 2. [`rectify`]: uncalibrated rectification of the pair.
//! 3. [`sgbm`] and [`wls`]: semi-global matching and edge-aware refinement into a
//!    [`disparity::DisparityMap`].
//! 4. [`depth`] and [`cloud`]: depth from disparity and back-projection.
//!
//! [`pipeline::StereoPipeline`] runs them all from a validated [`config::Config`].

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod cloud;
pub mod config;
pub mod depth;
pub mod disparity;
mod error;
pub mod features;
pub mod frame;
pub mod geometry;
pub mod pipeline;
pub mod rectify;
pub mod sgbm;
pub mod wls;

// -----------------------------------------------------------------------------------------------
// EXPORTS
// -----------------------------------------------------------------------------------------------

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::cloud::{CloudPoint, PointCloud};
    pub use crate::config::{CameraParams, Config, Params};
    pub use crate::depth::DepthMap;
    pub use crate::disparity::{DisparityAlgorithm, DisparityMap};
    pub use crate::error::Error;
    pub use crate::frame::{Alignment, StereoFrame};
    pub use crate::pipeline::{Reconstruction, StereoPipeline};
}
