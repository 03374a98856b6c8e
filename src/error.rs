//! # Error standards
//! 
//! This module provides a standardised error enum and result type for this crate.

// -----------------------------------------------------------------------------------------------
// TYPES
// -----------------------------------------------------------------------------------------------

/// Standard result type used in the stereo-depth crate.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Left image is {left:?} but right image is {right:?}, stereo images must match")]
    ImageDimensionMismatch {
        left: (u32, u32),
        right: (u32, u32)
    },

    #[error("Only {found} correspondences survived matching, at least {required} are required")]
    InsufficientCorrespondence {
        found: usize,
        required: usize
    },

    #[error("Epipolar geometry is degenerate: {0}")]
    DegenerateGeometry(String),

    #[error("Rectification failed: {0}")]
    RectificationFailed(String),

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: String
    },

    #[error("No valid depth remained after masking")]
    NoValidDepth,

    #[error("Could not parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Could not write point cloud: {0}")]
    Io(#[from] std::io::Error)
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Error {
    /// Build an `InvalidParameter` error.
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            reason: reason.into()
        }
    }

    /// Whether the pipeline can degrade gracefully from this error.
    ///
    /// Recoverable errors are reported as warnings alongside a valid reconstruction: the three
    /// rectification failures fall back to the raw image pair, and `NoValidDepth` yields an empty
    /// point cloud.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InsufficientCorrespondence { .. }
                | Error::DegenerateGeometry(_)
                | Error::RectificationFailed(_)
                | Error::NoValidDepth
        )
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
