//! Typed failures of the numeric stages
//!
//! Each stage reports its own enum so the pipeline can tell a skip-worthy
//! failure (convolution, background fit, photometry) apart from a hard one
//! (grid mismatch).
use std::fmt;

/// The two inputs cannot be mapped onto a common grid
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeMismatchError {
    /// One of the images has no world-coordinate solution
    MissingWcs { which: &'static str },
    /// The world-coordinate matrix cannot be inverted
    DegenerateWcs { which: &'static str },
    /// Arrays that must share a grid have different shapes
    Shape {
        left: (usize, usize),
        right: (usize, usize),
    },
}

impl fmt::Display for ShapeMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeMismatchError::MissingWcs { which } => {
                write!(f, "{} image has no world-coordinate solution", which)
            }
            ShapeMismatchError::DegenerateWcs { which } => {
                write!(f, "{} image has a singular world-coordinate matrix", which)
            }
            ShapeMismatchError::Shape { left, right } => write!(
                f,
                "shape mismatch: {}x{} vs {}x{}",
                left.0, left.1, right.0, right.1
            ),
        }
    }
}

impl std::error::Error for ShapeMismatchError {}

#[derive(Debug, Clone, PartialEq)]
pub enum ConvolveError {
    /// Target beam is narrower than the native one
    CannotSharpen { native: f64, target: f64 },
    MissingPixelScale,
    /// Every output pixel came out non-finite
    NoValidOutput,
}

impl fmt::Display for ConvolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvolveError::CannotSharpen { native, target } => write!(
                f,
                "cannot sharpen a {:.2}\" beam to {:.2}\"",
                native, target
            ),
            ConvolveError::MissingPixelScale => write!(f, "image has no usable pixel scale"),
            ConvolveError::NoValidOutput => write!(f, "convolution produced no finite pixels"),
        }
    }
}

impl std::error::Error for ConvolveError {}

#[derive(Debug, Clone, PartialEq)]
pub enum FitError {
    TooFewSamples { needed: usize, found: usize },
    WrongParameterCount { expected: usize, found: usize },
    NotConverged { iterations: usize },
    /// Non-finite parameters or plane values
    Degenerate,
    ShapeMismatch(ShapeMismatchError),
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitError::TooFewSamples { needed, found } => write!(
                f,
                "not enough usable pixels for the fit ({} < {})",
                found, needed
            ),
            FitError::WrongParameterCount { expected, found } => write!(
                f,
                "model takes {} parameters, {} given",
                expected, found
            ),
            FitError::NotConverged { iterations } => {
                write!(f, "fit did not converge after {} iterations", iterations)
            }
            FitError::Degenerate => write!(f, "fit produced a non-finite plane"),
            FitError::ShapeMismatch(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FitError {}

impl From<ShapeMismatchError> for FitError {
    fn from(e: ShapeMismatchError) -> Self {
        FitError::ShapeMismatch(e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhotometryError {
    /// The calibrator could not derive a zero-point for this frame
    ZeroPointUnavailable,
    /// The calibrated frame is missing the flux conversion factor
    MissingConversion,
    Tool(String),
}

impl fmt::Display for PhotometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhotometryError::ZeroPointUnavailable => write!(f, "zero-point unavailable"),
            PhotometryError::MissingConversion => write!(f, "flux conversion factor missing"),
            PhotometryError::Tool(msg) => write!(f, "photometry tool failed: {}", msg),
        }
    }
}

impl std::error::Error for PhotometryError {}
