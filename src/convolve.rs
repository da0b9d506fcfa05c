//! Resolution matching by Gaussian convolution
//!
//! An image with a native beam `b_n` is degraded to a coarser beam `b_t` by
//! convolving with a Gaussian of width `sqrt(b_t² − b_n²)`, since Gaussian
//! widths add in quadrature.

use crate::error::ConvolveError;
use crate::image::Image;

/// FWHM = 2 sqrt(2 ln 2) sigma
pub const FWHM_TO_SIGMA: f64 = 2.354_820_045_030_949;

/// Kernel half-width in sigmas
const TRUNCATE_SIGMAS: f64 = 4.0;

/// Native angular resolution of an instrument, in arcseconds
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct BeamWidth(f64);

impl BeamWidth {
    /// `None` unless `arcsec` is finite and positive
    pub fn new(arcsec: f64) -> Option<Self> {
        (arcsec.is_finite() && arcsec > 0.0).then_some(Self(arcsec))
    }

    /// For tabulated instrument beams known to be positive
    pub(crate) const fn known(arcsec: f64) -> Self {
        Self(arcsec)
    }

    pub fn arcsec(self) -> f64 {
        self.0
    }
}

impl std::fmt::Display for BeamWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Width of the Gaussian that takes `native` to `target`, in arcseconds
pub fn kernel_fwhm(native: BeamWidth, target: BeamWidth) -> Result<f64, ConvolveError> {
    if target.0 < native.0 {
        return Err(ConvolveError::CannotSharpen {
            native: native.0,
            target: target.0,
        });
    }
    Ok((target.0 * target.0 - native.0 * native.0).sqrt())
}

/// Normalised 1D Gaussian sampled at integer offsets, truncated at 4 sigma
pub fn gaussian_kernel_1d(sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 || !sigma.is_finite() {
        return vec![1.0];
    }
    let half = (TRUNCATE_SIGMAS * sigma).ceil() as isize;
    let mut kernel: Vec<f64> = (-half..=half)
        .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    Rows,
    Columns,
}

/// One separable pass. Weights falling outside the frame or on NaN pixels
/// are dropped and the rest renormalised, so a flat field stays flat up to
/// the edges. A pixel with no usable neighbour becomes NaN.
fn convolve_axis(data: &[f64], width: usize, height: usize, kernel: &[f64], axis: Axis) -> Vec<f64> {
    let half = (kernel.len() / 2) as isize;
    let mut out = vec![f64::NAN; data.len()];

    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            let mut weight = 0.0;
            for (k, &w) in kernel.iter().enumerate() {
                let offset = k as isize - half;
                let (sx, sy) = match axis {
                    Axis::Rows => (x as isize + offset, y as isize),
                    Axis::Columns => (x as isize, y as isize + offset),
                };
                if sx < 0 || sy < 0 || sx >= width as isize || sy >= height as isize {
                    continue;
                }
                let v = data[sy as usize * width + sx as usize];
                if v.is_finite() {
                    sum += v * w;
                    weight += w;
                }
            }
            if weight > 0.0 {
                out[y * width + x] = sum / weight;
            }
        }
    }

    out
}

/// Convolve `image` from its native beam to `target`.
///
/// The output keeps the input grid and metadata, with `FWHM` updated to the
/// target beam. Equal beams return the input unchanged.
pub fn match_resolution(
    image: &Image,
    native: BeamWidth,
    target: BeamWidth,
) -> Result<Image, ConvolveError> {
    let fwhm_arcsec = kernel_fwhm(native, target)?;

    let mut metadata = image.metadata.clone();
    metadata.fwhm = Some(target.arcsec());

    if fwhm_arcsec == 0.0 {
        return Ok(image.clone().with_metadata(metadata));
    }

    let pixel_scale = image
        .metadata
        .pixel_scale()
        .filter(|s| s.is_finite() && *s > 0.0)
        .ok_or(ConvolveError::MissingPixelScale)?;

    let sigma_pixels = fwhm_arcsec / pixel_scale / FWHM_TO_SIGMA;
    let kernel = gaussian_kernel_1d(sigma_pixels);

    tracing::debug!(
        native = native.arcsec(),
        target = target.arcsec(),
        kernel_fwhm = fwhm_arcsec,
        sigma_pixels,
        taps = kernel.len(),
        "matching resolution"
    );

    let pass = convolve_axis(&image.data, image.width, image.height, &kernel, Axis::Rows);
    let data = convolve_axis(&pass, image.width, image.height, &kernel, Axis::Columns);

    if !data.iter().any(|v| v.is_finite()) {
        return Err(ConvolveError::NoValidOutput);
    }

    Ok(Image {
        width: image.width,
        height: image.height,
        data,
        metadata,
    })
}
