//! Reprojection of one frame onto another frame's pixel grid
//!
//! The target grid is the common grid: every target pixel centre goes
//! through target pixel -> world -> source pixel and is sampled from the
//! source with bilinear interpolation.
use crate::error::ShapeMismatchError;
use crate::image::Image;
use crate::wcs::{InverseWcs, Wcs};

/// How the coordinate map is materialised
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ResampleMode {
    /// Build the full coordinate map, then sample
    #[default]
    Full,
    /// Walk the target in strips of `strip_rows` rows, reusing one
    /// strip-sized coordinate buffer
    LowMemory { strip_rows: usize },
}

impl ResampleMode {
    pub fn low_memory() -> Self {
        ResampleMode::LowMemory { strip_rows: 64 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GridResampler {
    pub mode: ResampleMode,
}

/// Bilinear interpolation, NaN outside the frame or next to a NaN pixel
pub fn bilinear_sample(data: &[f64], width: usize, height: usize, x: f64, y: f64) -> f64 {
    if width == 0 || height == 0 || !x.is_finite() || !y.is_finite() {
        return f64::NAN;
    }
    // Half a pixel of slack so edge pixel centres still sample
    if x < -0.5 || y < -0.5 || x > width as f64 - 0.5 || y > height as f64 - 0.5 {
        return f64::NAN;
    }
    let x = x.max(0.0).min((width - 1) as f64);
    let y = y.max(0.0).min((height - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = data[y0 * width + x0];
    let p10 = data[y0 * width + x1];
    let p01 = data[y1 * width + x0];
    let p11 = data[y1 * width + x1];

    let p0 = p00 * (1.0 - fx) + p10 * fx;
    let p1 = p01 * (1.0 - fx) + p11 * fx;
    p0 * (1.0 - fy) + p1 * fy
}

struct GridMapping<'a> {
    target: &'a Wcs,
    source: InverseWcs,
}

impl GridMapping<'_> {
    #[inline]
    fn source_pixel(&self, x: usize, y: usize) -> (f64, f64) {
        let (lon, lat) = self.target.pixel_to_world(x as f64, y as f64);
        self.source.world_to_pixel(lon, lat)
    }
}

impl GridResampler {
    pub fn new(mode: ResampleMode) -> Self {
        Self { mode }
    }

    /// Put `source` on `target`'s grid.
    ///
    /// Returns `(resampled_source, resampled_target)`; both share the
    /// target's shape and world-coordinate solution. Fails when either
    /// frame lacks a usable solution.
    pub fn resample(
        &self,
        source: &Image,
        target: &Image,
    ) -> Result<(Image, Image), ShapeMismatchError> {
        let source_wcs = source
            .metadata
            .wcs
            .as_ref()
            .ok_or(ShapeMismatchError::MissingWcs { which: "source" })?;
        let target_wcs = target
            .metadata
            .wcs
            .as_ref()
            .ok_or(ShapeMismatchError::MissingWcs { which: "target" })?;
        if target_wcs.inverse().is_none() {
            return Err(ShapeMismatchError::DegenerateWcs { which: "target" });
        }
        let mapping = GridMapping {
            target: target_wcs,
            source: source_wcs
                .inverse()
                .ok_or(ShapeMismatchError::DegenerateWcs { which: "source" })?,
        };

        let data = match self.mode {
            ResampleMode::Full => resample_full(source, target.width, target.height, &mapping),
            ResampleMode::LowMemory { strip_rows } => resample_strips(
                source,
                target.width,
                target.height,
                &mapping,
                strip_rows.max(1),
            ),
        };

        tracing::debug!(
            mode = ?self.mode,
            source_w = source.width,
            source_h = source.height,
            target_w = target.width,
            target_h = target.height,
            "resampled onto target grid"
        );

        let mut metadata = source.metadata.clone();
        metadata.wcs = Some(target_wcs.clone());
        metadata.set_pixel_scale(target_wcs.pixel_scale_arcsec());

        let resampled = Image {
            width: target.width,
            height: target.height,
            data,
            metadata,
        };
        Ok((resampled, target.clone()))
    }
}

fn resample_full(source: &Image, width: usize, height: usize, mapping: &GridMapping) -> Vec<f64> {
    let n = width * height;
    let mut xs = Vec::with_capacity(n);
    let mut ys = Vec::with_capacity(n);
    for y in 0..height {
        for x in 0..width {
            let (sx, sy) = mapping.source_pixel(x, y);
            xs.push(sx);
            ys.push(sy);
        }
    }

    xs.iter()
        .zip(&ys)
        .map(|(&sx, &sy)| bilinear_sample(&source.data, source.width, source.height, sx, sy))
        .collect()
}

fn resample_strips(
    source: &Image,
    width: usize,
    height: usize,
    mapping: &GridMapping,
    strip_rows: usize,
) -> Vec<f64> {
    let mut out = vec![f64::NAN; width * height];
    let mut coords: Vec<(f64, f64)> = Vec::with_capacity(width * strip_rows.min(height));

    let mut row = 0;
    while row < height {
        let rows = strip_rows.min(height - row);
        coords.clear();
        for y in row..row + rows {
            for x in 0..width {
                coords.push(mapping.source_pixel(x, y));
            }
        }

        let strip = &mut out[row * width..(row + rows) * width];
        for (dst, &(sx, sy)) in strip.iter_mut().zip(&coords) {
            *dst = bilinear_sample(&source.data, source.width, source.height, sx, sy);
        }
        row += rows;
    }

    out
}

/// Trim two co-registered frames to where both have data.
///
/// Finds the bounding box of pixels finite in both, shrinks it by
/// `margin` pixels on every side and crops both frames to it. An empty
/// overlap yields two 0x0 images.
pub fn crop_to_common(
    a: &Image,
    b: &Image,
    margin: usize,
) -> Result<(Image, Image), ShapeMismatchError> {
    if a.shape() != b.shape() {
        return Err(ShapeMismatchError::Shape {
            left: a.shape(),
            right: b.shape(),
        });
    }

    let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
    let (mut max_x, mut max_y) = (0usize, 0usize);
    let mut any = false;
    for y in 0..a.height {
        for x in 0..a.width {
            if a.get(x, y).is_finite() && b.get(x, y).is_finite() {
                any = true;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
    }

    if !any || max_x < min_x + 2 * margin || max_y < min_y + 2 * margin {
        return Ok((a.crop(0, 0, 0, 0), b.crop(0, 0, 0, 0)));
    }

    let x0 = min_x + margin;
    let y0 = min_y + margin;
    let w = max_x - margin - x0 + 1;
    let h = max_y - margin - y0 + 1;
    Ok((a.crop(x0, y0, w, h), b.crop(x0, y0, w, h)))
}
