use bumpalo::Bump;
use std::collections::BTreeMap;

use crate::wcs::Wcs;

/// Header-derived properties carried alongside the pixel data
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    /// Pixel scale along x in arcsec/pixel (PSCALX)
    pub pixel_scale_x: Option<f64>,
    /// Pixel scale along y in arcsec/pixel (PSCALY)
    pub pixel_scale_y: Option<f64>,
    /// Native beam width in arcseconds (FWHM)
    pub fwhm: Option<f64>,
    pub filter: Option<String>,
    /// Photometric zero-point (M0)
    pub zero_point: Option<f64>,
    /// ADU to kJy conversion factor (KJPADU)
    pub flux_conversion: Option<f64>,
    /// Cutoff the stored mask was built with (MASKCUT)
    pub mask_cutoff: Option<f64>,
    pub background_subtracted: bool,
    pub wcs: Option<Wcs>,
    /// Every other header card, carried through unchanged
    pub extra: BTreeMap<String, String>,
}

impl ImageMetadata {
    /// Average of the two astrometric pixel scales
    pub fn pixel_scale(&self) -> Option<f64> {
        match (self.pixel_scale_x, self.pixel_scale_y) {
            (Some(x), Some(y)) => Some((x + y) / 2.0),
            (Some(s), None) | (None, Some(s)) => Some(s),
            (None, None) => None,
        }
    }

    pub fn set_pixel_scale(&mut self, scale: f64) {
        self.pixel_scale_x = Some(scale);
        self.pixel_scale_y = Some(scale);
    }
}

/// Floating point image, row-major, NaN marks missing data
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ImageStatistics {
    pub width: usize,
    pub height: usize,
    /// Number of finite pixels the rest was computed over
    pub valid_pixels: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl Image {
    pub fn new(width: usize, height: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self {
            width,
            height,
            data,
            metadata: ImageMetadata::default(),
        }
    }

    pub fn filled(width: usize, height: usize, value: f64) -> Self {
        Self::new(width, height, vec![value; width * height])
    }

    /// Build an image by evaluating `f(x, y)` at every pixel
    pub fn from_fn<F>(width: usize, height: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> f64,
    {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self::new(width, height, data)
    }

    pub fn with_metadata(mut self, metadata: ImageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f64) {
        self.data[y * self.width + x] = value;
    }

    /// Same grid and metadata, new pixel values
    pub fn with_data(&self, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), self.data.len());
        Self {
            width: self.width,
            height: self.height,
            data,
            metadata: self.metadata.clone(),
        }
    }

    /// Multiply every pixel by `factor` (flux unit conversion)
    pub fn scaled(&self, factor: f64) -> Self {
        self.with_data(self.data.iter().map(|v| v * factor).collect())
    }

    /// Copy out the sub-rectangle `[x0, x0 + w) x [y0, y0 + h)`
    pub fn crop(&self, x0: usize, y0: usize, w: usize, h: usize) -> Self {
        let mut data = Vec::with_capacity(w * h);
        for y in y0..y0 + h {
            let start = y * self.width + x0;
            data.extend_from_slice(&self.data[start..start + w]);
        }
        let mut metadata = self.metadata.clone();
        if let Some(wcs) = metadata.wcs.as_mut() {
            wcs.shift_origin(x0 as f64, y0 as f64);
        }
        Self {
            width: w,
            height: h,
            data,
            metadata,
        }
    }

    pub fn finite_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_finite()).count()
    }

    pub fn median(&self) -> Option<f64> {
        median(&self.data)
    }

    /// Statistics over finite pixels, `None` when there are none
    pub fn statistics(&self) -> Option<ImageStatistics> {
        let arena = Bump::new();
        let mut sorted = bumpalo::collections::Vec::with_capacity_in(self.data.len(), &arena);
        sorted.extend(self.data.iter().copied().filter(|v| v.is_finite()));
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let variance = if n > 1 {
            sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };

        Some(ImageStatistics {
            width: self.width,
            height: self.height,
            valid_pixels: n,
            mean,
            median: median_of_sorted(&sorted),
            std_dev: variance.sqrt(),
            min: sorted[0],
            max: sorted[n - 1],
        })
    }
}

/// Median of the finite values, `None` if there are none
pub fn median(values: &[f64]) -> Option<f64> {
    let arena = Bump::new();
    let mut sorted = bumpalo::collections::Vec::with_capacity_in(values.len(), &arena);
    sorted.extend(values.iter().copied().filter(|v| v.is_finite()));
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(median_of_sorted(&sorted))
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
