use crate::error::ShapeMismatchError;
use crate::image::{median, Image};

/// Cutoffs closer than this are the same cutoff
pub const CUTOFF_TOLERANCE: f64 = 1e-3;

/// Default cutoff as a multiple of the object-map median
pub const DEFAULT_CUTOFF_MULTIPLIER: f64 = 10.0;

/// Foreground occlusion mask, `true` where a source contaminates the pixel
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: usize,
    pub height: usize,
    pub bits: Vec<bool>,
}

impl Mask {
    pub fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn masked_count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    #[inline]
    pub fn is_masked(&self, x: usize, y: usize) -> bool {
        self.bits[y * self.width + x]
    }
}

/// Flag every object-map pixel at or above `multiplier * median`.
///
/// NaN pixels never reach the cutoff and stay unmasked. An all-NaN map
/// gives a NaN cutoff and an empty mask.
pub fn build_mask(object_map: &Image, multiplier: f64) -> (Mask, f64) {
    let cutoff = median(&object_map.data).map_or(f64::NAN, |m| multiplier * m);
    (threshold_mask(object_map, cutoff), cutoff)
}

/// Flag every pixel at or above a cutoff computed elsewhere, e.g. on the
/// native grid before the object map was regridded
pub fn threshold_mask(object_map: &Image, cutoff: f64) -> Mask {
    Mask {
        width: object_map.width,
        height: object_map.height,
        bits: object_map.data.iter().map(|&v| v >= cutoff).collect(),
    }
}

/// True when a mask built with `stored` no longer matches `fresh`
pub fn is_stale(stored: Option<f64>, fresh: f64) -> bool {
    match stored {
        Some(stored) => {
            let diff = (stored - fresh).abs();
            diff.is_nan() || diff > CUTOFF_TOLERANCE
        }
        None => true,
    }
}

/// Write `fill_value` into every masked pixel and record the cutoff.
/// The mask must have been built for an image of this shape.
pub fn apply_mask(
    image: &Image,
    mask: &Mask,
    cutoff: f64,
    fill_value: f64,
) -> Result<Image, ShapeMismatchError> {
    if image.shape() != mask.shape() {
        return Err(ShapeMismatchError::Shape {
            left: image.shape(),
            right: mask.shape(),
        });
    }
    let data = image
        .data
        .iter()
        .zip(&mask.bits)
        .map(|(&v, &masked)| if masked { fill_value } else { v })
        .collect();
    let mut out = image.with_data(data);
    out.metadata.mask_cutoff = Some(cutoff);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff_is_multiple_of_median() {
        let map = Image::new(3, 3, vec![1.0, 2.0, 3.0, 4.0, 4.0, 5.0, 6.0, 50.0, 40.0]);
        let (mask, cutoff) = build_mask(&map, 10.0);
        assert_eq!(cutoff, 40.0);
        assert_eq!(mask.masked_count(), 2);
        assert!(mask.is_masked(1, 2));
        assert!(mask.is_masked(2, 2));
        assert!(!mask.is_masked(0, 2));
    }

    #[test]
    fn test_idempotent() {
        let map = Image::from_fn(7, 5, |x, y| ((x * 31 + y * 17) % 13) as f64);
        let first = build_mask(&map, 1.5);
        let second = build_mask(&map, 1.5);
        assert_eq!(first, second);
    }

    #[test]
    fn test_nan_pixels_stay_unmasked() {
        let map = Image::new(2, 2, vec![f64::NAN, 1.0, 1.0, 1.0]);
        let (mask, cutoff) = build_mask(&map, 1.0);
        assert_eq!(cutoff, 1.0);
        assert_eq!(mask.bits, vec![false, true, true, true]);

        let empty = Image::filled(2, 2, f64::NAN);
        let (mask, cutoff) = build_mask(&empty, 10.0);
        assert!(cutoff.is_nan());
        assert_eq!(mask.masked_count(), 0);
    }

    #[test]
    fn test_threshold_mask_uses_given_cutoff() {
        let map = Image::new(2, 2, vec![1.0, 5.0, f64::NAN, 9.0]);
        let mask = threshold_mask(&map, 5.0);
        assert_eq!(mask.bits, vec![false, true, false, true]);
    }

    #[test]
    fn test_staleness_tolerance() {
        assert!(!is_stale(Some(40.0), 40.0));
        assert!(!is_stale(Some(40.0), 40.0009));
        assert!(is_stale(Some(40.0), 40.002));
        assert!(is_stale(Some(40.002), 40.0));
        assert!(is_stale(None, 40.0));
        assert!(is_stale(Some(f64::NAN), 40.0));
    }

    #[test]
    fn test_apply_mask_fills_and_records_cutoff() {
        let image = Image::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let mask = Mask {
            width: 2,
            height: 2,
            bits: vec![false, true, false, true],
        };
        let out = apply_mask(&image, &mask, 12.5, 0.0).unwrap();
        assert_eq!(out.data, vec![1.0, 0.0, 3.0, 0.0]);
        assert_eq!(out.metadata.mask_cutoff, Some(12.5));
    }

    #[test]
    fn test_apply_mask_rejects_other_shape() {
        let image = Image::new(3, 2, vec![1.0; 6]);
        let mask = Mask {
            width: 2,
            height: 3,
            bits: vec![true; 6],
        };
        let err = apply_mask(&image, &mask, 1.0, 0.0).unwrap_err();
        assert!(matches!(
            err,
            ShapeMismatchError::Shape {
                left: (3, 2),
                right: (2, 3)
            }
        ));
    }
}
