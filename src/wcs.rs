//! World-coordinate solution
//!
//! Zero-based pixel centres go through the FITS reference pixel and CD
//! matrix to intermediate coordinates in degrees. Solutions whose CTYPE
//! names the TAN projection are then deprojected gnomonically onto the
//! sky around CRVAL; any other CTYPE is taken as a plain linear grid.
use nalgebra::{Matrix2, Vector2};
use std::collections::HashMap;

/// Header keywords owned by the solution
pub const WCS_KEYWORDS: &[&str] = &[
    "CRPIX1", "CRPIX2", "CRVAL1", "CRVAL2", "CDELT1", "CDELT2", "CD1_1", "CD1_2", "CD2_1",
    "CD2_2", "PC1_1", "PC1_2", "PC2_1", "PC2_2", "CTYPE1", "CTYPE2",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Gnomonic tangent-plane projection
    Tan,
    Linear,
}

impl Projection {
    fn from_ctype(ctype: &(String, String)) -> Self {
        if ctype.0.ends_with("-TAN") && ctype.1.ends_with("-TAN") {
            Projection::Tan
        } else {
            Projection::Linear
        }
    }
}

/// Keep right ascension in [0, 360)
fn wrap_degrees(lon: f64) -> f64 {
    let wrapped = lon.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Wcs {
    /// One-based reference pixel, as in the header
    pub crpix: Vector2<f64>,
    pub crval: Vector2<f64>,
    /// Degrees per pixel
    pub cd: Matrix2<f64>,
    pub ctype: (String, String),
}

impl Wcs {
    /// Axis-aligned TAN solution with square pixels of `scale` degrees,
    /// right ascension increasing to the left
    pub fn tangent(crpix: (f64, f64), crval: (f64, f64), scale: f64) -> Self {
        Self {
            crpix: Vector2::new(crpix.0, crpix.1),
            crval: Vector2::new(crval.0, crval.1),
            cd: Matrix2::new(-scale, 0.0, 0.0, scale),
            ctype: ("RA---TAN".to_string(), "DEC--TAN".to_string()),
        }
    }

    /// Read the solution from parsed header cards.
    ///
    /// Accepts a CD matrix, a PC matrix with CDELT, or CDELT alone.
    /// Returns `None` when the reference pixel, reference value or scale
    /// is missing.
    pub fn from_cards(cards: &HashMap<String, String>) -> Option<Self> {
        let get = |key: &str| cards.get(key).and_then(|v| v.trim().parse::<f64>().ok());

        let crpix = Vector2::new(get("CRPIX1")?, get("CRPIX2")?);
        let crval = Vector2::new(get("CRVAL1")?, get("CRVAL2")?);

        let cd = if let (Some(a), Some(d)) = (get("CD1_1"), get("CD2_2")) {
            Matrix2::new(
                a,
                get("CD1_2").unwrap_or(0.0),
                get("CD2_1").unwrap_or(0.0),
                d,
            )
        } else {
            let cdelt1 = get("CDELT1")?;
            let cdelt2 = get("CDELT2")?;
            let pc = Matrix2::new(
                get("PC1_1").unwrap_or(1.0),
                get("PC1_2").unwrap_or(0.0),
                get("PC2_1").unwrap_or(0.0),
                get("PC2_2").unwrap_or(1.0),
            );
            Matrix2::from_diagonal(&Vector2::new(cdelt1, cdelt2)) * pc
        };

        let ctype = (
            cards.get("CTYPE1").cloned().unwrap_or_default(),
            cards.get("CTYPE2").cloned().unwrap_or_default(),
        );

        Some(Self {
            crpix,
            crval,
            cd,
            ctype,
        })
    }

    /// Header cards describing this solution, CD matrix form
    pub fn to_cards(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("CRPIX1", self.crpix.x),
            ("CRPIX2", self.crpix.y),
            ("CRVAL1", self.crval.x),
            ("CRVAL2", self.crval.y),
            ("CD1_1", self.cd[(0, 0)]),
            ("CD1_2", self.cd[(0, 1)]),
            ("CD2_1", self.cd[(1, 0)]),
            ("CD2_2", self.cd[(1, 1)]),
        ]
    }

    pub fn projection(&self) -> Projection {
        Projection::from_ctype(&self.ctype)
    }

    /// Sky position in degrees of the zero-based pixel `(x, y)`
    pub fn pixel_to_world(&self, x: f64, y: f64) -> (f64, f64) {
        let offset = Vector2::new(x + 1.0, y + 1.0) - self.crpix;
        let plane = self.cd * offset;
        match self.projection() {
            Projection::Linear => {
                let world = self.crval + plane;
                (world.x, world.y)
            }
            Projection::Tan => {
                let (xi, eta) = (plane.x.to_radians(), plane.y.to_radians());
                let (sin_dec0, cos_dec0) = self.crval.y.to_radians().sin_cos();
                let denom = cos_dec0 - eta * sin_dec0;
                let ra = self.crval.x.to_radians() + xi.atan2(denom);
                let dec = (sin_dec0 + eta * cos_dec0).atan2(xi.hypot(denom));
                (wrap_degrees(ra.to_degrees()), dec.to_degrees())
            }
        }
    }

    /// Inverse mapping, `None` for a singular CD matrix
    pub fn inverse(&self) -> Option<InverseWcs> {
        self.cd.try_inverse().map(|inv_cd| InverseWcs {
            crpix: self.crpix,
            crval: self.crval,
            inv_cd,
            projection: self.projection(),
        })
    }

    /// Mean pixel size in arcseconds
    pub fn pixel_scale_arcsec(&self) -> f64 {
        self.cd.determinant().abs().sqrt() * 3600.0
    }

    /// Re-express the solution for a sub-image starting at `(dx, dy)`
    pub fn shift_origin(&mut self, dx: f64, dy: f64) {
        self.crpix -= Vector2::new(dx, dy);
    }
}

/// Precomputed world -> pixel mapping
#[derive(Debug, Clone)]
pub struct InverseWcs {
    crpix: Vector2<f64>,
    crval: Vector2<f64>,
    inv_cd: Matrix2<f64>,
    projection: Projection,
}

impl InverseWcs {
    /// Zero-based pixel of a sky position. Positions on the far
    /// hemisphere of a TAN solution have no pixel and give NaN.
    pub fn world_to_pixel(&self, lon: f64, lat: f64) -> (f64, f64) {
        let plane = match self.projection {
            Projection::Linear => Vector2::new(lon, lat) - self.crval,
            Projection::Tan => {
                let (sin_dec, cos_dec) = lat.to_radians().sin_cos();
                let (sin_dec0, cos_dec0) = self.crval.y.to_radians().sin_cos();
                let (sin_dra, cos_dra) = (lon - self.crval.x).to_radians().sin_cos();
                let cos_c = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_dra;
                if cos_c <= 0.0 {
                    return (f64::NAN, f64::NAN);
                }
                let xi = cos_dec * sin_dra / cos_c;
                let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_dra) / cos_c;
                Vector2::new(xi.to_degrees(), eta.to_degrees())
            }
        };
        let pix = self.inv_cd * plane + self.crpix;
        (pix.x - 1.0, pix.y - 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cards(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_round_trip_pixel_world() {
        let wcs = Wcs::tangent((50.5, 50.5), (120.0, 30.0), 0.001);
        let inverse = wcs.inverse().unwrap();
        let (lon, lat) = wcs.pixel_to_world(12.25, 80.0);
        let (x, y) = inverse.world_to_pixel(lon, lat);
        assert!((x - 12.25).abs() < 1e-9);
        assert!((y - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_reference_pixel_maps_to_reference_value() {
        let wcs = Wcs::tangent((10.0, 20.0), (1.5, -2.5), 0.01);
        let (lon, lat) = wcs.pixel_to_world(9.0, 19.0);
        assert!((lon - 1.5).abs() < 1e-12);
        assert!((lat + 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_from_cards_cdelt() {
        let wcs = Wcs::from_cards(&cards(&[
            ("CRPIX1", "1.0"),
            ("CRPIX2", "1.0"),
            ("CRVAL1", "10.0"),
            ("CRVAL2", "20.0"),
            ("CDELT1", "-0.002"),
            ("CDELT2", "0.002"),
            ("CTYPE1", "RA---TAN"),
        ]))
        .unwrap();
        assert_eq!(wcs.cd, Matrix2::new(-0.002, 0.0, 0.0, 0.002));
        assert!((wcs.pixel_scale_arcsec() - 7.2).abs() < 1e-9);
        assert_eq!(wcs.ctype.0, "RA---TAN");
    }

    #[test]
    fn test_from_cards_cd_matrix_wins() {
        let wcs = Wcs::from_cards(&cards(&[
            ("CRPIX1", "1.0"),
            ("CRPIX2", "1.0"),
            ("CRVAL1", "10.0"),
            ("CRVAL2", "20.0"),
            ("CD1_1", "-0.001"),
            ("CD2_2", "0.001"),
            ("CDELT1", "5.0"),
            ("CDELT2", "5.0"),
        ]))
        .unwrap();
        assert_eq!(wcs.cd[(0, 0)], -0.001);
    }

    #[test]
    fn test_from_cards_missing() {
        assert!(Wcs::from_cards(&cards(&[("CRPIX1", "1.0")])).is_none());
    }

    #[test]
    fn test_singular_matrix_has_no_inverse() {
        let mut wcs = Wcs::tangent((1.0, 1.0), (0.0, 0.0), 0.001);
        wcs.cd = Matrix2::new(1.0, 2.0, 2.0, 4.0);
        assert!(wcs.inverse().is_none());
    }

    #[test]
    fn test_offset_reference_at_high_declination() {
        // 0.1 degrees of right ascension at dec 60 is 0.05 degrees on the sky
        let source = Wcs::tangent((100.0, 100.0), (150.0, 60.0), 0.001);
        let target = Wcs::tangent((100.0, 100.0), (150.1, 60.0), 0.001);
        let (lon, lat) = target.pixel_to_world(99.0, 99.0);
        assert!((lon - 150.1).abs() < 1e-12);
        assert!((lat - 60.0).abs() < 1e-12);

        let (x, y) = source.inverse().unwrap().world_to_pixel(lon, lat);
        // Right ascension grows to the left
        assert!((x - (99.0 - 50.0)).abs() < 0.5, "x = {}", x);
        assert!((y - 99.0).abs() < 0.5, "y = {}", y);
    }

    #[test]
    fn test_right_ascension_wraps_at_zero() {
        let west = Wcs::tangent((50.0, 50.0), (359.99, 10.0), 0.001);
        let east = Wcs::tangent((50.0, 50.0), (0.01, 10.0), 0.001);

        let (lon, _) = west.pixel_to_world(0.0, 49.0);
        assert!((0.0..360.0).contains(&lon));
        assert!(lon < 1.0, "lon = {}", lon);

        let (lon, lat) = east.pixel_to_world(49.0, 49.0);
        let (x, y) = west.inverse().unwrap().world_to_pixel(lon, lat);
        let expected = 49.0 - 0.02 * 10f64.to_radians().cos() / 0.001;
        assert!((x - expected).abs() < 0.05, "x = {} expected {}", x, expected);
        assert!((y - 49.0).abs() < 0.05);
    }

    #[test]
    fn test_far_hemisphere_has_no_pixel() {
        let wcs = Wcs::tangent((1.0, 1.0), (0.0, 0.0), 0.001);
        let (x, y) = wcs.inverse().unwrap().world_to_pixel(180.0, 0.0);
        assert!(x.is_nan() && y.is_nan());
    }

    #[test]
    fn test_plain_ctype_stays_linear() {
        let mut wcs = Wcs::tangent((1.0, 1.0), (10.0, 60.0), 0.01);
        wcs.ctype = ("X".to_string(), "Y".to_string());
        assert_eq!(wcs.projection(), Projection::Linear);
        let (lon, lat) = wcs.pixel_to_world(10.0, 10.0);
        assert!((lon - 9.91).abs() < 1e-12);
        assert!((lat - 60.09).abs() < 1e-12);
    }

    #[test]
    fn test_shift_origin_keeps_sky_position() {
        let mut wcs = Wcs::tangent((50.0, 50.0), (3.0, 4.0), 0.001);
        let before = wcs.pixel_to_world(30.0, 40.0);
        wcs.shift_origin(10.0, 5.0);
        let after = wcs.pixel_to_world(20.0, 35.0);
        assert!((before.0 - after.0).abs() < 1e-12);
        assert!((before.1 - after.1).abs() < 1e-12);
    }
}
