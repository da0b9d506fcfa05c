use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, WriteBytesExt};
use fitrs::{Fits, FitsData, Hdu, HeaderValue};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::image::{Image, ImageMetadata};
use crate::wcs::{Wcs, WCS_KEYWORDS};

pub const KEY_PSCALX: &str = "PSCALX";
pub const KEY_PSCALY: &str = "PSCALY";
pub const KEY_FWHM: &str = "FWHM";
pub const KEY_FILTER: &str = "FILTNAM";
pub const KEY_ZERO_POINT: &str = "M0";
pub const KEY_CONVERSION: &str = "KJPADU";
pub const KEY_MASK_CUTOFF: &str = "MASKCUT";
pub const KEY_BACKSUB: &str = "BACKSUB";

/// Cards describing the data layout, regenerated on every write
const STRUCTURAL_KEYWORDS: &[&str] = &[
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "NAXIS3", "EXTEND", "BZERO", "BSCALE",
];

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;

/// Read the primary header of a FITS file into a keyword map
pub fn read_header(path: &Path) -> Result<HashMap<String, String>> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open FITS file: {}", path.display()))?;

    let mut header_data = Vec::new();
    'blocks: loop {
        let mut block = vec![0u8; BLOCK_SIZE];
        if file.read_exact(&mut block).is_err() {
            break;
        }
        header_data.extend_from_slice(&block);
        for card in block.chunks(CARD_SIZE) {
            if card.starts_with(b"END") && card[3..].iter().all(|&c| c == b' ') {
                break 'blocks;
            }
        }

        // Headers past 36 blocks are not something the pipeline writes
        if header_data.len() > 36 * BLOCK_SIZE {
            break;
        }
    }

    Ok(parse_header(&header_data))
}

/// Parse 80-character header cards into `KEYWORD -> value` pairs.
///
/// Quotes are stripped from string values, comments after `/` are dropped,
/// `COMMENT` and `HISTORY` cards are skipped.
pub fn parse_header(data: &[u8]) -> HashMap<String, String> {
    let mut keywords = HashMap::new();

    for chunk in data.chunks(CARD_SIZE) {
        let Ok(card) = std::str::from_utf8(chunk) else {
            continue;
        };
        let card = card.trim_end();

        if card.starts_with("END") && card.len() == 3 {
            break;
        }
        if card.is_empty() || card.starts_with("COMMENT") || card.starts_with("HISTORY") {
            continue;
        }

        let Some(eq_pos) = card.find('=') else {
            continue;
        };
        let keyword = card[..eq_pos].trim();
        if keyword.is_empty() {
            continue;
        }
        let value_part = card[eq_pos + 1..].trim_start();

        let value = if let Some(quoted) = value_part.strip_prefix('\'') {
            // '' inside a string is an escaped quote
            let mut out = String::new();
            let mut chars = quoted.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        out.push('\'');
                        chars.next();
                    } else {
                        break;
                    }
                } else {
                    out.push(c);
                }
            }
            out.trim_end().to_string()
        } else {
            match value_part.find('/') {
                Some(comment_pos) => value_part[..comment_pos].trim().to_string(),
                None => value_part.trim().to_string(),
            }
        };

        keywords.insert(keyword.to_string(), value);
    }

    keywords
}

fn header_int(hdu: &Hdu, key: &str) -> Result<usize> {
    match hdu.value(key) {
        Some(HeaderValue::IntegerNumber(n)) if *n >= 0 => Ok(*n as usize),
        Some(_) => Err(anyhow::anyhow!("{} is not a non-negative integer", key)),
        None => Err(anyhow::anyhow!("Missing {} header", key)),
    }
}

fn header_real(hdu: &Hdu, key: &str, default: f64) -> f64 {
    match hdu.value(key) {
        Some(HeaderValue::IntegerNumber(n)) => *n as f64,
        Some(HeaderValue::RealFloatingNumber(f)) => *f,
        _ => default,
    }
}

/// Load the primary HDU of a FITS file as a floating point image.
///
/// BZERO/BSCALE are applied to integer data; blank integers become NaN.
pub fn read_image(path: &Path) -> Result<Image> {
    let fits = Fits::open(path)
        .with_context(|| format!("Failed to open FITS file: {}", path.display()))?;
    let hdu = fits
        .get(0)
        .ok_or_else(|| anyhow::anyhow!("No primary HDU found in {}", path.display()))?;

    let naxis = header_int(&hdu, "NAXIS")?;
    if naxis < 2 {
        return Err(anyhow::anyhow!(
            "{} does not contain 2D image data (NAXIS={})",
            path.display(),
            naxis
        ));
    }
    let width = header_int(&hdu, "NAXIS1")?;
    let height = header_int(&hdu, "NAXIS2")?;
    let bzero = header_real(&hdu, "BZERO", 0.0);
    let bscale = header_real(&hdu, "BSCALE", 1.0);

    let data: Vec<f64> = match hdu.read_data() {
        FitsData::Characters(_) => {
            return Err(anyhow::anyhow!(
                "{} contains character data, not image data",
                path.display()
            ));
        }
        FitsData::IntegersI32(array) => array
            .data
            .iter()
            .map(|v| v.map_or(f64::NAN, |raw| bzero + bscale * raw as f64))
            .collect(),
        FitsData::IntegersU32(array) => array
            .data
            .iter()
            .map(|v| v.map_or(f64::NAN, |raw| bzero + bscale * raw as f64))
            .collect(),
        FitsData::FloatingPoint32(array) => array.data.iter().map(|&v| v as f64).collect(),
        FitsData::FloatingPoint64(array) => array.data.to_vec(),
    };

    // Only the first plane of a cube is used
    let plane = width * height;
    if data.len() < plane {
        return Err(anyhow::anyhow!(
            "Data size mismatch in {}: expected {} pixels, got {}",
            path.display(),
            plane,
            data.len()
        ));
    }
    let mut data = data;
    data.truncate(plane);

    let cards = read_header(path)?;
    let metadata = metadata_from_cards(&cards);

    Ok(Image::new(width, height, data).with_metadata(metadata))
}

/// Split header cards into typed metadata and passthrough extras
pub fn metadata_from_cards(cards: &HashMap<String, String>) -> ImageMetadata {
    let mut meta = ImageMetadata {
        wcs: Wcs::from_cards(cards),
        ..Default::default()
    };

    for (key, value) in cards {
        let key = key.as_str();
        if STRUCTURAL_KEYWORDS.contains(&key) {
            continue;
        }
        if meta.wcs.is_some() && WCS_KEYWORDS.contains(&key) {
            continue;
        }

        let number = value.trim().parse::<f64>().ok();
        let slot = match key {
            KEY_PSCALX => Some(&mut meta.pixel_scale_x),
            KEY_PSCALY => Some(&mut meta.pixel_scale_y),
            KEY_FWHM => Some(&mut meta.fwhm),
            KEY_ZERO_POINT => Some(&mut meta.zero_point),
            KEY_CONVERSION => Some(&mut meta.flux_conversion),
            KEY_MASK_CUTOFF => Some(&mut meta.mask_cutoff),
            _ => None,
        };
        match (slot, number) {
            (Some(slot), Some(n)) => *slot = Some(n),
            _ => match key {
                KEY_FILTER => meta.filter = Some(value.clone()),
                KEY_BACKSUB => {
                    meta.background_subtracted =
                        matches!(value.trim().to_uppercase().as_str(), "T" | "TRUE")
                }
                _ => {
                    meta.extra.insert(key.to_string(), value.clone());
                }
            },
        }
    }

    meta
}

/// Value field of a header card
#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Logical(bool),
    /// Integer or real, already formatted
    Number(String),
    Text(String),
}

impl CardValue {
    /// Real card value; FITS has no spelling for NaN or infinity
    pub fn real(value: f64) -> Option<Self> {
        value.is_finite().then(|| CardValue::Number(format_real(value)))
    }

    /// Turn a passthrough card value back into a typed value, keeping
    /// numeric text exactly as it was read
    fn passthrough(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed == "T" || trimmed == "F" {
            CardValue::Logical(trimmed == "T")
        } else if trimmed.parse::<i64>().is_ok() || trimmed.parse::<f64>().is_ok_and(f64::is_finite) {
            CardValue::Number(trimmed.to_string())
        } else {
            CardValue::Text(value.to_string())
        }
    }
}

/// Shortest exponent form that parses back to the same `f64`.
///
/// Never longer than 24 characters; anything over 20 goes into the card
/// in free format.
pub fn format_real(value: f64) -> String {
    if value == 0.0 {
        return "0.0".to_string();
    }
    let text = format!("{:E}", value);
    match text.split_once('E') {
        Some((mantissa, exponent)) if !mantissa.contains('.') => {
            format!("{}.0E{}", mantissa, exponent)
        }
        _ => text,
    }
}

/// Quoted string field, `''` escaped, at most 68 characters inside
fn quote(text: &str) -> String {
    let mut inner = String::new();
    for c in text.trim_end().chars() {
        let c = if c.is_ascii() && !c.is_ascii_control() { c } else { '?' };
        let width = if c == '\'' { 2 } else { 1 };
        if inner.len() + width > CARD_SIZE - 12 {
            break;
        }
        inner.push(c);
        if c == '\'' {
            inner.push('\'');
        }
    }
    format!("'{:<8}'", inner)
}

/// Format one 80-byte header card. Numbers and logicals end in column 30
/// when they fit, strings start in column 11.
pub fn format_card(keyword: &str, value: &CardValue) -> Result<[u8; CARD_SIZE]> {
    if keyword.is_empty() || keyword.len() > 8 || !keyword.is_ascii() {
        bail!("Invalid FITS keyword: {:?}", keyword);
    }
    let field = match value {
        CardValue::Logical(b) => format!("{:>20}", if *b { "T" } else { "F" }),
        CardValue::Number(text) => format!("{:>20}", text),
        CardValue::Text(text) => quote(text),
    };
    if field.len() > CARD_SIZE - 10 {
        bail!("Value of {} does not fit in a card", keyword);
    }

    let mut card = [b' '; CARD_SIZE];
    card[..keyword.len()].copy_from_slice(keyword.as_bytes());
    card[8] = b'=';
    card[10..10 + field.len()].copy_from_slice(field.as_bytes());
    Ok(card)
}

fn header_cards(image: &Image) -> Vec<(String, CardValue)> {
    let meta = &image.metadata;
    let number = |n: usize| CardValue::Number(n.to_string());
    let mut cards = vec![
        ("SIMPLE".to_string(), CardValue::Logical(true)),
        ("BITPIX".to_string(), CardValue::Number("-64".to_string())),
        ("NAXIS".to_string(), number(2)),
        ("NAXIS1".to_string(), number(image.width)),
        ("NAXIS2".to_string(), number(image.height)),
    ];

    let mut reals: Vec<(&str, Option<f64>)> = vec![
        (KEY_PSCALX, meta.pixel_scale_x),
        (KEY_PSCALY, meta.pixel_scale_y),
        (KEY_FWHM, meta.fwhm),
        (KEY_ZERO_POINT, meta.zero_point),
        (KEY_CONVERSION, meta.flux_conversion),
        (KEY_MASK_CUTOFF, meta.mask_cutoff),
    ];
    if let Some(wcs) = &meta.wcs {
        cards.push(("CTYPE1".to_string(), CardValue::Text(wcs.ctype.0.clone())));
        cards.push(("CTYPE2".to_string(), CardValue::Text(wcs.ctype.1.clone())));
        reals.extend(wcs.to_cards().into_iter().map(|(k, v)| (k, Some(v))));
    }
    for (key, value) in reals {
        let Some(value) = value else {
            continue;
        };
        match CardValue::real(value) {
            Some(card) => cards.push((key.to_string(), card)),
            None => tracing::warn!(key, value, "non-finite header value not written"),
        }
    }

    if let Some(filter) = &meta.filter {
        cards.push((KEY_FILTER.to_string(), CardValue::Text(filter.clone())));
    }
    if meta.background_subtracted {
        cards.push((KEY_BACKSUB.to_string(), CardValue::Text("TRUE".to_string())));
    }
    for (key, value) in &meta.extra {
        cards.push((key.clone(), CardValue::passthrough(value)));
    }
    cards
}

/// Write an image as a 64-bit float primary HDU, replacing any existing file
pub fn write_image(path: &Path, image: &Image) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let file = File::create(path)
        .with_context(|| format!("Failed to create FITS file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let mut header_len = 0;
    for (key, value) in header_cards(image) {
        match format_card(&key, &value) {
            Ok(card) => {
                writer.write_all(&card)?;
                header_len += CARD_SIZE;
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "header card dropped"),
        }
    }
    let mut end = [b' '; CARD_SIZE];
    end[..3].copy_from_slice(b"END");
    writer.write_all(&end)?;
    header_len += CARD_SIZE;
    writer.write_all(&vec![b' '; padding(header_len)])?;

    for value in &image.data {
        writer.write_f64::<BigEndian>(*value)?;
    }
    writer.write_all(&vec![0u8; padding(image.data.len() * 8)])?;

    writer
        .flush()
        .with_context(|| format!("Failed to write FITS file: {}", path.display()))?;
    Ok(())
}

fn padding(len: usize) -> usize {
    (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(text: &str) -> Vec<u8> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(CARD_SIZE, b' ');
        bytes
    }

    #[test]
    fn test_parse_header_cards() {
        let mut data = Vec::new();
        data.extend(card("SIMPLE  =                    T / conforms"));
        data.extend(card("FILTNAM = 'SloanG  '           / filter name"));
        data.extend(card("PSCALX  =                 2.85 / arcsec per pixel"));
        data.extend(card("OBSERVER= 'O''Neil / night'"));
        data.extend(card("HISTORY reduced"));
        data.extend(card("END"));
        data.extend(card("AFTER   = 1"));

        let keywords = parse_header(&data);
        assert_eq!(keywords.get("SIMPLE").map(String::as_str), Some("T"));
        assert_eq!(keywords.get("FILTNAM").map(String::as_str), Some("SloanG"));
        assert_eq!(keywords.get("PSCALX").map(String::as_str), Some("2.85"));
        assert_eq!(
            keywords.get("OBSERVER").map(String::as_str),
            Some("O'Neil / night")
        );
        assert!(!keywords.contains_key("HISTORY"));
        assert!(!keywords.contains_key("AFTER"));
    }

    #[test]
    fn test_metadata_from_cards() {
        let cards: HashMap<String, String> = [
            ("PSCALX", "2.8"),
            ("PSCALY", "2.6"),
            ("M0", "N/A"),
            ("KJPADU", "0.004"),
            ("FILTNAM", "Pol"),
            ("BACKSUB", "TRUE"),
            ("BITPIX", "-64"),
            ("OBJECT", "spi1_1"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let meta = metadata_from_cards(&cards);
        assert!((meta.pixel_scale().unwrap() - 2.7).abs() < 1e-12);
        assert_eq!(meta.zero_point, None);
        assert_eq!(meta.extra.get("M0").map(String::as_str), Some("N/A"));
        assert_eq!(meta.flux_conversion, Some(0.004));
        assert_eq!(meta.filter.as_deref(), Some("Pol"));
        assert!(meta.background_subtracted);
        assert!(!meta.extra.contains_key("BITPIX"));
        assert_eq!(meta.extra.get("OBJECT").map(String::as_str), Some("spi1_1"));
    }

    #[test]
    fn test_format_real_round_trips_exactly() {
        for value in [0.0, 1.0 / 3.0, -1.2345678901234567e-300, 6.0 / 3600.0, 1.0, -250.1] {
            let text = format_real(value);
            assert!(text.len() <= 24, "{} is too long", text);
            assert!(text.contains('.'), "{} has no decimal point", text);
            assert_eq!(text.parse::<f64>().unwrap(), value);
        }
        assert_eq!(format_real(0.0), "0.0");
        assert_eq!(format_real(1.0), "1.0E0");
        assert_eq!(CardValue::real(f64::NAN), None);
    }

    #[test]
    fn test_format_card_layout() {
        let card = format_card("PSCALX", &CardValue::real(2.85).unwrap()).unwrap();
        let text = std::str::from_utf8(&card).unwrap();
        assert_eq!(&text[..10], "PSCALX  = ");
        assert_eq!(text[10..30].trim_start(), "2.85E0");
        assert_eq!(&text[30..], " ".repeat(50));
        assert_eq!(text.len(), CARD_SIZE);

        let long = format_card("CD1_1", &CardValue::real(-1.2345678901234567e-300).unwrap()).unwrap();
        let parsed = parse_header(&long);
        assert_eq!(
            parsed.get("CD1_1").unwrap().parse::<f64>().unwrap(),
            -1.2345678901234567e-300
        );

        let quoted = format_card("OBSERVER", &CardValue::Text("O'Neil".to_string())).unwrap();
        let parsed = parse_header(&quoted);
        assert_eq!(parsed.get("OBSERVER").map(String::as_str), Some("O'Neil"));

        assert!(format_card("TOOLONGKEY", &CardValue::Logical(true)).is_err());
    }

    #[test]
    fn test_extreme_reals_survive_a_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reals.fits");

        let mut image = Image::filled(2, 2, 1.0);
        image.metadata.mask_cutoff = Some(0.0);
        image.metadata.zero_point = Some(1.0 / 3.0);
        image.metadata.flux_conversion = Some(-1.2345678901234567e-300);
        image.metadata.fwhm = Some(f64::INFINITY);
        image.metadata.wcs = Some(Wcs::tangent((1.5, 1.5), (10.0, -30.0), 6.0 / 3600.0));

        write_image(&path, &image).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len() as usize % BLOCK_SIZE, 0);

        let loaded = read_image(&path).unwrap();
        assert_eq!(loaded.metadata.mask_cutoff, Some(0.0));
        assert_eq!(loaded.metadata.zero_point, Some(1.0 / 3.0));
        assert_eq!(loaded.metadata.flux_conversion, Some(-1.2345678901234567e-300));
        assert_eq!(loaded.metadata.fwhm, None);
        assert_eq!(loaded.metadata.wcs, image.metadata.wcs);
        assert_eq!(loaded.data, image.data);
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");

        let mut image = Image::from_fn(5, 3, |x, y| x as f64 * 0.5 - y as f64);
        image.data[4] = f64::NAN;
        image.metadata.pixel_scale_x = Some(2.85);
        image.metadata.pixel_scale_y = Some(2.75);
        image.metadata.fwhm = Some(6.1);
        image.metadata.filter = Some("SloanR".to_string());
        image.metadata.zero_point = Some(21.37);
        image.metadata.flux_conversion = Some(0.0042);
        image.metadata.mask_cutoff = Some(40.0);
        image.metadata.background_subtracted = true;
        image.metadata.wcs = Some(Wcs::tangent((3.0, 2.0), (250.1, 70.3), 0.0008));
        image
            .metadata
            .extra
            .insert("OBJECT".to_string(), "PGM_1_2".to_string());
        image
            .metadata
            .extra
            .insert("EXPTIME".to_string(), "600".to_string());

        write_image(&path, &image).unwrap();
        let loaded = read_image(&path).unwrap();

        assert_eq!(loaded.shape(), (5, 3));
        for (a, b) in image.data.iter().zip(&loaded.data) {
            assert!(a == b || (a.is_nan() && b.is_nan()));
        }

        let close = |a: Option<f64>, b: Option<f64>| match (a, b) {
            (Some(a), Some(b)) => (a - b).abs() <= 1e-9 * a.abs().max(1.0),
            _ => false,
        };
        let (m, l) = (&image.metadata, &loaded.metadata);
        assert!(close(m.pixel_scale_x, l.pixel_scale_x));
        assert!(close(m.pixel_scale_y, l.pixel_scale_y));
        assert!(close(m.fwhm, l.fwhm));
        assert!(close(m.zero_point, l.zero_point));
        assert!(close(m.flux_conversion, l.flux_conversion));
        assert!(close(m.mask_cutoff, l.mask_cutoff));
        assert_eq!(l.filter.as_deref(), Some("SloanR"));
        assert!(l.background_subtracted);
        assert_eq!(l.extra.get("OBJECT").map(String::as_str), Some("PGM_1_2"));
        assert_eq!(l.extra.get("EXPTIME").map(String::as_str), Some("600"));

        let wcs = l.wcs.as_ref().unwrap();
        let (lon, lat) = wcs.pixel_to_world(2.0, 1.0);
        assert!((lon - 250.1).abs() < 1e-9);
        assert!((lat - 70.3).abs() < 1e-9);
    }
}
