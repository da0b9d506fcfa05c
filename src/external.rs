//! External collaborators: frame calibration, source extraction,
//! astrometry and photometric calibration.
//!
//! The pipeline only sees the traits. The `*Command` types run the real
//! tools as blocking child processes and judge success by exit status
//! and by the files the tool was expected to leave behind.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::PhotometryError;
use crate::fits::{self, KEY_CONVERSION, KEY_PSCALX, KEY_PSCALY, KEY_ZERO_POINT};

/// Dark subtraction and flat fielding of one night's raw frames
pub trait FrameCalibrator {
    fn calibrate(&self, object: &str, date: &str) -> Result<()>;
}

/// Source detection producing a catalogue plus object and background maps
pub trait SourceExtractor {
    fn extract(
        &self,
        image: &Path,
        catalogue: &Path,
        objects: &Path,
        background: &Path,
    ) -> Result<()>;
}

/// Plate solving; the solver writes the pixel scales into `image` in place
pub trait AstrometrySolver {
    fn solve(&self, image: &Path) -> Result<()>;
}

/// Result of a successful photometric calibration
#[derive(Debug, Clone, PartialEq)]
pub struct PhotometryOutcome {
    pub zero_point: f64,
    /// Multiplier taking ADU to kJy
    pub flux_conversion: f64,
}

pub trait PhotometryCalibrator {
    /// Calibrate `image` against the reference catalogues in
    /// `reference_dir`, writing the calibrated frame to `output` and
    /// diagnostic plots under the `plot` prefix
    fn calibrate(
        &self,
        image: &Path,
        catalogue: &Path,
        reference_dir: &Path,
        output: &Path,
        plot: &Path,
    ) -> Result<PhotometryOutcome, PhotometryError>;
}

/// Read the zero-point and flux conversion back from a calibrated frame.
///
/// A missing or non-numeric `M0` (the tool writes `N/A` when the fit
/// fails) means no zero-point could be derived.
pub fn photometry_from_header(path: &Path) -> Result<PhotometryOutcome, PhotometryError> {
    let cards = fits::read_header(path).map_err(|e| PhotometryError::Tool(format!("{:#}", e)))?;
    let zero_point = cards
        .get(KEY_ZERO_POINT)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .ok_or(PhotometryError::ZeroPointUnavailable)?;
    let flux_conversion = cards
        .get(KEY_CONVERSION)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .ok_or(PhotometryError::MissingConversion)?;
    Ok(PhotometryOutcome {
        zero_point,
        flux_conversion,
    })
}

fn run(mut cmd: Command, tool: &str) -> Result<()> {
    tracing::debug!(tool, command = ?cmd, "running external tool");
    let output = cmd
        .output()
        .with_context(|| format!("Failed to execute {}", tool))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::error!(tool, status = %output.status, stderr = %stderr, "external tool failed");
        bail!("{} exited with {}: {}", tool, output.status, stderr.trim());
    }
    Ok(())
}

fn require_outputs(tool: &str, outputs: &[&Path]) -> Result<()> {
    for path in outputs {
        if !path.exists() {
            bail!("{} did not produce {}", tool, path.display());
        }
    }
    Ok(())
}

/// Runs the calibration script with the directory layout as arguments:
/// `<script> <root> <object> <date> <cal dir> <raw dir> <dark masters>
/// <flat masters> <dark subtracted> <calibrated dir>`
#[derive(Debug, Clone)]
pub struct CalibrationScript {
    pub script: PathBuf,
    pub root: PathBuf,
    pub raw_dir: String,
    pub cal_dir: String,
    pub calibrated_dir: String,
}

impl FrameCalibrator for CalibrationScript {
    fn calibrate(&self, object: &str, date: &str) -> Result<()> {
        let mut cmd = Command::new(&self.script);
        cmd.arg(&self.root)
            .arg(object)
            .arg(date)
            .arg(&self.cal_dir)
            .arg(&self.raw_dir)
            .arg("dark_masters")
            .arg("flat_masters")
            .arg("dark_subtracted")
            .arg(&self.calibrated_dir);
        tracing::info!(object, date, "calibrating raw frames");
        run(cmd, "calibration script")
    }
}

/// SExtractor invocation
#[derive(Debug, Clone)]
pub struct SourceExtractorCommand {
    pub program: PathBuf,
    /// Output parameter list passed as `-PARAMETERS_NAME`
    pub parameters: PathBuf,
}

impl Default for SourceExtractorCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("sex"),
            parameters: PathBuf::from("photo.param"),
        }
    }
}

impl SourceExtractor for SourceExtractorCommand {
    fn extract(
        &self,
        image: &Path,
        catalogue: &Path,
        objects: &Path,
        background: &Path,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-PARAMETERS_NAME")
            .arg(&self.parameters)
            .arg("-CATALOG_NAME")
            .arg(catalogue)
            .arg("-CHECKIMAGE_TYPE")
            .arg("OBJECTS, BACKGROUND")
            .arg("-CHECKIMAGE_NAME")
            .arg(format!("{}, {}", objects.display(), background.display()))
            .arg(image);
        tracing::info!(image = %image.display(), "extracting sources");
        run(cmd, "source extractor")?;
        require_outputs("source extractor", &[catalogue, objects, background])
    }
}

/// Plate solver run as `<program> <image>`; the image must carry
/// `PSCALX`/`PSCALY` afterwards
#[derive(Debug, Clone)]
pub struct AstrometryCommand {
    pub program: PathBuf,
}

impl AstrometrySolver for AstrometryCommand {
    fn solve(&self, image: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(image);
        tracing::info!(image = %image.display(), "solving astrometry");
        run(cmd, "astrometry solver")?;

        let cards = fits::read_header(image)?;
        if !cards.contains_key(KEY_PSCALX) || !cards.contains_key(KEY_PSCALY) {
            bail!(
                "astrometry solver left no pixel scale in {}",
                image.display()
            );
        }
        Ok(())
    }
}

/// Photometry tool run as
/// `<program> <image> <catalogue> <reference dir> <output> <plot prefix>`
#[derive(Debug, Clone)]
pub struct PhotometryCommand {
    pub program: PathBuf,
}

impl PhotometryCalibrator for PhotometryCommand {
    fn calibrate(
        &self,
        image: &Path,
        catalogue: &Path,
        reference_dir: &Path,
        output: &Path,
        plot: &Path,
    ) -> Result<PhotometryOutcome, PhotometryError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(image)
            .arg(catalogue)
            .arg(reference_dir)
            .arg(output)
            .arg(plot);
        tracing::info!(image = %image.display(), "running photometric calibration");
        run(cmd, "photometry tool").map_err(|e| PhotometryError::Tool(format!("{:#}", e)))?;
        if !output.exists() {
            return Err(PhotometryError::Tool(format!(
                "no calibrated frame at {}",
                output.display()
            )));
        }
        photometry_from_header(output)
    }
}
