//! On-disk layout: `<root>/<object>/<stage dir>/<date>/<file>`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::convolve::BeamWidth;
use crate::utils::{derived_fits_name, frame_stem};

use super::work_queue::WorkItem;
use super::PipelineConfig;

pub const OBJECTS_DIR: &str = "objects";
pub const BACKGROUND_DIR: &str = "background";
pub const CATALOGUE_DIR: &str = "catalogue";
pub const MAGNITUDE_DIR: &str = "magnitudecalcs";
pub const PHOTOMETERED_DIR: &str = "photometered";
pub const REGRID_DIR: &str = "regrid";
pub const BACKSUB_DIR: &str = "backgroundsub";
pub const CORRELATIONS_DIR: &str = "correlations";

/// Suffix the calibration script gives dark subtracted, flat fielded frames
pub const CALIBRATED_SUFFIX: &str = "_ds_ff";

#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub root: PathBuf,
    pub raw_dir: String,
    pub cal_dir: String,
    pub calibrated_dir: String,
}

/// Per-frame files, shared by every band
#[derive(Debug, Clone)]
pub struct FramePaths {
    pub raw: PathBuf,
    pub calibrated: PathBuf,
    pub catalogue: PathBuf,
    pub objects: PathBuf,
    pub background: PathBuf,
    pub photometered: PathBuf,
    pub photo_objects: PathBuf,
    pub photo_background: PathBuf,
    /// Prefix for the photometry tool's diagnostic plots
    pub plot_prefix: PathBuf,
}

/// Files derived for one cross-instrument band
#[derive(Debug, Clone)]
pub struct BandPaths {
    pub convolved: PathBuf,
    pub convolved_objects: PathBuf,
    pub mask: PathBuf,
    pub regrid: PathBuf,
    pub regrid_cross: PathBuf,
    pub backsub: PathBuf,
    pub bgplane: PathBuf,
    pub correlation: PathBuf,
}

/// Immediate subdirectories, skipping hidden and dotted names
fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list directory: {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.contains('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn fits_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list directory: {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(".fits") || name.ends_with(".fit") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

impl Layout {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            root: config.root.clone(),
            raw_dir: config.raw_dir.clone(),
            cal_dir: config.cal_dir.clone(),
            calibrated_dir: config.calibrated_dir.clone(),
        }
    }

    pub fn dir(&self, object: &str, stage_dir: &str, date: &str) -> PathBuf {
        self.root.join(object).join(stage_dir).join(date)
    }

    pub fn calibrated_date_dir(&self, object: &str, date: &str) -> PathBuf {
        self.dir(object, &self.calibrated_dir, date)
    }

    /// Calibrated counterpart of a raw frame
    pub fn calibrated_path(&self, object: &str, date: &str, file: &str) -> PathBuf {
        let name = format!("{}{}.fits", frame_stem(file), CALIBRATED_SUFFIX);
        self.calibrated_date_dir(object, date).join(name)
    }

    pub fn raw_dates(&self, object: &str) -> Result<Vec<String>> {
        subdirectories(&self.root.join(object).join(&self.raw_dir))
    }

    pub fn raw_files(&self, object: &str, date: &str) -> Result<Vec<String>> {
        fits_files(&self.dir(object, &self.raw_dir, date))
    }

    pub fn frame_paths(&self, item: &WorkItem) -> FramePaths {
        let (object, date) = (item.object.as_str(), item.date.as_str());
        let stem = format!("{}{}", frame_stem(&item.file), CALIBRATED_SUFFIX);
        let in_dir = |dir: &str, name: String| self.dir(object, dir, date).join(name);

        FramePaths {
            raw: self.dir(object, &self.raw_dir, date).join(&item.file),
            calibrated: self.calibrated_path(object, date, &item.file),
            catalogue: in_dir(CATALOGUE_DIR, format!("{}.cat", stem)),
            objects: in_dir(OBJECTS_DIR, derived_fits_name(&stem, "_objects")),
            background: in_dir(BACKGROUND_DIR, derived_fits_name(&stem, "_background")),
            photometered: in_dir(PHOTOMETERED_DIR, derived_fits_name(&stem, "_photo")),
            photo_objects: in_dir(OBJECTS_DIR, derived_fits_name(&stem, "_photo_objects")),
            photo_background: in_dir(
                BACKGROUND_DIR,
                derived_fits_name(&stem, "_photo_background"),
            ),
            plot_prefix: in_dir(MAGNITUDE_DIR, stem),
        }
    }

    pub fn band_paths(&self, item: &WorkItem, target: BeamWidth) -> BandPaths {
        let (object, date) = (item.object.as_str(), item.date.as_str());
        let convolved = format!(
            "{}{}_photo_convto{}",
            frame_stem(&item.file),
            CALIBRATED_SUFFIX,
            target
        );
        let mask = format!("{}_mask", convolved);
        let regrid = format!("{}_regrid", mask);
        let backsub = format!("{}_backsub", regrid);
        let in_dir = |dir: &str, name: String| self.dir(object, dir, date).join(name);

        BandPaths {
            convolved: in_dir(PHOTOMETERED_DIR, derived_fits_name(&convolved, "")),
            convolved_objects: in_dir(OBJECTS_DIR, derived_fits_name(&convolved, "_objects")),
            mask: in_dir(PHOTOMETERED_DIR, derived_fits_name(&mask, "")),
            regrid: in_dir(REGRID_DIR, derived_fits_name(&regrid, "")),
            regrid_cross: in_dir(REGRID_DIR, derived_fits_name(&regrid, "_cross")),
            backsub: in_dir(BACKSUB_DIR, derived_fits_name(&backsub, "")),
            bgplane: in_dir(BACKGROUND_DIR, derived_fits_name(&convolved, "_bgplane")),
            correlation: in_dir(
                CORRELATIONS_DIR,
                format!("{}_{}.png", backsub, item.band.name()),
            ),
        }
    }
}
