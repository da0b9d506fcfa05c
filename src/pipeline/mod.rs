//! Per-frame, per-band correlation pipeline
//!
//! Each raw optical frame is calibrated, plate solved, source extracted
//! and photometrically calibrated once; then for every cross frame of its
//! object it is convolved to the cross beam, masked, regridded, background
//! subtracted and correlated. Every stage that writes a file goes through
//! the [`crate::cache::StageCache`].

pub mod driver;
pub mod layout;
pub mod work_queue;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::background::{SurfaceModel, DEFAULT_INITIAL_PARAMS};
use crate::mask::DEFAULT_CUTOFF_MULTIPLIER;
use crate::regrid::ResampleMode;

pub use driver::{Collaborators, PipelineDriver};
pub use layout::Layout;
pub use work_queue::{Band, WorkItem, WorkQueue};

/// Number of bins per axis of the correlation histogram
pub const CORRELATION_BINS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Calibrate,
    Astrometry,
    Detect,
    MeasureBeam,
    Photometry,
    Convolve,
    Mask,
    Regrid,
    BackgroundSubtract,
    Correlate,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Calibrate => "calibrate",
            Stage::Astrometry => "astrometry",
            Stage::Detect => "detect",
            Stage::MeasureBeam => "measure-beam",
            Stage::Photometry => "photometry",
            Stage::Convolve => "convolve",
            Stage::Mask => "mask",
            Stage::Regrid => "regrid",
            Stage::BackgroundSubtract => "background-subtract",
            Stage::Correlate => "correlate",
        };
        f.write_str(name)
    }
}

/// Stages to recompute even when a valid cached output exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForceFlags {
    pub force_all: bool,
    pub force_calibrate: bool,
    /// Plate solving and source extraction
    pub force_astrometry: bool,
    pub force_photometry: bool,
    pub force_convolve: bool,
    pub force_regrid: bool,
    pub force_mask: bool,
    pub force_background_subtract: bool,
}

impl ForceFlags {
    pub fn all() -> Self {
        Self {
            force_all: true,
            ..Default::default()
        }
    }

    pub fn is_forced(&self, stage: Stage) -> bool {
        if self.force_all {
            return true;
        }
        match stage {
            Stage::Calibrate => self.force_calibrate,
            Stage::Astrometry | Stage::Detect => self.force_astrometry,
            Stage::Photometry => self.force_photometry,
            Stage::Convolve => self.force_convolve,
            // Masking happens on the regridded frame
            Stage::Mask => self.force_mask || self.force_regrid,
            Stage::Regrid => self.force_regrid,
            Stage::BackgroundSubtract => self.force_background_subtract,
            Stage::MeasureBeam | Stage::Correlate => false,
        }
    }
}

/// Everything a run needs, fixed before the first frame is touched
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub root: PathBuf,
    pub raw_dir: String,
    pub cal_dir: String,
    pub calibrated_dir: String,
    pub objects: Vec<String>,
    /// Explicit raw frames; empty means every frame of every object
    pub files: Vec<PathBuf>,
    pub cross_dir: PathBuf,
    /// Photometric reference catalogues
    pub reference_dir: PathBuf,
    pub resample_mode: ResampleMode,
    pub force: ForceFlags,
    pub mask_multiplier: f64,
    pub surface_model: SurfaceModel,
    pub initial_params: Vec<f64>,
    pub histogram_bins: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            raw_dir: "raw_lights".to_string(),
            cal_dir: "calframes".to_string(),
            calibrated_dir: "NCalibrated".to_string(),
            objects: Vec::new(),
            files: Vec::new(),
            cross_dir: PathBuf::from("../herschel"),
            reference_dir: PathBuf::from("APASS"),
            resample_mode: ResampleMode::Full,
            force: ForceFlags::default(),
            mask_multiplier: DEFAULT_CUTOFF_MULTIPLIER,
            surface_model: SurfaceModel::TiltedPlane,
            initial_params: DEFAULT_INITIAL_PARAMS.to_vec(),
            histogram_bins: CORRELATION_BINS,
        }
    }
}

/// Terminal state of one work item
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Correlated { plot: PathBuf, pairs: u64 },
    Skipped { stage: Stage, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub items: Vec<(WorkItem, ItemOutcome)>,
    /// Outputs each stage had to produce; cached stages are absent
    pub computed: BTreeMap<Stage, usize>,
}

impl RunSummary {
    pub fn correlated(&self) -> usize {
        self.items
            .iter()
            .filter(|(_, o)| matches!(o, ItemOutcome::Correlated { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.items.len() - self.correlated()
    }

    pub fn computed(&self, stage: Stage) -> usize {
        self.computed.get(&stage).copied().unwrap_or(0)
    }
}
