use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::background::SurfaceModel;
use crate::external::{
    AstrometryCommand, CalibrationScript, PhotometryCommand, SourceExtractorCommand,
};
use crate::pipeline::work_queue::split_frame_path;
use crate::pipeline::{ForceFlags, PipelineConfig, CORRELATION_BINS};
use crate::regrid::ResampleMode;

#[derive(Parser, Debug)]
#[command(name = "sky-correlate")]
#[command(
    about = "Correlate optical frames against far-infrared maps pixel by pixel",
    long_about = None
)]
pub struct Cli {
    /// Print processing steps and extra information
    #[arg(short, long)]
    pub verbose: bool,

    /// Regrid strip by strip instead of building the full coordinate map
    #[arg(short, long)]
    pub lowmemory: bool,

    /// Parent directory holding one directory per object
    #[arg(short = 'd', long = "io-dir", default_value = ".")]
    pub io_dir: PathBuf,

    /// Subdirectory of each object holding raw frames
    #[arg(long, default_value = "raw_lights")]
    pub raw_dir: String,

    /// Subdirectory of each object holding calibration frames
    #[arg(long, default_value = "calframes")]
    pub cal_dir: String,

    /// Comma separated object names
    #[arg(short, long, value_delimiter = ',', default_value = "PGM_1_2,spi1_1")]
    pub objects: Vec<String>,

    /// Subdirectory holding dark subtracted, flat fielded frames
    #[arg(short, long, default_value = "NCalibrated")]
    pub sub: String,

    /// Comma separated raw frame paths; empty processes every frame
    #[arg(short, long, value_delimiter = ',')]
    pub files: Vec<PathBuf>,

    /// Directory of the frames to correlate with
    #[arg(short = 'x', long, default_value = "../herschel")]
    pub cross: PathBuf,

    /// Directory of the photometric reference catalogues
    #[arg(short, long, default_value = "APASS")]
    pub apass: PathBuf,

    /// Background surface: plane or quadratic
    #[arg(long, default_value = "plane")]
    pub model: SurfaceModel,

    /// Mask cutoff as a multiple of the convolved object map median
    #[arg(long, default_value_t = crate::mask::DEFAULT_CUTOFF_MULTIPLIER)]
    pub mask_multiplier: f64,

    /// Correlation histogram bins per axis
    #[arg(long, default_value_t = CORRELATION_BINS)]
    pub bins: usize,

    #[command(flatten)]
    pub tools: ToolOptions,

    #[command(flatten)]
    pub force: ForceOptions,
}

#[derive(Parser, Debug, Clone)]
pub struct ToolOptions {
    /// Night calibration script
    #[arg(long, default_value = "./calibratedata.sh")]
    pub calibration_script: PathBuf,

    /// Source extractor executable
    #[arg(long, default_value = "sex")]
    pub sextractor: PathBuf,

    /// Source extractor output parameter file
    #[arg(long, default_value = "photo.param")]
    pub sextractor_params: PathBuf,

    /// Plate solver writing PSCALX/PSCALY into the frame
    #[arg(long, default_value = "callastrometry")]
    pub astrometry_tool: PathBuf,

    /// Photometric calibration tool
    #[arg(long, default_value = "photometry")]
    pub photometry_tool: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct ForceOptions {
    /// Regenerate every stage, cached or not
    #[arg(short, long)]
    pub generate: bool,

    /// Recalibrate raw frames
    #[arg(short = 'q', long)]
    pub calibrate: bool,

    /// Redo astrometry and source extraction
    #[arg(short = 'w', long)]
    pub astro: bool,

    /// Redo photometric calibration
    #[arg(short, long)]
    pub photometry: bool,

    /// Redo resolution matching
    #[arg(short, long)]
    pub convolve: bool,

    /// Redo regridding
    #[arg(short, long)]
    pub regrid: bool,

    /// Redo masking
    #[arg(short, long)]
    pub mask: bool,

    /// Redo background plane subtraction
    #[arg(short, long)]
    pub backsub: bool,
}

impl ForceOptions {
    pub fn to_force_flags(&self) -> ForceFlags {
        ForceFlags {
            force_all: self.generate,
            force_calibrate: self.calibrate,
            force_astrometry: self.astro,
            force_photometry: self.photometry,
            force_convolve: self.convolve,
            force_regrid: self.regrid,
            force_mask: self.mask,
            force_background_subtract: self.backsub,
        }
    }
}

impl ToolOptions {
    pub fn calibration(&self, config: &PipelineConfig) -> CalibrationScript {
        CalibrationScript {
            script: self.calibration_script.clone(),
            root: config.root.clone(),
            raw_dir: config.raw_dir.clone(),
            cal_dir: config.cal_dir.clone(),
            calibrated_dir: config.calibrated_dir.clone(),
        }
    }

    pub fn source_extractor(&self) -> SourceExtractorCommand {
        SourceExtractorCommand {
            program: self.sextractor.clone(),
            parameters: self.sextractor_params.clone(),
        }
    }

    pub fn astrometry_solver(&self) -> AstrometryCommand {
        AstrometryCommand {
            program: self.astrometry_tool.clone(),
        }
    }

    pub fn photometry_calibrator(&self) -> PhotometryCommand {
        PhotometryCommand {
            program: self.photometry_tool.clone(),
        }
    }
}

fn trim_dir(name: &str) -> String {
    name.trim().trim_matches('/').to_string()
}

impl Cli {
    /// Freeze the options into the run configuration. With explicit
    /// files the data root is taken from the first of them.
    pub fn to_pipeline_config(&self) -> Result<PipelineConfig> {
        let raw_dir = trim_dir(&self.raw_dir);
        let files: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|f| !f.as_os_str().is_empty())
            .cloned()
            .collect();
        let root = match files.first() {
            Some(first) => split_frame_path(first, &raw_dir)?.root,
            None => self.io_dir.clone(),
        };

        Ok(PipelineConfig {
            root,
            raw_dir,
            cal_dir: trim_dir(&self.cal_dir),
            calibrated_dir: trim_dir(&self.sub),
            objects: self
                .objects
                .iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            files,
            cross_dir: self.cross.clone(),
            reference_dir: self.apass.clone(),
            resample_mode: if self.lowmemory {
                ResampleMode::low_memory()
            } else {
                ResampleMode::Full
            },
            force: self.force.to_force_flags(),
            mask_multiplier: self.mask_multiplier,
            surface_model: self.model,
            histogram_bins: self.bins,
            ..Default::default()
        })
    }
}
