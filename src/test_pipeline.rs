use std::cell::Cell;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

use crate::error::PhotometryError;
use crate::external::{
    AstrometrySolver, FrameCalibrator, PhotometryCalibrator, PhotometryOutcome, SourceExtractor,
};
use crate::fits;
use crate::image::Image;
use crate::pipeline::{
    Collaborators, ForceFlags, ItemOutcome, Layout, PipelineConfig, PipelineDriver, RunSummary,
    Stage,
};
use crate::wcs::Wcs;

const OBJECT: &str = "M31";
const DATE: &str = "2016-03-01";
const FRAME: &str = "a_001.fits";
const CENTRE: (f64, f64) = (150.0, 2.0);
const OPTICAL_SIZE: usize = 80;
const OPTICAL_SCALE: f64 = 2.85;
const CROSS_SIZE: usize = 20;
const CROSS_SCALE: f64 = 6.0;

struct CalibratorSpy {
    layout: Layout,
    calls: Cell<usize>,
}

impl FrameCalibrator for CalibratorSpy {
    fn calibrate(&self, object: &str, date: &str) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        for file in self.layout.raw_files(object, date)? {
            let raw = self.layout.dir(object, &self.layout.raw_dir, date).join(&file);
            let image = fits::read_image(&raw)?;
            fits::write_image(&self.layout.calibrated_path(object, date, &file), &image)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct SolverSpy {
    calls: Cell<usize>,
}

impl AstrometrySolver for SolverSpy {
    fn solve(&self, image: &Path) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        let mut frame = fits::read_image(image)?;
        let crpix = (OPTICAL_SIZE as f64 + 1.0) / 2.0;
        frame.metadata.set_pixel_scale(OPTICAL_SCALE);
        frame.metadata.wcs = Some(Wcs::tangent((crpix, crpix), CENTRE, OPTICAL_SCALE / 3600.0));
        fits::write_image(image, &frame)
    }
}

#[derive(Default)]
struct ExtractorSpy {
    calls: Cell<usize>,
}

impl SourceExtractor for ExtractorSpy {
    fn extract(
        &self,
        image: &Path,
        catalogue: &Path,
        objects: &Path,
        background: &Path,
    ) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        let frame = fits::read_image(image)?;

        if let Some(parent) = catalogue.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            catalogue,
            "#   1 FLAGS\n#   2 FWHM_IMAGE\n 0 2.0\n 0 2.2\n 4 9.0\n",
        )?;

        let blob = |x: usize, y: usize, cx: f64, cy: f64| {
            let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
            1000.0 * (-r2 / (2.0 * 1.5 * 1.5)).exp()
        };
        let object_map = Image::from_fn(frame.width, frame.height, |x, y| {
            1.0 + blob(x, y, 35.0, 38.0) + blob(x, y, 46.0, 42.0)
        })
        .with_metadata(frame.metadata.clone());
        fits::write_image(objects, &object_map)?;

        let background_map = Image::filled(frame.width, frame.height, 100.0)
            .with_metadata(frame.metadata.clone());
        fits::write_image(background, &background_map)
    }
}

struct PhotometrySpy {
    zero_point: Option<f64>,
    calls: Cell<usize>,
}

impl PhotometrySpy {
    fn new(zero_point: Option<f64>) -> Self {
        Self {
            zero_point,
            calls: Cell::new(0),
        }
    }
}

impl PhotometryCalibrator for PhotometrySpy {
    fn calibrate(
        &self,
        image: &Path,
        _catalogue: &Path,
        _reference_dir: &Path,
        output: &Path,
        _plot: &Path,
    ) -> Result<PhotometryOutcome, PhotometryError> {
        self.calls.set(self.calls.get() + 1);
        let zero_point = self.zero_point.ok_or(PhotometryError::ZeroPointUnavailable)?;
        let outcome = PhotometryOutcome {
            zero_point,
            flux_conversion: 0.5,
        };

        let mut frame =
            fits::read_image(image).map_err(|e| PhotometryError::Tool(e.to_string()))?;
        frame.metadata.zero_point = Some(outcome.zero_point);
        frame.metadata.flux_conversion = Some(outcome.flux_conversion);
        let frame = frame.scaled(outcome.flux_conversion);
        fits::write_image(output, &frame).map_err(|e| PhotometryError::Tool(e.to_string()))?;
        Ok(outcome)
    }
}

struct Spies {
    calibrator: CalibratorSpy,
    solver: SolverSpy,
    extractor: ExtractorSpy,
    photometry: PhotometrySpy,
}

impl Spies {
    fn new(config: &PipelineConfig, zero_point: Option<f64>) -> Self {
        Self {
            calibrator: CalibratorSpy {
                layout: Layout::from_config(config),
                calls: Cell::new(0),
            },
            solver: SolverSpy::default(),
            extractor: ExtractorSpy::default(),
            photometry: PhotometrySpy::new(zero_point),
        }
    }

    fn tools(&self) -> Collaborators<'_> {
        Collaborators {
            calibrator: &self.calibrator,
            extractor: &self.extractor,
            solver: &self.solver,
            photometry: &self.photometry,
        }
    }

    fn calls(&self) -> [usize; 4] {
        [
            self.calibrator.calls.get(),
            self.solver.calls.get(),
            self.extractor.calls.get(),
            self.photometry.calls.get(),
        ]
    }
}

/// Scratch data root with one raw frame and one PSW cross frame
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(filter: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Self { dir };

        let mut raw = Image::from_fn(OPTICAL_SIZE, OPTICAL_SIZE, |x, y| {
            let (x, y) = (x as f64, y as f64);
            100.0 + 0.5 * x + 0.3 * y + 5.0 * (x / 4.0).sin() * (y / 5.0).cos()
        });
        raw.metadata.filter = Some(filter.to_string());
        let raw_path = fixture
            .root()
            .join(OBJECT)
            .join("raw_lights")
            .join(DATE)
            .join(FRAME);
        fits::write_image(&raw_path, &raw).unwrap();

        let crpix = (CROSS_SIZE as f64 + 1.0) / 2.0;
        let mut cross = Image::from_fn(CROSS_SIZE, CROSS_SIZE, |x, y| {
            let (x, y) = (x as f64, y as f64);
            3.0 + (x / 3.0).sin() + (y / 2.0).cos() + 0.05 * x * y
        });
        cross.metadata.wcs = Some(Wcs::tangent((crpix, crpix), CENTRE, CROSS_SCALE / 3600.0));
        fits::write_image(&fixture.cross_path(), &cross).unwrap();

        fixture
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn cross_path(&self) -> PathBuf {
        self.dir
            .path()
            .join("herschel")
            .join(OBJECT)
            .join(format!("{}_PSW_reindex.fits", OBJECT))
    }

    fn config(&self, force: ForceFlags) -> PipelineConfig {
        PipelineConfig {
            root: self.root(),
            objects: vec![OBJECT.to_string()],
            cross_dir: self.dir.path().join("herschel"),
            reference_dir: self.dir.path().join("APASS"),
            force,
            ..Default::default()
        }
    }
}

fn run(config: &PipelineConfig, spies: &Spies) -> RunSummary {
    PipelineDriver::new(config, spies.tools()).run().unwrap()
}

fn single_outcome(summary: &RunSummary) -> &ItemOutcome {
    assert_eq!(summary.items.len(), 1);
    &summary.items[0].1
}

#[test]
fn test_full_run_correlates_and_writes_plot() {
    let fixture = Fixture::new("r");
    let config = fixture.config(ForceFlags::default());
    let spies = Spies::new(&config, Some(27.0));

    let summary = run(&config, &spies);
    assert_eq!(spies.calls(), [1, 1, 1, 1]);
    assert_eq!(summary.correlated(), 1);

    let ItemOutcome::Correlated { plot, pairs } = single_outcome(&summary) else {
        panic!("expected a correlation, got {:?}", summary.items);
    };
    assert!(plot.exists());
    assert!(*pairs > 0);
    assert!(plot
        .to_string_lossy()
        .ends_with("a_001_ds_ff_photo_convto17.6_mask_regrid_backsub_PSW.png"));

    let layout = Layout::from_config(&config);
    let item = &summary.items[0].0;
    let frame = layout.frame_paths(item);
    let calibrated = fits::read_image(&frame.calibrated).unwrap();
    let beam = calibrated.metadata.fwhm.unwrap();
    assert!((beam - 2.1 * OPTICAL_SCALE).abs() < 1e-6);

    let band = layout.band_paths(item, item.band.beam());
    let residual = fits::read_image(&band.backsub).unwrap();
    let plane = fits::read_image(&band.bgplane).unwrap();
    let regridded = fits::read_image(&band.regrid).unwrap();
    assert!(residual.metadata.background_subtracted);
    for ((r, p), i) in residual.data.iter().zip(&plane.data).zip(&regridded.data) {
        if i.is_finite() {
            assert!((r + p - i).abs() < 1e-6);
        }
    }

    let mask = fits::read_image(&band.mask).unwrap();
    assert!(mask.metadata.mask_cutoff.is_some());
    assert!(mask.data.iter().any(|v| *v == 0.0));
}

#[test]
fn test_second_run_reuses_cached_stages() {
    let fixture = Fixture::new("r");
    let config = fixture.config(ForceFlags::default());

    let first = Spies::new(&config, Some(27.0));
    run(&config, &first);

    let second = Spies::new(&config, Some(27.0));
    let summary = run(&config, &second);
    assert_eq!(second.calls(), [0, 0, 0, 0]);
    assert!(summary.computed.is_empty(), "{:?}", summary.computed);
    assert!(matches!(
        single_outcome(&summary),
        ItemOutcome::Correlated { .. }
    ));
}

#[test]
fn test_forced_photometry_only_reruns_photometry() {
    let fixture = Fixture::new("r");
    run(
        &fixture.config(ForceFlags::default()),
        &Spies::new(&fixture.config(ForceFlags::default()), Some(27.0)),
    );

    let config = fixture.config(ForceFlags {
        force_photometry: true,
        ..Default::default()
    });
    let spies = Spies::new(&config, Some(27.0));
    let summary = run(&config, &spies);
    assert_eq!(spies.calls(), [0, 0, 0, 1]);
    assert_eq!(summary.correlated(), 1);
}

#[test]
fn test_forced_convolution_regenerates_later_stages() {
    let fixture = Fixture::new("r");
    let config = fixture.config(ForceFlags::default());
    run(&config, &Spies::new(&config, Some(27.0)));

    let config = fixture.config(ForceFlags {
        force_convolve: true,
        ..Default::default()
    });
    let spies = Spies::new(&config, Some(27.0));
    let summary = run(&config, &spies);
    assert_eq!(spies.calls(), [0, 0, 0, 0]);
    assert_eq!(summary.computed(Stage::Photometry), 0);
    assert_eq!(summary.computed(Stage::Convolve), 2);
    assert_eq!(summary.computed(Stage::Mask), 1);
    assert_eq!(summary.computed(Stage::Regrid), 1);
    assert_eq!(summary.computed(Stage::BackgroundSubtract), 1);
}

#[test]
fn test_new_mask_cutoff_matches_a_fresh_run() {
    let fixture = Fixture::new("r");
    let config = fixture.config(ForceFlags::default());
    run(&config, &Spies::new(&config, Some(27.0)));

    let rerun = PipelineConfig {
        mask_multiplier: 1.2,
        ..fixture.config(ForceFlags::default())
    };
    let summary = run(&rerun, &Spies::new(&rerun, Some(27.0)));
    assert_eq!(summary.correlated(), 1);
    assert_eq!(summary.computed(Stage::Convolve), 0);
    assert_eq!(summary.computed(Stage::Mask), 1);
    assert_eq!(summary.computed(Stage::Regrid), 1);
    assert_eq!(summary.computed(Stage::BackgroundSubtract), 1);

    let fresh_fixture = Fixture::new("r");
    let fresh = PipelineConfig {
        mask_multiplier: 1.2,
        ..fresh_fixture.config(ForceFlags::default())
    };
    let fresh_summary = run(&fresh, &Spies::new(&fresh, Some(27.0)));

    let band_of = |config: &PipelineConfig, summary: &RunSummary| {
        let layout = Layout::from_config(config);
        let item = &summary.items[0].0;
        layout.band_paths(item, item.band.beam())
    };
    let rerun_band = band_of(&rerun, &summary);
    let fresh_band = band_of(&fresh, &fresh_summary);
    for (rerun_path, fresh_path) in [
        (&rerun_band.mask, &fresh_band.mask),
        (&rerun_band.regrid, &fresh_band.regrid),
        (&rerun_band.backsub, &fresh_band.backsub),
    ] {
        let rerun_image = fits::read_image(rerun_path).unwrap();
        let fresh_image = fits::read_image(fresh_path).unwrap();
        assert_eq!(rerun_image.shape(), fresh_image.shape());
        for (a, b) in rerun_image.data.iter().zip(&fresh_image.data) {
            assert!(a == b || (a.is_nan() && b.is_nan()), "{} vs {}", a, b);
        }
    }
}

#[test]
fn test_fully_masked_frame_skips_background_subtraction() {
    let fixture = Fixture::new("r");
    let config = PipelineConfig {
        mask_multiplier: 1e-6,
        ..fixture.config(ForceFlags::default())
    };
    let spies = Spies::new(&config, Some(27.0));

    let summary = run(&config, &spies);
    assert_eq!(summary.correlated(), 0);
    assert!(matches!(
        single_outcome(&summary),
        ItemOutcome::Skipped {
            stage: Stage::BackgroundSubtract,
            ..
        }
    ));
    assert_eq!(summary.computed(Stage::BackgroundSubtract), 0);
}

#[test]
fn test_force_all_reruns_every_tool_once() {
    let fixture = Fixture::new("r");
    let config = fixture.config(ForceFlags::all());
    let spies = Spies::new(&config, Some(27.0));
    run(&config, &spies);
    run(&config, &spies);
    // Each driver computes a stage at most once
    assert_eq!(spies.calls(), [2, 2, 2, 2]);
}

#[test]
fn test_polarization_frame_is_skipped() {
    let fixture = Fixture::new("Pol");
    let config = fixture.config(ForceFlags::default());
    let spies = Spies::new(&config, Some(27.0));

    let summary = run(&config, &spies);
    assert_eq!(spies.photometry.calls.get(), 0);
    assert!(matches!(
        single_outcome(&summary),
        ItemOutcome::Skipped {
            stage: Stage::MeasureBeam,
            ..
        }
    ));
}

#[test]
fn test_unavailable_zero_point_skips_frame() {
    let fixture = Fixture::new("r");
    let config = fixture.config(ForceFlags::default());
    let spies = Spies::new(&config, None);

    let summary = run(&config, &spies);
    assert_eq!(summary.correlated(), 0);
    assert!(matches!(
        single_outcome(&summary),
        ItemOutcome::Skipped {
            stage: Stage::Photometry,
            ..
        }
    ));
}

#[test]
fn test_cross_frame_without_wcs_aborts_run() {
    let fixture = Fixture::new("r");
    let cross = Image::filled(CROSS_SIZE, CROSS_SIZE, 1.0);
    fits::write_image(&fixture.cross_path(), &cross).unwrap();

    let config = fixture.config(ForceFlags::default());
    let spies = Spies::new(&config, Some(27.0));
    let result = PipelineDriver::new(&config, spies.tools()).run();
    assert!(result.is_err());
}
