use anyhow::Result;
use std::path::Path;

use crate::background::BackgroundPlaneFitter;
use crate::cache::{StageCache, StageKey};
use crate::catalogue::Catalogue;
use crate::convolve::{match_resolution, BeamWidth, FWHM_TO_SIGMA};
use crate::error::{FitError, ShapeMismatchError};
use crate::external::{
    photometry_from_header, AstrometrySolver, FrameCalibrator, PhotometryCalibrator,
    SourceExtractor,
};
use crate::fits::{self, KEY_MASK_CUTOFF};
use crate::histogram::{histogram_2d, PlotLabels};
use crate::image::Image;
use crate::mask::{apply_mask, build_mask, is_stale, threshold_mask};
use crate::regrid::{crop_to_common, GridResampler};

use super::layout::{BandPaths, FramePaths, Layout};
use super::work_queue::{WorkItem, WorkQueue};
use super::{ItemOutcome, PipelineConfig, RunSummary, Stage};

/// Filter name of polarization frames, which are not correlated
const POLARIZATION_FILTER: &str = "Pol";

/// Value written into masked pixels
const MASK_FILL: f64 = 0.0;

/// The external tools a run calls out to
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub calibrator: &'a dyn FrameCalibrator,
    pub extractor: &'a dyn SourceExtractor,
    pub solver: &'a dyn AstrometrySolver,
    pub photometry: &'a dyn PhotometryCalibrator,
}

/// A stage either gives up on the current frame or band, or aborts the run
#[derive(Debug)]
enum StageError {
    Skip { stage: Stage, reason: String },
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for StageError {
    fn from(e: anyhow::Error) -> Self {
        StageError::Fatal(e)
    }
}

impl From<ShapeMismatchError> for StageError {
    fn from(e: ShapeMismatchError) -> Self {
        StageError::Fatal(e.into())
    }
}

fn skip(stage: Stage, reason: impl Into<String>) -> StageError {
    StageError::Skip {
        stage,
        reason: reason.into(),
    }
}

fn skip_with(stage: Stage) -> impl Fn(anyhow::Error) -> StageError {
    move |e| skip(stage, format!("{:#}", e))
}

/// Per-frame results every band of the frame builds on
struct Frame {
    paths: FramePaths,
    /// Measured optical beam
    beam: BeamWidth,
}

pub struct PipelineDriver<'a> {
    config: &'a PipelineConfig,
    layout: Layout,
    tools: Collaborators<'a>,
    cache: StageCache,
    resampler: GridResampler,
    fitter: BackgroundPlaneFitter,
}

impl<'a> PipelineDriver<'a> {
    pub fn new(config: &'a PipelineConfig, tools: Collaborators<'a>) -> Self {
        Self {
            config,
            layout: Layout::from_config(config),
            tools,
            cache: StageCache::new(),
            resampler: GridResampler::new(config.resample_mode),
            fitter: BackgroundPlaneFitter::new(config.surface_model),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Process every work item. Skips are recorded in the summary; only
    /// grid mismatches and I/O failures abort the run.
    pub fn run(&mut self) -> Result<RunSummary> {
        let queue = WorkQueue::discover(self.config, &self.layout)?;
        let mut summary = RunSummary::default();

        let mut items = queue.peekable();
        while let Some(first) = items.next() {
            let mut group = vec![first];
            while let Some(item) = items.next_if(|next| next.same_frame(&group[0])) {
                group.push(item);
            }
            self.run_frame(group, &mut summary)?;
        }

        summary.computed = self.cache.computed_by_stage().clone();
        tracing::info!(
            correlated = summary.correlated(),
            skipped = summary.skipped(),
            computed = ?summary.computed,
            "run finished"
        );
        Ok(summary)
    }

    fn run_frame(&mut self, group: Vec<WorkItem>, summary: &mut RunSummary) -> Result<()> {
        let first = group[0].clone();
        let span = tracing::info_span!(
            "frame",
            object = %first.object,
            date = %first.date,
            file = %first.file
        );
        let _entered = span.enter();

        let frame = match self.process_frame(&first) {
            Ok(frame) => frame,
            Err(StageError::Skip { stage, reason }) => {
                tracing::warn!(%stage, file = %first.file, %reason, "skipping frame");
                summary.items.extend(group.into_iter().map(|item| {
                    let outcome = ItemOutcome::Skipped {
                        stage,
                        reason: reason.clone(),
                    };
                    (item, outcome)
                }));
                return Ok(());
            }
            Err(StageError::Fatal(e)) => {
                return Err(e.context(format!("Failed to process {}", first.file)))
            }
        };

        for item in group {
            let outcome = match self.process_band(&frame, &item) {
                Ok(outcome) => outcome,
                Err(StageError::Skip { stage, reason }) => {
                    tracing::warn!(
                        %stage,
                        file = %item.file,
                        band = %item.band,
                        %reason,
                        "skipping band"
                    );
                    ItemOutcome::Skipped { stage, reason }
                }
                Err(StageError::Fatal(e)) => {
                    return Err(e.context(format!(
                        "Failed to correlate {} with {}",
                        item.file,
                        item.cross.display()
                    )))
                }
            };
            summary.items.push((item, outcome));
        }
        Ok(())
    }

    fn forced(&self, stage: Stage) -> bool {
        self.config.force.is_forced(stage)
    }

    fn process_frame(&mut self, item: &WorkItem) -> Result<Frame, StageError> {
        let paths = self.layout.frame_paths(item);

        self.calibrate(item, &paths)?;
        self.solve_astrometry(item, &paths)?;
        self.detect_sources(&paths)?;
        let beam = self.measure_beam(&paths)?;
        self.calibrate_photometry(&paths)?;

        Ok(Frame { paths, beam })
    }

    /// Calibration works on a whole night at once
    fn calibrate(&mut self, item: &WorkItem, paths: &FramePaths) -> Result<(), StageError> {
        let (object, date) = (item.object.as_str(), item.date.as_str());
        let mut key = StageKey::new(Stage::Calibrate, self.layout.calibrated_date_dir(object, date));
        for file in self.layout.raw_files(object, date)? {
            key = key
                .companion(self.layout.calibrated_path(object, date, &file))
                .input(self.layout.dir(object, &self.layout.raw_dir, date).join(&file));
        }

        let forced = self.forced(Stage::Calibrate);
        let calibrator = self.tools.calibrator;
        let calibrated: Result<(), StageError> = self.cache.run_stage(
            &key,
            forced,
            || Ok(()),
            || {
                calibrator
                    .calibrate(object, date)
                    .map_err(skip_with(Stage::Calibrate))
            },
        );
        calibrated?;

        if !paths.calibrated.exists() {
            return Err(skip(
                Stage::Calibrate,
                format!("no calibrated frame at {}", paths.calibrated.display()),
            ));
        }
        Ok(())
    }

    /// Solving rewrites the calibrated frame, so a recalibrated night
    /// invalidates it
    fn solve_astrometry(&mut self, item: &WorkItem, paths: &FramePaths) -> Result<(), StageError> {
        let key = StageKey::new(Stage::Astrometry, &paths.calibrated)
            .input(&paths.raw)
            .input(self.layout.calibrated_date_dir(&item.object, &item.date));
        let forced = self.forced(Stage::Astrometry);
        let solver = self.tools.solver;
        self.cache.run_stage(
            &key,
            forced,
            || Ok(()),
            || {
                solver
                    .solve(&paths.calibrated)
                    .map_err(skip_with(Stage::Astrometry))
            },
        )
    }

    fn detect_sources(&mut self, paths: &FramePaths) -> Result<(), StageError> {
        let key = StageKey::new(Stage::Detect, &paths.catalogue)
            .companion(&paths.objects)
            .companion(&paths.background)
            .input(&paths.calibrated);
        let forced = self.forced(Stage::Detect);
        let extractor = self.tools.extractor;
        self.cache.run_stage(
            &key,
            forced,
            || Ok(()),
            || {
                extractor
                    .extract(
                        &paths.calibrated,
                        &paths.catalogue,
                        &paths.objects,
                        &paths.background,
                    )
                    .map_err(skip_with(Stage::Detect))
            },
        )
    }

    /// Beam = mean FWHM of unflagged sources times the pixel scale; it is
    /// written back into the calibrated frame's header
    fn measure_beam(&mut self, paths: &FramePaths) -> Result<BeamWidth, StageError> {
        let mut image =
            fits::read_image(&paths.calibrated).map_err(skip_with(Stage::MeasureBeam))?;
        let catalogue = Catalogue::read(&paths.catalogue).map_err(skip_with(Stage::MeasureBeam))?;

        let scale = image
            .metadata
            .pixel_scale()
            .filter(|s| s.is_finite() && *s > 0.0)
            .ok_or_else(|| skip(Stage::MeasureBeam, "no pixel scale after astrometry"))?;
        let fwhm_pixels = catalogue
            .mean_unflagged_fwhm()
            .ok_or_else(|| skip(Stage::MeasureBeam, "no unflagged sources in catalogue"))?;
        let beam = BeamWidth::new(fwhm_pixels * scale).ok_or_else(|| {
            skip(
                Stage::MeasureBeam,
                format!("unusable beam width {}", fwhm_pixels * scale),
            )
        })?;

        let recorded = image.metadata.fwhm;
        if recorded.map_or(true, |f| (f - beam.arcsec()).abs() > 1e-9) {
            image.metadata.fwhm = Some(beam.arcsec());
            fits::write_image(&paths.calibrated, &image)?;
        }
        tracing::debug!(beam = beam.arcsec(), fwhm_pixels, scale, "measured optical beam");

        if image.metadata.filter.as_deref() == Some(POLARIZATION_FILTER) {
            return Err(skip(Stage::MeasureBeam, "polarization frame"));
        }
        Ok(beam)
    }

    /// Photometric calibration, then the object and background maps are
    /// converted to flux units with the same header
    fn calibrate_photometry(&mut self, paths: &FramePaths) -> Result<(), StageError> {
        let reference_dir = self.config.reference_dir.as_path();
        let key = StageKey::new(Stage::Photometry, &paths.photometered)
            .companion(&paths.photo_objects)
            .companion(&paths.photo_background)
            .input(&paths.calibrated)
            .input(&paths.catalogue)
            .input(reference_dir);
        let forced = self.forced(Stage::Photometry);
        let photometry = self.tools.photometry;

        self.cache.run_stage(
            &key,
            forced,
            || {
                photometry_from_header(&paths.photometered)
                    .map(|_| ())
                    .map_err(|e| skip(Stage::Photometry, e.to_string()))
            },
            || {
                let outcome = photometry
                    .calibrate(
                        &paths.calibrated,
                        &paths.catalogue,
                        reference_dir,
                        &paths.photometered,
                        &paths.plot_prefix,
                    )
                    .map_err(|e| skip(Stage::Photometry, e.to_string()))?;
                tracing::debug!(
                    zero_point = outcome.zero_point,
                    conversion = outcome.flux_conversion,
                    "photometry calibrated"
                );

                let header = fits::read_image(&paths.photometered)?.metadata;
                for (map, converted) in [
                    (&paths.objects, &paths.photo_objects),
                    (&paths.background, &paths.photo_background),
                ] {
                    let image = fits::read_image(map)?
                        .scaled(outcome.flux_conversion)
                        .with_metadata(header.clone());
                    fits::write_image(converted, &image)?;
                }
                Ok(())
            },
        )
    }

    fn process_band(&mut self, frame: &Frame, item: &WorkItem) -> Result<ItemOutcome, StageError> {
        let target = item.band.beam();
        let native = frame.beam;
        let paths = self.layout.band_paths(item, target);

        let convolved = self.convolve(
            &frame.paths.photometered,
            &frame.paths.photometered,
            &paths.convolved,
            native,
            target,
        )?;
        let convolved_objects = self.convolve(
            &frame.paths.photometered,
            &frame.paths.photo_objects,
            &paths.convolved_objects,
            native,
            target,
        )?;

        let (_, cutoff) = build_mask(&convolved_objects, self.config.mask_multiplier);
        if !cutoff.is_finite() {
            return Err(skip(Stage::Mask, "convolved object map has no finite pixels"));
        }

        let cross = fits::read_image(&item.cross).map_err(skip_with(Stage::Regrid))?;
        let masked = self.mask(&paths, item, &convolved, &convolved_objects, &cross, cutoff)?;
        let (regridded, cross) = self.crop(&paths, item, &masked, &cross, native, target)?;
        let residual = self.subtract_background(&paths, &regridded, &cross)?;
        self.correlate(&paths, &regridded, &cross, &residual)
    }

    /// `photometered` owns the cache record for every photometry product,
    /// so it is tracked even when `input` is one of its companions
    fn convolve(
        &mut self,
        photometered: &Path,
        input: &Path,
        output: &Path,
        native: BeamWidth,
        target: BeamWidth,
    ) -> Result<Image, StageError> {
        let mut key = StageKey::new(Stage::Convolve, output).input(input);
        if input != photometered {
            key = key.input(photometered);
        }
        let key = key
            .param("native_beam", native.arcsec())
            .param("target_beam", target.arcsec());
        let forced = self.forced(Stage::Convolve);
        self.cache.run_stage(
            &key,
            forced,
            || Ok(fits::read_image(output)?),
            || {
                let image = fits::read_image(input)?;
                let convolved = match_resolution(&image, native, target)
                    .map_err(|e| skip(Stage::Convolve, e.to_string()))?;
                fits::write_image(output, &convolved)?;
                Ok(convolved)
            },
        )
    }

    /// Regrid the convolved frame and object map onto the cross frame and
    /// blank every pixel whose object flux reaches the cutoff
    fn mask(
        &mut self,
        paths: &BandPaths,
        item: &WorkItem,
        convolved: &Image,
        convolved_objects: &Image,
        cross: &Image,
        cutoff: f64,
    ) -> Result<Image, StageError> {
        let key = StageKey::new(Stage::Mask, &paths.mask)
            .input(&paths.convolved)
            .input(&paths.convolved_objects)
            .input(&item.cross)
            .param("cutoff", cutoff);

        let stored_cutoff = fits::read_header(&paths.mask)
            .ok()
            .and_then(|cards| cards.get(KEY_MASK_CUTOFF).and_then(|v| v.parse::<f64>().ok()));
        let stale = paths.mask.exists() && is_stale(stored_cutoff, cutoff);
        if stale {
            tracing::debug!(?stored_cutoff, cutoff, "stored mask is stale");
        }
        let forced = self.forced(Stage::Mask) || stale;

        let resampler = self.resampler;
        self.cache.run_stage(
            &key,
            forced,
            || Ok(fits::read_image(&paths.mask)?),
            || {
                let (regridded, _) = resampler.resample(convolved, cross)?;
                let (objects, _) = resampler.resample(convolved_objects, cross)?;
                let mask = threshold_mask(&objects, cutoff);
                tracing::debug!(masked = mask.masked_count(), cutoff, "foreground masked");
                let masked = apply_mask(&regridded, &mask, cutoff, MASK_FILL)?;
                fits::write_image(&paths.mask, &masked)?;
                Ok(masked)
            },
        )
    }

    /// Trim both frames to their common footprint less twice the combined
    /// beam sigma
    fn crop(
        &mut self,
        paths: &BandPaths,
        item: &WorkItem,
        masked: &Image,
        cross: &Image,
        native: BeamWidth,
        target: BeamWidth,
    ) -> Result<(Image, Image), StageError> {
        let cross_scale = cross
            .metadata
            .wcs
            .as_ref()
            .map(|wcs| wcs.pixel_scale_arcsec())
            .or(cross.metadata.pixel_scale())
            .filter(|s| s.is_finite() && *s > 0.0)
            .ok_or_else(|| skip(Stage::Regrid, "cross frame has no pixel scale"))?;
        let combined_sigma = ((native.arcsec() / FWHM_TO_SIGMA).powi(2)
            + (target.arcsec() / FWHM_TO_SIGMA).powi(2))
        .sqrt();
        let margin = (2.0 * combined_sigma / cross_scale).ceil() as usize;

        let key = StageKey::new(Stage::Regrid, &paths.regrid)
            .companion(&paths.regrid_cross)
            .input(&paths.mask)
            .input(&item.cross)
            .param("margin", margin as f64);
        let forced = self.forced(Stage::Regrid);

        self.cache.run_stage(
            &key,
            forced,
            || {
                Ok((
                    fits::read_image(&paths.regrid)?,
                    fits::read_image(&paths.regrid_cross)?,
                ))
            },
            || {
                let (regridded, cross) = crop_to_common(masked, cross, margin)?;
                if regridded.width == 0 || regridded.height == 0 {
                    return Err(skip(
                        Stage::Regrid,
                        format!("no overlap left inside a {} pixel margin", margin),
                    ));
                }
                fits::write_image(&paths.regrid, &regridded)?;
                fits::write_image(&paths.regrid_cross, &cross)?;
                Ok((regridded, cross))
            },
        )
    }

    fn subtract_background(
        &mut self,
        paths: &BandPaths,
        regridded: &Image,
        cross: &Image,
    ) -> Result<Image, StageError> {
        let model = self.config.surface_model;
        let seed = model.extend_seed(&self.config.initial_params);
        let mut key = StageKey::new(Stage::BackgroundSubtract, &paths.backsub)
            .companion(&paths.bgplane)
            .input(&paths.regrid)
            .input(&paths.regrid_cross)
            .param("surface_params", model.n_params() as f64);
        for (i, p) in seed.iter().enumerate() {
            key = key.param(&format!("p{}", i), *p);
        }
        let forced = self.forced(Stage::BackgroundSubtract);

        let fitter = &self.fitter;
        self.cache.run_stage(
            &key,
            forced,
            || Ok(fits::read_image(&paths.backsub)?),
            || match fitter.fit_and_subtract(regridded, cross, &seed) {
                Ok(fit) => {
                    tracing::debug!(
                        iterations = fit.iterations,
                        params = ?fit.surface.params,
                        residual = ?fit.residual.statistics(),
                        "background plane subtracted"
                    );
                    fits::write_image(&paths.backsub, &fit.residual)?;
                    fits::write_image(&paths.bgplane, &fit.plane)?;
                    Ok(fit.residual)
                }
                Err(FitError::ShapeMismatch(e)) => Err(e.into()),
                Err(e) => Err(skip(
                    Stage::BackgroundSubtract,
                    format!("failed background subtraction: {}", e),
                )),
            },
        )
    }

    /// Histogram of cross flux against background-subtracted optical flux
    /// over pixels where the regridded optical frame is positive
    fn correlate(
        &self,
        paths: &BandPaths,
        regridded: &Image,
        cross: &Image,
        residual: &Image,
    ) -> Result<ItemOutcome, StageError> {
        for other in [cross, residual] {
            if other.shape() != regridded.shape() {
                return Err(ShapeMismatchError::Shape {
                    left: regridded.shape(),
                    right: other.shape(),
                }
                .into());
            }
        }

        let (x, y): (Vec<f64>, Vec<f64>) = regridded
            .data
            .iter()
            .zip(&cross.data)
            .zip(&residual.data)
            .filter(|((r, _), _)| **r > 0.0)
            .map(|((_, t), b)| (*t, *b))
            .unzip();

        let labels = PlotLabels::new(
            "Correlation between Dragonfly and Herschel",
            "Herschel [MJy/sr]",
            "Dragonfly [kJy/sr]",
            "Pixels",
        );
        let histogram = histogram_2d(
            &x,
            &y,
            self.config.histogram_bins,
            MASK_FILL,
            Some(&paths.correlation),
            Some(&labels),
        )
        .map_err(skip_with(Stage::Correlate))?;

        tracing::info!(
            plot = %paths.correlation.display(),
            pairs = histogram.total(),
            "correlation written"
        );
        Ok(ItemOutcome::Correlated {
            plot: paths.correlation.clone(),
            pairs: histogram.total(),
        })
    }
}
