//! Background gradient fitting
//! Fits flux in one frame against a reference frame plus a smooth spatial
//! surface, using Levenberg-Marquardt on the normal equations
use nalgebra::{DMatrix, DVector};

use crate::error::{FitError, ShapeMismatchError};
use crate::image::Image;

/// Seed used by the correlation pipeline: slope 2, unit plane terms
pub const DEFAULT_INITIAL_PARAMS: [f64; 4] = [2.0, 1.0, 1.0, 1.0];

/// Surface family fitted under the reference term
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SurfaceModel {
    /// `s·ref + a·x + b·y + c`
    #[default]
    TiltedPlane,
    /// Tilted plane plus `d·x² + e·x·y + f·y²`
    Quadratic,
}

impl std::str::FromStr for SurfaceModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plane" | "tilted" | "tilted-plane" => Ok(SurfaceModel::TiltedPlane),
            "quadratic" | "quad" => Ok(SurfaceModel::Quadratic),
            _ => Err(format!("Unknown background model: {}", s)),
        }
    }
}

impl SurfaceModel {
    pub fn n_params(self) -> usize {
        self.function().n_params()
    }

    fn function(self) -> &'static dyn SurfaceFunction {
        match self {
            SurfaceModel::TiltedPlane => &TiltedPlane,
            SurfaceModel::Quadratic => &QuadraticSurface,
        }
    }

    /// Plane-only seed for this model from a 4-parameter seed
    pub fn extend_seed(self, seed: &[f64]) -> Vec<f64> {
        let mut params = seed.to_vec();
        params.resize(self.n_params(), 0.0);
        params
    }
}

/// One usable pixel
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    pub reference: f64,
    pub value: f64,
}

/// Model evaluated against a pixel. Parameter 0 is always the slope
/// against the reference, the rest describe the spatial surface.
pub trait SurfaceFunction: Send + Sync {
    fn n_params(&self) -> usize;

    /// Surface only, without the reference term
    fn plane(&self, x: f64, y: f64, params: &[f64]) -> f64;

    /// Partial derivatives of the surface with respect to params[1..]
    fn plane_gradient(&self, x: f64, y: f64, grad: &mut [f64]);

    fn value(&self, sample: &Sample, params: &[f64]) -> f64 {
        params[0] * sample.reference + self.plane(sample.x, sample.y, params)
    }

    fn gradient(&self, sample: &Sample, grad: &mut [f64]) {
        grad[0] = sample.reference;
        self.plane_gradient(sample.x, sample.y, &mut grad[1..]);
    }
}

pub struct TiltedPlane;

impl SurfaceFunction for TiltedPlane {
    fn n_params(&self) -> usize {
        4
    }

    fn plane(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        params[1] * x + params[2] * y + params[3]
    }

    fn plane_gradient(&self, x: f64, y: f64, grad: &mut [f64]) {
        grad[0] = x;
        grad[1] = y;
        grad[2] = 1.0;
    }
}

pub struct QuadraticSurface;

impl SurfaceFunction for QuadraticSurface {
    fn n_params(&self) -> usize {
        7
    }

    fn plane(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        params[1] * x
            + params[2] * y
            + params[3]
            + params[4] * x * x
            + params[5] * x * y
            + params[6] * y * y
    }

    fn plane_gradient(&self, x: f64, y: f64, grad: &mut [f64]) {
        grad[0] = x;
        grad[1] = y;
        grad[2] = 1.0;
        grad[3] = x * x;
        grad[4] = x * y;
        grad[5] = y * y;
    }
}

#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub params: Vec<f64>,
    pub iterations: usize,
    pub sum_squared_residuals: f64,
}

/// Levenberg-Marquardt with Marquardt diagonal scaling.
///
/// Accumulates `JᵀJ` and `Jᵀr` sample by sample so memory stays at
/// `n_params²` however large the frame is.
pub struct LevenbergMarquardt {
    max_iterations: usize,
    tolerance: f64,
    lambda: f64,
    lambda_factor: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-10,
            lambda: 1e-3,
            lambda_factor: 10.0,
        }
    }
}

impl LevenbergMarquardt {
    pub fn with_limits(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
            ..Default::default()
        }
    }

    fn sum_squares(model: &dyn SurfaceFunction, samples: &[Sample], params: &[f64]) -> f64 {
        samples
            .iter()
            .map(|s| {
                let r = s.value - model.value(s, params);
                r * r
            })
            .sum()
    }

    pub fn fit(
        &mut self,
        model: &dyn SurfaceFunction,
        samples: &[Sample],
        initial_params: &[f64],
    ) -> Result<FitOutcome, FitError> {
        let n_params = model.n_params();
        if initial_params.len() != n_params {
            return Err(FitError::WrongParameterCount {
                expected: n_params,
                found: initial_params.len(),
            });
        }
        if samples.len() < n_params {
            return Err(FitError::TooFewSamples {
                needed: n_params,
                found: samples.len(),
            });
        }

        let mut params = initial_params.to_vec();
        let mut error = Self::sum_squares(model, samples, &params);
        let mut grad = vec![0.0; n_params];

        for iteration in 1..=self.max_iterations {
            if !error.is_finite() {
                return Err(FitError::Degenerate);
            }
            if error == 0.0 {
                return Ok(FitOutcome {
                    params,
                    iterations: iteration,
                    sum_squared_residuals: error,
                });
            }

            let mut jtj = DMatrix::<f64>::zeros(n_params, n_params);
            let mut jtr = DVector::<f64>::zeros(n_params);
            for sample in samples {
                let residual = sample.value - model.value(sample, &params);
                model.gradient(sample, &mut grad);
                for i in 0..n_params {
                    jtr[i] += grad[i] * residual;
                    for j in i..n_params {
                        jtj[(i, j)] += grad[i] * grad[j];
                    }
                }
            }
            for i in 0..n_params {
                for j in 0..i {
                    jtj[(i, j)] = jtj[(j, i)];
                }
            }

            loop {
                let mut h = jtj.clone();
                for i in 0..n_params {
                    h[(i, i)] += self.lambda * jtj[(i, i)].max(f64::MIN_POSITIVE);
                }

                let step = h.lu().solve(&jtr);
                let candidate = step.map(|delta| {
                    params
                        .iter()
                        .zip(delta.iter())
                        .map(|(p, d)| p + d)
                        .collect::<Vec<f64>>()
                });

                if let Some(candidate) = candidate {
                    let new_error = Self::sum_squares(model, samples, &candidate);
                    if new_error < error {
                        let improvement = error - new_error;
                        params = candidate;
                        error = new_error;
                        self.lambda = (self.lambda / self.lambda_factor).max(1e-12);
                        if improvement <= self.tolerance * error.max(f64::MIN_POSITIVE) {
                            return Ok(FitOutcome {
                                params,
                                iterations: iteration,
                                sum_squared_residuals: error,
                            });
                        }
                        break;
                    }
                }

                self.lambda *= self.lambda_factor;
                if self.lambda > 1e10 {
                    // No step improves on the current point: it is the minimum
                    return Ok(FitOutcome {
                        params,
                        iterations: iteration,
                        sum_squared_residuals: error,
                    });
                }
            }
        }

        Err(FitError::NotConverged {
            iterations: self.max_iterations,
        })
    }
}

/// Fitted spatial surface, evaluated on the image grid
#[derive(Debug, Clone)]
pub struct BackgroundPlane {
    pub model: SurfaceModel,
    pub params: Vec<f64>,
    pub width: usize,
    pub height: usize,
}

impl BackgroundPlane {
    /// Slope of the image against the reference
    pub fn slope(&self) -> f64 {
        self.params[0]
    }

    pub fn value_at(&self, x: f64, y: f64) -> f64 {
        self.model.function().plane(x, y, &self.params)
    }

    pub fn to_image(&self) -> Image {
        Image::from_fn(self.width, self.height, |x, y| {
            self.value_at(x as f64, y as f64)
        })
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundFit {
    pub residual: Image,
    pub plane: Image,
    pub surface: BackgroundPlane,
    pub iterations: usize,
}

#[derive(Debug, Clone)]
pub struct BackgroundPlaneFitter {
    pub model: SurfaceModel,
    /// Image pixels equal to this value are masked out of the fit
    pub mask_value: Option<f64>,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for BackgroundPlaneFitter {
    fn default() -> Self {
        Self {
            model: SurfaceModel::TiltedPlane,
            mask_value: Some(0.0),
            max_iterations: 100,
            tolerance: 1e-10,
        }
    }
}

impl BackgroundPlaneFitter {
    pub fn new(model: SurfaceModel) -> Self {
        Self {
            model,
            ..Default::default()
        }
    }

    fn samples(&self, image: &Image, reference: &Image) -> Vec<Sample> {
        let mut samples = Vec::new();
        for y in 0..image.height {
            for x in 0..image.width {
                let value = image.get(x, y);
                let reference = reference.get(x, y);
                if !value.is_finite() || !reference.is_finite() {
                    continue;
                }
                if self.mask_value == Some(value) {
                    continue;
                }
                samples.push(Sample {
                    x: x as f64,
                    y: y as f64,
                    reference,
                    value,
                });
            }
        }
        samples
    }

    /// Fit `image ≈ s·reference + surface(x, y)` and subtract the surface.
    ///
    /// The residual and plane always add back up to `image`.
    pub fn fit_and_subtract(
        &self,
        image: &Image,
        reference: &Image,
        initial_params: &[f64],
    ) -> Result<BackgroundFit, FitError> {
        if image.shape() != reference.shape() {
            return Err(ShapeMismatchError::Shape {
                left: image.shape(),
                right: reference.shape(),
            }
            .into());
        }

        let samples = self.samples(image, reference);
        let mut optimizer = LevenbergMarquardt::with_limits(self.max_iterations, self.tolerance);
        let outcome = optimizer.fit(self.model.function(), &samples, initial_params)?;

        if outcome.params.iter().any(|p| !p.is_finite()) {
            return Err(FitError::Degenerate);
        }

        let surface = BackgroundPlane {
            model: self.model,
            params: outcome.params,
            width: image.width,
            height: image.height,
        };
        let plane_data = surface.to_image().data;
        if plane_data.iter().any(|v| !v.is_finite()) {
            return Err(FitError::Degenerate);
        }

        tracing::debug!(
            samples = samples.len(),
            iterations = outcome.iterations,
            params = ?surface.params,
            "background surface fitted"
        );

        let residual_data = image
            .data
            .iter()
            .zip(&plane_data)
            .map(|(v, p)| v - p)
            .collect();
        let mut residual = image.with_data(residual_data);
        residual.metadata.background_subtracted = true;
        let plane = image.with_data(plane_data);

        Ok(BackgroundFit {
            residual,
            plane,
            surface,
            iterations: outcome.iterations,
        })
    }
}

/// Fit the default tilted plane and subtract it
pub fn fit_and_subtract(
    image: &Image,
    reference: &Image,
    initial_params: &[f64],
) -> Result<BackgroundFit, FitError> {
    BackgroundPlaneFitter::default().fit_and_subtract(image, reference, initial_params)
}
