//! The EM driver.
//!
//! [`CoverageEmAlgorithm`] owns a [`CoverageWorkspace`] and alternates M-step
//! passes and E steps until the log likelihood or the parameters stop moving,
//! the iteration budget runs out, or an inner solve of the M step fails. Inner
//! failures end the run with a failure status rather than an error, so the
//! partially fitted model stays inspectable.

use crate::model::{CoverageModel, ModelError};
use crate::params::{EmParams, ParamsError};
use crate::workspace::{CoverageWorkspace, InnerSolve, WorkspaceError};
use ndarray::ArrayView2;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmError {
    #[error("Invalid EM parameters: {0}")]
    Params(#[from] ParamsError),

    #[error("EM workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Model comparison failed: {0}")]
    Model(#[from] ModelError),

    #[error("Failed to serialize the fit report to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Run state of the EM algorithm. Starts as `NotDetermined` and moves to
/// exactly one of the other values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EmStatus {
    NotDetermined,
    ConvergedLikelihood,
    ConvergedParams,
    FailedMaxIterations,
    FailedPsiTolerance,
    FailedWTolerance,
}

impl EmStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::ConvergedLikelihood | Self::ConvergedParams)
    }

    pub fn is_terminal(self) -> bool {
        self != Self::NotDetermined
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::NotDetermined => "Status is not determined yet.",
            Self::ConvergedLikelihood => "Success: log likelihood tolerance reached.",
            Self::ConvergedParams => "Success: parameter change tolerance reached.",
            Self::FailedMaxIterations => "Failure: maximum number of iterations reached.",
            Self::FailedPsiTolerance => {
                "Failure: the unexplained variance could not be solved to the requested tolerance."
            }
            Self::FailedWTolerance => {
                "Failure: the factor loadings could not be solved to the requested tolerance."
            }
        }
    }
}

impl fmt::Display for EmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubroutineStatus {
    Success,
    Failure,
}

/// The sub-steps of one EM iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EmStep {
    LatentPosteriors,
    MeanBias,
    SignalQuadraticPosterior,
    UnexplainedVariance,
    FactorLoading,
}

/// Optional diagnostics attached to a [`SubroutineSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SignalPayload {
    pub iterations: Option<usize>,
    /// Last change or relative residual of an inner solve.
    pub residual: Option<f64>,
    pub log_likelihood: Option<f64>,
}

/// What a single sub-step of the EM iteration reports back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubroutineSignal {
    pub step: EmStep,
    pub status: SubroutineStatus,
    pub payload: SignalPayload,
}

impl SubroutineSignal {
    fn success(step: EmStep, payload: SignalPayload) -> Self {
        Self {
            step,
            status: SubroutineStatus::Success,
            payload,
        }
    }

    fn from_inner_solve(step: EmStep, solve: InnerSolve) -> Self {
        Self {
            step,
            status: if solve.converged {
                SubroutineStatus::Success
            } else {
                SubroutineStatus::Failure
            },
            payload: SignalPayload {
                iterations: Some(solve.iterations),
                residual: Some(solve.residual),
                log_likelihood: None,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SubroutineStatus::Success
    }
}

/// Summary of a fit, suitable for logging or writing next to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmFitReport {
    pub status: EmStatus,
    pub message: String,
    pub iterations: usize,
    pub num_samples: usize,
    pub num_targets: usize,
    pub num_latents: usize,
    pub num_target_blocks: usize,
    pub final_log_likelihood: f64,
    pub last_parameter_change: Option<f64>,
    pub log_likelihood_trace: Vec<f64>,
}

impl EmFitReport {
    pub fn to_toml_string(&self) -> Result<String, EmError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

pub struct CoverageEmAlgorithm {
    params: EmParams,
    workspace: CoverageWorkspace,
    status: EmStatus,
    iterations: usize,
    log_likelihood_trace: Vec<f64>,
    last_parameter_change: Option<f64>,
    last_signal: Option<SubroutineSignal>,
}

impl CoverageEmAlgorithm {
    /// Validates `params`, builds the workspace and runs the initial E step.
    pub fn new(read_counts: ArrayView2<u32>, params: EmParams) -> Result<Self, EmError> {
        params.validate()?;
        let workspace = CoverageWorkspace::new(read_counts, &params)?;
        let initial_log_likelihood = workspace.log_likelihood();
        Ok(Self {
            params,
            workspace,
            status: EmStatus::NotDetermined,
            iterations: 0,
            log_likelihood_trace: vec![initial_log_likelihood],
            last_parameter_change: None,
            last_signal: Some(SubroutineSignal::success(
                EmStep::LatentPosteriors,
                SignalPayload {
                    log_likelihood: Some(initial_log_likelihood),
                    ..SignalPayload::default()
                },
            )),
        })
    }

    pub fn params(&self) -> &EmParams {
        &self.params
    }

    pub fn status(&self) -> EmStatus {
        self.status
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn last_signal(&self) -> Option<&SubroutineSignal> {
        self.last_signal.as_ref()
    }

    /// Log likelihood after the initial E step followed by one value per iteration.
    pub fn log_likelihood_trace(&self) -> &[f64] {
        &self.log_likelihood_trace
    }

    pub fn log_likelihood(&self) -> f64 {
        self.workspace.log_likelihood()
    }

    pub fn model(&self) -> &CoverageModel {
        self.workspace.model()
    }

    pub fn workspace(&self) -> &CoverageWorkspace {
        &self.workspace
    }

    pub fn into_model(self) -> CoverageModel {
        self.workspace.into_model()
    }

    fn record(&mut self, signal: SubroutineSignal) -> SubroutineSignal {
        self.last_signal = Some(signal);
        signal
    }

    /// E step: posterior moments of the latent factors and the log likelihood.
    pub fn update_latent_posteriors(&mut self) -> Result<SubroutineSignal, EmError> {
        let log_likelihood = self.workspace.update_latent_posteriors()?;
        Ok(self.record(SubroutineSignal::success(
            EmStep::LatentPosteriors,
            SignalPayload {
                log_likelihood: Some(log_likelihood),
                ..SignalPayload::default()
            },
        )))
    }

    pub fn update_mean_bias(&mut self) -> Result<SubroutineSignal, EmError> {
        self.workspace.update_mean_bias()?;
        Ok(self.record(SubroutineSignal::success(
            EmStep::MeanBias,
            SignalPayload::default(),
        )))
    }

    pub fn update_signal_quadratic_posterior(&mut self) -> Result<SubroutineSignal, EmError> {
        self.workspace.update_signal_quadratic_posterior()?;
        Ok(self.record(SubroutineSignal::success(
            EmStep::SignalQuadraticPosterior,
            SignalPayload::default(),
        )))
    }

    pub fn update_unexplained_variance(&mut self) -> Result<SubroutineSignal, EmError> {
        let solve = self.workspace.update_unexplained_variance()?;
        Ok(self.record(SubroutineSignal::from_inner_solve(
            EmStep::UnexplainedVariance,
            solve,
        )))
    }

    pub fn update_factor_loading(&mut self) -> Result<SubroutineSignal, EmError> {
        let solve = self.workspace.update_factor_loading()?;
        Ok(self.record(SubroutineSignal::from_inner_solve(
            EmStep::FactorLoading,
            solve,
        )))
    }

    fn finish(&mut self, status: EmStatus) -> EmStatus {
        self.status = status;
        if status.is_success() {
            log::info!("EM finished after {} iterations. {}", self.iterations, status);
        } else {
            log::warn!("EM stopped after {} iterations. {}", self.iterations, status);
        }
        status
    }

    /// One EM iteration: M-step passes, then an E step, then the convergence checks.
    pub fn step(&mut self) -> Result<EmStatus, EmError> {
        if self.status.is_terminal() {
            return Ok(self.status);
        }
        if self.iterations >= self.params.max_em_iterations {
            return Ok(self.finish(EmStatus::FailedMaxIterations));
        }

        let snapshot = self.workspace.model().clone();
        for pass in 0..self.params.num_sequential_maximizations {
            log::debug!("M step pass {} of iteration {}", pass + 1, self.iterations + 1);
            self.update_mean_bias()?;
            self.update_signal_quadratic_posterior()?;
            if !self.update_unexplained_variance()?.is_success() {
                self.iterations += 1;
                return Ok(self.finish(EmStatus::FailedPsiTolerance));
            }
            if !self.update_factor_loading()?.is_success() {
                self.iterations += 1;
                return Ok(self.finish(EmStatus::FailedWTolerance));
            }
        }

        self.update_latent_posteriors()?;
        self.iterations += 1;

        let log_likelihood = self.workspace.log_likelihood();
        let previous = self
            .log_likelihood_trace
            .last()
            .copied()
            .unwrap_or(f64::NEG_INFINITY);
        self.log_likelihood_trace.push(log_likelihood);
        let parameter_change = self.workspace.model().max_abs_parameter_change(&snapshot)?;
        self.last_parameter_change = Some(parameter_change);

        let likelihood_change = log_likelihood - previous;
        log::info!(
            "EM iteration {}: log likelihood {:.8} (change {:+.3e}), max parameter change {:.3e}",
            self.iterations,
            log_likelihood,
            likelihood_change,
            parameter_change
        );
        if likelihood_change < -self.params.log_likelihood_tol * previous.abs().max(1.0) {
            log::warn!(
                "Log likelihood decreased by {:.3e} in iteration {}.",
                -likelihood_change,
                self.iterations
            );
        }

        let tolerance = self.params.log_likelihood_tol;
        let absolute = likelihood_change.abs();
        if absolute < tolerance || absolute < tolerance * previous.abs() {
            return Ok(self.finish(EmStatus::ConvergedLikelihood));
        }
        if parameter_change < self.params.param_change_tol {
            return Ok(self.finish(EmStatus::ConvergedParams));
        }
        if self.iterations >= self.params.max_em_iterations {
            return Ok(self.finish(EmStatus::FailedMaxIterations));
        }
        Ok(self.status)
    }

    /// Iterates until a terminal status is reached.
    pub fn run(&mut self) -> Result<EmStatus, EmError> {
        log::info!(
            "Starting EM on {} samples x {} targets with {} latent factors (Fourier regularization: {}).",
            self.workspace.num_samples(),
            self.workspace.num_targets(),
            self.workspace.num_latents(),
            if self.params.use_fourier_regularization {
                "on"
            } else {
                "off"
            }
        );
        while !self.status.is_terminal() {
            self.step()?;
        }
        Ok(self.status)
    }

    pub fn report(&self) -> EmFitReport {
        EmFitReport {
            status: self.status,
            message: self.status.message().to_string(),
            iterations: self.iterations,
            num_samples: self.workspace.num_samples(),
            num_targets: self.workspace.num_targets(),
            num_latents: self.workspace.num_latents(),
            num_target_blocks: self.workspace.model().blocks().len(),
            final_log_likelihood: self.workspace.log_likelihood(),
            last_parameter_change: self.last_parameter_change,
            log_likelihood_trace: self.log_likelihood_trace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_status_classification() {
        assert!(!EmStatus::NotDetermined.is_terminal());
        assert!(!EmStatus::NotDetermined.is_success());
        for status in [EmStatus::ConvergedLikelihood, EmStatus::ConvergedParams] {
            assert!(status.is_terminal());
            assert!(status.is_success());
        }
        for status in [
            EmStatus::FailedMaxIterations,
            EmStatus::FailedPsiTolerance,
            EmStatus::FailedWTolerance,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_success());
            assert!(status.to_string().starts_with("Failure"));
        }
    }

    #[test]
    fn test_signal_from_inner_solve() {
        let failed = SubroutineSignal::from_inner_solve(
            EmStep::UnexplainedVariance,
            InnerSolve {
                iterations: 7,
                residual: 0.5,
                converged: false,
            },
        );
        assert!(!failed.is_success());
        assert_eq!(failed.payload.iterations, Some(7));
        assert_eq!(failed.payload.residual, Some(0.5));
    }

    #[test]
    fn test_invalid_params_are_rejected_before_ingestion() {
        let counts = Array2::<u32>::from_elem((4, 10), 50);
        let params = EmParams {
            w_tol: -1.0,
            ..EmParams::default()
        };
        assert!(matches!(
            CoverageEmAlgorithm::new(counts.view(), params),
            Err(EmError::Params(ParamsError::NotPositive { name: "w_tol", .. }))
        ));
    }

    #[test]
    fn test_constructor_records_initial_e_step() {
        let counts = Array2::<u32>::from_shape_fn((4, 10), |(s, t)| 40 + (s * 7 + t * 3) as u32);
        let params = EmParams {
            num_latents: 2,
            ..EmParams::default()
        };
        let algorithm = CoverageEmAlgorithm::new(counts.view(), params).unwrap();
        assert_eq!(algorithm.status(), EmStatus::NotDetermined);
        assert_eq!(algorithm.iterations(), 0);
        assert_eq!(algorithm.log_likelihood_trace().len(), 1);
        let signal = algorithm.last_signal().unwrap();
        assert_eq!(signal.step, EmStep::LatentPosteriors);
        assert_eq!(signal.payload.log_likelihood, Some(algorithm.log_likelihood()));
    }
}
