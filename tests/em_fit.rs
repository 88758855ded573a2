mod common;

use common::{SyntheticCoverageBuilder, init_logging};
use covem::em::{EmStep, SubroutineStatus};
use covem::linalg::guarded_inverse;
use covem::workspace::WorkspaceError;
use covem::{CoverageEmAlgorithm, EmError, EmParams, EmStatus};
use ndarray::{Array2, Axis};

fn fit_params() -> EmParams {
    EmParams {
        num_latents: 2,
        num_target_blocks: 3,
        max_em_iterations: 100,
        ..EmParams::default()
    }
}

/// Sum of squared circular first differences down each loading column.
fn roughness(loading: &Array2<f64>) -> f64 {
    let n = loading.nrows();
    (0..n)
        .map(|t| {
            let diff = &loading.row((t + 1) % n) - &loading.row(t);
            diff.dot(&diff)
        })
        .sum()
}

#[test]
fn em_converges_on_low_rank_data() {
    init_logging();
    let data = SyntheticCoverageBuilder::new(40, 60).seed(7).build();
    let mut algorithm = CoverageEmAlgorithm::new(data.read_counts.view(), fit_params()).unwrap();
    let status = algorithm.run().unwrap();

    assert!(status.is_success(), "EM ended with {status:?}");
    assert!(algorithm.iterations() >= 1);
    assert_eq!(
        algorithm.log_likelihood_trace().len(),
        algorithm.iterations() + 1
    );
    let model = algorithm.model();
    assert!(model.unexplained_variance().iter().all(|&v| v >= 0.0 && v.is_finite()));
    assert!(model.factor_loading().iter().all(|v| v.is_finite()));
}

#[test]
fn log_likelihood_does_not_decrease() {
    let data = SyntheticCoverageBuilder::new(30, 40)
        .with_noise_sd(0.1)
        .seed(11)
        .build();
    let params = EmParams {
        max_em_iterations: 25,
        ..fit_params()
    };
    let mut algorithm = CoverageEmAlgorithm::new(data.read_counts.view(), params).unwrap();
    algorithm.run().unwrap();

    for pair in algorithm.log_likelihood_trace().windows(2) {
        let slack = 1e-6 * pair[0].abs().max(1.0);
        assert!(
            pair[1] >= pair[0] - slack,
            "log likelihood decreased from {} to {}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn learned_mean_bias_tracks_generating_bias() {
    let data = SyntheticCoverageBuilder::new(200, 30)
        .with_depth(400.0)
        .seed(3)
        .build();
    let mut algorithm = CoverageEmAlgorithm::new(data.read_counts.view(), fit_params()).unwrap();
    algorithm.run().unwrap();

    // The depth absorbs a global offset, so compare centred biases.
    let learned = algorithm.model().mean_bias();
    let learned = &learned - learned.mean().unwrap();
    let truth = &data.mean_bias - data.mean_bias.mean().unwrap();
    let max_error = (&learned - &truth)
        .iter()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    assert!(max_error < 0.2, "max centred bias error {max_error}");
}

/// Fraction of the squared norm of `truth` lying in the column space of `learned`.
fn captured_fraction(truth: &Array2<f64>, learned: &Array2<f64>) -> f64 {
    let gram = guarded_inverse(learned.t().dot(learned).view()).unwrap().inverse;
    let projected = learned.dot(&gram.dot(&learned.t().dot(truth)));
    projected.iter().map(|v| v * v).sum::<f64>() / truth.iter().map(|v| v * v).sum::<f64>()
}

#[test]
fn learned_loadings_span_the_generating_subspace() {
    let data = SyntheticCoverageBuilder::new(200, 30)
        .with_latents(2)
        .with_depth(400.0)
        .with_loading_scale(0.4)
        .seed(13)
        .build();
    let params = EmParams {
        max_em_iterations: 200,
        log_likelihood_tol: 1e-8,
        ..fit_params()
    };
    let mut algorithm = CoverageEmAlgorithm::new(data.read_counts.view(), params).unwrap();
    algorithm.run().unwrap();

    // Per-sample depth estimates soak up the mean loading, so compare centred columns.
    let truth = &data.factor_loading - &data.factor_loading.mean_axis(Axis(0)).unwrap();
    let learned = algorithm.model().factor_loading();
    let learned = &learned - &learned.mean_axis(Axis(0)).unwrap();
    let fraction = captured_fraction(&truth, &learned);
    assert!(fraction > 0.8, "learned loadings capture only {fraction} of the true subspace");
}

#[test]
fn pure_noise_terminates() {
    let data = SyntheticCoverageBuilder::new(20, 25)
        .with_loading_scale(0.0)
        .with_noise_sd(0.0)
        .seed(5)
        .build();
    let params = EmParams {
        max_em_iterations: 30,
        ..fit_params()
    };
    let mut algorithm = CoverageEmAlgorithm::new(data.read_counts.view(), params).unwrap();
    let status = algorithm.run().unwrap();
    assert!(status.is_terminal());
    assert!(algorithm.iterations() <= 30);
    assert_eq!(algorithm.status(), status);
}

#[test]
fn repeated_runs_are_identical() {
    let data = SyntheticCoverageBuilder::new(25, 30).seed(19).build();
    let params = EmParams {
        max_em_iterations: 8,
        ..fit_params()
    };
    let mut first = CoverageEmAlgorithm::new(data.read_counts.view(), params.clone()).unwrap();
    let mut second = CoverageEmAlgorithm::new(data.read_counts.view(), params).unwrap();
    assert_eq!(first.run().unwrap(), second.run().unwrap());
    assert_eq!(first.log_likelihood_trace(), second.log_likelihood_trace());
    assert_eq!(first.model(), second.model());
}

#[test]
fn block_layout_does_not_change_the_fit() {
    let data = SyntheticCoverageBuilder::new(25, 30).seed(23).build();
    let single = EmParams {
        num_target_blocks: 1,
        max_em_iterations: 5,
        log_likelihood_tol: 1e-300,
        param_change_tol: 1e-300,
        ..fit_params()
    };
    let blocked = EmParams {
        num_target_blocks: 4,
        ..single.clone()
    };
    let mut one = CoverageEmAlgorithm::new(data.read_counts.view(), single).unwrap();
    let mut four = CoverageEmAlgorithm::new(data.read_counts.view(), blocked).unwrap();
    assert_eq!(one.run().unwrap(), EmStatus::FailedMaxIterations);
    assert_eq!(four.run().unwrap(), EmStatus::FailedMaxIterations);
    assert_eq!(four.model().blocks().len(), 4);

    let difference = (&one.model().factor_loading() - &four.model().factor_loading())
        .iter()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    assert!(difference < 1e-8, "loadings differ by {difference}");
    let bias_difference = (&one.model().mean_bias() - &four.model().mean_bias())
        .iter()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    assert!(bias_difference < 1e-8, "mean biases differ by {bias_difference}");
}

#[test]
fn psi_budget_of_one_iteration_fails_tolerance() {
    let data = SyntheticCoverageBuilder::new(30, 20)
        .with_noise_sd(0.3)
        .seed(29)
        .build();
    let params = EmParams {
        max_psi_iterations: 1,
        psi_tol: f64::MIN_POSITIVE,
        ..fit_params()
    };
    let mut algorithm = CoverageEmAlgorithm::new(data.read_counts.view(), params).unwrap();
    let status = algorithm.run().unwrap();

    assert_eq!(status, EmStatus::FailedPsiTolerance);
    assert!(status.is_terminal());
    assert!(!status.is_success());
    assert_eq!(algorithm.iterations(), 1);

    let signal = algorithm.last_signal().unwrap();
    assert_eq!(signal.step, EmStep::UnexplainedVariance);
    assert_eq!(signal.status, SubroutineStatus::Failure);
    assert_eq!(signal.payload.iterations, Some(1));

    let psi = algorithm.model().unexplained_variance();
    assert!(psi.iter().all(|v| v.is_finite()));
    assert!(psi.iter().any(|&v| v > 0.0));

    // A terminal run does not move any more.
    assert_eq!(algorithm.run().unwrap(), EmStatus::FailedPsiTolerance);
    assert_eq!(algorithm.iterations(), 1);
}

#[test]
fn loading_budget_of_one_iteration_fails_tolerance() {
    let data = SyntheticCoverageBuilder::new(30, 24).seed(47).build();
    let params = EmParams {
        max_w_iterations: 1,
        w_tol: 1e-14,
        ..fit_params()
    }
    .with_fourier_regularization(1e3);
    let mut algorithm = CoverageEmAlgorithm::new(data.read_counts.view(), params).unwrap();
    let status = algorithm.run().unwrap();

    assert_eq!(status, EmStatus::FailedWTolerance);
    assert!(status.is_terminal());
    assert!(!status.is_success());
    assert_eq!(algorithm.iterations(), 1);

    let signal = algorithm.last_signal().unwrap();
    assert_eq!(signal.step, EmStep::FactorLoading);
    assert_eq!(signal.status, SubroutineStatus::Failure);
    assert_eq!(signal.payload.iterations, Some(1));
    assert!(signal.payload.residual.is_some_and(|r| r >= 1e-14));
    assert!(algorithm.model().factor_loading().iter().all(|v| v.is_finite()));
}

#[test]
fn small_parameter_change_converges_on_params() {
    let data = SyntheticCoverageBuilder::new(40, 60).seed(7).build();
    let params = EmParams {
        max_em_iterations: 5000,
        log_likelihood_tol: 1e-300,
        param_change_tol: 1e-3,
        ..fit_params()
    };
    let mut algorithm = CoverageEmAlgorithm::new(data.read_counts.view(), params).unwrap();
    let status = algorithm.run().unwrap();

    assert_eq!(status, EmStatus::ConvergedParams);
    assert!(status.is_success());
    let report = algorithm.report();
    assert!(report.last_parameter_change.is_some_and(|change| change < 1e-3));
    assert!(report.iterations < 5000);
}

#[test]
fn fourier_regularization_smooths_loadings() {
    init_logging();
    let data = SyntheticCoverageBuilder::new(30, 48)
        .with_loading_scale(0.4)
        .seed(31)
        .build();
    let plain = EmParams {
        max_em_iterations: 15,
        ..fit_params()
    };
    let smooth = plain.clone().with_fourier_regularization(1e5);

    let mut unregularized = CoverageEmAlgorithm::new(data.read_counts.view(), plain).unwrap();
    let mut regularized = CoverageEmAlgorithm::new(data.read_counts.view(), smooth).unwrap();
    unregularized.run().unwrap();
    let status = regularized.run().unwrap();

    assert!(status.is_terminal());
    assert_ne!(status, EmStatus::FailedWTolerance);
    assert!(regularized.log_likelihood().is_finite());
    assert!(regularized.workspace().fourier_operator().is_some());

    let rough = roughness(&unregularized.model().factor_loading());
    let smoothed = roughness(&regularized.model().factor_loading());
    assert!(
        smoothed < rough,
        "regularized roughness {smoothed} is not below unregularized {rough}"
    );
}

#[test]
fn steps_can_be_driven_individually() {
    let data = SyntheticCoverageBuilder::new(15, 20).seed(37).build();
    let mut algorithm = CoverageEmAlgorithm::new(data.read_counts.view(), fit_params()).unwrap();

    let signal = algorithm.update_mean_bias().unwrap();
    assert_eq!(signal.step, EmStep::MeanBias);
    assert!(signal.is_success());

    algorithm.update_signal_quadratic_posterior().unwrap();
    let quadratic = &algorithm.workspace().caches()[0];
    assert!(quadratic.signal_quadratic_posterior().iter().all(|&b| b >= -1e-9));

    let signal = algorithm.update_unexplained_variance().unwrap();
    assert_eq!(signal.step, EmStep::UnexplainedVariance);
    assert!(signal.payload.iterations.is_some());

    let signal = algorithm.update_factor_loading().unwrap();
    assert_eq!(signal.step, EmStep::FactorLoading);

    let signal = algorithm.update_latent_posteriors().unwrap();
    assert_eq!(signal.step, EmStep::LatentPosteriors);
    assert_eq!(signal.payload.log_likelihood, Some(algorithm.log_likelihood()));
    assert_eq!(algorithm.last_signal(), Some(&signal));

    // Driving the steps by hand does not advance the run state.
    assert_eq!(algorithm.status(), EmStatus::NotDetermined);
    assert_eq!(algorithm.iterations(), 0);
}

#[test]
fn zero_read_counts_are_masked_out() {
    let mut data = SyntheticCoverageBuilder::new(20, 24).seed(41).build();
    data.read_counts.column_mut(3).fill(0);
    data.read_counts[[2, 7]] = 0;
    let mut algorithm = CoverageEmAlgorithm::new(data.read_counts.view(), fit_params()).unwrap();
    algorithm.run().unwrap();

    let summed_mask = algorithm
        .workspace()
        .caches()
        .iter()
        .map(|c| c.summed_mask().to_owned())
        .collect::<Vec<_>>();
    let summed_mask = ndarray::concatenate(
        Axis(0),
        &summed_mask.iter().map(|m| m.view()).collect::<Vec<_>>(),
    )
    .unwrap();
    assert_eq!(summed_mask[3], 0.0);
    assert_eq!(summed_mask[7], 19.0);
    assert!(algorithm.log_likelihood().is_finite());
    assert!(algorithm.model().mean_bias().iter().all(|v| v.is_finite()));
}

#[test]
fn invalid_configurations_are_rejected() {
    let data = SyntheticCoverageBuilder::new(10, 12).seed(43).build();

    let zero_blocks = EmParams {
        num_target_blocks: 0,
        ..fit_params()
    };
    assert!(matches!(
        CoverageEmAlgorithm::new(data.read_counts.view(), zero_blocks),
        Err(EmError::Params(_))
    ));

    let too_many_blocks = EmParams {
        num_target_blocks: 13,
        ..fit_params()
    };
    assert!(matches!(
        CoverageEmAlgorithm::new(data.read_counts.view(), too_many_blocks),
        Err(EmError::Workspace(WorkspaceError::InvalidBlockCount {
            requested: 13,
            num_targets: 12
        }))
    ));

    let too_many_latents = EmParams {
        num_latents: 13,
        ..fit_params()
    };
    assert!(matches!(
        CoverageEmAlgorithm::new(data.read_counts.view(), too_many_latents),
        Err(EmError::Workspace(WorkspaceError::InvalidLatentCount { .. }))
    ));

    let empty = Array2::<u32>::zeros((0, 12));
    assert!(matches!(
        CoverageEmAlgorithm::new(empty.view(), fit_params()),
        Err(EmError::Workspace(WorkspaceError::EmptyReadCounts { .. }))
    ));
}
