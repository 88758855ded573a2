//! The EM workspace: ingested data, block caches, model parameters and the
//! latent posterior moments, together with the E-step and M-step kernels that
//! act on them.
//!
//! The target axis is split into blocks. Per-target work (mean bias, unexplained
//! variance, unregularized loadings) runs independently on each block with rayon;
//! the E-step and the regularized loading solve fold over all blocks.

use crate::block::{BlockError, partition_target_space};
use crate::cache::SampleTargetCache;
use crate::fourier::{FourierError, FourierOperator};
use crate::linalg::{InversionError, guarded_inverse};
use crate::model::{CoverageModel, ModelError};
use crate::params::{EmParams, ParamsError};
use itertools::izip;
use ndarray::{
    Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, ShapeError, Zip, concatenate, s,
};
use rayon::prelude::*;
use std::f64::consts::PI;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error(
        "Read-count matrix must hold at least one sample and one target, but its shape is {samples}x{targets}."
    )]
    EmptyReadCounts { samples: usize, targets: usize },

    #[error(
        "Number of target blocks must be between 1 and the number of targets ({num_targets}), but was {requested}."
    )]
    InvalidBlockCount { requested: usize, num_targets: usize },

    #[error(
        "Number of latent factors must be between 1 and the number of targets ({num_targets}), but was {requested}."
    )]
    InvalidLatentCount { requested: usize, num_targets: usize },

    #[error("Bad input: {0}")]
    BadInput(String),

    #[error("Invalid EM parameters: {0}")]
    Params(#[from] ParamsError),

    #[error("Target-space partitioning failed: {0}")]
    Block(#[from] BlockError),

    #[error("Model parameter error: {0}")]
    Model(#[from] ModelError),

    #[error("Fourier regularizer error: {0}")]
    Fourier(#[from] FourierError),

    #[error("Matrix inversion failed: {0}")]
    Inversion(#[from] InversionError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ShapeError),
}

/// Outcome of an inner iterative solve of the M step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InnerSolve {
    pub iterations: usize,
    /// Last absolute change (unexplained variance) or relative residual (loadings).
    pub residual: f64,
    pub converged: bool,
}

impl InnerSolve {
    fn exact() -> Self {
        Self {
            iterations: 1,
            residual: 0.0,
            converged: true,
        }
    }

    /// Worst case over independent solves.
    fn merge(self, other: Self) -> Self {
        Self {
            iterations: self.iterations.max(other.iterations),
            residual: self.residual.max(other.residual),
            converged: self.converged && other.converged,
        }
    }
}

/// Latent posterior of one sample together with its log-likelihood term.
struct SamplePosterior {
    mean: Array1<f64>,
    second_moment: Array2<f64>,
    covariance: Array2<f64>,
    log_likelihood: f64,
}

/// Closed-form depth estimate `sum M (n - 1/2) P / sum M P^2`.
///
/// `total_mult_bias` is the product of every multiplicative factor on the
/// expected count other than the depth itself. Besides empty or mismatched
/// vectors, a zero denominator (no usable target with a non-zero bias) is also
/// reported as [`WorkspaceError::BadInput`] rather than returning a non-finite
/// depth.
pub fn estimate_mean_read_depth(
    read_count: ArrayView1<f64>,
    total_mult_bias: ArrayView1<f64>,
    mask: ArrayView1<f64>,
) -> Result<f64, WorkspaceError> {
    if read_count.is_empty() {
        return Err(WorkspaceError::BadInput(
            "cannot estimate a read depth from empty vectors".to_string(),
        ));
    }
    if read_count.len() != total_mult_bias.len() || read_count.len() != mask.len() {
        return Err(WorkspaceError::BadInput(format!(
            "read counts, biases and mask must have equal lengths, but have lengths {}, {} and {}",
            read_count.len(),
            total_mult_bias.len(),
            mask.len()
        )));
    }
    let (numerator, denominator) = izip!(read_count, total_mult_bias, mask).fold(
        (0.0, 0.0),
        |(numerator, denominator), (&n, &p, &m)| {
            (numerator + m * (n - 0.5) * p, denominator + m * p * p)
        },
    );
    if denominator > 0.0 {
        Ok(numerator / denominator)
    } else {
        Err(WorkspaceError::BadInput(
            "no usable target with a non-zero bias".to_string(),
        ))
    }
}

/// Fisher scoring for the unexplained variance of a single target.
///
/// Maximizes `sum_s M [-ln(Psi + Sigma) - B / (Psi + Sigma)] / 2` over
/// `Psi >= 0`, starting from `start`.
fn fisher_scoring_psi(
    start: f64,
    mask: ArrayView1<f64>,
    quadratic: ArrayView1<f64>,
    statistical_variance: ArrayView1<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> (f64, InnerSolve) {
    let mut psi = start;
    let mut change = 0.0;
    for iteration in 1..=max_iterations {
        let (score, information) = izip!(mask, quadratic, statistical_variance).fold(
            (0.0, 0.0),
            |(score, information), (&m, &b, &sigma)| {
                let total = psi + sigma;
                let inverse_squared = m / (total * total);
                (
                    score + (b - total) * inverse_squared,
                    information + inverse_squared,
                )
            },
        );
        if information <= 0.0 {
            // no usable sample on this target
            return (
                psi,
                InnerSolve {
                    iterations: iteration,
                    residual: 0.0,
                    converged: true,
                },
            );
        }
        let next = (psi + score / information).max(0.0);
        change = (next - psi).abs();
        psi = next;
        if change < tolerance {
            return (
                psi,
                InnerSolve {
                    iterations: iteration,
                    residual: change,
                    converged: true,
                },
            );
        }
    }
    (
        psi,
        InnerSolve {
            iterations: max_iterations,
            residual: change,
            converged: false,
        },
    )
}

/// Per-target normal equations of the loading update over one block.
///
/// Returns `A` (targets x latents x latents) with `A_t = sum_s w_st E[z z^T]_s`,
/// `b` (targets x latents) with `b_t = sum_s w_st r_st E[z]_s`, and the weight
/// totals `sum_s w_st`.
fn loading_normal_equations(
    cache: &SampleTargetCache,
    first_moments: ArrayView2<f64>,
    second_moments: ArrayView3<f64>,
) -> Result<(Array3<f64>, Array2<f64>, Array1<f64>), WorkspaceError> {
    let (num_samples, num_latents, _) = second_moments.dim();
    let num_targets = cache.target_space_block().num_targets();
    let weights = cache.masked_inverse_total_variance();

    let flat_second = second_moments
        .to_owned()
        .into_shape_with_order((num_samples, num_latents * num_latents))?;
    let lhs = weights
        .t()
        .dot(&flat_second)
        .into_shape_with_order((num_targets, num_latents, num_latents))?;
    let weighted_residual = &weights * &cache.bias_deviation();
    let rhs = weighted_residual.t().dot(&first_moments);
    let totals = weights.sum_axis(Axis(0));
    Ok((lhs, rhs, totals))
}

/// Applies the block-diagonal operator `x_t -> blocks_t x_t` row by row.
fn block_diagonal_product(blocks: ArrayView3<f64>, x: ArrayView2<f64>) -> Array2<f64> {
    let mut result = Array2::zeros(x.raw_dim());
    for (t, mut row) in result.rows_mut().into_iter().enumerate() {
        row.assign(&blocks.index_axis(Axis(0), t).dot(&x.row(t)));
    }
    result
}

fn frobenius_inner(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc, &x, &y| acc + x * y)
}

pub struct CoverageWorkspace {
    num_samples: usize,
    num_targets: usize,
    num_latents: usize,
    params: EmParams,
    model: CoverageModel,
    caches: Vec<SampleTargetCache>,
    sample_read_depths: Array1<f64>,
    /// `E[z_s]`, samples x latents.
    first_moments: Array2<f64>,
    /// `E[z_s z_s^T]`, samples x latents x latents.
    second_moments: Array3<f64>,
    /// `G_s`, samples x latents x latents.
    posterior_covariances: Array3<f64>,
    fourier: Option<FourierOperator>,
    total_mask: f64,
    log_likelihood: f64,
}

impl CoverageWorkspace {
    /// Ingests a samples x targets matrix of raw read counts, initializes the
    /// model, and computes the initial latent posteriors.
    pub fn new(read_counts: ArrayView2<u32>, params: &EmParams) -> Result<Self, WorkspaceError> {
        params.validate()?;
        let (num_samples, num_targets) = read_counts.dim();
        if num_samples == 0 || num_targets == 0 {
            return Err(WorkspaceError::EmptyReadCounts {
                samples: num_samples,
                targets: num_targets,
            });
        }
        if params.num_target_blocks == 0 || params.num_target_blocks > num_targets {
            return Err(WorkspaceError::InvalidBlockCount {
                requested: params.num_target_blocks,
                num_targets,
            });
        }
        if params.num_latents == 0 || params.num_latents > num_targets {
            return Err(WorkspaceError::InvalidLatentCount {
                requested: params.num_latents,
                num_targets,
            });
        }

        let blocks = partition_target_space(
            num_targets,
            params.num_target_blocks,
            params.min_target_block_size,
        )?;

        log::warn!(
            "No germline copy numbers were given; assuming {} on every target of every sample.",
            params.default_germline_copy_number
        );
        log::warn!(
            "No target masks were given; targets with a zero read count are masked out (fixup count {}).",
            params.read_count_fixup
        );
        let caches: Vec<SampleTargetCache> = blocks
            .par_iter()
            .map(|&block| {
                SampleTargetCache::from_read_counts(
                    block,
                    read_counts,
                    params.read_count_fixup,
                    params.default_germline_copy_number,
                )
            })
            .collect();
        let total_mask = caches.iter().map(|c| c.mask().sum()).sum::<f64>();
        if total_mask == 0.0 {
            log::warn!("Every read count is zero; the log likelihood is reported unnormalized.");
        }

        let fourier = if params.use_fourier_regularization {
            Some(FourierOperator::smoothing_penalty(
                num_targets,
                params.fourier_regularization_strength,
            )?)
        } else {
            None
        };

        let num_latents = params.num_latents;
        let mut workspace = Self {
            num_samples,
            num_targets,
            num_latents,
            params: params.clone(),
            model: CoverageModel::new(&blocks, num_latents)?,
            caches,
            sample_read_depths: Array1::ones(num_samples),
            first_moments: Array2::zeros((num_samples, num_latents)),
            second_moments: Array3::zeros((num_samples, num_latents, num_latents)),
            posterior_covariances: Array3::zeros((num_samples, num_latents, num_latents)),
            fourier,
            total_mask,
            log_likelihood: f64::NEG_INFINITY,
        };
        workspace.initialize()?;
        workspace.update_latent_posteriors()?;

        log::info!(
            "Coverage workspace ready: {} samples, {} targets in {} blocks, {} latent factors, initial log likelihood {:.6}.",
            num_samples,
            num_targets,
            workspace.caches.len(),
            num_latents,
            workspace.log_likelihood
        );
        Ok(workspace)
    }

    /// Unit copy ratios, depth estimates, sample biases and the starting model.
    fn initialize(&mut self) -> Result<(), WorkspaceError> {
        for cache in &mut self.caches {
            cache.set_copy_ratios_to_constant(1.0);
        }

        let total_mult_bias: Vec<Array2<f64>> = self
            .caches
            .iter()
            .map(SampleTargetCache::total_multiplicative_bias)
            .collect();
        for (sample, depth) in self.sample_read_depths.iter_mut().enumerate() {
            let read_count = concatenate(
                Axis(0),
                &self
                    .caches
                    .iter()
                    .map(|cache| cache.read_count().index_axis_move(Axis(0), sample))
                    .collect::<Vec<_>>(),
            )?;
            let mask = concatenate(
                Axis(0),
                &self
                    .caches
                    .iter()
                    .map(|cache| cache.mask().index_axis_move(Axis(0), sample))
                    .collect::<Vec<_>>(),
            )?;
            let bias = concatenate(
                Axis(0),
                &total_mult_bias
                    .iter()
                    .map(|product| product.row(sample))
                    .collect::<Vec<_>>(),
            )?;

            *depth = match estimate_mean_read_depth(read_count.view(), bias.view(), mask.view()) {
                Ok(estimate) if estimate.is_finite() && estimate > 0.0 => estimate,
                Ok(estimate) => {
                    log::warn!(
                        "Sample {} has a non-positive read depth estimate ({:.3e}); it is initialized to 1.",
                        sample,
                        estimate
                    );
                    1.0
                }
                Err(e) => {
                    log::warn!(
                        "Sample {} has no usable target ({}); its read depth is initialized to 1.",
                        sample,
                        e
                    );
                    1.0
                }
            };
        }

        let num_latents = self.num_latents;
        let depths = self.sample_read_depths.view();
        self.model
            .blocks_mut()
            .par_iter_mut()
            .zip(self.caches.par_iter_mut())
            .try_for_each(|(block, cache)| -> Result<(), WorkspaceError> {
                cache.initialize_biases(depths)?;
                block.set_mean_bias(cache.masked_mean_bias().view())?;
                block.set_unexplained_variance(Array1::zeros(block.num_targets()).view())?;
                let begin = block.target_space_block().begin();
                let truncated_identity =
                    Array2::from_shape_fn((block.num_targets(), num_latents), |(i, k)| {
                        if begin + i == k { 1.0 } else { 0.0 }
                    });
                block.set_factor_loading(truncated_identity.view())?;
                cache.update(block)?;
                Ok(())
            })
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn num_targets(&self) -> usize {
        self.num_targets
    }

    pub fn num_latents(&self) -> usize {
        self.num_latents
    }

    pub fn params(&self) -> &EmParams {
        &self.params
    }

    pub fn model(&self) -> &CoverageModel {
        &self.model
    }

    pub fn into_model(self) -> CoverageModel {
        self.model
    }

    pub fn caches(&self) -> &[SampleTargetCache] {
        &self.caches
    }

    pub fn sample_read_depths(&self) -> ArrayView1<'_, f64> {
        self.sample_read_depths.view()
    }

    pub fn first_moments(&self) -> ArrayView2<'_, f64> {
        self.first_moments.view()
    }

    pub fn second_moments(&self) -> ArrayView3<'_, f64> {
        self.second_moments.view()
    }

    pub fn posterior_covariances(&self) -> ArrayView3<'_, f64> {
        self.posterior_covariances.view()
    }

    pub fn fourier_operator(&self) -> Option<&FourierOperator> {
        self.fourier.as_ref()
    }

    /// Normalized log likelihood from the most recent E step.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// E step: latent posterior moments of every sample under the current
    /// model, and the resulting normalized log likelihood.
    pub fn update_latent_posteriors(&mut self) -> Result<f64, WorkspaceError> {
        let num_latents = self.num_latents;
        let model = &self.model;
        let caches = &self.caches;
        let ln_two_pi = (2.0 * PI).ln();

        let posteriors = (0..self.num_samples)
            .into_par_iter()
            .map(|sample| -> Result<SamplePosterior, WorkspaceError> {
                let mut precision = Array2::<f64>::eye(num_latents);
                let mut projected = Array1::<f64>::zeros(num_latents);
                let mut quadratic = 0.0;
                let mut log_normalization = 0.0;
                for (block, cache) in model.blocks().iter().zip(caches) {
                    let weights = cache
                        .masked_inverse_total_variance()
                        .index_axis_move(Axis(0), sample);
                    let residual = cache.bias_deviation().index_axis_move(Axis(0), sample);
                    let weighted_residual = &weights * &residual;
                    precision += &block.wtdw(weights)?;
                    projected += &block.wtv(weighted_residual.view())?;
                    quadratic += weighted_residual.dot(&residual);
                    log_normalization += Zip::from(cache.mask().row(sample))
                        .and(cache.total_variance().row(sample))
                        .fold(0.0, |acc, &m, &v| acc + m * (ln_two_pi + v.ln()));
                }

                let inverted = guarded_inverse(precision.view())?;
                let mean = inverted.inverse.dot(&projected);
                let outer = mean
                    .view()
                    .insert_axis(Axis(1))
                    .dot(&mean.view().insert_axis(Axis(0)));
                let log_likelihood = -0.5
                    * (log_normalization + quadratic + inverted.log_det - projected.dot(&mean));
                Ok(SamplePosterior {
                    second_moment: &inverted.inverse + &outer,
                    covariance: inverted.inverse,
                    mean,
                    log_likelihood,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut total = 0.0;
        for (sample, posterior) in posteriors.into_iter().enumerate() {
            self.first_moments.row_mut(sample).assign(&posterior.mean);
            self.second_moments
                .index_axis_mut(Axis(0), sample)
                .assign(&posterior.second_moment);
            self.posterior_covariances
                .index_axis_mut(Axis(0), sample)
                .assign(&posterior.covariance);
            total += posterior.log_likelihood;
        }
        if let Some(fop) = &self.fourier {
            total -= 0.5 * self.model.wtfw(fop)?.diag().sum();
        }

        self.log_likelihood = if self.total_mask > 0.0 {
            total / self.total_mask
        } else {
            total
        };
        log::debug!("E step finished, log likelihood {:.8}", self.log_likelihood);
        Ok(self.log_likelihood)
    }

    /// M step for the target mean bias:
    /// `m_t = sum_s w_st (m_st - W_t.E[z_s]) / sum_s w_st`.
    pub fn update_mean_bias(&mut self) -> Result<(), WorkspaceError> {
        let first_moments = self.first_moments.view();
        self.model
            .blocks_mut()
            .par_iter_mut()
            .zip(self.caches.par_iter_mut())
            .try_for_each(|(block, cache)| -> Result<(), WorkspaceError> {
                let explained = first_moments.dot(&block.factor_loading().t());
                let mut mean_bias = block.mean_bias().to_owned();
                Zip::from(&mut mean_bias)
                    .and(cache.masked_inverse_total_variance().columns())
                    .and(cache.bias().columns())
                    .and(explained.columns())
                    .for_each(|m, weights, bias, wz| {
                        let total_weight = weights.sum();
                        if total_weight > 0.0 {
                            *m = Zip::from(&weights)
                                .and(&bias)
                                .and(&wz)
                                .fold(0.0, |acc, &w, &b, &e| acc + w * (b - e))
                                / total_weight;
                        }
                    });
                block.set_mean_bias(mean_bias.view())?;
                cache.update(block)?;
                Ok(())
            })
    }

    /// Recomputes `B_st` on every block from the current moments and parameters.
    pub fn update_signal_quadratic_posterior(&mut self) -> Result<(), WorkspaceError> {
        let first_moments = self.first_moments.view();
        let second_moments = self.second_moments.view();
        self.model
            .blocks()
            .par_iter()
            .zip(self.caches.par_iter_mut())
            .try_for_each(|(block, cache)| -> Result<(), WorkspaceError> {
                cache.update_signal_quadratic_posterior(block, first_moments, second_moments)?;
                Ok(())
            })
    }

    /// M step for the unexplained variance, one Fisher-scoring solve per target.
    /// Uses the `B_st` of the last [`Self::update_signal_quadratic_posterior`].
    pub fn update_unexplained_variance(&mut self) -> Result<InnerSolve, WorkspaceError> {
        let tolerance = self.params.psi_tol;
        let max_iterations = self.params.max_psi_iterations;
        let outcomes = self
            .model
            .blocks_mut()
            .par_iter_mut()
            .zip(self.caches.par_iter_mut())
            .map(|(block, cache)| -> Result<InnerSolve, WorkspaceError> {
                let mut psi = block.unexplained_variance().to_owned();
                let mut outcome = InnerSolve {
                    iterations: 0,
                    residual: 0.0,
                    converged: true,
                };
                for (t, value) in psi.iter_mut().enumerate() {
                    let (solved, solve) = fisher_scoring_psi(
                        *value,
                        cache.mask().column(t),
                        cache.signal_quadratic_posterior().column(t),
                        cache.statistical_variance().column(t),
                        tolerance,
                        max_iterations,
                    );
                    *value = solved;
                    outcome = outcome.merge(solve);
                }
                block.set_unexplained_variance(psi.view())?;
                cache.update(block)?;
                Ok(outcome)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let outcome = outcomes
            .into_iter()
            .fold(InnerSolve::exact(), InnerSolve::merge);
        log::debug!(
            "Unexplained variance update: {} iterations, last change {:.3e}",
            outcome.iterations,
            outcome.residual
        );
        Ok(outcome)
    }

    /// M step for the factor loadings. Targets decouple unless Fourier
    /// regularization is enabled, in which case all targets are solved jointly.
    pub fn update_factor_loading(&mut self) -> Result<InnerSolve, WorkspaceError> {
        if self.fourier.is_some() {
            self.update_factor_loading_regularized()
        } else {
            self.update_factor_loading_per_target()
        }
    }

    fn update_factor_loading_per_target(&mut self) -> Result<InnerSolve, WorkspaceError> {
        let first_moments = self.first_moments.view();
        let second_moments = self.second_moments.view();
        self.model
            .blocks_mut()
            .par_iter_mut()
            .zip(self.caches.par_iter())
            .try_for_each(|(block, cache)| -> Result<(), WorkspaceError> {
                let (lhs, rhs, totals) =
                    loading_normal_equations(cache, first_moments, second_moments)?;
                let begin = block.target_space_block().begin();
                for (t, &total) in totals.iter().enumerate() {
                    if total <= 0.0 {
                        continue;
                    }
                    let inverted = guarded_inverse(lhs.index_axis(Axis(0), t))?;
                    let row = inverted.inverse.dot(&rhs.row(t));
                    block.set_factor_loading_per_target(begin + t, row.view())?;
                }
                Ok(())
            })?;
        Ok(InnerSolve::exact())
    }

    /// Preconditioned conjugate gradients on `A_t X_t + (F X)_t = b_t`, warm
    /// started from the current loadings. The preconditioner is the per-target
    /// block `(A_t + f I)^-1` with `f` the diagonal of `F`.
    fn update_factor_loading_regularized(&mut self) -> Result<InnerSolve, WorkspaceError> {
        let fop = match &self.fourier {
            Some(fop) => fop,
            None => return self.update_factor_loading_per_target(),
        };
        let (num_targets, num_latents) = (self.num_targets, self.num_latents);
        let first_moments = self.first_moments.view();
        let second_moments = self.second_moments.view();

        let equations = self
            .caches
            .par_iter()
            .map(|cache| loading_normal_equations(cache, first_moments, second_moments))
            .collect::<Result<Vec<_>, _>>()?;
        let mut lhs = Array3::<f64>::zeros((num_targets, num_latents, num_latents));
        let mut rhs = Array2::<f64>::zeros((num_targets, num_latents));
        for (cache, (block_lhs, block_rhs, _)) in self.caches.iter().zip(&equations) {
            let range = cache.target_space_block().range();
            lhs.slice_mut(s![range.clone(), .., ..]).assign(block_lhs);
            rhs.slice_mut(s![range, ..]).assign(block_rhs);
        }

        let shift = fop.diagonal();
        let mut preconditioner = Array3::<f64>::zeros((num_targets, num_latents, num_latents));
        for t in 0..num_targets {
            let mut shifted = lhs.index_axis(Axis(0), t).to_owned();
            shifted.diag_mut().mapv_inplace(|v| v + shift);
            preconditioner
                .index_axis_mut(Axis(0), t)
                .assign(&guarded_inverse(shifted.view())?.inverse);
        }

        let apply = |x: &Array2<f64>| -> Result<Array2<f64>, WorkspaceError> {
            Ok(block_diagonal_product(lhs.view(), x.view()) + fop.operate_columns(x.view())?)
        };

        let rhs_norm = frobenius_inner(&rhs, &rhs).sqrt();
        if rhs_norm == 0.0 {
            self.model
                .set_factor_loading(Array2::<f64>::zeros((num_targets, num_latents)).view())?;
            return Ok(InnerSolve::exact());
        }

        let mut x = self.model.factor_loading();
        let mut residual = &rhs - &apply(&x)?;
        let mut relative_residual = frobenius_inner(&residual, &residual).sqrt() / rhs_norm;
        let mut outcome = InnerSolve {
            iterations: 0,
            residual: relative_residual,
            converged: relative_residual < self.params.w_tol,
        };
        if !outcome.converged {
            let mut preconditioned = block_diagonal_product(preconditioner.view(), residual.view());
            let mut direction = preconditioned.clone();
            let mut rz = frobenius_inner(&residual, &preconditioned);

            for iteration in 1..=self.params.max_w_iterations {
                let image = apply(&direction)?;
                let curvature = frobenius_inner(&direction, &image);
                if !(curvature.is_finite() && curvature > 0.0) {
                    log::warn!(
                        "Loading solve lost positive curvature ({:.3e}) after {} iterations.",
                        curvature,
                        iteration - 1
                    );
                    break;
                }
                let step = rz / curvature;
                x.scaled_add(step, &direction);
                residual.scaled_add(-step, &image);

                relative_residual = frobenius_inner(&residual, &residual).sqrt() / rhs_norm;
                outcome.iterations = iteration;
                outcome.residual = relative_residual;
                if relative_residual < self.params.w_tol {
                    outcome.converged = true;
                    break;
                }

                preconditioned = block_diagonal_product(preconditioner.view(), residual.view());
                let rz_next = frobenius_inner(&residual, &preconditioned);
                let beta = rz_next / rz;
                rz = rz_next;
                direction = &preconditioned + &(beta * &direction);
            }
        }

        if x.iter().all(|v| v.is_finite()) {
            self.model.set_factor_loading(x.view())?;
        } else {
            log::warn!("Loading solve produced non-finite values; keeping the previous loadings.");
            outcome.converged = false;
        }
        log::debug!(
            "Regularized loading update: {} iterations, relative residual {:.3e}",
            outcome.iterations,
            outcome.residual
        );
        Ok(outcome)
    }
}
