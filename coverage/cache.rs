//! Per-block cache of sample x target quantities.
//!
//! Every array here has one row per sample and one column per target of the
//! owning block. The first group is fixed once the read counts are ingested; the
//! second group is derived from the current model parameters and is refreshed by
//! [`SampleTargetCache::update`] whenever the block's parameters change.

use crate::block::TargetSpaceBlock;
use crate::model::{CoverageModelBlock, ModelError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis, Zip, s};

#[derive(Debug, Clone)]
pub struct SampleTargetCache {
    block: TargetSpaceBlock,

    /// Read counts after the zero-count fixup.
    read_count: Array2<f64>,
    log_read_count: Array2<f64>,
    /// 1 where the raw count is positive, 0 where the target is unusable.
    mask: Array2<f64>,
    germline_copy_number: Array2<f64>,
    /// Poisson variance of the log count, `1 / n`.
    statistical_variance: Array2<f64>,
    /// Number of usable samples per target.
    summed_mask: Array1<f64>,

    copy_ratio: Array2<f64>,
    /// `m_st`
    bias: Array2<f64>,
    /// `m_st - m_t`
    bias_deviation: Array2<f64>,
    /// `Psi_t + Sigma_st`
    total_variance: Array2<f64>,
    /// `M_st / (Psi_t + Sigma_st)`
    masked_inverse_total_variance: Array2<f64>,
    /// `B_st`, the posterior expectation of the squared unexplained residual.
    signal_quadratic_posterior: Array2<f64>,
}

impl SampleTargetCache {
    /// Ingests the block's columns of a samples x targets matrix of raw counts.
    ///
    /// Zero counts are replaced by `fixup` and masked out; copy ratios start at 1
    /// and everything model-dependent starts at zero.
    pub fn from_read_counts(
        block: TargetSpaceBlock,
        raw_counts: ArrayView2<u32>,
        fixup: u32,
        germline_copy_number: u32,
    ) -> Self {
        let raw = raw_counts.slice(s![.., block.range()]);
        let shape = raw.dim();

        let mask = raw.mapv(|n| if n > 0 { 1.0 } else { 0.0 });
        let read_count = raw.mapv(|n| f64::from(if n > 0 { n } else { fixup }));
        let log_read_count = read_count.mapv(f64::ln);
        let statistical_variance = read_count.mapv(|n| 1.0 / n);
        let summed_mask = mask.sum_axis(Axis(0));

        Self {
            block,
            read_count,
            log_read_count,
            mask,
            germline_copy_number: Array2::from_elem(shape, f64::from(germline_copy_number)),
            statistical_variance,
            summed_mask,
            copy_ratio: Array2::ones(shape),
            bias: Array2::zeros(shape),
            bias_deviation: Array2::zeros(shape),
            total_variance: Array2::zeros(shape),
            masked_inverse_total_variance: Array2::zeros(shape),
            signal_quadratic_posterior: Array2::zeros(shape),
        }
    }

    pub fn target_space_block(&self) -> TargetSpaceBlock {
        self.block
    }

    pub fn num_samples(&self) -> usize {
        self.read_count.nrows()
    }

    pub fn read_count(&self) -> ArrayView2<'_, f64> {
        self.read_count.view()
    }

    pub fn log_read_count(&self) -> ArrayView2<'_, f64> {
        self.log_read_count.view()
    }

    pub fn mask(&self) -> ArrayView2<'_, f64> {
        self.mask.view()
    }

    pub fn germline_copy_number(&self) -> ArrayView2<'_, f64> {
        self.germline_copy_number.view()
    }

    pub fn statistical_variance(&self) -> ArrayView2<'_, f64> {
        self.statistical_variance.view()
    }

    pub fn summed_mask(&self) -> ArrayView1<'_, f64> {
        self.summed_mask.view()
    }

    pub fn copy_ratio(&self) -> ArrayView2<'_, f64> {
        self.copy_ratio.view()
    }

    pub fn bias(&self) -> ArrayView2<'_, f64> {
        self.bias.view()
    }

    pub fn bias_deviation(&self) -> ArrayView2<'_, f64> {
        self.bias_deviation.view()
    }

    pub fn total_variance(&self) -> ArrayView2<'_, f64> {
        self.total_variance.view()
    }

    pub fn masked_inverse_total_variance(&self) -> ArrayView2<'_, f64> {
        self.masked_inverse_total_variance.view()
    }

    pub fn signal_quadratic_posterior(&self) -> ArrayView2<'_, f64> {
        self.signal_quadratic_posterior.view()
    }

    pub fn set_copy_ratios_to_constant(&mut self, value: f64) {
        self.copy_ratio.fill(value);
    }

    /// `P_st c_st`, every multiplicative factor on the expected count except the depth.
    pub fn total_multiplicative_bias(&self) -> Array2<f64> {
        let mut product = Array2::zeros(self.copy_ratio.raw_dim());
        Zip::from(&mut product)
            .and(&self.germline_copy_number)
            .and(&self.copy_ratio)
            .for_each(|out, &p, &c| *out = p * c);
        product
    }

    /// Sets `m_st = ln n - ln P - ln c - ln d_s` for the given per-sample depths.
    pub fn initialize_biases(&mut self, depths: ArrayView1<f64>) -> Result<(), ModelError> {
        if depths.len() != self.num_samples() {
            return Err(ModelError::DimensionMismatch {
                what: "the sample read depths",
                expected: self.num_samples(),
                found: depths.len(),
            });
        }
        Zip::from(&mut self.bias)
            .and(&self.log_read_count)
            .and(&self.germline_copy_number)
            .and(&self.copy_ratio)
            .and_broadcast(&depths.insert_axis(Axis(1)))
            .for_each(|m, &log_n, &p, &c, &d| {
                *m = log_n - p.ln() - c.ln() - d.ln();
            });
        Ok(())
    }

    /// Mean of `m_st` over the usable samples of each target, 0 where none is usable.
    pub fn masked_mean_bias(&self) -> Array1<f64> {
        let weighted = (&self.bias * &self.mask).sum_axis(Axis(0));
        Zip::from(&weighted)
            .and(&self.summed_mask)
            .map_collect(|&total, &count| if count > 0.0 { total / count } else { 0.0 })
    }

    /// Recomputes everything that depends on `m_t` and `Psi_t`.
    pub fn update(&mut self, model: &CoverageModelBlock) -> Result<(), ModelError> {
        self.check_block(model)?;
        let mean_bias = model.mean_bias().insert_axis(Axis(0));
        let psi = model.unexplained_variance().insert_axis(Axis(0));

        Zip::from(&mut self.bias_deviation)
            .and(&self.bias)
            .and_broadcast(&mean_bias)
            .for_each(|r, &m, &mt| *r = m - mt);

        Zip::from(&mut self.total_variance)
            .and(&self.statistical_variance)
            .and_broadcast(&psi)
            .for_each(|v, &sigma, &p| *v = p + sigma);

        Zip::from(&mut self.masked_inverse_total_variance)
            .and(&self.mask)
            .and(&self.total_variance)
            .for_each(|w, &m, &v| *w = m / v);
        Ok(())
    }

    /// Recomputes `B_st = r^2 - 2 r W_t.z_s + W_t^T zz_s W_t` from the latent
    /// posterior moments (`first_moments`: samples x latents, `second_moments`:
    /// samples x latents x latents).
    pub fn update_signal_quadratic_posterior(
        &mut self,
        model: &CoverageModelBlock,
        first_moments: ArrayView2<f64>,
        second_moments: ArrayView3<f64>,
    ) -> Result<(), ModelError> {
        self.check_block(model)?;
        let num_samples = self.num_samples();
        let num_latents = model.num_latents();
        if first_moments.dim() != (num_samples, num_latents) {
            return Err(ModelError::ShapeMismatch {
                what: "the latent first moments",
                expected_rows: num_samples,
                expected_cols: num_latents,
                found_rows: first_moments.nrows(),
                found_cols: first_moments.ncols(),
            });
        }
        if second_moments.dim() != (num_samples, num_latents, num_latents) {
            return Err(ModelError::DimensionMismatch {
                what: "the latent second moments",
                expected: num_samples * num_latents * num_latents,
                found: second_moments.len(),
            });
        }

        let w = model.factor_loading();
        // samples x targets
        let projected = first_moments.dot(&w.t());
        for sample in 0..num_samples {
            let w_zz = w.dot(&second_moments.index_axis(Axis(0), sample));
            Zip::from(self.signal_quadratic_posterior.row_mut(sample))
                .and(self.bias_deviation.row(sample))
                .and(projected.row(sample))
                .and(w_zz.rows())
                .and(w.rows())
                .for_each(|b, &r, &wz, w_zz_t, w_t| {
                    *b = r * r - 2.0 * r * wz + w_zz_t.dot(&w_t);
                });
        }
        Ok(())
    }

    fn check_block(&self, model: &CoverageModelBlock) -> Result<(), ModelError> {
        if model.target_space_block() == self.block {
            Ok(())
        } else {
            Err(ModelError::InvalidBlockLayout(format!(
                "cache block {} does not match model block {}",
                self.block,
                model.target_space_block()
            )))
        }
    }
}
