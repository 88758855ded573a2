//! Synthetic read-count data for the integration tests.
//!
//! Counts are Poisson around `depth_s * 2 * exp(m_t + W_t . z_s + e_st)`, the
//! generative model the EM fits, with a germline copy number of 2 everywhere.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Normal, Poisson, StandardNormal};

pub struct SyntheticCoverage {
    pub read_counts: Array2<u32>,
    pub mean_bias: Array1<f64>,
    /// targets x latents
    pub factor_loading: Array2<f64>,
}

pub struct SyntheticCoverageBuilder {
    num_samples: usize,
    num_targets: usize,
    num_latents: usize,
    depth: f64,
    loading_scale: f64,
    noise_sd: f64,
    seed: u64,
}

impl SyntheticCoverageBuilder {
    pub fn new(num_samples: usize, num_targets: usize) -> Self {
        Self {
            num_samples,
            num_targets,
            num_latents: 2,
            depth: 100.0,
            loading_scale: 0.3,
            noise_sd: 0.05,
            seed: 42,
        }
    }

    pub fn with_latents(mut self, k: usize) -> Self {
        self.num_latents = k;
        self
    }

    pub fn with_depth(mut self, depth: f64) -> Self {
        self.depth = depth;
        self
    }

    /// Scale of the loadings; zero leaves only Poisson and unexplained noise.
    pub fn with_loading_scale(mut self, scale: f64) -> Self {
        self.loading_scale = scale;
        self
    }

    /// Standard deviation of the per-entry log-normal noise, i.e. `sqrt(Psi)`.
    pub fn with_noise_sd(mut self, sd: f64) -> Self {
        self.noise_sd = sd;
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = s;
        self
    }

    pub fn build(self) -> SyntheticCoverage {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mean_bias = Array1::from_shape_fn(self.num_targets, |_| {
            0.3 * rng.sample::<f64, _>(StandardNormal)
        });
        let factor_loading = Array2::from_shape_fn((self.num_targets, self.num_latents), |_| {
            self.loading_scale * rng.sample::<f64, _>(StandardNormal)
        });
        let latent_factors = Array2::from_shape_fn((self.num_samples, self.num_latents), |_| {
            rng.sample::<f64, _>(StandardNormal)
        });
        let depth_spread = Normal::<f64>::new(0.0, 0.2).unwrap();
        let noise = Normal::<f64>::new(0.0, self.noise_sd.max(f64::MIN_POSITIVE)).unwrap();

        let mut read_counts = Array2::<u32>::zeros((self.num_samples, self.num_targets));
        for s in 0..self.num_samples {
            let sample_depth = self.depth * rng.sample(depth_spread).exp();
            let signal = factor_loading.dot(&latent_factors.row(s));
            for t in 0..self.num_targets {
                let log_rate = sample_depth.ln()
                    + 2.0_f64.ln()
                    + mean_bias[t]
                    + signal[t]
                    + if self.noise_sd > 0.0 { rng.sample(noise) } else { 0.0 };
                let poisson = Poisson::new(log_rate.exp()).unwrap();
                read_counts[[s, t]] = rng.sample(poisson) as u32;
            }
        }

        SyntheticCoverage {
            read_counts,
            mean_bias,
            factor_loading,
        }
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
