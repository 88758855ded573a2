use crate::block::DEFAULT_MIN_TARGET_BLOCK_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("EM parameter '{name}' must be positive and finite, but was {value}.")]
    NotPositive { name: &'static str, value: f64 },

    #[error("Failed to read or write EM parameter file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML EM parameter file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize EM parameters to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Tuning knobs of a coverage model fit.
///
/// Every field has a default, so a TOML file only needs to name the values it
/// overrides. Ranges that depend on the data (block and latent counts versus the
/// number of targets) are checked when the workspace is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmParams {
    /// Maximum number of EM iterations.
    pub max_em_iterations: usize,
    /// Stopping criterion on the change of the normalized log likelihood.
    pub log_likelihood_tol: f64,
    /// Stopping criterion on the largest absolute change of any model parameter.
    pub param_change_tol: f64,
    /// Number of sequential partial maximization passes in each M step.
    pub num_sequential_maximizations: usize,
    /// Whether the factor loadings are smoothed along the target axis.
    pub use_fourier_regularization: bool,
    pub fourier_regularization_strength: f64,
    /// M-step tolerance on the unexplained variance.
    pub psi_tol: f64,
    pub max_psi_iterations: usize,
    /// M-step tolerance on the factor loadings (regularized solve only).
    pub w_tol: f64,
    pub max_w_iterations: usize,
    /// Dimension of the latent space.
    pub num_latents: usize,
    pub num_target_blocks: usize,
    pub min_target_block_size: usize,
    /// Read count substituted for targets with zero coverage, so that
    /// `ln(n)` and `1/n` stay finite. Such targets are masked out regardless.
    pub read_count_fixup: u32,
    /// Germline copy number assumed on every target until a per-sample
    /// copy-number input is available.
    pub default_germline_copy_number: u32,
}

impl Default for EmParams {
    fn default() -> Self {
        Self {
            max_em_iterations: 50,
            log_likelihood_tol: 1e-4,
            param_change_tol: 1e-6,
            num_sequential_maximizations: 1,
            use_fourier_regularization: false,
            fourier_regularization_strength: 10_000.0,
            psi_tol: 1e-6,
            max_psi_iterations: 200,
            w_tol: 1e-6,
            max_w_iterations: 200,
            num_latents: 5,
            num_target_blocks: 1,
            min_target_block_size: DEFAULT_MIN_TARGET_BLOCK_SIZE,
            read_count_fixup: 1,
            default_germline_copy_number: 2,
        }
    }
}

fn require_positive(name: &'static str, value: f64) -> Result<(), ParamsError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ParamsError::NotPositive { name, value })
    }
}

impl EmParams {
    /// Checks every data-independent constraint.
    pub fn validate(&self) -> Result<(), ParamsError> {
        require_positive("max_em_iterations", self.max_em_iterations as f64)?;
        require_positive("log_likelihood_tol", self.log_likelihood_tol)?;
        require_positive("param_change_tol", self.param_change_tol)?;
        require_positive(
            "num_sequential_maximizations",
            self.num_sequential_maximizations as f64,
        )?;
        require_positive(
            "fourier_regularization_strength",
            self.fourier_regularization_strength,
        )?;
        require_positive("psi_tol", self.psi_tol)?;
        require_positive("max_psi_iterations", self.max_psi_iterations as f64)?;
        require_positive("w_tol", self.w_tol)?;
        require_positive("max_w_iterations", self.max_w_iterations as f64)?;
        require_positive("num_latents", self.num_latents as f64)?;
        require_positive("num_target_blocks", self.num_target_blocks as f64)?;
        require_positive("min_target_block_size", self.min_target_block_size as f64)?;
        require_positive("read_count_fixup", f64::from(self.read_count_fixup))?;
        require_positive(
            "default_germline_copy_number",
            f64::from(self.default_germline_copy_number),
        )?;
        Ok(())
    }

    pub fn with_fourier_regularization(mut self, strength: f64) -> Self {
        self.use_fourier_regularization = true;
        self.fourier_regularization_strength = strength;
        self
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ParamsError> {
        let params: Self = toml::from_str(contents)?;
        params.validate()?;
        Ok(params)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ParamsError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
