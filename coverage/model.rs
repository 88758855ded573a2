use crate::block::{BlockError, TargetSpaceBlock};
use crate::fourier::{FourierError, FourierOperator};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Custom error type for model construction, mutation, and persistence.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Expected a vector of length {expected} for {what}, but found length {found}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "Expected a {expected_rows}x{expected_cols} matrix for {what}, but found {found_rows}x{found_cols}."
    )]
    ShapeMismatch {
        what: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        found_rows: usize,
        found_cols: usize,
    },

    #[error("Target index {index} lies outside of target block {block}.")]
    TargetIndexOutOfRange {
        index: usize,
        block: TargetSpaceBlock,
    },

    #[error("Latent index {index} is out of range for a model with {num_latents} latent factors.")]
    LatentIndexOutOfRange { index: usize, num_latents: usize },

    #[error(
        "Number of latent factors must be between 1 and the number of targets ({num_targets}), but was {num_latents}."
    )]
    InvalidLatentCount {
        num_latents: usize,
        num_targets: usize,
    },

    #[error("Unexplained variance must be finite and non-negative, but entry {position} is {value}.")]
    InvalidVariance { position: usize, value: f64 },

    #[error("Target blocks do not tile the target space: {0}")]
    InvalidBlockLayout(String),

    #[error("Invalid target block in model: {0}")]
    BlockError(#[from] BlockError),

    #[error("Fourier operator cannot act on the factor loadings: {0}")]
    FourierError(#[from] FourierError),

    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

fn check_length(what: &'static str, expected: usize, found: usize) -> Result<(), ModelError> {
    if expected == found {
        Ok(())
    } else {
        Err(ModelError::DimensionMismatch {
            what,
            expected,
            found,
        })
    }
}

fn check_variance(values: ArrayView1<f64>) -> Result<(), ModelError> {
    match values
        .iter()
        .position(|v| !v.is_finite() || *v < 0.0)
    {
        Some(position) => Err(ModelError::InvalidVariance {
            position,
            value: values[position],
        }),
        None => Ok(()),
    }
}

/// Model parameters restricted to one target block.
///
/// Holds the target mean bias `m_t`, the unexplained variance `Psi_t`, and the
/// rows of the factor loading matrix `W` (targets x latents) that belong to the
/// block. All parameters start at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageModelBlock {
    block: TargetSpaceBlock,
    num_latents: usize,
    mean_bias: Array1<f64>,
    unexplained_variance: Array1<f64>,
    factor_loading: Array2<f64>,
}

impl CoverageModelBlock {
    pub fn new(block: TargetSpaceBlock, num_latents: usize) -> Result<Self, ModelError> {
        if num_latents == 0 {
            return Err(ModelError::InvalidLatentCount {
                num_latents,
                num_targets: block.num_targets(),
            });
        }
        log::debug!("Allocating model parameters for block {block}");
        let num_targets = block.num_targets();
        Ok(Self {
            block,
            num_latents,
            mean_bias: Array1::zeros(num_targets),
            unexplained_variance: Array1::zeros(num_targets),
            factor_loading: Array2::zeros((num_targets, num_latents)),
        })
    }

    pub fn target_space_block(&self) -> TargetSpaceBlock {
        self.block
    }

    pub fn num_targets(&self) -> usize {
        self.block.num_targets()
    }

    pub fn num_latents(&self) -> usize {
        self.num_latents
    }

    pub fn mean_bias(&self) -> ArrayView1<'_, f64> {
        self.mean_bias.view()
    }

    pub fn unexplained_variance(&self) -> ArrayView1<'_, f64> {
        self.unexplained_variance.view()
    }

    pub fn factor_loading(&self) -> ArrayView2<'_, f64> {
        self.factor_loading.view()
    }

    /// `W^T diag(d) W` for a per-target weight vector `d`.
    pub fn wtdw(&self, diag: ArrayView1<f64>) -> Result<Array2<f64>, ModelError> {
        check_length("the diagonal of wtdw", self.num_targets(), diag.len())?;
        let weighted = &self.factor_loading * &diag.insert_axis(Axis(1));
        Ok(self.factor_loading.t().dot(&weighted))
    }

    /// `W^T F(W)`, with the circulant operator `F` applied to every column of `W`.
    pub fn wtfw(&self, fop: &FourierOperator) -> Result<Array2<f64>, ModelError> {
        check_length(
            "the Fourier operator dimension",
            self.num_targets(),
            fop.dimension(),
        )?;
        let filtered = fop.operate_columns(self.factor_loading.view())?;
        Ok(self.factor_loading.t().dot(&filtered))
    }

    /// `W v` for a latent-space vector `v`.
    pub fn wv(&self, v: ArrayView1<f64>) -> Result<Array1<f64>, ModelError> {
        check_length("the latent vector of wv", self.num_latents, v.len())?;
        Ok(self.factor_loading.dot(&v))
    }

    /// `W^T v` for a target-space vector `v`.
    pub fn wtv(&self, v: ArrayView1<f64>) -> Result<Array1<f64>, ModelError> {
        check_length("the target vector of wtv", self.num_targets(), v.len())?;
        Ok(self.factor_loading.t().dot(&v))
    }

    pub fn set_mean_bias(&mut self, mean_bias: ArrayView1<f64>) -> Result<(), ModelError> {
        check_length("the target mean bias", self.num_targets(), mean_bias.len())?;
        self.mean_bias.assign(&mean_bias);
        Ok(())
    }

    pub fn set_unexplained_variance(&mut self, variance: ArrayView1<f64>) -> Result<(), ModelError> {
        check_length(
            "the unexplained variance",
            self.num_targets(),
            variance.len(),
        )?;
        check_variance(variance)?;
        self.unexplained_variance.assign(&variance);
        Ok(())
    }

    pub fn set_factor_loading(&mut self, loading: ArrayView2<f64>) -> Result<(), ModelError> {
        if loading.dim() != self.factor_loading.dim() {
            return Err(ModelError::ShapeMismatch {
                what: "the block factor loading",
                expected_rows: self.num_targets(),
                expected_cols: self.num_latents,
                found_rows: loading.nrows(),
                found_cols: loading.ncols(),
            });
        }
        self.factor_loading.assign(&loading);
        Ok(())
    }

    /// Replaces the loading row of one target, addressed by its global index.
    pub fn set_factor_loading_per_target(
        &mut self,
        target_index: usize,
        row: ArrayView1<f64>,
    ) -> Result<(), ModelError> {
        if !self.block.contains(target_index) {
            return Err(ModelError::TargetIndexOutOfRange {
                index: target_index,
                block: self.block,
            });
        }
        check_length("a factor loading row", self.num_latents, row.len())?;
        self.factor_loading
            .row_mut(target_index - self.block.begin())
            .assign(&row);
        Ok(())
    }

    /// Replaces the loading column of one latent factor within this block.
    pub fn set_factor_loading_per_latent(
        &mut self,
        latent_index: usize,
        column: ArrayView1<f64>,
    ) -> Result<(), ModelError> {
        if latent_index >= self.num_latents {
            return Err(ModelError::LatentIndexOutOfRange {
                index: latent_index,
                num_latents: self.num_latents,
            });
        }
        check_length("a factor loading column", self.num_targets(), column.len())?;
        self.factor_loading.column_mut(latent_index).assign(&column);
        Ok(())
    }

    fn max_abs_change(&self, other: &Self) -> f64 {
        let mean = self
            .mean_bias
            .iter()
            .zip(other.mean_bias.iter())
            .map(|(a, b)| (a - b).abs());
        let variance = self
            .unexplained_variance
            .iter()
            .zip(other.unexplained_variance.iter())
            .map(|(a, b)| (a - b).abs());
        let loading = self
            .factor_loading
            .iter()
            .zip(other.factor_loading.iter())
            .map(|(a, b)| (a - b).abs());
        mean.chain(variance).chain(loading).fold(0.0, f64::max)
    }
}

/// The complete, block-partitioned coverage model.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageModel {
    num_targets: usize,
    num_latents: usize,
    blocks: Vec<CoverageModelBlock>,
}

/// On-disk form of one model block.
#[derive(Debug, Serialize, Deserialize)]
struct BlockRecord {
    begin: usize,
    end: usize,
    mean_bias: Vec<f64>,
    unexplained_variance: Vec<f64>,
    /// Row-major, one inner vector per target.
    factor_loading: Vec<Vec<f64>>,
}

/// On-disk form of the model, keyed by target block.
#[derive(Debug, Serialize, Deserialize)]
struct ModelRecord {
    num_targets: usize,
    num_latents: usize,
    blocks: Vec<BlockRecord>,
}

impl CoverageModel {
    /// Zero-initialized model over the given tiling of the target space.
    pub fn new(blocks: &[TargetSpaceBlock], num_latents: usize) -> Result<Self, ModelError> {
        let num_targets = check_tiling(blocks)?;
        if num_latents == 0 || num_latents > num_targets {
            return Err(ModelError::InvalidLatentCount {
                num_latents,
                num_targets,
            });
        }
        let blocks = blocks
            .iter()
            .map(|&block| CoverageModelBlock::new(block, num_latents))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            num_targets,
            num_latents,
            blocks,
        })
    }

    pub fn num_targets(&self) -> usize {
        self.num_targets
    }

    pub fn num_latents(&self) -> usize {
        self.num_latents
    }

    pub fn blocks(&self) -> &[CoverageModelBlock] {
        &self.blocks
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut [CoverageModelBlock] {
        &mut self.blocks
    }

    pub fn target_space_blocks(&self) -> Vec<TargetSpaceBlock> {
        self.blocks
            .iter()
            .map(CoverageModelBlock::target_space_block)
            .collect()
    }

    pub fn mean_bias(&self) -> Array1<f64> {
        let mut result = Array1::zeros(self.num_targets);
        for block in &self.blocks {
            let range = block.target_space_block().range();
            result.slice_mut(s![range]).assign(&block.mean_bias);
        }
        result
    }

    pub fn unexplained_variance(&self) -> Array1<f64> {
        let mut result = Array1::zeros(self.num_targets);
        for block in &self.blocks {
            let range = block.target_space_block().range();
            result
                .slice_mut(s![range])
                .assign(&block.unexplained_variance);
        }
        result
    }

    /// The full `W` (targets x latents), assembled from the blocks.
    pub fn factor_loading(&self) -> Array2<f64> {
        let mut result = Array2::zeros((self.num_targets, self.num_latents));
        for block in &self.blocks {
            let range = block.target_space_block().range();
            result
                .slice_mut(s![range, ..])
                .assign(&block.factor_loading);
        }
        result
    }

    /// Distributes a full `W` (targets x latents) over the blocks.
    pub fn set_factor_loading(&mut self, loading: ArrayView2<f64>) -> Result<(), ModelError> {
        if loading.dim() != (self.num_targets, self.num_latents) {
            return Err(ModelError::ShapeMismatch {
                what: "the model factor loading",
                expected_rows: self.num_targets,
                expected_cols: self.num_latents,
                found_rows: loading.nrows(),
                found_cols: loading.ncols(),
            });
        }
        for block in &mut self.blocks {
            let range = block.target_space_block().range();
            block.set_factor_loading(loading.slice(s![range, ..]))?;
        }
        Ok(())
    }

    /// `W^T diag(d) W` summed over all blocks; `d` spans the whole target space.
    pub fn wtdw(&self, diag: ArrayView1<f64>) -> Result<Array2<f64>, ModelError> {
        check_length("the diagonal of wtdw", self.num_targets, diag.len())?;
        let mut result = Array2::zeros((self.num_latents, self.num_latents));
        for block in &self.blocks {
            let range = block.target_space_block().range();
            result += &block.wtdw(diag.slice(s![range]))?;
        }
        Ok(result)
    }

    /// `W^T F(W)` where `F` acts along the whole target axis.
    pub fn wtfw(&self, fop: &FourierOperator) -> Result<Array2<f64>, ModelError> {
        check_length(
            "the Fourier operator dimension",
            self.num_targets,
            fop.dimension(),
        )?;
        let filtered = fop.operate_columns(self.factor_loading().view())?;
        let mut result = Array2::zeros((self.num_latents, self.num_latents));
        for block in &self.blocks {
            let range = block.target_space_block().range();
            result += &block
                .factor_loading
                .t()
                .dot(&filtered.slice(s![range, ..]));
        }
        Ok(result)
    }

    pub fn wv(&self, v: ArrayView1<f64>) -> Result<Array1<f64>, ModelError> {
        check_length("the latent vector of wv", self.num_latents, v.len())?;
        let mut result = Array1::zeros(self.num_targets);
        for block in &self.blocks {
            let range = block.target_space_block().range();
            result.slice_mut(s![range]).assign(&block.wv(v)?);
        }
        Ok(result)
    }

    pub fn wtv(&self, v: ArrayView1<f64>) -> Result<Array1<f64>, ModelError> {
        check_length("the target vector of wtv", self.num_targets, v.len())?;
        let mut result = Array1::zeros(self.num_latents);
        for block in &self.blocks {
            let range = block.target_space_block().range();
            result += &block.wtv(v.slice(s![range]))?;
        }
        Ok(result)
    }

    /// Largest absolute difference between any pair of corresponding parameters.
    pub fn max_abs_parameter_change(&self, other: &CoverageModel) -> Result<f64, ModelError> {
        if self.target_space_blocks() != other.target_space_blocks()
            || self.num_latents != other.num_latents
        {
            return Err(ModelError::InvalidBlockLayout(
                "cannot compare models with different block layouts".to_string(),
            ));
        }
        Ok(self
            .blocks
            .iter()
            .zip(other.blocks.iter())
            .map(|(a, b)| a.max_abs_change(b))
            .fold(0.0, f64::max))
    }

    /// Saves the model parameters, keyed by target block, as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let record = ModelRecord {
            num_targets: self.num_targets,
            num_latents: self.num_latents,
            blocks: self
                .blocks
                .iter()
                .map(|block| BlockRecord {
                    begin: block.block.begin(),
                    end: block.block.end(),
                    mean_bias: block.mean_bias.to_vec(),
                    unexplained_variance: block.unexplained_variance.to_vec(),
                    factor_loading: block
                        .factor_loading
                        .rows()
                        .into_iter()
                        .map(|row| row.to_vec())
                        .collect(),
                })
                .collect(),
        };
        let toml_string = toml::to_string_pretty(&record)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a model written by [`CoverageModel::save`], re-validating every shape.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let record: ModelRecord = toml::from_str(&toml_string)?;

        let layout = record
            .blocks
            .iter()
            .map(|b| TargetSpaceBlock::new(b.begin, b.end))
            .collect::<Result<Vec<_>, _>>()?;
        let mut model = Self::new(&layout, record.num_latents)?;
        if model.num_targets != record.num_targets {
            return Err(ModelError::InvalidBlockLayout(format!(
                "blocks cover {} targets but the file declares {}",
                model.num_targets, record.num_targets
            )));
        }

        for (block, stored) in model.blocks.iter_mut().zip(record.blocks) {
            block.set_mean_bias(Array1::from(stored.mean_bias).view())?;
            block.set_unexplained_variance(Array1::from(stored.unexplained_variance).view())?;
            check_length(
                "the stored factor loading rows",
                block.num_targets(),
                stored.factor_loading.len(),
            )?;
            for (offset, row) in stored.factor_loading.into_iter().enumerate() {
                let target_index = block.block.begin() + offset;
                block.set_factor_loading_per_target(target_index, Array1::from(row).view())?;
            }
        }
        Ok(model)
    }
}

/// Verifies that `blocks` tile `[0, T)` in order and returns `T`.
fn check_tiling(blocks: &[TargetSpaceBlock]) -> Result<usize, ModelError> {
    let mut expected_begin = 0;
    for block in blocks {
        if block.begin() != expected_begin {
            return Err(ModelError::InvalidBlockLayout(format!(
                "block {block} does not start at target {expected_begin}"
            )));
        }
        expected_begin = block.end();
    }
    if expected_begin == 0 {
        return Err(ModelError::InvalidBlockLayout(
            "at least one target block is required".to_string(),
        ));
    }
    Ok(expected_begin)
}
