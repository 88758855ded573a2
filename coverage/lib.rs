#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! # Target coverage bias modeling
//!
//! Fits a latent-factor model of systematic coverage bias to a samples x targets
//! matrix of read counts. The log-bias of sample `s` on target `t` is modeled as
//!
//! `m_st = m_t + W_t . z_s + e_st`,   `z_s ~ N(0, I)`,   `e_st ~ N(0, Psi_t + Sigma_st)`
//!
//! where `Sigma_st` is the Poisson variance of the log count. The target axis is
//! partitioned into contiguous blocks; every block owns its slice of the model
//! parameters and of the sample caches, and the EM driver folds over the blocks
//! for the quantities that couple them.

pub mod block;
pub mod cache;
pub mod em;
pub mod fourier;
pub mod linalg;
pub mod model;
pub mod params;
pub mod workspace;

pub use block::{TargetSpaceBlock, partition_target_space};
pub use em::{
    CoverageEmAlgorithm, EmError, EmFitReport, EmStatus, EmStep, SubroutineSignal, SubroutineStatus,
};
pub use fourier::FourierOperator;
pub use model::{CoverageModel, CoverageModelBlock};
pub use params::EmParams;
pub use workspace::{CoverageWorkspace, estimate_mean_read_depth};
