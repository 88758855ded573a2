//! Real circulant linear operators specified by their Fourier spectrum.
//!
//! A circulant matrix `F(x, x') = f(x - x')` is diagonal in the Fourier basis, so
//! its action on a vector is a forward FFT, a per-bin scaling, and an inverse FFT.
//! Only real, zero-phase (symmetric) filters are represented: bin `k` and its
//! mirror `N - k` share the same real factor, which makes the operator
//! self-adjoint.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FourierError {
    #[error("The dimension of a Fourier operator must be at least 2, but was {0}.")]
    InvalidDimension(usize),

    #[error(
        "A Fourier operator of dimension {dimension} needs floor(dimension/2) + 1 = {expected} Fourier factors, but {found} were given."
    )]
    FactorCountMismatch {
        dimension: usize,
        expected: usize,
        found: usize,
    },

    #[error("A vector of length {found} cannot be acted on by a Fourier operator of dimension {expected}.")]
    DimensionMismatch { expected: usize, found: usize },
}

/// The action of a real circulant matrix, given its `floor(N/2) + 1` Fourier factors.
#[derive(Clone)]
pub struct FourierOperator {
    dimension: usize,
    fourier_factors: Vec<f64>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl fmt::Debug for FourierOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FourierOperator")
            .field("dimension", &self.dimension)
            .field("fourier_factors", &self.fourier_factors)
            .finish()
    }
}

impl FourierOperator {
    /// Builds the operator for vectors of length `dimension`.
    ///
    /// `fourier_factors[k]` scales frequency bin `k` (and its mirror). Its length must be
    /// exactly `dimension / 2 + 1`.
    pub fn new(dimension: usize, fourier_factors: &[f64]) -> Result<Self, FourierError> {
        if dimension < 2 {
            return Err(FourierError::InvalidDimension(dimension));
        }
        let expected = dimension / 2 + 1;
        if fourier_factors.len() != expected {
            return Err(FourierError::FactorCountMismatch {
                dimension,
                expected,
                found: fourier_factors.len(),
            });
        }

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(dimension);
        let inverse = planner.plan_fft_inverse(dimension);

        Ok(Self {
            dimension,
            fourier_factors: fourier_factors.to_vec(),
            forward,
            inverse,
        })
    }

    /// Smoothness prior along the target axis: the spectrum of a first-difference
    /// penalty, `strength * sin^2(pi k / N)`. It vanishes on the constant mode, so the
    /// overall level of a loading column is never penalized.
    pub fn smoothing_penalty(dimension: usize, strength: f64) -> Result<Self, FourierError> {
        let factors: Vec<f64> = (0..=dimension / 2)
            .map(|k| {
                let phase = PI * k as f64 / dimension as f64;
                strength * phase.sin().powi(2)
            })
            .collect();
        Self::new(dimension, &factors)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn fourier_factors(&self) -> &[f64] {
        &self.fourier_factors
    }

    /// The (constant) diagonal of the operator in the target basis, i.e. the mean of
    /// the full spectrum.
    pub fn diagonal(&self) -> f64 {
        let total: f64 = (0..self.dimension).map(|k| self.factor_for_bin(k)).sum();
        total / self.dimension as f64
    }

    fn factor_for_bin(&self, bin: usize) -> f64 {
        self.fourier_factors[bin.min(self.dimension - bin)]
    }

    /// Applies the operator to `x`.
    pub fn operate(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, FourierError> {
        if x.len() != self.dimension {
            return Err(FourierError::DimensionMismatch {
                expected: self.dimension,
                found: x.len(),
            });
        }

        let mut buffer: Vec<Complex64> = x.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        self.forward.process(&mut buffer);
        for (bin, value) in buffer.iter_mut().enumerate() {
            *value *= self.factor_for_bin(bin);
        }
        self.inverse.process(&mut buffer);

        // rustfft leaves both directions unnormalized
        let norm = 1.0 / self.dimension as f64;
        Ok(buffer.iter().map(|c| c.re * norm).collect())
    }

    /// The operator is symmetric, so its transpose acts identically.
    pub fn operate_transpose(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, FourierError> {
        self.operate(x)
    }

    /// Applies the operator to every column of `matrix` (rows index the operator's space).
    pub fn operate_columns(&self, matrix: ArrayView2<f64>) -> Result<Array2<f64>, FourierError> {
        if matrix.nrows() != self.dimension {
            return Err(FourierError::DimensionMismatch {
                expected: self.dimension,
                found: matrix.nrows(),
            });
        }
        let mut result = Array2::zeros(matrix.raw_dim());
        for (column, mut out) in matrix
            .axis_iter(Axis(1))
            .zip(result.axis_iter_mut(Axis(1)))
        {
            out.assign(&self.operate(column)?);
        }
        Ok(result)
    }
}
