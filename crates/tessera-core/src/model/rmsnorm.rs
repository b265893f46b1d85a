//! Root Mean Square Layer Normalization.
//!
//! RMSNorm is a simpler alternative to LayerNorm that only
//! normalizes by the root mean square, without centering.
//!
//! # Formula
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! [`RmsNorm::forward_residual`] fuses the residual add of the previous
//! sub-layer into the normalization: the decoder stack never adds a residual
//! on its own.
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use super::{WeightInit, WeightSource};
use crate::error::{Result, TesseraError};
use crate::parallel::Shard;
use candle_core::{DType, Device, Tensor, D};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    /// Hidden dimension.
    hidden_size: usize,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        let hidden_size = weight.dims1()?;
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Create a new RMSNorm layer with ones (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        Self::new(weight, eps)
    }

    /// Load `{prefix}.weight` from a weight source. Norms are replicated.
    pub fn load(
        weights: &dyn WeightSource,
        prefix: &str,
        hidden_size: usize,
        eps: f64,
    ) -> Result<Self> {
        let weight = weights.get(
            &format!("{}.weight", prefix),
            &[hidden_size],
            Shard::Full,
            WeightInit::Ones,
        )?;
        Self::new(weight, eps)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rms = (mean_sq + self.eps)?.sqrt()?;
        let normalized = x.broadcast_div(&rms)?.to_dtype(dtype)?;

        Ok(normalized.broadcast_mul(&self.weight)?)
    }

    /// Add `residual` to `x`, then normalize.
    ///
    /// Returns `(normalized, x + residual)`; the sum is the residual the next
    /// sub-layer folds in.
    pub fn forward_residual(&self, x: &Tensor, residual: &Tensor) -> Result<(Tensor, Tensor)> {
        let merged = (x + residual)?;
        let normalized = self.forward(&merged)?;
        Ok((normalized, merged))
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Get the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Replace the weight.
    pub fn load_weight(&mut self, weight: Tensor) -> Result<()> {
        if weight.dims() != self.weight.dims() {
            return Err(TesseraError::ShapeMismatch(format!(
                "Expected shape {:?}, got {:?}",
                self.weight.dims(),
                weight.dims()
            )));
        }
        self.weight = weight;
        Ok(())
    }
}
