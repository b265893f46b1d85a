//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. This allows the model to understand relative
//! positions between tokens.
//!
//! Qwen2 uses the GPT-NeoX layout: the head dimension is split into two
//! halves that are rotated against each other.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use super::Qwen2Config;
use crate::error::{Result, TesseraError};
use candle_core::{Device, Tensor};

/// Rotary layout understood by attention backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEmbeddingType {
    /// Rotate-half layout.
    RopeGptNeox,
}

/// Rotary parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeParams {
    /// Rotated dimension (the head dimension).
    pub dim: usize,
    /// Base frequency.
    pub theta: f64,
    /// Number of positions to cache.
    pub max_positions: usize,
}

impl RopeParams {
    /// Derive rotary parameters from a pretrained config.
    pub fn from_config(config: &Qwen2Config) -> Self {
        Self {
            dim: config.head_dim(),
            theta: config.rope_theta,
            max_positions: config.max_position_embeddings,
        }
    }
}

/// Positional embedding description handed to a backend that fuses rotary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionalEmbeddingParams {
    /// Layout.
    pub kind: PositionEmbeddingType,
    /// Rotary parameters.
    pub rope: RopeParams,
}

impl PositionalEmbeddingParams {
    /// GPT-NeoX rotary with the given parameters.
    pub fn rope_gpt_neox(rope: RopeParams) -> Self {
        Self {
            kind: PositionEmbeddingType::RopeGptNeox,
            rope,
        }
    }
}

/// Rotary Position Embedding implementation.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Cosine cache for positions.
    cos_cache: Tensor,
    /// Sine cache for positions.
    sin_cache: Tensor,
    /// Head dimension.
    head_dim: usize,
    /// Maximum sequence length cached.
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Create a new rotary embedding.
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head
    /// * `max_seq_len` - Maximum sequence length to cache
    /// * `theta` - Base frequency (`rope_theta`, 1e6 for released Qwen2 checkpoints)
    /// * `device` - Device for tensors
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        // Compute inverse frequencies: 1 / (theta^(2i/d)) for i in [0, d/2)
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_slice(&inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_slice(&positions, (max_seq_len, 1), device)?;

        // freqs = positions * inv_freq -> [max_seq_len, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos_cache: freqs.cos()?,
            sin_cache: freqs.sin()?,
            head_dim,
            max_seq_len,
        })
    }

    /// Rotary embedding for a Qwen2 config.
    pub fn for_config(config: &Qwen2Config, device: &Device) -> Result<Self> {
        Self::from_params(&RopeParams::from_config(config), device)
    }

    /// Rotary embedding from explicit parameters.
    pub fn from_params(params: &RopeParams, device: &Device) -> Result<Self> {
        Self::new(params.dim, params.max_positions, params.theta, device)
    }

    /// Apply rotary embeddings to query and key tensors.
    ///
    /// # Arguments
    ///
    /// * `query` - Query tensor [batch, num_heads, seq_len, head_dim]
    /// * `key` - Key tensor [batch, num_kv_heads, seq_len, head_dim]
    /// * `position_ids` - Absolute position of every token [batch, seq_len]
    pub fn apply(
        &self,
        query: &Tensor,
        key: &Tensor,
        position_ids: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len) = position_ids.dims2()?;
        let half_dim = self.head_dim / 2;

        let flat = position_ids.flatten_all()?;
        let max_position = flat.max(0)?.to_scalar::<u32>()? as usize;
        if max_position >= self.max_seq_len {
            return Err(TesseraError::ShapeMismatch(format!(
                "position {} exceeds rotary cache of {}",
                max_position, self.max_seq_len
            )));
        }

        // Gather cos/sin per token: [batch, 1, seq_len, half_dim]
        let cos = self
            .cos_cache
            .index_select(&flat, 0)?
            .reshape((batch, 1, seq_len, half_dim))?
            .to_dtype(query.dtype())?;
        let sin = self
            .sin_cache
            .index_select(&flat, 0)?
            .reshape((batch, 1, seq_len, half_dim))?
            .to_dtype(query.dtype())?;

        let query_rot = self.rotate_half(query, &cos, &sin)?;
        let key_rot = self.rotate_half(key, &cos, &sin)?;

        Ok((query_rot, key_rot))
    }

    /// Rotate tensor using cos/sin embeddings.
    fn rotate_half(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let half_dim = self.head_dim / 2;

        let x1 = x.narrow(3, 0, half_dim)?;
        let x2 = x.narrow(3, half_dim, half_dim)?;

        // [x1, x2] -> [x1*cos - x2*sin, x2*cos + x1*sin]
        let out1 = (x1.broadcast_mul(cos)? - x2.broadcast_mul(sin)?)?;
        let out2 = (x2.broadcast_mul(cos)? + x1.broadcast_mul(sin)?)?;

        Ok(Tensor::cat(&[out1, out2], 3)?)
    }

    /// Get the maximum sequence length this embedding supports.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}
