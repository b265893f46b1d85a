//! Gated MLP (SwiGLU).
//!
//! SwiGLU is a gated activation function used in modern transformers
//! like Llama and Qwen. It combines SiLU (Swish) with a gating mechanism.
//!
//! # Formula
//!
//! `GatedMLP(x) = (silu(x @ gate_proj^T) * (x @ up_proj^T)) @ down_proj^T`
//!
//! Gate and up projections are column-parallel; the down projection is
//! row-parallel and reduces across ranks.
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::{ParallelLinear, WeightSource};
use crate::error::Result;
use crate::parallel::{Communicator, Mapping, ParallelConfig};
use candle_core::Tensor;
use candle_nn::ops::silu;
use std::sync::Arc;

/// Gated feed-forward block.
#[derive(Debug, Clone)]
pub struct GatedMlp {
    /// Gate projection: hidden -> intermediate
    gate_proj: ParallelLinear,
    /// Up projection: hidden -> intermediate
    up_proj: ParallelLinear,
    /// Down projection: intermediate -> hidden
    down_proj: ParallelLinear,
    /// Hidden dimension.
    hidden_size: usize,
    /// Intermediate dimension.
    intermediate_size: usize,
}

impl GatedMlp {
    /// Load `{prefix}.{gate,up,down}_proj` from a weight source.
    pub fn load(
        weights: &dyn WeightSource,
        prefix: &str,
        hidden_size: usize,
        intermediate_size: usize,
        bias: bool,
        mapping: &Mapping,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let column = ParallelConfig::column(mapping);
        let row = ParallelConfig::row(mapping);

        let gate_proj = ParallelLinear::load(
            weights,
            &format!("{}.gate_proj", prefix),
            hidden_size,
            intermediate_size,
            bias,
            column,
            comm.clone(),
        )?;
        let up_proj = ParallelLinear::load(
            weights,
            &format!("{}.up_proj", prefix),
            hidden_size,
            intermediate_size,
            bias,
            column,
            comm.clone(),
        )?;
        let down_proj = ParallelLinear::load(
            weights,
            &format!("{}.down_proj", prefix),
            intermediate_size,
            hidden_size,
            bias,
            row,
            comm,
        )?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            hidden_size,
            intermediate_size,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Intermediate activations stay rank-local
        let gate = self.gate_proj.forward_local(x)?;
        let up = self.up_proj.forward_local(x)?;
        let activated = (silu(&gate)? * up)?;

        self.down_proj.forward(&activated)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }

    /// Gate projection.
    pub fn gate_proj(&self) -> &ParallelLinear {
        &self.gate_proj
    }

    /// Up projection.
    pub fn up_proj(&self) -> &ParallelLinear {
        &self.up_proj
    }

    /// Down projection.
    pub fn down_proj(&self) -> &ParallelLinear {
        &self.down_proj
    }
}
