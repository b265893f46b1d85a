//! Qwen2 decoder layer.
//!
//! A single decoder layer combining:
//! - Pre-attention RMSNorm (fused with the incoming residual)
//! - Grouped Query Attention through an [`AttentionBackend`]
//! - Post-attention RMSNorm (fused with the attention residual)
//! - Gated MLP

use super::{
    GatedMlp, ModelConfig, ParallelLinear, PositionalEmbeddingParams, RmsNorm, RopeParams,
    RotaryEmbedding, WeightSource,
};
use crate::attention::{AttentionBackend, AttentionConfig, AttentionMetadata};
use crate::error::Result;
use crate::parallel::{Communicator, ParallelConfig};
use candle_core::Tensor;
use std::sync::Arc;

/// Self-attention block of one decoder layer.
///
/// q/k/v are column-parallel with bias, o is row-parallel without bias.
/// Head counts stored here are the ones local to this rank.
#[derive(Clone)]
pub struct Qwen2Attention {
    q_proj: ParallelLinear,
    k_proj: ParallelLinear,
    v_proj: ParallelLinear,
    o_proj: ParallelLinear,
    /// Applied locally unless rotary is fused into the backend.
    rotary: Option<RotaryEmbedding>,
    attention_config: AttentionConfig,
    backend: Arc<dyn AttentionBackend>,
    layer_idx: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Qwen2Attention {
    /// Build the attention block of layer `layer_idx`.
    pub fn load(
        config: &ModelConfig,
        layer_idx: usize,
        weights: &dyn WeightSource,
        backend: Arc<dyn AttentionBackend>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let pretrained = &config.pretrained;
        let mapping = &config.mapping;
        let prefix = format!("model.layers.{}.self_attn", layer_idx);

        let hidden_size = pretrained.hidden_size;
        let head_dim = pretrained.head_dim();
        let q_size = pretrained.num_attention_heads * head_dim;
        let kv_size = pretrained.num_kv_heads() * head_dim;

        let column = ParallelConfig::column(mapping);
        let row = ParallelConfig::row(mapping);
        let proj = |name: &str, in_features: usize, out_features: usize, bias: bool, parallel: ParallelConfig| {
            ParallelLinear::load(
                weights,
                &format!("{}.{}", prefix, name),
                in_features,
                out_features,
                bias,
                parallel,
                comm.clone(),
            )
        };

        let q_proj = proj("q_proj", hidden_size, q_size, true, column)?;
        let k_proj = proj("k_proj", hidden_size, kv_size, true, column)?;
        let v_proj = proj("v_proj", hidden_size, kv_size, true, column)?;
        let o_proj = proj("o_proj", q_size, hidden_size, false, row)?;

        let num_heads = pretrained.num_attention_heads / mapping.tp_size;
        let num_kv_heads = pretrained.num_kv_heads() / mapping.tp_size;
        let mut attention_config = AttentionConfig::new(num_heads, num_kv_heads, head_dim);

        let rotary = if config.fuse_pos_embd {
            let params = PositionalEmbeddingParams::rope_gpt_neox(RopeParams::from_config(pretrained));
            attention_config = attention_config.with_pos_embd(params);
            None
        } else {
            Some(RotaryEmbedding::for_config(pretrained, weights.device())?)
        };

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary,
            attention_config,
            backend,
            layer_idx,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    /// Attention over `hidden_states` [batch, seq_len, hidden_size].
    pub fn forward(
        &self,
        position_ids: &Tensor,
        hidden_states: &Tensor,
        metadata: &AttentionMetadata,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden_states.dims3()?;

        // [batch, seq, heads * head_dim] -> [batch, heads, seq, head_dim]
        let split = |x: Tensor, heads: usize| -> Result<Tensor> {
            Ok(x.reshape((batch, seq_len, heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let query = split(self.q_proj.forward(hidden_states)?, self.num_heads)?;
        let key = split(self.k_proj.forward(hidden_states)?, self.num_kv_heads)?;
        let value = split(self.v_proj.forward(hidden_states)?, self.num_kv_heads)?;

        let (query, key) = match &self.rotary {
            Some(rope) => rope.apply(&query, &key, position_ids)?,
            None => (query, key),
        };

        let attn_output = self.backend.forward(
            self.layer_idx,
            &query,
            &key,
            &value,
            position_ids,
            metadata,
            &self.attention_config,
        )?;

        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&attn_output)
    }

    /// Backend-facing attention shape.
    pub fn attention_config(&self) -> &AttentionConfig {
        &self.attention_config
    }

    /// True when rotary is applied by the backend.
    pub fn is_pos_embd_fused(&self) -> bool {
        self.rotary.is_none()
    }

    /// Query projection.
    pub fn q_proj(&self) -> &ParallelLinear {
        &self.q_proj
    }

    /// Output projection.
    pub fn o_proj(&self) -> &ParallelLinear {
        &self.o_proj
    }
}

impl std::fmt::Debug for Qwen2Attention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qwen2Attention")
            .field("layer_idx", &self.layer_idx)
            .field("attention_config", &self.attention_config)
            .field("fused_rotary", &self.rotary.is_none())
            .finish()
    }
}

/// A single Qwen2 decoder layer.
#[derive(Debug, Clone)]
pub struct Qwen2DecoderLayer {
    /// Pre-attention layer norm.
    input_layernorm: RmsNorm,
    /// Self-attention.
    self_attn: Qwen2Attention,
    /// Post-attention layer norm.
    post_attention_layernorm: RmsNorm,
    /// MLP.
    mlp: GatedMlp,
    /// Position in the stack.
    layer_idx: usize,
}

impl Qwen2DecoderLayer {
    /// Build layer `layer_idx` from `model.layers.{layer_idx}.*`.
    pub fn load(
        config: &ModelConfig,
        layer_idx: usize,
        weights: &dyn WeightSource,
        backend: Arc<dyn AttentionBackend>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let pretrained = &config.pretrained;
        let prefix = format!("model.layers.{}", layer_idx);
        tracing::debug!(layer_idx, "building decoder layer");

        let input_layernorm = RmsNorm::load(
            weights,
            &format!("{}.input_layernorm", prefix),
            pretrained.hidden_size,
            pretrained.rms_norm_eps,
        )?;
        let self_attn = Qwen2Attention::load(config, layer_idx, weights, backend, comm.clone())?;
        let post_attention_layernorm = RmsNorm::load(
            weights,
            &format!("{}.post_attention_layernorm", prefix),
            pretrained.hidden_size,
            pretrained.rms_norm_eps,
        )?;
        let mlp = GatedMlp::load(
            weights,
            &format!("{}.mlp", prefix),
            pretrained.hidden_size,
            pretrained.intermediate_size,
            pretrained.mlp_bias,
            &config.mapping,
            comm,
        )?;

        Ok(Self {
            input_layernorm,
            self_attn,
            post_attention_layernorm,
            mlp,
            layer_idx,
        })
    }

    /// Forward pass.
    ///
    /// The residual add of each sub-layer is deferred into the next norm.
    /// Pass `None` as `residual` for the first layer; the returned residual
    /// must be handed to the next layer (or the final norm).
    ///
    /// # Arguments
    ///
    /// * `position_ids` - [batch, seq_len]
    /// * `hidden_states` - [batch, seq_len, hidden_size]
    /// * `residual` - Pending residual from the previous layer
    pub fn forward(
        &self,
        position_ids: &Tensor,
        hidden_states: &Tensor,
        metadata: &AttentionMetadata,
        residual: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        tracing::trace!(layer_idx = self.layer_idx, "decoder layer");

        let (hidden_states, residual) = match residual {
            None => (self.input_layernorm.forward(hidden_states)?, hidden_states.clone()),
            Some(residual) => self.input_layernorm.forward_residual(hidden_states, residual)?,
        };

        let hidden_states = self.self_attn.forward(position_ids, &hidden_states, metadata)?;

        let (hidden_states, residual) = self
            .post_attention_layernorm
            .forward_residual(&hidden_states, &residual)?;
        let hidden_states = self.mlp.forward(&hidden_states)?;

        Ok((hidden_states, residual))
    }

    /// Position in the stack.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Self-attention block.
    pub fn self_attn(&self) -> &Qwen2Attention {
        &self.self_attn
    }

    /// MLP block.
    pub fn mlp(&self) -> &GatedMlp {
        &self.mlp
    }

    /// Pre-attention norm.
    pub fn input_layernorm(&self) -> &RmsNorm {
        &self.input_layernorm
    }

    /// Post-attention norm.
    pub fn post_attention_layernorm(&self) -> &RmsNorm {
        &self.post_attention_layernorm
    }
}
