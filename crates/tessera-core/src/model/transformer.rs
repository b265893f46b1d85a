//! Qwen2 decoder stack and causal-LM head.

use super::{Embedding, ModelConfig, ParallelLinear, Qwen2DecoderLayer, RmsNorm, WeightSource};
use crate::attention::{AttentionBackend, AttentionMetadata};
use crate::error::{Result, TesseraError};
use crate::parallel::{Communicator, ParallelConfig};
use crate::registry::CausalLm;
use candle_core::{DType, Device, Tensor};
use std::sync::Arc;

/// Embedding, decoder layers and final norm.
#[derive(Debug, Clone)]
pub struct Qwen2Model {
    /// Model configuration.
    config: ModelConfig,
    /// Vocabulary-parallel token embedding.
    embed_tokens: Embedding,
    /// Decoder layers in index order.
    layers: Vec<Qwen2DecoderLayer>,
    /// Final norm.
    norm: RmsNorm,
    /// Device for computation.
    device: Device,
}

impl Qwen2Model {
    /// Build the decoder stack from `model.*` parameters.
    pub fn load(
        config: &ModelConfig,
        weights: &dyn WeightSource,
        backend: Arc<dyn AttentionBackend>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        config.validate()?;
        let pretrained = &config.pretrained;
        tracing::debug!(
            layers = pretrained.num_hidden_layers,
            hidden = pretrained.hidden_size,
            tp_size = config.mapping.tp_size,
            tp_rank = config.mapping.tp_rank,
            "building Qwen2 model"
        );

        let embed_tokens = Embedding::load(
            weights,
            "model.embed_tokens",
            pretrained.vocab_size,
            pretrained.hidden_size,
            ParallelConfig::column(&config.mapping).with_gather_output(true),
            comm.clone(),
        )?;

        let layers = (0..pretrained.num_hidden_layers)
            .map(|idx| Qwen2DecoderLayer::load(config, idx, weights, backend.clone(), comm.clone()))
            .collect::<Result<Vec<_>>>()?;

        let norm = RmsNorm::load(
            weights,
            "model.norm",
            pretrained.hidden_size,
            pretrained.rms_norm_eps,
        )?;

        Ok(Self {
            config: config.clone(),
            embed_tokens,
            layers,
            norm,
            device: weights.device().clone(),
        })
    }

    /// Run the decoder stack.
    ///
    /// Exactly one of `input_ids` [batch, seq_len] and `inputs_embeds`
    /// [batch, seq_len, hidden_size] must be given. Without `position_ids`
    /// positions continue from `metadata`'s cached lengths.
    ///
    /// Returns normalized hidden states [batch, seq_len, hidden_size].
    pub fn forward(
        &self,
        metadata: &AttentionMetadata,
        input_ids: Option<&Tensor>,
        position_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
    ) -> Result<Tensor> {
        let hidden_states = match (input_ids, inputs_embeds) {
            (Some(ids), None) => self.embed_tokens.forward(ids)?,
            (None, Some(embeds)) => embeds.clone(),
            _ => {
                return Err(TesseraError::Validation(
                    "You cannot specify both input_ids and inputs_embeds at the same time, \
                     and must specify either one"
                        .to_string(),
                ))
            }
        };

        let seq_len = hidden_states.dim(1)?;
        let position_ids = match position_ids {
            Some(ids) => ids.clone(),
            None => metadata.position_ids(seq_len, &self.device)?,
        };

        let mut hidden_states = hidden_states;
        let mut residual: Option<Tensor> = None;
        for layer in &self.layers {
            let (hidden, res) =
                layer.forward(&position_ids, &hidden_states, metadata, residual.as_ref())?;
            hidden_states = hidden;
            residual = Some(res);
        }

        match residual {
            Some(residual) => Ok(self.norm.forward_residual(&hidden_states, &residual)?.0),
            None => self.norm.forward(&hidden_states),
        }
    }

    /// Decoder layers in index order.
    pub fn layers(&self) -> &[Qwen2DecoderLayer] {
        &self.layers
    }

    /// Layer at `idx`.
    pub fn layer(&self, idx: usize) -> Option<&Qwen2DecoderLayer> {
        self.layers.get(idx)
    }

    /// Number of decoder layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Token embedding.
    pub fn embed_tokens(&self) -> &Embedding {
        &self.embed_tokens
    }

    /// Final norm.
    pub fn norm(&self) -> &RmsNorm {
        &self.norm
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Qwen2 decoder with a vocabulary projection.
#[derive(Debug, Clone)]
pub struct Qwen2ForCausalLM {
    model: Qwen2Model,
    /// Column-parallel over the vocabulary, gathered.
    lm_head: ParallelLinear,
}

impl Qwen2ForCausalLM {
    /// Registry name of this family.
    pub const ARCHITECTURE: &'static str = "Qwen2ForCausalLM";

    /// Build the model and `lm_head` (or tie it to the embedding).
    pub fn load(
        config: &ModelConfig,
        weights: &dyn WeightSource,
        backend: Arc<dyn AttentionBackend>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let model = Qwen2Model::load(config, weights, backend, comm.clone())?;
        let pretrained = &config.pretrained;
        let parallel = ParallelConfig::column(&config.mapping).with_gather_output(true);

        // Vocab-sharded embedding rows are exactly this rank's lm_head rows
        let lm_head = if pretrained.tie_word_embeddings {
            ParallelLinear::from_weights(
                model.embed_tokens().weight().clone(),
                None,
                pretrained.hidden_size,
                pretrained.vocab_size,
                parallel,
                comm,
            )?
        } else {
            ParallelLinear::load(
                weights,
                "lm_head",
                pretrained.hidden_size,
                pretrained.vocab_size,
                false,
                parallel,
                comm,
            )?
        };

        Ok(Self { model, lm_head })
    }

    /// Logits in f32.
    ///
    /// [batch, seq_len, vocab_size] when `return_context_logits`, otherwise
    /// only the last position [batch, 1, vocab_size].
    pub fn forward(
        &self,
        metadata: &AttentionMetadata,
        input_ids: Option<&Tensor>,
        position_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        return_context_logits: bool,
    ) -> Result<Tensor> {
        let hidden_states = self
            .model
            .forward(metadata, input_ids, position_ids, inputs_embeds)?;

        let hidden_states = if return_context_logits {
            hidden_states
        } else {
            let seq_len = hidden_states.dim(1)?;
            hidden_states.narrow(1, seq_len.saturating_sub(1), 1)?
        };

        Ok(self.lm_head.forward(&hidden_states)?.to_dtype(DType::F32)?)
    }

    /// Decoder stack.
    pub fn model(&self) -> &Qwen2Model {
        &self.model
    }

    /// Vocabulary projection.
    pub fn lm_head(&self) -> &ParallelLinear {
        &self.lm_head
    }
}

impl CausalLm for Qwen2ForCausalLM {
    fn architecture(&self) -> &str {
        Self::ARCHITECTURE
    }

    fn config(&self) -> &ModelConfig {
        self.model.config()
    }

    fn device(&self) -> &Device {
        self.model.device()
    }

    fn forward(
        &self,
        metadata: &AttentionMetadata,
        input_ids: Option<&Tensor>,
        position_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        return_context_logits: bool,
    ) -> Result<Tensor> {
        Qwen2ForCausalLM::forward(
            self,
            metadata,
            input_ids,
            position_ids,
            inputs_embeds,
            return_context_logits,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::ReferenceBackend;
    use crate::model::{Qwen2Config, RandomWeights, WeightInit};
    use crate::parallel::{Shard, SingleProcessGroup};
    use std::collections::HashMap;

    fn small_config() -> ModelConfig {
        ModelConfig::new(Qwen2Config {
            vocab_size: 1000,
            hidden_size: 64,
            intermediate_size: 128,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            max_position_embeddings: 256,
            ..Default::default()
        })
    }

    fn build(config: &ModelConfig, weights: &RandomWeights) -> Qwen2ForCausalLM {
        Qwen2ForCausalLM::load(
            config,
            weights,
            Arc::new(ReferenceBackend::new()),
            Arc::new(SingleProcessGroup),
        )
        .unwrap()
    }

    fn input_ids(ids: &[u32]) -> Tensor {
        Tensor::new(ids, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn layers_are_built_in_order() {
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);
        let lm = build(&small_config(), &weights);
        let model = lm.model();

        assert_eq!(model.num_layers(), 2);
        for (idx, layer) in model.layers().iter().enumerate() {
            assert_eq!(layer.layer_idx(), idx);
        }
        assert_eq!(model.layer(1).unwrap().layer_idx(), 1);
        assert!(model.layer(2).is_none());
        assert_eq!(model.embed_tokens().num_embeddings(), 1000);
    }

    #[test]
    fn both_or_neither_inputs_rejected() {
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);
        let lm = build(&small_config(), &weights);
        let metadata = AttentionMetadata::context(1);
        let ids = input_ids(&[1, 2, 3]);
        let embeds = Tensor::zeros((1, 3, 64), DType::F32, &Device::Cpu).unwrap();

        let both = lm.model().forward(&metadata, Some(&ids), None, Some(&embeds));
        assert!(matches!(both, Err(TesseraError::Validation(_))));

        let neither = lm.model().forward(&metadata, None, None, None);
        assert!(matches!(neither, Err(TesseraError::Validation(_))));
    }

    #[test]
    fn end_to_end_shapes() {
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);
        let lm = build(&small_config(), &weights);
        let metadata = AttentionMetadata::context(1);
        let ids = input_ids(&[1, 5, 9, 13, 17, 21, 25, 29]);

        let hidden = lm.model().forward(&metadata, Some(&ids), None, None).unwrap();
        assert_eq!(hidden.dims(), &[1, 8, 64]);

        let logits = lm.forward(&metadata, Some(&ids), None, None, true).unwrap();
        assert_eq!(logits.dims(), &[1, 8, 1000]);
        assert_eq!(logits.dtype(), DType::F32);

        let last = lm.forward(&metadata, Some(&ids), None, None, false).unwrap();
        assert_eq!(last.dims(), &[1, 1, 1000]);
        assert!(max_abs_diff(&last, &logits.narrow(1, 7, 1).unwrap()) < 1e-5);
    }

    #[test]
    fn inputs_embeds_match_input_ids() {
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);
        let lm = build(&small_config(), &weights);
        let metadata = AttentionMetadata::context(1);
        let ids = input_ids(&[3, 1, 4, 1, 5]);

        let embeds = lm.model().embed_tokens().forward(&ids).unwrap();
        let from_ids = lm.model().forward(&metadata, Some(&ids), None, None).unwrap();
        let from_embeds = lm.model().forward(&metadata, None, None, Some(&embeds)).unwrap();

        assert!(max_abs_diff(&from_ids, &from_embeds) < 1e-6);
    }

    #[test]
    fn explicit_positions_match_derived() {
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);
        let lm = build(&small_config(), &weights);
        let metadata = AttentionMetadata::context(1);
        let ids = input_ids(&[7, 8, 9]);
        let positions = Tensor::new(&[[0u32, 1, 2]], &Device::Cpu).unwrap();

        let derived = lm.forward(&metadata, Some(&ids), None, None, true).unwrap();
        let explicit = lm.forward(&metadata, Some(&ids), Some(&positions), None, true).unwrap();
        assert!(max_abs_diff(&derived, &explicit) < 1e-6);
    }

    #[test]
    fn fused_rotary_matches_unfused() {
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);
        let unfused = build(&small_config(), &weights);
        let fused = build(&small_config().with_fused_pos_embd(true), &weights);
        let metadata = AttentionMetadata::context(1);
        let ids = input_ids(&[10, 20, 30, 40, 50, 60]);

        let a = unfused.forward(&metadata, Some(&ids), None, None, true).unwrap();
        let b = fused.forward(&metadata, Some(&ids), None, None, true).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn cached_decode_matches_full_forward() {
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);
        let lm = build(&small_config(), &weights);
        let tokens = [11u32, 22, 33, 44, 55, 66];

        let full = lm
            .forward(&AttentionMetadata::context(1), Some(&input_ids(&tokens)), None, None, true)
            .unwrap();

        let prefill = AttentionMetadata::new(vec![0], vec![0]).unwrap();
        let head = lm
            .forward(&prefill, Some(&input_ids(&tokens[..5])), None, None, false)
            .unwrap();
        assert!(max_abs_diff(&head, &full.narrow(1, 4, 1).unwrap()) < 1e-4);

        let step = lm
            .forward(&prefill.advanced(5), Some(&input_ids(&tokens[5..])), None, None, false)
            .unwrap();
        assert!(max_abs_diff(&step, &full.narrow(1, 5, 1).unwrap()) < 1e-4);
    }

    #[test]
    fn tied_embeddings_share_weight() {
        let mut config = small_config();
        config.pretrained.tie_word_embeddings = true;
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);
        let lm = build(&config, &weights);

        let embed = lm.model().embed_tokens().weight();
        assert!(max_abs_diff(lm.lm_head().weight(), embed) == 0.0);

        let untied = RandomWeights::new(DType::F32, &Device::Cpu);
        build(&small_config(), &untied);
        assert_eq!(untied.len(), weights.len() + 1);
    }

    #[test]
    fn causal_lm_trait_object() {
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);
        let lm: Box<dyn CausalLm> = Box::new(build(&small_config(), &weights));

        assert_eq!(lm.architecture(), "Qwen2ForCausalLM");
        assert_eq!(lm.config().pretrained.vocab_size, 1000);

        let logits = lm
            .forward(&AttentionMetadata::context(1), Some(&input_ids(&[1, 2])), None, None, false)
            .unwrap();
        assert_eq!(logits.dims(), &[1, 1, 1000]);
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = small_config();
        config.pretrained.num_attention_heads = 3;
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);

        let result = Qwen2ForCausalLM::load(
            &config,
            &weights,
            Arc::new(ReferenceBackend::new()),
            Arc::new(SingleProcessGroup),
        );
        assert!(result.is_err());
    }

    #[test]
    fn final_norm_folds_last_residual() {
        let weights = RandomWeights::new(DType::F32, &Device::Cpu);
        let lm = build(&small_config(), &weights);
        let model = lm.model();
        let metadata = AttentionMetadata::context(1);
        let ids = input_ids(&[2, 7, 1, 8, 2, 8]);
        let positions = metadata.position_ids(6, &Device::Cpu).unwrap();

        let mut hidden = model.embed_tokens().forward(&ids).unwrap();
        let mut residual: Option<Tensor> = None;
        for layer in model.layers() {
            let (h, r) = layer
                .forward(&positions, &hidden, &metadata, residual.as_ref())
                .unwrap();
            hidden = h;
            residual = Some(r);
        }
        let residual = residual.unwrap();
        let expected = model.norm().forward_residual(&hidden, &residual).unwrap().0;

        let actual = model.forward(&metadata, Some(&ids), None, None).unwrap();
        assert!(max_abs_diff(&actual, &expected) < 1e-6);

        // Normalizing the last sub-layer output alone is a different result
        let without_residual = model.norm().forward(&hidden).unwrap();
        assert!(max_abs_diff(&actual, &without_residual) > 1e-3);
    }

    /// Explicit parameters by name; everything else is ones (norms) or zeros.
    struct FixedWeights {
        tensors: HashMap<String, Tensor>,
        device: Device,
    }

    impl WeightSource for FixedWeights {
        fn get(
            &self,
            name: &str,
            full_shape: &[usize],
            shard: Shard,
            init: WeightInit,
        ) -> Result<Tensor> {
            let full = match self.tensors.get(name) {
                Some(t) => t.clone(),
                None => match init {
                    WeightInit::Ones => Tensor::ones(full_shape, DType::F32, &self.device)?,
                    _ => Tensor::zeros(full_shape, DType::F32, &self.device)?,
                },
            };
            shard.narrow(&full)
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn dtype(&self) -> DType {
            DType::F32
        }
    }

    fn identity(n: usize) -> Tensor {
        let values: Vec<f32> = (0..n * n)
            .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_vec(values, (n, n), &Device::Cpu).unwrap()
    }

    // hidden 4, two query heads sharing one kv head of dim 2, tied head.
    // q/k are zero so attention averages v, and v is its bias [1, 0];
    // o_proj is the identity, so each layer adds a = [1, 0, 1, 0].
    // Token 1 embeds as x = [2, -2, 2, -2]; after two layers the stream is
    // x + 2a = [4, -2, 4, -2] with rms sqrt(10).
    fn reference_model() -> Qwen2ForCausalLM {
        let config = ModelConfig::new(Qwen2Config {
            vocab_size: 4,
            hidden_size: 4,
            intermediate_size: 4,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            num_key_value_heads: Some(1),
            max_position_embeddings: 16,
            tie_word_embeddings: true,
            ..Default::default()
        });

        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        let embed: [[f32; 4]; 4] = [
            [1.0, 0.0, 0.0, 0.0],
            [2.0, -2.0, 2.0, -2.0],
            [0.0, 1.0, 0.0, 1.0],
            [3.0, 3.0, 3.0, 3.0],
        ];
        tensors.insert(
            "model.embed_tokens.weight".to_string(),
            Tensor::new(&embed, &device).unwrap(),
        );
        for idx in 0..2 {
            let prefix = format!("model.layers.{}.self_attn", idx);
            tensors.insert(
                format!("{}.v_proj.bias", prefix),
                Tensor::new(&[1.0f32, 0.0], &device).unwrap(),
            );
            tensors.insert(
                format!("{}.o_proj.weight", prefix),
                identity(4),
            );
        }

        let weights = FixedWeights { tensors, device };
        Qwen2ForCausalLM::load(
            &config,
            &weights,
            Arc::new(ReferenceBackend::new()),
            Arc::new(SingleProcessGroup),
        )
        .unwrap()
    }

    #[test]
    fn reference_logits() {
        let lm = reference_model();
        let metadata = AttentionMetadata::context(1);

        let logits = lm
            .forward(&metadata, Some(&input_ids(&[1])), None, None, false)
            .unwrap();
        let logits: Vec<f32> = logits.flatten_all().unwrap().to_vec1().unwrap();

        // norm = [4, -2, 4, -2] / sqrt(10), dotted with each embedding row
        let expected = [1.264_911_f32, 7.589_466, -1.264_911, 3.794_733];
        for (actual, expected) in logits.iter().zip(expected) {
            assert!((actual - expected).abs() < 1e-4, "{} vs {}", actual, expected);
        }
    }

    #[test]
    fn reference_logits_are_position_independent() {
        let lm = reference_model();
        let metadata = AttentionMetadata::context(1);

        // Constant v makes every position's attention output a
        let logits = lm
            .forward(&metadata, Some(&input_ids(&[3, 1])), None, None, true)
            .unwrap();
        let last: Vec<f32> = logits.narrow(1, 1, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!((last[1] - 7.589_466).abs() < 1e-4);

        // Token 3: [3, 3, 3, 3] + 2a = [5, 3, 5, 3], rms sqrt(17)
        let first: Vec<f32> = logits.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let rms = 17.0f32.sqrt();
        let expected = [5.0 / rms, 8.0 / rms, 6.0 / rms, 48.0 / rms];
        for (actual, expected) in first.iter().zip(expected) {
            assert!((actual - expected).abs() < 1e-4, "{} vs {}", actual, expected);
        }
    }
}
