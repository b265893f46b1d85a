//! High-level inference engine.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{
    attention::{AttentionMetadata, ReferenceBackend},
    model::{ModelConfig, Qwen2Config, RandomWeights, WeightLoader, WeightSource},
    parallel::{Communicator, Mapping, SingleProcessGroup},
    registry::{self, BuildContext, CausalLm},
};

/// Configuration for the inference engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding `config.json` and `*.safetensors`.
    pub model_path: PathBuf,
    /// Tensor-parallel placement of this process. When unset, the model
    /// configuration's own mapping is kept.
    pub mapping: Option<Mapping>,
    /// Apply rotary inside the attention backend. When unset, the model
    /// configuration's own setting is kept.
    pub fuse_pos_embd: Option<bool>,
    /// Initialize parameters randomly instead of reading safetensors.
    pub random_weights: bool,
    /// Parameter dtype. Defaults to f32 on CPU and the checkpoint dtype elsewhere.
    pub dtype: Option<DType>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            mapping: None,
            fuse_pos_embd: None,
            random_weights: false,
            dtype: None,
        }
    }
}

/// Builder for creating an Engine.
pub struct EngineBuilder {
    config: EngineConfig,
    model_config: Option<ModelConfig>,
    device: Device,
    comm: Option<Arc<dyn Communicator>>,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            model_config: None,
            device: Device::Cpu,
            comm: None,
        }
    }

    /// Set model directory.
    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_path = path.into();
        self
    }

    /// Set compute device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Set model configuration directly instead of reading `config.json`.
    ///
    /// Its mapping and rotary fusion are kept unless [`EngineBuilder::mapping`]
    /// or [`EngineBuilder::fuse_pos_embd`] override them.
    pub fn model_config(mut self, config: ModelConfig) -> Self {
        self.model_config = Some(config);
        self
    }

    /// Use random parameters (smoke tests, benchmarks).
    pub fn random_weights(mut self, random: bool) -> Self {
        self.config.random_weights = random;
        self
    }

    /// Set tensor-parallel placement.
    pub fn mapping(mut self, mapping: Mapping) -> Self {
        self.config.mapping = Some(mapping);
        self
    }

    /// Supply the tensor-parallel group; required when `tp_size > 1`.
    pub fn communicator(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.comm = Some(comm);
        self
    }

    /// Fuse rotary into the attention backend.
    pub fn fuse_pos_embd(mut self, fuse: bool) -> Self {
        self.config.fuse_pos_embd = Some(fuse);
        self
    }

    /// Override the parameter dtype.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.config.dtype = Some(dtype);
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        let Self {
            config,
            model_config,
            device,
            comm,
        } = self;

        let mut model_config = match model_config {
            Some(model_config) => model_config,
            None => {
                let path = config.model_path.join("config.json");
                let pretrained = Qwen2Config::from_file(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                ModelConfig::new(pretrained)
            }
        };
        if let Some(mapping) = config.mapping {
            model_config = model_config.with_mapping(mapping);
        }
        if let Some(fuse) = config.fuse_pos_embd {
            model_config = model_config.with_fused_pos_embd(fuse);
        }
        let mapping = model_config.mapping;

        let dtype = match config.dtype {
            Some(dtype) => dtype,
            None if device.is_cpu() => DType::F32,
            None => model_config.pretrained.dtype()?,
        };

        let comm = comm.unwrap_or_else(|| Arc::new(SingleProcessGroup));
        if comm.world_size() != mapping.tp_size {
            bail!(
                "mapping has tp_size {} but communicator spans {} ranks",
                mapping.tp_size,
                comm.world_size()
            );
        }

        let weights: Box<dyn WeightSource> = if config.random_weights {
            Box::new(RandomWeights::new(dtype, &device))
        } else {
            let loader = WeightLoader::from_dir(&config.model_path, &device)
                .with_context(|| format!("loading weights from {}", config.model_path.display()))?;
            Box::new(loader.with_dtype(dtype))
        };

        let backend = Arc::new(ReferenceBackend::new());
        let ctx = BuildContext {
            weights: weights.as_ref(),
            attention: backend.clone(),
            comm,
        };
        let model = registry::global().read().build_from_config(&model_config, ctx)?;

        tracing::info!(
            architecture = model.architecture(),
            layers = model_config.pretrained.num_hidden_layers,
            ?dtype,
            tp_rank = mapping.tp_rank,
            tp_size = mapping.tp_size,
            fuse_pos_embd = model_config.fuse_pos_embd,
            "engine ready"
        );

        Ok(Engine {
            config,
            model,
            backend,
            next_seq_id: AtomicU64::new(0),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The end-of-sequence token was produced.
    Eos,
    /// `max_new_tokens` was reached.
    Length,
}

/// Result of generation.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    /// Generated token ids (prompt excluded).
    pub tokens: Vec<u32>,
    /// Number of prompt tokens.
    pub num_prompt_tokens: usize,
    /// Number of tokens generated.
    pub num_generated_tokens: usize,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

/// High-level inference engine.
///
/// Owns a model resolved through the registry and the reference attention
/// backend holding its KV cache.
pub struct Engine {
    config: EngineConfig,
    model: Box<dyn CausalLm>,
    backend: Arc<ReferenceBackend>,
    next_seq_id: AtomicU64,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Get engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get model reference.
    pub fn model(&self) -> &dyn CausalLm {
        self.model.as_ref()
    }

    /// Attention backend (and its cache).
    pub fn backend(&self) -> &ReferenceBackend {
        &self.backend
    }

    /// Logits for every position of `tokens` without touching the cache:
    /// [1, tokens.len(), vocab_size].
    pub fn forward_tokens(&self, tokens: &[u32]) -> Result<Tensor> {
        if tokens.is_empty() {
            bail!("empty token sequence");
        }
        let input_ids = Tensor::new(tokens, self.model.device())?.unsqueeze(0)?;
        let metadata = AttentionMetadata::context(1);
        Ok(self
            .model
            .forward(&metadata, Some(&input_ids), None, None, true)?)
    }

    /// Greedy generation: prefill the prompt, then decode one token per step
    /// against the KV cache until `eos` or `max_new_tokens`.
    pub fn generate(
        &self,
        prompt: &[u32],
        max_new_tokens: usize,
        eos: Option<u32>,
    ) -> Result<GenerateResult> {
        if prompt.is_empty() {
            bail!("empty prompt");
        }
        let seq_id = self.next_seq_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(seq_id, prompt_len = prompt.len(), max_new_tokens, "generate");

        let result = self.decode_loop(seq_id, prompt, max_new_tokens, eos);
        self.backend.release(seq_id);
        result
    }

    fn decode_loop(
        &self,
        seq_id: u64,
        prompt: &[u32],
        max_new_tokens: usize,
        eos: Option<u32>,
    ) -> Result<GenerateResult> {
        let device = self.model.device();
        let mut tokens = Vec::with_capacity(max_new_tokens);
        let mut finish_reason = FinishReason::Length;

        let mut metadata = AttentionMetadata::new(vec![seq_id], vec![0])?;
        let mut input_ids = Tensor::new(prompt, device)?.unsqueeze(0)?;

        while tokens.len() < max_new_tokens {
            let logits = self
                .model
                .forward(&metadata, Some(&input_ids), None, None, false)?;
            let next = logits.flatten_all()?.argmax(0)?.to_scalar::<u32>()?;
            tokens.push(next);

            if eos == Some(next) {
                finish_reason = FinishReason::Eos;
                break;
            }

            metadata = metadata.advanced(input_ids.dim(1)?);
            input_ids = Tensor::new(&[next], device)?.unsqueeze(0)?;
        }

        tracing::debug!(seq_id, generated = tokens.len(), ?finish_reason, "generation finished");
        Ok(GenerateResult {
            num_prompt_tokens: prompt.len(),
            num_generated_tokens: tokens.len(),
            tokens,
            finish_reason,
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("architecture", &self.model.architecture())
            .finish()
    }
}
