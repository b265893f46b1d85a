//! Model registry.
//!
//! Maps architecture names (the `architectures` entries of a checkpoint's
//! `config.json`) to constructors, so a host can build a model without
//! naming its type.

use crate::attention::{AttentionBackend, AttentionMetadata};
use crate::error::{Result, TesseraError};
use crate::model::{ModelConfig, Qwen2ForCausalLM, WeightSource};
use crate::parallel::Communicator;
use candle_core::{Device, Tensor};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Host-facing interface of a causal language model.
pub trait CausalLm: Send + Sync {
    /// Registry name of the architecture.
    fn architecture(&self) -> &str;

    /// Configuration the model was built from.
    fn config(&self) -> &ModelConfig;

    /// Device the parameters live on.
    fn device(&self) -> &Device;

    /// Logits in f32, `[batch, seq_len, vocab]` or `[batch, 1, vocab]`.
    fn forward(
        &self,
        metadata: &AttentionMetadata,
        input_ids: Option<&Tensor>,
        position_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        return_context_logits: bool,
    ) -> Result<Tensor>;
}

/// Everything a constructor needs besides the configuration.
#[derive(Clone)]
pub struct BuildContext<'a> {
    /// Parameter source.
    pub weights: &'a dyn WeightSource,
    /// Attention backend shared by all layers.
    pub attention: Arc<dyn AttentionBackend>,
    /// Tensor-parallel group.
    pub comm: Arc<dyn Communicator>,
}

/// Builds a model of one architecture.
pub type ModelConstructor = fn(&ModelConfig, BuildContext<'_>) -> Result<Box<dyn CausalLm>>;

fn build_qwen2(config: &ModelConfig, ctx: BuildContext<'_>) -> Result<Box<dyn CausalLm>> {
    Ok(Box::new(Qwen2ForCausalLM::load(
        config,
        ctx.weights,
        ctx.attention,
        ctx.comm,
    )?))
}

/// Architecture name to constructor map.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    constructors: HashMap<String, ModelConstructor>,
}

impl ModelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in architecture.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .constructors
            .insert(Qwen2ForCausalLM::ARCHITECTURE.to_string(), build_qwen2);
        registry
    }

    /// Register a constructor. Names are unique.
    pub fn register(&mut self, name: &str, constructor: ModelConstructor) -> Result<()> {
        if self.constructors.contains_key(name) {
            return Err(TesseraError::Registry(format!(
                "architecture {} is already registered",
                name
            )));
        }
        self.constructors.insert(name.to_string(), constructor);
        Ok(())
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn architectures(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a model of architecture `name`.
    pub fn build(
        &self,
        name: &str,
        config: &ModelConfig,
        ctx: BuildContext<'_>,
    ) -> Result<Box<dyn CausalLm>> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            TesseraError::Registry(format!(
                "unknown architecture {} (registered: {:?})",
                name,
                self.architectures()
            ))
        })?;
        tracing::debug!(architecture = name, "building model");
        constructor(config, ctx)
    }

    /// Build the architecture named first in the config's `architectures`.
    pub fn build_from_config(
        &self,
        config: &ModelConfig,
        ctx: BuildContext<'_>,
    ) -> Result<Box<dyn CausalLm>> {
        let name = config
            .pretrained
            .architecture()
            .ok_or_else(|| TesseraError::Registry("config lists no architectures".to_string()))?;
        self.build(name, config, ctx)
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("architectures", &self.architectures())
            .finish()
    }
}

static GLOBAL: LazyLock<RwLock<ModelRegistry>> =
    LazyLock::new(|| RwLock::new(ModelRegistry::with_builtin()));

/// Process-wide registry, pre-populated with the built-in architectures.
pub fn global() -> &'static RwLock<ModelRegistry> {
    &GLOBAL
}
