//! # Tessera Core
//!
//! Qwen2 causal language model assembled from tensor-parallel building
//! blocks on top of candle.
//!
//! This crate provides:
//! - **Qwen2 decoder stack** with fused residual RMSNorm and GQA
//! - **Tensor-parallel layers** (column/row linear, vocab-parallel embedding)
//! - **Pluggable attention backends** that own the KV cache
//! - **Weight sources** for safetensors checkpoints and random init
//! - **Model registry** resolving `config.json` architecture names

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod attention;
pub mod error;
pub mod model;
pub mod parallel;
pub mod registry;

pub use error::{Result, TesseraError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::attention::{AttentionBackend, AttentionMetadata, ReferenceBackend};
    pub use crate::error::{Result, TesseraError};
    pub use crate::model::{
        ModelConfig, Qwen2Config, Qwen2ForCausalLM, RandomWeights, WeightLoader, WeightSource,
    };
    pub use crate::parallel::{Communicator, Mapping, SingleProcessGroup};
    pub use crate::registry::{BuildContext, CausalLm, ModelRegistry};
}
