//! # Tessera
//!
//! Host runtime for tessera causal language models.
//!
//! Tessera resolves a model family by name through the registry, builds it
//! from a checkpoint directory and runs greedy generation against the
//! reference attention backend:
//! - **Registry lookup**: `config.json` `architectures` picks the model
//! - **Safetensors loading** with tensor-parallel sharding
//! - **KV-cached decode** with per-sequence cache release
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tessera::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .model_path("/models/qwen2-0.5b")
//!         .build()?;
//!
//!     let result = engine.generate(&[151643, 872, 11], 32, Some(151643))?;
//!     println!("{:?}", result.tokens);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use tessera_core::*;

mod engine;

pub use engine::{Engine, EngineBuilder, EngineConfig, FinishReason, GenerateResult};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{Engine, EngineBuilder, EngineConfig, FinishReason, GenerateResult};
    pub use crate::{
        attention::{AttentionBackend, AttentionMetadata, ReferenceBackend},
        error::{Result, TesseraError},
        model::{ModelConfig, Qwen2Config, Qwen2ForCausalLM},
        parallel::Mapping,
        registry::CausalLm,
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
