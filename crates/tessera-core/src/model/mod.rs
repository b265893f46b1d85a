//! Qwen2 model definition.
//!
//! Provides the pieces of a Qwen2 causal language model:
//! - Model configuration
//! - Weight sources (random or safetensors)
//! - Tensor-parallel building blocks
//! - Decoder layers, decoder stack and LM head

mod config;
mod embedding;
mod layer;
mod linear;
mod loader;
mod mlp;
mod rmsnorm;
mod rope;
mod transformer;
mod weights;

pub use config::{ModelConfig, Qwen2Config};
pub use embedding::Embedding;
pub use layer::{Qwen2Attention, Qwen2DecoderLayer};
pub use linear::ParallelLinear;
pub use loader::WeightLoader;
pub use mlp::GatedMlp;
pub use rmsnorm::RmsNorm;
pub use rope::{PositionEmbeddingType, PositionalEmbeddingParams, RopeParams, RotaryEmbedding};
pub use transformer::{Qwen2ForCausalLM, Qwen2Model};
pub use weights::{RandomWeights, WeightInit, WeightSource};
