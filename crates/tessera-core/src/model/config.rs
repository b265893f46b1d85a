//! Model configuration.

use crate::error::{Result, TesseraError};
use crate::parallel::Mapping;
use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Pretrained configuration of a Qwen2 checkpoint (`config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qwen2Config {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of KV heads (for GQA). Defaults to `num_attention_heads`.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// RMS norm epsilon.
    pub rms_norm_eps: f64,
    /// Rope theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Parameter precision name, e.g. `"bfloat16"`.
    #[serde(default = "default_torch_dtype")]
    pub torch_dtype: String,
    /// Bias on the gated MLP projections.
    #[serde(default)]
    pub mlp_bias: bool,
    /// Share the embedding matrix with the LM head.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Padding token id.
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    /// Registered architecture names, first one wins.
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Model architecture type.
    #[serde(default = "default_model_type")]
    pub model_type: String,
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_torch_dtype() -> String {
    "bfloat16".to_string()
}

fn default_model_type() -> String {
    "qwen2".to_string()
}

impl Qwen2Config {
    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Number of key/value heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Get GQA ratio.
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads()
    }

    /// Candle dtype for `torch_dtype`.
    pub fn dtype(&self) -> Result<DType> {
        match self.torch_dtype.as_str() {
            "float32" | "fp32" => Ok(DType::F32),
            "float16" | "fp16" | "half" => Ok(DType::F16),
            "bfloat16" | "bf16" => Ok(DType::BF16),
            other => Err(TesseraError::Config(format!(
                "unsupported torch_dtype: {}",
                other
            ))),
        }
    }

    /// First declared architecture name.
    pub fn architecture(&self) -> Option<&str> {
        self.architectures.first().map(String::as_str)
    }

    /// Check the architecture dimensions are consistent.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_kv_heads()),
            ("max_position_embeddings", self.max_position_embeddings),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(TesseraError::Config(format!("{} must be non-zero", name)));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(TesseraError::Config(format!(
                "hidden_size {} not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(TesseraError::Config(format!(
                "head_dim {} must be even for rotary embedding",
                self.head_dim()
            )));
        }
        if self.num_attention_heads % self.num_kv_heads() != 0 {
            return Err(TesseraError::Config(format!(
                "num_attention_heads {} not divisible by num_key_value_heads {}",
                self.num_attention_heads,
                self.num_kv_heads()
            )));
        }
        self.dtype()?;
        Ok(())
    }
}

impl Default for Qwen2Config {
    fn default() -> Self {
        // Qwen2-7B
        Self {
            vocab_size: 152064,
            hidden_size: 3584,
            intermediate_size: 18944,
            num_hidden_layers: 28,
            num_attention_heads: 28,
            num_key_value_heads: Some(4),
            max_position_embeddings: 32768,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            torch_dtype: default_torch_dtype(),
            mlp_bias: false,
            tie_word_embeddings: false,
            pad_token_id: None,
            architectures: vec!["Qwen2ForCausalLM".to_string()],
            model_type: default_model_type(),
        }
    }
}

/// Runtime model configuration: pretrained architecture plus placement.
///
/// Immutable once a model is built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture description.
    pub pretrained: Qwen2Config,
    /// Parallel topology.
    #[serde(default)]
    pub mapping: Mapping,
    /// Hand rotary parameters to the attention backend instead of rotating
    /// query/key in the attention module.
    #[serde(default)]
    pub fuse_pos_embd: bool,
}

impl ModelConfig {
    /// Single-device configuration.
    pub fn new(pretrained: Qwen2Config) -> Self {
        Self {
            pretrained,
            mapping: Mapping::single(),
            fuse_pos_embd: false,
        }
    }

    /// Set the parallel topology.
    pub fn with_mapping(mut self, mapping: Mapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Enable or disable rotary fusion into the attention backend.
    pub fn with_fused_pos_embd(mut self, fuse: bool) -> Self {
        self.fuse_pos_embd = fuse;
        self
    }

    /// Validate architecture and tensor-parallel divisibility.
    pub fn validate(&self) -> Result<()> {
        self.pretrained.validate()?;
        self.mapping.validate()?;

        let tp = self.mapping.tp_size;
        let config = &self.pretrained;
        let divisible = [
            ("num_attention_heads", config.num_attention_heads),
            ("num_key_value_heads", config.num_kv_heads()),
            ("intermediate_size", config.intermediate_size),
            ("vocab_size", config.vocab_size),
        ];
        for (name, value) in divisible {
            if value % tp != 0 {
                return Err(TesseraError::Config(format!(
                    "{} ({}) must be divisible by tp_size ({})",
                    name, value, tp
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QWEN2_0_5B: &str = r#"{
        "architectures": ["Qwen2ForCausalLM"],
        "attention_dropout": 0.0,
        "bos_token_id": 151643,
        "eos_token_id": 151643,
        "hidden_act": "silu",
        "hidden_size": 896,
        "initializer_range": 0.02,
        "intermediate_size": 4864,
        "max_position_embeddings": 32768,
        "max_window_layers": 24,
        "model_type": "qwen2",
        "num_attention_heads": 14,
        "num_hidden_layers": 24,
        "num_key_value_heads": 2,
        "rms_norm_eps": 1e-06,
        "rope_theta": 1000000.0,
        "sliding_window": 32768,
        "tie_word_embeddings": true,
        "torch_dtype": "bfloat16",
        "use_cache": true,
        "use_sliding_window": false,
        "vocab_size": 151936
    }"#;

    #[test]
    fn parse_hf_config() {
        let config = Qwen2Config::from_json(QWEN2_0_5B).unwrap();
        assert_eq!(config.hidden_size, 896);
        assert_eq!(config.num_kv_heads(), 2);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.gqa_ratio(), 7);
        assert!(config.tie_word_embeddings);
        assert!(!config.mlp_bias);
        assert_eq!(config.dtype().unwrap(), DType::BF16);
        assert_eq!(config.architecture(), Some("Qwen2ForCausalLM"));
    }

    #[test]
    fn kv_heads_default_to_attention_heads() {
        let json = r#"{
            "vocab_size": 1000, "hidden_size": 64, "intermediate_size": 128,
            "num_hidden_layers": 2, "num_attention_heads": 4,
            "max_position_embeddings": 128, "rms_norm_eps": 1e-6
        }"#;
        let config = Qwen2Config::from_json(json).unwrap();
        assert_eq!(config.num_kv_heads(), 4);
        assert_eq!(config.rope_theta, 10000.0);
        assert_eq!(config.model_type, "qwen2");
    }

    #[test]
    fn default_is_qwen2_7b() {
        let config = Qwen2Config::default();
        assert_eq!(config.hidden_size, 3584);
        assert_eq!(config.num_kv_heads(), 4);
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.gqa_ratio(), 7);
        assert_eq!(config.vocab_size, 152064);
        assert_eq!(config.rope_theta, 1_000_000.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = Qwen2Config {
            hidden_size: 100,
            num_attention_heads: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_dtype() {
        let config = Qwen2Config {
            torch_dtype: "int4".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.dtype(), Err(TesseraError::Config(_))));
    }

    #[test]
    fn tp_divisibility() {
        let pretrained = Qwen2Config::from_json(QWEN2_0_5B).unwrap();

        // 14 heads split across 2 ranks is fine
        let config = ModelConfig::new(pretrained.clone())
            .with_mapping(Mapping::tensor_parallel(2, 0));
        assert!(config.validate().is_ok());

        // 2 KV heads cannot be split across 4 ranks
        let config = ModelConfig::new(pretrained).with_mapping(Mapping::tensor_parallel(4, 0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn model_config_serde_defaults() {
        let json = format!(r#"{{"pretrained": {}}}"#, QWEN2_0_5B);
        let config: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.mapping, Mapping::single());
        assert!(!config.fuse_pos_embd);
    }
}
