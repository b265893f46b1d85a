//! Single forward pass through a Qwen2 checkpoint.
//!
//! Loads `config.json` and `*.safetensors` from a directory (or builds a
//! small random model when no directory is given) and prints the top logits
//! of the last position.
//!
//! Run with:
//! ```bash
//! cargo run -p tessera-core --example qwen2_forward -- /path/to/qwen2-0.5b
//! ```

use candle_core::{DType, Device, Tensor};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tessera_core::attention::{AttentionMetadata, ReferenceBackend};
use tessera_core::model::{ModelConfig, Qwen2Config, RandomWeights, WeightLoader, WeightSource};
use tessera_core::parallel::SingleProcessGroup;
use tessera_core::registry::{self, BuildContext};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let device = Device::Cpu;
    let model_dir = std::env::args().nth(1);

    let (config, weights): (ModelConfig, Box<dyn WeightSource>) = match &model_dir {
        Some(dir) => {
            let dir = Path::new(dir);
            let pretrained = Qwen2Config::from_file(&dir.join("config.json"))?;
            println!("Loading weights from {}", dir.display());
            let loader = WeightLoader::from_dir(dir, &device)?.with_dtype(DType::F32);
            println!("  {} tensors", loader.len());
            (ModelConfig::new(pretrained), Box::new(loader) as Box<dyn WeightSource>)
        }
        None => {
            println!("No model directory given, using random weights");
            let pretrained = Qwen2Config {
                vocab_size: 1000,
                hidden_size: 64,
                intermediate_size: 128,
                num_hidden_layers: 2,
                num_attention_heads: 4,
                num_key_value_heads: Some(2),
                max_position_embeddings: 256,
                ..Default::default()
            };
            (
                ModelConfig::new(pretrained),
                Box::new(RandomWeights::new(DType::F32, &device)) as Box<dyn WeightSource>,
            )
        }
    };

    println!(
        "Model: {} layers, {} hidden, {} heads ({} kv)",
        config.pretrained.num_hidden_layers,
        config.pretrained.hidden_size,
        config.pretrained.num_attention_heads,
        config.pretrained.num_kv_heads()
    );

    let start = Instant::now();
    let model = registry::global().read().build_from_config(
        &config,
        BuildContext {
            weights: weights.as_ref(),
            attention: Arc::new(ReferenceBackend::new()),
            comm: Arc::new(SingleProcessGroup),
        },
    )?;
    println!("Built {} in {:.2}s", model.architecture(), start.elapsed().as_secs_f64());

    let prompt: Vec<u32> = vec![1, 5, 9, 13, 17, 21, 25, 29];
    let input_ids = Tensor::new(prompt.as_slice(), &device)?.unsqueeze(0)?;

    let start = Instant::now();
    let logits = model.forward(&AttentionMetadata::context(1), Some(&input_ids), None, None, false)?;
    println!("Forward: {:.1}ms, logits {:?}", start.elapsed().as_secs_f64() * 1000.0, logits.dims());

    let scores: Vec<f32> = logits.flatten_all()?.to_vec1()?;
    let mut ranked: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (token, score) in ranked.iter().take(5) {
        println!("  token {:>6}  logit {:.4}", token, score);
    }

    Ok(())
}
