//! Greedy generation example.
//!
//! Token ids in, token ids out; bring your own tokenizer.
//!
//! Run with:
//! ```bash
//! cargo run -p tessera --example generate -- /path/to/qwen2-0.5b 151643 872 11
//! ```

use anyhow::Result;
use std::time::Instant;
use tessera::prelude::*;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let model_dir = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: generate <model_dir> [token ids...]"))?;
    let mut prompt: Vec<u32> = args.map(|t| t.parse()).collect::<Result<_, _>>()?;
    if prompt.is_empty() {
        prompt = vec![151643];
    }

    let engine = Engine::builder().model_path(&model_dir).build()?;
    println!("Engine initialized: {}", engine.model().architecture());

    let eos = engine.model().config().pretrained.pad_token_id;
    let start = Instant::now();
    let result = engine.generate(&prompt, 32, eos)?;
    let elapsed = start.elapsed().as_secs_f64();

    println!("Prompt tokens:    {}", result.num_prompt_tokens);
    println!("Generated tokens: {}", result.num_generated_tokens);
    println!("Finish reason:    {:?}", result.finish_reason);
    println!("Tokens: {:?}", result.tokens);
    println!(
        "{:.1} tokens/s",
        result.num_generated_tokens as f64 / elapsed.max(f64::EPSILON)
    );

    Ok(())
}
