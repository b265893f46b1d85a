//! Forward-pass benchmarks for a small random Qwen2.
//!
//! Measures context (prefill) cost against sequence length and the cost of a
//! single cached decode step against the cached length.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use candle_core::{DType, Device, Tensor};
use std::sync::Arc;
use tessera_core::attention::{AttentionMetadata, ReferenceBackend};
use tessera_core::model::{ModelConfig, Qwen2Config, Qwen2ForCausalLM, RandomWeights};
use tessera_core::parallel::SingleProcessGroup;

fn bench_config() -> ModelConfig {
    ModelConfig::new(Qwen2Config {
        vocab_size: 4096,
        hidden_size: 256,
        intermediate_size: 768,
        num_hidden_layers: 4,
        num_attention_heads: 8,
        num_key_value_heads: Some(2),
        max_position_embeddings: 2048,
        ..Default::default()
    })
}

fn build_model(backend: Arc<ReferenceBackend>) -> Qwen2ForCausalLM {
    let weights = RandomWeights::new(DType::F32, &Device::Cpu);
    Qwen2ForCausalLM::load(&bench_config(), &weights, backend, Arc::new(SingleProcessGroup))
        .unwrap()
}

fn token_ids(len: usize) -> Tensor {
    let ids: Vec<u32> = (0..len as u32).map(|i| (i * 31) % 4096).collect();
    Tensor::from_vec(ids, (1, len), &Device::Cpu).unwrap()
}

/// Benchmark: uncached context forward vs. prompt length.
fn bench_context(c: &mut Criterion) {
    let model = build_model(Arc::new(ReferenceBackend::new()));
    let metadata = AttentionMetadata::context(1);

    let mut group = c.benchmark_group("context_forward");
    group.sample_size(20);

    for len in [16usize, 64, 256].iter() {
        let ids = token_ids(*len);
        group.throughput(Throughput::Elements(*len as u64));
        group.bench_with_input(BenchmarkId::new("seq_len", len), len, |b, _| {
            b.iter(|| {
                let logits = model
                    .forward(&metadata, Some(black_box(&ids)), None, None, false)
                    .unwrap();
                black_box(logits)
            })
        });
    }

    group.finish();
}

/// Benchmark: one decode step against a cache of growing length.
fn bench_decode_step(c: &mut Criterion) {
    let backend = Arc::new(ReferenceBackend::new());
    let model = build_model(backend.clone());
    let next = token_ids(1);

    let mut group = c.benchmark_group("decode_step");
    group.sample_size(20);
    group.throughput(Throughput::Elements(1));

    for cached in [16usize, 128, 512].iter() {
        let seq_id = *cached as u64;
        let prefill = AttentionMetadata::new(vec![seq_id], vec![0]).unwrap();
        model
            .forward(&prefill, Some(&token_ids(*cached)), None, None, false)
            .unwrap();
        let step = prefill.advanced(*cached);

        group.bench_with_input(BenchmarkId::new("cached_len", cached), cached, |b, _| {
            // Re-running the same step needs the cache rolled back each time
            b.iter_batched(
                || {
                    backend.release(seq_id);
                    model
                        .forward(&prefill, Some(&token_ids(*cached)), None, None, false)
                        .unwrap();
                },
                |_| {
                    let logits = model
                        .forward(&step, Some(black_box(&next)), None, None, false)
                        .unwrap();
                    black_box(logits)
                },
                criterion::BatchSize::PerIteration,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_context, bench_decode_step);
criterion_main!(benches);
