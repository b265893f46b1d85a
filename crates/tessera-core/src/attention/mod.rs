//! Attention computation backends.
//!
//! The model hands head-split projections to an [`AttentionBackend`] and
//! never sees the KV cache:
//! - [`ReferenceBackend`] - CPU reference implementation with an in-memory cache
//! - [`AttentionMetadata`] - Per-step batching and cache context

mod backend;
mod kv_cache;
mod metadata;

pub use backend::{AttentionBackend, AttentionConfig, ReferenceBackend};
pub use kv_cache::{LayerCache, SequenceCache};
pub use metadata::AttentionMetadata;
