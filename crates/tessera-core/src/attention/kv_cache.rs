//! Contiguous KV cache used by the reference attention backend.

use crate::error::Result;
use candle_core::Tensor;

/// KV cache for a single layer of one sequence.
#[derive(Debug, Clone, Default)]
pub struct LayerCache {
    /// Cached keys: [1, num_kv_heads, seq_len, head_dim]
    key: Option<Tensor>,
    /// Cached values: [1, num_kv_heads, seq_len, head_dim]
    value: Option<Tensor>,
}

impl LayerCache {
    /// Create a new empty layer cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    /// Get the current sequence length in cache.
    pub fn seq_len(&self) -> usize {
        self.key.as_ref().map(|k| k.dims()[2]).unwrap_or(0)
    }

    /// Append new KV to cache and return concatenated KV.
    ///
    /// Returns (key, value) tensors that include all cached + new tokens.
    pub fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let (new_key, new_value) = match (&self.key, &self.value) {
            (Some(cached_k), Some(cached_v)) => (
                Tensor::cat(&[cached_k, key], 2)?,
                Tensor::cat(&[cached_v, value], 2)?,
            ),
            _ => (key.clone(), value.clone()),
        };

        self.key = Some(new_key.clone());
        self.value = Some(new_value.clone());

        Ok((new_key, new_value))
    }

    /// Get cached KV without modification.
    pub fn get(&self) -> Option<(&Tensor, &Tensor)> {
        match (&self.key, &self.value) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        }
    }

    /// Clear the cache.
    pub fn clear(&mut self) {
        self.key = None;
        self.value = None;
    }
}

/// Per-layer caches of one sequence, grown on first use of a layer.
#[derive(Debug, Default)]
pub struct SequenceCache {
    layers: Vec<LayerCache>,
}

impl SequenceCache {
    /// Create an empty sequence cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get mutable reference to layer cache.
    pub fn layer_mut(&mut self, layer_idx: usize) -> &mut LayerCache {
        if layer_idx >= self.layers.len() {
            self.layers.resize_with(layer_idx + 1, LayerCache::new);
        }
        &mut self.layers[layer_idx]
    }

    /// Get reference to layer cache.
    pub fn layer(&self, layer_idx: usize) -> Option<&LayerCache> {
        self.layers.get(layer_idx)
    }

    /// Cached length of `layer_idx` (0 if never written).
    pub fn seq_len(&self, layer_idx: usize) -> usize {
        self.layer(layer_idx).map(LayerCache::seq_len).unwrap_or(0)
    }

    /// Number of layers touched so far.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn layer_cache_empty() {
        let cache = LayerCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.seq_len(), 0);
        assert!(cache.get().is_none());
    }

    #[test]
    fn layer_cache_append() {
        let mut cache = LayerCache::new();
        let device = Device::Cpu;

        // First append: 4 tokens
        let k1 = Tensor::zeros((1, 4, 4, 32), DType::F32, &device).unwrap();
        let v1 = Tensor::zeros((1, 4, 4, 32), DType::F32, &device).unwrap();

        let (k, v) = cache.append(&k1, &v1).unwrap();
        assert_eq!(k.dims(), &[1, 4, 4, 32]);
        assert_eq!(v.dims(), &[1, 4, 4, 32]);
        assert_eq!(cache.seq_len(), 4);

        // Second append: 1 more token
        let k2 = Tensor::zeros((1, 4, 1, 32), DType::F32, &device).unwrap();
        let v2 = Tensor::zeros((1, 4, 1, 32), DType::F32, &device).unwrap();

        let (k, v) = cache.append(&k2, &v2).unwrap();
        assert_eq!(k.dims(), &[1, 4, 5, 32]);
        assert_eq!(v.dims(), &[1, 4, 5, 32]);
        assert_eq!(cache.seq_len(), 5);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn sequence_cache_grows_per_layer() {
        let mut cache = SequenceCache::new();
        assert_eq!(cache.seq_len(3), 0);

        let k = Tensor::zeros((1, 2, 3, 8), DType::F32, &Device::Cpu).unwrap();
        cache.layer_mut(3).append(&k, &k).unwrap();

        assert_eq!(cache.num_layers(), 4);
        assert_eq!(cache.seq_len(3), 3);
        assert_eq!(cache.seq_len(0), 0);
    }
}
