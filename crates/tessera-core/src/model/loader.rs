//! SafeTensors weight loading.
//!
//! Reads HuggingFace checkpoints and serves them through [`WeightSource`],
//! cutting each parameter down to the local tensor-parallel shard.
//!
//! # Example
//!
//! ```ignore
//! use tessera_core::model::WeightLoader;
//!
//! let loader = WeightLoader::from_dir(model_dir, &Device::Cpu)?.with_dtype(DType::BF16);
//! let embed = loader.get_tensor("model.embed_tokens.weight")?;
//! ```

use super::{WeightInit, WeightSource};
use crate::error::{Result, TesseraError};
use crate::parallel::Shard;
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Weight loader for SafeTensors format.
pub struct WeightLoader {
    /// Loaded tensors indexed by HuggingFace name.
    tensors: HashMap<String, Tensor>,
    /// Device for loaded tensors.
    device: Device,
    /// Dtype parameters are served in.
    dtype: DType,
}

impl WeightLoader {
    /// Create a new weight loader from a model directory.
    ///
    /// Loads all .safetensors files in the directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let mut safetensor_files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "safetensors") {
                safetensor_files.push(path);
            }
        }

        // Deterministic loading order across shards
        safetensor_files.sort();

        if safetensor_files.is_empty() {
            return Err(TesseraError::Model(format!(
                "No .safetensors files found in {}",
                dir.display()
            )));
        }

        let mut tensors = HashMap::new();
        for path in &safetensor_files {
            tensors.extend(Self::load_safetensors_file(path, device)?);
        }
        tracing::debug!(
            files = safetensor_files.len(),
            tensors = tensors.len(),
            "loaded safetensors checkpoint from {}",
            dir.display()
        );

        Ok(Self {
            tensors,
            device: device.clone(),
            dtype: DType::F32,
        })
    }

    /// Create a weight loader from a single file.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let tensors = Self::load_safetensors_file(path, device)?;
        Ok(Self {
            tensors,
            device: device.clone(),
            dtype: DType::F32,
        })
    }

    /// Serve parameters in `dtype`.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Load tensors from a single safetensors file.
    fn load_safetensors_file(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
        let data = fs::read(path)?;
        let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
            TesseraError::Model(format!("Failed to deserialize {}: {}", path.display(), e))
        })?;

        let mut tensors = HashMap::new();
        for (name, view) in safetensors.tensors() {
            let tensor = Self::view_to_tensor(&view, device)?;
            tensors.insert(name.to_string(), tensor);
        }

        Ok(tensors)
    }

    /// Convert a SafeTensors view to a Candle tensor.
    fn view_to_tensor(view: &safetensors::tensor::TensorView, device: &Device) -> Result<Tensor> {
        let shape: Vec<usize> = view.shape().to_vec();
        let data = view.data();

        let tensor = match view.dtype() {
            safetensors::Dtype::F32 => {
                Tensor::from_slice(&cast_bytes::<f32>(data)[..], shape.as_slice(), device)?
            }
            safetensors::Dtype::F16 => {
                Tensor::from_slice(&cast_bytes::<half::f16>(data)[..], shape.as_slice(), device)?
            }
            safetensors::Dtype::BF16 => {
                Tensor::from_slice(&cast_bytes::<half::bf16>(data)[..], shape.as_slice(), device)?
            }
            safetensors::Dtype::I64 => {
                Tensor::from_slice(&cast_bytes::<i64>(data)[..], shape.as_slice(), device)?
            }
            safetensors::Dtype::I32 => {
                // Candle has no I32, upcast
                let values: Vec<i64> = cast_bytes::<i32>(data).iter().map(|&x| x as i64).collect();
                Tensor::from_slice(&values, shape.as_slice(), device)?
            }
            safetensors::Dtype::U32 => {
                Tensor::from_slice(&cast_bytes::<u32>(data)[..], shape.as_slice(), device)?
            }
            safetensors::Dtype::U8 => Tensor::from_slice(data, shape.as_slice(), device)?,
            other => {
                return Err(TesseraError::Model(format!(
                    "Unsupported dtype: {:?}",
                    other
                )));
            }
        };

        Ok(tensor)
    }

    /// Full (unsharded) tensor by name, in its stored dtype.
    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Get a tensor by name, returning an error if not found.
    pub fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| TesseraError::Model(format!("Tensor not found: {}", name)))
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// All tensor names, sorted.
    pub fn tensor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Get the number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightSource for WeightLoader {
    fn get(
        &self,
        name: &str,
        full_shape: &[usize],
        shard: Shard,
        _init: WeightInit,
    ) -> Result<Tensor> {
        let tensor = self.get_tensor(name)?;
        if tensor.dims() != full_shape {
            return Err(TesseraError::ShapeMismatch(format!(
                "{}: expected {:?}, got {:?}",
                name,
                full_shape,
                tensor.dims()
            )));
        }
        Ok(shard.narrow(&tensor)?.to_dtype(self.dtype)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

impl std::fmt::Debug for WeightLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightLoader")
            .field("tensors", &self.tensors.len())
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .finish()
    }
}

/// Reinterpret little-endian bytes, copying when the data offset is not
/// aligned for `T`.
fn cast_bytes<T: bytemuck::Pod>(data: &[u8]) -> std::borrow::Cow<'_, [T]> {
    match bytemuck::try_cast_slice(data) {
        Ok(values) => std::borrow::Cow::Borrowed(values),
        Err(_) => std::borrow::Cow::Owned(bytemuck::pod_collect_to_vec(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tessera_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn loader_from_nonexistent_dir() {
        let result = WeightLoader::from_dir(Path::new("/nonexistent/path"), &Device::Cpu);
        assert!(result.is_err());
    }

    #[test]
    fn loader_empty_dir() {
        let dir = temp_dir("empty");

        let result = WeightLoader::from_dir(&dir, &Device::Cpu);
        assert!(matches!(result, Err(TesseraError::Model(_))));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn loader_serves_shards_in_target_dtype() {
        let dir = temp_dir("shards");
        let weight = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((4, 3))
            .unwrap();
        let mut tensors = HashMap::new();
        tensors.insert("model.norm.weight".to_string(), weight);
        candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();

        let loader = WeightLoader::from_dir(&dir, &Device::Cpu)
            .unwrap()
            .with_dtype(DType::F16);
        assert_eq!(loader.len(), 1);
        assert!(loader.contains("model.norm.weight"));
        assert_eq!(loader.tensor("model.norm.weight").unwrap().dtype(), DType::F32);

        let shard = Shard::Split { dim: 0, rank: 1, world_size: 2 };
        let local = loader
            .get("model.norm.weight", &[4, 3], shard, WeightInit::Ones)
            .unwrap();
        assert_eq!(local.dims(), &[2, 3]);
        assert_eq!(local.dtype(), DType::F16);
        let vals: Vec<Vec<f32>> = local.to_dtype(DType::F32).unwrap().to_vec2().unwrap();
        assert_eq!(vals[0], vec![6.0, 7.0, 8.0]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn loader_rejects_wrong_shape_and_missing() {
        let dir = temp_dir("mismatch");
        let mut tensors = HashMap::new();
        tensors.insert(
            "w".to_string(),
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, dir.join("a.safetensors")).unwrap();

        let loader = WeightLoader::from_dir(&dir, &Device::Cpu).unwrap();
        let wrong = loader.get("w", &[2, 3], Shard::Full, WeightInit::Zeros);
        assert!(matches!(wrong, Err(TesseraError::ShapeMismatch(_))));
        assert!(loader.tensor("nope").is_none());
        let missing = loader.get("nope", &[2], Shard::Full, WeightInit::Zeros);
        assert!(matches!(missing, Err(TesseraError::Model(_))));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cast_bytes_handles_unaligned_offset() {
        let value = 123.456f32;
        let mut buf = vec![0u8];
        buf.extend_from_slice(&value.to_le_bytes());

        let values = cast_bytes::<f32>(&buf[1..]);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], value);
    }

    #[test]
    fn loader_merges_files_and_lists_names() {
        let dir = temp_dir("multi");
        let mut first = HashMap::new();
        first.insert(
            "model.layers.0.mlp.up_proj.weight".to_string(),
            Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        let mut second = HashMap::new();
        second.insert(
            "model.embed_tokens.weight".to_string(),
            Tensor::ones((8, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&first, dir.join("model-00001-of-00002.safetensors")).unwrap();
        candle_core::safetensors::save(&second, dir.join("model-00002-of-00002.safetensors")).unwrap();

        let loader = WeightLoader::from_dir(&dir, &Device::Cpu).unwrap();
        assert_eq!(
            loader.tensor_names(),
            vec!["model.embed_tokens.weight", "model.layers.0.mlp.up_proj.weight"]
        );

        let _ = fs::remove_dir_all(&dir);
    }
}
