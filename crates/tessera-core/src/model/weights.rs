//! Weight sources.
//!
//! Modules are built by asking a [`WeightSource`] for each named parameter
//! together with its full (unsharded) shape and the [`Shard`] this rank
//! holds. Checkpoint loading and random initialization share one
//! construction path.

use crate::error::Result;
use crate::parallel::Shard;
use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Initialization hint for sources that synthesize parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightInit {
    /// Normal distribution with mean 0.
    Normal {
        /// Standard deviation.
        std: f64,
    },
    /// All ones (norm scales).
    Ones,
    /// All zeros (biases).
    Zeros,
}

impl WeightInit {
    /// Default projection initialization.
    pub const PROJECTION: WeightInit = WeightInit::Normal { std: 0.02 };
}

/// Provider of named model parameters.
pub trait WeightSource: Send + Sync {
    /// Fetch `name`, whose unsharded shape is `full_shape`, returning the
    /// local `shard` in [`WeightSource::dtype`] on [`WeightSource::device`].
    fn get(&self, name: &str, full_shape: &[usize], shard: Shard, init: WeightInit)
        -> Result<Tensor>;

    /// Device parameters are placed on.
    fn device(&self) -> &Device;

    /// Parameter dtype.
    fn dtype(&self) -> DType;
}

/// Randomly initialized parameters.
///
/// Each name is generated once at full shape and memoized, so every rank
/// (and every model built from the same source) sees slices of the same
/// tensor.
#[derive(Debug)]
pub struct RandomWeights {
    device: Device,
    dtype: DType,
    generated: Mutex<HashMap<String, Tensor>>,
}

impl RandomWeights {
    /// Create a random source.
    pub fn new(dtype: DType, device: &Device) -> Self {
        Self {
            device: device.clone(),
            dtype,
            generated: Mutex::new(HashMap::new()),
        }
    }

    /// Number of parameters generated so far.
    pub fn len(&self) -> usize {
        self.generated.lock().len()
    }

    /// True if nothing has been generated.
    pub fn is_empty(&self) -> bool {
        self.generated.lock().is_empty()
    }

    /// Full-shape copies of every generated parameter, e.g. to write a
    /// checkpoint with `candle_core::safetensors::save`.
    pub fn snapshot(&self) -> HashMap<String, Tensor> {
        self.generated.lock().clone()
    }

    fn generate(&self, full_shape: &[usize], init: WeightInit) -> Result<Tensor> {
        let tensor = match init {
            WeightInit::Normal { std } => {
                Tensor::randn(0.0f32, std as f32, full_shape, &self.device)?
            }
            WeightInit::Ones => Tensor::ones(full_shape, DType::F32, &self.device)?,
            WeightInit::Zeros => Tensor::zeros(full_shape, DType::F32, &self.device)?,
        };
        Ok(tensor.to_dtype(self.dtype)?)
    }
}

impl WeightSource for RandomWeights {
    fn get(
        &self,
        name: &str,
        full_shape: &[usize],
        shard: Shard,
        init: WeightInit,
    ) -> Result<Tensor> {
        let full = {
            let mut generated = self.generated.lock();
            match generated.get(name) {
                Some(t) if t.dims() == full_shape => t.clone(),
                _ => {
                    let t = self.generate(full_shape, init)?;
                    generated.insert(name.to_string(), t.clone());
                    t
                }
            }
        };
        shard.narrow(&full)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}
