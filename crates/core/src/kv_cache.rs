//! Growable per-layer latent cache.
//!
//! Each attention layer appends `[c_kv ‖ k_pe]` entries of width
//! `kv_lora_rank + qk_rope_head_dim` along the sequence axis and reads back
//! the full cached run. One contiguous tensor per layer; paged layouts live
//! a level below the model definition.

use candle_core::{Result, Tensor};

#[derive(Default)]
pub struct LayerCache {
    entries: Option<Tensor>,
}

impl LayerCache {
    /// Append `[batch, seq, dim]` entries and return the full cached run.
    pub fn append(&mut self, entry: &Tensor) -> Result<Tensor> {
        let full = match &self.entries {
            None => entry.clone(),
            Some(prev) => Tensor::cat(&[prev, entry], 1)?,
        };
        self.entries = Some(full.clone());
        Ok(full)
    }

    pub fn seq_len(&self) -> usize {
        self.entries
            .as_ref()
            .and_then(|t| t.dims().get(1).copied())
            .unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.entries = None;
    }
}

pub struct LatentCache {
    layers: Vec<LayerCache>,
}

impl LatentCache {
    pub fn new(num_layers: usize) -> Self {
        let layers = (0..num_layers).map(|_| LayerCache::default()).collect();
        Self { layers }
    }

    pub fn layer_mut(&mut self, idx: usize) -> &mut LayerCache {
        &mut self.layers[idx]
    }

    pub fn seq_len(&self, idx: usize) -> usize {
        self.layers[idx].seq_len()
    }

    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_append_concatenates_along_seq_axis() {
        let device = Device::Cpu;
        let mut cache = LatentCache::new(2);
        assert_eq!(cache.seq_len(0), 0);

        let a = Tensor::ones((1, 3, 4), candle_core::DType::F32, &device).unwrap();
        let full = cache.layer_mut(0).append(&a).unwrap();
        assert_eq!(full.dims(), &[1, 3, 4]);

        let b = Tensor::zeros((1, 1, 4), candle_core::DType::F32, &device).unwrap();
        let full = cache.layer_mut(0).append(&b).unwrap();
        assert_eq!(full.dims(), &[1, 4, 4]);
        assert_eq!(cache.seq_len(0), 4);
        // Other layers are untouched.
        assert_eq!(cache.seq_len(1), 0);

        let vals = full.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(&vals[..12], &[1.0; 12]);
        assert_eq!(&vals[12..], &[0.0; 4]);
    }

    #[test]
    fn test_reset_clears_all_layers() {
        let device = Device::Cpu;
        let mut cache = LatentCache::new(2);
        let a = Tensor::ones((1, 2, 4), candle_core::DType::F32, &device).unwrap();
        cache.layer_mut(0).append(&a).unwrap();
        cache.layer_mut(1).append(&a).unwrap();
        cache.reset();
        assert_eq!(cache.seq_len(0), 0);
        assert_eq!(cache.seq_len(1), 0);
    }
}
