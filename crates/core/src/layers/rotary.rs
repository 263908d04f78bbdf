use candle_core::{DType, Device, Result, Tensor};

use crate::config::{DeepSeekConfig, RopeScaling};

/// Attention magnitude correction for YaRN-extended contexts.
pub fn yarn_get_mscale(scale: f32, mscale: f32) -> f32 {
    if scale <= 1.0 {
        1.0
    } else {
        0.1 * mscale * scale.ln() + 1.0
    }
}

fn yarn_find_correction_dim(num_rotations: f32, dim: usize, base: f32, max_pos: usize) -> f32 {
    (dim as f32 * (max_pos as f32 / (num_rotations * 2.0 * std::f32::consts::PI)).ln())
        / (2.0 * base.ln())
}

fn yarn_find_correction_range(
    beta_fast: f32,
    beta_slow: f32,
    dim: usize,
    base: f32,
    max_pos: usize,
) -> (f32, f32) {
    let low = yarn_find_correction_dim(beta_fast, dim, base, max_pos).floor();
    let high = yarn_find_correction_dim(beta_slow, dim, base, max_pos).ceil();
    (low.max(0.0), high.min(dim as f32 - 1.0))
}

fn yarn_linear_ramp(low: f32, high: f32, len: usize) -> Vec<f32> {
    let high = if (high - low).abs() < 1e-3 {
        high + 1e-3
    } else {
        high
    };
    (0..len)
        .map(|i| ((i as f32 - low) / (high - low)).clamp(0.0, 1.0))
        .collect()
}

/// Precomputed cos/sin caches in the split-halves layout that
/// `candle_nn::rotary_emb::rope` consumes. Checkpoint projections storing
/// interleaved rope pairs are permuted into this layout at load time.
#[derive(Debug)]
pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f32,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / rope_theta.powf(i as f32 / head_dim as f32))
            .collect();
        Self::from_inv_freq(inv_freq, max_seq_len, 1.0, dtype, device)
    }

    /// YaRN-scaled cache: interpolated and extrapolated frequencies blended
    /// by a linear ramp over the correction range, with the mscale ratio
    /// baked into cos/sin.
    pub fn new_yarn(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f32,
        factor: f32,
        original_max_pos: usize,
        beta_fast: f32,
        beta_slow: f32,
        mscale: f32,
        mscale_all_dim: f32,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let freq_extra: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / rope_theta.powf(i as f32 / head_dim as f32))
            .collect();
        let freq_inter: Vec<f32> = freq_extra.iter().map(|f| f / factor).collect();

        let (low, high) =
            yarn_find_correction_range(beta_fast, beta_slow, head_dim, rope_theta, original_max_pos);
        let ramp = yarn_linear_ramp(low, high, head_dim / 2);

        let inv_freq: Vec<f32> = freq_inter
            .iter()
            .zip(freq_extra.iter())
            .zip(ramp.iter())
            .map(|((inter, extra), r)| inter * r + extra * (1.0 - r))
            .collect();

        let attn_scale =
            yarn_get_mscale(factor, mscale) / yarn_get_mscale(factor, mscale_all_dim);
        Self::from_inv_freq(inv_freq, max_seq_len, attn_scale, dtype, device)
    }

    /// Construct the variant the model config calls for.
    pub fn from_config(cfg: &DeepSeekConfig, dtype: DType, device: &Device) -> Result<Self> {
        match &cfg.rope_scaling {
            None => Self::new(
                cfg.qk_rope_head_dim,
                cfg.max_position_embeddings,
                cfg.rope_theta,
                dtype,
                device,
            ),
            Some(RopeScaling::Yarn {
                factor,
                original_max_position_embeddings,
                beta_fast,
                beta_slow,
                mscale,
                mscale_all_dim,
            }) => Self::new_yarn(
                cfg.qk_rope_head_dim,
                cfg.max_position_embeddings,
                cfg.rope_theta,
                *factor,
                *original_max_position_embeddings,
                *beta_fast,
                *beta_slow,
                *mscale,
                *mscale_all_dim,
                dtype,
                device,
            ),
        }
    }

    fn from_inv_freq(
        inv_freq: Vec<f32>,
        max_seq_len: usize,
        attn_scale: f32,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: (freqs.sin()? * attn_scale as f64)?.to_dtype(dtype)?,
            cos: (freqs.cos()? * attn_scale as f64)?.to_dtype(dtype)?,
        })
    }

    /// Rotate the positional parts of queries and keys.
    /// Both inputs are `[b, heads, seq_len, rope_dim]`; the key side may use
    /// a single head (MQA-style shared rope key).
    pub fn apply(&self, q: &Tensor, k: &Tensor, seqlen_offset: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, seqlen_offset, seq_len)?;
        let sin = self.sin.narrow(0, seqlen_offset, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotary_embedding_new_shape() {
        let device = Device::Cpu;
        let head_dim = 64;
        let max_seq_len = 128;

        let rope = RotaryEmbedding::new(head_dim, max_seq_len, 10000.0, DType::F32, &device)
            .expect("Failed to create RotaryEmbedding");

        assert_eq!(rope.sin.dims(), &[max_seq_len, head_dim / 2]);
        assert_eq!(rope.cos.dims(), &[max_seq_len, head_dim / 2]);
    }

    #[test]
    fn test_unscaled_cache_is_unit_magnitude() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(64, 32, 10000.0, DType::F32, &device).unwrap();
        let sum = (rope.sin.sqr().unwrap() + rope.cos.sqr().unwrap()).unwrap();
        let vals = sum.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for v in vals {
            assert!((v - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_yarn_cache_shape_and_mscale() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new_yarn(
            64, 256, 10000.0, 40.0, 4096, 32.0, 1.0, 0.707, 0.707, DType::F32, &device,
        )
        .expect("Failed to create YaRN RotaryEmbedding");
        assert_eq!(rope.sin.dims(), &[256, 32]);

        // mscale == mscale_all_dim, so the ratio is 1 and magnitudes stay unit.
        let sum = (rope.sin.sqr().unwrap() + rope.cos.sqr().unwrap()).unwrap();
        let vals = sum.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for v in vals {
            assert!((v - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_yarn_get_mscale() {
        assert_eq!(yarn_get_mscale(1.0, 1.0), 1.0);
        assert_eq!(yarn_get_mscale(0.5, 1.0), 1.0);
        let m = yarn_get_mscale(40.0, 0.707);
        assert!((m - (0.1 * 0.707 * 40f32.ln() + 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_apply_preserves_norm() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(16, 32, 10000.0, DType::F32, &device).unwrap();
        let q = Tensor::randn(0f32, 1.0, (1, 2, 4, 16), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 1, 4, 16), &device).unwrap();
        let (q_rot, k_rot) = rope.apply(&q, &k, 0).unwrap();
        assert_eq!(q_rot.dims(), q.dims());
        assert_eq!(k_rot.dims(), k.dims());

        // Rotation preserves the L2 norm of each (first-half, second-half) pair.
        let norm = |t: &Tensor| -> f32 {
            t.sqr()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap()
        };
        assert!((norm(&q) - norm(&q_rot)).abs() < 1e-3);
        assert!((norm(&k) - norm(&k_rot)).abs() < 1e-3);
    }

    #[test]
    fn test_apply_with_offset_matches_tail() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(16, 64, 10000.0, DType::F32, &device).unwrap();
        let q = Tensor::randn(0f32, 1.0, (1, 2, 6, 16), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 1, 6, 16), &device).unwrap();

        let (q_full, _) = rope.apply(&q, &k, 0).unwrap();
        let q_last = q.narrow(2, 5, 1).unwrap().contiguous().unwrap();
        let k_last = k.narrow(2, 5, 1).unwrap().contiguous().unwrap();
        let (q_off, _) = rope.apply(&q_last, &k_last, 5).unwrap();

        let expected = q_full
            .narrow(2, 5, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let got = q_off.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (e, g) in expected.iter().zip(got.iter()) {
            assert!((e - g).abs() < 1e-5);
        }
    }
}
