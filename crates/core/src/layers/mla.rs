//! Multi-head latent attention.
//!
//! The checkpoint's `kv_b_proj` is split at load time into per-head `kc` and
//! `vc` factors. Queries are absorbed into the latent space through `kc`, so
//! attention runs directly against the cached `[c_kv ‖ k_pe]` entries with
//! the compressed latent doubling as the value; `vc` expands the result back
//! to per-head value width afterwards. This keeps the cache at
//! `kv_lora_rank + qk_rope_head_dim` per token instead of
//! `2 · num_heads · head_dim`.

use std::sync::Arc;

use candle_core::{DType, Result, Tensor};
use candle_nn::{linear, linear_no_bias, rms_norm, Linear, RmsNorm, VarBuilder};

use crate::config::DeepSeekConfig;
use crate::kv_cache::LayerCache;
use crate::layers::rotary::RotaryEmbedding;

/// Query path: direct projection, or the low-rank a/norm/b decomposition
/// larger checkpoints ship.
#[derive(Debug)]
enum QProj {
    Plain(Linear),
    Lora {
        a: Linear,
        norm: RmsNorm,
        b: Linear,
    },
}

impl QProj {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Plain(proj) => xs.apply(proj),
            Self::Lora { a, norm, b } => xs.apply(a)?.apply(norm)?.apply(b),
        }
    }
}

#[derive(Debug)]
pub struct MlaAttention {
    q_proj: QProj,
    kv_a_proj_with_mqa: Linear,
    kv_a_layernorm: RmsNorm,
    /// Key absorption factor, `(num_heads, qk_nope_head_dim, kv_lora_rank)`.
    kc: Tensor,
    /// Value expansion factor, `(num_heads, kv_lora_rank, v_head_dim)`.
    vc: Tensor,
    o_proj: Linear,
    rotary: Arc<RotaryEmbedding>,
    num_heads: usize,
    q_head_dim: usize,
    qk_nope_head_dim: usize,
    qk_rope_head_dim: usize,
    kv_lora_rank: usize,
    v_head_dim: usize,
    softmax_scale: f64,
}

impl MlaAttention {
    pub fn new(
        cfg: &DeepSeekConfig,
        rotary: Arc<RotaryEmbedding>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let q_head_dim = cfg.q_head_dim();

        let q_proj = match cfg.q_lora_rank {
            None => QProj::Plain(linear_no_bias(
                cfg.hidden_size,
                num_heads * q_head_dim,
                vb.pp("q_proj"),
            )?),
            Some(rank) => QProj::Lora {
                a: linear_no_bias(cfg.hidden_size, rank, vb.pp("q_a_proj"))?,
                norm: rms_norm(rank, cfg.rms_norm_eps, vb.pp("q_a_layernorm"))?,
                b: linear_no_bias(rank, num_heads * q_head_dim, vb.pp("q_b_proj"))?,
            },
        };

        let kv_a_proj_with_mqa = linear_no_bias(
            cfg.hidden_size,
            cfg.kv_lora_rank + cfg.qk_rope_head_dim,
            vb.pp("kv_a_proj_with_mqa"),
        )?;
        let kv_a_layernorm = rms_norm(cfg.kv_lora_rank, cfg.rms_norm_eps, vb.pp("kv_a_layernorm"))?;

        let kc = vb.get(
            (num_heads, cfg.qk_nope_head_dim, cfg.kv_lora_rank),
            "kc",
        )?;
        let vc = vb.get((num_heads, cfg.kv_lora_rank, cfg.v_head_dim), "vc")?;

        let o_proj = if cfg.attention_bias {
            linear(num_heads * cfg.v_head_dim, cfg.hidden_size, vb.pp("o_proj"))?
        } else {
            linear_no_bias(num_heads * cfg.v_head_dim, cfg.hidden_size, vb.pp("o_proj"))?
        };

        Ok(Self {
            q_proj,
            kv_a_proj_with_mqa,
            kv_a_layernorm,
            kc,
            vc,
            o_proj,
            rotary,
            num_heads,
            q_head_dim,
            qk_nope_head_dim: cfg.qk_nope_head_dim,
            qk_rope_head_dim: cfg.qk_rope_head_dim,
            kv_lora_rank: cfg.kv_lora_rank,
            v_head_dim: cfg.v_head_dim,
            softmax_scale: cfg.softmax_scale(),
        })
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        seqlen_offset: usize,
        attention_mask: Option<&Tensor>,
        cache: &mut LayerCache,
    ) -> Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        let dtype = xs.dtype();

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b, t, self.num_heads, self.q_head_dim))?
            .transpose(1, 2)?;
        let q_nope = q.narrow(3, 0, self.qk_nope_head_dim)?.contiguous()?;
        let q_pe = q
            .narrow(3, self.qk_nope_head_dim, self.qk_rope_head_dim)?
            .contiguous()?;

        let kv = xs.apply(&self.kv_a_proj_with_mqa)?;
        let c_kv = kv
            .narrow(2, 0, self.kv_lora_rank)?
            .apply(&self.kv_a_layernorm)?;
        // Single shared rope key across heads.
        let k_pe = kv
            .narrow(2, self.kv_lora_rank, self.qk_rope_head_dim)?
            .reshape((b, t, 1, self.qk_rope_head_dim))?
            .transpose(1, 2)?;

        let (q_pe, k_pe) = self.rotary.apply(&q_pe, &k_pe, seqlen_offset)?;

        // Absorb q_nope into latent space: (b, h, t, nope) x (h, nope, r).
        let q_latent = q_nope.broadcast_matmul(&self.kc)?;
        let q_states = Tensor::cat(&[&q_latent, &q_pe], 3)?;

        let entry = Tensor::cat(&[&c_kv, &k_pe.squeeze(1)?], 2)?;
        let kv_full = cache.append(&entry)?;

        let keys = kv_full.unsqueeze(1)?;
        let attn = (q_states.broadcast_matmul(&keys.transpose(2, 3)?.contiguous()?)?
            * self.softmax_scale)?;
        let attn = match attention_mask {
            Some(mask) => attn.broadcast_add(mask)?,
            None => attn,
        };
        let attn = candle_nn::ops::softmax_last_dim(&attn.to_dtype(DType::F32)?)?.to_dtype(dtype)?;

        // The cached latent itself is the value; expand through vc after.
        let values = kv_full.narrow(2, 0, self.kv_lora_rank)?.unsqueeze(1)?;
        let out = attn
            .broadcast_matmul(&values.contiguous()?)?
            .broadcast_matmul(&self.vc)?;
        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.num_heads * self.v_head_dim))?;
        out.apply(&self.o_proj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::LatentCache;
    use candle_core::Device;

    fn test_config() -> DeepSeekConfig {
        serde_json::from_value(serde_json::json!({
            "architectures": ["DeepseekV2ForCausalLM"],
            "vocab_size": 128,
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "max_position_embeddings": 64,
            "rms_norm_eps": 1e-6,
            "rope_theta": 10000.0,
            "kv_lora_rank": 16,
            "qk_nope_head_dim": 8,
            "qk_rope_head_dim": 4,
            "v_head_dim": 8
        }))
        .unwrap()
    }

    #[test]
    fn test_mla_forward_shape_and_cache_growth() {
        let device = Device::Cpu;
        let cfg = test_config();
        let rotary = Arc::new(
            RotaryEmbedding::from_config(&cfg, DType::F32, &device).unwrap(),
        );
        let vb = VarBuilder::zeros(DType::F32, &device);
        let attn = MlaAttention::new(&cfg, rotary, vb).unwrap();

        let mut cache = LatentCache::new(cfg.num_hidden_layers);
        let xs = Tensor::randn(0f32, 1.0, (2, 5, 64), &device).unwrap();
        let out = attn.forward(&xs, 0, None, cache.layer_mut(0)).unwrap();
        assert_eq!(out.dims(), &[2, 5, 64]);
        assert_eq!(cache.seq_len(0), 5);

        // Single-token decode appends one cache entry.
        let step = Tensor::randn(0f32, 1.0, (2, 1, 64), &device).unwrap();
        let out = attn.forward(&step, 5, None, cache.layer_mut(0)).unwrap();
        assert_eq!(out.dims(), &[2, 1, 64]);
        assert_eq!(cache.seq_len(0), 6);
    }

    #[test]
    fn test_mla_q_lora_path() {
        let device = Device::Cpu;
        let mut cfg = test_config();
        cfg.q_lora_rank = Some(12);
        let rotary = Arc::new(
            RotaryEmbedding::from_config(&cfg, DType::F32, &device).unwrap(),
        );
        let vb = VarBuilder::zeros(DType::F32, &device);
        let attn = MlaAttention::new(&cfg, rotary, vb).unwrap();

        let mut cache = LatentCache::new(cfg.num_hidden_layers);
        let xs = Tensor::randn(0f32, 1.0, (1, 3, 64), &device).unwrap();
        let out = attn.forward(&xs, 0, None, cache.layer_mut(0)).unwrap();
        assert_eq!(out.dims(), &[1, 3, 64]);
    }
}
