//! DeepSeek V2/V3 decoder with MLA cache.
//!
//! Multi-head latent attention compresses the KV cache through low-rank
//! projections; the feed-forward is a dense MLP for the first
//! `first_k_dense_replace` layers and a routed MoE (with optional shared
//! experts) on the `moe_layer_freq` schedule after that.

use std::sync::Arc;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{linear_no_bias, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};

use crate::config::DeepSeekConfig;
use crate::kv_cache::LatentCache;
use crate::layers::{causal_mask, MlaAttention, RotaryEmbedding, SwiGluMlp};
use crate::moe::MoeLayer;

#[derive(Debug)]
enum FeedForward {
    Dense(SwiGluMlp),
    Moe(MoeLayer),
}

impl FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(mlp) => mlp.forward(xs),
            Self::Moe(moe) => moe.forward(xs),
        }
    }
}

#[derive(Debug)]
struct DecoderLayer {
    self_attn: MlaAttention,
    mlp: FeedForward,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(
        cfg: &DeepSeekConfig,
        layer_idx: usize,
        rotary: Arc<RotaryEmbedding>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let self_attn = MlaAttention::new(cfg, rotary, vb.pp("self_attn"))?;
        let mlp = if cfg.is_moe_layer(layer_idx) {
            FeedForward::Moe(MoeLayer::new(cfg, vb.pp("mlp"))?)
        } else {
            FeedForward::Dense(SwiGluMlp::new(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("mlp"),
            )?)
        };
        let input_layernorm =
            rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        seqlen_offset: usize,
        attention_mask: Option<&Tensor>,
        cache: &mut crate::kv_cache::LayerCache,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self
            .self_attn
            .forward(&xs, seqlen_offset, attention_mask, cache)?;
        let xs = (residual + xs)?;
        let residual = &xs;
        let out = self
            .mlp
            .forward(&self.post_attention_layernorm.forward(&xs)?)?;
        residual + out
    }
}

#[derive(Debug)]
pub struct DeepSeekForCausalLM {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    device: Device,
    dtype: DType,
}

impl DeepSeekForCausalLM {
    pub fn new(cfg: &DeepSeekConfig, vb: VarBuilder) -> Result<Self> {
        let vb_m = vb.pp("model");
        let embed_tokens = candle_nn::embedding(
            cfg.vocab_size,
            cfg.hidden_size,
            vb_m.pp("embed_tokens"),
        )?;
        let rotary = Arc::new(RotaryEmbedding::from_config(
            cfg,
            vb.dtype(),
            vb.device(),
        )?);

        let vb_l = vb_m.pp("layers");
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for idx in 0..cfg.num_hidden_layers {
            layers.push(DecoderLayer::new(cfg, idx, rotary.clone(), vb_l.pp(idx))?);
        }
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;

        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Forward `[batch, seq_len]` token ids at `seqlen_offset`, appending
    /// to the latent cache. Returns `[batch, seq_len, vocab]` logits.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        seqlen_offset: usize,
        cache: &mut LatentCache,
    ) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let mut xs = self.embed_tokens.forward(input_ids)?;

        let attention_mask = if seq_len > 1 {
            Some(causal_mask(seq_len, seqlen_offset, self.dtype, &self.device)?)
        } else {
            None
        };

        for (idx, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(
                &xs,
                seqlen_offset,
                attention_mask.as_ref(),
                cache.layer_mut(idx),
            )?;
        }
        let xs = self.norm.forward(&xs)?;
        self.lm_head.forward(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DeepSeekConfig {
        serde_json::from_value(serde_json::json!({
            "architectures": ["DeepseekV2ForCausalLM"],
            "vocab_size": 64,
            "hidden_size": 32,
            "intermediate_size": 64,
            "moe_intermediate_size": 16,
            "num_hidden_layers": 3,
            "num_attention_heads": 2,
            "max_position_embeddings": 64,
            "rms_norm_eps": 1e-6,
            "rope_theta": 10000.0,
            "kv_lora_rank": 8,
            "qk_nope_head_dim": 8,
            "qk_rope_head_dim": 4,
            "v_head_dim": 8,
            "n_routed_experts": 4,
            "n_shared_experts": 1,
            "num_experts_per_tok": 2,
            "first_k_dense_replace": 1,
            "norm_topk_prob": true
        }))
        .unwrap()
    }

    #[test]
    fn test_forward_logits_shape() {
        let device = Device::Cpu;
        let cfg = test_config();
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = DeepSeekForCausalLM::new(&cfg, vb).unwrap();
        assert_eq!(model.num_layers(), 3);

        let mut cache = LatentCache::new(cfg.num_hidden_layers);
        let input_ids = Tensor::zeros((2, 4), DType::U32, &device).unwrap();
        let logits = model.forward(&input_ids, 0, &mut cache).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 64]);
        assert_eq!(cache.seq_len(0), 4);
        assert_eq!(cache.seq_len(2), 4);
    }

    #[test]
    fn test_prefill_then_decode() {
        let device = Device::Cpu;
        let cfg = test_config();
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = DeepSeekForCausalLM::new(&cfg, vb).unwrap();

        let mut cache = LatentCache::new(cfg.num_hidden_layers);
        let prompt = Tensor::zeros((1, 5), DType::U32, &device).unwrap();
        model.forward(&prompt, 0, &mut cache).unwrap();

        let next = Tensor::zeros((1, 1), DType::U32, &device).unwrap();
        let logits = model.forward(&next, 5, &mut cache).unwrap();
        assert_eq!(logits.dims(), &[1, 1, 64]);
        assert_eq!(cache.seq_len(0), 6);
    }

    #[test]
    fn test_tied_embeddings_share_weight() {
        let device = Device::Cpu;
        let mut cfg = test_config();
        cfg.tie_word_embeddings = true;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = DeepSeekForCausalLM::new(&cfg, vb).unwrap();
        assert_eq!(
            model.lm_head.weight().dims(),
            model.embed_tokens.embeddings().dims()
        );
    }
}
