//! Routed expert execution over fused stacked weights.
//!
//! The checkpoint re-layout stacks per-expert shards into
//! `gate_up (E, 2·I, H)` and `down (E, H, I)`. Tokens are grouped by expert
//! on the host, each expert runs one batched SwiGLU over its tokens, and the
//! weighted results are scattered back with `index_add`.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::DeepSeekConfig;
use crate::layers::mlp::SwiGluMlp;
use crate::moe::gate::MoeGate;

#[derive(Debug)]
pub struct RoutedExperts {
    gate_up: Tensor,
    down: Tensor,
    num_experts: usize,
    intermediate_size: usize,
}

impl RoutedExperts {
    pub fn new(cfg: &DeepSeekConfig, vb: VarBuilder) -> Result<Self> {
        let Some(num_experts) = cfg.n_routed_experts else {
            candle_core::bail!("routed experts require n_routed_experts")
        };
        let intermediate_size = cfg.moe_intermediate_size;
        let gate_up = vb.get(
            (num_experts, 2 * intermediate_size, cfg.hidden_size),
            "gate_up",
        )?;
        let down = vb.get(
            (num_experts, cfg.hidden_size, intermediate_size),
            "down",
        )?;
        Ok(Self {
            gate_up,
            down,
            num_experts,
            intermediate_size,
        })
    }

    /// `xs` is `[tokens, hidden]`; `weights`/`indices` are the gate's
    /// `[tokens, top_k]` outputs.
    pub fn forward(&self, xs: &Tensor, weights: &Tensor, indices: &Tensor) -> Result<Tensor> {
        let (tokens, hidden) = xs.dims2()?;
        let indices = indices.to_vec2::<u32>()?;
        let weights = weights.to_dtype(DType::F32)?.to_vec2::<f32>()?;

        // Group (token, weight) assignments by expert.
        let mut per_expert: Vec<Vec<(u32, f32)>> = vec![Vec::new(); self.num_experts];
        for (token, (idx_row, w_row)) in indices.iter().zip(weights.iter()).enumerate() {
            for (&expert, &weight) in idx_row.iter().zip(w_row.iter()) {
                per_expert[expert as usize].push((token as u32, weight));
            }
        }

        let mut out = Tensor::zeros((tokens, hidden), xs.dtype(), xs.device())?;
        for (expert, assignments) in per_expert.iter().enumerate() {
            if assignments.is_empty() {
                continue;
            }
            let token_ids: Vec<u32> = assignments.iter().map(|(t, _)| *t).collect();
            let expert_weights: Vec<f32> = assignments.iter().map(|(_, w)| *w).collect();
            let n = token_ids.len();

            let token_ids = Tensor::from_vec(token_ids, n, xs.device())?;
            let xs_e = xs.index_select(&token_ids, 0)?;

            let gate_up = xs_e.matmul(&self.gate_up.get(expert)?.t()?)?;
            let gate = gate_up.narrow(1, 0, self.intermediate_size)?;
            let up = gate_up.narrow(1, self.intermediate_size, self.intermediate_size)?;
            let act = (candle_nn::ops::silu(&gate)? * up)?;
            let ys = act.matmul(&self.down.get(expert)?.t()?)?;

            let scale = Tensor::from_vec(expert_weights, (n, 1), xs.device())?
                .to_dtype(xs.dtype())?;
            out = out.index_add(&token_ids, &ys.broadcast_mul(&scale)?, 0)?;
        }
        Ok(out)
    }
}

/// Gate + routed experts + optional shared-expert MLP.
#[derive(Debug)]
pub struct MoeLayer {
    gate: MoeGate,
    experts: RoutedExperts,
    shared_experts: Option<SwiGluMlp>,
}

impl MoeLayer {
    pub fn new(cfg: &DeepSeekConfig, vb: VarBuilder) -> Result<Self> {
        let gate = MoeGate::new(cfg, vb.pp("gate"))?;
        let experts = RoutedExperts::new(cfg, vb.pp("experts"))?;
        let shared_experts = match cfg.n_shared_experts {
            None => None,
            Some(n) => Some(SwiGluMlp::new(
                cfg.hidden_size,
                cfg.moe_intermediate_size * n,
                vb.pp("shared_experts"),
            )?),
        };
        Ok(Self {
            gate,
            experts,
            shared_experts,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, h) = xs.dims3()?;
        let flat = xs.reshape((b * t, h))?;
        let (weights, indices) = self.gate.forward(&flat)?;
        let mut out = self.experts.forward(&flat, &weights, &indices)?;
        if let Some(shared) = &self.shared_experts {
            out = (out + shared.forward(&flat)?)?;
        }
        out.reshape((b, t, h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn moe_config() -> DeepSeekConfig {
        serde_json::from_value(serde_json::json!({
            "architectures": ["DeepseekV2ForCausalLM"],
            "vocab_size": 128,
            "hidden_size": 16,
            "intermediate_size": 32,
            "moe_intermediate_size": 8,
            "num_hidden_layers": 2,
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
            "norm_topk_prob": true
        }))
        .unwrap()
    }

    #[test]
    fn test_moe_layer_forward_shape() {
        let device = Device::Cpu;
        let cfg = moe_config();
        let vb = VarBuilder::zeros(DType::F32, &device);
        let layer = MoeLayer::new(&cfg, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 16), &device).unwrap();
        let out = layer.forward(&xs).unwrap();
        assert_eq!(out.dims(), &[2, 3, 16]);
    }

    #[test]
    fn test_routed_experts_weighted_combination() {
        let device = Device::Cpu;
        let num_experts = 2;
        let hidden = 4;
        let inter = 3;

        let gate_up =
            Tensor::randn(0f32, 0.5, (num_experts, 2 * inter, hidden), &device).unwrap();
        let down = Tensor::randn(0f32, 0.5, (num_experts, hidden, inter), &device).unwrap();
        let experts = RoutedExperts {
            gate_up: gate_up.clone(),
            down: down.clone(),
            num_experts,
            intermediate_size: inter,
        };

        let xs = Tensor::randn(0f32, 1.0, (2, hidden), &device).unwrap();
        // Token 0 → expert 0 at 0.25, token 1 → expert 1 at 1.0.
        let weights = Tensor::from_vec(vec![0.25f32, 1.0], (2, 1), &device).unwrap();
        let indices = Tensor::from_vec(vec![0u32, 1], (2, 1), &device).unwrap();
        let out = experts.forward(&xs, &weights, &indices).unwrap();

        let reference = |token: usize, expert: usize, scale: f32| -> Vec<f32> {
            let x = xs.narrow(0, token, 1).unwrap();
            let gu = x.matmul(&gate_up.get(expert).unwrap().t().unwrap()).unwrap();
            let g = gu.narrow(1, 0, inter).unwrap();
            let u = gu.narrow(1, inter, inter).unwrap();
            let act = (candle_nn::ops::silu(&g).unwrap() * u).unwrap();
            let y = act.matmul(&down.get(expert).unwrap().t().unwrap()).unwrap();
            (y * scale as f64)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };

        let got = out.to_vec2::<f32>().unwrap();
        for (g, e) in got[0].iter().zip(reference(0, 0, 0.25).iter()) {
            assert!((g - e).abs() < 1e-5);
        }
        for (g, e) in got[1].iter().zip(reference(1, 1, 1.0).iter()) {
            assert!((g - e).abs() < 1e-5);
        }
    }

    #[test]
    fn test_unrouted_expert_is_skipped() {
        let device = Device::Cpu;
        let experts = RoutedExperts {
            gate_up: Tensor::randn(0f32, 0.5, (3, 4, 4), &device).unwrap(),
            down: Tensor::randn(0f32, 0.5, (3, 4, 2), &device).unwrap(),
            num_experts: 3,
            intermediate_size: 2,
        };
        let xs = Tensor::randn(0f32, 1.0, (1, 4), &device).unwrap();
        // Only expert 2 receives the token; experts 0 and 1 never run.
        let weights = Tensor::from_vec(vec![1.0f32], (1, 1), &device).unwrap();
        let indices = Tensor::from_vec(vec![2u32], (1, 1), &device).unwrap();
        let out = experts.forward(&xs, &weights, &indices).unwrap();
        assert_eq!(out.dims(), &[1, 4]);
    }
}
