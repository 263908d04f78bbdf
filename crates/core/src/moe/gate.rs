//! Expert selection for MoE layers.
//!
//! Three policies: plain softmax top-k, group-limited top-k, and the
//! bias-corrected `noaux_tc` selection used by DeepSeek V3. The router
//! matmul runs on-device in f32; selection itself runs on host vectors so
//! ordering is deterministic on every backend (stable by descending score,
//! ascending index).

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::{DeepSeekConfig, ScoringFunc, TopkMethod};

#[derive(Debug)]
pub struct MoeGate {
    weight: Tensor,
    e_score_correction_bias: Option<Vec<f32>>,
    num_experts: usize,
    top_k: usize,
    n_group: usize,
    topk_group: usize,
    topk_method: TopkMethod,
    scoring_func: ScoringFunc,
    renormalize: bool,
    routed_scaling_factor: f64,
}

impl MoeGate {
    pub fn new(cfg: &DeepSeekConfig, vb: VarBuilder) -> Result<Self> {
        let Some(num_experts) = cfg.n_routed_experts else {
            candle_core::bail!("gate requires n_routed_experts")
        };
        cfg.validate().map_err(candle_core::Error::wrap)?;

        let weight = vb
            .get((num_experts, cfg.hidden_size), "weight")?
            .to_dtype(DType::F32)?;
        // The corrected policy cannot run without its learned bias.
        let e_score_correction_bias = match cfg.topk_method {
            TopkMethod::NoAuxTc => Some(
                vb.get(num_experts, "e_score_correction_bias")?
                    .to_dtype(DType::F32)?
                    .to_vec1::<f32>()?,
            ),
            _ => None,
        };

        Ok(Self {
            weight,
            e_score_correction_bias,
            num_experts,
            top_k: cfg.num_experts_per_tok,
            n_group: cfg.n_group,
            topk_group: cfg.topk_group,
            topk_method: cfg.topk_method,
            scoring_func: cfg.scoring_func,
            renormalize: cfg.renormalize(),
            routed_scaling_factor: cfg.routed_scaling_factor,
        })
    }

    /// Route `[tokens, hidden]` states. Returns per-token routing weights
    /// (in the input dtype) and expert indices, both `[tokens, top_k]`.
    pub fn forward(&self, hidden: &Tensor) -> Result<(Tensor, Tensor)> {
        let (tokens, _) = hidden.dims2()?;
        let logits = hidden
            .to_dtype(DType::F32)?
            .matmul(&self.weight.t()?)?
            .to_vec2::<f32>()?;

        let mut all_weights = Vec::with_capacity(tokens * self.top_k);
        let mut all_indices = Vec::with_capacity(tokens * self.top_k);
        for row in &logits {
            let (weights, indices) = self.select(row);
            all_weights.extend(weights);
            all_indices.extend(indices.into_iter().map(|i| i as u32));
        }

        let device = hidden.device();
        let weights = Tensor::from_vec(all_weights, (tokens, self.top_k), device)?
            .to_dtype(hidden.dtype())?;
        let indices = Tensor::from_vec(all_indices, (tokens, self.top_k), device)?;
        Ok((weights, indices))
    }

    fn select(&self, logits: &[f32]) -> (Vec<f32>, Vec<usize>) {
        let (indices, mut weights) = match self.topk_method {
            TopkMethod::Greedy => {
                let scores = softmax(logits);
                let indices = top_k_stable(&scores, self.top_k);
                let weights: Vec<f32> = indices.iter().map(|&i| scores[i]).collect();
                (indices, weights)
            }
            TopkMethod::GroupLimitedGreedy => {
                // Group score is the group's max logit; losing groups are
                // pushed to -inf before the softmax so they can never win
                // the top-k, whatever the sign of the surviving logits.
                let kept = self.keep_groups(logits, |group| {
                    group.iter().copied().fold(f32::NEG_INFINITY, f32::max)
                });
                let masked: Vec<f32> = logits
                    .iter()
                    .enumerate()
                    .map(|(i, &l)| if kept[i] { l } else { f32::NEG_INFINITY })
                    .collect();
                let scores = softmax(&masked);
                let indices = top_k_stable(&scores, self.top_k);
                let weights = indices.iter().map(|&i| scores[i]).collect();
                (indices, weights)
            }
            TopkMethod::NoAuxTc => {
                let scores = match self.scoring_func {
                    ScoringFunc::Softmax => softmax(logits),
                    ScoringFunc::Sigmoid => logits.iter().map(|&l| sigmoid(l)).collect(),
                };
                let bias = self
                    .e_score_correction_bias
                    .as_ref()
                    .expect("noaux_tc gate constructed without bias");
                let corrected: Vec<f32> = scores
                    .iter()
                    .zip(bias.iter())
                    .map(|(s, b)| s + b)
                    .collect();
                // Group score is the sum of the group's top-2 corrected
                // scores; selection runs on corrected scores, but the
                // returned weights are the uncorrected ones.
                let kept = self.keep_groups(&corrected, |group| {
                    let mut top = [f32::NEG_INFINITY; 2];
                    for &s in group {
                        if s > top[0] {
                            top[1] = top[0];
                            top[0] = s;
                        } else if s > top[1] {
                            top[1] = s;
                        }
                    }
                    top[0] + top[1]
                });
                let masked: Vec<f32> = corrected
                    .iter()
                    .enumerate()
                    .map(|(i, &s)| if kept[i] { s } else { f32::NEG_INFINITY })
                    .collect();
                let indices = top_k_stable(&masked, self.top_k);
                let weights = indices.iter().map(|&i| scores[i]).collect();
                (indices, weights)
            }
        };

        // Exactly one of the two scaling paths applies per token.
        if self.renormalize {
            let sum: f32 = weights.iter().sum();
            for w in &mut weights {
                *w /= sum + 1e-20;
            }
        } else {
            for w in &mut weights {
                *w *= self.routed_scaling_factor as f32;
            }
        }
        (weights, indices)
    }

    /// Expert-level keep mask after group-limited selection.
    fn keep_groups(&self, scores: &[f32], group_score: impl Fn(&[f32]) -> f32) -> Vec<bool> {
        let group_size = self.num_experts / self.n_group;
        let group_scores: Vec<f32> = scores
            .chunks(group_size)
            .map(|group| group_score(group))
            .collect();
        let winners = top_k_stable(&group_scores, self.topk_group);
        let mut kept = vec![false; self.num_experts];
        for g in winners {
            kept[g * group_size..(g + 1) * group_size].fill(true);
        }
        kept
    }
}

/// Indices of the `k` largest scores; ties break toward the lower index.
fn top_k_stable(scores: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    indices.truncate(k);
    indices
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
