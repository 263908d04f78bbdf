//! Model configuration for the DeepSeek V2/V3 family.
//!
//! Deserialized directly from a HuggingFace `config.json`. Routing and
//! scoring policies are typed enums, so a checkpoint requesting an
//! unsupported `topk_method` or `scoring_func` fails at parse time instead
//! of silently falling back to a default.

use serde::Deserialize;
use thiserror::Error;

use crate::layers::rotary::yarn_get_mscale;

fn default_routed_scaling_factor() -> f64 {
    1.0
}
fn default_moe_layer_freq() -> usize {
    1
}
fn default_num_experts_per_tok() -> usize {
    1
}
fn default_n_group() -> usize {
    1
}
fn default_topk_group() -> usize {
    1
}

/// Expert selection policy for the MoE gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TopkMethod {
    /// Plain softmax top-k over all experts.
    #[serde(rename = "greedy")]
    Greedy,
    /// Keep the `topk_group` groups with the highest max score, then top-k
    /// over the surviving experts.
    #[serde(rename = "group_limited_greedy")]
    GroupLimitedGreedy,
    /// Bias-corrected selection (DeepSeek V3): group score is the sum of the
    /// group's top-2 corrected scores; returned weights are uncorrected.
    #[serde(rename = "noaux_tc")]
    NoAuxTc,
}

/// Score transform applied to router logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ScoringFunc {
    #[serde(rename = "softmax")]
    Softmax,
    #[serde(rename = "sigmoid")]
    Sigmoid,
}

impl Default for TopkMethod {
    fn default() -> Self {
        Self::Greedy
    }
}

impl Default for ScoringFunc {
    fn default() -> Self {
        Self::Softmax
    }
}

/// RoPE scaling, tagged by the checkpoint's `rope_scaling.type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RopeScaling {
    #[serde(rename = "yarn")]
    Yarn {
        factor: f32,
        original_max_position_embeddings: usize,
        #[serde(default = "default_beta_fast")]
        beta_fast: f32,
        #[serde(default = "default_beta_slow")]
        beta_slow: f32,
        #[serde(default = "default_mscale")]
        mscale: f32,
        #[serde(default)]
        mscale_all_dim: f32,
    },
}

fn default_beta_fast() -> f32 {
    32.0
}
fn default_beta_slow() -> f32 {
    1.0
}
fn default_mscale() -> f32 {
    1.0
}

/// Checkpoint quantization descriptor. Only the fields the load-time
/// dequantizer needs are typed; the rest of the map is kept for diagnostics.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantizationConfig {
    pub quant_method: String,
    #[serde(default)]
    pub weight_block_size: Option<[usize; 2]>,
    #[serde(flatten)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeepSeekConfig {
    pub architectures: Vec<String>,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    #[serde(default)]
    pub moe_intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f32,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,

    // MLA dimensions
    #[serde(default)]
    pub q_lora_rank: Option<usize>,
    pub kv_lora_rank: usize,
    pub qk_nope_head_dim: usize,
    pub qk_rope_head_dim: usize,
    pub v_head_dim: usize,

    // MoE
    #[serde(default)]
    pub n_routed_experts: Option<usize>,
    #[serde(default)]
    pub n_shared_experts: Option<usize>,
    #[serde(default = "default_num_experts_per_tok")]
    pub num_experts_per_tok: usize,
    #[serde(default)]
    pub topk_method: TopkMethod,
    #[serde(default)]
    pub scoring_func: ScoringFunc,
    #[serde(default = "default_n_group")]
    pub n_group: usize,
    #[serde(default = "default_topk_group")]
    pub topk_group: usize,
    #[serde(default)]
    pub norm_topk_prob: bool,
    #[serde(default = "default_routed_scaling_factor")]
    pub routed_scaling_factor: f64,
    #[serde(default)]
    pub first_k_dense_replace: usize,
    #[serde(default = "default_moe_layer_freq")]
    pub moe_layer_freq: usize,
    #[serde(default)]
    pub num_nextn_predict_layers: usize,

    #[serde(default)]
    pub quantization_config: Option<QuantizationConfig>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("n_routed_experts ({experts}) must be divisible by n_group ({groups})")]
    ExpertsNotDivisibleByGroups { experts: usize, groups: usize },
    #[error("topk_group ({topk_group}) exceeds n_group ({n_group})")]
    TopkGroupTooLarge { topk_group: usize, n_group: usize },
    #[error("num_experts_per_tok ({top_k}) exceeds n_routed_experts ({experts})")]
    TopKTooLarge { top_k: usize, experts: usize },
    #[error("n_group must be non-zero when routed experts are configured")]
    ZeroGroups,
    #[error(
        "num_experts_per_tok ({top_k}) cannot fit in {topk_group} groups of {group_size} experts"
    )]
    TopKExceedsSelectedGroups {
        top_k: usize,
        topk_group: usize,
        group_size: usize,
    },
}

impl DeepSeekConfig {
    /// Total per-head query dimension (non-positional + positional parts).
    pub fn q_head_dim(&self) -> usize {
        self.qk_nope_head_dim + self.qk_rope_head_dim
    }

    /// Width of one cached latent entry: compressed KV plus the rope key.
    pub fn kv_cache_dim(&self) -> usize {
        self.kv_lora_rank + self.qk_rope_head_dim
    }

    /// Attention softmax scale with the YaRN mscale correction folded in.
    pub fn softmax_scale(&self) -> f64 {
        let mut scale = 1.0 / (self.q_head_dim() as f32).sqrt();
        if let Some(RopeScaling::Yarn {
            factor,
            mscale_all_dim,
            ..
        }) = self.rope_scaling
        {
            if mscale_all_dim != 0.0 {
                let mscale = yarn_get_mscale(factor, mscale_all_dim);
                scale = scale * mscale * mscale;
            }
        }
        scale as f64
    }

    /// Whether layer `idx` carries a MoE FFN instead of a dense MLP.
    pub fn is_moe_layer(&self, idx: usize) -> bool {
        self.n_routed_experts.is_some()
            && idx >= self.first_k_dense_replace
            && idx % self.moe_layer_freq == 0
    }

    /// Whether top-k weights are renormalized. Never under `noaux_tc`,
    /// which always takes the `routed_scaling_factor` path.
    pub fn renormalize(&self) -> bool {
        self.num_experts_per_tok > 1
            && self.norm_topk_prob
            && self.topk_method != TopkMethod::NoAuxTc
    }

    /// Reject configurations the gate cannot honor. Unsupported policy
    /// *names* are already rejected by serde; this checks the arithmetic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(experts) = self.n_routed_experts else {
            return Ok(());
        };
        let top_k = self.num_experts_per_tok;
        if top_k > experts {
            return Err(ConfigError::TopKTooLarge { top_k, experts });
        }
        if matches!(
            self.topk_method,
            TopkMethod::GroupLimitedGreedy | TopkMethod::NoAuxTc
        ) {
            if self.n_group == 0 {
                return Err(ConfigError::ZeroGroups);
            }
            if experts % self.n_group != 0 {
                return Err(ConfigError::ExpertsNotDivisibleByGroups {
                    experts,
                    groups: self.n_group,
                });
            }
            if self.topk_group > self.n_group {
                return Err(ConfigError::TopkGroupTooLarge {
                    topk_group: self.topk_group,
                    n_group: self.n_group,
                });
            }
            let group_size = experts / self.n_group;
            if top_k > self.topk_group * group_size {
                return Err(ConfigError::TopKExceedsSelectedGroups {
                    top_k,
                    topk_group: self.topk_group,
                    group_size,
                });
            }
        }
        Ok(())
    }
}
