//! Checkpoint weight re-layout.
//!
//! HuggingFace DeepSeek checkpoints are stored for the reference attention
//! path; the runtime wants a different layout. The remapper consumes
//! `(name, tensor)` pairs in arbitrary order and produces the runtime
//! tensor map:
//!
//! - rope projections are row-permuted from interleaved pairs to split
//!   halves (the layout `candle_nn::rotary_emb::rope` consumes),
//! - `kv_b_proj` is split into the absorbed `kc`/`vc` factors,
//! - block-quantized weights are joined with their scales and dequantized,
//! - per-expert shards are stacked into fused `gate_up`/`down` tensors and
//!   dense gate/up pairs are merged into `gate_up_proj`.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::Api;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DeepSeekConfig;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("quantized weight {0} has no matching scale")]
    MissingScale(String),
    #[error("scale {0} has no matching weight")]
    MissingWeight(String),
    #[error("incomplete expert stack under {prefix}: {missing} of {expected} shards missing")]
    IncompleteExperts {
        prefix: String,
        missing: usize,
        expected: usize,
    },
    #[error("unpaired gate/up projection under {0}")]
    UnpairedGateUp(String),
    #[error("weight {name} has {rows} rows, not a multiple of head dim {head_dim}")]
    BadRowCount {
        name: String,
        rows: usize,
        head_dim: usize,
    },
    #[error("block shape mismatch: weight {weight:?} vs scale {scale:?}")]
    BlockShapeMismatch {
        weight: Vec<usize>,
        scale: Vec<usize>,
    },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Row permutation taking per-head interleaved rope pairs
/// `(a0, b0, a1, b1, …)` to split halves `(a0, a1, …, b0, b1, …)`.
/// Rows before `pe_offset` in each head block are untouched.
pub fn rope_permutation(rows: usize, head_dim: usize, pe_offset: usize) -> Vec<u32> {
    let pe = head_dim - pe_offset;
    let half = pe / 2;
    let mut perm = Vec::with_capacity(rows);
    for base in (0..rows).step_by(head_dim) {
        for d in 0..pe_offset {
            perm.push((base + d) as u32);
        }
        for d in 0..pe {
            let (s, t) = (d / half, d % half);
            perm.push((base + pe_offset + t * 2 + s) as u32);
        }
    }
    perm
}

/// Exact inverse of [`rope_permutation`].
pub fn inverse_rope_permutation(rows: usize, head_dim: usize, pe_offset: usize) -> Vec<u32> {
    let pe = head_dim - pe_offset;
    let half = pe / 2;
    let mut perm = Vec::with_capacity(rows);
    for base in (0..rows).step_by(head_dim) {
        for d in 0..pe_offset {
            perm.push((base + d) as u32);
        }
        for d in 0..pe {
            let (t, s) = (d / 2, d % 2);
            perm.push((base + pe_offset + s * half + t) as u32);
        }
    }
    perm
}

fn permute_rows(name: &str, weight: &Tensor, head_dim: usize, pe_offset: usize) -> Result<Tensor, LoadError> {
    let rows = weight.dim(0)?;
    if rows % head_dim != 0 {
        return Err(LoadError::BadRowCount {
            name: name.to_string(),
            rows,
            head_dim,
        });
    }
    let perm = rope_permutation(rows, head_dim, pe_offset);
    let perm = Tensor::from_vec(perm, rows, weight.device())?;
    Ok(weight.index_select(&perm, 0)?)
}

/// Split `kv_b_proj (num_heads·(nope+v), rank)` into the absorbed factors
/// `kc (num_heads, nope, rank)` and `vc (num_heads, rank, v)`.
pub fn split_kv_b(
    weight: &Tensor,
    num_heads: usize,
    qk_nope_head_dim: usize,
    v_head_dim: usize,
) -> Result<(Tensor, Tensor), LoadError> {
    let rank = weight.dim(1)?;
    let per_head = qk_nope_head_dim + v_head_dim;
    let weight = weight.reshape((num_heads, per_head, rank))?;
    let kc = weight.narrow(1, 0, qk_nope_head_dim)?.contiguous()?;
    let vc = weight
        .narrow(1, qk_nope_head_dim, v_head_dim)?
        .transpose(1, 2)?
        .contiguous()?;
    Ok((kc, vc))
}

/// Expand a block-quantized weight with its per-block scales. Block sizes
/// are inferred from the two shapes.
pub fn dequantize_blockwise(
    weight: &Tensor,
    scale: &Tensor,
    target: DType,
) -> Result<Tensor, LoadError> {
    let (w0, w1) = weight.dims2()?;
    let (s0, s1) = scale.dims2()?;
    if s0 == 0 || s1 == 0 || w0 % s0 != 0 || w1 % s1 != 0 {
        return Err(LoadError::BlockShapeMismatch {
            weight: weight.dims().to_vec(),
            scale: scale.dims().to_vec(),
        });
    }
    let (g0, g1) = (w0 / s0, w1 / s1);
    let weight = weight.to_dtype(DType::F32)?.reshape((s0, g0, s1, g1))?;
    let scale = scale.to_dtype(DType::F32)?.reshape((s0, 1, s1, 1))?;
    Ok(weight
        .broadcast_mul(&scale)?
        .reshape((w0, w1))?
        .to_dtype(target)?)
}

const QUANTIZED_PROJ_SUFFIXES: &[&str] = &[
    "q_proj",
    "q_a_proj",
    "q_b_proj",
    "kv_a_proj_with_mqa",
    "kv_b_proj",
    "o_proj",
    "gate_proj",
    "up_proj",
    "down_proj",
];

#[derive(Default)]
struct PendingQuant {
    weight: Option<Tensor>,
    scale: Option<Tensor>,
}

struct PendingExperts {
    gate: Vec<Option<Tensor>>,
    up: Vec<Option<Tensor>>,
    down: Vec<Option<Tensor>>,
}

#[derive(Default)]
struct PendingGateUp {
    gate: Option<Tensor>,
    up: Option<Tensor>,
}

/// Streaming name/tensor remapper. Feed every checkpoint tensor through
/// [`add`](Self::add) in any order, then call [`finish`](Self::finish).
pub struct CheckpointRemapper {
    num_hidden_layers: usize,
    num_heads: usize,
    q_head_dim: usize,
    qk_nope_head_dim: usize,
    qk_rope_head_dim: usize,
    kv_lora_rank: usize,
    v_head_dim: usize,
    n_routed_experts: usize,
    tie_word_embeddings: bool,
    block_quantized: bool,
    dtype: DType,
    out: HashMap<String, Tensor>,
    pending_quant: HashMap<String, PendingQuant>,
    pending_experts: HashMap<String, PendingExperts>,
    pending_gate_up: HashMap<String, PendingGateUp>,
}

impl CheckpointRemapper {
    pub fn new(cfg: &DeepSeekConfig, dtype: DType) -> Self {
        let block_quantized = cfg
            .quantization_config
            .as_ref()
            .is_some_and(|q| q.weight_block_size.is_some());
        Self {
            num_hidden_layers: cfg.num_hidden_layers,
            num_heads: cfg.num_attention_heads,
            q_head_dim: cfg.q_head_dim(),
            qk_nope_head_dim: cfg.qk_nope_head_dim,
            qk_rope_head_dim: cfg.qk_rope_head_dim,
            kv_lora_rank: cfg.kv_lora_rank,
            v_head_dim: cfg.v_head_dim,
            n_routed_experts: cfg.n_routed_experts.unwrap_or(0),
            tie_word_embeddings: cfg.tie_word_embeddings,
            block_quantized,
            dtype,
            out: HashMap::new(),
            pending_quant: HashMap::new(),
            pending_experts: HashMap::new(),
            pending_gate_up: HashMap::new(),
        }
    }

    pub fn add(&mut self, name: &str, tensor: Tensor) -> Result<(), LoadError> {
        if self.is_skipped(name) {
            debug!(name, "skipping checkpoint tensor");
            return Ok(());
        }
        // Some exporters use `.weight_scale_inv` for the same quantity.
        let name = if let Some(stem) = name.strip_suffix(".weight_scale_inv") {
            format!("{stem}.scale")
        } else {
            name.to_string()
        };

        if self.block_quantized {
            if let Some(stem) = name.strip_suffix(".scale") {
                if self.is_quantized_proj(stem) {
                    return self.add_quant_half(stem.to_string(), None, Some(tensor));
                }
            }
            if let Some(stem) = name.strip_suffix(".weight") {
                if self.is_quantized_proj(stem) {
                    return self.add_quant_half(stem.to_string(), Some(tensor), None);
                }
            }
        }
        self.route(&name, tensor)
    }

    pub fn finish(mut self) -> Result<HashMap<String, Tensor>, LoadError> {
        if let Some((stem, pending)) = self.pending_quant.iter().next() {
            return Err(if pending.weight.is_some() {
                LoadError::MissingScale(format!("{stem}.weight"))
            } else {
                LoadError::MissingWeight(format!("{stem}.scale"))
            });
        }
        if let Some((prefix, slots)) = self.pending_experts.iter().next() {
            let expected = 3 * self.n_routed_experts;
            let present = slots.gate.iter().flatten().count()
                + slots.up.iter().flatten().count()
                + slots.down.iter().flatten().count();
            return Err(LoadError::IncompleteExperts {
                prefix: prefix.clone(),
                missing: expected - present,
                expected,
            });
        }
        if let Some(prefix) = self.pending_gate_up.keys().next() {
            return Err(LoadError::UnpairedGateUp(prefix.clone()));
        }
        Ok(std::mem::take(&mut self.out))
    }

    fn is_skipped(&self, name: &str) -> bool {
        if name.contains("rotary_emb.inv_freq")
            || name.contains("rotary_emb.cos_cached")
            || name.contains("rotary_emb.sin_cached")
        {
            return true;
        }
        // Next-n prediction layers sit past num_hidden_layers.
        if let Some(rest) = name.strip_prefix("model.layers.") {
            if let Some(idx) = rest.split('.').next().and_then(|s| s.parse::<usize>().ok()) {
                if idx >= self.num_hidden_layers {
                    return true;
                }
            }
        }
        if self.tie_word_embeddings && name == "lm_head.weight" {
            return true;
        }
        false
    }

    fn is_quantized_proj(&self, stem: &str) -> bool {
        QUANTIZED_PROJ_SUFFIXES
            .iter()
            .any(|suffix| stem.ends_with(suffix))
    }

    /// Buffer one half of a quantized pair; dequantize exactly once when
    /// both halves are present, whichever arrived first.
    fn add_quant_half(
        &mut self,
        stem: String,
        weight: Option<Tensor>,
        scale: Option<Tensor>,
    ) -> Result<(), LoadError> {
        let pending = self.pending_quant.entry(stem.clone()).or_default();
        if let Some(w) = weight {
            pending.weight = Some(w);
        }
        if let Some(s) = scale {
            pending.scale = Some(s);
        }
        if pending.weight.is_some() && pending.scale.is_some() {
            let pending = self.pending_quant.remove(&stem).unwrap();
            let dq = dequantize_blockwise(
                &pending.weight.unwrap(),
                &pending.scale.unwrap(),
                self.dtype,
            )?;
            debug!(name = %stem, "dequantized block-quantized weight");
            return self.route(&format!("{stem}.weight"), dq);
        }
        Ok(())
    }

    fn route(&mut self, name: &str, tensor: Tensor) -> Result<(), LoadError> {
        let tensor = if tensor.dtype().is_float() && tensor.dtype() != self.dtype {
            tensor.to_dtype(self.dtype)?
        } else {
            tensor
        };

        // Per-expert shards accumulate into the fused stacks.
        if let Some((prefix, expert, proj)) = parse_expert_name(name) {
            return self.add_expert_shard(prefix, expert, proj, tensor);
        }

        if name.ends_with("q_proj.weight") || name.ends_with("q_b_proj.weight") {
            let permuted = permute_rows(name, &tensor, self.q_head_dim, self.qk_nope_head_dim)?;
            self.out.insert(name.to_string(), permuted);
            return Ok(());
        }
        if name.ends_with("kv_a_proj_with_mqa.weight") {
            let head_dim = self.kv_lora_rank + self.qk_rope_head_dim;
            let permuted = permute_rows(name, &tensor, head_dim, self.kv_lora_rank)?;
            self.out.insert(name.to_string(), permuted);
            return Ok(());
        }
        if let Some(prefix) = name.strip_suffix(".kv_b_proj.weight") {
            let (kc, vc) =
                split_kv_b(&tensor, self.num_heads, self.qk_nope_head_dim, self.v_head_dim)?;
            self.out.insert(format!("{prefix}.kc"), kc);
            self.out.insert(format!("{prefix}.vc"), vc);
            return Ok(());
        }

        // Dense and shared-expert MLPs fuse gate/up into one projection.
        if let Some(prefix) = name.strip_suffix(".gate_proj.weight") {
            return self.add_gate_up_half(prefix.to_string(), Some(tensor), None);
        }
        if let Some(prefix) = name.strip_suffix(".up_proj.weight") {
            return self.add_gate_up_half(prefix.to_string(), None, Some(tensor));
        }

        self.out.insert(name.to_string(), tensor);
        Ok(())
    }

    fn add_gate_up_half(
        &mut self,
        prefix: String,
        gate: Option<Tensor>,
        up: Option<Tensor>,
    ) -> Result<(), LoadError> {
        let pending = self.pending_gate_up.entry(prefix.clone()).or_default();
        if let Some(g) = gate {
            pending.gate = Some(g);
        }
        if let Some(u) = up {
            pending.up = Some(u);
        }
        if pending.gate.is_some() && pending.up.is_some() {
            let pending = self.pending_gate_up.remove(&prefix).unwrap();
            let fused = Tensor::cat(&[&pending.gate.unwrap(), &pending.up.unwrap()], 0)?;
            self.out.insert(format!("{prefix}.gate_up_proj.weight"), fused);
        }
        Ok(())
    }

    fn add_expert_shard(
        &mut self,
        prefix: String,
        expert: usize,
        proj: ExpertProj,
        tensor: Tensor,
    ) -> Result<(), LoadError> {
        let n = self.n_routed_experts;
        let slots = self
            .pending_experts
            .entry(prefix.clone())
            .or_insert_with(|| PendingExperts {
                gate: vec![None; n],
                up: vec![None; n],
                down: vec![None; n],
            });
        match proj {
            ExpertProj::Gate => slots.gate[expert] = Some(tensor),
            ExpertProj::Up => slots.up[expert] = Some(tensor),
            ExpertProj::Down => slots.down[expert] = Some(tensor),
        }
        let complete = slots.gate.iter().all(Option::is_some)
            && slots.up.iter().all(Option::is_some)
            && slots.down.iter().all(Option::is_some);
        if complete {
            let slots = self.pending_experts.remove(&prefix).unwrap();
            let mut gate_up = Vec::with_capacity(n);
            for (g, u) in slots.gate.iter().zip(slots.up.iter()) {
                gate_up.push(Tensor::cat(&[g.as_ref().unwrap(), u.as_ref().unwrap()], 0)?);
            }
            let gate_up = Tensor::stack(&gate_up, 0)?;
            let down: Vec<Tensor> = slots.down.into_iter().map(Option::unwrap).collect();
            let down = Tensor::stack(&down, 0)?;
            self.out.insert(format!("{prefix}.gate_up"), gate_up);
            self.out.insert(format!("{prefix}.down"), down);
        }
        Ok(())
    }
}

enum ExpertProj {
    Gate,
    Up,
    Down,
}

/// Parse `…mlp.experts.{e}.{gate,up,down}_proj.weight` into its parts.
fn parse_expert_name(name: &str) -> Option<(String, usize, ExpertProj)> {
    let marker = ".experts.";
    let pos = name.find(marker)?;
    let prefix = &name[..pos + marker.len() - 1];
    let rest = &name[pos + marker.len()..];
    let mut parts = rest.split('.');
    let expert: usize = parts.next()?.parse().ok()?;
    let proj = match parts.next()? {
        "gate_proj" => ExpertProj::Gate,
        "up_proj" => ExpertProj::Up,
        "down_proj" => ExpertProj::Down,
        _ => return None,
    };
    if parts.next()? != "weight" {
        return None;
    }
    Some((prefix.to_string(), expert, proj))
}

/// Run every tensor in the given safetensors shards through the remapper.
pub fn load_checkpoint(
    cfg: &DeepSeekConfig,
    shards: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<HashMap<String, Tensor>, LoadError> {
    let mut remapper = CheckpointRemapper::new(cfg, dtype);
    for shard in shards {
        let tensors = candle_core::safetensors::load(shard, device)?;
        info!(shard = %shard.display(), tensors = tensors.len(), "loading shard");
        for (name, tensor) in tensors {
            remapper.add(&name, tensor)?;
        }
    }
    let out = remapper.finish()?;
    info!(tensors = out.len(), "checkpoint re-layout complete");
    Ok(out)
}

/// Paths for a fetched model snapshot.
pub struct ModelPaths {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
}

/// Sort key that orders `model-00002-of-00163` before `model-00010-of-00163`.
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let mut key = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            let mut num = String::new();
            while let Some(&c) = chars.peek() {
                if !c.is_ascii_digit() {
                    break;
                }
                num.push(c);
                chars.next();
            }
            key.push(Ok(num.parse().unwrap_or(u64::MAX)));
        } else {
            let mut text = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() {
                    break;
                }
                text.push(c);
                chars.next();
            }
            key.push(Err(text));
        }
    }
    key
}

/// Fetch a model from the HuggingFace hub: `config.json` plus all
/// safetensors shards, shards in natural order.
pub fn fetch_model(model_id: &str) -> anyhow::Result<ModelPaths> {
    let api = Api::new()?;
    let repo = api.model(model_id.to_string());
    let config = repo.get("config.json")?;

    #[derive(Deserialize)]
    struct SafetensorsIndex {
        weight_map: HashMap<String, String>,
    }

    let mut shard_names: Vec<String> = match repo.get("model.safetensors.index.json") {
        Ok(index_path) => {
            let index: SafetensorsIndex =
                serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
            let mut names: Vec<String> = index.weight_map.into_values().collect();
            names.sort();
            names.dedup();
            names
        }
        Err(_) => vec!["model.safetensors".to_string()],
    };
    shard_names.sort_by_key(|name| natural_sort_key(name));

    info!(model_id, shards = shard_names.len(), "fetching model");
    let mut weights = Vec::with_capacity(shard_names.len());
    for name in &shard_names {
        weights.push(repo.get(name)?);
    }
    Ok(ModelPaths { config, weights })
}
