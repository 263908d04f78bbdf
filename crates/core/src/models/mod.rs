pub mod deepseek;

pub use deepseek::DeepSeekForCausalLM;

use candle_nn::VarBuilder;
use thiserror::Error;

use crate::config::{ConfigError, DeepSeekConfig};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("model load error: {0}")]
    Load(#[from] candle_core::Error),
}

/// Extract the architecture identifier from config, returning an error on empty list.
fn get_arch(cfg: &DeepSeekConfig) -> Result<&str, ModelError> {
    cfg.architectures
        .first()
        .map(|s| s.as_str())
        .ok_or_else(|| ModelError::UnsupportedArchitecture("empty architectures list".into()))
}

/// Construct the appropriate model from `config.architectures[0]`.
pub fn from_config(cfg: &DeepSeekConfig, vb: VarBuilder) -> Result<DeepSeekForCausalLM, ModelError> {
    cfg.validate()?;
    let arch = get_arch(cfg)?;
    match arch {
        "DeepseekForCausalLM"
        | "DeepseekV2ForCausalLM"
        | "DeepseekV3ForCausalLM"
        | "DeepseekV32ForCausalLM" => Ok(DeepSeekForCausalLM::new(cfg, vb)?),
        other => Err(ModelError::UnsupportedArchitecture(other.into())),
    }
}
