pub mod config;
pub mod kv_cache;
pub mod layers;
pub mod models;
pub mod moe;
pub mod weights;

pub use config::DeepSeekConfig;
pub use kv_cache::LatentCache;
pub use models::{from_config, DeepSeekForCausalLM, ModelError};
pub use weights::{fetch_model, load_checkpoint, CheckpointRemapper, LoadError};
