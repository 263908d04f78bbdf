pub mod mask;
pub mod mla;
pub mod mlp;
pub mod rotary;

pub use mask::causal_mask;
pub use mla::MlaAttention;
pub use mlp::SwiGluMlp;
pub use rotary::RotaryEmbedding;
