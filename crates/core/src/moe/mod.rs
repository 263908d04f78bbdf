//! Mixture-of-experts feed-forward.
//!
//! - [`gate`]: expert selection (greedy, group-limited, bias-corrected).
//! - [`experts`]: routed expert execution over fused stacked weights plus
//!   the optional shared-expert MLP.

pub mod experts;
pub mod gate;

pub use experts::{MoeLayer, RoutedExperts};
pub use gate::MoeGate;
