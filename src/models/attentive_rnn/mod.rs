//! Recurrent text encoder with context-attention pooling.

mod model;
pub use model::{AttentiveRnn, AttentiveRnnConfig, AttentiveRnnError};
