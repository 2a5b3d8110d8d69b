//! Attention modules.

mod context;
pub use context::{ContextAttention, ContextAttentionConfig, ContextAttentionError};

mod multi_head;
pub use multi_head::{
    MultiHeadSelfAttention, MultiHeadSelfAttentionConfig, MultiHeadSelfAttentionError,
};
