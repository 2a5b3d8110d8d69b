//! Embedding composers.

mod tabular;
pub use tabular::{
    ContinuousNorm, TabularEmbeddings, TabularEmbeddingsConfig, TabularEmbeddingsError,
    TabularTokens,
};

mod word;
pub use word::{WordEmbeddings, WordEmbeddingsConfig, WordEmbeddingsError};
