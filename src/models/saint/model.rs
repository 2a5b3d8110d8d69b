use candle_core::{IndexOp, ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::architectures::{BuildArchitecture, ModelComponent};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::embeddings::{
    TabularEmbeddings, TabularEmbeddingsConfig, TabularEmbeddingsError,
};
use crate::layers::head::{FeedForwardHead, FeedForwardHeadConfig, FeedForwardHeadError};
use crate::models::saint::encoder::{
    SaintAttention, SaintEncoder, SaintEncoderConfig, SaintEncoderError,
};

/// Name of the summary token column.
///
/// When the column index of the embeddings maps this name, the model
/// pools by taking the summary token rather than flattening all tokens.
pub const CLS_TOKEN: &str = "cls_token";

/// Errors for the SAINT model.
#[derive(Debug, Snafu)]
pub enum SaintError {
    #[snafu(display("Cannot build tabular embeddings"))]
    BuildEmbeddings { source: TabularEmbeddingsError },

    #[snafu(display("Cannot build feed-forward head"))]
    BuildHead { source: FeedForwardHeadError },

    #[snafu(display("Cannot embed tabular input"))]
    Embed { source: TabularEmbeddingsError },

    #[snafu(display("SAINT encoder error"))]
    Encoder { source: SaintEncoderError },

    #[snafu(display("Cannot apply feed-forward head"))]
    Head { source: candle_core::Error },

    #[snafu(display("Cannot pool the encoder output"))]
    Pooling { source: candle_core::Error },

    #[snafu(display("Summary token column must be at index 0, but is at index {index}"))]
    SummaryToken { index: usize },

    #[snafu(display("Cannot concatenate column tokens"))]
    Tokens { source: candle_core::Error },
}

/// SAINT model configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaintConfig {
    attn_dropout: f32,
    embeddings: TabularEmbeddingsConfig,
    ff_dropout: f32,
    input_dim: usize,
    mlp_activation: Activation,
    mlp_batchnorm: bool,
    mlp_batchnorm_last: bool,
    mlp_dropout: f32,
    mlp_hidden_dims: Option<Vec<usize>>,
    mlp_linear_first: bool,
    n_blocks: usize,
    n_heads: usize,
    transformer_activation: Activation,
    use_bias: bool,
}

impl SaintConfig {
    /// Dropout applied to the attention weights.
    ///
    /// Default: `0.1`
    pub fn attn_dropout(mut self, attn_dropout: f32) -> Self {
        self.attn_dropout = attn_dropout;
        self
    }

    /// Configuration of the tabular embeddings.
    ///
    /// The embedding width of this configuration is overridden by
    /// [`input_dim`].
    ///
    /// Default: `TabularEmbeddingsConfig::default()`
    ///
    /// [`input_dim`]: Self::input_dim
    pub fn embeddings(mut self, embeddings: TabularEmbeddingsConfig) -> Self {
        self.embeddings = embeddings;
        self
    }

    /// Dropout applied in the feed-forward sublayers.
    ///
    /// Default: `0.2`
    pub fn ff_dropout(mut self, ff_dropout: f32) -> Self {
        self.ff_dropout = ff_dropout;
        self
    }

    /// The model dimension, used as the width of the column tokens.
    ///
    /// Default: `32`
    pub fn input_dim(mut self, input_dim: usize) -> Self {
        self.input_dim = input_dim;
        self
    }

    /// Activation of the feed-forward head.
    ///
    /// Default: `Activation::Relu`
    pub fn mlp_activation(mut self, mlp_activation: Activation) -> Self {
        self.mlp_activation = mlp_activation;
        self
    }

    /// Apply batch normalization in the feed-forward head.
    ///
    /// Default: `false`
    pub fn mlp_batchnorm(mut self, mlp_batchnorm: bool) -> Self {
        self.mlp_batchnorm = mlp_batchnorm;
        self
    }

    /// Apply batch normalization to the last layer of the head as well.
    ///
    /// Default: `false`
    pub fn mlp_batchnorm_last(mut self, mlp_batchnorm_last: bool) -> Self {
        self.mlp_batchnorm_last = mlp_batchnorm_last;
        self
    }

    /// Dropout applied in the feed-forward head.
    ///
    /// Default: `0.1`
    pub fn mlp_dropout(mut self, mlp_dropout: f32) -> Self {
        self.mlp_dropout = mlp_dropout;
        self
    }

    /// Hidden widths of the feed-forward head.
    ///
    /// The head input width is derived from the encoder output and
    /// prepended automatically. When unset, the head defaults to
    /// `[4 * input, 2 * input]` where `input` is the derived width.
    ///
    /// Default: `None`
    pub fn mlp_hidden_dims(mut self, mlp_hidden_dims: Option<Vec<usize>>) -> Self {
        self.mlp_hidden_dims = mlp_hidden_dims;
        self
    }

    /// Ordering of the operations in the head's dense layers.
    ///
    /// Default: `true`
    pub fn mlp_linear_first(mut self, mlp_linear_first: bool) -> Self {
        self.mlp_linear_first = mlp_linear_first;
        self
    }

    /// Number of SAINT blocks.
    ///
    /// Default: `2`
    pub fn n_blocks(mut self, n_blocks: usize) -> Self {
        self.n_blocks = n_blocks;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `8`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Activation of the feed-forward sublayers in the encoder.
    ///
    /// Default: `Activation::Gelu`
    pub fn transformer_activation(mut self, transformer_activation: Activation) -> Self {
        self.transformer_activation = transformer_activation;
        self
    }

    /// Use bias in the attention projections.
    ///
    /// Default: `false`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build the model.
    pub fn build(&self, vb: VarBuilder) -> Result<Saint, SaintError> {
        let with_cls_token = match self.embeddings.column_index(CLS_TOKEN) {
            Some(0) => true,
            Some(index) => return SummaryTokenSnafu { index }.fail(),
            None => false,
        };

        let embeddings = self
            .embeddings
            .clone()
            .embedding_width(self.input_dim)
            .build(vb.push_prefix("embeddings"))
            .context(BuildEmbeddingsSnafu)?;

        let n_columns = self.embeddings.n_columns();
        let encoder = SaintEncoderConfig::default()
            .activation(self.transformer_activation)
            .attn_dropout(self.attn_dropout)
            .ff_dropout(self.ff_dropout)
            .hidden_width(self.input_dim)
            .n_blocks(self.n_blocks)
            .n_columns(n_columns)
            .n_heads(self.n_heads)
            .use_bias(self.use_bias)
            .build(vb.push_prefix("encoder"))
            .context(EncoderSnafu)?;

        let attn_output_dim = if with_cls_token {
            self.input_dim
        } else {
            n_columns * self.input_dim
        };
        let mlp_widths = match &self.mlp_hidden_dims {
            Some(dims) => {
                let mut widths = Vec::with_capacity(dims.len() + 1);
                widths.push(attn_output_dim);
                widths.extend_from_slice(dims);
                widths
            }
            None => vec![attn_output_dim, attn_output_dim * 4, attn_output_dim * 2],
        };
        let head = FeedForwardHeadConfig::default()
            .activation(self.mlp_activation)
            .batch_norm(self.mlp_batchnorm)
            .batch_norm_last(self.mlp_batchnorm_last)
            .dropout(self.mlp_dropout)
            .linear_first(self.mlp_linear_first)
            .widths(mlp_widths)
            .build(vb.push_prefix("mlp"))
            .context(BuildHeadSnafu)?;

        Ok(Saint {
            embeddings,
            encoder,
            head,
            with_cls_token,
        })
    }
}

impl Default for SaintConfig {
    fn default() -> Self {
        Self {
            attn_dropout: 0.1,
            embeddings: TabularEmbeddingsConfig::default(),
            ff_dropout: 0.2,
            input_dim: 32,
            mlp_activation: Activation::Relu,
            mlp_batchnorm: false,
            mlp_batchnorm_last: false,
            mlp_dropout: 0.1,
            mlp_hidden_dims: None,
            mlp_linear_first: true,
            n_blocks: 2,
            n_heads: 8,
            transformer_activation: Activation::Gelu,
            use_bias: false,
        }
    }
}

impl BuildArchitecture for SaintConfig {
    type Architecture = Saint;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        Ok(SaintConfig::build(self, vb)?)
    }
}

/// SAINT tabular model (_Somepalli et al., 2021_).
///
/// Embeds categorical and continuous columns into a token sequence,
/// refines the tokens with interleaved column and row self-attention,
/// and reduces the result to one vector per sample with a feed-forward
/// head.
///
/// * _Somepalli et al., 2021_: https://arxiv.org/abs/2106.01342
pub struct Saint {
    embeddings: TabularEmbeddings,
    encoder: SaintEncoder,
    head: FeedForwardHead,
    with_cls_token: bool,
}

impl Saint {
    /// Apply the model and return the attention weights of every block.
    ///
    /// * `input` - Dense input, one row per sample.
    ///   *Shape:* `(batch_size, n_columns)`
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: Output representations and per-block attention weights.
    /// *Shape:* `(batch_size, output_dim)`
    pub fn forward_with_attention(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Vec<SaintAttention>), SaintError> {
        let tokens = self
            .embeddings
            .forward(input, train)
            .context(EmbedSnafu)?
            .concat()
            .context(TokensSnafu)?;

        let (tokens, attention) = self.encoder.forward(&tokens, train).context(EncoderSnafu)?;

        let pooled = if self.with_cls_token {
            tokens.i((.., 0, ..)).context(PoolingSnafu)?
        } else {
            tokens.flatten_from(1).context(PoolingSnafu)?
        };

        let output = self.head.forward_t(&pooled, train).context(HeadSnafu)?;

        Ok((output, attention))
    }
}

impl ModelComponent for Saint {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        let (output, _) = self.forward_with_attention(input, train)?;
        Ok(output)
    }

    fn output_dim(&self) -> usize {
        self.head.output_dim()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{Device, Tensor};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::architectures::ModelComponent;
    use crate::layers::embeddings::TabularEmbeddingsConfig;
    use crate::util::tests::test_var_builder;

    use super::SaintConfig;

    fn sample_embeddings(with_cls_token: bool) -> TabularEmbeddingsConfig {
        let mut columns = Vec::new();
        if with_cls_token {
            columns.push("cls_token".to_string());
        }
        columns.extend(["a", "b", "c", "d", "e"].map(str::to_string));

        let column_idx: HashMap<String, usize> = columns
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, name)| (name, index))
            .collect();
        let cat_embed_input = columns[..columns.len() - 1]
            .iter()
            .map(|name| (name.clone(), 4))
            .collect();

        TabularEmbeddingsConfig::default()
            .column_idx(column_idx)
            .cat_embed_input(cat_embed_input)
            .continuous_cols(vec!["e".to_string()])
    }

    fn sample_input(n_columns: usize, device: &Device) -> Result<Tensor, Whatever> {
        let categorical = Tensor::rand(0f32, 1., (5, n_columns - 1), device)
            .and_then(|xs| (xs * 3.)?.round())
            .whatever_context("Cannot create categorical input")?;
        let continuous =
            Tensor::rand(0f32, 1., (5, 1), device).whatever_context("Cannot create continuous input")?;
        Tensor::cat(&[categorical, continuous], 1).whatever_context("Cannot concat input")
    }

    #[test]
    #[report]
    fn output_and_attention_have_documented_shapes() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let model = SaintConfig::default()
            .embeddings(sample_embeddings(false))
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build model".to_string()))?;

        let input = sample_input(5, &device)?;
        let (output, attention) = model
            .forward_with_attention(&input, false)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot apply model".to_string()))?;

        // 5 columns at width 32 flatten to 160, the default head
        // widens to 640 and narrows to 320.
        assert_eq!(model.output_dim(), 320);
        assert_eq!(output.dims(), &[5, 320]);

        assert_eq!(attention.len(), 2);
        for weights in &attention {
            assert_eq!(weights.column.dims(), &[5, 8, 5, 5]);
            assert_eq!(weights.row.dims(), &[1, 8, 5, 5]);
        }

        Ok(())
    }

    #[test]
    #[report]
    fn summary_token_pools_to_model_dimension() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let model = SaintConfig::default()
            .embeddings(sample_embeddings(true))
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build model".to_string()))?;

        let input = sample_input(6, &device)?;
        let output = model
            .forward_t(&input, false)
            .map_err(|e| Whatever::with_source(e, "Cannot apply model".to_string()))?;

        // The head input shrinks to the summary token width.
        assert_eq!(model.output_dim(), 64);
        assert_eq!(output.dims(), &[5, 64]);

        Ok(())
    }

    #[test]
    fn misplaced_summary_token_is_rejected() {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);

        let column_idx: HashMap<String, usize> = [("a".to_string(), 0), ("cls_token".to_string(), 1)]
            .into_iter()
            .collect();
        let embeddings = TabularEmbeddingsConfig::default()
            .column_idx(column_idx)
            .cat_embed_input(vec![("a".to_string(), 4), ("cls_token".to_string(), 1)]);

        assert!(SaintConfig::default().embeddings(embeddings).build(vb).is_err());
    }

    #[test]
    #[report]
    fn forward_is_deterministic_without_dropout() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let model = SaintConfig::default()
            .embeddings(sample_embeddings(false))
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build model".to_string()))?;

        let input = sample_input(5, &device)?;
        let first = model
            .forward_t(&input, false)
            .map_err(|e| Whatever::with_source(e, "Cannot apply model".to_string()))?
            .to_vec2::<f32>()
            .whatever_context("Cannot read output")?;
        let second = model
            .forward_t(&input, false)
            .map_err(|e| Whatever::with_source(e, "Cannot apply model".to_string()))?
            .to_vec2::<f32>()
            .whatever_context("Cannot read output")?;

        assert_eq!(first, second);

        Ok(())
    }
}
