use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::attention::{
    MultiHeadSelfAttention, MultiHeadSelfAttentionConfig, MultiHeadSelfAttentionError,
};
use crate::layers::build_module::BuildModule;
use crate::layers::feedforward::{
    PointwiseFeedForward, PointwiseFeedForwardConfig, PointwiseFeedForwardError,
};
use crate::layers::layer_norm::LayerNormConfig;

/// Errors for the SAINT encoder.
#[derive(Debug, Snafu)]
pub enum SaintEncoderError {
    #[snafu(display("Cannot apply self-attention"))]
    Attention { source: MultiHeadSelfAttentionError },

    #[snafu(display("Cannot build self-attention layer"))]
    BuildAttention { source: MultiHeadSelfAttentionError },

    #[snafu(display("Cannot build feed-forward layer"))]
    BuildFeedForward { source: PointwiseFeedForwardError },

    #[snafu(display("Cannot build layer norm"))]
    BuildNorm { source: BoxedError },

    #[snafu(display("Cannot apply feed-forward layer"))]
    FeedForward { source: candle_core::Error },

    #[snafu(display("Cannot reshape between the column and row passes"))]
    Reshape { source: candle_core::Error },

    #[snafu(display("Cannot apply residual connection"))]
    Residual { source: candle_core::Error },
}

/// SAINT encoder configuration.
#[derive(Clone, Debug)]
pub struct SaintEncoderConfig {
    activation: Activation,
    attn_dropout: f32,
    ff_dropout: f32,
    hidden_width: usize,
    n_blocks: usize,
    n_columns: usize,
    n_heads: usize,
    use_bias: bool,
}

impl SaintEncoderConfig {
    /// Activation used by the feed-forward sublayers.
    ///
    /// Default: `Activation::Gelu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Dropout applied to the attention weights.
    ///
    /// Default: `0.1`
    pub fn attn_dropout(mut self, attn_dropout: f32) -> Self {
        self.attn_dropout = attn_dropout;
        self
    }

    /// Dropout applied in the feed-forward sublayers.
    ///
    /// Default: `0.2`
    pub fn ff_dropout(mut self, ff_dropout: f32) -> Self {
        self.ff_dropout = ff_dropout;
        self
    }

    /// Width of the column token vectors.
    ///
    /// Default: `32`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Number of SAINT blocks.
    ///
    /// Default: `2`
    pub fn n_blocks(mut self, n_blocks: usize) -> Self {
        self.n_blocks = n_blocks;
        self
    }

    /// Number of column tokens per sample.
    ///
    /// The row attention pass attends over samples using the full
    /// per-sample representation, so its width depends on the number
    /// of columns.
    ///
    /// Default: `1`
    pub fn n_columns(mut self, n_columns: usize) -> Self {
        self.n_columns = n_columns;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `8`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Use bias in the attention projections.
    ///
    /// Default: `false`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build the encoder.
    pub fn build(&self, vb: VarBuilder) -> Result<SaintEncoder, SaintEncoderError> {
        let row_width = self.n_columns * self.hidden_width;

        let mut blocks = Vec::with_capacity(self.n_blocks);
        for n in 0..self.n_blocks {
            let vb = vb.push_prefix(format!("block_{n}"));
            blocks.push(SaintBlock {
                column: self.build_sublayers(self.hidden_width, vb.push_prefix("column"))?,
                row: self.build_sublayers(row_width, vb.push_prefix("row"))?,
            });
        }

        Ok(SaintEncoder { blocks })
    }

    fn build_sublayers(
        &self,
        width: usize,
        vb: VarBuilder,
    ) -> Result<TransformerSublayers, SaintEncoderError> {
        Ok(TransformerSublayers {
            attention: MultiHeadSelfAttentionConfig::default()
                .dropout(self.attn_dropout)
                .hidden_width(width)
                .n_heads(self.n_heads)
                .use_bias(self.use_bias)
                .build(vb.push_prefix("attention"))
                .context(BuildAttentionSnafu)?,
            attn_norm: LayerNormConfig::default()
                .size(width)
                .build(vb.push_prefix("attn_norm"))
                .context(BuildNormSnafu)?,
            ffn: PointwiseFeedForwardConfig::default()
                .activation(self.activation)
                .dropout(self.ff_dropout)
                .hidden_width(width)
                .intermediate_width(width * 4)
                .build(vb.push_prefix("ffn"))
                .context(BuildFeedForwardSnafu)?,
            ffn_norm: LayerNormConfig::default()
                .size(width)
                .build(vb.push_prefix("ffn_norm"))
                .context(BuildNormSnafu)?,
        })
    }
}

impl Default for SaintEncoderConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Gelu,
            attn_dropout: 0.1,
            ff_dropout: 0.2,
            hidden_width: 32,
            n_blocks: 2,
            n_columns: 1,
            n_heads: 8,
            use_bias: false,
        }
    }
}

/// Attention weights of one SAINT block.
#[derive(Clone, Debug)]
pub struct SaintAttention {
    /// Column attention weights.
    ///
    /// *Shape:* `(batch_size, heads, n_columns, n_columns)`
    pub column: Tensor,

    /// Row attention weights.
    ///
    /// *Shape:* `(1, heads, batch_size, batch_size)`
    pub row: Tensor,
}

/// Self-attention sublayer followed by a feed-forward sublayer, both
/// with a residual connection and layer normalization.
struct TransformerSublayers {
    attention: MultiHeadSelfAttention,
    attn_norm: Box<dyn ModuleT>,
    ffn: PointwiseFeedForward,
    ffn_norm: Box<dyn ModuleT>,
}

impl TransformerSublayers {
    fn forward(&self, input: &Tensor, train: bool) -> Result<(Tensor, Tensor), SaintEncoderError> {
        let (attn_output, weights) = self.attention.forward(input, train).context(AttentionSnafu)?;
        let xs = (input + attn_output)
            .and_then(|xs| self.attn_norm.forward_t(&xs, train))
            .context(ResidualSnafu)?;

        let ffn_output = self.ffn.forward_t(&xs, train).context(FeedForwardSnafu)?;
        let output = (&xs + ffn_output)
            .and_then(|xs| self.ffn_norm.forward_t(&xs, train))
            .context(ResidualSnafu)?;

        Ok((output, weights))
    }
}

/// One SAINT block.
///
/// Applies attention across the column tokens of each sample and then
/// across the samples of the batch. For the row pass, the token
/// sequence of each sample is flattened into one vector and the batch
/// axis takes the role of the sequence axis.
struct SaintBlock {
    column: TransformerSublayers,
    row: TransformerSublayers,
}

impl SaintBlock {
    fn forward(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<(Tensor, SaintAttention), SaintEncoderError> {
        let (xs, column) = self.column.forward(input, train)?;

        let (batch_size, n_columns, width) = xs.dims3().context(ReshapeSnafu)?;
        let rows = xs
            .reshape((1, batch_size, n_columns * width))
            .context(ReshapeSnafu)?;
        let (rows, row) = self.row.forward(&rows, train)?;
        let output = rows
            .reshape((batch_size, n_columns, width))
            .context(ReshapeSnafu)?;

        Ok((output, SaintAttention { column, row }))
    }
}

/// SAINT encoder.
///
/// A stack of blocks that interleave column attention and row attention
/// (_Somepalli et al., 2021_). All blocks preserve the token count and
/// the token width.
///
/// * _Somepalli et al., 2021_: https://arxiv.org/abs/2106.01342
pub struct SaintEncoder {
    blocks: Vec<SaintBlock>,
}

impl SaintEncoder {
    /// Apply the encoder to a column token sequence.
    ///
    /// * `input` - Column tokens.
    ///   *Shape:* `(batch_size, n_columns, width)`
    /// * `train` - Whether the encoder is trained.
    ///
    /// Returns: Refined tokens of the same shape and the attention
    /// weights of every block, in block order.
    pub fn forward(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Vec<SaintAttention>), SaintEncoderError> {
        let mut xs = input.clone();
        let mut attention = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (output, weights) = block.forward(&xs, train)?;
            xs = output;
            attention.push(weights);
        }

        Ok((xs, attention))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::util::tests::test_var_builder;

    use super::SaintEncoderConfig;

    #[test]
    #[report]
    fn blocks_preserve_shape_and_expose_weights() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let encoder = SaintEncoderConfig::default()
            .hidden_width(16)
            .n_columns(3)
            .n_heads(4)
            .n_blocks(2)
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build encoder".to_string()))?;

        let input = Tensor::rand(-1f32, 1f32, (5, 3, 16), &device)
            .whatever_context("Cannot create input")?;
        let (output, attention) = encoder
            .forward(&input, false)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot apply encoder".to_string()))?;

        assert_eq!(output.dims(), input.dims());
        assert_eq!(attention.len(), 2);
        for weights in &attention {
            assert_eq!(weights.column.dims(), &[5, 4, 3, 3]);
            assert_eq!(weights.row.dims(), &[1, 4, 5, 5]);
        }

        Ok(())
    }
}
