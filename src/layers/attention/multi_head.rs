use candle_core::{Module, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::{linear, linear_no_bias, Dropout, Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

/// Errors for multi-head self-attention.
#[derive(Debug, Snafu)]
pub enum MultiHeadSelfAttentionError {
    #[snafu(display("Cannot calculate attention scores"))]
    AttentionScores { source: candle_core::Error },

    #[snafu(display("Cannot weigh values using attention weights"))]
    AttentionValues { source: candle_core::Error },

    #[snafu(display("Cannot combine heads"))]
    CombineHeads { source: candle_core::Error },

    #[snafu(display("Cannot construct layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display(
        "Hidden width ({hidden_width}) must be divisible by the number of heads ({n_heads})"
    ))]
    InvalidNHeads { hidden_width: usize, n_heads: usize },

    #[snafu(display("Cannot apply output layer"))]
    Output { source: candle_core::Error },

    #[snafu(display("Cannot calculate key, query, or value"))]
    Qkv { source: candle_core::Error },

    #[snafu(display("Cannot split heads"))]
    SplitHeads { source: candle_core::Error },
}

/// Multi-head self-attention configuration.
#[derive(Clone, Debug)]
pub struct MultiHeadSelfAttentionConfig {
    dropout: f32,
    hidden_width: usize,
    n_heads: usize,
    use_bias: bool,
}

impl MultiHeadSelfAttentionConfig {
    /// Dropout applied to the attention weights.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the input and output representations.
    ///
    /// Default: `32`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `8`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Use bias in the query, key, value and output projections.
    ///
    /// Default: `false`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build the attention module.
    pub fn build(
        &self,
        vb: VarBuilder,
    ) -> Result<MultiHeadSelfAttention, MultiHeadSelfAttentionError> {
        ensure!(
            self.hidden_width % self.n_heads == 0,
            InvalidNHeadsSnafu {
                hidden_width: self.hidden_width,
                n_heads: self.n_heads
            }
        );

        let linear_ctor = if self.use_bias { linear } else { linear_no_bias };

        let query = linear_ctor(self.hidden_width, self.hidden_width, vb.push_prefix("query"))
            .context(ConstructionSnafu)?;
        let key = linear_ctor(self.hidden_width, self.hidden_width, vb.push_prefix("key"))
            .context(ConstructionSnafu)?;
        let value = linear_ctor(self.hidden_width, self.hidden_width, vb.push_prefix("value"))
            .context(ConstructionSnafu)?;
        let output = linear_ctor(
            self.hidden_width,
            self.hidden_width,
            vb.push_prefix("output"),
        )
        .context(ConstructionSnafu)?;

        Ok(MultiHeadSelfAttention {
            dropout: Dropout::new(self.dropout),
            key,
            n_heads: self.n_heads,
            output,
            query,
            value,
        })
    }
}

impl Default for MultiHeadSelfAttentionConfig {
    fn default() -> Self {
        Self {
            dropout: 0.0,
            hidden_width: 32,
            n_heads: 8,
            use_bias: false,
        }
    }
}

/// Multi-head self-attention.
///
/// Scaled dot-product self-attention over the sequence axis of the input
/// (_Vaswani et al., 2017_). In contrast to masked language-model attention
/// layers, this layer hands the normalized attention weights back to the
/// caller so that they can be inspected.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
pub struct MultiHeadSelfAttention {
    dropout: Dropout,
    key: Linear,
    n_heads: usize,
    output: Linear,
    query: Linear,
    value: Linear,
}

impl MultiHeadSelfAttention {
    /// Apply self-attention to the input.
    ///
    /// * `input` - Input representations.
    ///   *Shape:* `(batch_size, seq_len, width)`
    /// * `train` - Whether the layer is trained.
    ///
    /// Returns: Output representations and attention weights.
    /// *Shapes:* `(batch_size, seq_len, width)` and
    /// `(batch_size, heads, seq_len, seq_len)`
    pub fn forward(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor), MultiHeadSelfAttentionError> {
        let query = self
            .query
            .forward(input)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;
        let key = self
            .key
            .forward(input)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;
        let value = self
            .value
            .forward(input)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;

        let head_width = key.dim(D::Minus1).context(AttentionScoresSnafu)?;
        let temperature = (head_width as f64).sqrt();
        let attn_scores = key
            .contiguous()
            .and_then(|key| key.transpose(3, 2))
            .and_then(|key| query.contiguous()?.broadcast_matmul(&key))
            .and_then(|scores| scores / temperature)
            .context(AttentionScoresSnafu)?;

        let attn_weights = softmax(&attn_scores, D::Minus1).context(AttentionValuesSnafu)?;

        let attn_values = self
            .dropout
            .forward(&attn_weights, train)
            .and_then(|weights| weights.broadcast_matmul(&value.contiguous()?))
            .context(AttentionValuesSnafu)?
            .combine_heads()?;

        let output = self
            .output
            .forward(&attn_values)
            .context(OutputSnafu)?;

        Ok((output, attn_weights))
    }
}

trait CombineHeads {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadSelfAttentionError>;
}

impl CombineHeads for Tensor {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadSelfAttentionError> {
        let (batch_size, n_heads, seq_len, head_width) =
            self.dims4().context(CombineHeadsSnafu)?;
        self.transpose(1, 2)
            .and_then(|heads| heads.reshape((batch_size, seq_len, n_heads * head_width)))
            .context(CombineHeadsSnafu)
    }
}

trait SplitHeads {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadSelfAttentionError>;
}

impl SplitHeads for Tensor {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadSelfAttentionError> {
        let (batch_size, seq_len, model_width) = self.dims3().context(SplitHeadsSnafu)?;
        let head_width = model_width / n_heads;
        self.reshape((batch_size, seq_len, n_heads, head_width))
            .and_then(|heads| heads.transpose(1, 2))
            .context(SplitHeadsSnafu)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use ndarray::Array3;
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::util::tests::{assert_tensor_eq, test_devices, test_var_builder};

    use super::MultiHeadSelfAttentionConfig;

    #[test]
    #[report]
    fn attention_weights_have_expected_shape_and_sum() -> Result<(), Whatever> {
        for device in test_devices() {
            let (_varmap, vb) = test_var_builder(&device);
            let attention = MultiHeadSelfAttentionConfig::default()
                .hidden_width(16)
                .n_heads(4)
                .build(vb)
                .map_err(|e| {
                    Whatever::with_source(Box::new(e), "Cannot build attention".to_string())
                })?;

            let input = Tensor::rand(-1f32, 1f32, (3, 5, 16), &device)
                .whatever_context("Cannot create input")?;
            let (output, weights) = attention.forward(&input, false).map_err(|e| {
                Whatever::with_source(Box::new(e), "Cannot apply attention".to_string())
            })?;

            assert_eq!(output.dims(), &[3, 5, 16]);
            assert_eq!(weights.dims(), &[3, 4, 5, 5]);

            // Attention weights are a distribution over the key axis.
            let weight_sums = weights
                .sum(3)
                .whatever_context("Cannot sum attention weights")?;
            assert_tensor_eq!(
                weight_sums,
                Array3::<f32>::ones((3, 4, 5)),
                epsilon = 1e-5
            );
        }

        Ok(())
    }

    #[test]
    fn indivisible_head_count_is_rejected() {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        assert!(MultiHeadSelfAttentionConfig::default()
            .hidden_width(30)
            .n_heads(8)
            .build(vb)
            .is_err());
    }
}
