use candle_core::{Module, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::{linear, Dropout, Linear, VarBuilder};
use snafu::{ResultExt, Snafu};

/// Errors for context-attention pooling.
#[derive(Debug, Snafu)]
pub enum ContextAttentionError {
    #[snafu(display("Cannot construct layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot pool sequence with attention weights"))]
    Pooling { source: candle_core::Error },

    #[snafu(display("Cannot calculate context scores"))]
    Scores { source: candle_core::Error },
}

/// Context-attention pooling configuration.
#[derive(Clone, Debug)]
pub struct ContextAttentionConfig {
    dropout: f32,
    input_width: usize,
    sum_along_seq: bool,
}

impl ContextAttentionConfig {
    /// Dropout applied to the input of the scoring projection.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the per-timestep input vectors.
    ///
    /// Default: `64`
    pub fn input_width(mut self, input_width: usize) -> Self {
        self.input_width = input_width;
        self
    }

    /// Whether to sum the weighted sequence along the time axis.
    ///
    /// When disabled, the per-timestep weighted vectors are returned
    /// instead of a single pooled vector and the caller performs the
    /// pooling itself.
    ///
    /// Default: `true`
    pub fn sum_along_seq(mut self, sum_along_seq: bool) -> Self {
        self.sum_along_seq = sum_along_seq;
        self
    }

    /// Build the pooling module.
    pub fn build(&self, vb: VarBuilder) -> Result<ContextAttention, ContextAttentionError> {
        let projection = linear(
            self.input_width,
            self.input_width,
            vb.push_prefix("projection"),
        )
        .context(ConstructionSnafu)?;
        let context = vb
            .push_prefix("context")
            .get_with_hints((self.input_width,), "weight", candle_nn::init::DEFAULT_KAIMING_UNIFORM)
            .context(ConstructionSnafu)?;

        Ok(ContextAttention {
            context,
            dropout: Dropout::new(self.dropout),
            projection,
            sum_along_seq: self.sum_along_seq,
        })
    }
}

impl Default for ContextAttentionConfig {
    fn default() -> Self {
        Self {
            dropout: 0.0,
            input_width: 64,
            sum_along_seq: true,
        }
    }
}

/// Context-attention pooling.
///
/// Collapses a sequence of per-timestep vectors into one fixed-width
/// vector using learned importance weighting: each timestep gets a scalar
/// compatibility score against a learned context vector, the scores are
/// softmax-normalized over the time axis, and the output is the
/// weighted sum of the timestep vectors.
///
/// See [Yang et al., 2016](https://aclanthology.org/N16-1174/).
pub struct ContextAttention {
    context: Tensor,
    dropout: Dropout,
    projection: Linear,
    sum_along_seq: bool,
}

impl ContextAttention {
    /// Pool the input sequence.
    ///
    /// * `input` - Input sequence.
    ///   *Shape:* `(batch_size, seq_len, width)`
    /// * `train` - Whether the layer is trained.
    ///
    /// Returns: Pooled output and pooling weights. The output has shape
    /// `(batch_size, width)` when summing along the sequence is enabled
    /// and `(batch_size, seq_len, width)` otherwise. The weights have
    /// shape `(batch_size, seq_len)` and sum to 1 over the time axis.
    pub fn forward(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor), ContextAttentionError> {
        let scores = self
            .dropout
            .forward(input, train)
            .and_then(|xs| self.projection.forward(&xs))
            .and_then(|xs| xs.tanh())
            .and_then(|xs| xs.broadcast_matmul(&self.context.unsqueeze(D::Minus1)?))
            .and_then(|xs| xs.squeeze(D::Minus1))
            .context(ScoresSnafu)?;

        let weights = softmax(&scores, 1).context(ScoresSnafu)?;

        let weighted = input
            .broadcast_mul(&weights.unsqueeze(D::Minus1).context(PoolingSnafu)?)
            .context(PoolingSnafu)?;

        let output = if self.sum_along_seq {
            weighted.sum(1).context(PoolingSnafu)?
        } else {
            weighted
        };

        Ok((output, weights))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use ndarray::Array1;
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::util::tests::{assert_tensor_eq, test_var_builder};

    use super::ContextAttentionConfig;

    #[test]
    #[report]
    fn pooling_weights_are_a_distribution() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let attention = ContextAttentionConfig::default()
            .input_width(8)
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build pooling".to_string()))?;

        let input = Tensor::rand(-1f32, 1f32, (2, 7, 8), &device)
            .whatever_context("Cannot create input")?;
        let (output, weights) = attention
            .forward(&input, false)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot pool input".to_string()))?;

        assert_eq!(output.dims(), &[2, 8]);
        assert_eq!(weights.dims(), &[2, 7]);
        assert_tensor_eq!(
            weights.sum(1).whatever_context("Cannot sum weights")?,
            Array1::<f32>::ones(2),
            epsilon = 1e-5
        );

        Ok(())
    }

    #[test]
    #[report]
    fn skipping_summation_returns_weighted_sequence() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let attention = ContextAttentionConfig::default()
            .input_width(8)
            .sum_along_seq(false)
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build pooling".to_string()))?;

        let input = Tensor::rand(-1f32, 1f32, (2, 7, 8), &device)
            .whatever_context("Cannot create input")?;
        let (output, _) = attention
            .forward(&input, false)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot pool input".to_string()))?;

        assert_eq!(output.dims(), &[2, 7, 8]);

        Ok(())
    }
}
