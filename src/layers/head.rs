use candle_core::{ModuleT, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::layer_norm::BatchNormConfig;

/// Errors for feed-forward heads.
#[derive(Debug, Snafu)]
pub enum FeedForwardHeadError {
    #[snafu(display("Cannot build activation module"))]
    BuildActivation { source: BoxedError },

    #[snafu(display("Cannot build batch norm module"))]
    BuildBatchNorm { source: BoxedError },

    #[snafu(display("Cannot construct dense layer {n}"))]
    Construction { source: candle_core::Error, n: usize },

    #[snafu(display("Head needs an input width and at least one hidden width, got {n_widths}"))]
    TooFewWidths { n_widths: usize },
}

/// Feed-forward head configuration.
///
/// The head transforms a flat per-sample vector through a stack of dense
/// layers. The first element of `widths` is the input width, every
/// following element adds one dense layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedForwardHeadConfig {
    activation: Activation,
    batch_norm: bool,
    batch_norm_last: bool,
    dropout: f32,
    linear_first: bool,
    widths: Vec<usize>,
}

impl FeedForwardHeadConfig {
    /// Activation function between dense layers.
    ///
    /// Default: `Activation::Relu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Apply batch normalization in the dense layers.
    ///
    /// Default: `false`
    pub fn batch_norm(mut self, batch_norm: bool) -> Self {
        self.batch_norm = batch_norm;
        self
    }

    /// Apply batch normalization to the last dense layer as well.
    ///
    /// Default: `false`
    pub fn batch_norm_last(mut self, batch_norm_last: bool) -> Self {
        self.batch_norm_last = batch_norm_last;
        self
    }

    /// Dropout probability in the dense layers.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Ordering of the operations in a dense layer.
    ///
    /// `true` applies `linear → activation → batch norm → dropout`,
    /// `false` applies `batch norm → dropout → linear → activation`.
    ///
    /// Default: `true`
    pub fn linear_first(mut self, linear_first: bool) -> Self {
        self.linear_first = linear_first;
        self
    }

    /// Layer widths, starting with the input width.
    ///
    /// Default: `[32, 128, 64]`
    pub fn widths(mut self, widths: Vec<usize>) -> Self {
        self.widths = widths;
        self
    }

    /// Build the head.
    pub fn build(&self, vb: VarBuilder) -> Result<FeedForwardHead, FeedForwardHeadError> {
        ensure!(
            self.widths.len() >= 2,
            TooFewWidthsSnafu {
                n_widths: self.widths.len()
            }
        );

        let n_layers = self.widths.len() - 1;
        let mut layers = Vec::with_capacity(n_layers);
        for (n, widths) in self.widths.windows(2).enumerate() {
            let (in_width, out_width) = (widths[0], widths[1]);
            let vb = vb.push_prefix(format!("dense_{n}"));

            let last = n == n_layers - 1;
            let use_batch_norm = self.batch_norm && (!last || self.batch_norm_last);
            // The normalized width depends on where batch norm sits in
            // the dense layer ordering.
            let norm_width = if self.linear_first { out_width } else { in_width };
            let batch_norm = if use_batch_norm {
                Some(
                    BatchNormConfig::default()
                        .size(norm_width)
                        .build(vb.push_prefix("batch_norm"))
                        .context(BuildBatchNormSnafu)?,
                )
            } else {
                None
            };

            layers.push(DenseLayer {
                activation: self
                    .activation
                    .build(vb.clone())
                    .context(BuildActivationSnafu)?,
                batch_norm,
                dropout: Dropout::new(self.dropout),
                linear: linear(in_width, out_width, vb.push_prefix("linear"))
                    .context(ConstructionSnafu { n })?,
                linear_first: self.linear_first,
            });
        }

        Ok(FeedForwardHead {
            layers,
            output_dim: self.widths[self.widths.len() - 1],
        })
    }
}

impl Default for FeedForwardHeadConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            batch_norm: false,
            batch_norm_last: false,
            dropout: 0.0,
            linear_first: true,
            widths: vec![32, 128, 64],
        }
    }
}

/// One dense layer of a feed-forward head.
struct DenseLayer {
    activation: Box<dyn ModuleT>,
    batch_norm: Option<Box<dyn ModuleT>>,
    dropout: Dropout,
    linear: Linear,
    linear_first: bool,
}

impl ModuleT for DenseLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        use candle_core::Module;

        if self.linear_first {
            let mut xs = self
                .activation
                .forward_t(&self.linear.forward(xs)?, train)?;
            if let Some(batch_norm) = &self.batch_norm {
                xs = batch_norm.forward_t(&xs, train)?;
            }
            self.dropout.forward(&xs, train)
        } else {
            let mut xs = xs.clone();
            if let Some(batch_norm) = &self.batch_norm {
                xs = batch_norm.forward_t(&xs, train)?;
            }
            let xs = self.dropout.forward(&xs, train)?;
            self.activation.forward_t(&self.linear.forward(&xs)?, train)
        }
    }
}

/// Feed-forward head.
///
/// A stack of dense layers applied to a flat per-sample vector, used as
/// the final transformation of the tabular and text components.
pub struct FeedForwardHead {
    layers: Vec<DenseLayer>,
    output_dim: usize,
}

impl FeedForwardHead {
    /// Width of the head output.
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }
}

impl ModuleT for FeedForwardHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, ModuleT, Tensor};
    use rstest::rstest;
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::util::tests::test_var_builder;

    use super::FeedForwardHeadConfig;

    #[rstest]
    #[case(true)]
    #[case(false)]
    #[report]
    fn head_output_matches_output_dim(#[case] linear_first: bool) -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let head = FeedForwardHeadConfig::default()
            .widths(vec![16, 32, 8])
            .batch_norm(true)
            .linear_first(linear_first)
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build head".to_string()))?;
        assert_eq!(head.output_dim(), 8);

        let input = Tensor::rand(-1f32, 1f32, (4, 16), &device)
            .whatever_context("Cannot create input")?;
        let output = head
            .forward_t(&input, false)
            .whatever_context("Cannot apply head")?;
        assert_eq!(output.dims(), &[4, 8]);

        Ok(())
    }

    #[test]
    fn head_without_hidden_widths_is_rejected() {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        assert!(FeedForwardHeadConfig::default()
            .widths(vec![16])
            .build(vb)
            .is_err());
    }
}
