use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{linear, linear_no_bias, Dropout, Linear, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;

/// Errors for point-wise feed-forward layers.
#[derive(Debug, Snafu)]
pub enum PointwiseFeedForwardError {
    #[snafu(display("Cannot build activation module"))]
    BuildActivation { source: BoxedError },

    #[snafu(display("Cannot construct layer"))]
    Construction { source: candle_core::Error },
}

/// Point-wise feed-forward layer configuration.
#[derive(Clone, Debug)]
pub struct PointwiseFeedForwardConfig {
    activation: Activation,
    dropout: f32,
    hidden_width: usize,
    intermediate_width: usize,
    use_bias: bool,
    use_gate: bool,
}

impl PointwiseFeedForwardConfig {
    /// Non-linearity applied to the intermediate representation.
    ///
    /// Default: `Activation::Gelu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Dropout applied to the output of the layer.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the layer input and output.
    ///
    /// Default: `32`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Intermediate width inside the feed-forward layer.
    ///
    /// Default: `128`
    pub fn intermediate_width(mut self, intermediate_width: usize) -> Self {
        self.intermediate_width = intermediate_width;
        self
    }

    /// Use bias in the linear transformations.
    ///
    /// Default: `true`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Use Gated Linear Units.
    ///
    /// Default: `false`
    pub fn use_gate(mut self, use_gate: bool) -> Self {
        self.use_gate = use_gate;
        self
    }

    /// Build the feed-forward layer.
    pub fn build(&self, vb: VarBuilder) -> Result<PointwiseFeedForward, PointwiseFeedForwardError> {
        let linear_ctor = if self.use_bias { linear } else { linear_no_bias };

        let intermediate = linear_ctor(
            self.hidden_width,
            self.intermediate_width,
            vb.push_prefix("intermediate"),
        )
        .context(ConstructionSnafu)?;

        let gate = if self.use_gate {
            Some(
                linear_ctor(
                    self.hidden_width,
                    self.intermediate_width,
                    vb.push_prefix("gate"),
                )
                .context(ConstructionSnafu)?,
            )
        } else {
            None
        };

        let output = linear_ctor(
            self.intermediate_width,
            self.hidden_width,
            vb.push_prefix("output"),
        )
        .context(ConstructionSnafu)?;

        Ok(PointwiseFeedForward {
            activation: self
                .activation
                .build(vb.clone())
                .context(BuildActivationSnafu)?,
            dropout: Dropout::new(self.dropout),
            gate,
            intermediate,
            output,
        })
    }
}

impl Default for PointwiseFeedForwardConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Gelu,
            dropout: 0.0,
            hidden_width: 32,
            intermediate_width: 128,
            use_bias: true,
            use_gate: false,
        }
    }
}

/// Point-wise feed-forward layer (_Vaswani et al., 2017_).
///
/// This layer is applied pointwise, meaning that the same
/// transformation is applied to each sequence element. This
/// transformation is:
///
/// `g(xW_1 + b_1)W_2 + b_2`
///
/// `W_1` and `b_1` transform the input to an
/// intermediate width, `g` is a non-linear activation
/// function and `W_2` and `b_2` transform the
/// output of the activation back to the input width.
///
/// Gated Linear Units (_Dauphin et al., 2016_; _Shazeer, 2020_) are also
/// supported. Gating applies the following transformation:
///
/// `(g(xW_g + b_g) * (xW_1 + b_1))W_2 + b_2`
///
/// `W_g` and `b_g` are the affine transformation for the gate.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
/// * _Dauphin et al., 2016_: https://arxiv.org/abs/1612.08083
/// * _Shazeer, 2020_: https://arxiv.org/abs/2002.05202
pub struct PointwiseFeedForward {
    activation: Box<dyn ModuleT>,
    dropout: Dropout,
    gate: Option<Linear>,
    intermediate: Linear,
    output: Linear,
}

impl ModuleT for PointwiseFeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let output = match &self.gate {
            Some(gate) => self.output.forward(
                &self
                    .activation
                    .forward_t(&gate.forward(xs)?, train)?
                    .mul(&self.intermediate.forward(xs)?)?,
            ),
            None => self.output.forward(
                &self
                    .activation
                    .forward_t(&self.intermediate.forward(xs)?, train)?,
            ),
        }?;

        self.dropout.forward(&output, train)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, ModuleT, Tensor};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::util::tests::test_var_builder;

    use super::PointwiseFeedForwardConfig;

    #[test]
    #[report]
    fn feed_forward_preserves_shape() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let ffn = PointwiseFeedForwardConfig::default()
            .hidden_width(16)
            .intermediate_width(64)
            .use_gate(true)
            .build(vb)
            .map_err(|e| {
                Whatever::with_source(Box::new(e), "Cannot build feed-forward".to_string())
            })?;

        let input = Tensor::rand(-1f32, 1f32, (3, 5, 16), &device)
            .whatever_context("Cannot create input")?;
        let output = ffn
            .forward_t(&input, false)
            .whatever_context("Cannot apply feed-forward")?;
        assert_eq!(output.dims(), input.dims());

        Ok(())
    }
}
