use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{Activation as CandleActivation, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Activation functions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Gausian Error Linear Unit.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    Gelu,

    /// Gausian Error Linear Unit approximation.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    GeluNew,

    /// Leaky Rectified Linear Unit with the given negative slope.
    LeakyRelu(f64),

    /// Rectified Linear Unit.
    ///
    /// See [Fukushima, 1969](https://ieeexplore.ieee.org/document/4082265).
    Relu,

    /// Hyperbolic tangent.
    Tanh,
}

impl BuildModule for Activation {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        use Activation::*;
        Ok(match self {
            Gelu => Box::new(CandleActivation::Gelu),
            GeluNew => Box::new(CandleActivation::NewGelu),
            LeakyRelu(negative_slope) => Box::new(CandleActivation::LeakyRelu(*negative_slope)),
            Relu => Box::new(CandleActivation::Relu),
            Tanh => Box::new(TanhActivation),
        })
    }
}

/// Hyperbolic tangent activation.
///
/// Not provided by `candle_nn::Activation`, so implemented locally.
#[derive(Clone, Copy, Debug)]
struct TanhActivation;

impl Module for TanhActivation {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.tanh()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Activation;

    #[test]
    fn activation_names_deserialize() {
        let activation: Activation =
            serde_json::from_value(json!("gelu_new")).expect("Cannot deserialize activation");
        assert_eq!(activation, Activation::GeluNew);

        assert!(serde_json::from_value::<Activation>(json!("swish")).is_err());
    }
}
