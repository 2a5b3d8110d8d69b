/// Traits for model components.
use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::error::BoxedError;

/// Trait for building model components.
pub trait BuildArchitecture {
    /// The component to build.
    type Architecture;

    /// Build the component.
    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError>;
}

/// Trait for model components that map a dense input block to one
/// fixed-width vector per sample.
///
/// Components implementing this trait can be composed into a larger
/// multi-modal model. The composing model relies on [`output_dim`]
/// to size the layers that consume the component's output.
///
/// [`output_dim`]: ModelComponent::output_dim
pub trait ModelComponent {
    /// Apply the component to an input block.
    ///
    /// * `input` - Dense input, one row per sample.
    ///   *Shape:* `(batch_size, n_columns)`
    /// * `train` - Whether the component is trained.
    ///
    /// Returns: Output representations.
    /// *Shape:* `(batch_size, output_dim)`
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor, BoxedError>;

    /// Width of the vectors returned by [`forward_t`].
    ///
    /// [`forward_t`]: ModelComponent::forward_t
    fn output_dim(&self) -> usize;
}
