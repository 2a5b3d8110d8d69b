use candle_core::{IndexOp, ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::architectures::{BuildArchitecture, ModelComponent};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::attention::{ContextAttention, ContextAttentionConfig, ContextAttentionError};
use crate::layers::embeddings::{WordEmbeddings, WordEmbeddingsConfig, WordEmbeddingsError};
use crate::layers::head::{FeedForwardHead, FeedForwardHeadConfig, FeedForwardHeadError};
use crate::layers::recurrent::{
    RecurrentStack, RecurrentStackConfig, RecurrentStackError, RecurrentType,
};

/// Errors for the attentive recurrent encoder.
#[derive(Debug, Snafu)]
pub enum AttentiveRnnError {
    #[snafu(display("Cannot build context attention"))]
    BuildAttention { source: ContextAttentionError },

    #[snafu(display("Cannot build word embeddings"))]
    BuildEmbeddings { source: WordEmbeddingsError },

    #[snafu(display("Cannot build feed-forward head"))]
    BuildHead { source: FeedForwardHeadError },

    #[snafu(display("Cannot build recurrent stack"))]
    BuildRecurrent { source: RecurrentStackError },

    #[snafu(display("Cannot embed input pieces"))]
    Embed { source: WordEmbeddingsError },

    #[snafu(display("Cannot apply feed-forward head"))]
    Head { source: candle_core::Error },

    #[snafu(display("Cannot pool the recurrent output"))]
    Pooling { source: ContextAttentionError },

    #[snafu(display("Cannot apply recurrent stack"))]
    Recurrence { source: RecurrentStackError },

    #[snafu(display("Cannot select the output representation"))]
    Selection { source: candle_core::Error },
}

/// Attentive recurrent encoder configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttentiveRnnConfig {
    attn_concatenate: bool,
    attn_dropout: f32,
    bidirectional: bool,
    embedding_width: Option<usize>,
    head_activation: Activation,
    head_batchnorm: bool,
    head_batchnorm_last: bool,
    head_dropout: f32,
    head_hidden_dims: Option<Vec<usize>>,
    head_linear_first: bool,
    hidden_width: usize,
    n_layers: usize,
    n_pieces: usize,
    padding_idx: Option<usize>,
    #[serde(skip)]
    pretrained: Option<Tensor>,
    recurrent_type: RecurrentType,
    rnn_dropout: f32,
    use_hidden_state: bool,
    with_attention: bool,
}

impl AttentiveRnnConfig {
    /// Concatenate the final hidden state to every timestep of the
    /// pooling input.
    ///
    /// Only used when attention is enabled.
    ///
    /// Default: `true`
    pub fn attn_concatenate(mut self, attn_concatenate: bool) -> Self {
        self.attn_concatenate = attn_concatenate;
        self
    }

    /// Dropout applied inside the context attention.
    ///
    /// Default: `0.1`
    pub fn attn_dropout(mut self, attn_dropout: f32) -> Self {
        self.attn_dropout = attn_dropout;
        self
    }

    /// Run the recurrent layers in both directions.
    ///
    /// Default: `false`
    pub fn bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    /// Width of the word embeddings.
    ///
    /// Required unless a pretrained matrix is provided.
    ///
    /// Default: `None`
    pub fn embedding_width(mut self, embedding_width: Option<usize>) -> Self {
        self.embedding_width = embedding_width;
        self
    }

    /// Activation of the feed-forward head.
    ///
    /// Default: `Activation::Relu`
    pub fn head_activation(mut self, head_activation: Activation) -> Self {
        self.head_activation = head_activation;
        self
    }

    /// Apply batch normalization in the feed-forward head.
    ///
    /// Default: `false`
    pub fn head_batchnorm(mut self, head_batchnorm: bool) -> Self {
        self.head_batchnorm = head_batchnorm;
        self
    }

    /// Apply batch normalization to the last layer of the head as well.
    ///
    /// Default: `false`
    pub fn head_batchnorm_last(mut self, head_batchnorm_last: bool) -> Self {
        self.head_batchnorm_last = head_batchnorm_last;
        self
    }

    /// Dropout applied in the feed-forward head.
    ///
    /// Default: `0.0`
    pub fn head_dropout(mut self, head_dropout: f32) -> Self {
        self.head_dropout = head_dropout;
        self
    }

    /// Hidden widths of an optional feed-forward head.
    ///
    /// The head input width is derived from the encoder output and
    /// prepended automatically. No head is built when unset.
    ///
    /// Default: `None`
    pub fn head_hidden_dims(mut self, head_hidden_dims: Option<Vec<usize>>) -> Self {
        self.head_hidden_dims = head_hidden_dims;
        self
    }

    /// Ordering of the operations in the head's dense layers.
    ///
    /// Default: `true`
    pub fn head_linear_first(mut self, head_linear_first: bool) -> Self {
        self.head_linear_first = head_linear_first;
        self
    }

    /// Width of the recurrent hidden state.
    ///
    /// Default: `64`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Number of stacked recurrent layers.
    ///
    /// Default: `3`
    pub fn n_layers(mut self, n_layers: usize) -> Self {
        self.n_layers = n_layers;
        self
    }

    /// Number of pieces in the vocabulary.
    ///
    /// Default: `0`
    pub fn n_pieces(mut self, n_pieces: usize) -> Self {
        self.n_pieces = n_pieces;
        self
    }

    /// Index of the padding piece.
    ///
    /// Default: `Some(1)`
    pub fn padding_idx(mut self, padding_idx: Option<usize>) -> Self {
        self.padding_idx = padding_idx;
        self
    }

    /// Pretrained embedding matrix.
    ///
    /// *Shape:* `(n_pieces, width)`
    ///
    /// Default: `None`
    pub fn pretrained(mut self, pretrained: Option<Tensor>) -> Self {
        self.pretrained = pretrained;
        self
    }

    /// The recurrent cell type.
    ///
    /// Default: `RecurrentType::Lstm`
    pub fn recurrent_type(mut self, recurrent_type: RecurrentType) -> Self {
        self.recurrent_type = recurrent_type;
        self
    }

    /// Dropout between the recurrent layers.
    ///
    /// Default: `0.1`
    pub fn rnn_dropout(mut self, rnn_dropout: f32) -> Self {
        self.rnn_dropout = rnn_dropout;
        self
    }

    /// Represent a sequence by the final hidden state rather than the
    /// last timestep of the output sequence.
    ///
    /// Only used when attention is disabled.
    ///
    /// Default: `true`
    pub fn use_hidden_state(mut self, use_hidden_state: bool) -> Self {
        self.use_hidden_state = use_hidden_state;
        self
    }

    /// Pool the recurrent output with context attention.
    ///
    /// Default: `false`
    pub fn with_attention(mut self, with_attention: bool) -> Self {
        self.with_attention = with_attention;
        self
    }

    /// Build the encoder.
    pub fn build(&self, vb: VarBuilder) -> Result<AttentiveRnn, AttentiveRnnError> {
        let embeddings = WordEmbeddingsConfig::default()
            .embedding_width(self.embedding_width)
            .n_pieces(self.n_pieces)
            .padding_idx(self.padding_idx)
            .pretrained(self.pretrained.clone())
            .build(vb.push_prefix("embeddings"))
            .context(BuildEmbeddingsSnafu)?;

        let recurrent_config = RecurrentStackConfig::default()
            .bidirectional(self.bidirectional)
            .dropout(self.rnn_dropout)
            .hidden_width(self.hidden_width)
            .input_width(embeddings.width())
            .n_layers(self.n_layers)
            .recurrent_type(self.recurrent_type);
        let recurrent = recurrent_config
            .build(vb.push_prefix("rnn"))
            .context(BuildRecurrentSnafu)?;

        let rnn_output_dim = recurrent_config.output_width();
        let (selection, selected_dim) = if self.with_attention {
            let attn_input_dim = if self.attn_concatenate {
                rnn_output_dim * 2
            } else {
                rnn_output_dim
            };
            let attention = ContextAttentionConfig::default()
                .dropout(self.attn_dropout)
                .input_width(attn_input_dim)
                .sum_along_seq(true)
                .build(vb.push_prefix("attention"))
                .context(BuildAttentionSnafu)?;
            (
                OutputSelection::ContextPooling {
                    attention,
                    concatenate: self.attn_concatenate,
                },
                attn_input_dim,
            )
        } else if self.use_hidden_state {
            (OutputSelection::FinalHiddenState, rnn_output_dim)
        } else {
            (OutputSelection::LastTimestep, rnn_output_dim)
        };

        let (head, output_dim) = match &self.head_hidden_dims {
            Some(dims) => {
                let mut widths = Vec::with_capacity(dims.len() + 1);
                widths.push(selected_dim);
                widths.extend_from_slice(dims);
                let head = FeedForwardHeadConfig::default()
                    .activation(self.head_activation)
                    .batch_norm(self.head_batchnorm)
                    .batch_norm_last(self.head_batchnorm_last)
                    .dropout(self.head_dropout)
                    .linear_first(self.head_linear_first)
                    .widths(widths)
                    .build(vb.push_prefix("head"))
                    .context(BuildHeadSnafu)?;
                let output_dim = head.output_dim();
                (Some(head), output_dim)
            }
            None => (None, selected_dim),
        };

        Ok(AttentiveRnn {
            embeddings,
            head,
            output_dim,
            recurrent,
            selection,
        })
    }
}

impl Default for AttentiveRnnConfig {
    fn default() -> Self {
        Self {
            attn_concatenate: true,
            attn_dropout: 0.1,
            bidirectional: false,
            embedding_width: None,
            head_activation: Activation::Relu,
            head_batchnorm: false,
            head_batchnorm_last: false,
            head_dropout: 0.0,
            head_hidden_dims: None,
            head_linear_first: true,
            hidden_width: 64,
            n_layers: 3,
            n_pieces: 0,
            padding_idx: Some(1),
            pretrained: None,
            recurrent_type: RecurrentType::Lstm,
            rnn_dropout: 0.1,
            use_hidden_state: true,
            with_attention: false,
        }
    }
}

impl BuildArchitecture for AttentiveRnnConfig {
    type Architecture = AttentiveRnn;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        Ok(AttentiveRnnConfig::build(self, vb)?)
    }
}

/// How the recurrent output is reduced to one vector per sequence.
enum OutputSelection {
    /// Weighted sum of the output sequence using context attention,
    /// optionally with the final hidden state concatenated to every
    /// timestep.
    ContextPooling {
        attention: ContextAttention,
        concatenate: bool,
    },
    /// The final hidden state, direction-concatenated when the stack
    /// is bidirectional.
    FinalHiddenState,
    /// The last timestep of the output sequence.
    LastTimestep,
}

/// Attentive recurrent text encoder.
///
/// Embeds a piece identifier sequence, encodes it with a stacked
/// recurrent network, and selects one vector per sequence either from
/// the hidden state or through context-attention pooling.
pub struct AttentiveRnn {
    embeddings: WordEmbeddings,
    head: Option<FeedForwardHead>,
    output_dim: usize,
    recurrent: RecurrentStack,
    selection: OutputSelection,
}

impl AttentiveRnn {
    /// Apply the encoder and return the pooling weights.
    ///
    /// * `input` - Piece identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether the encoder is trained.
    ///
    /// Returns: Output representations and, when attention pooling is
    /// enabled, the pooling weights.
    /// *Shapes:* `(batch_size, output_dim)` and `(batch_size, seq_len)`
    pub fn forward_with_attention(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>), AttentiveRnnError> {
        let embedded = self.embeddings.forward(input).context(EmbedSnafu)?;
        let encoded = self
            .recurrent
            .forward_t(&embedded, train)
            .context(RecurrenceSnafu)?;

        let (selected, weights) = match &self.selection {
            OutputSelection::ContextPooling {
                attention,
                concatenate,
            } => {
                let output = encoded.output();
                let attn_input = if *concatenate {
                    let (batch_size, seq_len, _) = output.dims3().context(SelectionSnafu)?;
                    let hidden = encoded
                        .final_hidden()
                        .and_then(|hidden| hidden.unsqueeze(1))
                        .and_then(|hidden| {
                            let width = hidden.dim(2)?;
                            hidden.expand((batch_size, seq_len, width))
                        })
                        .context(SelectionSnafu)?;
                    Tensor::cat(&[output, &hidden], 2).context(SelectionSnafu)?
                } else {
                    output.clone()
                };
                let (pooled, weights) =
                    attention.forward(&attn_input, train).context(PoolingSnafu)?;
                (pooled, Some(weights))
            }
            OutputSelection::FinalHiddenState => {
                (encoded.final_hidden().context(SelectionSnafu)?, None)
            }
            OutputSelection::LastTimestep => {
                let output = encoded.output();
                let (_, seq_len, _) = output.dims3().context(SelectionSnafu)?;
                (
                    output.i((.., seq_len - 1, ..)).context(SelectionSnafu)?,
                    None,
                )
            }
        };

        let output = match &self.head {
            Some(head) => head.forward_t(&selected, train).context(HeadSnafu)?,
            None => selected,
        };

        Ok((output, weights))
    }
}

impl ModelComponent for AttentiveRnn {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        let (output, _) = self.forward_with_attention(input, train)?;
        Ok(output)
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }
}
