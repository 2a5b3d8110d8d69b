use std::str::FromStr;

use candle_core::Tensor;
use candle_nn::rnn::{gru, lstm, GRUConfig, LSTMConfig, GRU, LSTM, RNN};
use candle_nn::{Dropout, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

/// Errors for recurrent stacks.
#[derive(Debug, Snafu)]
pub enum RecurrentStackError {
    #[snafu(display("Cannot construct recurrent layer {n}"))]
    Construction { source: candle_core::Error, n: usize },

    #[snafu(display("Recurrence needs a sequence with at least one timestep"))]
    EmptySequence,

    #[snafu(display("Cannot apply inter-layer dropout"))]
    InterLayerDropout { source: candle_core::Error },

    #[snafu(display("Cannot apply recurrent layer {n}"))]
    Recurrence { source: candle_core::Error, n: usize },

    #[snafu(display("Cannot reverse sequence for the backward direction"))]
    ReverseTime { source: candle_core::Error },

    #[snafu(display("Recurrent stacks expect inputs of shape (batch_size, seq_len, width)"))]
    Shape { source: candle_core::Error },

    #[snafu(display("Unsupported recurrent type '{name}', must be 'lstm' or 'gru'"))]
    UnsupportedRecurrentType { name: String },
}

/// Supported recurrent cell types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrentType {
    Lstm,
    Gru,
}

impl FromStr for RecurrentType {
    type Err = RecurrentStackError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_lowercase().as_str() {
            "lstm" => Ok(RecurrentType::Lstm),
            "gru" => Ok(RecurrentType::Gru),
            _ => UnsupportedRecurrentTypeSnafu { name }.fail(),
        }
    }
}

/// Recurrent stack configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecurrentStackConfig {
    bidirectional: bool,
    dropout: f32,
    hidden_width: usize,
    input_width: usize,
    n_layers: usize,
    recurrent_type: RecurrentType,
}

impl RecurrentStackConfig {
    /// Run every layer in both directions.
    ///
    /// Bidirectional layers double the output width.
    ///
    /// Default: `false`
    pub fn bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    /// Dropout applied to the output of every layer except the last.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Width of the hidden state of each cell.
    ///
    /// Default: `64`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Width of the per-timestep input vectors.
    ///
    /// Default: `64`
    pub fn input_width(mut self, input_width: usize) -> Self {
        self.input_width = input_width;
        self
    }

    /// Number of stacked layers.
    ///
    /// Default: `1`
    pub fn n_layers(mut self, n_layers: usize) -> Self {
        self.n_layers = n_layers;
        self
    }

    /// The recurrent cell type.
    ///
    /// Default: `RecurrentType::Lstm`
    pub fn recurrent_type(mut self, recurrent_type: RecurrentType) -> Self {
        self.recurrent_type = recurrent_type;
        self
    }

    /// Build the recurrent stack.
    pub fn build(&self, vb: VarBuilder) -> Result<RecurrentStack, RecurrentStackError> {
        let mut layers = Vec::with_capacity(self.n_layers);
        for n in 0..self.n_layers {
            let input_width = if n == 0 {
                self.input_width
            } else {
                self.output_width()
            };
            let vb = vb.push_prefix(format!("layer_{n}"));

            let forward = self.build_cell(input_width, vb.push_prefix("forward"), n)?;
            let backward = if self.bidirectional {
                Some(self.build_cell(input_width, vb.push_prefix("backward"), n)?)
            } else {
                None
            };

            layers.push(RecurrentLayer { backward, forward });
        }

        Ok(RecurrentStack {
            dropout: Dropout::new(self.dropout),
            layers,
        })
    }

    /// Width of the per-timestep output vectors.
    pub fn output_width(&self) -> usize {
        if self.bidirectional {
            self.hidden_width * 2
        } else {
            self.hidden_width
        }
    }

    fn build_cell(
        &self,
        input_width: usize,
        vb: VarBuilder,
        n: usize,
    ) -> Result<RecurrentCell, RecurrentStackError> {
        Ok(match self.recurrent_type {
            RecurrentType::Lstm => RecurrentCell::Lstm(
                lstm(input_width, self.hidden_width, LSTMConfig::default(), vb)
                    .context(ConstructionSnafu { n })?,
            ),
            RecurrentType::Gru => RecurrentCell::Gru(
                gru(input_width, self.hidden_width, GRUConfig::default(), vb)
                    .context(ConstructionSnafu { n })?,
            ),
        })
    }
}

impl Default for RecurrentStackConfig {
    fn default() -> Self {
        Self {
            bidirectional: false,
            dropout: 0.0,
            hidden_width: 64,
            input_width: 64,
            n_layers: 1,
            recurrent_type: RecurrentType::Lstm,
        }
    }
}

/// One recurrent cell, unrolled over a sequence.
enum RecurrentCell {
    Gru(GRU),
    Lstm(LSTM),
}

impl RecurrentCell {
    /// Unroll the cell over the input sequence.
    ///
    /// Returns the per-timestep hidden states
    /// (`(batch_size, seq_len, hidden_width)`) and the final hidden
    /// state (`(batch_size, hidden_width)`).
    fn forward(&self, input: &Tensor) -> Result<(Tensor, Tensor), candle_core::Error> {
        let hs = match self {
            RecurrentCell::Lstm(cell) => cell
                .seq(input)?
                .iter()
                .map(|state| state.h().clone())
                .collect::<Vec<_>>(),
            RecurrentCell::Gru(cell) => cell
                .seq(input)?
                .iter()
                .map(|state| state.h().clone())
                .collect::<Vec<_>>(),
        };

        let output = Tensor::stack(&hs, 1)?;
        let final_hidden = match hs.into_iter().last() {
            Some(h) => h,
            None => candle_core::bail!("sequence must have at least one timestep"),
        };
        Ok((output, final_hidden))
    }
}

struct RecurrentLayer {
    backward: Option<RecurrentCell>,
    forward: RecurrentCell,
}

/// Output of a recurrent stack.
pub struct RecurrentOutput {
    hidden_backward: Option<Tensor>,
    hidden_forward: Tensor,
    output: Tensor,
}

impl RecurrentOutput {
    /// Per-timestep hidden vectors of the last layer, in input order.
    ///
    /// *Shape:* `(batch_size, seq_len, hidden_width * directions)`
    pub fn output(&self) -> &Tensor {
        &self.output
    }

    /// Final hidden state of the last layer, with the directions
    /// concatenated along the feature axis.
    ///
    /// *Shape:* `(batch_size, hidden_width * directions)`
    pub fn final_hidden(&self) -> Result<Tensor, candle_core::Error> {
        match &self.hidden_backward {
            Some(backward) => Tensor::cat(&[&self.hidden_forward, backward], 1),
            None => Ok(self.hidden_forward.clone()),
        }
    }
}

/// Stack of (optionally bidirectional) recurrent layers.
///
/// The backward direction runs over the time-reversed sequence; its
/// per-timestep outputs are reversed back so that both directions line
/// up with the input order before they are concatenated.
pub struct RecurrentStack {
    dropout: Dropout,
    layers: Vec<RecurrentLayer>,
}

impl RecurrentStack {
    /// Apply the stack to an embedded sequence.
    ///
    /// * `input` - Input sequence.
    ///   *Shape:* `(batch_size, seq_len, input_width)`
    /// * `train` - Whether the stack is trained.
    pub fn forward_t(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<RecurrentOutput, RecurrentStackError> {
        let (_, seq_len, _) = input.dims3().context(ShapeSnafu)?;
        ensure!(seq_len > 0, EmptySequenceSnafu);

        let mut xs = input.clone();
        let mut hidden_forward = None;
        let mut hidden_backward = None;

        let n_layers = self.layers.len();
        for (n, layer) in self.layers.iter().enumerate() {
            let (output_forward, h_forward) =
                layer.forward.forward(&xs).context(RecurrenceSnafu { n })?;

            let output = match &layer.backward {
                Some(backward) => {
                    let reversed = reverse_time(&xs).context(ReverseTimeSnafu)?;
                    let (output_backward, h_backward) =
                        backward.forward(&reversed).context(RecurrenceSnafu { n })?;
                    let output_backward =
                        reverse_time(&output_backward).context(ReverseTimeSnafu)?;
                    hidden_backward = Some(h_backward);
                    Tensor::cat(&[&output_forward, &output_backward], 2)
                        .context(RecurrenceSnafu { n })?
                }
                None => output_forward,
            };
            hidden_forward = Some(h_forward);

            xs = if n + 1 < n_layers {
                self.dropout
                    .forward(&output, train)
                    .context(InterLayerDropoutSnafu)?
            } else {
                output
            };
        }

        Ok(RecurrentOutput {
            hidden_backward,
            hidden_forward: hidden_forward.context(EmptySequenceSnafu)?,
            output: xs,
        })
    }
}

/// Reverse a sequence along the time axis.
fn reverse_time(xs: &Tensor) -> Result<Tensor, candle_core::Error> {
    let seq_len = xs.dim(1)?;
    let indices = Tensor::from_vec(
        (0..seq_len as u32).rev().collect::<Vec<_>>(),
        seq_len,
        xs.device(),
    )?;
    xs.contiguous()?.index_select(&indices, 1)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use candle_core::{Device, Tensor};
    use rstest::rstest;
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::util::tests::test_var_builder;

    use super::{RecurrentStackConfig, RecurrentType};

    #[rstest]
    #[case(RecurrentType::Lstm, false)]
    #[case(RecurrentType::Lstm, true)]
    #[case(RecurrentType::Gru, false)]
    #[case(RecurrentType::Gru, true)]
    #[report]
    fn stack_output_widths_depend_on_directions(
        #[case] recurrent_type: RecurrentType,
        #[case] bidirectional: bool,
    ) -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let config = RecurrentStackConfig::default()
            .recurrent_type(recurrent_type)
            .input_width(8)
            .hidden_width(16)
            .n_layers(2)
            .bidirectional(bidirectional);
        let stack = config
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build stack".to_string()))?;

        let input = Tensor::rand(-1f32, 1f32, (3, 5, 8), &device)
            .whatever_context("Cannot create input")?;
        let output = stack
            .forward_t(&input, false)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot apply stack".to_string()))?;

        let width = config.output_width();
        assert_eq!(output.output().dims(), &[3, 5, width]);
        assert_eq!(
            output
                .final_hidden()
                .whatever_context("Cannot concat hidden state")?
                .dims(),
            &[3, width]
        );

        Ok(())
    }

    #[test]
    fn unsupported_recurrent_type_fails_to_parse() {
        assert_eq!(
            RecurrentType::from_str("LSTM").unwrap(),
            RecurrentType::Lstm
        );
        assert!(RecurrentType::from_str("rnn").is_err());
    }

    #[test]
    fn empty_sequences_are_rejected() {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let stack = RecurrentStackConfig::default()
            .input_width(8)
            .hidden_width(4)
            .build(vb)
            .unwrap();

        let input = Tensor::zeros((3, 0, 8), candle_core::DType::F32, &device).unwrap();
        assert!(stack.forward_t(&input, false).is_err());
    }
}
