use std::collections::HashMap;

use candle_core::{DType, IndexOp, Module, ModuleT, Tensor};
use candle_nn::{embedding, Dropout, Embedding, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::layer_norm::{BatchNormConfig, LayerNormConfig};

/// Errors for tabular embeddings.
#[derive(Debug, Snafu)]
pub enum TabularEmbeddingsError {
    #[snafu(display("Cannot build activation module"))]
    BuildActivation { source: BoxedError },

    #[snafu(display("Cannot build normalization module"))]
    BuildNorm { source: BoxedError },

    #[snafu(display("Cannot embed categorical column '{column}'"))]
    CategoricalColumn {
        source: candle_core::Error,
        column: String,
    },

    #[snafu(display("Cannot construct embeddings"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot embed continuous columns"))]
    ContinuousColumns { source: candle_core::Error },

    #[snafu(display("Cannot apply embedding dropout"))]
    EmbeddingDropout { source: candle_core::Error },

    #[snafu(display("Column '{column}' is missing from the column index"))]
    MissingColumn { column: String },

    #[snafu(display("At least one categorical or continuous column is required"))]
    NoColumns,

    #[snafu(display("Cannot apply shared embedding"))]
    SharedEmbedding { source: candle_core::Error },
}

/// Normalization applied to continuous columns before embedding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuousNorm {
    #[default]
    None,
    LayerNorm,
    BatchNorm,
}

/// Tabular embeddings configuration.
///
/// Embeds categorical and continuous columns of a dense input block into
/// a shared-width token sequence, one token per column.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabularEmbeddingsConfig {
    add_shared_embed: bool,
    cat_embed_dropout: f32,
    cat_embed_input: Vec<(String, usize)>,
    column_idx: HashMap<String, usize>,
    cont_embed_activation: Option<Activation>,
    cont_embed_dropout: f32,
    cont_norm: ContinuousNorm,
    continuous_cols: Vec<String>,
    embedding_width: usize,
    frac_shared_embed: f32,
    full_embed_dropout: bool,
    shared_embed: bool,
}

impl TabularEmbeddingsConfig {
    /// Add the shared embedding to the column embedding rather than
    /// replacing its first `frac_shared_embed` fraction.
    ///
    /// Default: `false`
    pub fn add_shared_embed(mut self, add_shared_embed: bool) -> Self {
        self.add_shared_embed = add_shared_embed;
        self
    }

    /// Dropout applied to the categorical embeddings.
    ///
    /// Default: `0.1`
    pub fn cat_embed_dropout(mut self, cat_embed_dropout: f32) -> Self {
        self.cat_embed_dropout = cat_embed_dropout;
        self
    }

    /// Categorical columns as `(name, cardinality)` pairs.
    ///
    /// Default: `[]`
    pub fn cat_embed_input(mut self, cat_embed_input: Vec<(String, usize)>) -> Self {
        self.cat_embed_input = cat_embed_input;
        self
    }

    /// Mapping from column names to their index in the input block.
    ///
    /// Default: `{}`
    pub fn column_idx(mut self, column_idx: HashMap<String, usize>) -> Self {
        self.column_idx = column_idx;
        self
    }

    /// Activation applied to the continuous embeddings.
    ///
    /// Default: `None`
    pub fn cont_embed_activation(mut self, cont_embed_activation: Option<Activation>) -> Self {
        self.cont_embed_activation = cont_embed_activation;
        self
    }

    /// Dropout applied to the continuous embeddings.
    ///
    /// Default: `0.0`
    pub fn cont_embed_dropout(mut self, cont_embed_dropout: f32) -> Self {
        self.cont_embed_dropout = cont_embed_dropout;
        self
    }

    /// Normalization of the raw continuous values before embedding.
    ///
    /// Default: `ContinuousNorm::None`
    pub fn cont_norm(mut self, cont_norm: ContinuousNorm) -> Self {
        self.cont_norm = cont_norm;
        self
    }

    /// Continuous column names.
    ///
    /// Default: `[]`
    pub fn continuous_cols(mut self, continuous_cols: Vec<String>) -> Self {
        self.continuous_cols = continuous_cols;
        self
    }

    /// Width of the embedding vectors.
    ///
    /// Default: `32`
    pub fn embedding_width(mut self, embedding_width: usize) -> Self {
        self.embedding_width = embedding_width;
        self
    }

    /// Fraction of the embedding replaced by the shared embedding when
    /// `shared_embed` is enabled and `add_shared_embed` is not.
    ///
    /// Default: `0.25`
    pub fn frac_shared_embed(mut self, frac_shared_embed: f32) -> Self {
        self.frac_shared_embed = frac_shared_embed;
        self
    }

    /// Drop whole column embeddings rather than individual units.
    ///
    /// When enabled, `cat_embed_dropout` is the probability of dropping
    /// an entire column representation.
    ///
    /// Default: `false`
    pub fn full_embed_dropout(mut self, full_embed_dropout: bool) -> Self {
        self.full_embed_dropout = full_embed_dropout;
        self
    }

    /// Use a shared per-column embedding so that the model can tell
    /// which column a token was embedded from.
    ///
    /// Default: `false`
    pub fn shared_embed(mut self, shared_embed: bool) -> Self {
        self.shared_embed = shared_embed;
        self
    }

    /// Index of a column in the input block.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.column_idx.get(column).copied()
    }

    /// Number of embedded columns.
    pub fn n_columns(&self) -> usize {
        self.cat_embed_input.len() + self.continuous_cols.len()
    }

    /// Build the embeddings.
    pub fn build(&self, vb: VarBuilder) -> Result<TabularEmbeddings, TabularEmbeddingsError> {
        ensure!(
            !self.cat_embed_input.is_empty() || !self.continuous_cols.is_empty(),
            NoColumnsSnafu
        );

        let categorical = if self.cat_embed_input.is_empty() {
            None
        } else {
            Some(self.build_categorical(vb.push_prefix("categorical"))?)
        };

        let continuous = if self.continuous_cols.is_empty() {
            None
        } else {
            Some(self.build_continuous(vb.push_prefix("continuous"))?)
        };

        Ok(TabularEmbeddings {
            categorical,
            continuous,
        })
    }

    fn build_categorical(
        &self,
        vb: VarBuilder,
    ) -> Result<CategoricalEmbeddings, TabularEmbeddingsError> {
        let mut columns = Vec::with_capacity(self.cat_embed_input.len());
        for (name, cardinality) in &self.cat_embed_input {
            let index = *self
                .column_idx
                .get(name)
                .context(MissingColumnSnafu { column: name.clone() })?;
            let vb = vb.push_prefix(format!("col_{name}"));
            let embeddings = embedding(*cardinality, self.embedding_width, vb.clone())
                .context(ConstructionSnafu)?;
            let shared = if self.shared_embed {
                Some(
                    vb.get_with_hints(
                        (self.embedding_width,),
                        "shared",
                        candle_nn::init::DEFAULT_KAIMING_UNIFORM,
                    )
                    .context(ConstructionSnafu)?,
                )
            } else {
                None
            };
            columns.push(CategoricalColumn {
                embeddings,
                index,
                name: name.clone(),
                shared,
            });
        }

        let dropout = if self.full_embed_dropout {
            ColumnDropout::Full {
                p: self.cat_embed_dropout,
            }
        } else {
            ColumnDropout::Unit(Dropout::new(self.cat_embed_dropout))
        };

        // Shared width counts in whole units; a zero-width share would
        // make replacement a no-op.
        let shared_width = if self.shared_embed && !self.add_shared_embed {
            ((self.embedding_width as f32 * self.frac_shared_embed) as usize).max(1)
        } else {
            0
        };

        Ok(CategoricalEmbeddings {
            add_shared: self.add_shared_embed,
            columns,
            dropout,
            shared_width,
        })
    }

    fn build_continuous(
        &self,
        vb: VarBuilder,
    ) -> Result<ContinuousEmbeddings, TabularEmbeddingsError> {
        let indices = self
            .continuous_cols
            .iter()
            .map(|name| {
                self.column_idx
                    .get(name)
                    .copied()
                    .context(MissingColumnSnafu { column: name.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let n_cont = indices.len();
        let norm: Option<Box<dyn ModuleT>> = match self.cont_norm {
            ContinuousNorm::None => None,
            ContinuousNorm::LayerNorm => Some(
                LayerNormConfig::default()
                    .size(n_cont)
                    .build(vb.push_prefix("norm"))
                    .context(BuildNormSnafu)?,
            ),
            ContinuousNorm::BatchNorm => Some(
                BatchNormConfig::default()
                    .size(n_cont)
                    .build(vb.push_prefix("norm"))
                    .context(BuildNormSnafu)?,
            ),
        };

        Ok(ContinuousEmbeddings {
            activation: self
                .cont_embed_activation
                .map(|activation| activation.build(vb.clone()).context(BuildActivationSnafu))
                .transpose()?,
            bias: vb
                .get_with_hints(
                    (n_cont, self.embedding_width),
                    "bias",
                    candle_nn::init::ZERO,
                )
                .context(ConstructionSnafu)?,
            dropout: Dropout::new(self.cont_embed_dropout),
            indices,
            norm,
            weight: vb
                .get_with_hints(
                    (n_cont, self.embedding_width),
                    "weight",
                    candle_nn::init::DEFAULT_KAIMING_UNIFORM,
                )
                .context(ConstructionSnafu)?,
        })
    }
}

impl Default for TabularEmbeddingsConfig {
    fn default() -> Self {
        Self {
            add_shared_embed: false,
            cat_embed_dropout: 0.1,
            cat_embed_input: Vec::new(),
            column_idx: HashMap::new(),
            cont_embed_activation: None,
            cont_embed_dropout: 0.0,
            cont_norm: ContinuousNorm::None,
            continuous_cols: Vec::new(),
            embedding_width: 32,
            frac_shared_embed: 0.25,
            full_embed_dropout: false,
            shared_embed: false,
        }
    }
}

/// Dropout over categorical token sequences.
///
/// `Full` drops entire column representations instead of individual
/// units.
enum ColumnDropout {
    Full { p: f32 },
    Unit(Dropout),
}

impl ColumnDropout {
    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        match self {
            ColumnDropout::Unit(dropout) => dropout.forward(xs, train),
            ColumnDropout::Full { p } => {
                if !train || *p == 0.0 {
                    return Ok(xs.clone());
                }
                let (batch_size, n_tokens, _) = xs.dims3()?;
                let threshold = Tensor::full(*p, (batch_size, n_tokens, 1), xs.device())?;
                let mask = Tensor::rand(0f32, 1f32, (batch_size, n_tokens, 1), xs.device())?
                    .ge(&threshold)?
                    .to_dtype(xs.dtype())?
                    .affine(1.0 / (1.0 - *p as f64), 0.0)?;
                xs.broadcast_mul(&mask)
            }
        }
    }
}

struct CategoricalColumn {
    embeddings: Embedding,
    index: usize,
    name: String,
    shared: Option<Tensor>,
}

struct CategoricalEmbeddings {
    add_shared: bool,
    columns: Vec<CategoricalColumn>,
    dropout: ColumnDropout,
    shared_width: usize,
}

impl CategoricalEmbeddings {
    /// Embed the categorical columns of the input.
    ///
    /// Returns one token per categorical column.
    /// *Shape:* `(batch_size, n_categorical, width)`
    fn forward(&self, input: &Tensor, train: bool) -> Result<Tensor, TabularEmbeddingsError> {
        let mut tokens = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let ids = input
                .i((.., column.index))
                .and_then(|ids| ids.to_dtype(DType::U32))
                .context(CategoricalColumnSnafu {
                    column: column.name.clone(),
                })?;
            let mut token = column
                .embeddings
                .forward(&ids)
                .context(CategoricalColumnSnafu {
                    column: column.name.clone(),
                })?;

            if let Some(shared) = &column.shared {
                token = if self.add_shared {
                    token
                        .broadcast_add(shared)
                        .context(SharedEmbeddingSnafu)?
                } else {
                    let (batch_size, width) = token.dims2().context(SharedEmbeddingSnafu)?;
                    let head = shared
                        .narrow(0, 0, self.shared_width)
                        .and_then(|head| {
                            head.unsqueeze(0)?
                                .broadcast_as((batch_size, self.shared_width))
                        })
                        .context(SharedEmbeddingSnafu)?;
                    let tail = token
                        .narrow(1, self.shared_width, width - self.shared_width)
                        .context(SharedEmbeddingSnafu)?;
                    Tensor::cat(&[&head, &tail], 1).context(SharedEmbeddingSnafu)?
                };
            }

            tokens.push(token);
        }

        let tokens = Tensor::stack(&tokens, 1).context(EmbeddingDropoutSnafu)?;
        self.dropout
            .forward(&tokens, train)
            .context(EmbeddingDropoutSnafu)
    }
}

struct ContinuousEmbeddings {
    activation: Option<Box<dyn ModuleT>>,
    bias: Tensor,
    dropout: Dropout,
    indices: Vec<usize>,
    norm: Option<Box<dyn ModuleT>>,
    weight: Tensor,
}

impl ContinuousEmbeddings {
    /// Embed the continuous columns of the input.
    ///
    /// Each continuous value is projected to a token through a learned
    /// per-column scale and bias.
    /// *Shape:* `(batch_size, n_continuous, width)`
    fn forward(&self, input: &Tensor, train: bool) -> Result<Tensor, TabularEmbeddingsError> {
        let indices = Tensor::from_vec(
            self.indices.iter().map(|&i| i as u32).collect::<Vec<_>>(),
            self.indices.len(),
            input.device(),
        )
        .context(ContinuousColumnsSnafu)?;

        let mut values = input
            .contiguous()
            .and_then(|input| input.index_select(&indices, 1))
            .context(ContinuousColumnsSnafu)?;

        if let Some(norm) = &self.norm {
            values = norm
                .forward_t(&values, train)
                .context(ContinuousColumnsSnafu)?;
        }

        let mut tokens = values
            .unsqueeze(2)
            .and_then(|values| values.broadcast_mul(&self.weight.unsqueeze(0)?))
            .and_then(|tokens| tokens.broadcast_add(&self.bias.unsqueeze(0)?))
            .context(ContinuousColumnsSnafu)?;

        if let Some(activation) = &self.activation {
            tokens = activation
                .forward_t(&tokens, train)
                .context(ContinuousColumnsSnafu)?;
        }

        self.dropout
            .forward(&tokens, train)
            .context(ContinuousColumnsSnafu)
    }
}

/// Token sequences produced by [`TabularEmbeddings`].
///
/// The embeddings are only constructible with at least one categorical
/// or continuous column, so "neither present" is not representable.
pub enum TabularTokens {
    Categorical(Tensor),
    Continuous(Tensor),
    Both {
        categorical: Tensor,
        continuous: Tensor,
    },
}

impl TabularTokens {
    /// Concatenate the token sequences along the feature axis.
    ///
    /// Categorical tokens precede continuous tokens.
    /// *Shape:* `(batch_size, n_categorical + n_continuous, width)`
    pub fn concat(&self) -> Result<Tensor, candle_core::Error> {
        match self {
            TabularTokens::Categorical(tokens) => Ok(tokens.clone()),
            TabularTokens::Continuous(tokens) => Ok(tokens.clone()),
            TabularTokens::Both {
                categorical,
                continuous,
            } => Tensor::cat(&[categorical, continuous], 1),
        }
    }
}

/// Same-width categorical and continuous embeddings.
///
/// Embeds the categorical and continuous columns of a dense input block
/// into token sequences of a shared embedding width.
pub struct TabularEmbeddings {
    categorical: Option<CategoricalEmbeddings>,
    continuous: Option<ContinuousEmbeddings>,
}

impl TabularEmbeddings {
    /// Embed an input block.
    ///
    /// * `input` - Dense input, one row per sample. Categorical columns
    ///   hold indices stored as floats, continuous columns hold values.
    ///   *Shape:* `(batch_size, n_columns)`
    /// * `train` - Whether the layer is trained.
    pub fn forward(
        &self,
        input: &Tensor,
        train: bool,
    ) -> Result<TabularTokens, TabularEmbeddingsError> {
        match (&self.categorical, &self.continuous) {
            (Some(categorical), None) => Ok(TabularTokens::Categorical(
                categorical.forward(input, train)?,
            )),
            (None, Some(continuous)) => Ok(TabularTokens::Continuous(
                continuous.forward(input, train)?,
            )),
            (Some(categorical), Some(continuous)) => Ok(TabularTokens::Both {
                categorical: categorical.forward(input, train)?,
                continuous: continuous.forward(input, train)?,
            }),
            (None, None) => NoColumnsSnafu.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{Device, IndexOp, Tensor};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::util::tests::test_var_builder;

    use super::{TabularEmbeddingsConfig, TabularTokens};

    fn sample_config() -> TabularEmbeddingsConfig {
        let column_idx: HashMap<String, usize> = ["a", "b", "c"]
            .into_iter()
            .enumerate()
            .map(|(index, name)| (name.to_string(), index))
            .collect();

        TabularEmbeddingsConfig::default()
            .column_idx(column_idx)
            .cat_embed_input(vec![("a".to_string(), 4), ("b".to_string(), 7)])
            .continuous_cols(vec!["c".to_string()])
            .embedding_width(16)
    }

    #[test]
    #[report]
    fn tokens_have_one_slot_per_column() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let embeddings = sample_config()
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build embeddings".to_string()))?;

        let input = Tensor::from_slice(
            &[0f32, 1., 0.5, 3., 6., -0.3, 1., 0., 2.1],
            (3, 3),
            &device,
        )
        .whatever_context("Cannot create input")?;

        let tokens = embeddings
            .forward(&input, false)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot embed input".to_string()))?;

        match &tokens {
            TabularTokens::Both {
                categorical,
                continuous,
            } => {
                assert_eq!(categorical.dims(), &[3, 2, 16]);
                assert_eq!(continuous.dims(), &[3, 1, 16]);
            }
            _ => panic!("Expected both categorical and continuous tokens"),
        }

        let all = tokens.concat().whatever_context("Cannot concat tokens")?;
        assert_eq!(all.dims(), &[3, 3, 16]);

        Ok(())
    }

    #[test]
    #[report]
    fn shared_embeddings_are_applied() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let embeddings = sample_config()
            .shared_embed(true)
            .frac_shared_embed(0.25)
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build embeddings".to_string()))?;

        let input = Tensor::from_slice(&[0f32, 1., 0.5, 3., 6., -0.3], (2, 3), &device)
            .whatever_context("Cannot create input")?;
        let tokens = embeddings
            .forward(&input, false)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot embed input".to_string()))?;

        // The first quarter of each categorical token comes from the
        // per-column shared embedding, so it is equal across the batch.
        if let TabularTokens::Both { categorical, .. } = tokens {
            let first = categorical
                .i((0, 0, ..4))
                .and_then(|xs| xs.to_vec1::<f32>())
                .whatever_context("Cannot read token")?;
            let second = categorical
                .i((1, 0, ..4))
                .and_then(|xs| xs.to_vec1::<f32>())
                .whatever_context("Cannot read token")?;
            assert_eq!(first, second);
        } else {
            panic!("Expected both categorical and continuous tokens");
        }

        Ok(())
    }

    #[test]
    fn missing_columns_are_rejected() {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        assert!(TabularEmbeddingsConfig::default().build(vb).is_err());
    }
}
