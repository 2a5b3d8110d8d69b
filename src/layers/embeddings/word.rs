use candle_core::{DType, Module, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};
use tracing::warn;

/// Errors for word embeddings.
#[derive(Debug, Snafu)]
pub enum WordEmbeddingsError {
    #[snafu(display("Cannot construct embeddings"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot look up embeddings"))]
    Lookup { source: candle_core::Error },

    #[snafu(display("Embedding width or a pretrained embedding matrix is required"))]
    MissingWidth,

    #[snafu(display("Padding index ({padding_idx}) is out of range for vocabulary size {n_pieces}"))]
    PaddingIdxOutOfRange { n_pieces: usize, padding_idx: usize },

    #[snafu(display("Pretrained embedding matrix must be F32, got {dtype:?}"))]
    PretrainedDType { dtype: DType },

    #[snafu(display(
        "Pretrained embedding matrix must have {n_pieces} rows (the vocabulary size), got {n_rows}"
    ))]
    PretrainedRows { n_pieces: usize, n_rows: usize },

    #[snafu(display("Pretrained embedding matrix must be two-dimensional"))]
    PretrainedShape { source: candle_core::Error },
}

/// Word embeddings configuration.
#[derive(Clone, Debug, Default)]
pub struct WordEmbeddingsConfig {
    embedding_width: Option<usize>,
    n_pieces: usize,
    padding_idx: Option<usize>,
    pretrained: Option<Tensor>,
}

impl WordEmbeddingsConfig {
    /// Width of the embedding vectors.
    ///
    /// Ignored (with a warning) when it disagrees with the width of a
    /// provided pretrained matrix.
    ///
    /// Default: `None`
    pub fn embedding_width(mut self, embedding_width: Option<usize>) -> Self {
        self.embedding_width = embedding_width;
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
    /// Only validated against the vocabulary size; the padding
    /// embedding is a learned vector like any other.
    ///
    /// Default: `None`
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

    /// Build the embeddings.
    pub fn build(&self, vb: VarBuilder) -> Result<WordEmbeddings, WordEmbeddingsError> {
        if let Some(padding_idx) = self.padding_idx {
            ensure!(
                padding_idx < self.n_pieces,
                PaddingIdxOutOfRangeSnafu {
                    n_pieces: self.n_pieces,
                    padding_idx
                }
            );
        }

        let (inner, width) = match &self.pretrained {
            Some(matrix) => {
                ensure!(
                    matrix.dtype() == DType::F32,
                    PretrainedDTypeSnafu {
                        dtype: matrix.dtype()
                    }
                );
                let (n_rows, width) = matrix.dims2().context(PretrainedShapeSnafu)?;
                ensure!(
                    n_rows == self.n_pieces,
                    PretrainedRowsSnafu {
                        n_pieces: self.n_pieces,
                        n_rows
                    }
                );
                if let Some(requested) = self.embedding_width {
                    if requested != width {
                        warn!(
                            requested,
                            pretrained = width,
                            "Embedding width does not match the pretrained matrix, \
                             using the pretrained width"
                        );
                    }
                }
                (Embedding::new(matrix.clone(), width), width)
            }
            None => {
                let width = self.embedding_width.ok_or(WordEmbeddingsError::MissingWidth)?;
                (
                    embedding(self.n_pieces, width, vb).context(ConstructionSnafu)?,
                    width,
                )
            }
        };

        Ok(WordEmbeddings { inner, width })
    }
}

/// Word embeddings.
///
/// Thin wrapper around an embedding table that knows its own width and
/// accepts piece identifiers stored in any integer or float dtype.
pub struct WordEmbeddings {
    inner: Embedding,
    width: usize,
}

impl WordEmbeddings {
    /// Look up embeddings for a batch of piece identifiers.
    ///
    /// * `input` - Piece identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    ///
    /// Returns: Embedded pieces.
    /// *Shape:* `(batch_size, seq_len, width)`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, WordEmbeddingsError> {
        input
            .to_dtype(DType::U32)
            .and_then(|ids| self.inner.forward(&ids))
            .context(LookupSnafu)
    }

    /// Width of the embedding vectors.
    pub fn width(&self) -> usize {
        self.width
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use snafu::{report, FromString, ResultExt, Whatever};

    use crate::util::tests::test_var_builder;

    use super::WordEmbeddingsConfig;

    #[test]
    #[report]
    fn pretrained_width_wins_over_requested_width() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let matrix = Tensor::rand(-1f32, 1f32, (10, 12), &device)
            .whatever_context("Cannot create matrix")?;

        let embeddings = WordEmbeddingsConfig::default()
            .n_pieces(10)
            .embedding_width(Some(8))
            .pretrained(Some(matrix))
            .build(vb)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot build embeddings".to_string()))?;
        assert_eq!(embeddings.width(), 12);

        let ids = Tensor::from_slice(&[0u32, 3, 9, 1, 2, 8], (2, 3), &device)
            .whatever_context("Cannot create ids")?;
        let embedded = embeddings
            .forward(&ids)
            .map_err(|e| Whatever::with_source(Box::new(e), "Cannot embed ids".to_string()))?;
        assert_eq!(embedded.dims(), &[2, 3, 12]);

        Ok(())
    }

    #[test]
    fn pretrained_matrix_must_be_f32() {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let matrix = Tensor::zeros((10, 12), DType::F64, &device).unwrap();

        assert!(WordEmbeddingsConfig::default()
            .n_pieces(10)
            .pretrained(Some(matrix))
            .build(vb)
            .is_err());
    }

    #[test]
    fn vocabulary_size_mismatch_is_rejected() {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        let matrix = Tensor::zeros((11, 12), DType::F32, &device).unwrap();

        assert!(WordEmbeddingsConfig::default()
            .n_pieces(10)
            .pretrained(Some(matrix))
            .build(vb)
            .is_err());
    }

    #[test]
    fn missing_width_and_matrix_is_rejected() {
        let device = Device::Cpu;
        let (_varmap, vb) = test_var_builder(&device);
        assert!(WordEmbeddingsConfig::default().n_pieces(10).build(vb).is_err());
    }
}
