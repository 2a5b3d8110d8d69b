//! SAINT: row and column attention over tabular data.

mod encoder;
pub use encoder::{SaintAttention, SaintEncoder, SaintEncoderConfig, SaintEncoderError};

mod model;
pub use model::{Saint, SaintConfig, SaintError, CLS_TOKEN};
